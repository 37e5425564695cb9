use std::fmt;

use data_encoding::BASE32_NOPAD;
use tiger::{Digest, Tiger};

use super::error::ProtocolError;

/// A protocol identifier: raw bytes paired with their base32 (no padding)
/// text form.
///
/// Three roles share this shape: the Private ID (a secret held by the
/// client), the Client ID (Tiger hash of the PID, computable once the hub
/// has negotiated TIGR), and the hub-assigned four-character Session ID.
/// Identifiers are immutable once created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identifier {
    raw: Vec<u8>,
    text: String,
}

impl Identifier {
    /// Builds a private identifier from seed bytes.
    pub fn private(seed: &[u8]) -> Self {
        Self {
            raw: seed.to_vec(),
            text: base32_encode(seed),
        }
    }

    /// Derives the client identifier: Tiger over the private identifier.
    pub fn client_of(pid: &Identifier) -> Self {
        let raw = Tiger::digest(&pid.raw).to_vec();
        let text = base32_encode(&raw);
        Self { raw, text }
    }

    /// Wraps a hub-assigned session identifier.
    ///
    /// Session IDs are four base32 characters that rarely align to a whole
    /// number of bytes, so the raw form is best-effort and the text form
    /// is canonical.
    pub fn session(text: &str) -> Self {
        let raw = base32_decode_loose(text).unwrap_or_default();
        Self {
            raw,
            text: text.to_string(),
        }
    }

    pub fn raw(&self) -> &[u8] {
        &self.raw
    }

    pub fn text(&self) -> &str {
        &self.text
    }
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}

/// Encodes bytes as base32 with trailing `=` padding stripped.
pub fn base32_encode(b: &[u8]) -> String {
    BASE32_NOPAD.encode(b)
}

/// Decodes base32 text with or without trailing `=` padding.
pub fn base32_decode_loose(s: &str) -> Result<Vec<u8>, ProtocolError> {
    let trimmed = s.trim_end_matches('=');
    BASE32_NOPAD
        .decode(trimmed.as_bytes())
        .map_err(|_| ProtocolError::InvalidBase32(s.to_string()))
}
