use std::collections::BTreeMap;

use super::error::ProtocolError;

/// The eight ADC message types, by first byte of the line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    /// `B` - broadcast to all hub clients.
    Broadcast,
    /// `C` - client-to-client, on a direct connection.
    Client,
    /// `D` - direct message routed through the hub.
    Direct,
    /// `E` - direct message echoed back to the sender.
    Echo,
    /// `F` - broadcast filtered by feature support.
    FeatureBroadcast,
    /// `H` - client-to-hub only.
    Hub,
    /// `I` - hub-to-client information.
    Info,
    /// `U` - UDP datagram.
    Udp,
}

impl MessageType {
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            b'B' => Some(Self::Broadcast),
            b'C' => Some(Self::Client),
            b'D' => Some(Self::Direct),
            b'E' => Some(Self::Echo),
            b'F' => Some(Self::FeatureBroadcast),
            b'H' => Some(Self::Hub),
            b'I' => Some(Self::Info),
            b'U' => Some(Self::Udp),
            _ => None,
        }
    }

    pub fn as_byte(self) -> u8 {
        match self {
            Self::Broadcast => b'B',
            Self::Client => b'C',
            Self::Direct => b'D',
            Self::Echo => b'E',
            Self::FeatureBroadcast => b'F',
            Self::Hub => b'H',
            Self::Info => b'I',
            Self::Udp => b'U',
        }
    }
}

/// A parsed inbound protocol message.
///
/// Parameters are split on single spaces with the final newline stripped.
/// They keep their wire escaping; callers de-escape free-text values with
/// [`deescape`] when rendering for humans.
#[derive(Debug, Clone)]
pub struct Message {
    pub kind: MessageType,
    pub command: String,
    pub params: Vec<String>,
    /// The original line, kept for diagnostic echoing.
    pub raw: String,
}

impl Message {
    /// Parses one line (without its terminating newline).
    pub fn parse(line: &str) -> Result<Self, ProtocolError> {
        if line.is_empty() {
            return Err(ProtocolError::EmptyLine);
        }
        let bytes = line.as_bytes();
        let kind = MessageType::from_byte(bytes[0])
            .ok_or(ProtocolError::UnknownType(bytes[0] as char))?;
        if bytes.len() < 4 || !bytes[1..4].iter().all(u8::is_ascii_uppercase) {
            return Err(ProtocolError::Malformed(line.to_string()));
        }
        let params = if bytes.len() > 4 {
            if bytes[4] != b' ' {
                return Err(ProtocolError::Malformed(line.to_string()));
            }
            line[5..].split(' ').map(str::to_string).collect()
        } else {
            Vec::new()
        };
        Ok(Self {
            kind,
            command: line[1..4].to_string(),
            params,
            raw: line.to_string(),
        })
    }

    /// Returns the value of the first parameter carrying the given
    /// two-letter field tag.
    pub fn field(&self, tag: &str) -> Option<&str> {
        self.params.iter().find_map(|p| p.strip_prefix(tag))
    }

    /// Collects tagged parameters into a field map, skipping the first
    /// `skip` positional parameters (SIDs and the like).
    pub fn fields_from(&self, skip: usize) -> FieldMap {
        let mut map = FieldMap::new();
        for p in self.params.iter().skip(skip) {
            if p.len() >= 2 && p.is_char_boundary(2) {
                map.insert(p[..2].to_string(), p[2..].to_string());
            }
        }
        map
    }
}

/// A map of two-letter field tags to values.
///
/// Input order is not significant; iteration (and therefore rendered
/// output) is in sorted tag order, so formatted messages are
/// deterministic.
pub type FieldMap = BTreeMap<String, String>;

/// Renders a field map as wire parameters, escaping each value.
pub fn format_fields(fields: &FieldMap) -> String {
    let mut out = String::new();
    for (tag, value) in fields {
        if !out.is_empty() {
            out.push(' ');
        }
        out.push_str(tag);
        out.push_str(&escape(value));
    }
    out
}

/// Escapes free text for the wire: space, newline and backslash become
/// `\s`, `\n` and `\\`.
pub fn escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            ' ' => out.push_str("\\s"),
            '\n' => out.push_str("\\n"),
            _ => out.push(c),
        }
    }
    out
}

/// Reverses [`escape`]. Unknown escape pairs pass through unchanged.
pub fn deescape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('s') => out.push(' '),
            Some('n') => out.push('\n'),
            Some('\\') => out.push('\\'),
            Some(other) => {
                out.push('\\');
                out.push(other);
            }
            None => out.push('\\'),
        }
    }
    out
}
