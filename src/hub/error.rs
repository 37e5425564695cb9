use thiserror::Error;

use crate::protocol::{deescape, Message, ProtocolError};
use crate::treehash::VerificationError;

/// Errors from the hub session and peer channels.
#[derive(Debug, Error)]
pub enum HubError {
    /// Network I/O failure.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Wire-level failure on a session.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// A non-zero STA from the other side.
    #[error("status {code}: {message}")]
    Status { code: u16, message: String },

    /// The hub sent QUI for our own session.
    #[error("kicked from hub: {reason}")]
    Kicked { reason: String },

    /// The hub did not advertise a required feature.
    #[error("hub does not support {0}")]
    MissingFeature(String),

    /// No hash function shared with the hub.
    #[error("no common hash function")]
    NoCommonHash,

    /// The client INF field map has no NI entry.
    #[error("client info is missing the NI field")]
    MissingNick,

    /// The hub asked for a password but none was configured.
    #[error("hub requested a password but none was set")]
    NoPassword,

    /// The hub answered our password with a failure status.
    #[error("hub rejected the password")]
    PasswordRejected,

    /// A peer reported a different CID than the hub advertised for it.
    #[error("peer client id does not match the hub's record")]
    CidMismatch,

    /// The peer's INF carries neither I4 nor I6.
    #[error("peer has no address information")]
    NoAddress,

    /// A peer channel operation ran without an established connection.
    #[error("peer is not connected")]
    NotConnected,

    /// Tree hash leaves failed verification.
    #[error(transparent)]
    Verification(#[from] VerificationError),

    /// The client is shutting down.
    #[error("client closed")]
    Closed,

    /// A message that violates the protocol in the current phase.
    #[error("unexpected message: {0}")]
    Unexpected(String),
}

impl HubError {
    /// Builds a [`HubError::Status`] from an inbound STA message.
    pub(crate) fn status(msg: &Message) -> Self {
        let code = msg
            .params
            .first()
            .and_then(|c| c.parse().ok())
            .unwrap_or(0);
        let message = msg
            .params
            .get(1)
            .map(|m| deescape(m))
            .unwrap_or_default();
        Self::Status { code, message }
    }
}
