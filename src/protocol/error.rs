use thiserror::Error;

/// Errors produced by the wire codec and session layer.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Network I/O failure on the session.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// The remote side closed the connection.
    #[error("connection closed")]
    ConnectionClosed,

    /// An empty line arrived where a message was expected.
    #[error("empty message line")]
    EmptyLine,

    /// The first byte of a line is not one of the eight message types.
    #[error("unknown message type {0:?}")]
    UnknownType(char),

    /// The line is too short or the command is not three uppercase letters.
    #[error("malformed message: {0:?}")]
    Malformed(String),

    /// Base32 text did not decode.
    #[error("invalid base32: {0:?}")]
    InvalidBase32(String),
}
