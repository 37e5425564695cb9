use thiserror::Error;

/// Errors surfaced while parsing addresses or dialing hubs.
///
/// These are setup-time errors; nothing here escapes from a running
/// message pump.
#[derive(Debug, Error)]
pub enum NetError {
    /// Network I/O failure while dialing.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Not an adc:// or adcs:// URL.
    #[error("unsupported url scheme: {0:?}")]
    UnknownScheme(String),

    /// The URL does not parse.
    #[error("invalid url: {0}")]
    InvalidUrl(String),

    /// The magnet link does not parse.
    #[error("invalid magnet link: {0}")]
    InvalidMagnet(String),

    /// The server certificate hash does not match the pinned keyprint.
    #[error("server certificate does not match the keyprint")]
    Keyprint,
}
