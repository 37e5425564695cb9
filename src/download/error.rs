use thiserror::Error;

use crate::hub::HubError;

/// Errors that abort a whole download.
///
/// Per-peer failures are not represented here; they end that peer's
/// worker and the download continues on the rest.
#[derive(Debug, Error)]
pub enum DownloadError {
    /// Output sink I/O failure.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Hub-side failure surfaced while orchestrating.
    #[error(transparent)]
    Hub(#[from] HubError),

    /// The deadline expired before a usable first result.
    #[error("deadline expired before a usable search result")]
    Timeout,

    /// Two peers presented valid leaves for the root but disagree on
    /// the file size.
    #[error("peers disagree on the file size ({0} vs {1})")]
    SizeMismatch(u64, u64),

    /// The result or completion channel closed underneath us.
    #[error("download channel closed")]
    Closed,
}
