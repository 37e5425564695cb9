//! Multi-peer chunked download orchestration.
//!
//! A download consumes search results, validates each answering peer by
//! fetching and verifying its tree hash leaves, and recruits validated
//! peers as workers. Workers pull variable-size chunks from one shared
//! cursor and write decoded bytes into a positional output sink; request
//! sizes adapt to each peer's observed speed.

mod coordinator;
mod error;
mod sink;
mod worker;

pub use coordinator::{Download, DownloadConfig, FileChunk};
pub use error::DownloadError;
pub use sink::FileSink;
