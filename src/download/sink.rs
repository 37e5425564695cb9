use std::io::SeekFrom;
use std::path::Path;

use tokio::fs::File;
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex;

/// Positional output file for download workers.
///
/// Writes land at absolute offsets and are serialized internally, so no
/// worker ever holds the sink exclusively.
pub struct FileSink {
    file: Mutex<File>,
}

impl FileSink {
    /// Creates (or truncates) the output file and sizes it up front.
    pub async fn create(path: &Path, len: u64) -> std::io::Result<Self> {
        let file = File::create(path).await?;
        file.set_len(len).await?;
        Ok(Self {
            file: Mutex::new(file),
        })
    }

    /// Writes `data` at the absolute `offset`.
    pub async fn write_at(&self, offset: u64, data: &[u8]) -> std::io::Result<()> {
        let mut file = self.file.lock().await;
        file.seek(SeekFrom::Start(offset)).await?;
        file.write_all(data).await?;
        Ok(())
    }

    /// Flushes buffered data through to the file.
    pub async fn sync(&self) -> std::io::Result<()> {
        let file = self.file.lock().await;
        file.sync_all().await
    }
}
