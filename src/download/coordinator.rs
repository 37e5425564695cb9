use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};
use tokio::time::{timeout_at, Instant};
use tracing::{info, warn};

use super::error::DownloadError;
use super::sink::FileSink;
use super::worker;
use crate::hub::HubClient;
use crate::search::SearchResult;
use crate::treehash::{Leaf, TreeHash};

/// Configuration for one file download.
pub struct DownloadConfig {
    /// Path the decoded bytes land at.
    pub output: PathBuf,
    /// Expected tree hash root. Peers are validated against it; without
    /// one, the first search result defines the file.
    pub hash: Option<TreeHash>,
    /// Request ZL1 transfer compression from peers that support it.
    pub compress: bool,
    /// Fetch and verify leaves before recruiting a peer. Only
    /// meaningful with a hash; on by default.
    pub verify: bool,
}

/// One region of the output, handed to exactly one worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileChunk {
    pub start: u64,
    pub size: u64,
}

struct Cursor {
    seek: u64,
    size: u64,
    finished: bool,
}

/// Coordinator for one file download.
///
/// Owns the shared chunk cursor and the output sink. The cursor lock is
/// held from construction until the sink is open, so workers cannot
/// dequeue chunks before the destination size is known.
pub struct Download {
    config: DownloadConfig,
    cursor: Mutex<Cursor>,
    sink: OnceLock<Arc<FileSink>>,
    leaves: OnceLock<Vec<Leaf>>,
    done_tx: mpsc::Sender<Result<u64, DownloadError>>,
    done_rx: Mutex<mpsc::Receiver<Result<u64, DownloadError>>>,
    bytes_written: AtomicU64,
    total: AtomicU64,
}

impl Download {
    pub fn new(config: DownloadConfig) -> Arc<Self> {
        let (done_tx, done_rx) = mpsc::channel(2);
        Arc::new(Self {
            config,
            cursor: Mutex::new(Cursor {
                seek: 0,
                size: 0,
                finished: false,
            }),
            sink: OnceLock::new(),
            leaves: OnceLock::new(),
            done_tx,
            done_rx: Mutex::new(done_rx),
            bytes_written: AtomicU64::new(0),
            total: AtomicU64::new(0),
        })
    }

    /// Drives the download: waits for the first usable search result
    /// (bounded by `deadline`), opens the sink, recruits every further
    /// result in the background, and returns the finalized byte count.
    ///
    /// Once transfer begins there is no overall timeout; completion is
    /// the cursor reaching the destination size.
    pub async fn run(
        self: Arc<Self>,
        client: Arc<HubClient>,
        mut results: mpsc::Receiver<SearchResult>,
        deadline: Duration,
    ) -> Result<u64, DownloadError> {
        let mut cursor = self.cursor.lock().await;
        let deadline = Instant::now() + deadline;

        // First usable result defines the destination size.
        let first = loop {
            let result = timeout_at(deadline, results.recv())
                .await
                .map_err(|_| DownloadError::Timeout)?
                .ok_or(DownloadError::Closed)?;
            match self.validate(&client, &result).await {
                Ok(()) => break result,
                Err(e) => {
                    warn!(peer = %result.peer.sid(), "rejecting first-result peer: {e}");
                }
            }
        };

        cursor.size = first.size;
        self.total.store(first.size, Ordering::SeqCst);
        info!(file = %first.filename, size = first.size, "download starting");
        spawn_worker(self.clone(), client.clone(), first);

        let sink = Arc::new(FileSink::create(&self.config.output, cursor.size).await?);
        self.sink.set(sink).ok();
        drop(cursor); // workers may dequeue from here on

        // Recruit every further result as it arrives.
        let download = self.clone();
        let recruit_client = client.clone();
        tokio::spawn(async move {
            while let Some(result) = results.recv().await {
                recruit(&download, &recruit_client, result).await;
            }
        });

        let mut done = self.done_rx.lock().await;
        match done.recv().await {
            Some(Ok(total)) => {
                if let Some(sink) = self.sink.get() {
                    sink.sync().await?;
                }
                Ok(total)
            }
            Some(Err(e)) => Err(e),
            None => Err(DownloadError::Closed),
        }
    }

    /// Takes the next chunk off the cursor, at most `requested` bytes.
    ///
    /// Returns `None` once the cursor has covered the whole file; the
    /// first caller to see that posts the total to the finalization
    /// channel.
    pub async fn get_chunk(&self, requested: u64) -> Option<FileChunk> {
        let mut cursor = self.cursor.lock().await;
        if cursor.seek == cursor.size {
            if !cursor.finished {
                cursor.finished = true;
                let _ = self.done_tx.try_send(Ok(cursor.size));
            }
            return None;
        }
        let size = requested.min(cursor.size - cursor.seek);
        let chunk = FileChunk {
            start: cursor.seek,
            size,
        };
        cursor.seek += size;
        Some(chunk)
    }

    /// Bytes written so far and the destination size (0 until known).
    pub fn progress(&self) -> (u64, u64) {
        (
            self.bytes_written.load(Ordering::Relaxed),
            self.total.load(Ordering::Relaxed),
        )
    }

    /// The leaves that validated the recruited peers, when a hash was
    /// configured.
    pub fn leaves(&self) -> Option<&[Leaf]> {
        self.leaves.get().map(Vec::as_slice)
    }

    pub(super) fn compress(&self) -> bool {
        self.config.compress
    }

    pub(super) async fn write_at(&self, offset: u64, data: &[u8]) -> Result<(), DownloadError> {
        let sink = self.sink.get().ok_or(DownloadError::Closed)?;
        sink.write_at(offset, data).await?;
        self.bytes_written
            .fetch_add(data.len() as u64, Ordering::Relaxed);
        Ok(())
    }

    /// Validates a peer by fetching its leaf row for the configured
    /// hash. One complete gate cycle, strictly before any worker of that
    /// peer runs.
    async fn validate(
        &self,
        client: &Arc<HubClient>,
        result: &SearchResult,
    ) -> Result<(), DownloadError> {
        let Some(hash) = self.config.hash.as_ref().filter(|_| self.config.verify) else {
            return Ok(());
        };

        let gate = result.peer.gate();
        let ticket = gate.next_id();
        gate.enter(ticket).await;
        let outcome = async {
            client.ensure_peer_session(&result.peer).await?;
            result.peer.fetch_leaves(hash).await
        }
        .await;
        gate.leave(ticket);

        let leaves = outcome?;
        self.leaves.set(leaves).ok();
        Ok(())
    }

    #[cfg(test)]
    pub(crate) async fn set_size_for_tests(&self, size: u64) {
        let mut cursor = self.cursor.lock().await;
        cursor.size = size;
        self.total.store(size, Ordering::SeqCst);
    }

    #[cfg(test)]
    pub(crate) async fn try_recv_done(&self) -> Option<Result<u64, DownloadError>> {
        self.done_rx.lock().await.try_recv().ok()
    }
}

/// Handles one background search result: validate, check the size
/// against the established destination, spawn a worker.
async fn recruit(download: &Arc<Download>, client: &Arc<HubClient>, result: SearchResult) {
    let dest_size = download.total.load(Ordering::SeqCst);

    if download.config.hash.is_some() && download.config.verify {
        if let Err(e) = download.validate(client, &result).await {
            warn!(peer = %result.peer.sid(), "peer failed validation: {e}");
            return;
        }
        if result.size != dest_size {
            // Valid leaves for the same root but a different size:
            // someone is lying and we cannot tell who.
            let _ = download
                .done_tx
                .try_send(Err(DownloadError::SizeMismatch(dest_size, result.size)));
            return;
        }
    } else if result.size != dest_size {
        warn!(
            peer = %result.peer.sid(),
            theirs = result.size,
            ours = dest_size,
            "skipping peer with divergent size"
        );
        return;
    }

    spawn_worker(download.clone(), client.clone(), result);
}

fn spawn_worker(download: Arc<Download>, client: Arc<HubClient>, result: SearchResult) {
    tokio::spawn(worker::run(download, client, result));
}
