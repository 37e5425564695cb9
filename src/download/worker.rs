use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, warn};

use super::coordinator::Download;
use crate::constants::{
    INITIAL_REQUEST_SIZE, MAX_REQUEST_SIZE, MIN_REQUEST_SIZE, REQUEST_GROW_THRESHOLD,
    REQUEST_SHRINK_THRESHOLD,
};
use crate::hub::{HubClient, HubError};
use crate::search::SearchResult;

/// Per-peer transfer loop.
///
/// Pulls chunks off the shared cursor and fetches each under a fresh
/// session gate ticket. Any failure ends this worker only; its current
/// chunk's range is abandoned and logged, and the cursor moves on.
pub(super) async fn run(download: Arc<Download>, client: Arc<HubClient>, result: SearchResult) {
    let peer = result.peer.clone();
    let filename = crate::protocol::escape(&result.filename);
    let mut request_size = INITIAL_REQUEST_SIZE;

    loop {
        let Some(chunk) = download.get_chunk(request_size).await else {
            debug!(peer = %peer.sid(), "cursor exhausted, worker done");
            return;
        };

        let gate = peer.gate();
        let ticket = gate.next_id();
        gate.enter(ticket).await;
        let outcome = async {
            client.ensure_peer_session(&peer).await?;
            let started = Instant::now();
            let (start, data) = peer
                .fetch_range(&filename, chunk.start, chunk.size, download.compress())
                .await?;
            Ok::<_, HubError>((started.elapsed(), start, data))
        }
        .await;
        gate.leave(ticket);

        let (elapsed, start, data) = match outcome {
            Ok(v) => v,
            Err(e) => {
                warn!(
                    peer = %peer.sid(),
                    start = chunk.start,
                    size = chunk.size,
                    "worker failed, abandoning chunk range: {e}"
                );
                return;
            }
        };

        if let Err(e) = download.write_at(start, &data).await {
            warn!(
                peer = %peer.sid(),
                start,
                "write failed, abandoning chunk range: {e}"
            );
            return;
        }

        // Coarse adaptive sizing: fast peers double up toward efficient
        // requests, slow peers halve so they cannot starve the rest.
        if elapsed < REQUEST_GROW_THRESHOLD {
            request_size = (request_size.saturating_mul(2)).min(MAX_REQUEST_SIZE);
        } else if elapsed > REQUEST_SHRINK_THRESHOLD && request_size / 2 >= MIN_REQUEST_SIZE {
            request_size /= 2;
        }
    }
}
