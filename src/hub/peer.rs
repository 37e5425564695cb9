use std::collections::{HashMap, HashSet};

use bytes::Bytes;
use dashmap::DashMap;
use flate2::{Decompress, FlushDecompress, Status};
use parking_lot::{Mutex, RwLock};
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tracing::warn;

use super::client::{apply_sup, HubClient};
use super::error::HubError;
use crate::constants::LEAF_WIDTH;
use crate::protocol::{deescape, Session};
use crate::treehash::{verify_leaves, Leaf, TreeHash};

/// Another client on the hub, keyed by its session identifier.
///
/// INF fields update in place as the hub re-announces the peer; the
/// client removes the peer on QUI. A direct connection is established
/// lazily and shared by all callers through the [`SessionGate`].
pub struct Peer {
    sid: String,
    info: DashMap<String, String>,
    features: RwLock<HashSet<String>>,
    gate: SessionGate,
    session: tokio::sync::Mutex<Option<Session>>,
}

impl Peer {
    pub(crate) fn new(sid: String) -> Self {
        Self {
            sid,
            info: DashMap::new(),
            features: RwLock::new(HashSet::new()),
            gate: SessionGate::new(),
            session: tokio::sync::Mutex::new(None),
        }
    }

    pub fn sid(&self) -> &str {
        &self.sid
    }

    /// Returns an INF field in its wire form.
    pub fn info(&self, tag: &str) -> Option<String> {
        self.info.get(tag).map(|v| v.clone())
    }

    /// The peer's nickname, de-escaped for display.
    pub fn nick(&self) -> Option<String> {
        self.info("NI").map(|n| deescape(&n))
    }

    /// Whether the peer advertised a feature during the CSUP exchange.
    pub fn has_feature(&self, feature: &str) -> bool {
        self.features.read().contains(feature)
    }

    pub fn gate(&self) -> &SessionGate {
        &self.gate
    }

    pub async fn is_connected(&self) -> bool {
        self.session.lock().await.is_some()
    }

    pub(crate) fn update_info(&self, fields: &[String]) {
        for field in fields {
            if field.len() >= 2 && field.is_char_boundary(2) {
                self.info
                    .insert(field[..2].to_string(), field[2..].to_string());
            }
        }
    }

    pub(crate) async fn attach_session(&self, session: Session) {
        *self.session.lock().await = Some(session);
    }

    #[cfg(test)]
    pub(crate) fn insert_feature(&self, feature: &str) {
        self.features.write().insert(feature.to_string());
    }

    /// Drops the direct connection, if any.
    pub async fn disconnect(&self) {
        if let Some(session) = self.session.lock().await.take() {
            session.close().await;
        }
    }

    /// Fetches the peer's full leaf row for a file and verifies it
    /// against the expected root. Caller must hold the session gate.
    pub async fn fetch_leaves(&self, expected: &TreeHash) -> Result<Vec<Leaf>, HubError> {
        let mut guard = self.session.lock().await;
        let session = guard.as_mut().ok_or(HubError::NotConnected)?;

        let tth_param = format!("TTH/{expected}");
        session
            .write_line(format!("CGET tthl {tth_param} 0 -1"))
            .await?;

        let msg = session.read_message().await?;
        match msg.command.as_str() {
            "STA" => return Err(HubError::status(&msg)),
            "SND" => {
                let ok = msg.params.len() >= 4
                    && msg.params[0] == "tthl"
                    && msg.params[1] == tth_param
                    && msg.params[2] == "0";
                if !ok {
                    session.write_line("CSTA 140 Invalid\\sarguments.").await.ok();
                    session.close().await;
                    *guard = None;
                    return Err(HubError::Unexpected(msg.raw));
                }
            }
            _ => {
                session.close().await;
                *guard = None;
                return Err(HubError::Unexpected(msg.raw));
            }
        }

        let size: usize = msg.params[3]
            .parse()
            .map_err(|_| HubError::Unexpected(msg.raw.clone()))?;
        if size < LEAF_WIDTH || size % LEAF_WIDTH != 0 {
            session
                .write_line("CSTA 140 Invalid\\stthl\\ssize.")
                .await
                .ok();
            session.close().await;
            *guard = None;
            return Err(HubError::Unexpected(msg.raw));
        }

        let mut stream = vec![0u8; size];
        session.read_exact(&mut stream).await?;

        Ok(verify_leaves(&stream, expected)?)
    }

    /// Requests `size` bytes of a file starting at `offset`, optionally
    /// ZL1-compressed when the peer supports it. Returns the actual
    /// start offset granted and the decoded bytes. Caller must hold the
    /// session gate.
    pub async fn fetch_range(
        &self,
        filename: &str,
        offset: u64,
        size: u64,
        allow_compression: bool,
    ) -> Result<(u64, Bytes), HubError> {
        let mut guard = self.session.lock().await;
        let session = guard.as_mut().ok_or(HubError::NotConnected)?;

        let compress = allow_compression && self.has_feature("ZLIG");
        let request = if compress {
            format!("CGET file {filename} {offset} {size} ZL1")
        } else {
            format!("CGET file {filename} {offset} {size}")
        };
        session.write_line(request).await?;

        let msg = session.read_message().await?;
        match msg.command.as_str() {
            "STA" => return Err(HubError::status(&msg)),
            "SND" => {}
            _ => {
                session.close().await;
                *guard = None;
                return Err(HubError::Unexpected(msg.raw));
            }
        }

        // CSND file <name> <start> <size> [ZL0|ZL1]
        let granted = (|| {
            if msg.params.len() < 4 || msg.params[0] != "file" || msg.params[1] != filename {
                return None;
            }
            let start: u64 = msg.params[2].parse().ok()?;
            let sent: u64 = msg.params[3].parse().ok()?;
            if start < offset || sent > size {
                return None;
            }
            Some((start, sent))
        })();
        let Some((start, sent)) = granted else {
            session.write_line("CSTA 140 Invalid\\sarguments.").await.ok();
            session.close().await;
            *guard = None;
            return Err(HubError::Unexpected(msg.raw));
        };

        let inflate = msg.params.get(4).map(String::as_str) == Some("ZL1");
        let data = if inflate {
            read_exact_inflate(session, sent as usize).await?
        } else {
            let mut buf = vec![0u8; sent as usize];
            session.read_exact(&mut buf).await?;
            buf
        };

        Ok((start, Bytes::from(data)))
    }
}

/// Reads a zlib stream from the session until `expected_len` bytes have
/// been produced and the stream trailer is consumed.
async fn read_exact_inflate(
    session: &mut Session,
    expected_len: usize,
) -> Result<Vec<u8>, HubError> {
    let mut out = vec![0u8; expected_len];
    let mut written = 0usize;
    let mut decompress = Decompress::new(true);
    let mut inbuf = [0u8; 16 * 1024];

    loop {
        let n = session.read_some(&mut inbuf).await?;
        let mut consumed = 0usize;
        while consumed < n {
            let in_before = decompress.total_in();
            let out_before = decompress.total_out();
            let status = decompress
                .decompress(
                    &inbuf[consumed..n],
                    &mut out[written..],
                    FlushDecompress::None,
                )
                .map_err(|e| HubError::Unexpected(format!("zlib stream: {e}")))?;
            consumed += (decompress.total_in() - in_before) as usize;
            written += (decompress.total_out() - out_before) as usize;
            match status {
                Status::StreamEnd => {
                    if written != expected_len {
                        return Err(HubError::Unexpected(format!(
                            "zlib stream ended at {written} of {expected_len} bytes"
                        )));
                    }
                    return Ok(out);
                }
                Status::Ok | Status::BufError => {
                    if decompress.total_in() == in_before && decompress.total_out() == out_before {
                        // No forward progress with data in hand.
                        return Err(HubError::Unexpected(
                            "zlib stream stalled".to_string(),
                        ));
                    }
                }
            }
        }
    }
}

/// FIFO serializer for a peer's direct connection.
///
/// Every caller takes a ticket with [`next_id`](Self::next_id), waits its
/// turn with [`enter`](Self::enter), and must release with
/// [`leave`](Self::leave) on every exit path — a leaked ticket blocks the
/// peer channel for all later holders.
pub struct SessionGate {
    state: Mutex<GateState>,
}

struct GateState {
    next: u64,
    current: u64,
    waiters: HashMap<u64, oneshot::Sender<()>>,
}

impl SessionGate {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(GateState {
                next: 0,
                current: 0,
                waiters: HashMap::new(),
            }),
        }
    }

    /// Takes the next ticket number.
    pub fn next_id(&self) -> u64 {
        let mut state = self.state.lock();
        let id = state.next;
        state.next += 1;
        id
    }

    /// Waits until ticket `id` holds the channel.
    pub async fn enter(&self, id: u64) {
        let rx = {
            let mut state = self.state.lock();
            if state.current >= id {
                return;
            }
            let (tx, rx) = oneshot::channel();
            state.waiters.insert(id, tx);
            rx
        };
        let _ = rx.await;
    }

    /// Releases ticket `id` and wakes the next waiter, exactly once.
    pub fn leave(&self, id: u64) {
        let waiter = {
            let mut state = self.state.lock();
            debug_assert_eq!(state.current, id, "session gate released out of order");
            state.current = id + 1;
            state.waiters.remove(&(id + 1))
        };
        if let Some(tx) = waiter {
            let _ = tx.send(());
        }
    }
}

impl Default for SessionGate {
    fn default() -> Self {
        Self::new()
    }
}

impl HubClient {
    /// Ensures a direct session to the peer, reverse-connecting through
    /// the hub on demand. Caller must hold the peer's session gate.
    pub async fn ensure_peer_session(&self, peer: &Peer) -> Result<(), HubError> {
        let mut guard = peer.session.lock().await;
        if guard.is_some() {
            return Ok(());
        }

        let token = format!("{:08X}", rand::random::<u32>());
        let (tx, rx) = oneshot::channel();
        self.ctm_waiters.insert(token.clone(), tx);
        self.write_line(format!(
            "DRCM {} {} ADC/1.0 {}",
            self.sid(),
            peer.sid(),
            token
        ))
        .await?;

        let port = rx.await.map_err(|_| HubError::Closed);
        self.ctm_waiters.remove(&token);
        let port = port?;

        match self.dial_peer(peer, port, &token).await {
            Ok(session) => {
                *guard = Some(session);
                Ok(())
            }
            Err(e) => {
                // Tell the hub the connect attempt failed.
                self.write_line(format!("ISTA 142 TO{token} PRADC/1.0"))
                    .await
                    .ok();
                Err(e)
            }
        }
    }

    async fn dial_peer(&self, peer: &Peer, port: u16, token: &str) -> Result<Session, HubError> {
        let addr = if let Some(ip) = peer.info("I4") {
            format!("{ip}:{port}")
        } else if let Some(ip) = peer.info("I6") {
            format!("[{ip}]:{port}")
        } else {
            return Err(HubError::NoAddress);
        };

        let stream = TcpStream::connect(&addr).await?;
        let mut session = Session::new(Box::new(stream));

        session.write_line("CSUP ADBASE ADTIGR ADZLIG").await?;
        let msg = session.read_message().await?;
        if msg.command != "SUP" {
            session.close().await;
            return Err(HubError::Unexpected(msg.raw));
        }
        let mut features = HashSet::new();
        if let Err(e) = apply_sup(&mut features, &msg) {
            session.close().await;
            return Err(e);
        }
        *peer.features.write() = features;

        session
            .write_line(format!("CINF ID{} TO{}", self.cid(), token))
            .await?;
        let msg = session.read_message().await?;
        if msg.command != "INF" {
            session.close().await;
            return Err(HubError::Unexpected(msg.raw));
        }
        let reported = msg.field("ID").unwrap_or_default();
        match peer.info("ID") {
            Some(known) if known == reported => {}
            _ => {
                warn!(peer = %peer.sid(), "client id mismatch on direct connect");
                session.close().await;
                return Err(HubError::CidMismatch);
            }
        }

        Ok(session)
    }
}
