use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use dashmap::DashMap;
use tiger::{Digest, Tiger};
use tokio::sync::{mpsc, oneshot, Notify};
use tracing::{debug, info, warn};

use super::error::HubError;
use super::handler::{HandlerRegistry, MessageHandler};
use super::peer::Peer;
use crate::constants::ERROR_CHANNEL_CAPACITY;
use crate::protocol::{
    base32_decode_loose, base32_encode, deescape, format_fields, FieldMap, Identifier, Message,
    Session, SessionWriter,
};

/// Configuration for a hub connection.
pub struct ClientConfig {
    /// The client's private identifier.
    pub pid: Identifier,
    /// Fields sent in our INF. Must contain `NI`.
    pub info: FieldMap,
    /// Password for hubs that challenge with GPA.
    pub password: Option<String>,
}

/// A connected hub client.
///
/// [`HubClient::connect`] drives the session through the PROTOCOL,
/// IDENTIFY and VERIFY phases, then spawns a pump task that dispatches
/// inbound messages for the life of the connection. Fatal errors close
/// the session and surface on the error receiver.
pub struct HubClient {
    pid: Identifier,
    cid: Identifier,
    sid: Identifier,
    features: HashSet<String>,
    info: FieldMap,
    writer: SessionWriter,
    pub(crate) peers: DashMap<String, Arc<Peer>>,
    pub(crate) handlers: HandlerRegistry,
    pub(crate) ctm_waiters: DashMap<String, oneshot::Sender<u16>>,
    errors: mpsc::Sender<HubError>,
    shutdown: Notify,
}

impl HubClient {
    /// Connects and authenticates against an open hub session.
    ///
    /// Returns the shared client handle and the receiver fatal pump
    /// errors arrive on. Messages that are valid but out of phase ride
    /// an internal queue into the next phase, per the protocol's
    /// tolerance for early INF and informational STA.
    pub async fn connect(
        mut session: Session,
        config: ClientConfig,
    ) -> Result<(Arc<Self>, mpsc::Receiver<HubError>), HubError> {
        let ClientConfig {
            pid,
            info,
            password,
        } = config;
        let writer = session.writer();
        let mut invalid = VecDeque::new();

        let (features, cid, sid) =
            protocol_phase(&mut session, &pid, &mut invalid).await?;

        // IDENTIFY: a single INF introduces us; the hub answers with
        // GPA, STA or the INF roll call.
        if !info.contains_key("NI") {
            session.close().await;
            return Err(HubError::MissingNick);
        }
        writer
            .write_line(format!(
                "BINF {} ID{} PD{} {}",
                sid,
                cid,
                pid,
                format_fields(&info)
            ))
            .await?;

        let peers = DashMap::new();
        verify_phase(&mut session, &sid, password.as_deref(), &peers, &mut invalid).await?;

        let (err_tx, err_rx) = mpsc::channel(ERROR_CHANNEL_CAPACITY);
        let client = Arc::new(Self {
            pid,
            cid,
            sid,
            features,
            info,
            writer,
            peers,
            handlers: HandlerRegistry::new(),
            ctm_waiters: DashMap::new(),
            errors: err_tx,
            shutdown: Notify::new(),
        });

        let pump = client.clone();
        tokio::spawn(async move { pump.run(session, invalid).await });

        Ok((client, err_rx))
    }

    pub fn pid(&self) -> &Identifier {
        &self.pid
    }

    pub fn cid(&self) -> &Identifier {
        &self.cid
    }

    pub fn sid(&self) -> &Identifier {
        &self.sid
    }

    /// Features the hub advertised during SUP negotiation.
    pub fn features(&self) -> &HashSet<String> {
        &self.features
    }

    /// Fields we identified with.
    pub fn info(&self) -> &FieldMap {
        &self.info
    }

    /// Looks up a peer by session identifier.
    pub fn peer(&self, sid: &str) -> Option<Arc<Peer>> {
        self.peers.get(sid).map(|p| p.clone())
    }

    /// Writes one line on the hub session.
    pub async fn write_line(&self, line: impl AsRef<str>) -> Result<(), HubError> {
        self.writer.write_line(line).await.map_err(Into::into)
    }

    pub fn register_handler(&self, command: &str, handler: Arc<dyn MessageHandler>) {
        self.handlers.register(command, handler);
    }

    pub fn register_token_handler(
        &self,
        command: &str,
        token: &str,
        handler: Arc<dyn MessageHandler>,
    ) {
        self.handlers.register_token(command, token, handler);
    }

    pub fn unregister_handler(&self, command: &str) {
        self.handlers.unregister(command);
    }

    pub fn unregister_token_handler(&self, command: &str, token: &str) {
        self.handlers.unregister_token(command, token);
    }

    /// Asks the pump to close the session and stop.
    pub fn close(&self) {
        self.shutdown.notify_one();
    }

    /// The NORMAL phase: dispatch messages until shutdown or a fatal
    /// error. Messages parked during the handshake replay first.
    async fn run(self: Arc<Self>, mut session: Session, mut pending: VecDeque<Message>) {
        while let Some(msg) = pending.pop_front() {
            if let Err(e) = self.dispatch(&msg) {
                session.close().await;
                self.fail(e).await;
                return;
            }
        }
        loop {
            tokio::select! {
                _ = self.shutdown.notified() => {
                    session.close().await;
                    self.fail(HubError::Closed).await;
                    return;
                }
                msg = session.read_message() => match msg {
                    Ok(msg) => {
                        if let Err(e) = self.dispatch(&msg) {
                            session.close().await;
                            self.fail(e).await;
                            return;
                        }
                    }
                    Err(e) => {
                        self.fail(e.into()).await;
                        return;
                    }
                },
            }
        }
    }

    /// Handles one NORMAL-phase message. `Err` means a fatal protocol
    /// violation that tears the client down.
    fn dispatch(&self, msg: &Message) -> Result<(), HubError> {
        match msg.command.as_str() {
            // Authentication traffic has no business after VERIFY.
            "GPA" | "PAS" | "SID" => Err(HubError::Unexpected(msg.raw.clone())),

            "INF" => {
                upsert_peer(&self.peers, msg);
                Ok(())
            }

            "QUI" => {
                let Some(sid) = msg.params.first() else {
                    return Ok(());
                };
                if sid == self.sid.text() {
                    let reason = msg.field("MS").map(deescape).unwrap_or_default();
                    return Err(HubError::Kicked { reason });
                }
                if let Some((_, peer)) = self.peers.remove(sid) {
                    info!(nick = %peer.nick().unwrap_or_default(), %sid, "peer quit");
                }
                Ok(())
            }

            "RES" => {
                if msg.params.get(1).map(String::as_str) != Some(self.sid.text()) {
                    return Err(HubError::Unexpected(msg.raw.clone()));
                }
                if !self.route(msg) {
                    debug!(raw = %msg.raw, "search result with no registered search");
                }
                Ok(())
            }

            "CTM" => {
                // DCTM <peer-sid> <our-sid> ADC/1.0 <port> <token>
                if msg.params.len() < 5 {
                    warn!(raw = %msg.raw, "short CTM");
                    return Ok(());
                }
                if let Some((_, waiter)) = self.ctm_waiters.remove(&msg.params[4]) {
                    match msg.params[3].parse() {
                        Ok(port) => {
                            let _ = waiter.send(port);
                        }
                        Err(_) => warn!(raw = %msg.raw, "CTM without a usable port"),
                    }
                }
                Ok(())
            }

            "MSG" => {
                if self.route(msg) {
                    return Ok(());
                }
                match msg.params.len() {
                    1 => info!("<hub> {}", deescape(&msg.params[0])),
                    _ if msg.params.len() >= 2 => {
                        let nick = self
                            .peer(&msg.params[0])
                            .and_then(|p| p.nick())
                            .unwrap_or_else(|| msg.params[0].clone());
                        info!("<{}> {}", nick, deescape(&msg.params[1]));
                    }
                    _ => {}
                }
                Ok(())
            }

            "STA" => {
                let code = msg.params.first().map(String::as_str).unwrap_or("");
                let text = msg.params.get(1).map(|m| deescape(m)).unwrap_or_default();
                info!(%code, "hub status: {text}");
                Ok(())
            }

            _ => {
                if !self.route(msg) {
                    debug!(command = %msg.command, raw = %msg.raw, "unhandled message");
                }
                Ok(())
            }
        }
    }

    /// Runs the registered handler for a message, token handler first.
    /// Returns whether any handler claimed it.
    fn route(&self, msg: &Message) -> bool {
        match self.handlers.lookup(&msg.command, msg.field("TO")) {
            Some(handler) => {
                if let Err(e) = handler.handle(self, msg) {
                    warn!(command = %msg.command, "handler failed: {e}");
                }
                true
            }
            None => false,
        }
    }

    async fn fail(&self, error: HubError) {
        if self.errors.send(error).await.is_err() {
            debug!("error receiver dropped");
        }
    }
}

/// PROTOCOL: exchange SUP, require BASE and TIGR, adopt the assigned SID
/// and derive our CID.
async fn protocol_phase(
    session: &mut Session,
    pid: &Identifier,
    invalid: &mut VecDeque<Message>,
) -> Result<(HashSet<String>, Identifier, Identifier), HubError> {
    session.write_line("HSUP ADBASE ADTIGR").await?;

    let mut features = HashSet::new();
    loop {
        let msg = session.read_message().await?;
        match msg.command.as_str() {
            "SUP" => apply_sup(&mut features, &msg)?,

            "SID" => {
                let Some(assigned) = msg.params.first() else {
                    session.close().await;
                    return Err(HubError::Unexpected(msg.raw.clone()));
                };
                if !features.contains("BASE") {
                    session.write_line("HSTA 244 FCBASE").await.ok();
                    session.close().await;
                    return Err(HubError::MissingFeature("BASE".to_string()));
                }
                if !features.contains("TIGR") {
                    session
                        .write_line("HSTA 247 No\\scommon\\shash\\sfunction.")
                        .await
                        .ok();
                    session.close().await;
                    return Err(HubError::NoCommonHash);
                }
                let cid = Identifier::client_of(pid);
                let sid = Identifier::session(assigned);
                return Ok((features, cid, sid));
            }

            "STA" => {
                let code = msg.params.first().map(String::as_str).unwrap_or("");
                if code.starts_with('0') {
                    invalid.push_back(msg);
                } else {
                    session.close().await;
                    return Err(HubError::status(&msg));
                }
            }

            _ => invalid.push_back(msg),
        }
    }
}

/// VERIFY: answer a password challenge if one comes, absorb the INF roll
/// call, and finish when the hub echoes our own INF back.
async fn verify_phase(
    session: &mut Session,
    sid: &Identifier,
    password: Option<&str>,
    peers: &DashMap<String, Arc<Peer>>,
    invalid: &mut VecDeque<Message>,
) -> Result<(), HubError> {
    let mut replay = std::mem::take(invalid);
    let mut sent_password = false;
    let writer = session.writer();

    loop {
        let msg = match replay.pop_front() {
            Some(msg) => msg,
            None => session.read_message().await?,
        };
        match msg.command.as_str() {
            "GPA" => {
                let Some(password) = password else {
                    session.close().await;
                    return Err(HubError::NoPassword);
                };
                let Some(nonce) = msg.params.first() else {
                    session.close().await;
                    return Err(HubError::Unexpected(msg.raw.clone()));
                };
                let nonce = base32_decode_loose(nonce)?;
                let mut hasher = Tiger::new();
                hasher.update(password.as_bytes());
                hasher.update(&nonce);
                writer
                    .write_line(format!("HPAS {}", base32_encode(&hasher.finalize())))
                    .await?;
                sent_password = true;
            }

            "INF" => {
                let own = msg.params.first().map(String::as_str) == Some(sid.text());
                upsert_peer(peers, &msg);
                if own {
                    return Ok(());
                }
            }

            "STA" => {
                let code = msg.params.first().map(String::as_str).unwrap_or("");
                if code.starts_with('0') {
                    info!(
                        "hub: {}",
                        msg.params.get(1).map(|m| deescape(m)).unwrap_or_default()
                    );
                } else if sent_password {
                    session.close().await;
                    return Err(HubError::PasswordRejected);
                } else {
                    session.close().await;
                    return Err(HubError::status(&msg));
                }
            }

            "QUI" if msg.params.first().map(String::as_str) == Some(sid.text()) => {
                let reason = msg.field("MS").map(deescape).unwrap_or_default();
                session.close().await;
                return Err(HubError::Kicked { reason });
            }

            _ => invalid.push_back(msg),
        }
    }
}

/// Applies one SUP message to a feature set. `AD` adds, `RM` removes,
/// anything else is a protocol violation.
pub(crate) fn apply_sup(features: &mut HashSet<String>, msg: &Message) -> Result<(), HubError> {
    for word in &msg.params {
        if let Some(feature) = word.strip_prefix("AD") {
            features.insert(feature.to_string());
        } else if let Some(feature) = word.strip_prefix("RM") {
            features.remove(feature);
        } else {
            return Err(HubError::Unexpected(msg.raw.clone()));
        }
    }
    Ok(())
}

/// Inserts or updates a peer from an INF message.
pub(crate) fn upsert_peer(peers: &DashMap<String, Arc<Peer>>, msg: &Message) {
    let Some(sid) = msg.params.first() else {
        return;
    };
    let peer = peers
        .entry(sid.clone())
        .or_insert_with(|| Arc::new(Peer::new(sid.clone())))
        .clone();
    peer.update_info(&msg.params[1..]);
}
