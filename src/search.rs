//! Broadcast searches and asynchronous result routing.
//!
//! A search owns a random reference token. Sending it registers the
//! search as the RES handler for that token and broadcasts BSCH; peers
//! answer with DRES messages that land on the search's bounded result
//! channel until the caller stops listening.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::warn;

use crate::constants::SEARCH_RESULT_CAPACITY;
use crate::hub::{HubClient, HubError, MessageHandler, Peer};
use crate::protocol::{deescape, escape, format_fields, FieldMap, Message};
use crate::treehash::TreeHash;

/// One hit from a peer answering a search.
#[derive(Clone)]
pub struct SearchResult {
    pub peer: Arc<Peer>,
    /// Full path of the file in the peer's share, de-escaped.
    pub filename: String,
    /// File size in bytes.
    pub size: u64,
    /// Upload slots the peer had free when it answered.
    pub slots: u32,
}

/// A broadcast search and the sending half of its result channel.
///
/// Results past the channel capacity are dropped silently and counted;
/// the consumer's pacing is the limit.
pub struct Search {
    token: String,
    terms: Mutex<Terms>,
    results: mpsc::Sender<SearchResult>,
    dropped: AtomicU64,
}

#[derive(Default)]
struct Terms {
    typed: FieldMap,
    strings: Vec<String>,
}

impl Search {
    /// Creates a search and the receiving end of its result channel.
    pub fn new() -> (Arc<Self>, mpsc::Receiver<SearchResult>) {
        let (tx, rx) = mpsc::channel(SEARCH_RESULT_CAPACITY);
        let search = Arc::new(Self {
            token: base36(rand::random::<u32>()),
            terms: Mutex::new(Terms::default()),
            results: tx,
            dropped: AtomicU64::new(0),
        });
        (search, rx)
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    /// Results dropped because the channel was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Filenames must contain this term.
    pub fn include(&self, term: &str) {
        self.terms
            .lock()
            .strings
            .push(format!("AN{}", escape(term)));
    }

    /// Filenames must not contain this term.
    pub fn exclude(&self, term: &str) {
        self.terms
            .lock()
            .strings
            .push(format!("NO{}", escape(term)));
    }

    /// The extension must match, given without the leading period.
    pub fn extension(&self, ext: &str) {
        self.terms.lock().strings.push(format!("EX{}", escape(ext)));
    }

    pub fn smaller_than(&self, size: u64) {
        self.terms
            .lock()
            .typed
            .insert("LE".to_string(), size.to_string());
    }

    pub fn larger_than(&self, size: u64) {
        self.terms
            .lock()
            .typed
            .insert("GE".to_string(), size.to_string());
    }

    pub fn exact_size(&self, size: u64) {
        self.terms
            .lock()
            .typed
            .insert("EQ".to_string(), size.to_string());
    }

    pub fn must_be_file(&self) {
        self.terms
            .lock()
            .typed
            .insert("TY".to_string(), "1".to_string());
    }

    pub fn must_be_directory(&self) {
        self.terms
            .lock()
            .typed
            .insert("TY".to_string(), "2".to_string());
    }

    pub fn tree_hash(&self, hash: &TreeHash) {
        self.terms
            .lock()
            .typed
            .insert("TR".to_string(), hash.text().to_string());
    }

    /// Registers this search for RES routing and broadcasts it.
    pub async fn send(self: Arc<Self>, client: &HubClient) -> Result<(), HubError> {
        client.register_token_handler("RES", &self.token, self.clone());
        client.write_line(self.render(client.sid().text())).await
    }

    fn render(&self, sid: &str) -> String {
        let terms = self.terms.lock();
        let mut line = format!("BSCH {} TO{}", sid, self.token);
        let typed = format_fields(&terms.typed);
        if !typed.is_empty() {
            line.push(' ');
            line.push_str(&typed);
        }
        for term in &terms.strings {
            line.push(' ');
            line.push_str(term);
        }
        line
    }
}

impl MessageHandler for Search {
    /// DRES <peer-sid> <our-sid> <fields...>; the pump already checked
    /// the target SID.
    fn handle(&self, client: &HubClient, message: &Message) -> Result<(), HubError> {
        let Some(peer) = message.params.first().and_then(|sid| client.peer(sid)) else {
            warn!(raw = %message.raw, "search result from unknown peer");
            return Ok(());
        };

        let fields = message.fields_from(2);
        let Some(filename) = fields.get("FN") else {
            warn!(raw = %message.raw, "search result without a filename");
            return Ok(());
        };
        let Some(size) = fields.get("SI").and_then(|s| s.parse::<u64>().ok()) else {
            warn!(raw = %message.raw, "search result without a usable size");
            return Ok(());
        };
        let slots = fields
            .get("SL")
            .and_then(|s| s.parse::<u32>().ok())
            .unwrap_or(0);

        let result = SearchResult {
            peer,
            filename: deescape(filename),
            size,
            slots,
        };
        if self.results.try_send(result).is_err() {
            let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
            warn!(token = %self.token, dropped, "result channel full, dropping result");
        }
        Ok(())
    }
}

/// Lowercase base-36 rendering of a search token.
fn base36(mut value: u32) -> String {
    const DIGITS: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    if value == 0 {
        return "0".to_string();
    }
    let mut out = Vec::new();
    while value > 0 {
        out.push(DIGITS[(value % 36) as usize]);
        value /= 36;
    }
    out.reverse();
    String::from_utf8(out).unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::hub::ClientConfig;
    use crate::protocol::{Identifier, Session};
    use std::time::Duration;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

    #[test]
    fn test_base36() {
        assert_eq!(base36(0), "0");
        assert_eq!(base36(35), "z");
        assert_eq!(base36(36), "10");
        assert_eq!(base36(u32::MAX), "1z141z3");
    }

    #[test]
    fn test_render_collects_terms() {
        let (search, _rx) = Search::new();
        search.include("linux iso");
        search.exclude("beta");
        search.extension("iso");
        search.larger_than(1024);
        search.must_be_file();

        let line = search.render("AAAX");
        assert!(line.starts_with(&format!("BSCH AAAX TO{}", search.token())));
        assert!(line.contains("GE1024"));
        assert!(line.contains("TY1"));
        assert!(line.contains("ANlinux\\siso"));
        assert!(line.contains("NObeta"));
        assert!(line.contains("EXiso"));
    }

    #[test]
    fn test_render_tree_hash_term() {
        let (search, _rx) = Search::new();
        let root = crate::treehash::TreeHash::from_raw([7u8; 24]);
        search.tree_hash(&root);
        assert!(search.render("AAAX").contains(&format!("TR{}", root.text())));
    }

    /// End to end: a DRES carrying our token becomes a SearchResult on
    /// the channel.
    #[tokio::test]
    async fn test_result_routing() {
        let (ours, theirs) = tokio::io::duplex(4096);
        let (read, mut write) = tokio::io::split(theirs);
        let mut lines = BufReader::new(read).lines();

        let mut info = crate::protocol::FieldMap::new();
        info.insert("NI".to_string(), "tester".to_string());
        let config = ClientConfig {
            pid: Identifier::private(b"search test pid"),
            info,
            password: None,
        };

        let script = tokio::spawn(async move {
            // HSUP
            lines.next_line().await.unwrap();
            write.write_all(b"ISUP ADBASE ADTIGR\nISID AAAX\n").await.unwrap();
            // BINF
            lines.next_line().await.unwrap();
            write.write_all(b"BINF AAAX NItester\n").await.unwrap();
            // BSCH <sid> TO<token> ...
            let bsch = lines.next_line().await.unwrap().unwrap();
            let token = bsch
                .split(' ')
                .find_map(|w| w.strip_prefix("TO"))
                .unwrap()
                .to_string();
            write.write_all(b"BINF BBBY NIother SL4\n").await.unwrap();
            write
                .write_all(
                    format!("DRES BBBY AAAX FN/foo/bar SI1024 SL2 TO{token}\n").as_bytes(),
                )
                .await
                .unwrap();
            (bsch, write, lines)
        });

        let (client, _errors) = HubClient::connect(Session::new(Box::new(ours)), config)
            .await
            .unwrap();

        let (search, mut results) = Search::new();
        let root = crate::treehash::TreeHash::from_raw([9u8; 24]);
        search.tree_hash(&root);
        search.clone().send(&client).await.unwrap();

        let result = tokio::time::timeout(Duration::from_secs(5), results.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(result.filename, "/foo/bar");
        assert_eq!(result.size, 1024);
        assert_eq!(result.slots, 2);
        assert_eq!(result.peer.sid(), "BBBY");
        assert_eq!(search.dropped(), 0);

        let (bsch, _write, _lines) = script.await.unwrap();
        assert!(bsch.contains(&format!("TR{}", root.text())));
    }
}
