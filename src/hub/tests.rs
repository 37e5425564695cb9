use super::client::upsert_peer;
use super::*;

use std::sync::Arc;
use std::time::Duration;

use tiger::{Digest, Tiger};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream};
use tokio::sync::{mpsc, oneshot};

use crate::protocol::{base32_encode, FieldMap, Identifier, Message, Session};
use crate::treehash::{fold, leaf_hash, TreeHash};

fn test_config(password: Option<&str>) -> ClientConfig {
    let mut info = FieldMap::new();
    info.insert("NI".to_string(), "tester".to_string());
    ClientConfig {
        pid: Identifier::private(b"pid seed for unit testing"),
        info,
        password: password.map(str::to_string),
    }
}

struct ScriptedHub {
    lines: tokio::io::Lines<BufReader<tokio::io::ReadHalf<DuplexStream>>>,
    write: tokio::io::WriteHalf<DuplexStream>,
}

impl ScriptedHub {
    fn new(stream: DuplexStream) -> Self {
        let (read, write) = tokio::io::split(stream);
        Self {
            lines: BufReader::new(read).lines(),
            write,
        }
    }

    async fn expect(&mut self, prefix: &str) -> String {
        let line = self.lines.next_line().await.unwrap().unwrap();
        assert!(
            line.starts_with(prefix),
            "expected line starting {prefix:?}, got {line:?}"
        );
        line
    }

    async fn send(&mut self, line: &str) {
        self.write.write_all(line.as_bytes()).await.unwrap();
        self.write.write_all(b"\n").await.unwrap();
    }
}

/// Happy-path handshake: SUP then SID, our BINF, hub echoes it back.
#[tokio::test]
async fn test_protocol_handshake() {
    let (ours, theirs) = tokio::io::duplex(4096);
    let mut hub = ScriptedHub::new(theirs);

    let script = tokio::spawn(async move {
        hub.expect("HSUP ADBASE ADTIGR").await;
        hub.send("ISUP ADBASE ADTIGR").await;
        hub.send("ISID AAAX").await;
        let binf = hub.expect("BINF AAAX ID").await;
        hub.send("BINF AAAX NItester").await;
        binf
    });

    let config = test_config(None);
    let expected_cid = base32_encode(&Tiger::digest(config.pid.raw()));

    let (client, _errors) = HubClient::connect(Session::new(Box::new(ours)), config)
        .await
        .unwrap();

    assert_eq!(client.sid().text(), "AAAX");
    assert_eq!(client.cid().text(), expected_cid);
    assert!(client.features().contains("BASE"));
    assert!(client.features().contains("TIGR"));

    let binf = script.await.unwrap();
    assert!(binf.contains(&format!("ID{expected_cid}")));
    assert!(binf.contains("NItester"));
}

#[tokio::test]
async fn test_handshake_requires_tigr() {
    let (ours, theirs) = tokio::io::duplex(4096);
    let mut hub = ScriptedHub::new(theirs);

    tokio::spawn(async move {
        hub.expect("HSUP").await;
        hub.send("ISUP ADBASE").await;
        hub.send("ISID AAAX").await;
        // Client answers HSTA 247 and hangs up; nothing more to do.
        let _ = hub.lines.next_line().await;
    });

    let err = HubClient::connect(Session::new(Box::new(ours)), test_config(None))
        .await
        .err()
        .unwrap();
    assert!(matches!(err, HubError::NoCommonHash));
}

#[tokio::test]
async fn test_verify_answers_password_challenge() {
    let (ours, theirs) = tokio::io::duplex(4096);
    let mut hub = ScriptedHub::new(theirs);

    let nonce: [u8; 16] = *b"0123456789abcdef";
    let mut hasher = Tiger::new();
    hasher.update(b"hunter2");
    hasher.update(nonce);
    let expected = format!("HPAS {}", base32_encode(&hasher.finalize()));

    let script = tokio::spawn(async move {
        hub.expect("HSUP").await;
        hub.send("ISUP ADBASE ADTIGR").await;
        hub.send("ISID AAAX").await;
        hub.expect("BINF AAAX").await;
        hub.send(&format!("IGPA {}", base32_encode(&nonce))).await;
        let hpas = hub.expect("HPAS ").await;
        hub.send("BINF AAAX NItester").await;
        hpas
    });

    let (_client, _errors) =
        HubClient::connect(Session::new(Box::new(ours)), test_config(Some("hunter2")))
            .await
            .unwrap();

    assert_eq!(script.await.unwrap(), expected);
}

#[tokio::test]
async fn test_verify_without_password_fails() {
    let (ours, theirs) = tokio::io::duplex(4096);
    let mut hub = ScriptedHub::new(theirs);

    tokio::spawn(async move {
        hub.expect("HSUP").await;
        hub.send("ISUP ADBASE ADTIGR").await;
        hub.send("ISID AAAX").await;
        hub.expect("BINF AAAX").await;
        hub.send("IGPA MFRGG").await;
    });

    let err = HubClient::connect(Session::new(Box::new(ours)), test_config(None))
        .await
        .err()
        .unwrap();
    assert!(matches!(err, HubError::NoPassword));
}

#[tokio::test]
async fn test_kicked_during_verify() {
    let (ours, theirs) = tokio::io::duplex(4096);
    let mut hub = ScriptedHub::new(theirs);

    tokio::spawn(async move {
        hub.expect("HSUP").await;
        hub.send("ISUP ADBASE ADTIGR").await;
        hub.send("ISID AAAX").await;
        hub.expect("BINF AAAX").await;
        hub.send("IQUI AAAX MSgo\\saway").await;
    });

    let err = HubClient::connect(Session::new(Box::new(ours)), test_config(None))
        .await
        .err()
        .unwrap();
    match err {
        HubError::Kicked { reason } => assert_eq!(reason, "go away"),
        other => panic!("expected kick, got {other}"),
    }
}

async fn connected_client(mut hub: ScriptedHub) -> ScriptedHub {
    hub.expect("HSUP").await;
    hub.send("ISUP ADBASE ADTIGR").await;
    hub.send("ISID AAAX").await;
    hub.expect("BINF AAAX").await;
    hub.send("BINF AAAX NItester").await;
    hub
}

struct Capture(mpsc::Sender<Message>);

impl MessageHandler for Capture {
    fn handle(&self, _client: &HubClient, message: &Message) -> Result<(), HubError> {
        let _ = self.0.try_send(message.clone());
        Ok(())
    }
}

/// A DRES addressed to us reaches the handler registered under its token.
#[tokio::test]
async fn test_search_result_routing() {
    let (ours, theirs) = tokio::io::duplex(4096);
    let hub = ScriptedHub::new(theirs);
    let connect = HubClient::connect(Session::new(Box::new(ours)), test_config(None));
    let (mut hub, connected) = tokio::join!(connected_client(hub), connect);
    let (client, _errors) = connected.unwrap();

    let (tx, mut rx) = mpsc::channel(4);
    client.register_token_handler("RES", "tok1", Arc::new(Capture(tx)));
    // A generic handler must lose to the token handler.
    let (generic_tx, mut generic_rx) = mpsc::channel(4);
    client.register_handler("RES", Arc::new(Capture(generic_tx)));

    hub.send("BINF BBBY NIother I4127.0.0.1").await;
    hub.send("DRES BBBY AAAX FN/foo/bar SI1024 SL2 TOtok1").await;

    let msg = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(msg.field("FN"), Some("/foo/bar"));
    assert_eq!(msg.field("SI"), Some("1024"));
    assert_eq!(msg.params[0], "BBBY");
    assert!(client.peer("BBBY").is_some());

    assert!(generic_rx.try_recv().is_err());
}

/// A CTM answering our reverse-connect token wakes the waiter with the
/// advertised port.
#[tokio::test]
async fn test_ctm_routing() {
    let (ours, theirs) = tokio::io::duplex(4096);
    let hub = ScriptedHub::new(theirs);
    let connect = HubClient::connect(Session::new(Box::new(ours)), test_config(None));
    let (mut hub, connected) = tokio::join!(connected_client(hub), connect);
    let (client, _errors) = connected.unwrap();

    let (tx, rx) = oneshot::channel();
    client.ctm_waiters.insert("ABCD1234".to_string(), tx);

    hub.send("DCTM BBBY AAAX ADC/1.0 12345 ABCD1234").await;

    let port = tokio::time::timeout(Duration::from_secs(5), rx)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(port, 12345);
}

#[tokio::test]
async fn test_qui_removes_peer() {
    let (ours, theirs) = tokio::io::duplex(4096);
    let hub = ScriptedHub::new(theirs);
    let connect = HubClient::connect(Session::new(Box::new(ours)), test_config(None));
    let (mut hub, connected) = tokio::join!(connected_client(hub), connect);
    let (client, _errors) = connected.unwrap();

    hub.send("BINF BBBY NIother").await;
    hub.send("IQUI BBBY").await;

    // The pump runs concurrently; wait for it to chew through both lines.
    for _ in 0..100 {
        if client.peer("BBBY").is_none() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    // Peer inserted but never removed (or never inserted at all).
    panic!("peer BBBY still registered after QUI");
}

#[test]
fn test_upsert_peer_updates_in_place() {
    let peers = dashmap::DashMap::new();
    let msg = Message::parse("BINF BBBY NIold SL2").unwrap();
    upsert_peer(&peers, &msg);
    let msg = Message::parse("BINF BBBY NInew").unwrap();
    upsert_peer(&peers, &msg);

    let peer = peers.get("BBBY").unwrap().clone();
    assert_eq!(peer.nick().as_deref(), Some("new"));
    assert_eq!(peer.info("SL").as_deref(), Some("2"));
}

/// Ticket holders enter their critical sections in ticket order.
#[tokio::test]
async fn test_session_gate_fifo() {
    let gate = Arc::new(SessionGate::new());
    let order = Arc::new(parking_lot::Mutex::new(Vec::new()));

    let first = gate.next_id();
    let ids: Vec<u64> = (0..4).map(|_| gate.next_id()).collect();

    let mut tasks = Vec::new();
    // Spawn the later ticket holders first; they must still wait their turn.
    for &id in ids.iter().rev() {
        let gate = gate.clone();
        let order = order.clone();
        tasks.push(tokio::spawn(async move {
            gate.enter(id).await;
            order.lock().push(id);
            tokio::time::sleep(Duration::from_millis(5)).await;
            gate.leave(id);
        }));
    }
    tokio::time::sleep(Duration::from_millis(20)).await;

    gate.enter(first).await;
    order.lock().push(first);
    gate.leave(first);

    for task in tasks {
        task.await.unwrap();
    }
    assert_eq!(*order.lock(), vec![first, ids[0], ids[1], ids[2], ids[3]]);
}

#[tokio::test]
async fn test_fetch_leaves_verifies_root() {
    let leaves = [leaf_hash(b"a"), leaf_hash(b"b"), leaf_hash(b"c")];
    let root = TreeHash::from_raw(fold(&leaves));
    let stream: Vec<u8> = leaves.iter().flatten().copied().collect();

    let (ours, theirs) = tokio::io::duplex(4096);
    let peer = Peer::new("BBBY".to_string());
    peer.attach_session(Session::new(Box::new(ours))).await;

    let tth_param = format!("TTH/{root}");
    let mut remote = ScriptedHub::new(theirs);
    let script = tokio::spawn(async move {
        remote.expect(&format!("CGET tthl {tth_param} 0 -1")).await;
        remote
            .send(&format!("CSND tthl {tth_param} 0 {}", stream.len()))
            .await;
        remote.write.write_all(&stream).await.unwrap();
    });

    let fetched = peer.fetch_leaves(&root).await.unwrap();
    assert_eq!(fetched, leaves);
    script.await.unwrap();
}

#[tokio::test]
async fn test_fetch_leaves_rejects_corrupt_stream() {
    let leaves = [leaf_hash(b"a"), leaf_hash(b"b")];
    let root = TreeHash::from_raw(fold(&leaves));
    let mut stream: Vec<u8> = leaves.iter().flatten().copied().collect();
    stream[30] ^= 1;

    let (ours, theirs) = tokio::io::duplex(4096);
    let peer = Peer::new("BBBY".to_string());
    peer.attach_session(Session::new(Box::new(ours))).await;

    let tth_param = format!("TTH/{root}");
    let mut remote = ScriptedHub::new(theirs);
    tokio::spawn(async move {
        remote.expect("CGET tthl").await;
        remote
            .send(&format!("CSND tthl {tth_param} 0 {}", stream.len()))
            .await;
        remote.write.write_all(&stream).await.unwrap();
    });

    let err = peer.fetch_leaves(&root).await.unwrap_err();
    assert!(matches!(err, HubError::Verification(_)));
}

#[tokio::test]
async fn test_fetch_range_plain() {
    let (ours, theirs) = tokio::io::duplex(4096);
    let peer = Peer::new("BBBY".to_string());
    peer.attach_session(Session::new(Box::new(ours))).await;

    let mut remote = ScriptedHub::new(theirs);
    tokio::spawn(async move {
        remote.expect("CGET file share/foo 0 10").await;
        remote.send("CSND file share/foo 0 10").await;
        remote.write.write_all(b"0123456789").await.unwrap();
    });

    let (start, data) = peer.fetch_range("share/foo", 0, 10, false).await.unwrap();
    assert_eq!(start, 0);
    assert_eq!(&data[..], b"0123456789");
}

#[tokio::test]
async fn test_fetch_range_inflates_zl1() {
    use std::io::Write;

    let payload = vec![42u8; 4096];
    let mut encoder =
        flate2::write::ZlibEncoder::new(Vec::new(), flate2::Compression::default());
    encoder.write_all(&payload).unwrap();
    let compressed = encoder.finish().unwrap();

    let (ours, theirs) = tokio::io::duplex(64 * 1024);
    let peer = Peer::new("BBBY".to_string());
    peer.insert_feature("ZLIG");
    peer.attach_session(Session::new(Box::new(ours))).await;

    let mut remote = ScriptedHub::new(theirs);
    tokio::spawn(async move {
        remote.expect("CGET file share/foo 0 4096 ZL1").await;
        remote.send("CSND file share/foo 0 4096 ZL1").await;
        remote.write.write_all(&compressed).await.unwrap();
    });

    let (start, data) = peer.fetch_range("share/foo", 0, 4096, true).await.unwrap();
    assert_eq!(start, 0);
    assert_eq!(&data[..], &payload[..]);
}

#[tokio::test]
async fn test_fetch_range_rejects_oversized_grant() {
    let (ours, theirs) = tokio::io::duplex(4096);
    let peer = Peer::new("BBBY".to_string());
    peer.attach_session(Session::new(Box::new(ours))).await;

    let mut remote = ScriptedHub::new(theirs);
    tokio::spawn(async move {
        remote.expect("CGET file share/foo 0 10").await;
        // Larger than requested; the client must refuse it.
        remote.send("CSND file share/foo 0 20").await;
        let _ = remote.lines.next_line().await;
    });

    let err = peer.fetch_range("share/foo", 0, 10, false).await.unwrap_err();
    assert!(matches!(err, HubError::Unexpected(_)));
}

#[tokio::test]
async fn test_ping_reads_hub_info() {
    let (ours, theirs) = tokio::io::duplex(4096);
    let mut hub = ScriptedHub::new(theirs);

    tokio::spawn(async move {
        hub.expect("HSUP ADBASE ADTIGR ADPING").await;
        hub.send("ISUP ADBASE ADTIGR ADPING").await;
        hub.send("IINF CT32 NIPublic\\sHub UC42").await;
    });

    let info = ping(Session::new(Box::new(ours))).await.unwrap();
    assert_eq!(info.get("UC").map(String::as_str), Some("42"));
    assert_eq!(info.get("NI").map(String::as_str), Some("Public\\sHub"));
}

#[tokio::test]
async fn test_ping_requires_ping_feature() {
    let (ours, theirs) = tokio::io::duplex(4096);
    let mut hub = ScriptedHub::new(theirs);

    tokio::spawn(async move {
        hub.expect("HSUP").await;
        hub.send("ISUP ADBASE ADTIGR").await;
    });

    let err = ping(Session::new(Box::new(ours))).await.unwrap_err();
    assert!(matches!(err, HubError::MissingFeature(_)));
}
