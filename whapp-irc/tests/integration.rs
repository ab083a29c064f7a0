//! Integration tests: gateway + in-memory platform over real TCP.
//!
//! Each test starts a server on a random port, drives it with a raw IRC
//! client and checks both what the client sees and what got persisted.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::time::timeout;

use whapp_irc::blob::MemoryBlobStore;
use whapp_irc::config::ServerConfig;
use whapp_irc::irc::Message;
use whapp_irc::platform::memory::{MemoryConnector, MemoryPlatform};
use whapp_irc::platform::{ChatId, Contact, Me, RawChat, RawMessage, RawParticipant, SessionBlob};
use whapp_irc::retry::RetryPolicy;
use whapp_irc::server::Server;
use whapp_irc::store::{MemoryStore, UserRecord};

struct Gateway {
    addr: std::net::SocketAddr,
    handle: tokio::task::JoinHandle<anyhow::Result<()>>,
    store: Arc<MemoryStore>,
    blobs: Arc<MemoryBlobStore>,
}

/// Helper: start a gateway on a random port backed by `platform`.
async fn start_gateway(platform: Arc<MemoryPlatform>, store: MemoryStore, retry: RetryPolicy) -> Gateway {
    let config = ServerConfig {
        listen_addr: "127.0.0.1:0".to_string(),
        poll_interval_ms: 20,
        ..Default::default()
    };
    let store = Arc::new(store);
    let blobs = Arc::new(MemoryBlobStore::new("http://files.test"));
    let server = Server::with_parts(
        config,
        Arc::new(MemoryConnector::new(platform)),
        store.clone(),
        blobs.clone(),
    )
    .with_setup_retry(retry);
    let (addr, handle) = server.start().await.unwrap();
    Gateway { addr, handle, store, blobs }
}

struct Client {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl Client {
    async fn connect(addr: std::net::SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).await.unwrap();
        let (reader, writer) = stream.into_split();
        Self {
            reader: BufReader::new(reader),
            writer,
        }
    }

    async fn send(&mut self, line: &str) {
        self.writer
            .write_all(format!("{line}\r\n").as_bytes())
            .await
            .unwrap();
    }

    async fn register(&mut self, nick: &str) {
        self.send(&format!("NICK {nick}")).await;
        self.send(&format!("USER {nick} 0 * :{nick}")).await;
    }

    /// Next line, or `None` once the server closed the connection.
    async fn next_line(&mut self, timeout_ms: u64) -> Option<String> {
        let mut line = String::new();
        match timeout(Duration::from_millis(timeout_ms), self.reader.read_line(&mut line)).await {
            Ok(Ok(0)) => None,
            Ok(Ok(_)) => Some(line.trim_end().to_string()),
            Ok(Err(e)) => panic!("read error: {e}"),
            Err(_) => panic!("Timeout waiting for a line"),
        }
    }

    /// Read until `predicate` matches, returning every line read
    /// (the matching one last).
    async fn read_until(&mut self, description: &str, predicate: impl Fn(&str) -> bool) -> Vec<String> {
        let mut seen = Vec::new();
        loop {
            match self.next_line(5000).await {
                Some(line) => {
                    let done = predicate(&line);
                    seen.push(line);
                    if done {
                        return seen;
                    }
                }
                None => panic!("Connection closed while waiting for: {description}; saw {seen:?}"),
            }
        }
    }

    async fn expect_closed(&mut self) -> Vec<String> {
        let mut rest = Vec::new();
        while let Some(line) = self.next_line(5000).await {
            rest.push(line);
        }
        rest
    }

    async fn quit(&mut self) {
        self.send("QUIT :bye").await;
        self.expect_closed().await;
    }
}

fn is_status(line: &str, text: &str) -> bool {
    line.starts_with(":status PRIVMSG ") && line.contains(text)
}

fn relayed(lines: &[String]) -> Vec<String> {
    lines
        .iter()
        .filter(|l| l.contains(" PRIVMSG ") && !l.starts_with(":status"))
        .cloned()
        .collect()
}

fn me(id: &str) -> Me {
    Me {
        id: ChatId::new(id),
        push_name: "Me".into(),
    }
}

fn chat(id: &str, title: &str, is_group: bool, ts: i64) -> RawChat {
    RawChat {
        id: ChatId::new(id),
        title: title.into(),
        is_group,
        timestamp: ts,
        description: None,
    }
}

fn text(chat: &str, id: &str, ts: i64, sender: &str, body: &str) -> RawMessage {
    RawMessage {
        id: id.into(),
        chat: ChatId::new(chat),
        timestamp: ts,
        from_me: false,
        sender: Some(Contact {
            id: ChatId::new(format!("{}@c.us", sender.to_lowercase())),
            name: Some(sender.into()),
        }),
        body: body.into(),
        media: None,
    }
}

fn bob_platform() -> Arc<MemoryPlatform> {
    Arc::new(
        MemoryPlatform::new(me("bob@c.us"))
            .logged_in()
            .with_chat(chat("c1@c.us", "Carol", false, 150), vec![])
            .with_history(vec![
                text("c1@c.us", "m100", 100, "Carol", "already seen"),
                text("c1@c.us", "m120", 120, "Carol", "missed one"),
                text("c1@c.us", "m140", 140, "Carol", "missed two"),
                text("c1@c.us", "m160", 160, "Carol", "after the listing"),
            ]),
    )
}

fn bob_store() -> MemoryStore {
    MemoryStore::new().with_record(
        "bob",
        UserRecord {
            session_blob: SessionBlob(BTreeMap::from([("token".into(), "abc".into())])),
            watermarks: HashMap::from([("c1@c.us".to_string(), 100)]),
        },
    )
}

// ── Test: first login via QR code ────────────────────────────────────

#[tokio::test]
async fn alice_first_login() {
    let platform = Arc::new(
        MemoryPlatform::new(me("alice@c.us"))
            .with_chat(chat("a@c.us", "Ann", false, 10), vec![])
            .with_chat(chat("b@c.us", "Ben", false, 20), vec![])
            .with_chat(chat("g@g.us", "Family", true, 30), vec![]),
    );
    platform.set_storage(SessionBlob(BTreeMap::from([("WAToken".into(), "t1".into())])));
    let gw = start_gateway(platform.clone(), MemoryStore::new(), RetryPolicy::default()).await;

    let mut client = Client::connect(gw.addr).await;
    client.register("alice").await;

    let lines = client
        .read_until("QR status", |l| is_status(l, "Scan this QR code: "))
        .await;
    let qr_line = lines.last().unwrap();
    assert!(qr_line.ends_with("http://files.test/qr-alice-1.svg"), "{qr_line}");
    assert_eq!(gw.blobs.keys(), vec!["qr-alice-1.svg"]);

    platform.complete_login();
    let lines = client.read_until("ready", |l| is_status(l, "ready for new messages")).await;
    assert!(lines.iter().any(|l| l.starts_with(":whapp-irc 001 alice ")), "{lines:?}");
    assert!(relayed(&lines).is_empty(), "{lines:?}");
    assert!(gw.blobs.keys().is_empty());

    client.quit().await;
    let record = gw.store.get("alice").expect("record persisted");
    assert_eq!(record.watermarks.len(), 3);
    assert_eq!(record.watermarks["g@g.us"], 30);
    assert_eq!(record.session_blob.0["WAToken"], "t1");
    gw.handle.abort();
}

// ── Test: reconnect with replay ─────────────────────────────────────

#[tokio::test]
async fn bob_replays_missed_messages() {
    let gw = start_gateway(bob_platform(), bob_store(), RetryPolicy::default()).await;
    let mut client = Client::connect(gw.addr).await;

    client.send("CAP LS 302").await;
    let ls = client.read_until("CAP LS", |l| l.contains(" CAP * LS ")).await;
    assert!(ls.last().unwrap().contains("whapp-irc/replay"));
    client.send("CAP REQ :whapp-irc/replay").await;
    client.read_until("CAP ACK", |l| l.contains(" CAP * ACK ")).await;
    client.register("bob").await;
    client.send("CAP END").await;

    let lines = client.read_until("ready", |l| is_status(l, "ready for new messages")).await;
    assert_eq!(
        relayed(&lines),
        vec![":Carol PRIVMSG bob :missed one", ":Carol PRIVMSG bob :missed two"]
    );

    client.quit().await;
    assert_eq!(gw.store.get("bob").unwrap().watermarks["c1@c.us"], 140);
    gw.handle.abort();
}

#[tokio::test]
async fn bob_without_replay_skips_to_latest() {
    let gw = start_gateway(bob_platform(), bob_store(), RetryPolicy::default()).await;
    let mut client = Client::connect(gw.addr).await;
    client.register("bob").await;

    let lines = client.read_until("ready", |l| is_status(l, "ready for new messages")).await;
    assert!(relayed(&lines).is_empty(), "{lines:?}");

    client.quit().await;
    assert_eq!(gw.store.get("bob").unwrap().watermarks["c1@c.us"], 150);
    gw.handle.abort();
}

// ── Test: setup retry exhaustion ────────────────────────────────────

#[tokio::test]
async fn failing_open_gives_up_after_five_attempts() {
    let platform = Arc::new(MemoryPlatform::new(me("eve@c.us")).failing_open("browser crashed"));
    let retry = RetryPolicy {
        attempts: 5,
        delay: Duration::from_millis(10),
    };
    let gw = start_gateway(platform.clone(), MemoryStore::new(), retry).await;
    let mut client = Client::connect(gw.addr).await;
    client.register("eve").await;

    let lines = client.expect_closed().await;
    let last = lines.last().expect("a final status line");
    assert!(is_status(last, "giving up trying to setup whapp bridge: "), "{lines:?}");
    assert!(!lines.iter().any(|l| l.contains(" 001 ")));
    assert_eq!(platform.open_calls(), 5);
    gw.handle.abort();
}

// ── Test: registration-independent behaviour ────────────────────────

#[tokio::test]
async fn ping_is_answered_before_registration() {
    let gw = start_gateway(bob_platform(), MemoryStore::new(), RetryPolicy::default()).await;
    let mut client = Client::connect(gw.addr).await;

    client.send("PING :keepalive 1").await;
    let line = client.next_line(2000).await.unwrap();
    let pong = Message::parse(&line).unwrap();
    assert_eq!(pong.command, "PONG");
    assert_eq!(pong.param(0), Some("whapp-irc"));
    assert_eq!(pong.param(1), Some("keepalive 1"));

    client.send("PING abc").await;
    assert_eq!(client.next_line(2000).await.unwrap(), ":whapp-irc PONG whapp-irc :abc");

    client.send("JOIN #anything").await;
    let line = client.next_line(2000).await.unwrap();
    assert!(line.starts_with(":whapp-irc 451 * "), "{line}");
    gw.handle.abort();
}

// ── Test: channels and live traffic ─────────────────────────────────

fn family_platform() -> Arc<MemoryPlatform> {
    let member = |id: &str, name: &str, admin: bool| RawParticipant {
        id: ChatId::new(id),
        name: Some(name.into()),
        is_admin: admin,
        is_me: false,
    };
    Arc::new(
        MemoryPlatform::new(me("dan@c.us"))
            .logged_in()
            .with_chat(
                chat("fam@g.us", "Family", true, 50),
                vec![member("dan@c.us", "Dan", true), member("mum@c.us", "Mum", true), member("sis@c.us", "Sis", false)],
            )
            .with_chat(chat("sis@c.us", "Sis", false, 40), vec![]),
    )
}

async fn ready_client(gw: &Gateway, nick: &str) -> Client {
    let mut client = Client::connect(gw.addr).await;
    client.register(nick).await;
    client.read_until("ready", |l| is_status(l, "ready for new messages")).await;
    client
}

#[tokio::test]
async fn double_join_emits_once() {
    let gw = start_gateway(family_platform(), MemoryStore::new(), RetryPolicy::default()).await;
    let mut client = ready_client(&gw, "dan").await;

    client.send("JOIN #family").await;
    let lines = client.read_until("end of names", |l| l.contains(" 366 ")).await;
    assert_eq!(
        lines,
        vec![
            ":dan JOIN #Family",
            ":whapp-irc 332 dan #Family Family",
            ":whapp-irc MODE #Family +o dan",
            ":whapp-irc 353 dan @ #Family :@Mum Sis",
            ":whapp-irc 366 dan #Family :End of /NAMES list.",
        ]
    );

    client.send("JOIN #Family").await;
    client.send("WHOIS nobody").await;
    let next = client.next_line(2000).await.unwrap();
    assert!(next.starts_with(":whapp-irc 401 dan nobody"), "{next}");
    client.quit().await;
    gw.handle.abort();
}

#[tokio::test]
async fn live_messages_are_relayed_in_order() {
    let platform = family_platform();
    let gw = start_gateway(platform.clone(), MemoryStore::new(), RetryPolicy::default()).await;
    let mut client = ready_client(&gw, "dan").await;

    for i in 0..20 {
        let (chat_id, sender) = if i % 2 == 0 { ("fam@g.us", "Mum") } else { ("sis@c.us", "Sis") };
        platform.push_message(text(chat_id, &format!("live{i}"), 100 + i, sender, &format!("message {i}")));
    }

    let mut got = Vec::new();
    while got.len() < 20 {
        let line = client.next_line(5000).await.expect("connection open");
        if line.contains(" PRIVMSG ") && !line.starts_with(":status") {
            got.push(line);
        }
    }
    for (i, line) in got.iter().enumerate() {
        let expected = if i % 2 == 0 {
            format!(":Mum PRIVMSG #Family :message {i}")
        } else {
            format!(":Sis PRIVMSG dan :message {i}")
        };
        assert_eq!(line, &expected);
    }

    client.quit().await;
    let record = gw.store.get("dan").unwrap();
    assert_eq!(record.watermarks["fam@g.us"], 118);
    assert_eq!(record.watermarks["sis@c.us"], 119);
    gw.handle.abort();
}

#[tokio::test]
async fn client_messages_reach_the_platform() {
    let platform = family_platform();
    let gw = start_gateway(platform.clone(), MemoryStore::new(), RetryPolicy::default()).await;
    let mut client = ready_client(&gw, "dan").await;

    client.send("PRIVMSG #Family :dinner at six").await;
    client.send("PRIVMSG Sis :bring cake").await;
    client.send("PRIVMSG #nowhere :hello?").await;
    let line = client.read_until("no such channel", |l| l.contains(" 403 ")).await;
    assert!(line.last().unwrap().contains("#nowhere"));

    assert_eq!(
        platform.sent(),
        vec![
            (ChatId::new("fam@g.us"), "dinner at six".to_string()),
            (ChatId::new("sis@c.us"), "bring cake".to_string()),
        ]
    );
    client.quit().await;
    gw.handle.abort();
}

#[tokio::test]
async fn logout_closes_the_connection() {
    let platform = family_platform();
    let gw = start_gateway(platform.clone(), MemoryStore::new(), RetryPolicy::default()).await;
    let mut client = ready_client(&gw, "dan").await;

    platform.log_out();
    let lines = client.expect_closed().await;
    assert!(lines.iter().any(|l| is_status(l, "logged out")), "{lines:?}");
    gw.handle.abort();
}
