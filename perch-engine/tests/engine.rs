//! Drives a real `Engine` against a scripted in-process IRC server.

use std::sync::Arc;
use std::time::Duration;

use base64::Engine as _;
use perch_engine::{Engine, EngineConfig, EngineError, Event};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

const STEP: Duration = Duration::from_secs(5);

/// The server side of one accepted connection.
struct Peer {
    lines: Lines<BufReader<OwnedReadHalf>>,
    write: OwnedWriteHalf,
}

impl Peer {
    async fn accept(listener: &TcpListener) -> Self {
        let (stream, _) = tokio::time::timeout(STEP, listener.accept())
            .await
            .expect("accept timed out")
            .unwrap();
        Self::new(stream)
    }

    fn new(stream: TcpStream) -> Self {
        let (read, write) = stream.into_split();
        Self {
            lines: BufReader::new(read).lines(),
            write,
        }
    }

    async fn recv(&mut self) -> String {
        tokio::time::timeout(STEP, self.lines.next_line())
            .await
            .expect("no line from client")
            .unwrap()
            .expect("client closed the connection")
    }

    async fn expect(&mut self, want: &str) {
        assert_eq!(self.recv().await, want);
    }

    async fn send(&mut self, line: &str) {
        self.write
            .write_all(format!("{line}\r\n").as_bytes())
            .await
            .unwrap();
    }

    /// Read the NICK/USER pair of a plain registration.
    async fn expect_registration(&mut self, nick: &str) {
        self.expect(&format!("NICK {nick}")).await;
        self.expect(&format!("USER {nick} 0 * :perch")).await;
    }
}

struct Harness {
    engine: Engine,
    events: mpsc::UnboundedReceiver<Event>,
    listener: TcpListener,
    port: u16,
}

impl Harness {
    async fn new(config: EngineConfig) -> Self {
        let (tx, events) = mpsc::unbounded_channel();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        Self {
            engine: Engine::new(config, Arc::new(tx)),
            events,
            listener,
            port,
        }
    }

    /// Connect as `me` and accept the server side.
    async fn connect(&mut self) -> Peer {
        self.engine
            .connect("127.0.0.1", self.port, "me", None, false)
            .await
            .unwrap();
        Peer::accept(&self.listener).await
    }

    /// Wait for the first event matching `pred`, skipping the rest.
    async fn wait_for(&mut self, pred: impl Fn(&Event) -> bool) -> Event {
        tokio::time::timeout(STEP, async {
            loop {
                let event = self.events.recv().await.expect("event channel closed");
                if pred(&event) {
                    return event;
                }
            }
        })
        .await
        .expect("expected event never arrived")
    }

    async fn wait_for_status(&mut self, text: &str) {
        self.wait_for(|e| matches!(e, Event::Status(s) if s == text))
            .await;
    }
}

fn quiet_config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.notifications.activity_summaries = false;
    config
}

#[tokio::test]
async fn registers_and_answers_ping() {
    let mut h = Harness::new(quiet_config()).await;
    let mut peer = h.connect().await;
    peer.expect_registration("me").await;
    let connected = format!("Connected to 127.0.0.1:{}", h.port);
    h.wait_for_status(&connected).await;

    peer.send("PING :irc.test").await;
    peer.expect("PONG :irc.test").await;
    h.wait_for_status("<- PING :irc.test").await;
    assert!(h.engine.is_connected());
}

#[tokio::test]
async fn server_password_goes_first() {
    let mut config = quiet_config();
    config.server_password = Some("sekrit".into());
    let mut h = Harness::new(config).await;
    let mut peer = h.connect().await;
    peer.expect("PASS sekrit").await;
    peer.expect_registration("me").await;
}

#[tokio::test]
async fn join_updates_roster_and_notifies() {
    let mut h = Harness::new(quiet_config()).await;
    let mut peer = h.connect().await;
    peer.expect_registration("me").await;

    peer.send(":srv 353 me = #perch :@alice +bob").await;
    peer.send(":srv 366 me #perch :End of /NAMES list.").await;
    peer.send(":carol!c@host JOIN #perch").await;

    let event = h
        .wait_for(|e| matches!(e, Event::Users { nicks, .. } if nicks.len() == 3))
        .await;
    assert_eq!(
        event,
        Event::Users {
            target: "#perch".into(),
            nicks: vec!["alice".into(), "bob".into(), "carol".into()],
        }
    );
    let notice = h.wait_for(|e| matches!(e, Event::Message { .. })).await;
    assert_eq!(notice, Event::message("#perch", "*", "carol joined #perch"));
    assert_eq!(
        h.engine.roster("#PERCH").unwrap(),
        vec!["alice", "bob", "carol"]
    );
}

#[tokio::test]
async fn sasl_success() {
    let mut config = quiet_config();
    config.sasl.enabled = true;
    config.sasl.username = Some("acct".into());
    config.sasl.password = Some("pw".into());
    let mut h = Harness::new(config).await;
    let mut peer = h.connect().await;

    peer.expect("CAP LS 302").await;
    peer.expect("CAP REQ :sasl").await;
    peer.send(":srv CAP * LS :multi-prefix sasl").await;
    peer.send(":srv CAP * ACK :sasl").await;
    peer.expect("AUTHENTICATE PLAIN").await;
    peer.send("AUTHENTICATE +").await;
    let payload = base64::engine::general_purpose::STANDARD.encode(b"\0acct\0pw");
    peer.expect(&format!("AUTHENTICATE {payload}")).await;
    peer.send(":srv 903 me :SASL authentication successful").await;
    peer.expect("CAP END").await;
    peer.expect_registration("me").await;
    h.wait_for_status("SASL authentication successful").await;
}

#[tokio::test]
async fn sasl_failure_still_registers_once() {
    let mut config = quiet_config();
    config.sasl.enabled = true;
    config.sasl.password = Some("wrong".into());
    let mut h = Harness::new(config).await;
    let mut peer = h.connect().await;

    peer.expect("CAP LS 302").await;
    peer.expect("CAP REQ :sasl").await;
    peer.send(":srv CAP * ACK :sasl").await;
    peer.expect("AUTHENTICATE PLAIN").await;
    peer.send("AUTHENTICATE +").await;
    let _payload = peer.recv().await;
    peer.send(":srv 904 me :SASL authentication failed").await;
    peer.send(":srv 906 me :SASL authentication aborted").await;
    peer.expect("CAP END").await;
    peer.expect_registration("me").await;

    // Anything else the client sent would arrive before this PONG.
    peer.send("PING :sync").await;
    peer.expect("PONG :sync").await;
    h.wait_for_status("SASL authentication failed (904). Continuing without SASL.")
        .await;
}

#[tokio::test]
async fn outbound_commands_are_formatted() {
    let mut h = Harness::new(quiet_config()).await;
    let mut peer = h.connect().await;
    peer.expect_registration("me").await;

    h.engine.join_channel("rust", Some("key")).await;
    peer.expect("JOIN #rust key").await;
    h.engine.send_message("#rust", "hello").await;
    peer.expect("PRIVMSG #rust :hello").await;
    h.engine.send_action("#rust", "waves").await;
    peer.expect("PRIVMSG #rust :\x01ACTION waves\x01").await;
    h.engine.send_notice("bob", "psst").await;
    peer.expect("NOTICE bob :psst").await;
    h.engine.set_topic("rust", None).await;
    peer.expect("TOPIC #rust").await;
    h.engine.set_topic("#rust", Some("new topic")).await;
    peer.expect("TOPIC #rust :new topic").await;
    h.engine.whois("bob").await;
    peer.expect("WHOIS bob").await;
    h.engine.change_nick("me2").await;
    peer.expect("NICK me2").await;
    h.engine.part_channel("#rust", Some("done")).await;
    peer.expect("PART #rust :done").await;
    h.engine.send_raw("MODE #rust +t\r\nQUIT").await;
    peer.expect("MODE #rust +t").await;
}

#[tokio::test]
async fn ctcp_version_is_answered() {
    let mut config = quiet_config();
    config.ctcp.version_string = "perch-test".into();
    let mut h = Harness::new(config).await;
    let mut peer = h.connect().await;
    peer.expect_registration("me").await;

    peer.send(":bob!b@host PRIVMSG me :\x01VERSION\x01").await;
    peer.expect("NOTICE bob :\x01VERSION perch-test\x01").await;
}

#[tokio::test]
async fn quit_sends_reason_and_clears_state() {
    let mut h = Harness::new(quiet_config()).await;
    let mut peer = h.connect().await;
    peer.expect_registration("me").await;

    peer.send(":srv 353 me = #perch :alice").await;
    h.wait_for(|e| matches!(e, Event::Users { .. })).await;
    assert_eq!(h.engine.channels(), vec!["#perch"]);

    h.engine.quit("later").await;
    peer.expect("QUIT :later").await;
    assert!(!h.engine.is_connected());
    assert!(h.engine.channels().is_empty());
    h.wait_for_status("Disconnected").await;

    // Idempotent, and sends now degrade to a status line.
    h.engine.disconnect().await;
    h.engine.send_message("#perch", "anyone?").await;
    h.wait_for_status("Not connected.").await;
}

#[tokio::test]
async fn server_hangup_marks_engine_disconnected() {
    let mut h = Harness::new(quiet_config()).await;
    let mut peer = h.connect().await;
    peer.expect_registration("me").await;
    peer.send(":srv 353 me = #perch :alice").await;
    h.wait_for(|e| matches!(e, Event::Users { .. })).await;

    drop(peer);
    h.wait_for_status("Disconnected").await;
    assert!(!h.engine.is_connected());
    assert!(h.engine.roster("#perch").is_none());
}

#[tokio::test]
async fn second_connect_replaces_the_first() {
    let mut h = Harness::new(quiet_config()).await;
    let mut first = h.connect().await;
    first.expect_registration("me").await;

    let mut second = h.connect().await;
    first.expect("QUIT :Bye").await;
    second.expect_registration("me").await;
    assert!(h.engine.is_connected());
}

#[tokio::test]
async fn connect_failure_is_reported() {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let engine = Engine::new(quiet_config(), Arc::new(tx));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let err = engine
        .connect("127.0.0.1", port, "me", None, false)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Connect { .. }));
    assert!(!engine.is_connected());
    match rx.recv().await.unwrap() {
        Event::Status(text) => assert!(text.starts_with("Connect failed: "), "{text}"),
        other => panic!("unexpected event {other:?}"),
    }
}

#[tokio::test]
async fn disconnect_is_bounded_when_the_peer_stops_reading() {
    let (tx, _events) = mpsc::unbounded_channel();
    let engine = Arc::new(Engine::new(quiet_config(), Arc::new(tx)));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    engine
        .connect("127.0.0.1", port, "me", None, false)
        .await
        .unwrap();
    // Accepted and then never read from.
    let (_stalled, _) = listener.accept().await.unwrap();

    let flood = {
        let engine = Arc::clone(&engine);
        tokio::spawn(async move {
            let text = "x".repeat(64 * 1024);
            while engine.is_connected() {
                engine.send_message("#c", &text).await;
            }
        })
    };
    // Long enough for the socket buffers to fill and a write to block.
    tokio::time::sleep(Duration::from_secs(2)).await;

    tokio::time::timeout(Duration::from_secs(10), engine.disconnect())
        .await
        .expect("disconnect did not finish");
    assert!(!engine.is_connected());
    tokio::time::timeout(STEP, flood)
        .await
        .expect("sender still blocked after disconnect")
        .unwrap();
}
