//! The engine handle: connection lifecycle and the outbound command API.
//!
//! `connect` opens the socket, spawns one reader task for the connection and
//! sends the registration opening. The reader owns the framed read half and
//! the per-connection [`Session`]; the framed write half sits behind an async
//! mutex shared by the reader (protocol replies) and callers of the send API,
//! so every line reaches the wire whole.
//!
//! The engine does not reconnect. Consumers watch for the `Disconnected`
//! status and call `connect` again if they want to.

use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::io::{ReadHalf, WriteHalf};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;

use crate::codec::LineCodec;
use crate::config::EngineConfig;
use crate::ctcp;
use crate::dispatch::{Session, Shared};
use crate::error::Result;
use crate::event::EventSink;
use crate::message::channel_name;
use crate::transport::{self, IrcStream};

/// How long a reader gets to notice the shutdown signal before it is aborted.
const READER_JOIN_TIMEOUT: Duration = Duration::from_secs(2);
/// Bound on getting the writer for the farewell QUIT, and on sending it.
const QUIT_TIMEOUT: Duration = Duration::from_secs(2);
const DEFAULT_QUIT_REASON: &str = "Bye";

type LineReader = FramedRead<ReadHalf<Box<dyn IrcStream>>, LineCodec>;
type LineWriter = FramedWrite<WriteHalf<Box<dyn IrcStream>>, LineCodec>;

/// Write side of one connection.
struct Link {
    writer: tokio::sync::Mutex<Option<LineWriter>>,
    connected: AtomicBool,
    /// Cancelled on close; aborts writes stuck on a peer that stopped reading.
    closing: CancellationToken,
}

impl Link {
    fn new(writer: LineWriter) -> Self {
        Self {
            writer: tokio::sync::Mutex::new(Some(writer)),
            connected: AtomicBool::new(true),
            closing: CancellationToken::new(),
        }
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Returns whether the link was still marked connected.
    fn mark_disconnected(&self) -> bool {
        self.connected.swap(false, Ordering::SeqCst)
    }

    fn close(&self) {
        self.mark_disconnected();
        self.closing.cancel();
    }

    /// Write `lines` back to back, holding the writer for the whole batch.
    async fn send_lines(&self, lines: &[String]) -> io::Result<()> {
        tokio::select! {
            result = self.write_lines(lines) => result,
            _ = self.closing.cancelled() => {
                Err(io::Error::new(io::ErrorKind::NotConnected, "connection closing"))
            }
        }
    }

    async fn write_lines(&self, lines: &[String]) -> io::Result<()> {
        let mut guard = self.writer.lock().await;
        let writer = guard
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "connection closed"))?;
        for line in lines {
            tracing::debug!("-> {}", redacted(line));
            writer.feed(line.clone()).await?;
        }
        writer.flush().await
    }
}

/// Keep credentials out of debug logs.
fn redacted(line: &str) -> &str {
    for secret in ["PASS ", "AUTHENTICATE "] {
        if line
            .get(..secret.len())
            .is_some_and(|head| head.eq_ignore_ascii_case(secret))
        {
            return secret.trim_end();
        }
    }
    line
}

/// Why a reader task returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReaderExit {
    /// Asked to stop by `teardown`, which finishes the cleanup.
    Shutdown,
    /// The connection ended on its own; the reader cleaned up.
    Ended,
}

struct ReaderTask {
    handle: JoinHandle<ReaderExit>,
    shutdown: oneshot::Sender<()>,
}

/// One IRC connection at a time, plus the state derived from it.
pub struct Engine {
    shared: Shared,
    link: Mutex<Option<Arc<Link>>>,
    reader: Mutex<Option<ReaderTask>>,
    /// Serializes connect and disconnect.
    lifecycle: tokio::sync::Mutex<()>,
}

impl Engine {
    pub fn new(config: EngineConfig, sink: Arc<dyn EventSink>) -> Self {
        Self {
            shared: Shared::new(config, sink),
            link: Mutex::new(None),
            reader: Mutex::new(None),
            lifecycle: tokio::sync::Mutex::new(()),
        }
    }

    /// Replace the configuration. Notification and CTCP settings apply to
    /// the next inbound line; connection settings to the next `connect`.
    pub fn apply_config(&self, config: EngineConfig) {
        *self.shared.config.write() = config;
    }

    pub fn config(&self) -> EngineConfig {
        self.shared.config.read().clone()
    }

    pub fn is_connected(&self) -> bool {
        self.live_link().is_some()
    }

    /// Our nick as last confirmed or requested.
    pub fn nick(&self) -> String {
        self.shared.nick.lock().clone()
    }

    /// Sorted roster of a tracked channel.
    pub fn roster(&self, channel: &str) -> Option<Vec<String>> {
        self.shared.members.lock().roster(channel)
    }

    pub fn channels(&self) -> Vec<String> {
        self.shared.members.lock().channels()
    }

    /// Stop tracking a channel (e.g. after leaving it).
    pub fn forget_channel(&self, channel: &str) -> bool {
        self.shared.members.lock().remove_channel(channel)
    }

    /// Connect and start registration, replacing any live connection.
    ///
    /// On failure the engine stays disconnected, `Connect failed: ...` is
    /// emitted and the error is returned.
    pub async fn connect(
        &self,
        host: &str,
        port: u16,
        nick: &str,
        realname: Option<&str>,
        use_tls: bool,
    ) -> Result<()> {
        let _lifecycle = self.lifecycle.lock().await;
        self.teardown(DEFAULT_QUIT_REASON).await;

        let config = self.config();
        let conn = match transport::establish(host, port, use_tls, &config, self.shared.sink.as_ref())
            .await
        {
            Ok(conn) => conn,
            Err(e) => {
                self.shared.status(format!("Connect failed: {e}"));
                return Err(e);
            }
        };

        let tls = if conn.is_tls() { " (TLS)" } else { "" };
        let (read_half, write_half) = tokio::io::split(conn.into_stream());
        let link = Arc::new(Link::new(FramedWrite::new(write_half, LineCodec::new())));
        let mut session = Session::new(self.shared.clone(), nick, realname);
        let opening = session.begin();

        self.shared.status(format!("Connected to {host}:{port}{tls}"));
        *self.link.lock() = Some(Arc::clone(&link));

        let (shutdown, shutdown_rx) = oneshot::channel();
        let handle = tokio::spawn(read_loop(
            FramedRead::new(read_half, LineCodec::new()),
            session,
            Arc::clone(&link),
            self.shared.clone(),
            shutdown_rx,
        ));
        *self.reader.lock() = Some(ReaderTask { handle, shutdown });

        if let Err(e) = link.send_lines(&opening).await {
            self.shared.status(format!("Connect failed: {e}"));
            self.teardown(DEFAULT_QUIT_REASON).await;
            return Err(e.into());
        }
        Ok(())
    }

    /// `QUIT :Bye` and tear the connection down. Safe to call at any time.
    pub async fn disconnect(&self) {
        self.quit(DEFAULT_QUIT_REASON).await;
    }

    /// Like [`Engine::disconnect`] with a caller-chosen QUIT reason.
    pub async fn quit(&self, reason: &str) {
        let _lifecycle = self.lifecycle.lock().await;
        self.teardown(reason).await;
    }

    /// Stop the reader, send a best-effort QUIT, close the link and drop
    /// all channel state. Every wait in here is bounded.
    async fn teardown(&self, reason: &str) {
        let link = self.link.lock().take();
        let task = self.reader.lock().take();

        let mut reader_stopped = false;
        if let Some(ReaderTask { mut handle, shutdown }) = task {
            // A dropped receiver means the reader already ended and reported it.
            if shutdown.send(()).is_ok() {
                reader_stopped = match tokio::time::timeout(READER_JOIN_TIMEOUT, &mut handle).await {
                    Ok(Ok(exit)) => exit == ReaderExit::Shutdown,
                    Ok(Err(e)) => {
                        tracing::debug!("reader task failed: {e}");
                        true
                    }
                    Err(_) => {
                        tracing::warn!("reader did not stop in time, aborting it");
                        handle.abort();
                        true
                    }
                };
            }
        }

        if let Some(link) = link {
            if link.mark_disconnected() {
                match tokio::time::timeout(QUIT_TIMEOUT, link.writer.lock()).await {
                    Ok(mut guard) => {
                        if let Some(mut writer) = guard.take() {
                            let farewell = async {
                                writer.send(format!("QUIT :{reason}")).await?;
                                writer.close().await
                            };
                            match tokio::time::timeout(QUIT_TIMEOUT, farewell).await {
                                Ok(Ok(())) => {}
                                Ok(Err(e)) => tracing::debug!("QUIT not delivered: {e}"),
                                Err(_) => tracing::debug!("QUIT timed out"),
                            }
                        }
                    }
                    Err(_) => tracing::debug!("writer busy, closing without QUIT"),
                }
            }
            link.close();
        }

        self.shared.members.lock().clear_all();
        self.shared.activity.cancel_all();
        if reader_stopped {
            self.shared.status("Disconnected");
        }
    }

    fn live_link(&self) -> Option<Arc<Link>> {
        self.link
            .lock()
            .as_ref()
            .filter(|link| link.is_connected())
            .cloned()
    }

    async fn send_line(&self, line: String) {
        let Some(link) = self.live_link() else {
            self.shared.status("Not connected.");
            return;
        };
        if let Err(e) = link.send_lines(std::slice::from_ref(&line)).await {
            // A link closed under us by teardown is not a send failure.
            if link.mark_disconnected() {
                self.shared.status(format!("Send error: {e}"));
            }
        }
    }

    /// `JOIN`, with `#` added to bare names.
    pub async fn join_channel(&self, channel: &str, key: Option<&str>) {
        let channel = channel_name(channel.trim());
        match key.map(str::trim).filter(|k| !k.is_empty()) {
            Some(key) => self.send_line(format!("JOIN {channel} {key}")).await,
            None => self.send_line(format!("JOIN {channel}")).await,
        }
    }

    pub async fn part_channel(&self, channel: &str, reason: Option<&str>) {
        let channel = channel_name(channel.trim());
        match reason.filter(|r| !r.is_empty()) {
            Some(reason) => self.send_line(format!("PART {channel} :{reason}")).await,
            None => self.send_line(format!("PART {channel}")).await,
        }
    }

    pub async fn send_message(&self, target: &str, text: &str) {
        self.send_line(format!("PRIVMSG {target} :{text}")).await;
    }

    /// CTCP ACTION (`/me`).
    pub async fn send_action(&self, target: &str, action: &str) {
        self.send_line(format!("PRIVMSG {target} :{}", ctcp::encode("ACTION", action)))
            .await;
    }

    pub async fn send_notice(&self, target: &str, text: &str) {
        self.send_line(format!("NOTICE {target} :{text}")).await;
    }

    /// Query the topic with `None`, set it with `Some`.
    pub async fn set_topic(&self, channel: &str, topic: Option<&str>) {
        let channel = channel_name(channel.trim());
        match topic {
            Some(topic) => self.send_line(format!("TOPIC {channel} :{topic}")).await,
            None => self.send_line(format!("TOPIC {channel}")).await,
        }
    }

    pub async fn whois(&self, nick: &str) {
        self.send_line(format!("WHOIS {}", nick.trim())).await;
    }

    pub async fn change_nick(&self, nick: &str) {
        self.send_line(format!("NICK {}", nick.trim())).await;
    }

    /// Send a line as-is (CRLF is added).
    pub async fn send_raw(&self, line: &str) {
        self.send_line(line.to_string()).await;
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        if let Some(task) = self.reader.get_mut().take() {
            task.handle.abort();
        }
    }
}

async fn read_loop(
    mut lines: LineReader,
    mut session: Session,
    link: Arc<Link>,
    shared: Shared,
    mut shutdown: oneshot::Receiver<()>,
) -> ReaderExit {
    loop {
        tokio::select! {
            _ = &mut shutdown => {
                tracing::debug!("reader asked to stop");
                return ReaderExit::Shutdown;
            }
            next = lines.next() => match next {
                Some(Ok(line)) => {
                    let replies = session.handle_line(&line);
                    if replies.is_empty() || !link.is_connected() {
                        continue;
                    }
                    if let Err(e) = link.send_lines(&replies).await {
                        if link.is_connected() {
                            shared.status(format!("Send error: {e}"));
                        }
                        break;
                    }
                }
                Some(Err(e)) => {
                    if link.is_connected() {
                        shared.status(format!("Connection error: {e}"));
                    }
                    break;
                }
                None => {
                    tracing::debug!("server closed the connection");
                    break;
                }
            }
        }
    }

    link.close();
    link.writer.lock().await.take();
    shared.members.lock().clear_all();
    shared.activity.cancel_all();
    shared.status("Disconnected");
    ReaderExit::Ended
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Event;
    use tokio::sync::mpsc;

    fn engine() -> (Engine, mpsc::UnboundedReceiver<Event>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Engine::new(EngineConfig::default(), Arc::new(tx)), rx)
    }

    #[test]
    fn credentials_are_redacted() {
        assert_eq!(redacted("PASS hunter2"), "PASS");
        assert_eq!(redacted("authenticate AGFsaWNl"), "AUTHENTICATE");
        assert_eq!(redacted("AUTHENTICATE"), "AUTHENTICATE");
        assert_eq!(redacted("PRIVMSG #c :PASS me the salt"), "PRIVMSG #c :PASS me the salt");
    }

    #[tokio::test]
    async fn sends_while_disconnected_report_once_each() {
        let (engine, mut rx) = engine();
        engine.send_message("#c", "hi").await;
        engine.join_channel("c", None).await;
        engine.send_raw("PING x").await;
        for _ in 0..3 {
            assert_eq!(rx.try_recv().unwrap(), Event::status("Not connected."));
        }
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn closing_a_link_cancels_a_stuck_write() {
        // A tiny pipe whose far end is never read: the first big write blocks.
        let (near, _far) = tokio::io::duplex(64);
        let stream: Box<dyn IrcStream> = Box::new(near);
        let (_read, write) = tokio::io::split(stream);
        let link = Arc::new(Link::new(FramedWrite::new(write, LineCodec::new())));

        let pending = {
            let link = Arc::clone(&link);
            tokio::spawn(async move { link.send_lines(&["x".repeat(4096)]).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!pending.is_finished());

        link.close();
        let err = tokio::time::timeout(Duration::from_secs(5), pending)
            .await
            .expect("write still blocked after close")
            .unwrap()
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotConnected);
        assert!(!link.is_connected());
        // The writer is free again once the stuck write is gone.
        assert!(link.writer.try_lock().is_ok());
    }

    #[tokio::test]
    async fn disconnect_before_connect_is_a_noop() {
        let (engine, mut rx) = engine();
        engine.disconnect().await;
        engine.disconnect().await;
        assert!(!engine.is_connected());
        assert!(engine.channels().is_empty());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn apply_config_replaces_the_value() {
        let (engine, _rx) = engine();
        let mut config = engine.config();
        config.ctcp.ignore = true;
        config.autojoin = vec!["#perch".into()];
        engine.apply_config(config);
        assert!(engine.config().ctcp.ignore);
        assert_eq!(engine.config().autojoin, vec!["#perch"]);
    }
}
