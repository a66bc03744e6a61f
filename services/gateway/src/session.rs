//! Per-connection session state.
//!
//! A session owns one client connection for its whole lifetime: the bounded
//! send queue with its single writer task, the ping timer, the subscription
//! set and the RPC environment. All mutable state sits behind one mutex;
//! the writer task is the only place that touches the transport for output.
//!
//! Lifecycle: `Handshake -> Authenticated -> Closing -> Closed`. The closed
//! transition is one-way; `send` after close is a no-op.

use gw_protocol::{Reply, SessionEnv, SessionSnapshot, disconnect_reasons};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::encoder::Encoder;

/// WebSocket close codes used by the gateway.
pub mod close_codes {
    pub const NORMAL: u16 = 1000;
    pub const GOING_AWAY: u16 = 1001;
    pub const ABNORMAL: u16 = 1006;
    pub const INTERNAL_ERROR: u16 = 1011;
}

#[derive(Debug, thiserror::Error)]
pub enum ConnError {
    #[error("write failed: {0}")]
    Write(String),
    #[error("write timed out")]
    Timeout,
}

/// Transport adapter. Writes are serialized by the session's writer task;
/// implementations only need interior mutability for their own sink.
#[async_trait::async_trait]
pub trait Conn: Send + Sync {
    async fn write(&self, payload: Vec<u8>, deadline: Duration) -> Result<(), ConnError>;
    async fn close(&self, code: u16, reason: &str);
}

/// Hooks back into the orchestrator, invoked when a session goes away.
/// Split into a trait so sessions are testable without a full node.
pub trait SessionHooks: Send + Sync {
    /// Called exactly once per session, when an authenticated session
    /// disconnects. Implementations deregister the session and schedule the
    /// remote disconnect call.
    fn session_gone(&self, session: Arc<Session>);
}

/// A no-op hooks implementation for sessions that never registered.
pub struct NoopHooks;

impl SessionHooks for NoopHooks {
    fn session_gone(&self, _session: Arc<Session>) {}
}

enum SentFrame {
    Text(Vec<u8>),
    Close { code: u16, reason: String },
}

/// Ping timestamp precision, per config.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PingPrecision {
    #[default]
    Seconds,
    Millis,
    Nanos,
}

impl PingPrecision {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "s" => Some(PingPrecision::Seconds),
            "ms" => Some(PingPrecision::Millis),
            "ns" => Some(PingPrecision::Nanos),
            _ => None,
        }
    }

    fn now(self) -> serde_json::Value {
        let now = chrono::Utc::now();
        let ts = match self {
            PingPrecision::Seconds => now.timestamp(),
            PingPrecision::Millis => now.timestamp_millis(),
            PingPrecision::Nanos => now.timestamp_nanos_opt().unwrap_or_default(),
        };
        serde_json::Value::from(ts)
    }
}

/// Tunables handed to every new session.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub send_buffer: usize,
    pub write_timeout: Duration,
    pub ping_interval: Duration,
    pub ping_precision: PingPrecision,
    /// Zero disables pong supervision.
    pub pong_timeout: Duration,
}

impl Default for SessionOptions {
    fn default() -> Self {
        SessionOptions {
            send_buffer: 256,
            write_timeout: Duration::from_secs(10),
            ping_interval: Duration::from_secs(3),
            ping_precision: PingPrecision::Seconds,
            pong_timeout: Duration::ZERO,
        }
    }
}

struct SessionInner {
    env: SessionEnv,
    identifiers: String,
    /// channel identifier -> streams the channel is subscribed to
    subscriptions: HashMap<String, HashSet<String>>,
    send: Option<mpsc::Sender<SentFrame>>,
    connected: bool,
    closed: bool,
    ping: Option<JoinHandle<()>>,
    last_pong: Instant,
}

pub struct Session {
    pub uid: String,
    conn: Arc<dyn Conn>,
    encoder: Arc<dyn Encoder>,
    hooks: Arc<dyn SessionHooks>,
    write_timeout: Duration,
    inner: Mutex<SessionInner>,
}

impl Session {
    pub fn new(
        uid: String,
        conn: Arc<dyn Conn>,
        encoder: Arc<dyn Encoder>,
        hooks: Arc<dyn SessionHooks>,
        env: SessionEnv,
        opts: &SessionOptions,
    ) -> Arc<Self> {
        let (tx, rx) = mpsc::channel(opts.send_buffer.max(1));

        let session = Arc::new(Session {
            uid,
            conn: conn.clone(),
            encoder,
            hooks,
            write_timeout: opts.write_timeout,
            inner: Mutex::new(SessionInner {
                env,
                identifiers: String::new(),
                subscriptions: HashMap::new(),
                send: Some(tx),
                connected: false,
                closed: false,
                ping: None,
                last_pong: Instant::now(),
            }),
        });

        tokio::spawn(run_writer(
            conn,
            rx,
            opts.write_timeout,
            Arc::downgrade(&session),
        ));

        if !opts.ping_interval.is_zero() {
            let handle = tokio::spawn(run_pinger(
                Arc::downgrade(&session),
                opts.ping_interval,
                opts.ping_precision,
                opts.pong_timeout,
            ));
            session.inner.lock().unwrap().ping = Some(handle);
        }

        session
    }

    pub fn encoder(&self) -> &Arc<dyn Encoder> {
        &self.encoder
    }

    // -- outbound ----------------------------------------------------------

    /// Enqueue an encoded frame. A full queue means the consumer cannot keep
    /// up; the session is closed with an abnormal-closure code.
    pub fn send(self: &Arc<Self>, payload: Vec<u8>) {
        self.send_frame(SentFrame::Text(payload));
    }

    /// Encode and enqueue a reply frame.
    pub fn send_reply(self: &Arc<Self>, reply: &Reply) {
        match self.encoder.encode(reply) {
            Ok(payload) => self.send(payload),
            Err(e) => warn!(sid = %self.uid, error = %e, "failed to encode reply"),
        }
    }

    /// Encode and enqueue a verbatim transmission from the command server.
    pub fn transmit(self: &Arc<Self>, raw: &str) {
        match self.encoder.encode_transmission(raw) {
            Ok(payload) => self.send(payload),
            Err(e) => warn!(sid = %self.uid, error = %e, "failed to encode transmission"),
        }
    }

    fn send_frame(self: &Arc<Self>, frame: SentFrame) {
        let overflow = {
            let mut inner = self.inner.lock().unwrap();
            let Some(tx) = inner.send.as_ref() else {
                return;
            };
            match tx.try_send(frame) {
                Ok(()) => false,
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    inner.send = None;
                    false
                }
                Err(mpsc::error::TrySendError::Full(_)) => {
                    // Slow consumer: drop the queue and close the session.
                    inner.send = None;
                    true
                }
            }
        };

        if overflow {
            debug!(sid = %self.uid, "send queue overflow");
            self.disconnect("Write failed", close_codes::ABNORMAL);
        }
    }

    // -- lifecycle ---------------------------------------------------------

    /// Idempotent: schedules the remote disconnect call (once, and only for
    /// sessions that reached Authenticated) and closes the transport.
    pub fn disconnect(self: &Arc<Self>, reason: &str, code: u16) {
        let was_connected = {
            let mut inner = self.inner.lock().unwrap();
            std::mem::replace(&mut inner.connected, false)
        };

        if was_connected {
            self.hooks.session_gone(self.clone());
        }

        self.close(reason, code);
    }

    /// Close the transport. Pending frames drain through the writer task
    /// (each bounded by the write deadline) before the close frame goes out.
    pub fn close(self: &Arc<Self>, reason: &str, code: u16) {
        let (sender, ping) = {
            let mut inner = self.inner.lock().unwrap();
            if inner.closed {
                return;
            }
            inner.closed = true;
            (inner.send.take(), inner.ping.take())
        };

        if let Some(handle) = ping {
            handle.abort();
        }

        let enqueued = sender.is_some_and(|tx| {
            tx.try_send(SentFrame::Close {
                code,
                reason: reason.to_owned(),
            })
            .is_ok()
        });

        if !enqueued {
            // The queue was gone or full; close the transport directly.
            let conn = self.conn.clone();
            let reason = reason.to_owned();
            tokio::spawn(async move { conn.close(code, &reason).await });
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().unwrap().closed
    }

    pub fn is_connected(&self) -> bool {
        self.inner.lock().unwrap().connected
    }

    /// Marks the Handshake -> Authenticated transition.
    pub fn mark_connected(&self, identifiers: &str) {
        let mut inner = self.inner.lock().unwrap();
        inner.connected = true;
        inner.identifiers = identifiers.to_owned();
    }

    pub fn handle_pong(&self) {
        self.inner.lock().unwrap().last_pong = Instant::now();
    }

    // -- identity & environment -------------------------------------------

    pub fn identifiers(&self) -> String {
        self.inner.lock().unwrap().identifiers.clone()
    }

    pub fn env_snapshot(&self) -> SessionEnv {
        self.inner.lock().unwrap().env.clone()
    }

    pub fn merge_cstate(&self, delta: &HashMap<String, String>) {
        self.inner.lock().unwrap().env.merge_cstate(delta);
    }

    pub fn merge_istate(&self, identifier: &str, delta: &HashMap<String, String>) {
        self.inner.lock().unwrap().env.merge_istate(identifier, delta);
    }

    pub fn remove_istate(&self, identifier: &str) {
        self.inner.lock().unwrap().env.remove_istate(identifier);
    }

    // -- subscriptions -----------------------------------------------------

    pub fn has_subscription(&self, identifier: &str) -> bool {
        self.inner
            .lock()
            .unwrap()
            .subscriptions
            .contains_key(identifier)
    }

    pub fn add_subscription(&self, identifier: &str) {
        self.inner
            .lock()
            .unwrap()
            .subscriptions
            .entry(identifier.to_owned())
            .or_default();
    }

    /// Removes the channel and returns the streams it was subscribed to.
    pub fn remove_subscription(&self, identifier: &str) -> Vec<String> {
        self.inner
            .lock()
            .unwrap()
            .subscriptions
            .remove(identifier)
            .map(|streams| streams.into_iter().collect())
            .unwrap_or_default()
    }

    pub fn add_stream(&self, identifier: &str, stream: &str) {
        self.inner
            .lock()
            .unwrap()
            .subscriptions
            .entry(identifier.to_owned())
            .or_default()
            .insert(stream.to_owned());
    }

    pub fn remove_stream(&self, identifier: &str, stream: &str) {
        if let Some(streams) = self.inner.lock().unwrap().subscriptions.get_mut(identifier) {
            streams.remove(stream);
        }
    }

    /// Drops every stream of the channel but keeps the subscription.
    pub fn clear_streams(&self, identifier: &str) -> Vec<String> {
        self.inner
            .lock()
            .unwrap()
            .subscriptions
            .get_mut(identifier)
            .map(|streams| streams.drain().collect())
            .unwrap_or_default()
    }

    pub fn streams_for(&self, identifier: &str) -> Vec<String> {
        self.inner
            .lock()
            .unwrap()
            .subscriptions
            .get(identifier)
            .map(|streams| {
                let mut list: Vec<String> = streams.iter().cloned().collect();
                list.sort();
                list
            })
            .unwrap_or_default()
    }

    pub fn subscriptions_list(&self) -> Vec<String> {
        self.inner
            .lock()
            .unwrap()
            .subscriptions
            .keys()
            .cloned()
            .collect()
    }

    /// Serializable state for the broker's reconnect cache.
    pub fn snapshot(&self) -> SessionSnapshot {
        let inner = self.inner.lock().unwrap();
        SessionSnapshot {
            identifiers: inner.identifiers.clone(),
            subscriptions: inner
                .subscriptions
                .iter()
                .map(|(id, streams)| (id.clone(), streams.iter().cloned().collect()))
                .collect(),
            cstate: inner.env.cstate.clone(),
            istate: inner.env.istate.clone(),
        }
    }

    /// Reinstates state from a cached snapshot (reconnect with a prior sid).
    pub fn restore(&self, snapshot: &SessionSnapshot) {
        let mut inner = self.inner.lock().unwrap();
        inner.identifiers = snapshot.identifiers.clone();
        inner.subscriptions = snapshot
            .subscriptions
            .iter()
            .map(|(id, streams)| (id.clone(), streams.iter().cloned().collect()))
            .collect();
        inner.env.cstate = snapshot.cstate.clone();
        inner.env.istate = snapshot.istate.clone();
    }
}

/// The single writer task: drains the send queue until the channel closes,
/// a close frame goes out, or a write fails.
async fn run_writer(
    conn: Arc<dyn Conn>,
    mut rx: mpsc::Receiver<SentFrame>,
    write_timeout: Duration,
    session: Weak<Session>,
) {
    while let Some(frame) = rx.recv().await {
        match frame {
            SentFrame::Text(payload) => {
                if let Err(e) = conn.write(payload, write_timeout).await {
                    if let Some(session) = session.upgrade() {
                        debug!(sid = %session.uid, error = %e, "write failed");
                        session.disconnect("Write failed", close_codes::ABNORMAL);
                    }
                    // The close frame enqueued by disconnect dies with this
                    // task's receiver; close the transport here instead.
                    conn.close(close_codes::ABNORMAL, "Write failed").await;
                    return;
                }
            }
            SentFrame::Close { code, reason } => {
                conn.close(code, &reason).await;
                return;
            }
        }
    }
}

/// Fires a ping per interval and, when pong supervision is on, closes
/// sessions whose client went quiet.
async fn run_pinger(
    session: Weak<Session>,
    interval: Duration,
    precision: PingPrecision,
    pong_timeout: Duration,
) {
    loop {
        tokio::time::sleep(interval).await;

        let Some(session) = session.upgrade() else {
            return;
        };
        if session.is_closed() {
            return;
        }

        if !pong_timeout.is_zero() {
            let last_pong = session.inner.lock().unwrap().last_pong;
            if last_pong.elapsed() > pong_timeout {
                session.send_reply(&Reply::disconnect(disconnect_reasons::NO_PONG, true));
                session.disconnect("No pong", close_codes::ABNORMAL);
                return;
            }
        }

        session.send_reply(&Reply::ping(precision.now()));
    }
}
