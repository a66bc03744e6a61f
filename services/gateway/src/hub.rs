//! Process-wide subscription index and broadcast fan-out.
//!
//! The hub is a single event-loop task; every index mutation happens on
//! that task, so the maps need no locks. Callers talk to it through
//! [`HubHandle`]: control operations go over one bounded channel, broadcasts
//! over another so a burst of messages cannot starve (un)subscribes.
//! Queries reply over oneshot channels.
//!
//! Index invariant: `(sid, identifier, stream)` is present in `streams` iff
//! it is present in `sessions_streams`.

use gw_protocol::{Reply, StreamMessage, disconnect_reasons};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::session::{Session, close_codes};

/// One session-channel(-stream) subscription, the unit of work on the hub's
/// control channel.
#[derive(Debug, Clone)]
pub struct SubscriptionInfo {
    pub sid: String,
    pub stream: String,
    pub identifier: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HubSizes {
    pub sessions: usize,
    pub identifiers: usize,
    pub streams: usize,
}

enum HubCommand {
    Register(Arc<Session>),
    Remove(Arc<Session>),
    Subscribe(SubscriptionInfo),
    Unsubscribe {
        sid: String,
        identifier: String,
        stream: Option<String>,
    },
    RemoteDisconnect {
        identifier: String,
        reconnect: bool,
    },
    Lookup {
        identifier: String,
        reply: oneshot::Sender<Vec<Arc<Session>>>,
    },
    Sizes {
        reply: oneshot::Sender<HubSizes>,
    },
    Shutdown,
}

/// Cloneable handle to the hub task.
#[derive(Clone)]
pub struct HubHandle {
    control: mpsc::Sender<HubCommand>,
    broadcast: mpsc::Sender<StreamMessage>,
}

impl HubHandle {
    pub async fn register(&self, session: Arc<Session>) {
        let _ = self.control.send(HubCommand::Register(session)).await;
    }

    pub async fn remove(&self, session: Arc<Session>) {
        let _ = self.control.send(HubCommand::Remove(session)).await;
    }

    pub async fn subscribe(&self, info: SubscriptionInfo) {
        let _ = self.control.send(HubCommand::Subscribe(info)).await;
    }

    pub async fn unsubscribe(&self, sid: &str, identifier: &str, stream: Option<&str>) {
        let _ = self
            .control
            .send(HubCommand::Unsubscribe {
                sid: sid.to_owned(),
                identifier: identifier.to_owned(),
                stream: stream.map(str::to_owned),
            })
            .await;
    }

    /// Fan a stamped stream message out to every subscribed session.
    /// Producers block briefly when the broadcast buffer is full.
    pub async fn broadcast(&self, msg: StreamMessage) {
        let _ = self.broadcast.send(msg).await;
    }

    /// Deliver a remote disconnect to every session with these identifiers.
    pub async fn remote_disconnect(&self, identifier: &str, reconnect: bool) {
        let _ = self
            .control
            .send(HubCommand::RemoteDisconnect {
                identifier: identifier.to_owned(),
                reconnect,
            })
            .await;
    }

    pub async fn lookup(&self, identifier: &str) -> Vec<Arc<Session>> {
        let (tx, rx) = oneshot::channel();
        if self
            .control
            .send(HubCommand::Lookup {
                identifier: identifier.to_owned(),
                reply: tx,
            })
            .await
            .is_err()
        {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    pub async fn sizes(&self) -> HubSizes {
        let (tx, rx) = oneshot::channel();
        if self
            .control
            .send(HubCommand::Sizes { reply: tx })
            .await
            .is_err()
        {
            return HubSizes::default();
        }
        rx.await.unwrap_or_default()
    }

    pub async fn shutdown(&self) {
        let _ = self.control.send(HubCommand::Shutdown).await;
    }
}

pub struct Hub {
    control: mpsc::Receiver<HubCommand>,
    broadcast: mpsc::Receiver<StreamMessage>,

    /// sid -> session
    sessions: HashMap<String, Arc<Session>>,
    /// identifier key -> sids
    identifiers: HashMap<String, HashSet<String>>,
    /// stream -> sid -> channel identifiers
    streams: HashMap<String, HashMap<String, HashSet<String>>>,
    /// sid -> channel identifier -> streams
    sessions_streams: HashMap<String, HashMap<String, HashSet<String>>>,
}

impl Hub {
    /// `broadcast_buffer` bounds the broadcast channel; control operations
    /// use a fixed small buffer.
    pub fn new(broadcast_buffer: usize) -> (Hub, HubHandle) {
        let (control_tx, control_rx) = mpsc::channel(128);
        let (broadcast_tx, broadcast_rx) = mpsc::channel(broadcast_buffer.max(1));

        let hub = Hub {
            control: control_rx,
            broadcast: broadcast_rx,
            sessions: HashMap::new(),
            identifiers: HashMap::new(),
            streams: HashMap::new(),
            sessions_streams: HashMap::new(),
        };

        (
            hub,
            HubHandle {
                control: control_tx,
                broadcast: broadcast_tx,
            },
        )
    }

    /// The hub event loop. Runs until shutdown or until every handle drops.
    pub async fn run(mut self) {
        loop {
            tokio::select! {
                cmd = self.control.recv() => {
                    match cmd {
                        Some(HubCommand::Register(session)) => self.add_session(session),
                        Some(HubCommand::Remove(session)) => self.remove_session(&session),
                        Some(HubCommand::Subscribe(info)) => {
                            self.subscribe_session(&info.sid, &info.stream, &info.identifier);
                        }
                        Some(HubCommand::Unsubscribe { sid, identifier, stream }) => {
                            match stream {
                                Some(stream) => self.unsubscribe_session(&sid, &stream, &identifier),
                                None => self.unsubscribe_session_from_channel(&sid, &identifier),
                            }
                        }
                        Some(HubCommand::RemoteDisconnect { identifier, reconnect }) => {
                            self.disconnect_sessions(&identifier, reconnect);
                        }
                        Some(HubCommand::Lookup { identifier, reply }) => {
                            let _ = reply.send(self.lookup(&identifier));
                        }
                        Some(HubCommand::Sizes { reply }) => {
                            let _ = reply.send(HubSizes {
                                sessions: self.sessions.len(),
                                identifiers: self.identifiers.len(),
                                streams: self.streams.len(),
                            });
                        }
                        Some(HubCommand::Shutdown) | None => return,
                    }
                }
                msg = self.broadcast.recv() => {
                    match msg {
                        Some(msg) => self.broadcast_to_stream(&msg),
                        None => return,
                    }
                }
            }
        }
    }

    fn add_session(&mut self, session: Arc<Session>) {
        let sid = session.uid.clone();
        let identifiers = session.identifiers();

        self.identifiers
            .entry(identifiers.clone())
            .or_default()
            .insert(sid.clone());
        self.sessions.insert(sid.clone(), session);

        debug!(sid = %sid, identifiers = %identifiers, "registered");
    }

    fn remove_session(&mut self, session: &Arc<Session>) {
        let sid = &session.uid;

        if !self.sessions.contains_key(sid) {
            warn!(sid = %sid, "session hasn't been registered");
            return;
        }

        self.unsubscribe_session_from_all_channels(sid);

        let session = self.sessions.remove(sid);
        if let Some(session) = session {
            let identifiers = session.identifiers();
            if let Some(sids) = self.identifiers.get_mut(&identifiers) {
                sids.remove(sid);
                if sids.is_empty() {
                    self.identifiers.remove(&identifiers);
                }
            }
        }

        debug!(sid = %sid, "unregistered");
    }

    fn unsubscribe_session_from_all_channels(&mut self, sid: &str) {
        let channels: Vec<String> = self
            .sessions_streams
            .get(sid)
            .map(|by_channel| by_channel.keys().cloned().collect())
            .unwrap_or_default();

        for channel in channels {
            self.unsubscribe_session_from_channel(sid, &channel);
        }

        self.sessions_streams.remove(sid);
    }

    fn unsubscribe_session_from_channel(&mut self, sid: &str, identifier: &str) {
        let Some(by_channel) = self.sessions_streams.get_mut(sid) else {
            return;
        };
        let Some(streams) = by_channel.remove(identifier) else {
            debug!(sid = %sid, channel = %identifier, "not subscribed");
            return;
        };
        if by_channel.is_empty() {
            self.sessions_streams.remove(sid);
        }

        for stream in streams {
            self.drop_stream_entry(&stream, sid, identifier);
        }

        debug!(sid = %sid, channel = %identifier, "unsubscribed");
    }

    fn subscribe_session(&mut self, sid: &str, stream: &str, identifier: &str) {
        self.streams
            .entry(stream.to_owned())
            .or_default()
            .entry(sid.to_owned())
            .or_default()
            .insert(identifier.to_owned());

        self.sessions_streams
            .entry(sid.to_owned())
            .or_default()
            .entry(identifier.to_owned())
            .or_default()
            .insert(stream.to_owned());

        debug!(sid = %sid, channel = %identifier, stream = %stream, "subscribed");
    }

    fn unsubscribe_session(&mut self, sid: &str, stream: &str, identifier: &str) {
        let present = self
            .streams
            .get(stream)
            .and_then(|by_sid| by_sid.get(sid))
            .is_some_and(|ids| ids.contains(identifier));
        if !present {
            debug!(sid = %sid, channel = %identifier, stream = %stream, "not subscribed");
            return;
        }

        self.drop_stream_entry(stream, sid, identifier);

        if let Some(by_channel) = self.sessions_streams.get_mut(sid) {
            if let Some(streams) = by_channel.get_mut(identifier) {
                streams.remove(stream);
                if streams.is_empty() {
                    by_channel.remove(identifier);
                }
            }
            if by_channel.is_empty() {
                self.sessions_streams.remove(sid);
            }
        }

        debug!(sid = %sid, channel = %identifier, stream = %stream, "unsubscribed");
    }

    fn drop_stream_entry(&mut self, stream: &str, sid: &str, identifier: &str) {
        let Some(by_sid) = self.streams.get_mut(stream) else {
            return;
        };
        if let Some(ids) = by_sid.get_mut(sid) {
            ids.remove(identifier);
            if ids.is_empty() {
                by_sid.remove(sid);
            }
        }
        if by_sid.is_empty() {
            self.streams.remove(stream);
        }
    }

    fn broadcast_to_stream(&mut self, msg: &StreamMessage) {
        let Some(by_sid) = self.streams.get(&msg.stream) else {
            debug!(stream = %msg.stream, "no sessions");
            return;
        };

        // Encode once per (dialect, identifier); N subscribers under the
        // same channel identifier pay a single encode.
        let mut encoded: HashMap<(&'static str, String), Arc<Vec<u8>>> = HashMap::new();

        for (sid, ids) in by_sid {
            let Some(session) = self.sessions.get(sid) else {
                continue;
            };

            for identifier in ids {
                let key = (session.encoder().name(), identifier.clone());
                let frame = match encoded.get(&key) {
                    Some(frame) => frame.clone(),
                    None => {
                        let reply = Reply::stream(identifier, msg);
                        match session.encoder().encode(&reply) {
                            Ok(bytes) => {
                                let frame = Arc::new(bytes);
                                encoded.insert(key, frame.clone());
                                frame
                            }
                            Err(e) => {
                                warn!(stream = %msg.stream, error = %e, "failed to encode broadcast");
                                continue;
                            }
                        }
                    }
                };
                session.send(frame.as_ref().clone());
            }
        }
    }

    fn disconnect_sessions(&mut self, identifier: &str, reconnect: bool) {
        let Some(sids) = self.identifiers.get(identifier) else {
            debug!(identifier = %identifier, "can not disconnect sessions: unknown identifier");
            return;
        };

        let reply = Reply::disconnect(disconnect_reasons::REMOTE, reconnect);

        for sid in sids.clone() {
            if let Some(session) = self.sessions.get(&sid) {
                session.send_reply(&reply);
                session.disconnect("Closed remotely", close_codes::NORMAL);
            }
        }
    }

    fn lookup(&self, identifier: &str) -> Vec<Arc<Session>> {
        self.identifiers
            .get(identifier)
            .map(|sids| {
                sids.iter()
                    .filter_map(|sid| self.sessions.get(sid).cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    #[cfg(test)]
    fn is_consistent(&self) -> bool {
        for (stream, by_sid) in &self.streams {
            for (sid, ids) in by_sid {
                for id in ids {
                    let mirrored = self
                        .sessions_streams
                        .get(sid)
                        .and_then(|by_channel| by_channel.get(id))
                        .is_some_and(|streams| streams.contains(stream));
                    if !mirrored {
                        return false;
                    }
                }
            }
        }
        for (sid, by_channel) in &self.sessions_streams {
            for (id, streams) in by_channel {
                for stream in streams {
                    let mirrored = self
                        .streams
                        .get(stream)
                        .and_then(|by_sid| by_sid.get(sid))
                        .is_some_and(|ids| ids.contains(id));
                    if !mirrored {
                        return false;
                    }
                }
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoder::JsonEncoder;
    use crate::session::{Conn, ConnError, NoopHooks, SessionOptions};
    use gw_protocol::SessionEnv;
    use std::sync::Mutex;
    use std::time::Duration;

    struct SinkConn {
        frames: Mutex<Vec<String>>,
    }

    impl SinkConn {
        fn new() -> Arc<Self> {
            Arc::new(SinkConn {
                frames: Mutex::new(Vec::new()),
            })
        }

        fn frames(&self) -> Vec<String> {
            self.frames.lock().unwrap().clone()
        }
    }

    #[async_trait::async_trait]
    impl Conn for SinkConn {
        async fn write(&self, payload: Vec<u8>, _deadline: Duration) -> Result<(), ConnError> {
            self.frames
                .lock()
                .unwrap()
                .push(String::from_utf8_lossy(&payload).into_owned());
            Ok(())
        }

        async fn close(&self, _code: u16, _reason: &str) {}
    }

    fn make_session(sid: &str, identifiers: &str) -> (Arc<Session>, Arc<SinkConn>) {
        let conn = SinkConn::new();
        let session = Session::new(
            sid.to_owned(),
            conn.clone(),
            Arc::new(JsonEncoder),
            Arc::new(NoopHooks),
            SessionEnv::new("/cable", HashMap::new()),
            &SessionOptions {
                ping_interval: Duration::ZERO,
                ..SessionOptions::default()
            },
        );
        session.mark_connected(identifiers);
        (session, conn)
    }

    fn empty_hub() -> Hub {
        Hub::new(16).0
    }

    async fn drain() {
        // Give session writer tasks a chance to flush.
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    #[tokio::test]
    async fn register_and_remove_maintain_identifier_index() {
        let mut hub = empty_hub();
        let (s1, _) = make_session("1", "u:1");
        let (s2, _) = make_session("2", "u:1");

        hub.add_session(s1.clone());
        hub.add_session(s2.clone());
        assert_eq!(hub.sessions.len(), 2);
        assert_eq!(hub.identifiers.len(), 1);
        assert_eq!(hub.identifiers["u:1"].len(), 2);

        hub.remove_session(&s1);
        assert_eq!(hub.identifiers["u:1"].len(), 1);

        hub.remove_session(&s2);
        assert!(hub.identifiers.is_empty());
        assert!(hub.sessions.is_empty());
    }

    #[tokio::test]
    async fn subscribe_then_unsubscribe_restores_prior_state() {
        let mut hub = empty_hub();
        let (s1, _) = make_session("1", "u:1");
        hub.add_session(s1);

        hub.subscribe_session("1", "messages_1", "chat_1");
        assert!(hub.is_consistent());
        assert_eq!(hub.streams.len(), 1);

        hub.unsubscribe_session("1", "messages_1", "chat_1");
        assert!(hub.is_consistent());
        assert!(hub.streams.is_empty());
        assert!(hub.sessions_streams.is_empty());
    }

    #[tokio::test]
    async fn unsubscribe_without_stream_drops_every_stream_of_the_channel() {
        let mut hub = empty_hub();
        let (s1, _) = make_session("1", "u:1");
        hub.add_session(s1);

        hub.subscribe_session("1", "a", "chat_1");
        hub.subscribe_session("1", "b", "chat_1");
        hub.subscribe_session("1", "c", "other_1");

        hub.unsubscribe_session_from_channel("1", "chat_1");
        assert!(hub.is_consistent());
        assert!(!hub.streams.contains_key("a"));
        assert!(!hub.streams.contains_key("b"));
        assert!(hub.streams.contains_key("c"));
    }

    #[tokio::test]
    async fn remove_session_cascades_through_subscriptions() {
        let mut hub = empty_hub();
        let (s1, _) = make_session("1", "u:1");
        hub.add_session(s1.clone());
        hub.subscribe_session("1", "a", "chat_1");
        hub.subscribe_session("1", "b", "other_1");

        hub.remove_session(&s1);
        assert!(hub.is_consistent());
        assert!(hub.streams.is_empty());
        assert!(hub.sessions_streams.is_empty());
    }

    #[tokio::test]
    async fn ops_on_absent_entries_are_no_ops() {
        let mut hub = empty_hub();
        let (s1, _) = make_session("1", "u:1");

        hub.unsubscribe_session("1", "a", "chat_1");
        hub.unsubscribe_session_from_channel("1", "chat_1");
        hub.remove_session(&s1);
        hub.broadcast_to_stream(&StreamMessage::new("nowhere", "data"));
        assert!(hub.is_consistent());
    }

    #[tokio::test]
    async fn broadcast_reaches_every_subscriber_once_per_identifier() {
        let mut hub = empty_hub();
        let (s1, c1) = make_session("1", "u:1");
        let (s2, c2) = make_session("2", "u:2");
        hub.add_session(s1);
        hub.add_session(s2);

        hub.subscribe_session("1", "test", "test_channel");
        hub.subscribe_session("2", "test", "test_channel");

        let mut msg = StreamMessage::new("test", "\"abc123\"");
        msg.epoch = "e1".to_owned();
        msg.offset = 1;
        hub.broadcast_to_stream(&msg);
        drain().await;

        let expected =
            r#"{"identifier":"test_channel","message":"abc123","stream_id":"test","epoch":"e1","offset":1}"#;
        assert_eq!(c1.frames(), vec![expected]);
        assert_eq!(c2.frames(), vec![expected]);
    }

    #[tokio::test]
    async fn same_stream_under_two_channels_yields_two_frames() {
        let mut hub = empty_hub();
        let (s1, c1) = make_session("1", "u:1");
        hub.add_session(s1);

        hub.subscribe_session("1", "test", "chat_a");
        hub.subscribe_session("1", "test", "chat_b");

        hub.broadcast_to_stream(&StreamMessage::new("test", "1"));
        drain().await;

        let frames = c1.frames();
        assert_eq!(frames.len(), 2);
        assert!(frames.iter().any(|f| f.contains("chat_a")));
        assert!(frames.iter().any(|f| f.contains("chat_b")));
    }

    #[tokio::test]
    async fn remote_disconnect_closes_every_session_with_the_identifier() {
        let mut hub = empty_hub();
        let (s1, c1) = make_session("1", "u:1");
        let (s2, _c2) = make_session("2", "u:2");
        hub.add_session(s1.clone());
        hub.add_session(s2.clone());

        hub.disconnect_sessions("u:1", false);
        drain().await;

        assert!(s1.is_closed());
        assert!(!s2.is_closed());
        assert!(
            c1.frames()
                .iter()
                .any(|f| f == r#"{"type":"disconnect","reason":"remote","reconnect":false}"#)
        );
    }

    #[tokio::test]
    async fn slow_session_does_not_stall_the_fanout() {
        let mut hub = empty_hub();

        // A session whose queue is already saturated.
        struct StallConn;
        #[async_trait::async_trait]
        impl Conn for StallConn {
            async fn write(&self, _payload: Vec<u8>, _deadline: Duration) -> Result<(), ConnError> {
                std::future::pending::<()>().await;
                unreachable!()
            }
            async fn close(&self, _code: u16, _reason: &str) {}
        }
        let slow = Session::new(
            "slow".to_owned(),
            Arc::new(StallConn),
            Arc::new(JsonEncoder),
            Arc::new(NoopHooks),
            SessionEnv::new("/cable", HashMap::new()),
            &SessionOptions {
                send_buffer: 1,
                ping_interval: Duration::ZERO,
                ..SessionOptions::default()
            },
        );
        slow.mark_connected("u:slow");
        let (fast, fast_conn) = make_session("fast", "u:fast");

        hub.add_session(slow.clone());
        hub.add_session(fast);
        hub.subscribe_session("slow", "test", "ch");
        hub.subscribe_session("fast", "test", "ch");
        tokio::task::yield_now().await;

        for i in 0..4 {
            hub.broadcast_to_stream(&StreamMessage::new("test", &i.to_string()));
        }
        drain().await;

        assert!(slow.is_closed(), "slow consumer must be dropped");
        assert_eq!(fast_conn.frames().len(), 4);
    }

    #[tokio::test]
    async fn handle_round_trip_through_the_event_loop() {
        let (hub, handle) = Hub::new(16);
        tokio::spawn(hub.run());

        let (s1, c1) = make_session("1", "u:1");
        handle.register(s1.clone()).await;
        handle
            .subscribe(SubscriptionInfo {
                sid: "1".to_owned(),
                stream: "test".to_owned(),
                identifier: "ch".to_owned(),
            })
            .await;

        let sizes = handle.sizes().await;
        assert_eq!(sizes.sessions, 1);
        assert_eq!(sizes.streams, 1);

        handle.broadcast(StreamMessage::new("test", "41")).await;
        drain().await;
        assert_eq!(c1.frames(), vec![r#"{"identifier":"ch","message":41,"stream_id":"test"}"#]);

        let found = handle.lookup("u:1").await;
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].uid, "1");

        handle.remove(s1).await;
        assert_eq!(handle.sizes().await.sessions, 0);

        handle.shutdown().await;
    }
}
