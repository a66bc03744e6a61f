//! The orchestrator.
//!
//! The node is the only place where command server results meet their side
//! effects: hub (un)subscribes, session state merges, transmissions,
//! broadcasts and disconnects. Transports hand it decoded frames; the
//! subscriber hands it raw bus payloads. There is no global state — the
//! composition root builds one `Node` and passes it around.

use gw_protocol::{
    Command, CommandResult, HistoryRequest, Message, PubSubMessage, RemoteCommandMessage, Reply,
    SessionSnapshot, Status, StreamMessage, decode_pubsub, disconnect_reasons,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::auth::{self, AuthConfig, Identification};
use crate::broker::{Broker, BrokerError};
use crate::controller::{Controller, ControllerError};
use crate::disconnector::{DisconnectQueue, DisconnectTask};
use crate::hub::{HubHandle, SubscriptionInfo};
use crate::pubsub::Subscriber;
use crate::session::{Session, SessionHooks, close_codes};

pub struct Node {
    hub: HubHandle,
    broker: Arc<dyn Broker>,
    controller: Arc<dyn Controller>,
    disconnector: Arc<DisconnectQueue>,
    subscriber: Arc<dyn Subscriber>,
    auth: AuthConfig,
    shutdown: watch::Sender<bool>,
}

impl Node {
    pub fn new(
        hub: HubHandle,
        broker: Arc<dyn Broker>,
        controller: Arc<dyn Controller>,
        disconnector: Arc<DisconnectQueue>,
        subscriber: Arc<dyn Subscriber>,
        auth: AuthConfig,
    ) -> Arc<Self> {
        let (shutdown, _) = watch::channel(false);
        Arc::new(Node {
            hub,
            broker,
            controller,
            disconnector,
            subscriber,
            auth,
            shutdown,
        })
    }

    pub fn hub(&self) -> &HubHandle {
        &self.hub
    }

    pub fn broker(&self) -> &Arc<dyn Broker> {
        &self.broker
    }

    /// Log hub occupancy every `interval`; stops on node shutdown.
    pub fn spawn_stats_loop(self: &Arc<Self>, interval: Duration) {
        if interval.is_zero() {
            return;
        }
        let node = self.clone();
        let mut shutdown = self.shutdown.subscribe();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(interval);
            tick.tick().await;
            loop {
                tokio::select! {
                    _ = tick.tick() => {
                        let sizes = node.hub.sizes().await;
                        info!(
                            clients = sizes.sessions,
                            uniq_clients = sizes.identifiers,
                            streams = sizes.streams,
                            "stats"
                        );
                    }
                    _ = shutdown.changed() => return,
                }
            }
        });
    }

    // -- connection lifecycle ----------------------------------------------

    /// Restore a reconnecting session from the broker cache, or fall back
    /// to regular authentication.
    pub async fn restore_or_authenticate(
        self: &Arc<Self>,
        session: &Arc<Session>,
        prev_sid: Option<&str>,
    ) -> Result<(), ControllerError> {
        if let Some(prev_sid) = prev_sid {
            match self.broker.restore_session(prev_sid).await {
                Ok(Some(blob)) => match SessionSnapshot::from_bytes(&blob) {
                    Ok(snapshot) => {
                        self.restore(session, &snapshot).await;
                        return Ok(());
                    }
                    Err(e) => {
                        warn!(sid = %session.uid, error = %e, "undecodable session snapshot");
                    }
                },
                Ok(None) => {
                    debug!(sid = %session.uid, prev_sid = %prev_sid, "no session to restore");
                }
                Err(e) => {
                    warn!(sid = %session.uid, error = %e, "session restore failed");
                }
            }
        }

        self.authenticate(session).await
    }

    async fn restore(self: &Arc<Self>, session: &Arc<Session>, snapshot: &SessionSnapshot) {
        session.restore(snapshot);
        session.mark_connected(&snapshot.identifiers);

        session.send_reply(&Reply::welcome(Some(&session.uid), true));
        self.hub.register(session.clone()).await;

        for (identifier, streams) in &snapshot.subscriptions {
            for stream in streams {
                self.subscribe_stream(&session.uid, stream, identifier).await;
            }
        }

        debug!(sid = %session.uid, "session restored");
    }

    /// Run the connect flow: JWT / skip-auth short-circuits first, the
    /// Connect RPC otherwise. Rejections transmit their goodbyes and close;
    /// only transport-level faults surface as errors.
    pub async fn authenticate(self: &Arc<Self>, session: &Arc<Session>) -> Result<(), ControllerError> {
        match auth::identify(&session.env_snapshot(), &self.auth) {
            Identification::Approved { identifiers } => {
                self.accept(session, &identifiers, &[Reply::welcome(Some(&session.uid), false).to_json()])
                    .await;
                Ok(())
            }
            Identification::Rejected => {
                session.send_reply(&Reply::disconnect(disconnect_reasons::UNAUTHORIZED, false));
                session.close("Auth failed", close_codes::NORMAL);
                Ok(())
            }
            Identification::Rpc => self.authenticate_rpc(session).await,
        }
    }

    async fn authenticate_rpc(
        self: &Arc<Self>,
        session: &Arc<Session>,
    ) -> Result<(), ControllerError> {
        let env = session.env_snapshot();
        match self.controller.connect(&session.uid, &env).await {
            Ok(res) if res.status == Status::Success => {
                session.merge_cstate(&res.cstate);
                for (identifier, delta) in &res.istate {
                    session.merge_istate(identifier, delta);
                }
                self.accept(session, &res.identifiers, &res.transmissions).await;
                for broadcast in res.broadcasts {
                    self.broadcast(broadcast).await;
                }
                Ok(())
            }
            Ok(res) => {
                debug!(sid = %session.uid, "authentication failed");
                for transmission in &res.transmissions {
                    session.transmit(transmission);
                }
                session.close("Auth failed", close_codes::NORMAL);
                Ok(())
            }
            Err(e) => {
                error!(sid = %session.uid, error = %e, "authentication error");
                let reply = match e {
                    ControllerError::Fatal(_) | ControllerError::Malformed(_) => {
                        Reply::disconnect(disconnect_reasons::UNAUTHORIZED, false)
                    }
                    _ => Reply::disconnect(disconnect_reasons::SERVER_RESTART, true),
                };
                session.send_reply(&reply);
                session.close("Auth error", close_codes::INTERNAL_ERROR);
                Err(e)
            }
        }
    }

    async fn accept(self: &Arc<Self>, session: &Arc<Session>, identifiers: &str, transmissions: &[String]) {
        session.mark_connected(identifiers);
        for transmission in transmissions {
            session.transmit(transmission);
        }
        self.hub.register(session.clone()).await;
    }

    // -- client commands ---------------------------------------------------

    /// Entry point for raw transport frames.
    pub async fn handle_command(self: &Arc<Self>, session: &Arc<Session>, frame: &[u8]) {
        let msg = match session.encoder().decode(frame) {
            Ok(msg) => msg,
            Err(e) => {
                debug!(sid = %session.uid, error = %e, "undecodable frame");
                return;
            }
        };

        if !session.is_connected()
            && !session
                .encoder()
                .unauthenticated_commands()
                .contains(&msg.command)
        {
            warn!(sid = %session.uid, command = ?msg.command, "command before authentication");
            return;
        }

        match msg.command {
            Command::Subscribe => self.subscribe(session, &msg).await,
            Command::Unsubscribe => self.unsubscribe(session, &msg).await,
            Command::Message => self.perform(session, &msg).await,
            Command::History => self.history(session, &msg).await,
            Command::Pong => session.handle_pong(),
        }
    }

    pub async fn subscribe(self: &Arc<Self>, session: &Arc<Session>, msg: &Message) {
        if session.has_subscription(&msg.identifier) {
            warn!(sid = %session.uid, channel = %msg.identifier, "already subscribed");
            return;
        }

        let env = session.env_snapshot();
        match self
            .controller
            .command(
                &session.uid,
                &env,
                Command::Subscribe.as_rpc_str(),
                &msg.identifier,
                &msg.data,
            )
            .await
        {
            Ok(res) => {
                if res.status == Status::Success {
                    session.add_subscription(&msg.identifier);
                }
                self.apply_command_result(session, &msg.identifier, res).await;

                if session.has_subscription(&msg.identifier) {
                    if let Some(history) = &msg.history {
                        if !history.is_empty() {
                            self.replay(session, &msg.identifier, history).await;
                        }
                    }
                }
            }
            Err(e) => {
                warn!(sid = %session.uid, channel = %msg.identifier, error = %e, "subscribe failed");
                session.send_reply(&Reply::reject_subscription(&msg.identifier));
            }
        }
    }

    pub async fn unsubscribe(self: &Arc<Self>, session: &Arc<Session>, msg: &Message) {
        if !session.has_subscription(&msg.identifier) {
            warn!(sid = %session.uid, channel = %msg.identifier, "unknown subscription");
            return;
        }

        let env = session.env_snapshot();
        match self
            .controller
            .command(
                &session.uid,
                &env,
                Command::Unsubscribe.as_rpc_str(),
                &msg.identifier,
                &msg.data,
            )
            .await
        {
            Ok(res) => {
                if res.status == Status::Success {
                    let streams = session.remove_subscription(&msg.identifier);
                    self.hub
                        .unsubscribe(&session.uid, &msg.identifier, None)
                        .await;
                    for stream in streams {
                        self.unsubscribe_stream(&stream).await;
                    }
                    session.remove_istate(&msg.identifier);
                }
                self.apply_command_result(session, &msg.identifier, res).await;
            }
            Err(e) => {
                warn!(sid = %session.uid, channel = %msg.identifier, error = %e, "unsubscribe failed");
            }
        }
    }

    pub async fn perform(self: &Arc<Self>, session: &Arc<Session>, msg: &Message) {
        if !session.has_subscription(&msg.identifier) {
            warn!(sid = %session.uid, channel = %msg.identifier, "unknown subscription");
            return;
        }

        let env = session.env_snapshot();
        match self
            .controller
            .command(
                &session.uid,
                &env,
                Command::Message.as_rpc_str(),
                &msg.identifier,
                &msg.data,
            )
            .await
        {
            Ok(res) => self.apply_command_result(session, &msg.identifier, res).await,
            Err(e) => {
                warn!(sid = %session.uid, channel = %msg.identifier, error = %e, "perform failed");
            }
        }
    }

    pub async fn history(self: &Arc<Self>, session: &Arc<Session>, msg: &Message) {
        if !session.has_subscription(&msg.identifier) {
            warn!(sid = %session.uid, channel = %msg.identifier, "unknown subscription");
            session.send_reply(&Reply::reject_history(&msg.identifier));
            return;
        }

        let empty = HistoryRequest::default();
        let request = msg.history.as_ref().unwrap_or(&empty);
        self.replay(session, &msg.identifier, request).await;
    }

    /// Fetch history for every stream of the channel, transmit entries in
    /// `(stream, offset)` order, then confirm. Any broker error rejects the
    /// whole request — clients decide between resubscribe and reconnect.
    async fn replay(
        self: &Arc<Self>,
        session: &Arc<Session>,
        identifier: &str,
        request: &HistoryRequest,
    ) {
        match self.fetch_history(session, identifier, request).await {
            Ok(mut entries) => {
                entries.sort_by(|a, b| a.stream.cmp(&b.stream).then(a.offset.cmp(&b.offset)));
                for entry in &entries {
                    session.send_reply(&Reply::stream(identifier, entry));
                }
                session.send_reply(&Reply::confirm_history(identifier));
            }
            Err(e) => {
                debug!(sid = %session.uid, channel = %identifier, error = %e, "history rejected");
                session.send_reply(&Reply::reject_history(identifier));
            }
        }
    }

    async fn fetch_history(
        &self,
        session: &Arc<Session>,
        identifier: &str,
        request: &HistoryRequest,
    ) -> Result<Vec<StreamMessage>, BrokerError> {
        let mut entries = Vec::new();
        for stream in session.streams_for(identifier) {
            let chunk = if let Some(position) = request.streams.get(&stream) {
                self.broker
                    .history_from(&stream, &position.epoch, position.offset)
                    .await?
            } else if let Some(since) = request.since {
                self.broker.history_since(&stream, since).await?
            } else {
                continue;
            };
            entries.extend(chunk);
        }
        Ok(entries)
    }

    async fn apply_command_result(
        self: &Arc<Self>,
        session: &Arc<Session>,
        identifier: &str,
        res: CommandResult,
    ) {
        if res.stop_streams {
            let streams = session.clear_streams(identifier);
            self.hub.unsubscribe(&session.uid, identifier, None).await;
            for stream in streams {
                self.unsubscribe_stream(&stream).await;
            }
        }

        for stream in &res.stopped_streams {
            session.remove_stream(identifier, stream);
            self.hub
                .unsubscribe(&session.uid, identifier, Some(stream))
                .await;
            self.unsubscribe_stream(stream).await;
        }

        for stream in &res.streams {
            session.add_stream(identifier, stream);
            self.subscribe_stream(&session.uid, stream, identifier).await;
        }

        session.merge_cstate(&res.cstate);
        if !res.istate.is_empty() {
            session.merge_istate(identifier, &res.istate);
        }

        for transmission in &res.transmissions {
            session.transmit(transmission);
        }

        for broadcast in res.broadcasts {
            self.broadcast(broadcast).await;
        }

        if res.disconnect {
            session.disconnect("Closed by the command server", close_codes::NORMAL);
        }
    }

    async fn subscribe_stream(&self, sid: &str, stream: &str, identifier: &str) {
        if self.broker.subscribe(stream).await {
            self.subscriber.subscribe(stream).await;
        }
        self.hub
            .subscribe(SubscriptionInfo {
                sid: sid.to_owned(),
                stream: stream.to_owned(),
                identifier: identifier.to_owned(),
            })
            .await;
    }

    async fn unsubscribe_stream(&self, stream: &str) {
        if self.broker.unsubscribe(stream).await {
            self.subscriber.unsubscribe(stream).await;
        }
    }

    // -- broadcasts and remote commands ------------------------------------

    /// Stamp-or-deliver: a message without an epoch goes to the broker for
    /// offset assignment; one that already carries its position (stamped by
    /// the broker on the publishing node) is delivered directly.
    pub async fn broadcast(&self, msg: StreamMessage) {
        debug!(stream = %msg.stream, "incoming broadcast");
        if msg.is_stamped() {
            self.broker.handle_stamped(&msg).await;
            self.hub.broadcast(msg).await;
        } else {
            self.broker.handle_broadcast(msg).await;
        }
    }

    /// Raw payloads from the pub/sub bus.
    pub async fn handle_pubsub(&self, raw: &[u8]) {
        match decode_pubsub(raw) {
            Ok(PubSubMessage::Stream(msg)) => self.broadcast(msg).await,
            Ok(PubSubMessage::Disconnect(cmd)) => {
                self.hub
                    .remote_disconnect(&cmd.identifier, cmd.reconnect)
                    .await;
            }
            Err(e) => {
                warn!(error = %e, "unable to decode pub/sub message");
            }
        }
    }

    pub async fn handle_remote_command(&self, msg: RemoteCommandMessage) {
        if msg.command == "disconnect" {
            match serde_json::from_value::<gw_protocol::RemoteDisconnectMessage>(msg.payload) {
                Ok(cmd) => {
                    self.hub
                        .remote_disconnect(&cmd.identifier, cmd.reconnect)
                        .await;
                }
                Err(e) => warn!(error = %e, "malformed remote disconnect"),
            }
        } else {
            warn!(command = %msg.command, "unknown remote command");
        }
    }

    pub async fn lookup_session(&self, identifier: &str) -> Option<Arc<Session>> {
        self.hub.lookup(identifier).await.into_iter().next()
    }

    // -- shutdown ----------------------------------------------------------

    /// Dependency-ordered teardown: broadcasts stop, the disconnect queue
    /// drains, then the broker and the bus close. Stopping the listener is
    /// the composition root's job before calling this.
    pub async fn shutdown(&self, timeout: Duration) {
        let _ = self.shutdown.send(true);
        self.hub.shutdown().await;
        self.disconnector.drain(timeout).await;
        self.broker.shutdown().await;
        self.subscriber.shutdown().await;
    }
}

impl SessionHooks for Node {
    /// An authenticated session went away: deregister, release broker
    /// interest, cache the snapshot for restore and queue the remote
    /// disconnect call.
    fn session_gone(&self, session: Arc<Session>) {
        let hub = self.hub.clone();
        let broker = self.broker.clone();
        let subscriber = self.subscriber.clone();
        let disconnector = self.disconnector.clone();

        tokio::spawn(async move {
            let snapshot = session.snapshot();

            hub.remove(session.clone()).await;

            for streams in snapshot.subscriptions.values() {
                for stream in streams {
                    if broker.unsubscribe(stream).await {
                        subscriber.unsubscribe(stream).await;
                    }
                }
            }

            if let Err(e) = broker
                .commit_session(&session.uid, snapshot.to_bytes())
                .await
            {
                debug!(sid = %session.uid, error = %e, "failed to cache session");
            }

            disconnector.enqueue(DisconnectTask {
                sid: session.uid.clone(),
                env: session.env_snapshot(),
                identifiers: snapshot.identifiers,
                subscriptions: snapshot.subscriptions.keys().cloned().collect(),
            });
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{BrokerConfig, Broadcaster, MemoryBroker};
    use crate::controller::MockController;
    use crate::disconnector::DisconnectorConfig;
    use crate::hub::Hub;
    use crate::pubsub::LocalSubscriber;
    use crate::testing::{TestConn, test_session};
    use gw_protocol::{CommandResult, ConnectResult};
    use std::collections::HashMap;

    fn build_node(controller: Arc<MockController>) -> Arc<Node> {
        let controller: Arc<dyn Controller> = controller;
        let (hub, handle) = Hub::new(64);
        tokio::spawn(hub.run());

        let broadcaster: Arc<dyn Broadcaster> = Arc::new(handle.clone());
        let broker = MemoryBroker::new(Some(broadcaster), BrokerConfig::default());
        let disconnector = DisconnectQueue::new(controller.clone(), &DisconnectorConfig::default());
        let subscriber = Arc::new(LocalSubscriber::new());

        Node::new(
            handle,
            broker,
            controller,
            disconnector,
            subscriber,
            AuthConfig::new(),
        )
    }

    async fn authenticated_session(
        node: &Arc<Node>,
        uid: &str,
        identifiers: &str,
    ) -> (Arc<Session>, Arc<TestConn>) {
        let (session, conn) = test_session(uid, "/cable", &[("id", identifiers)], node.clone());
        node.authenticate(&session).await.unwrap();
        conn.wait_frames(1).await;
        (session, conn)
    }

    fn subscription_result(streams: &[&str], identifier: &str) -> CommandResult {
        CommandResult {
            status: Status::Success,
            streams: streams.iter().map(|s| (*s).to_owned()).collect(),
            transmissions: vec![format!(
                r#"{{"type":"confirm_subscription","identifier":"{identifier}"}}"#
            )],
            ..CommandResult::default()
        }
    }

    async fn send(node: &Arc<Node>, session: &Arc<Session>, frame: &str) {
        node.handle_command(session, frame.as_bytes()).await;
    }

    #[tokio::test]
    async fn authenticate_success_transmits_welcome_and_registers() {
        let controller = Arc::new(MockController::new());
        let node = build_node(controller);

        let (session, conn) = test_session("1", "/cable", &[("id", "test_id")], node.clone());
        node.authenticate(&session).await.unwrap();

        let frames = conn.wait_frames(1).await;
        assert_eq!(frames, vec![r#"{"type":"welcome"}"#]);
        assert!(session.is_connected());
        assert_eq!(session.identifiers(), "test_id");
        assert_eq!(node.hub().sizes().await.sessions, 1);
    }

    #[tokio::test]
    async fn authenticate_failure_transmits_rejection_and_closes() {
        let controller = Arc::new(MockController::new());
        controller.on_connect(
            "/failure",
            Ok(ConnectResult {
                status: Status::Failure,
                transmissions: vec![
                    r#"{"type":"disconnect","reason":"unauthorized","reconnect":false}"#.to_owned(),
                ],
                ..ConnectResult::default()
            }),
        );
        let node = build_node(controller);

        let (session, conn) = test_session("1", "/failure", &[], node.clone());
        node.authenticate(&session).await.unwrap();

        let frames = conn.wait_frames(1).await;
        assert_eq!(
            frames,
            vec![r#"{"type":"disconnect","reason":"unauthorized","reconnect":false}"#]
        );
        assert!(session.is_closed());
        assert_eq!(node.hub().sizes().await.sessions, 0);
    }

    #[tokio::test]
    async fn authenticate_error_surfaces_and_closes() {
        let controller = Arc::new(MockController::new());
        controller.on_connect(
            "/error",
            Err(ControllerError::Fatal("boom".to_owned())),
        );
        let node = build_node(controller);

        let (session, conn) = test_session("1", "/error", &[], node.clone());
        let result = node.authenticate(&session).await;

        assert!(result.is_err());
        let frames = conn.wait_frames(1).await;
        assert_eq!(
            frames,
            vec![r#"{"type":"disconnect","reason":"unauthorized","reconnect":false}"#]
        );
        assert!(session.is_closed());
        assert_eq!(node.hub().sizes().await.sessions, 0);
    }

    #[tokio::test]
    async fn subscribe_confirms_then_streams_deliver_in_order() {
        let controller = Arc::new(MockController::new());
        controller.on_command(
            "subscribe",
            "chat_1",
            Ok(subscription_result(&["messages_1"], "chat_1")),
        );
        let node = build_node(controller);
        let (session, conn) = authenticated_session(&node, "1", "u:1").await;

        send(&node, &session, r#"{"command":"subscribe","identifier":"chat_1"}"#).await;
        conn.wait_frames(2).await;

        node.handle_pubsub(br#"{"stream":"messages_1","data":"hi"}"#).await;
        let frames = conn.wait_frames(3).await;

        let epoch = node.broker().epoch();
        assert_eq!(
            frames[1],
            r#"{"type":"confirm_subscription","identifier":"chat_1"}"#
        );
        assert_eq!(
            frames[2],
            format!(
                r#"{{"identifier":"chat_1","message":"hi","stream_id":"messages_1","epoch":"{epoch}","offset":1}}"#
            )
        );
    }

    #[tokio::test]
    async fn duplicate_subscribe_is_ignored() {
        let controller = Arc::new(MockController::new());
        controller.on_command(
            "subscribe",
            "chat_1",
            Ok(subscription_result(&[], "chat_1")),
        );
        let node = build_node(controller);
        let (session, conn) = authenticated_session(&node, "1", "u:1").await;

        send(&node, &session, r#"{"command":"subscribe","identifier":"chat_1"}"#).await;
        let before = conn.wait_frames(2).await.len();

        send(&node, &session, r#"{"command":"subscribe","identifier":"chat_1"}"#).await;
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(conn.frames().len(), before);
    }

    #[tokio::test]
    async fn rejected_subscription_leaves_no_state() {
        let controller = Arc::new(MockController::new());
        controller.on_command(
            "subscribe",
            "secret",
            Ok(CommandResult {
                status: Status::Failure,
                transmissions: vec![
                    r#"{"type":"reject_subscription","identifier":"secret"}"#.to_owned(),
                ],
                ..CommandResult::default()
            }),
        );
        let node = build_node(controller);
        let (session, conn) = authenticated_session(&node, "1", "u:1").await;

        send(&node, &session, r#"{"command":"subscribe","identifier":"secret"}"#).await;
        let frames = conn.wait_frames(2).await;

        assert_eq!(frames[1], r#"{"type":"reject_subscription","identifier":"secret"}"#);
        assert!(!session.has_subscription("secret"));
    }

    #[tokio::test]
    async fn transient_subscribe_error_rejects_the_subscription() {
        let controller = Arc::new(MockController::new());
        controller.on_command(
            "subscribe",
            "chat_1",
            Err(ControllerError::Fatal("broken".to_owned())),
        );
        let node = build_node(controller);
        let (session, conn) = authenticated_session(&node, "1", "u:1").await;

        send(&node, &session, r#"{"command":"subscribe","identifier":"chat_1"}"#).await;
        let frames = conn.wait_frames(2).await;
        assert_eq!(frames[1], r#"{"type":"reject_subscription","identifier":"chat_1"}"#);
    }

    #[tokio::test]
    async fn unsubscribe_stops_deliveries() {
        let controller = Arc::new(MockController::new());
        controller.on_command(
            "subscribe",
            "chat_1",
            Ok(subscription_result(&["messages_1"], "chat_1")),
        );
        let node = build_node(controller);
        let (session, conn) = authenticated_session(&node, "1", "u:1").await;

        send(&node, &session, r#"{"command":"subscribe","identifier":"chat_1"}"#).await;
        conn.wait_frames(2).await;

        node.broadcast(StreamMessage::new("messages_1", "\"before\"")).await;
        conn.wait_frames(3).await;

        send(&node, &session, r#"{"command":"unsubscribe","identifier":"chat_1"}"#).await;
        tokio::time::sleep(Duration::from_millis(30)).await;

        node.broadcast(StreamMessage::new("messages_1", "\"after\"")).await;
        tokio::time::sleep(Duration::from_millis(30)).await;

        let frames = conn.frames();
        assert!(!session.has_subscription("chat_1"));
        assert!(frames.iter().any(|f| f.contains("before")));
        assert!(!frames.iter().any(|f| f.contains("after")));
    }

    #[tokio::test]
    async fn perform_merges_connection_and_channel_state() {
        let controller = Arc::new(MockController::new());
        controller.on_command("subscribe", "chat_1", Ok(subscription_result(&[], "chat_1")));
        controller.on_command(
            "message",
            "chat_1",
            Ok(CommandResult {
                status: Status::Success,
                cstate: HashMap::from([("_s_".to_owned(), "performed".to_owned())]),
                istate: HashMap::from([("room".to_owned(), "42".to_owned())]),
                transmissions: vec![r#"{"identifier":"chat_1","message":"done"}"#.to_owned()],
                ..CommandResult::default()
            }),
        );
        let node = build_node(controller);
        let (session, conn) = authenticated_session(&node, "1", "u:1").await;

        send(&node, &session, r#"{"command":"subscribe","identifier":"chat_1"}"#).await;
        send(
            &node,
            &session,
            r#"{"command":"message","identifier":"chat_1","data":"{\"action\":\"go\"}"}"#,
        )
        .await;
        conn.wait_frames(3).await;

        let env = session.env_snapshot();
        assert_eq!(env.cstate["_s_"], "performed");
        assert_eq!(env.channel_state("chat_1").unwrap()["room"], "42");
    }

    #[tokio::test]
    async fn stop_streams_cuts_the_fanout() {
        let controller = Arc::new(MockController::new());
        controller.on_command(
            "subscribe",
            "chat_1",
            Ok(subscription_result(&["updates"], "chat_1")),
        );
        controller.on_command(
            "message",
            "chat_1",
            Ok(CommandResult {
                status: Status::Success,
                stop_streams: true,
                ..CommandResult::default()
            }),
        );
        let node = build_node(controller);
        let (session, conn) = authenticated_session(&node, "1", "u:1").await;

        send(&node, &session, r#"{"command":"subscribe","identifier":"chat_1"}"#).await;
        conn.wait_frames(2).await;
        node.broadcast(StreamMessage::new("updates", "\"one\"")).await;
        conn.wait_frames(3).await;

        send(
            &node,
            &session,
            r#"{"command":"message","identifier":"chat_1","data":"stop"}"#,
        )
        .await;
        tokio::time::sleep(Duration::from_millis(30)).await;

        node.broadcast(StreamMessage::new("updates", "\"two\"")).await;
        tokio::time::sleep(Duration::from_millis(30)).await;

        assert!(!conn.frames().iter().any(|f| f.contains("two")));
        assert!(session.streams_for("chat_1").is_empty());
        assert!(session.has_subscription("chat_1"));
    }

    #[tokio::test]
    async fn command_disconnect_flag_closes_the_session() {
        let controller = Arc::new(MockController::new());
        controller.on_command("subscribe", "chat_1", Ok(subscription_result(&[], "chat_1")));
        controller.on_command(
            "message",
            "chat_1",
            Ok(CommandResult {
                status: Status::Success,
                disconnect: true,
                ..CommandResult::default()
            }),
        );
        let node = build_node(controller);
        let (session, conn) = authenticated_session(&node, "1", "u:1").await;

        send(&node, &session, r#"{"command":"subscribe","identifier":"chat_1"}"#).await;
        conn.wait_frames(2).await;
        send(
            &node,
            &session,
            r#"{"command":"message","identifier":"chat_1","data":"bye"}"#,
        )
        .await;

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(session.is_closed());
    }

    #[tokio::test]
    async fn remote_disconnect_reaches_matching_identifiers_only() {
        let controller = Arc::new(MockController::new());
        let node = build_node(controller.clone());

        let (s1, c1) = authenticated_session(&node, "1", "u:1").await;
        let (s2, c2) = authenticated_session(&node, "2", "u:1").await;
        let (s3, _c3) = authenticated_session(&node, "3", "u:2").await;

        node.handle_pubsub(
            br#"{"command":"disconnect","payload":{"identifier":"u:1","reconnect":false}}"#,
        )
        .await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(s1.is_closed());
        assert!(s2.is_closed());
        assert!(!s3.is_closed());

        let expected = r#"{"type":"disconnect","reason":"remote","reconnect":false}"#;
        assert!(c1.frames().iter().any(|f| f == expected));
        assert!(c2.frames().iter().any(|f| f == expected));

        // Gone sessions are scheduled for the remote Disconnect call.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!controller.disconnect_calls().is_empty());
    }

    #[tokio::test]
    async fn history_from_replays_the_missing_tail_in_order() {
        let controller = Arc::new(MockController::new());
        controller.on_command(
            "subscribe",
            "chat_1",
            Ok(subscription_result(&["p"], "chat_1")),
        );
        let node = build_node(controller);
        let (session, conn) = authenticated_session(&node, "1", "u:1").await;

        send(&node, &session, r#"{"command":"subscribe","identifier":"chat_1"}"#).await;
        conn.wait_frames(2).await;

        for i in 1..=5 {
            node.broadcast(StreamMessage::new("p", &format!("\"m{i}\""))).await;
        }
        conn.wait_frames(7).await;

        let epoch = node.broker().epoch();
        let frame = format!(
            r#"{{"command":"history","identifier":"chat_1","history":{{"streams":{{"p":{{"epoch":"{epoch}","offset":3}}}}}}}}"#
        );
        send(&node, &session, &frame).await;
        let frames = conn.wait_frames(10).await;

        let tail: Vec<&String> = frames.iter().skip(7).collect();
        assert_eq!(tail.len(), 3);
        assert!(tail[0].contains(r#""message":"m4""#) && tail[0].contains(r#""offset":4"#));
        assert!(tail[1].contains(r#""message":"m5""#) && tail[1].contains(r#""offset":5"#));
        assert_eq!(
            tail[2].as_str(),
            r#"{"type":"confirm_history","identifier":"chat_1"}"#
        );
    }

    #[tokio::test]
    async fn history_with_unknown_epoch_is_rejected() {
        let controller = Arc::new(MockController::new());
        controller.on_command(
            "subscribe",
            "chat_1",
            Ok(subscription_result(&["p"], "chat_1")),
        );
        let node = build_node(controller);
        let (session, conn) = authenticated_session(&node, "1", "u:1").await;

        send(&node, &session, r#"{"command":"subscribe","identifier":"chat_1"}"#).await;
        conn.wait_frames(2).await;
        node.broadcast(StreamMessage::new("p", "\"x\"")).await;
        conn.wait_frames(3).await;

        send(
            &node,
            &session,
            r#"{"command":"history","identifier":"chat_1","history":{"streams":{"p":{"epoch":"stale","offset":0}}}}"#,
        )
        .await;
        let frames = conn.wait_frames(4).await;
        assert_eq!(
            frames.last().unwrap().as_str(),
            r#"{"type":"reject_history","identifier":"chat_1"}"#
        );
    }

    #[tokio::test]
    async fn disconnected_session_can_be_restored_by_sid() {
        let controller = Arc::new(MockController::new());
        controller.on_command(
            "subscribe",
            "chat_1",
            Ok(subscription_result(&["messages_1"], "chat_1")),
        );
        controller.on_command(
            "message",
            "chat_1",
            Ok(CommandResult {
                status: Status::Success,
                cstate: HashMap::from([("city".to_owned(), "Napoli".to_owned())]),
                ..CommandResult::default()
            }),
        );
        let node = build_node(controller);

        let (s1, c1) = authenticated_session(&node, "s1", "u:1").await;
        send(&node, &s1, r#"{"command":"subscribe","identifier":"chat_1"}"#).await;
        c1.wait_frames(2).await;
        send(&node, &s1, r#"{"command":"message","identifier":"chat_1","data":"x"}"#).await;
        tokio::time::sleep(Duration::from_millis(30)).await;

        s1.disconnect("Closed", close_codes::NORMAL);
        tokio::time::sleep(Duration::from_millis(50)).await;

        let (s2, c2) = test_session("s2", "/cable", &[], node.clone());
        node.restore_or_authenticate(&s2, Some("s1")).await.unwrap();

        let frames = c2.wait_frames(1).await;
        assert_eq!(frames[0], r#"{"type":"welcome","sid":"s2","restored":true}"#);
        assert_eq!(s2.identifiers(), "u:1");
        assert_eq!(s2.env_snapshot().cstate["city"], "Napoli");

        node.broadcast(StreamMessage::new("messages_1", "\"again\"")).await;
        let frames = c2.wait_frames(2).await;
        assert!(frames[1].contains(r#""message":"again""#));
    }

    #[tokio::test]
    async fn restore_with_unknown_sid_falls_back_to_authentication() {
        let controller = Arc::new(MockController::new());
        let node = build_node(controller);

        let (session, conn) = test_session("s2", "/cable", &[("id", "u:9")], node.clone());
        node.restore_or_authenticate(&session, Some("ghost"))
            .await
            .unwrap();

        let frames = conn.wait_frames(1).await;
        assert_eq!(frames[0], r#"{"type":"welcome"}"#);
        assert_eq!(session.identifiers(), "u:9");
    }

    #[tokio::test]
    async fn commands_before_authentication_are_dropped() {
        let controller = Arc::new(MockController::new());
        let node = build_node(controller);

        let (session, conn) = test_session("1", "/cable", &[], node.clone());
        send(&node, &session, r#"{"command":"subscribe","identifier":"chat_1"}"#).await;
        tokio::time::sleep(Duration::from_millis(30)).await;

        assert!(conn.frames().is_empty());
        assert!(!session.has_subscription("chat_1"));
    }

    #[tokio::test]
    async fn garbage_frames_are_ignored_without_closing() {
        let controller = Arc::new(MockController::new());
        let node = build_node(controller);
        let (session, _conn) = authenticated_session(&node, "1", "u:1").await;

        node.handle_command(&session, b"not json at all").await;
        assert!(!session.is_closed());
    }

    #[tokio::test]
    async fn lookup_session_uses_the_identifier_index() {
        let controller = Arc::new(MockController::new());
        let node = build_node(controller);

        assert!(node.lookup_session("u:1").await.is_none());
        let (_s1, _c1) = authenticated_session(&node, "14", "u:1").await;

        let found = node.lookup_session("u:1").await.unwrap();
        assert_eq!(found.uid, "14");
    }

    #[tokio::test]
    async fn rpc_broadcasts_funnel_through_the_broker() {
        let controller = Arc::new(MockController::new());
        controller.on_command(
            "subscribe",
            "chat_1",
            Ok(subscription_result(&["updates"], "chat_1")),
        );
        controller.on_command(
            "message",
            "chat_1",
            Ok(CommandResult {
                status: Status::Success,
                broadcasts: vec![StreamMessage::new("updates", "\"fanned\"")],
                ..CommandResult::default()
            }),
        );
        let node = build_node(controller);
        let (session, conn) = authenticated_session(&node, "1", "u:1").await;

        send(&node, &session, r#"{"command":"subscribe","identifier":"chat_1"}"#).await;
        conn.wait_frames(2).await;
        send(&node, &session, r#"{"command":"message","identifier":"chat_1","data":"x"}"#).await;

        let frames = conn.wait_frames(3).await;
        assert!(frames[2].contains(r#""message":"fanned""#));
        assert!(frames[2].contains(r#""offset":1"#));
    }
}
