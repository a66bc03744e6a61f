// gw-protocol: Wire types shared by the gateway, the command server client
// and the test tooling.
//
// Three message families live here:
// - client <-> gateway frames (the cable protocol: commands in, replies out),
// - gateway <-> command server RPC payloads (connect/command/disconnect),
// - pub/sub bus payloads (stream messages and remote commands) with the
//   union decoder.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

// ---------------------------------------------------------------------------
// Inbound client frames
// ---------------------------------------------------------------------------

/// Client command verbs.
///
/// `Message` carries a channel action ("perform"); `History` requests a
/// replay of stream backlogs; `Pong` answers server pings when pong
/// supervision is enabled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Command {
    Subscribe,
    Unsubscribe,
    Message,
    History,
    Pong,
}

impl Command {
    /// The verb sent to the command server for this command.
    pub fn as_rpc_str(self) -> &'static str {
        match self {
            Command::Subscribe => "subscribe",
            Command::Unsubscribe => "unsubscribe",
            Command::Message => "message",
            Command::History => "history",
            Command::Pong => "pong",
        }
    }
}

/// A single decoded client frame.
///
/// `identifier` is opaque to the gateway (conventionally the JSON of
/// `{channel, ...params}`); `data` is an opaque payload string forwarded to
/// the command server verbatim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub command: Command,
    #[serde(default)]
    pub identifier: String,
    #[serde(default)]
    pub data: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub history: Option<HistoryRequest>,
}

/// Replay request attached to `subscribe` or sent as a standalone `history`
/// command.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HistoryRequest {
    /// Unix seconds; entries with `timestamp >= since` are replayed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub since: Option<i64>,
    /// Per-stream resume positions; take precedence over `since`.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub streams: HashMap<String, HistoryPosition>,
}

impl HistoryRequest {
    pub fn is_empty(&self) -> bool {
        self.since.is_none() && self.streams.is_empty()
    }
}

/// The last position a client saw for one stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryPosition {
    pub epoch: String,
    pub offset: u64,
}

// ---------------------------------------------------------------------------
// Outbound server frames
// ---------------------------------------------------------------------------

/// Reply frame types.
pub mod reply_types {
    pub const WELCOME: &str = "welcome";
    pub const DISCONNECT: &str = "disconnect";
    pub const PING: &str = "ping";
    pub const CONFIRM_SUBSCRIPTION: &str = "confirm_subscription";
    pub const REJECT_SUBSCRIPTION: &str = "reject_subscription";
    pub const CONFIRM_HISTORY: &str = "confirm_history";
    pub const REJECT_HISTORY: &str = "reject_history";
}

/// Disconnect reasons surfaced to clients.
pub mod disconnect_reasons {
    pub const UNAUTHORIZED: &str = "unauthorized";
    pub const REMOTE: &str = "remote";
    pub const SERVER_RESTART: &str = "server_restart";
    pub const IDLE_TIMEOUT: &str = "idle_timeout";
    pub const NO_PONG: &str = "no_pong";
}

/// A single outbound frame.
///
/// Every frame the gateway originates is a `Reply`; transmissions produced
/// by the command server are sent verbatim and never pass through this type.
/// Field order matters: serialization follows declaration order and the
/// protocol's canonical frames put `type` (when present) first and the
/// stream position fields last.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Reply {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub reply_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identifier: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reconnect: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub epoch: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offset: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restored: Option<bool>,
}

impl Reply {
    pub fn welcome(sid: Option<&str>, restored: bool) -> Self {
        Reply {
            reply_type: Some(reply_types::WELCOME.to_owned()),
            sid: sid.map(str::to_owned),
            restored: if restored { Some(true) } else { None },
            ..Default::default()
        }
    }

    pub fn disconnect(reason: &str, reconnect: bool) -> Self {
        Reply {
            reply_type: Some(reply_types::DISCONNECT.to_owned()),
            reason: Some(reason.to_owned()),
            reconnect: Some(reconnect),
            ..Default::default()
        }
    }

    pub fn ping(timestamp: serde_json::Value) -> Self {
        Reply {
            reply_type: Some(reply_types::PING.to_owned()),
            message: Some(timestamp),
            ..Default::default()
        }
    }

    pub fn confirm_history(identifier: &str) -> Self {
        Reply {
            reply_type: Some(reply_types::CONFIRM_HISTORY.to_owned()),
            identifier: Some(identifier.to_owned()),
            ..Default::default()
        }
    }

    pub fn reject_history(identifier: &str) -> Self {
        Reply {
            reply_type: Some(reply_types::REJECT_HISTORY.to_owned()),
            identifier: Some(identifier.to_owned()),
            ..Default::default()
        }
    }

    pub fn reject_subscription(identifier: &str) -> Self {
        Reply {
            reply_type: Some(reply_types::REJECT_SUBSCRIPTION.to_owned()),
            identifier: Some(identifier.to_owned()),
            ..Default::default()
        }
    }

    /// A broadcast delivered under `identifier`. `data` is parsed as JSON
    /// when possible and carried as a literal string otherwise.
    pub fn stream(identifier: &str, msg: &StreamMessage) -> Self {
        Reply {
            identifier: Some(identifier.to_owned()),
            message: Some(parse_data(&msg.data)),
            stream_id: Some(msg.stream.clone()),
            epoch: if msg.epoch.is_empty() {
                None
            } else {
                Some(msg.epoch.clone())
            },
            offset: if msg.offset == 0 {
                None
            } else {
                Some(msg.offset)
            },
            ..Default::default()
        }
    }

    pub fn to_json(&self) -> String {
        // Reply contains nothing non-serializable.
        serde_json::to_string(self).expect("reply serialization")
    }
}

/// Broadcast data payloads are JSON when the publisher sent JSON and plain
/// strings otherwise.
fn parse_data(data: &str) -> serde_json::Value {
    serde_json::from_str(data).unwrap_or_else(|_| serde_json::Value::String(data.to_owned()))
}

// ---------------------------------------------------------------------------
// Pub/sub bus payloads
// ---------------------------------------------------------------------------

/// A message published to a stream.
///
/// `epoch`/`offset` are empty until the broker stamps them; stamped messages
/// travel the bus with both fields set.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StreamMessage {
    pub stream: String,
    pub data: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub epoch: String,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub offset: u64,
}

fn is_zero(v: &u64) -> bool {
    *v == 0
}

impl StreamMessage {
    pub fn new(stream: &str, data: &str) -> Self {
        StreamMessage {
            stream: stream.to_owned(),
            data: data.to_owned(),
            epoch: String::new(),
            offset: 0,
        }
    }

    /// Whether the broker has already assigned a position to this message.
    pub fn is_stamped(&self) -> bool {
        !self.epoch.is_empty()
    }
}

/// A command published to the bus for every node to execute.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteCommandMessage {
    pub command: String,
    #[serde(default)]
    pub payload: serde_json::Value,
}

/// The only remote command the gateway executes: close every session with
/// the given identifiers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteDisconnectMessage {
    pub identifier: String,
    #[serde(default)]
    pub reconnect: bool,
}

/// A decoded bus payload.
#[derive(Debug, Clone, PartialEq)]
pub enum PubSubMessage {
    Stream(StreamMessage),
    Disconnect(RemoteDisconnectMessage),
}

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("malformed payload: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("unknown remote command: {0}")]
    UnknownCommand(String),
    #[error("payload is neither a stream message nor a command")]
    UnknownPayload,
}

/// Decode a raw bus payload.
///
/// The discriminator is the presence of a non-empty `stream` field; the
/// `{command, payload}` shape is the fallback, kept for wire compatibility
/// with publishers that predate the tagged layout.
pub fn decode_pubsub(raw: &[u8]) -> Result<PubSubMessage, ProtocolError> {
    let value: serde_json::Value = serde_json::from_slice(raw)?;

    if value
        .get("stream")
        .and_then(serde_json::Value::as_str)
        .is_some_and(|s| !s.is_empty())
    {
        let msg: StreamMessage = serde_json::from_value(value)?;
        return Ok(PubSubMessage::Stream(msg));
    }

    if value.get("command").is_some() {
        let cmd: RemoteCommandMessage = serde_json::from_value(value)?;
        if cmd.command == "disconnect" {
            let payload: RemoteDisconnectMessage = serde_json::from_value(cmd.payload)?;
            return Ok(PubSubMessage::Disconnect(payload));
        }
        return Err(ProtocolError::UnknownCommand(cmd.command));
    }

    Err(ProtocolError::UnknownPayload)
}

// ---------------------------------------------------------------------------
// Session environment
// ---------------------------------------------------------------------------

/// The connection context exchanged with the command server on every call.
///
/// `cstate` is connection-wide state; `istate` is keyed by channel
/// identifier. Both are mutated only through the merge helpers so the
/// empty-value-deletes rule holds everywhere.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionEnv {
    pub url: String,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub headers: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub cstate: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub istate: HashMap<String, HashMap<String, String>>,
}

impl SessionEnv {
    pub fn new(url: &str, headers: HashMap<String, String>) -> Self {
        SessionEnv {
            url: url.to_owned(),
            headers,
            cstate: HashMap::new(),
            istate: HashMap::new(),
        }
    }

    /// Merge a connection-state delta; an empty value deletes the key.
    pub fn merge_cstate(&mut self, delta: &HashMap<String, String>) {
        merge_state(&mut self.cstate, delta);
    }

    /// Merge a channel-state delta for one identifier; an empty value
    /// deletes the key, and an emptied map drops the identifier entry.
    pub fn merge_istate(&mut self, identifier: &str, delta: &HashMap<String, String>) {
        let state = self.istate.entry(identifier.to_owned()).or_default();
        merge_state(state, delta);
        if state.is_empty() {
            self.istate.remove(identifier);
        }
    }

    /// Drop all channel state for an identifier (the channel went away).
    pub fn remove_istate(&mut self, identifier: &str) {
        self.istate.remove(identifier);
    }

    pub fn channel_state(&self, identifier: &str) -> Option<&HashMap<String, String>> {
        self.istate.get(identifier)
    }
}

fn merge_state(state: &mut HashMap<String, String>, delta: &HashMap<String, String>) {
    for (key, value) in delta {
        if value.is_empty() {
            state.remove(key);
        } else {
            state.insert(key.clone(), value.clone());
        }
    }
}

// ---------------------------------------------------------------------------
// Command server RPC payloads
// ---------------------------------------------------------------------------

/// Outcome class of a command server call.
///
/// `Failure` means the call was processed and rejected (e.g. a subscription
/// was refused); `Error` is a transient server-side fault.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Status {
    #[default]
    Success,
    Failure,
    Error,
}

/// `POST /connect` request body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectRequest {
    pub sid: String,
    pub env: SessionEnv,
}

/// `POST /connect` response body.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConnectResult {
    #[serde(default)]
    pub status: Status,
    #[serde(default)]
    pub identifiers: String,
    #[serde(default)]
    pub transmissions: Vec<String>,
    #[serde(default)]
    pub broadcasts: Vec<StreamMessage>,
    #[serde(default)]
    pub cstate: HashMap<String, String>,
    /// Channel state deltas keyed by channel identifier (connect has no
    /// single-channel context).
    #[serde(default)]
    pub istate: HashMap<String, HashMap<String, String>>,
    #[serde(default)]
    pub error_msg: String,
}

/// `POST /command` request body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandRequest {
    pub sid: String,
    pub command: String,
    pub identifier: String,
    #[serde(default)]
    pub data: String,
    pub env: SessionEnv,
}

/// `POST /command` response body.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CommandResult {
    #[serde(default)]
    pub status: Status,
    #[serde(default)]
    pub disconnect: bool,
    /// Stop every stream of the channel.
    #[serde(default)]
    pub stop_streams: bool,
    /// Streams to subscribe the channel to.
    #[serde(default)]
    pub streams: Vec<String>,
    /// Individual streams to stop (granular counterpart of `stop_streams`).
    #[serde(default)]
    pub stopped_streams: Vec<String>,
    #[serde(default)]
    pub transmissions: Vec<String>,
    #[serde(default)]
    pub broadcasts: Vec<StreamMessage>,
    #[serde(default)]
    pub cstate: HashMap<String, String>,
    #[serde(default)]
    pub istate: HashMap<String, String>,
    #[serde(default)]
    pub error_msg: String,
}

/// `POST /disconnect` request body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DisconnectRequest {
    pub sid: String,
    pub identifiers: String,
    #[serde(default)]
    pub subscriptions: Vec<String>,
    pub env: SessionEnv,
}

/// `POST /disconnect` response body.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DisconnectResult {
    #[serde(default)]
    pub status: Status,
    #[serde(default)]
    pub error_msg: String,
}

/// Extract the `channel` class from a channel identifier, when the
/// identifier follows the JSON convention.
pub fn channel_from_identifier(identifier: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(identifier).ok()?;
    value
        .get("channel")
        .and_then(serde_json::Value::as_str)
        .map(str::to_owned)
}

// ---------------------------------------------------------------------------
// Session snapshots (reconnect/restore)
// ---------------------------------------------------------------------------

/// What the broker caches about a finished session so a reconnecting client
/// can be restored without a Connect RPC.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub identifiers: String,
    /// channel identifier -> subscribed streams
    #[serde(default)]
    pub subscriptions: HashMap<String, Vec<String>>,
    #[serde(default)]
    pub cstate: HashMap<String, String>,
    #[serde(default)]
    pub istate: HashMap<String, HashMap<String, String>>,
}

impl SessionSnapshot {
    pub fn to_bytes(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("snapshot serialization")
    }

    pub fn from_bytes(raw: &[u8]) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_slice(raw)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_subscribe_command() {
        let msg: Message =
            serde_json::from_str(r#"{"command":"subscribe","identifier":"chat_1"}"#).unwrap();
        assert_eq!(msg.command, Command::Subscribe);
        assert_eq!(msg.identifier, "chat_1");
        assert!(msg.history.is_none());
    }

    #[test]
    fn decodes_history_request_with_positions() {
        let msg: Message = serde_json::from_str(
            r#"{"command":"history","identifier":"chat_1","history":{"since":100,"streams":{"a":{"epoch":"x","offset":7}}}}"#,
        )
        .unwrap();
        let history = msg.history.unwrap();
        assert_eq!(history.since, Some(100));
        assert_eq!(history.streams["a"].offset, 7);
        assert_eq!(history.streams["a"].epoch, "x");
    }

    #[test]
    fn stream_reply_shape_matches_protocol() {
        let mut msg = StreamMessage::new("messages_1", "hi");
        msg.epoch = "abcd".to_owned();
        msg.offset = 1;
        let json = Reply::stream("chat_1", &msg).to_json();
        assert_eq!(
            json,
            r#"{"identifier":"chat_1","message":"hi","stream_id":"messages_1","epoch":"abcd","offset":1}"#
        );
    }

    #[test]
    fn stream_reply_passes_json_data_through() {
        let msg = StreamMessage::new("s", r#"{"text":"hey"}"#);
        let reply = Reply::stream("chat_1", &msg);
        assert_eq!(
            reply.message,
            Some(serde_json::json!({"text": "hey"}))
        );
        // unstamped message carries no position fields
        assert!(reply.epoch.is_none());
        assert!(reply.offset.is_none());
    }

    #[test]
    fn welcome_and_disconnect_shapes() {
        assert_eq!(Reply::welcome(None, false).to_json(), r#"{"type":"welcome"}"#);
        assert_eq!(
            Reply::welcome(Some("s2"), true).to_json(),
            r#"{"type":"welcome","sid":"s2","restored":true}"#
        );
        assert_eq!(
            Reply::disconnect(disconnect_reasons::REMOTE, false).to_json(),
            r#"{"type":"disconnect","reason":"remote","reconnect":false}"#
        );
    }

    #[test]
    fn pubsub_decoder_picks_stream_messages() {
        let decoded = decode_pubsub(br#"{"stream":"test","data":"\"abc\""}"#).unwrap();
        match decoded {
            PubSubMessage::Stream(msg) => {
                assert_eq!(msg.stream, "test");
                assert_eq!(msg.data, "\"abc\"");
                assert!(!msg.is_stamped());
            }
            other => panic!("expected stream message, got {other:?}"),
        }
    }

    #[test]
    fn pubsub_decoder_picks_disconnect_commands() {
        let decoded = decode_pubsub(
            br#"{"command":"disconnect","payload":{"identifier":"u:1","reconnect":false}}"#,
        )
        .unwrap();
        match decoded {
            PubSubMessage::Disconnect(cmd) => {
                assert_eq!(cmd.identifier, "u:1");
                assert!(!cmd.reconnect);
            }
            other => panic!("expected disconnect command, got {other:?}"),
        }
    }

    #[test]
    fn pubsub_decoder_rejects_unknown_payloads() {
        assert!(decode_pubsub(br#"{"foo":"bar"}"#).is_err());
        assert!(decode_pubsub(br#"{"command":"reboot","payload":{}}"#).is_err());
        assert!(decode_pubsub(b"not json").is_err());
    }

    #[test]
    fn empty_value_deletes_state_keys() {
        let mut env = SessionEnv::new("/cable", HashMap::new());
        env.merge_cstate(&HashMap::from([("city".to_owned(), "Napoli".to_owned())]));
        assert_eq!(env.cstate["city"], "Napoli");

        env.merge_cstate(&HashMap::from([("city".to_owned(), String::new())]));
        assert!(env.cstate.is_empty());

        env.merge_istate("chat_1", &HashMap::from([("k".to_owned(), "v".to_owned())]));
        env.merge_istate("chat_1", &HashMap::from([("k".to_owned(), String::new())]));
        assert!(env.channel_state("chat_1").is_none());
    }

    #[test]
    fn status_uses_screaming_case_on_the_wire() {
        assert_eq!(serde_json::to_string(&Status::Success).unwrap(), r#""SUCCESS""#);
        assert_eq!(
            serde_json::from_str::<Status>(r#""FAILURE""#).unwrap(),
            Status::Failure
        );
    }

    #[test]
    fn channel_extraction_from_identifier() {
        assert_eq!(
            channel_from_identifier(r#"{"channel":"ChatChannel","id":1}"#),
            Some("ChatChannel".to_owned())
        );
        assert_eq!(channel_from_identifier("chat_1"), None);
    }

    #[test]
    fn snapshot_round_trips() {
        let snapshot = SessionSnapshot {
            identifiers: "u:1".to_owned(),
            subscriptions: HashMap::from([(
                "chat_1".to_owned(),
                vec!["messages_1".to_owned()],
            )]),
            cstate: HashMap::from([("city".to_owned(), "Napoli".to_owned())]),
            istate: HashMap::new(),
        };
        let restored = SessionSnapshot::from_bytes(&snapshot.to_bytes()).unwrap();
        assert_eq!(restored, snapshot);
    }
}
