//! Gateway configuration loading.
//!
//! TOML is the sole config source; every key has a default so a missing
//! file yields a runnable single-node setup. CLI flags in `main.rs` may
//! override the listen address.
//!
//! # Sections
//! - `[server]`  — listen address, endpoint paths, connection limits
//! - `[session]` — ping cadence and precision, queue sizes, timeouts
//! - `[hub]`     — fan-out buffering
//! - `[broker]`  — history engine and retention
//! - `[pubsub]`  — bus adapter (`local` or `redis`)
//! - `[rpc]`     — command server endpoint
//! - `[disconnector]` — disconnect call rate limiting
//! - `[auth]`    — JWT identification / `skip_auth`
//! - `[app]`     — shutdown budget, stats cadence

use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

use crate::auth::AuthConfig;
use crate::broker::BrokerConfig;
use crate::controller::HttpControllerConfig;
use crate::disconnector::DisconnectorConfig;
use crate::session::{PingPrecision, SessionOptions};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("cannot parse config file: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerEngine {
    Memory,
    Distributed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PubSubAdapter {
    Local,
    Redis,
}

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub host: String,
    pub port: u16,
    pub path: String,
    pub sse_path: String,
    pub max_conn: usize,
    pub max_message_size: usize,

    pub session: SessionOptions,
    pub handshake_timeout: Duration,

    pub hub_broadcast_buffer: usize,

    pub broker_engine: BrokerEngine,
    pub broker: BrokerConfig,

    pub pubsub_adapter: PubSubAdapter,
    pub redis_url: String,
    pub redis_channel: String,

    pub rpc: HttpControllerConfig,

    pub disconnector: DisconnectorConfig,

    pub auth: AuthConfig,

    pub shutdown_timeout: Duration,
    pub stats_refresh_interval: Duration,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        GatewayConfig {
            host: "0.0.0.0".to_owned(),
            port: 8080,
            path: "/cable".to_owned(),
            sse_path: "/events".to_owned(),
            max_conn: 0,
            max_message_size: 64 * 1024,
            session: SessionOptions::default(),
            handshake_timeout: Duration::from_secs(10),
            hub_broadcast_buffer: 256,
            broker_engine: BrokerEngine::Memory,
            broker: BrokerConfig::default(),
            pubsub_adapter: PubSubAdapter::Local,
            redis_url: "redis://localhost:6379".to_owned(),
            redis_channel: "__anycable__".to_owned(),
            rpc: HttpControllerConfig::default(),
            disconnector: DisconnectorConfig::default(),
            auth: AuthConfig::new(),
            shutdown_timeout: Duration::from_secs(30),
            stats_refresh_interval: Duration::from_secs(5),
        }
    }
}

// ---------------------------------------------------------------------------
// Raw TOML deserialization types (every field optional)
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
struct RawConfig {
    server: Option<RawServer>,
    session: Option<RawSession>,
    hub: Option<RawHub>,
    broker: Option<RawBroker>,
    pubsub: Option<RawPubSub>,
    rpc: Option<RawRpc>,
    disconnector: Option<RawDisconnector>,
    auth: Option<RawAuth>,
    app: Option<RawApp>,
}

#[derive(Debug, Deserialize)]
struct RawServer {
    host: Option<String>,
    port: Option<u16>,
    path: Option<String>,
    sse_path: Option<String>,
    max_conn: Option<usize>,
    max_message_size: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct RawSession {
    ping_interval: Option<u64>,
    ping_timestamp_precision: Option<String>,
    pong_timeout: Option<u64>,
    handshake_timeout: Option<u64>,
    send_buffer_size: Option<usize>,
    write_timeout: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct RawHub {
    broadcast_buffer: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct RawBroker {
    engine: Option<String>,
    history_ttl: Option<u64>,
    history_limit: Option<usize>,
    sessions_ttl: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct RawPubSub {
    adapter: Option<String>,
    redis_url: Option<String>,
    channel: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawRpc {
    host: Option<String>,
    secret: Option<String>,
    request_timeout_ms: Option<u64>,
    concurrency: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct RawDisconnector {
    rate: Option<u64>,
    shutdown_timeout: Option<u64>,
    queue_size: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct RawAuth {
    jwt_param: Option<String>,
    jwt_secret: Option<String>,
    jwt_force: Option<bool>,
    skip_auth: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct RawApp {
    shutdown_timeout: Option<u64>,
    stats_refresh_interval: Option<u64>,
}

/// Load the config from `path`; a missing file yields the defaults.
pub fn load_config(path: Option<&Path>) -> Result<GatewayConfig, ConfigError> {
    let raw = match path {
        Some(path) if path.exists() => toml::from_str(&std::fs::read_to_string(path)?)?,
        Some(path) => {
            return Err(ConfigError::Invalid(format!(
                "config file not found: {}",
                path.display()
            )));
        }
        None => RawConfig::default(),
    };
    resolve(raw)
}

pub fn parse_config(contents: &str) -> Result<GatewayConfig, ConfigError> {
    resolve(toml::from_str(contents)?)
}

fn resolve(raw: RawConfig) -> Result<GatewayConfig, ConfigError> {
    let mut config = GatewayConfig::default();

    if let Some(server) = raw.server {
        if let Some(host) = server.host {
            config.host = host;
        }
        if let Some(port) = server.port {
            config.port = port;
        }
        if let Some(path) = server.path {
            config.path = path;
        }
        if let Some(sse_path) = server.sse_path {
            config.sse_path = sse_path;
        }
        if let Some(max_conn) = server.max_conn {
            config.max_conn = max_conn;
        }
        if let Some(size) = server.max_message_size {
            config.max_message_size = size;
        }
    }

    if let Some(session) = raw.session {
        if let Some(secs) = session.ping_interval {
            config.session.ping_interval = Duration::from_secs(secs);
        }
        if let Some(precision) = session.ping_timestamp_precision {
            config.session.ping_precision = PingPrecision::parse(&precision).ok_or_else(|| {
                ConfigError::Invalid(format!(
                    "unknown ping timestamp precision: {precision} (expected s, ms or ns)"
                ))
            })?;
        }
        if let Some(secs) = session.pong_timeout {
            config.session.pong_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = session.handshake_timeout {
            config.handshake_timeout = Duration::from_secs(secs);
        }
        if let Some(size) = session.send_buffer_size {
            config.session.send_buffer = size;
        }
        if let Some(secs) = session.write_timeout {
            config.session.write_timeout = Duration::from_secs(secs);
        }
    }

    if let Some(hub) = raw.hub {
        if let Some(size) = hub.broadcast_buffer {
            config.hub_broadcast_buffer = size;
        }
    }

    if let Some(broker) = raw.broker {
        if let Some(engine) = broker.engine {
            config.broker_engine = match engine.as_str() {
                "memory" => BrokerEngine::Memory,
                "distributed" => BrokerEngine::Distributed,
                other => {
                    return Err(ConfigError::Invalid(format!(
                        "unknown broker engine: {other} (expected memory or distributed)"
                    )));
                }
            };
        }
        if let Some(secs) = broker.history_ttl {
            config.broker.history_ttl = secs;
        }
        if let Some(limit) = broker.history_limit {
            config.broker.history_limit = limit;
        }
        if let Some(secs) = broker.sessions_ttl {
            config.broker.sessions_ttl = secs;
        }
    }

    if let Some(pubsub) = raw.pubsub {
        if let Some(adapter) = pubsub.adapter {
            config.pubsub_adapter = match adapter.as_str() {
                "local" => PubSubAdapter::Local,
                "redis" => PubSubAdapter::Redis,
                other => {
                    return Err(ConfigError::Invalid(format!(
                        "unknown pubsub adapter: {other} (expected local or redis)"
                    )));
                }
            };
        }
        if let Some(url) = pubsub.redis_url {
            config.redis_url = url;
        }
        if let Some(channel) = pubsub.channel {
            config.redis_channel = channel;
        }
    }

    if let Some(rpc) = raw.rpc {
        if let Some(host) = rpc.host {
            config.rpc.host = host;
        }
        if let Some(secret) = rpc.secret {
            config.rpc.secret = Some(secret);
        }
        if let Some(ms) = rpc.request_timeout_ms {
            config.rpc.request_timeout = Duration::from_millis(ms);
        }
        if let Some(concurrency) = rpc.concurrency {
            config.rpc.concurrency = concurrency;
        }
    }

    if let Some(disconnector) = raw.disconnector {
        if let Some(rate) = disconnector.rate {
            config.disconnector.rate = rate;
        }
        if let Some(secs) = disconnector.shutdown_timeout {
            config.disconnector.shutdown_timeout = Duration::from_secs(secs);
        }
        if let Some(size) = disconnector.queue_size {
            config.disconnector.queue_size = size;
        }
    }

    if let Some(auth) = raw.auth {
        if let Some(param) = auth.jwt_param {
            config.auth.jwt_param = param;
        }
        if let Some(secret) = auth.jwt_secret {
            config.auth.jwt_secret = Some(secret);
        }
        if let Some(force) = auth.jwt_force {
            config.auth.jwt_force = force;
        }
        if let Some(skip) = auth.skip_auth {
            config.auth.skip_auth = skip;
        }
    }

    if let Some(app) = raw.app {
        if let Some(secs) = app.shutdown_timeout {
            config.shutdown_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = app.stats_refresh_interval {
            config.stats_refresh_interval = Duration::from_secs(secs);
        }
    }

    // The distributed engine stamps on one node and fans out over the bus;
    // without a bus the rest of the cluster would never hear anything.
    if config.broker_engine == BrokerEngine::Distributed
        && config.pubsub_adapter == PubSubAdapter::Local
    {
        return Err(ConfigError::Invalid(
            "the distributed broker requires the redis pubsub adapter".to_owned(),
        ));
    }

    Ok(config)
}
