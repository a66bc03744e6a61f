//! Stream history and recovery.
//!
//! A broker owns per-stream bounded history with the epoch-and-offset model,
//! the short-lived session cache for reconnects, and the fan-out delegation:
//! once a message is stamped, the broker hands it to its [`Broadcaster`]
//! (the hub in single-node deployments, the pub/sub bus in multi-node ones).

pub mod distributed;
pub mod memory;
pub mod redis_log;
mod sync;

pub use distributed::{DistributedBroker, LogEntry, LogError, SharedLog};
pub use memory::MemoryBroker;
pub use sync::StreamsSynchronizer;

use gw_protocol::StreamMessage;
use std::collections::HashMap;
use std::sync::Mutex;

use crate::hub::HubHandle;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum BrokerError {
    #[error("unknown epoch: {requested}, current: {current}")]
    UnknownEpoch { requested: String, current: String },
    #[error("offset expired: {offset}, lowest: {low}")]
    ExpiredOffset { offset: u64, low: u64 },
    #[error("stream not found: {0}")]
    UnknownStream(String),
    #[error("broker is not ready")]
    NotReady,
    #[error("storage failure: {0}")]
    Storage(String),
}

/// Receives stamped stream messages for delivery.
#[async_trait::async_trait]
pub trait Broadcaster: Send + Sync {
    async fn route(&self, msg: StreamMessage);
}

#[async_trait::async_trait]
impl Broadcaster for HubHandle {
    async fn route(&self, msg: StreamMessage) {
        self.broadcast(msg).await;
    }
}

#[async_trait::async_trait]
pub trait Broker: Send + Sync {
    async fn start(&self) -> Result<(), BrokerError>;

    async fn shutdown(&self);

    /// Assign the next offset, store the entry and delegate delivery.
    async fn handle_broadcast(&self, msg: StreamMessage);

    /// A message stamped elsewhere arrived over the bus. Engines that shadow
    /// remote streams store it here; the memory engine has nothing to do.
    async fn handle_stamped(&self, _msg: &StreamMessage) {}

    /// Track a local subscriber; true when this is the first one, so the
    /// caller can advertise interest upstream.
    async fn subscribe(&self, stream: &str) -> bool;

    /// Untrack a local subscriber; true when it was the last one.
    async fn unsubscribe(&self, stream: &str) -> bool;

    async fn history_from(
        &self,
        stream: &str,
        epoch: &str,
        offset: u64,
    ) -> Result<Vec<StreamMessage>, BrokerError>;

    async fn history_since(
        &self,
        stream: &str,
        since: i64,
    ) -> Result<Vec<StreamMessage>, BrokerError>;

    async fn commit_session(&self, sid: &str, snapshot: Vec<u8>) -> Result<(), BrokerError>;

    async fn restore_session(&self, sid: &str) -> Result<Option<Vec<u8>>, BrokerError>;

    fn epoch(&self) -> String;
}

/// History/recovery tunables, in the units of the config file.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Seconds an entry stays replayable.
    pub history_ttl: u64,
    /// Max entries retained per stream.
    pub history_limit: usize,
    /// Seconds a session snapshot stays restorable.
    pub sessions_ttl: u64,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        BrokerConfig {
            history_ttl: 300,
            history_limit: 100,
            sessions_ttl: 300,
        }
    }
}

/// Reference counts of local subscribers per stream.
///
/// `add` reports the first subscriber, `remove` the last one; both are used
/// to drive upstream interest advertisement exactly once.
#[derive(Default)]
pub struct StreamsTracker {
    store: Mutex<HashMap<String, u64>>,
}

impl StreamsTracker {
    pub fn new() -> Self {
        StreamsTracker::default()
    }

    pub fn add(&self, name: &str) -> bool {
        let mut store = self.store.lock().unwrap();
        let count = store.entry(name.to_owned()).or_insert(0);
        *count += 1;
        *count == 1
    }

    pub fn remove(&self, name: &str) -> bool {
        let mut store = self.store.lock().unwrap();
        match store.get_mut(name) {
            None => false,
            Some(count) if *count == 1 => {
                store.remove(name);
                true
            }
            Some(count) => {
                *count -= 1;
                false
            }
        }
    }

    pub fn has(&self, name: &str) -> bool {
        self.store.lock().unwrap().contains_key(name)
    }
}

/// A short random token scoping stream offsets to one broker generation.
pub fn generate_epoch() -> String {
    use rand::Rng;
    rand::thread_rng()
        .sample_iter(&rand::distributions::Alphanumeric)
        .take(4)
        .map(char::from)
        .collect()
}
