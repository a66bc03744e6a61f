//! Cross-node pub/sub.
//!
//! A subscriber bridges the process to the cluster-wide bus: it consumes
//! stream messages and remote commands published by external systems and
//! (for granular backends) advertises per-stream interest. Incoming
//! payloads are decoded with the union decoder and dispatched to the node;
//! consumer loops never block in handler callbacks — the node and hub run
//! their own event loops.

pub mod local;
pub mod redis;

pub use local::LocalSubscriber;
pub use redis::RedisSubscriber;

use gw_protocol::{RemoteCommandMessage, StreamMessage};
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::node::Node;

#[derive(Debug, thiserror::Error)]
pub enum SubscriberError {
    #[error("bus connection failed: {0}")]
    Connection(String),
    #[error("bus consumer failed: {0}")]
    Consumer(String),
}

#[async_trait::async_trait]
pub trait Subscriber: Send + Sync {
    /// Connect and start consuming. Unrecoverable failures are pushed to
    /// `err_tx`, which triggers an orderly process shutdown.
    async fn start(
        &self,
        node: Arc<Node>,
        err_tx: mpsc::Sender<SubscriberError>,
    ) -> Result<(), SubscriberError>;

    /// Whether broadcasts travel across gateway nodes.
    fn is_multi_node(&self) -> bool;

    /// Advertise interest in a stream (granular backends only).
    async fn subscribe(&self, stream: &str);

    async fn unsubscribe(&self, stream: &str);

    /// Publish a stream message to the bus.
    async fn broadcast(&self, msg: &StreamMessage);

    /// Publish a remote command to the bus.
    async fn broadcast_command(&self, msg: &RemoteCommandMessage);

    async fn shutdown(&self);
}
