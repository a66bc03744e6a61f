//! Single-node subscriber stub.
//!
//! There is no bus: publishing loops straight back into the node, and
//! interest advertisement has nowhere to go.

use gw_protocol::{RemoteCommandMessage, StreamMessage};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

use super::{Subscriber, SubscriberError};
use crate::node::Node;

#[derive(Default)]
pub struct LocalSubscriber {
    node: Mutex<Option<Arc<Node>>>,
}

impl LocalSubscriber {
    pub fn new() -> Self {
        LocalSubscriber::default()
    }
}

#[async_trait::async_trait]
impl Subscriber for LocalSubscriber {
    async fn start(
        &self,
        node: Arc<Node>,
        _err_tx: mpsc::Sender<SubscriberError>,
    ) -> Result<(), SubscriberError> {
        *self.node.lock().unwrap() = Some(node);
        Ok(())
    }

    fn is_multi_node(&self) -> bool {
        false
    }

    async fn subscribe(&self, _stream: &str) {}

    async fn unsubscribe(&self, _stream: &str) {}

    async fn broadcast(&self, msg: &StreamMessage) {
        let node = self.node.lock().unwrap().clone();
        if let Some(node) = node {
            node.broadcast(msg.clone()).await;
        }
    }

    async fn broadcast_command(&self, msg: &RemoteCommandMessage) {
        let node = self.node.lock().unwrap().clone();
        if let Some(node) = node {
            node.handle_remote_command(msg.clone()).await;
        }
    }

    async fn shutdown(&self) {}
}
