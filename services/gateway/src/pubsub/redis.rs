//! Redis pub/sub subscriber.
//!
//! One channel (`__anycable__` by default) carries remote commands and
//! broadcast-bus traffic; granular per-stream interest uses channels
//! prefixed `_ac_`, subscribed and dropped as local subscribers come and
//! go. The subscriber client re-establishes its subscriptions after a
//! reconnect.

use fred::clients::SubscriberClient;
use fred::prelude::*;
use gw_protocol::{RemoteCommandMessage, StreamMessage};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use super::{Subscriber, SubscriberError};
use crate::broker::Broadcaster;
use crate::node::Node;

const STREAM_CHANNEL_PREFIX: &str = "_ac_";

pub struct RedisSubscriber {
    subscriber: SubscriberClient,
    publisher: Client,
    /// The shared command/broadcast channel.
    channel: String,
    consumer: Mutex<Option<JoinHandle<()>>>,
}

impl RedisSubscriber {
    pub fn new(url: &str, channel: &str) -> Result<Self, SubscriberError> {
        let config =
            Config::from_url(url).map_err(|e| SubscriberError::Connection(e.to_string()))?;
        let subscriber = Builder::from_config(config.clone())
            .build_subscriber_client()
            .map_err(|e| SubscriberError::Connection(e.to_string()))?;
        let publisher = Builder::from_config(config)
            .build()
            .map_err(|e| SubscriberError::Connection(e.to_string()))?;

        Ok(RedisSubscriber {
            subscriber,
            publisher,
            channel: channel.to_owned(),
            consumer: Mutex::new(None),
        })
    }

    fn stream_channel(stream: &str) -> String {
        format!("{STREAM_CHANNEL_PREFIX}{stream}")
    }

    async fn publish(&self, channel: &str, payload: String) {
        let result: Result<i64, _> = self.publisher.publish(channel, payload).await;
        if let Err(e) = result {
            error!(channel = %channel, error = %e, "failed to publish");
        }
    }
}

#[async_trait::async_trait]
impl Subscriber for RedisSubscriber {
    async fn start(
        &self,
        node: Arc<Node>,
        err_tx: mpsc::Sender<SubscriberError>,
    ) -> Result<(), SubscriberError> {
        self.subscriber
            .init()
            .await
            .map(|_| ())
            .map_err(|e| SubscriberError::Connection(e.to_string()))?;
        self.publisher
            .init()
            .await
            .map(|_| ())
            .map_err(|e| SubscriberError::Connection(e.to_string()))?;

        let _ = self.subscriber.manage_subscriptions();
        self.subscriber
            .subscribe(self.channel.as_str())
            .await
            .map_err(|e| SubscriberError::Connection(e.to_string()))?;

        let mut message_rx = self.subscriber.message_rx();
        let handle = tokio::spawn(async move {
            loop {
                match message_rx.recv().await {
                    Ok(message) => {
                        let Some(payload) = message.value.as_bytes().map(<[u8]>::to_vec) else {
                            warn!(channel = %message.channel, "non-binary payload on the bus");
                            continue;
                        };
                        node.handle_pubsub(&payload).await;
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "bus consumer lagged; messages dropped");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                        let _ = err_tx
                            .send(SubscriberError::Consumer(
                                "bus message stream closed".to_owned(),
                            ))
                            .await;
                        return;
                    }
                }
            }
        });
        *self.consumer.lock().unwrap() = Some(handle);

        Ok(())
    }

    fn is_multi_node(&self) -> bool {
        true
    }

    async fn subscribe(&self, stream: &str) {
        let channel = Self::stream_channel(stream);
        debug!(channel = %channel, "subscribing to stream channel");
        if let Err(e) = self.subscriber.subscribe(channel.as_str()).await {
            warn!(stream = %stream, error = %e, "failed to subscribe to stream channel");
        }
    }

    async fn unsubscribe(&self, stream: &str) {
        let channel = Self::stream_channel(stream);
        if let Err(e) = self.subscriber.unsubscribe(channel.as_str()).await {
            warn!(stream = %stream, error = %e, "failed to unsubscribe from stream channel");
        }
    }

    async fn broadcast(&self, msg: &StreamMessage) {
        let Ok(payload) = serde_json::to_string(msg) else {
            return;
        };
        // Stamped messages go to the granular stream channel so only
        // interested nodes receive them; unstamped traffic uses the shared
        // channel.
        let channel = if msg.is_stamped() {
            Self::stream_channel(&msg.stream)
        } else {
            self.channel.clone()
        };
        self.publish(&channel, payload).await;
    }

    async fn broadcast_command(&self, msg: &RemoteCommandMessage) {
        let Ok(payload) = serde_json::to_string(msg) else {
            return;
        };
        self.publish(&self.channel.clone(), payload).await;
    }

    async fn shutdown(&self) {
        if let Some(handle) = self.consumer.lock().unwrap().take() {
            handle.abort();
        }
        let _ = self.subscriber.unsubscribe_all().await;
        let _ = self.subscriber.quit().await;
        let _ = self.publisher.quit().await;
    }
}

/// The distributed broker hands stamped messages to its broadcaster; for
/// multi-node deployments that is the bus itself.
#[async_trait::async_trait]
impl Broadcaster for RedisSubscriber {
    async fn route(&self, msg: StreamMessage) {
        self.broadcast(&msg).await;
    }
}
