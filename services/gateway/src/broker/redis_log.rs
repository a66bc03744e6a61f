//! Redis-backed shared log for the distributed broker.
//!
//! Layout:
//! - `_ac_{stream}_seq`  — INCR counter assigning per-stream offsets
//! - `_ac_{stream}_log`  — list of serialized entries, LTRIM'd to the
//!   history limit and expired with the history TTL
//! - `_anycable_{sid}`   — session snapshots (sessions bucket)
//! - `_anycable_epoch_`  — the epoch key; compare-and-create via SET NX GET
//!
//! Epoch changes fan out over the `_anycable_epoch_updates_` channel so
//! every node converges without polling.

use fred::clients::SubscriberClient;
use fred::prelude::*;
use fred::types::Expiration;
use fred::types::SetOptions;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::distributed::{LogEntry, LogError, SharedLog};
use super::BrokerConfig;

const SESSIONS_BUCKET: &str = "_anycable_";
const EPOCH_KEY: &str = "_anycable_epoch_";
const EPOCH_CHANNEL: &str = "_anycable_epoch_updates_";
const STREAM_PREFIX: &str = "_ac_";

pub struct RedisLog {
    client: Client,
    subscriber: SubscriberClient,
    config: BrokerConfig,
    epoch_forwarder: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl RedisLog {
    pub fn new(url: &str, config: BrokerConfig) -> Result<Self, LogError> {
        let redis_config =
            Config::from_url(url).map_err(|e| LogError::Connection(e.to_string()))?;
        let client = Builder::from_config(redis_config.clone())
            .build()
            .map_err(|e| LogError::Connection(e.to_string()))?;
        let subscriber = Builder::from_config(redis_config)
            .build_subscriber_client()
            .map_err(|e| LogError::Connection(e.to_string()))?;

        Ok(RedisLog {
            client,
            subscriber,
            config,
            epoch_forwarder: Mutex::new(None),
        })
    }

    fn seq_key(stream: &str) -> String {
        format!("{STREAM_PREFIX}{stream}_seq")
    }

    fn log_key(stream: &str) -> String {
        format!("{STREAM_PREFIX}{stream}_log")
    }

    fn session_key(sid: &str) -> String {
        format!("{SESSIONS_BUCKET}{sid}")
    }

    /// Offsets must outlive any replayable data they scope.
    fn seq_ttl(&self) -> i64 {
        10 * self.config.history_ttl.max(self.config.sessions_ttl) as i64
    }
}

#[async_trait::async_trait]
impl SharedLog for RedisLog {
    async fn connect(&self) -> Result<(), LogError> {
        self.client
            .init()
            .await
            .map(|_| ())
            .map_err(|e| LogError::Connection(e.to_string()))?;
        self.subscriber
            .init()
            .await
            .map(|_| ())
            .map_err(|e| LogError::Connection(e.to_string()))?;
        // Re-subscribe automatically after reconnects.
        let _ = self.subscriber.manage_subscriptions();
        Ok(())
    }

    async fn append(&self, stream: &str, data: &str) -> Result<u64, LogError> {
        let offset: u64 = self
            .client
            .incr(Self::seq_key(stream))
            .await
            .map_err(|e| LogError::Storage(e.to_string()))?;

        let entry = LogEntry {
            offset,
            timestamp: chrono::Utc::now().timestamp(),
            data: data.to_owned(),
        };
        let serialized =
            serde_json::to_string(&entry).map_err(|e| LogError::Storage(e.to_string()))?;

        let log_key = Self::log_key(stream);
        let _: () = self
            .client
            .rpush(&log_key, serialized)
            .await
            .map_err(|e| LogError::Storage(e.to_string()))?;
        let _: () = self
            .client
            .ltrim(&log_key, -(self.config.history_limit as i64), -1)
            .await
            .map_err(|e| LogError::Storage(e.to_string()))?;
        let _: () = self
            .client
            .expire(&log_key, self.config.history_ttl as i64, None)
            .await
            .map_err(|e| LogError::Storage(e.to_string()))?;
        let _: () = self
            .client
            .expire(Self::seq_key(stream), self.seq_ttl(), None)
            .await
            .map_err(|e| LogError::Storage(e.to_string()))?;

        Ok(offset)
    }

    async fn read_tail(&self, stream: &str) -> Result<Vec<LogEntry>, LogError> {
        let raw: Vec<String> = self
            .client
            .lrange(Self::log_key(stream), 0, -1)
            .await
            .map_err(|e| LogError::Storage(e.to_string()))?;

        let mut entries = Vec::with_capacity(raw.len());
        for item in raw {
            match serde_json::from_str::<LogEntry>(&item) {
                Ok(entry) => entries.push(entry),
                Err(e) => warn!(stream = %stream, error = %e, "skipping undecodable log entry"),
            }
        }
        Ok(entries)
    }

    async fn adopt_epoch(&self, candidate: &str, ttl: Duration) -> Result<String, LogError> {
        // SET NX GET: returns the previous value when the key existed, so
        // the winner keeps its candidate and everyone else adopts.
        let previous: Option<String> = self
            .client
            .set(
                EPOCH_KEY,
                candidate,
                Some(Expiration::EX(ttl.as_secs() as i64)),
                Some(SetOptions::NX),
                true,
            )
            .await
            .map_err(|e| LogError::Storage(e.to_string()))?;

        let adopted = previous.unwrap_or_else(|| candidate.to_owned());
        debug!(epoch = %adopted, "epoch adopted");
        Ok(adopted)
    }

    async fn publish_epoch(&self, epoch: &str, ttl: Duration) -> Result<(), LogError> {
        let _: () = self
            .client
            .set(
                EPOCH_KEY,
                epoch,
                Some(Expiration::EX(ttl.as_secs() as i64)),
                None,
                false,
            )
            .await
            .map_err(|e| LogError::Storage(e.to_string()))?;
        let _: i64 = self
            .client
            .publish(EPOCH_CHANNEL, epoch)
            .await
            .map_err(|e| LogError::Storage(e.to_string()))?;
        Ok(())
    }

    async fn epoch_updates(&self) -> Result<mpsc::Receiver<String>, LogError> {
        self.subscriber
            .subscribe(EPOCH_CHANNEL)
            .await
            .map_err(|e| LogError::Storage(e.to_string()))?;

        let (tx, rx) = mpsc::channel(8);
        let mut message_rx = self.subscriber.message_rx();
        let handle = tokio::spawn(async move {
            while let Ok(message) = message_rx.recv().await {
                if &*message.channel != EPOCH_CHANNEL {
                    continue;
                }
                match message.value.convert::<String>() {
                    Ok(epoch) => {
                        if tx.send(epoch).await.is_err() {
                            return;
                        }
                    }
                    Err(e) => warn!(error = %e, "undecodable epoch update"),
                }
            }
        });
        *self.epoch_forwarder.lock().unwrap() = Some(handle);

        Ok(rx)
    }

    async fn put_session(&self, sid: &str, data: Vec<u8>, ttl: Duration) -> Result<(), LogError> {
        let blob = String::from_utf8(data).map_err(|e| LogError::Storage(e.to_string()))?;
        let _: () = self
            .client
            .set(
                Self::session_key(sid),
                blob,
                Some(Expiration::EX(ttl.as_secs() as i64)),
                None,
                false,
            )
            .await
            .map_err(|e| LogError::Storage(e.to_string()))?;
        Ok(())
    }

    async fn fetch_session(&self, sid: &str) -> Result<Option<Vec<u8>>, LogError> {
        let value: Option<String> = self
            .client
            .get(Self::session_key(sid))
            .await
            .map_err(|e| LogError::Storage(e.to_string()))?;
        Ok(value.map(String::into_bytes))
    }

    async fn close(&self) {
        if let Some(handle) = self.epoch_forwarder.lock().unwrap().take() {
            handle.abort();
        }
        let _ = self.subscriber.quit().await;
        let _ = self.client.quit().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_layout_follows_the_bucket_names() {
        assert_eq!(RedisLog::seq_key("chat"), "_ac_chat_seq");
        assert_eq!(RedisLog::log_key("chat"), "_ac_chat_log");
        assert_eq!(RedisLog::session_key("s1"), "_anycable_s1");
    }

    #[test]
    fn log_entries_serialize_compactly() {
        let entry = LogEntry {
            offset: 3,
            timestamp: 100,
            data: "hi".to_owned(),
        };
        let json = serde_json::to_string(&entry).unwrap();
        assert_eq!(json, r#"{"offset":3,"timestamp":100,"data":"hi"}"#);
    }
}
