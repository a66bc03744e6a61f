//! Networked broker engine.
//!
//! History and the epoch live in an external shared log; a local memory
//! broker shadows the streams this node consumes so history reads stay
//! fast. The [`StreamsSynchronizer`] keeps those reads from racing writes,
//! and a backlog absorbs broadcasts that arrive before the log is ready.
//!
//! The epoch is adopted with a compare-and-create on startup: the first
//! node of a generation writes its candidate, every later node adopts the
//! existing value, and an epoch watcher keeps the cluster converged when
//! the key changes.

use gw_protocol::StreamMessage;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use super::memory::MemoryBroker;
use super::sync::StreamsSynchronizer;
use super::{Broadcaster, Broker, BrokerConfig, BrokerError, StreamsTracker, generate_epoch};

const READY_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, thiserror::Error)]
pub enum LogError {
    #[error("log connection failed: {0}")]
    Connection(String),
    #[error("log operation failed: {0}")]
    Storage(String),
}

/// One replayable entry as the shared log stores it.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct LogEntry {
    pub offset: u64,
    pub timestamp: i64,
    pub data: String,
}

/// The slice of the external log the distributed engine needs: sequenced
/// appends per stream, two keyed buckets (sessions and the epoch), and
/// change notifications for the epoch key.
#[async_trait::async_trait]
pub trait SharedLog: Send + Sync {
    async fn connect(&self) -> Result<(), LogError>;

    /// Append and return the assigned (monotonically increasing) offset.
    async fn append(&self, stream: &str, data: &str) -> Result<u64, LogError>;

    /// The retained tail of a stream, oldest first; used to warm the local
    /// shadow when this node starts consuming a stream.
    async fn read_tail(&self, stream: &str) -> Result<Vec<LogEntry>, LogError>;

    /// Compare-and-create on the epoch key; returns the adopted value
    /// (the existing one when the key was already set).
    async fn adopt_epoch(&self, candidate: &str, ttl: Duration) -> Result<String, LogError>;

    async fn publish_epoch(&self, epoch: &str, ttl: Duration) -> Result<(), LogError>;

    /// A channel of epoch values observed on the epoch key.
    async fn epoch_updates(&self) -> Result<mpsc::Receiver<String>, LogError>;

    async fn put_session(&self, sid: &str, data: Vec<u8>, ttl: Duration) -> Result<(), LogError>;

    async fn fetch_session(&self, sid: &str) -> Result<Option<Vec<u8>>, LogError>;

    async fn close(&self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReadyState {
    Pending,
    Ready,
    Failed,
}

pub struct DistributedBroker {
    log: Arc<dyn SharedLog>,
    /// Shadow copies of remote streams; serves all history reads.
    local: Arc<MemoryBroker>,
    /// The bus: stamped messages are published for every node to consume.
    broadcaster: Arc<dyn Broadcaster>,
    tracker: StreamsTracker,
    synchronizer: StreamsSynchronizer,
    config: BrokerConfig,
    ready: watch::Sender<ReadyState>,
    backlog: Mutex<Vec<StreamMessage>>,
    shutdown: watch::Sender<bool>,
    /// Set at construction; lets `&self` trait methods spawn tasks that own
    /// the broker.
    self_ref: std::sync::Weak<DistributedBroker>,
}

impl DistributedBroker {
    pub fn new(
        log: Arc<dyn SharedLog>,
        broadcaster: Arc<dyn Broadcaster>,
        config: BrokerConfig,
    ) -> Arc<Self> {
        let (ready, _) = watch::channel(ReadyState::Pending);
        let (shutdown, _) = watch::channel(false);

        Arc::new_cyclic(|self_ref| DistributedBroker {
            log,
            local: MemoryBroker::new(None, config.clone()),
            broadcaster,
            tracker: StreamsTracker::new(),
            synchronizer: StreamsSynchronizer::default(),
            config,
            ready,
            backlog: Mutex::new(Vec::new()),
            shutdown,
            self_ref: self_ref.clone(),
        })
    }

    fn arc(&self) -> Option<Arc<Self>> {
        self.self_ref.upgrade()
    }

    fn epoch_ttl(&self) -> Duration {
        // Far longer than any replayable data it scopes.
        Duration::from_secs(10 * self.config.history_ttl.max(self.config.sessions_ttl))
    }

    async fn await_ready(&self, timeout: Duration) -> Result<(), BrokerError> {
        let mut rx = self.ready.subscribe();
        loop {
            match *rx.borrow_and_update() {
                ReadyState::Ready => return Ok(()),
                ReadyState::Failed => return Err(BrokerError::NotReady),
                ReadyState::Pending => {}
            }
            if tokio::time::timeout(timeout, rx.changed()).await.is_err() {
                return Err(BrokerError::NotReady);
            }
        }
    }

    async fn initialize(self: Arc<Self>) {
        let candidate = generate_epoch();
        match self.log.adopt_epoch(&candidate, self.epoch_ttl()).await {
            Ok(epoch) => {
                self.local.set_epoch(&epoch);
                if let Err(e) = self.local.start().await {
                    warn!(error = %e, "failed to start the local history shadow");
                }
                self.spawn_epoch_watcher().await;
                let _ = self.ready.send(ReadyState::Ready);
                info!(epoch = %epoch, "broker is ready");
                self.flush_backlog().await;
            }
            Err(e) => {
                let _ = self.ready.send(ReadyState::Failed);
                let dropped = self.backlog.lock().unwrap().len();
                error!(error = %e, dropped, "failed to calculate epoch; broker unavailable");
                self.backlog.lock().unwrap().clear();
            }
        }
    }

    async fn spawn_epoch_watcher(self: &Arc<Self>) {
        let mut updates = match self.log.epoch_updates().await {
            Ok(updates) => updates,
            Err(e) => {
                warn!(error = %e, "failed to set up epoch watcher");
                return;
            }
        };

        let broker = self.clone();
        let mut shutdown = self.shutdown.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    update = updates.recv() => {
                        match update {
                            Some(epoch) => {
                                if broker.local.epoch() != epoch {
                                    warn!(epoch = %epoch, "epoch updated");
                                    broker.local.set_epoch(&epoch);
                                }
                            }
                            None => return,
                        }
                    }
                    _ = shutdown.changed() => return,
                }
            }
        });
    }

    async fn flush_backlog(&self) {
        let pending: Vec<StreamMessage> = std::mem::take(&mut *self.backlog.lock().unwrap());
        if pending.is_empty() {
            return;
        }
        debug!(count = pending.len(), "flushing broadcast backlog");
        for msg in pending {
            self.publish(msg).await;
        }
    }

    async fn publish(&self, mut msg: StreamMessage) {
        // Touch before the append so a history read issued right after the
        // publish waits for the entry to land in the shadow.
        self.synchronizer.touch(&msg.stream);

        let offset = match self.log.append(&msg.stream, &msg.data).await {
            Ok(offset) => offset,
            Err(e) => {
                error!(stream = %msg.stream, error = %e, "failed to append to the shared log");
                return;
            }
        };

        msg.epoch = self.local.epoch();
        msg.offset = offset;

        self.broadcaster.route(msg).await;
    }

    async fn warm_stream(self: Arc<Self>, stream: String) {
        match self.log.read_tail(&stream).await {
            Ok(entries) => {
                for entry in entries {
                    self.local
                        .store(&stream, &entry.data, entry.offset, entry.timestamp);
                }
            }
            Err(e) => warn!(stream = %stream, error = %e, "failed to warm stream history"),
        }
    }
}

#[async_trait::async_trait]
impl Broker for DistributedBroker {
    async fn start(&self) -> Result<(), BrokerError> {
        self.log
            .connect()
            .await
            .map_err(|e| BrokerError::Storage(e.to_string()))?;

        // Epoch calculation may need to wait for the log cluster; run it
        // off the startup path.
        let broker = self.arc().ok_or(BrokerError::NotReady)?;
        tokio::spawn(broker.initialize());
        Ok(())
    }

    async fn shutdown(&self) {
        let _ = self.shutdown.send(true);
        self.local.shutdown().await;
        self.log.close().await;
    }

    async fn handle_broadcast(&self, msg: StreamMessage) {
        match self.await_ready(READY_TIMEOUT).await {
            Ok(()) => self.publish(msg).await,
            Err(_) => {
                if *self.ready.subscribe().borrow() == ReadyState::Failed {
                    error!(stream = %msg.stream, "broker unavailable, dropping broadcast");
                } else {
                    debug!(stream = %msg.stream, "log not ready, backlogging broadcast");
                    self.backlog.lock().unwrap().push(msg);
                }
            }
        }
    }

    async fn handle_stamped(&self, msg: &StreamMessage) {
        self.synchronizer.touch(&msg.stream);
        self.local.store(
            &msg.stream,
            &msg.data,
            msg.offset,
            chrono::Utc::now().timestamp(),
        );
    }

    async fn subscribe(&self, stream: &str) -> bool {
        let is_first = self.tracker.add(stream);
        if is_first {
            self.synchronizer.touch(stream);
            if let Some(broker) = self.arc() {
                tokio::spawn(broker.warm_stream(stream.to_owned()));
            }
        }
        is_first
    }

    async fn unsubscribe(&self, stream: &str) -> bool {
        let is_last = self.tracker.remove(stream);
        if is_last {
            self.synchronizer.remove(stream);
        }
        is_last
    }

    async fn history_from(
        &self,
        stream: &str,
        epoch: &str,
        offset: u64,
    ) -> Result<Vec<StreamMessage>, BrokerError> {
        self.await_ready(READY_TIMEOUT).await?;
        self.synchronizer.sync(stream).await;
        self.local.history_from(stream, epoch, offset).await
    }

    async fn history_since(
        &self,
        stream: &str,
        since: i64,
    ) -> Result<Vec<StreamMessage>, BrokerError> {
        self.await_ready(READY_TIMEOUT).await?;
        self.synchronizer.sync(stream).await;
        self.local.history_since(stream, since).await
    }

    async fn commit_session(&self, sid: &str, snapshot: Vec<u8>) -> Result<(), BrokerError> {
        self.await_ready(READY_TIMEOUT).await?;
        self.log
            .put_session(sid, snapshot, Duration::from_secs(self.config.sessions_ttl))
            .await
            .map_err(|e| BrokerError::Storage(e.to_string()))
    }

    async fn restore_session(&self, sid: &str) -> Result<Option<Vec<u8>>, BrokerError> {
        self.await_ready(READY_TIMEOUT).await?;
        self.log
            .fetch_session(sid)
            .await
            .map_err(|e| BrokerError::Storage(e.to_string()))
    }

    fn epoch(&self) -> String {
        self.local.epoch()
    }
}
