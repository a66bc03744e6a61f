//! In-process broker: the reference history engine.
//!
//! Per-stream ring buffers guarded by their own locks; the global stream map
//! holds its lock only long enough to fetch the stream. A background sweep
//! drops entries past the TTL once a second and prunes expired session
//! snapshots.

use gw_protocol::StreamMessage;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;

use super::{Broadcaster, Broker, BrokerConfig, BrokerError, StreamsTracker, generate_epoch};

#[derive(Debug, Clone)]
struct Entry {
    offset: u64,
    timestamp: i64,
    data: String,
}

struct MemStreamInner {
    offset: u64,
    /// Lowest offset still replayable; requests below it have expired.
    low: u64,
    entries: VecDeque<Entry>,
}

struct MemStream {
    limit: usize,
    inner: RwLock<MemStreamInner>,
}

impl MemStream {
    fn new(limit: usize) -> Self {
        MemStream {
            limit,
            inner: RwLock::new(MemStreamInner {
                offset: 0,
                low: 0,
                entries: VecDeque::new(),
            }),
        }
    }

    fn add(&self, data: &str, timestamp: i64) -> u64 {
        let mut inner = self.inner.write().unwrap();
        inner.offset += 1;
        let offset = inner.offset;
        inner.entries.push_back(Entry {
            offset,
            timestamp,
            data: data.to_owned(),
        });
        self.trim(&mut inner);
        offset
    }

    /// Record an entry stamped elsewhere (shadow copies of remote streams).
    fn store(&self, data: &str, offset: u64, timestamp: i64) {
        let mut inner = self.inner.write().unwrap();
        if offset <= inner.offset {
            // Duplicate delivery from the bus; history already has it.
            return;
        }
        inner.offset = offset;
        inner.entries.push_back(Entry {
            offset,
            timestamp,
            data: data.to_owned(),
        });
        self.trim(&mut inner);
    }

    fn trim(&self, inner: &mut MemStreamInner) {
        while inner.entries.len() > self.limit {
            inner.entries.pop_front();
        }
        if let Some(first) = inner.entries.front() {
            if first.offset > inner.low {
                inner.low = first.offset;
            }
        }
    }

    /// Drop leading entries older than `deadline` (unix seconds).
    fn expire(&self, deadline: i64) {
        let mut inner = self.inner.write().unwrap();
        while inner
            .entries
            .front()
            .is_some_and(|e| e.timestamp < deadline)
        {
            inner.entries.pop_front();
        }
        match inner.entries.front() {
            Some(first) => {
                let offset = first.offset;
                if offset > inner.low {
                    inner.low = offset;
                }
            }
            None => {
                // Everything up to the current offset is gone.
                inner.low = inner.offset;
            }
        }
    }

    fn filter_by_offset(&self, offset: u64) -> Result<Vec<Entry>, BrokerError> {
        let inner = self.inner.read().unwrap();
        if offset < inner.low {
            return Err(BrokerError::ExpiredOffset {
                offset,
                low: inner.low,
            });
        }
        Ok(inner
            .entries
            .iter()
            .filter(|e| e.offset > offset)
            .cloned()
            .collect())
    }

    fn filter_by_time(&self, since: i64) -> Vec<Entry> {
        let inner = self.inner.read().unwrap();
        inner
            .entries
            .iter()
            .filter(|e| e.timestamp >= since)
            .cloned()
            .collect()
    }
}

struct CachedSession {
    expires_at: Instant,
    data: Vec<u8>,
}

pub struct MemoryBroker {
    broadcaster: Option<Arc<dyn Broadcaster>>,
    config: BrokerConfig,
    tracker: StreamsTracker,
    streams: Arc<RwLock<HashMap<String, Arc<MemStream>>>>,
    epoch: RwLock<String>,
    sessions: Arc<Mutex<HashMap<String, CachedSession>>>,
    shutdown: Mutex<Option<watch::Sender<bool>>>,
}

impl MemoryBroker {
    /// `broadcaster` is None for shadow instances that only store and serve
    /// history (the distributed engine's local copy).
    pub fn new(broadcaster: Option<Arc<dyn Broadcaster>>, config: BrokerConfig) -> Arc<Self> {
        Arc::new(MemoryBroker {
            broadcaster,
            config,
            tracker: StreamsTracker::new(),
            streams: Arc::new(RwLock::new(HashMap::new())),
            epoch: RwLock::new(generate_epoch()),
            sessions: Arc::new(Mutex::new(HashMap::new())),
            shutdown: Mutex::new(None),
        })
    }

    /// The distributed engine adopts the cluster-wide epoch into its shadow.
    pub fn set_epoch(&self, epoch: &str) {
        *self.epoch.write().unwrap() = epoch.to_owned();
    }

    /// Store a stamped entry into the shadow copy of a stream.
    pub fn store(&self, stream: &str, data: &str, offset: u64, timestamp: i64) {
        self.fetch_stream(stream).store(data, offset, timestamp);
    }

    fn fetch_stream(&self, name: &str) -> Arc<MemStream> {
        if let Some(stream) = self.streams.read().unwrap().get(name) {
            return stream.clone();
        }
        let mut streams = self.streams.write().unwrap();
        streams
            .entry(name.to_owned())
            .or_insert_with(|| Arc::new(MemStream::new(self.config.history_limit)))
            .clone()
    }

    fn get_stream(&self, name: &str) -> Option<Arc<MemStream>> {
        self.streams.read().unwrap().get(name).cloned()
    }

    fn add(&self, name: &str, data: &str) -> u64 {
        self.fetch_stream(name).add(data, now_unix())
    }

    fn expire(&self, now_unix: i64, now: Instant) {
        sweep(&self.streams, &self.sessions, self.config.history_ttl, now_unix, now);
    }

    fn entries_to_messages(&self, stream: &str, entries: Vec<Entry>) -> Vec<StreamMessage> {
        let epoch = self.epoch();
        entries
            .into_iter()
            .map(|e| StreamMessage {
                stream: stream.to_owned(),
                data: e.data,
                epoch: epoch.clone(),
                offset: e.offset,
            })
            .collect()
    }

    /// Test/ops hook: the number of cached session snapshots.
    pub fn sessions_cached(&self) -> usize {
        self.sessions.lock().unwrap().len()
    }
}

#[async_trait::async_trait]
impl Broker for MemoryBroker {
    async fn start(&self) -> Result<(), BrokerError> {
        let (tx, mut rx) = watch::channel(false);
        *self.shutdown.lock().unwrap() = Some(tx);

        let streams = self.streams.clone();
        let sessions = self.sessions.clone();
        let history_ttl = self.config.history_ttl;
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_secs(1));
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = tick.tick() => {
                        sweep(&streams, &sessions, history_ttl, now_unix(), Instant::now());
                    }
                    _ = rx.changed() => return,
                }
            }
        });

        Ok(())
    }

    async fn shutdown(&self) {
        if let Some(tx) = self.shutdown.lock().unwrap().take() {
            let _ = tx.send(true);
        }
    }

    async fn handle_broadcast(&self, mut msg: StreamMessage) {
        let offset = self.add(&msg.stream, &msg.data);

        msg.epoch = self.epoch();
        msg.offset = offset;

        if self.tracker.has(&msg.stream) {
            if let Some(broadcaster) = &self.broadcaster {
                broadcaster.route(msg).await;
            }
        }
    }

    async fn subscribe(&self, stream: &str) -> bool {
        self.tracker.add(stream)
    }

    async fn unsubscribe(&self, stream: &str) -> bool {
        self.tracker.remove(stream)
    }

    async fn history_from(
        &self,
        stream: &str,
        epoch: &str,
        offset: u64,
    ) -> Result<Vec<StreamMessage>, BrokerError> {
        let current = self.epoch();
        if current != epoch {
            return Err(BrokerError::UnknownEpoch {
                requested: epoch.to_owned(),
                current,
            });
        }

        let entries = self
            .get_stream(stream)
            .ok_or_else(|| BrokerError::UnknownStream(stream.to_owned()))?
            .filter_by_offset(offset)?;

        Ok(self.entries_to_messages(stream, entries))
    }

    async fn history_since(
        &self,
        stream: &str,
        since: i64,
    ) -> Result<Vec<StreamMessage>, BrokerError> {
        let entries = self
            .get_stream(stream)
            .ok_or_else(|| BrokerError::UnknownStream(stream.to_owned()))?
            .filter_by_time(since);

        Ok(self.entries_to_messages(stream, entries))
    }

    async fn commit_session(&self, sid: &str, snapshot: Vec<u8>) -> Result<(), BrokerError> {
        self.sessions.lock().unwrap().insert(
            sid.to_owned(),
            CachedSession {
                expires_at: Instant::now() + Duration::from_secs(self.config.sessions_ttl),
                data: snapshot,
            },
        );
        Ok(())
    }

    async fn restore_session(&self, sid: &str) -> Result<Option<Vec<u8>>, BrokerError> {
        let sessions = self.sessions.lock().unwrap();
        Ok(sessions.get(sid).and_then(|cached| {
            if cached.expires_at > Instant::now() {
                Some(cached.data.clone())
            } else {
                None
            }
        }))
    }

    fn epoch(&self) -> String {
        self.epoch.read().unwrap().clone()
    }
}

fn sweep(
    streams: &RwLock<HashMap<String, Arc<MemStream>>>,
    sessions: &Mutex<HashMap<String, CachedSession>>,
    history_ttl: u64,
    now_unix: i64,
    now: Instant,
) {
    let deadline = now_unix - history_ttl as i64;
    let streams: Vec<Arc<MemStream>> = streams.read().unwrap().values().cloned().collect();
    for stream in streams {
        stream.expire(deadline);
    }

    sessions
        .lock()
        .unwrap()
        .retain(|_, cached| cached.expires_at > now);
}

fn now_unix() -> i64 {
    chrono::Utc::now().timestamp()
}

#[cfg(test)]
mod tests {
    use super::*;
    use gw_protocol::StreamMessage;
    use std::sync::Mutex as StdMutex;

    struct RecordingBroadcaster {
        routed: StdMutex<Vec<StreamMessage>>,
    }

    impl RecordingBroadcaster {
        fn new() -> Arc<Self> {
            Arc::new(RecordingBroadcaster {
                routed: StdMutex::new(Vec::new()),
            })
        }
    }

    #[async_trait::async_trait]
    impl Broadcaster for RecordingBroadcaster {
        async fn route(&self, msg: StreamMessage) {
            self.routed.lock().unwrap().push(msg);
        }
    }

    fn config(limit: usize) -> BrokerConfig {
        BrokerConfig {
            history_limit: limit,
            ..BrokerConfig::default()
        }
    }

    #[tokio::test]
    async fn offsets_increase_by_one_within_an_epoch() {
        let broker = MemoryBroker::new(None, config(10));
        let epoch = broker.epoch();

        for expected in 1..=3u64 {
            broker
                .handle_broadcast(StreamMessage::new("s", "x"))
                .await;
            let history = broker.history_from("s", &epoch, expected - 1).await.unwrap();
            assert_eq!(history.last().unwrap().offset, expected);
        }
    }

    #[tokio::test]
    async fn restart_changes_epoch_and_resets_offsets() {
        let broker = MemoryBroker::new(None, config(10));
        broker.handle_broadcast(StreamMessage::new("s", "1")).await;
        broker.handle_broadcast(StreamMessage::new("s", "2")).await;
        let old_epoch = broker.epoch();

        let restarted = MemoryBroker::new(None, config(10));
        restarted
            .handle_broadcast(StreamMessage::new("s", "1"))
            .await;

        let history = restarted
            .history_from("s", &restarted.epoch(), 0)
            .await
            .unwrap();
        assert_eq!(history[0].offset, 1);
        assert!(restarted.history_from("s", &old_epoch, 0).await.is_err() || old_epoch == restarted.epoch());
    }

    #[tokio::test]
    async fn limit_overflow_trims_fifo_and_moves_low() {
        let broker = MemoryBroker::new(None, config(3));
        for i in 0..4 {
            broker
                .handle_broadcast(StreamMessage::new("s", &i.to_string()))
                .await;
        }

        let stream = broker.get_stream("s").unwrap();
        let inner = stream.inner.read().unwrap();
        assert_eq!(inner.entries.len(), 3);
        assert_eq!(inner.low, 2);
        assert_eq!(inner.entries.front().unwrap().offset, 2);
    }

    #[tokio::test]
    async fn history_from_returns_exactly_the_tail() {
        let broker = MemoryBroker::new(None, config(10));
        for i in 1..=5 {
            broker
                .handle_broadcast(StreamMessage::new("s", &i.to_string()))
                .await;
        }

        let history = broker.history_from("s", &broker.epoch(), 2).await.unwrap();
        let offsets: Vec<u64> = history.iter().map(|m| m.offset).collect();
        assert_eq!(offsets, vec![3, 4, 5]);
        assert_eq!(history[0].data, "3");

        // Seen everything: empty result, not an error.
        let history = broker.history_from("s", &broker.epoch(), 5).await.unwrap();
        assert!(history.is_empty());
    }

    #[tokio::test]
    async fn history_error_kinds_are_distinct() {
        let broker = MemoryBroker::new(None, config(2));
        for i in 0..4 {
            broker
                .handle_broadcast(StreamMessage::new("s", &i.to_string()))
                .await;
        }

        match broker.history_from("s", "bogus", 0).await {
            Err(BrokerError::UnknownEpoch { .. }) => {}
            other => panic!("expected unknown epoch, got {other:?}"),
        }

        match broker.history_from("s", &broker.epoch(), 1).await {
            Err(BrokerError::ExpiredOffset { offset: 1, low: 3 }) => {}
            other => panic!("expected expired offset, got {other:?}"),
        }

        match broker.history_from("never", &broker.epoch(), 0).await {
            Err(BrokerError::UnknownStream(_)) => {}
            other => panic!("expected unknown stream, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn history_since_filters_by_timestamp() {
        let broker = MemoryBroker::new(None, config(10));
        let stream = broker.fetch_stream("s");
        stream.add("old", 100);
        stream.add("fresh", 200);
        stream.add("newer", 300);

        let history = broker.history_since("s", 200).await.unwrap();
        let data: Vec<&str> = history.iter().map(|m| m.data.as_str()).collect();
        assert_eq!(data, vec!["fresh", "newer"]);
    }

    #[tokio::test]
    async fn expiry_drops_old_entries_and_adjusts_low() {
        let broker = MemoryBroker::new(None, config(10));
        let stream = broker.fetch_stream("s");
        stream.add("old", 100);
        stream.add("old2", 110);
        stream.add("kept", 500);

        stream.expire(200);
        let inner = stream.inner.read().unwrap();
        assert_eq!(inner.entries.len(), 1);
        assert_eq!(inner.low, 3);
        drop(inner);

        // Everything expires: low catches up with the head offset.
        stream.expire(1_000);
        let inner = stream.inner.read().unwrap();
        assert!(inner.entries.is_empty());
        assert_eq!(inner.low, 3);
    }

    #[tokio::test]
    async fn fanout_is_delegated_only_with_local_subscribers() {
        let broadcaster = RecordingBroadcaster::new();
        let broker = MemoryBroker::new(Some(broadcaster.clone()), config(10));

        broker.handle_broadcast(StreamMessage::new("s", "1")).await;
        assert!(broadcaster.routed.lock().unwrap().is_empty());

        assert!(broker.subscribe("s").await);
        broker.handle_broadcast(StreamMessage::new("s", "2")).await;

        let routed = broadcaster.routed.lock().unwrap();
        assert_eq!(routed.len(), 1);
        assert_eq!(routed[0].offset, 2);
        assert_eq!(routed[0].epoch, broker.epoch());
    }

    #[tokio::test]
    async fn session_cache_commit_restore_and_expire() {
        let broker = MemoryBroker::new(None, config(10));
        broker
            .commit_session("sid1", b"blob".to_vec())
            .await
            .unwrap();

        let restored = broker.restore_session("sid1").await.unwrap();
        assert_eq!(restored, Some(b"blob".to_vec()));
        assert_eq!(broker.restore_session("other").await.unwrap(), None);

        broker.expire(now_unix(), Instant::now() + Duration::from_secs(3600));
        assert_eq!(broker.sessions_cached(), 0);
    }

    #[tokio::test]
    async fn shadow_store_ignores_duplicates() {
        let broker = MemoryBroker::new(None, config(10));
        broker.store("s", "a", 5, 100);
        broker.store("s", "a-dup", 5, 100);
        broker.store("s", "b", 6, 101);

        broker.set_epoch("e2");
        let history = broker.history_from("s", "e2", 0).await.unwrap();
        let offsets: Vec<u64> = history.iter().map(|m| m.offset).collect();
        assert_eq!(offsets, vec![5, 6]);
    }
}
