//! Stream read/write synchronization for the distributed engine.
//!
//! Consuming a message calls `touch`, which marks the stream active and
//! (re)arms a short timer; history readers call `sync`, which blocks until
//! the timer fires or a hard ceiling elapses. A history read therefore
//! observes every message consumed in the brief window before it returned.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;

const SYNC_PERIOD: Duration = Duration::from_millis(50);
const SYNC_TIMEOUT: Duration = Duration::from_millis(200);

pub struct StreamsSynchronizer {
    entries: RwLock<HashMap<String, Arc<StreamSync>>>,
    period: Duration,
    timeout: Duration,
}

impl Default for StreamsSynchronizer {
    fn default() -> Self {
        StreamsSynchronizer::new(SYNC_PERIOD, SYNC_TIMEOUT)
    }
}

impl StreamsSynchronizer {
    pub fn new(period: Duration, timeout: Duration) -> Self {
        StreamsSynchronizer {
            entries: RwLock::new(HashMap::new()),
            period,
            timeout,
        }
    }

    /// Block until the stream has been quiet for one sync period (or until
    /// the hard ceiling). Streams under no active consumption return
    /// immediately.
    pub async fn sync(&self, stream: &str) {
        let entry = self.entries.read().unwrap().get(stream).cloned();
        if let Some(entry) = entry {
            entry.wait(self.timeout).await;
        }
    }

    /// Mark the stream active; called for every consumed message.
    pub fn touch(&self, stream: &str) {
        if let Some(entry) = self.entries.read().unwrap().get(stream) {
            entry.restart(self.period, self.timeout);
            return;
        }

        let entry = {
            let mut entries = self.entries.write().unwrap();
            entries
                .entry(stream.to_owned())
                .or_insert_with(|| Arc::new(StreamSync::new()))
                .clone()
        };
        entry.restart(self.period, self.timeout);
    }

    /// The stream is no longer consumed locally; release any waiters.
    pub fn remove(&self, stream: &str) {
        let entry = self.entries.write().unwrap().remove(stream);
        if let Some(entry) = entry {
            entry.idle();
        }
    }
}

struct SyncInner {
    active: bool,
    active_since: Instant,
    deadline: Instant,
    /// Generation counter bumped on every idle transition.
    idle_tx: watch::Sender<u64>,
    timer: Option<JoinHandle<()>>,
}

struct StreamSync {
    inner: Mutex<SyncInner>,
}

impl StreamSync {
    fn new() -> Self {
        let (idle_tx, _) = watch::channel(0);
        StreamSync {
            inner: Mutex::new(SyncInner {
                active: false,
                active_since: Instant::now(),
                deadline: Instant::now(),
                idle_tx,
                timer: None,
            }),
        }
    }

    async fn wait(self: &Arc<Self>, ceiling: Duration) {
        let mut rx = {
            let inner = self.inner.lock().unwrap();
            if !inner.active {
                return;
            }
            inner.idle_tx.subscribe()
        };

        let _ = tokio::time::timeout(ceiling, rx.changed()).await;
    }

    fn restart(self: &Arc<Self>, period: Duration, ceiling: Duration) {
        let now = Instant::now();
        {
            let mut inner = self.inner.lock().unwrap();
            if inner.active {
                if inner.active_since + ceiling < now {
                    // The stream has been hot past the hard ceiling; let
                    // readers through rather than starving them.
                    drop(inner);
                    self.idle();
                    return;
                }
                inner.deadline = now + period;
                return;
            }

            inner.active = true;
            inner.active_since = now;
            inner.deadline = now + period;
        }

        let sync = self.clone();
        let handle = tokio::spawn(async move {
            loop {
                let deadline = sync.inner.lock().unwrap().deadline;
                tokio::time::sleep_until(deadline).await;

                let mut inner = sync.inner.lock().unwrap();
                if !inner.active {
                    return;
                }
                if Instant::now() >= inner.deadline {
                    inner.active = false;
                    inner.timer = None;
                    inner.idle_tx.send_modify(|g| *g = g.wrapping_add(1));
                    return;
                }
                // deadline was pushed by another touch; sleep again
            }
        });
        self.inner.lock().unwrap().timer = Some(handle);
    }

    fn idle(&self) {
        let mut inner = self.inner.lock().unwrap();
        if !inner.active {
            return;
        }
        inner.active = false;
        if let Some(timer) = inner.timer.take() {
            timer.abort();
        }
        inner.idle_tx.send_modify(|g| *g = g.wrapping_add(1));
    }
}
