//! Rate-limited remote disconnect queue.
//!
//! Sessions that go away are queued here; a fixed-rate ticker pops one per
//! tick and fires the command server's Disconnect call, so a reconnect
//! storm cannot flood the RPC backend. Enqueue never blocks: when the queue
//! is full the entry is dropped with a warning — the connection is already
//! gone and the call is best-effort.

use gw_protocol::SessionEnv;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

use crate::controller::Controller;

/// Everything the Disconnect RPC needs, captured at enqueue time; the
/// session itself may be dropped long before the call fires.
#[derive(Debug, Clone)]
pub struct DisconnectTask {
    pub sid: String,
    pub env: SessionEnv,
    pub identifiers: String,
    pub subscriptions: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct DisconnectorConfig {
    /// Disconnect calls per second.
    pub rate: u64,
    /// How long `drain` keeps working the queue on shutdown.
    pub shutdown_timeout: Duration,
    pub queue_size: usize,
}

impl Default for DisconnectorConfig {
    fn default() -> Self {
        DisconnectorConfig {
            rate: 100,
            shutdown_timeout: Duration::from_secs(5),
            queue_size: 4096,
        }
    }
}

pub struct DisconnectQueue {
    tx: mpsc::Sender<DisconnectTask>,
    shutdown: watch::Sender<bool>,
    capacity: usize,
}

impl DisconnectQueue {
    pub fn new(controller: Arc<dyn Controller>, config: &DisconnectorConfig) -> Arc<Self> {
        let (tx, rx) = mpsc::channel(config.queue_size.max(1));
        let (shutdown, shutdown_rx) = watch::channel(false);

        tokio::spawn(run(
            controller,
            rx,
            shutdown_rx,
            Duration::from_millis(1000 / config.rate.max(1)),
        ));

        Arc::new(DisconnectQueue {
            tx,
            shutdown,
            capacity: config.queue_size.max(1),
        })
    }

    /// Non-blocking; a full queue drops the task.
    pub fn enqueue(&self, task: DisconnectTask) {
        if let Err(e) = self.tx.try_send(task) {
            match e {
                mpsc::error::TrySendError::Full(task) => {
                    warn!(sid = %task.sid, "disconnect queue is full, dropping");
                }
                mpsc::error::TrySendError::Closed(_) => {}
            }
        }
    }

    pub fn size(&self) -> usize {
        self.capacity - self.tx.capacity()
    }

    /// Work the queue until it is empty or the shutdown budget elapses;
    /// whatever remains is dropped with a log line.
    pub async fn drain(&self, timeout: Duration) {
        let deadline = tokio::time::Instant::now() + timeout;
        while self.size() > 0 {
            if tokio::time::Instant::now() >= deadline {
                warn!(remaining = self.size(), "disconnect queue not drained, dropping the rest");
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let _ = self.shutdown.send(true);
    }
}

async fn run(
    controller: Arc<dyn Controller>,
    mut rx: mpsc::Receiver<DisconnectTask>,
    mut shutdown: watch::Receiver<bool>,
    tick: Duration,
) {
    debug!(tick = ?tick, "disconnect rate");
    let mut throttle = tokio::time::interval(tick);
    throttle.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            task = rx.recv() => {
                let Some(task) = task else { return };
                throttle.tick().await;
                debug!(sid = %task.sid, identifiers = %task.identifiers, "commit disconnect");
                if let Err(e) = controller
                    .disconnect(&task.sid, &task.env, &task.identifiers, task.subscriptions)
                    .await
                {
                    warn!(sid = %task.sid, error = %e, "disconnect call failed");
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    return;
                }
            }
        }
    }
}
