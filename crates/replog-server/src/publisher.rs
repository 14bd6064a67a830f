//! Leader-side broadcast publisher.
//!
//! While holding leadership, a peer publishes every committed batch on the
//! fan-out hub and keeps subscribers alive with empty heartbeat messages
//! between batches. A data broadcast resets the heartbeat timer.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::debug;

use replog_log::types::{LogIndex, Term};
use replog_net::broadcast::BroadcastMsg;
use replog_net::transport::{FanoutHub, DEFAULT_FANOUT_CAPACITY};

/// Publisher tunables.
#[derive(Debug, Clone)]
pub struct PublisherConfig {
    /// Interval between heartbeats when no data is flowing.
    pub heartbeat_interval: Duration,
    /// Fan-out ring capacity.
    pub fanout_capacity: usize,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_millis(500),
            fanout_capacity: DEFAULT_FANOUT_CAPACITY,
        }
    }
}

struct PubState {
    term: AtomicU32,
    last_index: AtomicU64,
}

/// Fan-out publisher for one leadership tenure.
pub struct Publisher {
    hub: FanoutHub,
    secret: Vec<u8>,
    url: String,
    state: Arc<PubState>,
    activity: Arc<Notify>,
    heartbeat_task: JoinHandle<()>,
}

impl Publisher {
    /// Starts publishing at `url` with the given starting term and index.
    /// The caller registers [`Publisher::hub`] in its fan-out directory.
    pub fn spawn(
        url: String,
        secret: Vec<u8>,
        term: Term,
        last_index: LogIndex,
        config: PublisherConfig,
    ) -> Self {
        let hub = FanoutHub::new(config.fanout_capacity.max(1));
        let state = Arc::new(PubState {
            term: AtomicU32::new(term.as_u32()),
            last_index: AtomicU64::new(last_index.as_u64()),
        });
        let activity = Arc::new(Notify::new());

        let heartbeat_task = tokio::spawn(heartbeat_loop(
            hub.clone(),
            secret.clone(),
            state.clone(),
            activity.clone(),
            config.heartbeat_interval,
        ));

        Self {
            hub,
            secret,
            url,
            state,
            activity,
            heartbeat_task,
        }
    }

    /// The hub subscribers attach to.
    pub fn hub(&self) -> FanoutHub {
        self.hub.clone()
    }

    /// Advertised publisher URL.
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Checks a subscription secret against the cluster secret.
    pub fn secret_matches(&self, secret: &[u8]) -> bool {
        self.secret == secret
    }

    /// Publishes a batch of committed entries ending at `last_index`.
    /// Returns the number of subscribers reached. Resets the heartbeat
    /// timer.
    pub fn publish(&self, term: Term, last_index: LogIndex, entries: Vec<Vec<u8>>) -> usize {
        self.state.term.store(term.as_u32(), Ordering::Release);
        self.state
            .last_index
            .fetch_max(last_index.as_u64(), Ordering::AcqRel);
        let msg = BroadcastMsg {
            term,
            last_log_index: last_index,
            entries,
        };
        let reached = self.hub.publish(msg.encode(&self.secret));
        self.activity.notify_one();
        reached
    }

    /// Highest index announced so far.
    pub fn last_index(&self) -> LogIndex {
        LogIndex::new(self.state.last_index.load(Ordering::Acquire))
    }
}

impl Drop for Publisher {
    fn drop(&mut self) {
        // Dropping the hub with the task kills pending sends, the
        // linger-free close of §teardown.
        self.heartbeat_task.abort();
    }
}

async fn heartbeat_loop(
    hub: FanoutHub,
    secret: Vec<u8>,
    state: Arc<PubState>,
    activity: Arc<Notify>,
    interval: Duration,
) {
    loop {
        tokio::select! {
            // A data broadcast restarts the countdown.
            _ = activity.notified() => continue,
            _ = tokio::time::sleep(interval) => {}
        }
        let term = Term::new(state.term.load(Ordering::Acquire));
        let last = LogIndex::new(state.last_index.load(Ordering::Acquire));
        let reached = hub.publish(BroadcastMsg::heartbeat(term, last).encode(&secret));
        debug!(
            term = term.as_u32(),
            last_index = last.as_u64(),
            subscribers = reached,
            "heartbeat"
        );
    }
}
