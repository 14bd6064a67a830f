//! Request-id deduplication window.
//!
//! The leader retains every applied request id for the freshness window so
//! a retransmitted update returns its original commit index instead of
//! appending again. Expiry is driven by the timestamp embedded in the id,
//! not the receiving peer's clock at apply time.

use std::collections::HashMap;
use std::time::Duration;

use tracing::debug;

use replog_log::types::{LogIndex, RequestId};

/// Deduplication tunables.
#[derive(Debug, Clone)]
pub struct DedupConfig {
    /// How long a request id stays subject to deduplication.
    pub freshness_window: Duration,
    /// What happens to an update whose id has aged out of the window:
    /// reject it (`true`, the default) or append it as a new entry
    /// (`false`). Never silently re-appended without this opt-in.
    pub expired_rejects: bool,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            freshness_window: Duration::from_secs(8 * 60 * 60),
            expired_rejects: true,
        }
    }
}

/// Outcome of checking an incoming request id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DedupDecision {
    /// Never seen and fresh: append it.
    New,
    /// Already applied: reply with the original commit index.
    Duplicate(LogIndex),
    /// Embedded timestamp outside the freshness window and the window is
    /// configured to reject: refuse the update.
    Expired,
}

/// Map of applied request ids to their commit indices.
pub struct DedupWindow {
    config: DedupConfig,
    applied: HashMap<RequestId, LogIndex>,
    /// Embedded timestamp high-water mark, used to pace sweeps.
    last_sweep_ms: u64,
}

impl DedupWindow {
    /// Creates an empty window.
    pub fn new(config: DedupConfig) -> Self {
        Self {
            config,
            applied: HashMap::new(),
            last_sweep_ms: 0,
        }
    }

    /// Checks an incoming id against the window.
    pub fn check(&mut self, id: &RequestId, now_ms: u64) -> DedupDecision {
        if let Some(index) = self.applied.get(id) {
            return DedupDecision::Duplicate(*index);
        }
        if !id.is_fresh(now_ms, self.config.freshness_window) && self.config.expired_rejects {
            return DedupDecision::Expired;
        }
        DedupDecision::New
    }

    /// Records an applied id. Keeps the first index on re-record, per
    /// idempotent application.
    pub fn record(&mut self, id: RequestId, index: LogIndex) {
        self.applied.entry(id).or_insert(index);
    }

    /// Drops ids whose embedded timestamp has aged out of the window.
    /// Paced: a sweep runs at most once per window quarter.
    pub fn sweep(&mut self, now_ms: u64) {
        let quarter = (self.config.freshness_window.as_millis() as u64 / 4).max(1);
        if now_ms < self.last_sweep_ms + quarter {
            return;
        }
        self.last_sweep_ms = now_ms;
        let window = self.config.freshness_window;
        let before = self.applied.len();
        self.applied.retain(|id, _| id.is_fresh(now_ms, window));
        if before != self.applied.len() {
            debug!(
                evicted = before - self.applied.len(),
                retained = self.applied.len(),
                "dedup window swept"
            );
        }
    }

    /// Number of ids currently retained.
    pub fn len(&self) -> usize {
        self.applied.len()
    }

    /// True when no id is retained.
    pub fn is_empty(&self) -> bool {
        self.applied.is_empty()
    }
}
