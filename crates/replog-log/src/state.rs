//! State machine seam fed by the replicated log.
//!
//! Applications sit behind [`StateMachine`]; the log drives them strictly in
//! index order. Compaction serializes a machine's state into a snapshot file.

use crate::error::{LogError, LogResult};
use crate::types::{LogEntry, LogIndex};

/// An application state machine fed from the replicated log.
pub trait StateMachine: Send {
    /// Applies one committed entry. Entries arrive in strict index order,
    /// each exactly once per machine instance.
    fn apply(&mut self, entry: &LogEntry) -> LogResult<()>;

    /// Index of the last entry applied; `LogIndex::ZERO` before the first.
    fn last_applied(&self) -> LogIndex;

    /// Backpressure signal: false pauses feeding until the machine is ready
    /// again.
    fn ready(&self) -> bool {
        true
    }

    /// Serializes the machine state for snapshotting, or None if this
    /// machine cannot be snapshotted.
    fn serialize(&self) -> Option<Vec<u8>> {
        None
    }
}

/// In-memory state machine retaining every applied payload.
///
/// Serves as the built-in machine for compaction of opaque payloads and as
/// the workhorse of the test suites.
#[derive(Debug, Default)]
pub struct VecState {
    entries: Vec<(LogIndex, Vec<u8>)>,
    last_applied: LogIndex,
    ready: bool,
}

impl VecState {
    /// Creates an empty machine.
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            last_applied: LogIndex::ZERO,
            ready: true,
        }
    }

    /// Restores a machine from serialized snapshot data.
    pub fn restore(data: &[u8], last_applied: LogIndex) -> LogResult<Self> {
        let entries: Vec<(LogIndex, Vec<u8>)> =
            bincode::deserialize(data).map_err(|e| LogError::InvalidArgument {
                msg: format!("undecodable snapshot state: {e}"),
            })?;
        Ok(Self {
            entries,
            last_applied,
            ready: true,
        })
    }

    /// Flips the backpressure signal (used by tests and throttled feeders).
    pub fn set_ready(&mut self, ready: bool) {
        self.ready = ready;
    }

    /// Returns the applied payloads in order.
    pub fn payloads(&self) -> impl Iterator<Item = &[u8]> {
        self.entries.iter().map(|(_, p)| p.as_slice())
    }

    /// Number of applied entries retained.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True if no entry has been applied.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl StateMachine for VecState {
    fn apply(&mut self, entry: &LogEntry) -> LogResult<()> {
        if entry.index != self.last_applied.next() {
            return Err(LogError::InvalidArgument {
                msg: format!(
                    "apply out of order: got {}, expected {}",
                    entry.index,
                    self.last_applied.next()
                ),
            });
        }
        self.entries.push((entry.index, entry.payload.clone()));
        self.last_applied = entry.index;
        Ok(())
    }

    fn last_applied(&self) -> LogIndex {
        self.last_applied
    }

    fn ready(&self) -> bool {
        self.ready
    }

    fn serialize(&self) -> Option<Vec<u8>> {
        bincode::serialize(&self.entries).ok()
    }
}
