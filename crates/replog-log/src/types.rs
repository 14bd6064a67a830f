//! Core identifier and entry types shared across the replog crates.

use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rand::RngCore;
use serde::{Deserialize, Serialize};

/// Position of an entry in the replicated log.
///
/// Indices are dense and strictly increasing from 1; index 0 is reserved to
/// mean "no entry".
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LogIndex(u64);

impl LogIndex {
    /// The reserved "no entry" index.
    pub const ZERO: LogIndex = LogIndex(0);

    /// Creates a new LogIndex from a raw u64 value.
    pub fn new(i: u64) -> Self {
        LogIndex(i)
    }

    /// Returns the raw u64 value of this index.
    pub fn as_u64(&self) -> u64 {
        self.0
    }

    /// Returns the index immediately after this one.
    pub fn next(&self) -> LogIndex {
        LogIndex(self.0 + 1)
    }

    /// Returns the index immediately before this one, saturating at zero.
    pub fn prev(&self) -> LogIndex {
        LogIndex(self.0.saturating_sub(1))
    }

    /// Returns true if this is the reserved "no entry" index.
    pub fn is_zero(&self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for LogIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Leader epoch number. Non-decreasing along the log.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Term(u32);

impl Term {
    /// A zero term.
    pub const ZERO: Term = Term(0);

    /// Creates a new Term from a raw u32 value.
    pub fn new(t: u32) -> Self {
        Term(t)
    }

    /// Returns the raw u32 value of this term.
    pub fn as_u32(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for Term {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Width of a request identifier in bytes.
pub const REQUEST_ID_LEN: usize = 12;

/// Opaque 12-byte token uniquely identifying an update request.
///
/// The first 6 bytes carry the low 48 bits of the producer's unix-millisecond
/// clock (big-endian); the remaining 6 bytes are entropy. The embedded clock
/// drives deduplication-window expiry on the leader.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RequestId([u8; REQUEST_ID_LEN]);

impl RequestId {
    /// Generates a fresh request id stamped with the current wall clock.
    pub fn generate() -> Self {
        let now_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;
        Self::from_parts(now_ms, rand::thread_rng().next_u64())
    }

    /// Builds a request id from an explicit timestamp and entropy value.
    pub fn from_parts(timestamp_ms: u64, entropy: u64) -> Self {
        let mut bytes = [0u8; REQUEST_ID_LEN];
        bytes[..6].copy_from_slice(&timestamp_ms.to_be_bytes()[2..8]);
        bytes[6..].copy_from_slice(&entropy.to_be_bytes()[2..8]);
        RequestId(bytes)
    }

    /// Wraps raw bytes as a request id.
    pub fn from_bytes(bytes: [u8; REQUEST_ID_LEN]) -> Self {
        RequestId(bytes)
    }

    /// Returns the raw bytes of this request id.
    pub fn as_bytes(&self) -> &[u8; REQUEST_ID_LEN] {
        &self.0
    }

    /// Extracts the embedded unix-millisecond timestamp.
    pub fn timestamp_ms(&self) -> u64 {
        let mut buf = [0u8; 8];
        buf[2..8].copy_from_slice(&self.0[..6]);
        u64::from_be_bytes(buf)
    }

    /// Returns true if the embedded timestamp is within `window` of `now_ms`.
    ///
    /// Ids stamped slightly in the future (clock skew) count as fresh.
    pub fn is_fresh(&self, now_ms: u64, window: Duration) -> bool {
        let ts = self.timestamp_ms();
        ts + window.as_millis() as u64 >= now_ms
    }

    /// Returns true if every byte is zero. Zero ids are rejected as invalid.
    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|b| *b == 0)
    }
}

impl fmt::Debug for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RequestId(")?;
        for b in &self.0 {
            write!(f, "{:02x}", b)?;
        }
        write!(f, ")")
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in &self.0 {
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}

/// Kind of a log entry.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    /// Opaque application state update.
    State,
    /// Cluster membership change.
    Config,
    /// Compaction checkpoint marker.
    Checkpoint,
}

impl EntryKind {
    /// Returns the one-byte wire tag for this kind.
    pub fn as_u8(&self) -> u8 {
        match self {
            EntryKind::State => 0,
            EntryKind::Config => 1,
            EntryKind::Checkpoint => 2,
        }
    }

    /// Decodes a wire tag. Returns None for unknown tags.
    pub fn from_u8(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(EntryKind::State),
            1 => Some(EntryKind::Config),
            2 => Some(EntryKind::Checkpoint),
            _ => None,
        }
    }
}

/// An immutable replicated log entry.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    /// Position in the log.
    pub index: LogIndex,
    /// Leader term that produced the entry.
    pub term: Term,
    /// Entry kind.
    pub kind: EntryKind,
    /// Producer-assigned deduplication token.
    pub request_id: RequestId,
    /// Opaque payload bytes.
    pub payload: Vec<u8>,
}

impl LogEntry {
    /// Creates a new state entry.
    pub fn state(index: LogIndex, term: Term, request_id: RequestId, payload: Vec<u8>) -> Self {
        Self {
            index,
            term,
            kind: EntryKind::State,
            request_id,
            payload,
        }
    }

    /// Creates a new config entry carrying an encoded peer set.
    pub fn config(index: LogIndex, term: Term, request_id: RequestId, payload: Vec<u8>) -> Self {
        Self {
            index,
            term,
            kind: EntryKind::Config,
            request_id,
            payload,
        }
    }
}

/// Metadata identifying a snapshot's coverage of the log prefix.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotMeta {
    /// Highest log index the snapshot covers.
    pub last_included_index: LogIndex,
    /// Term of the last covered entry.
    pub last_included_term: Term,
    /// Size of the opaque snapshot data in bytes.
    pub data_size: u64,
}
