//! Typed RPC message bodies.
//!
//! Request bodies are hand-framed (see [`crate::frames`]); response bodies
//! are bincode-encoded structs, except entry-stream chunks which keep a
//! fixed binary header so chunk relays never need a full decode.

use serde::{Deserialize, Serialize};

use replog_log::types::{LogIndex, RequestId, Term};

use crate::url::PeerUrl;

/// Reason string carried by [`Response::Error`] on a cluster-secret
/// mismatch. Clients map it to their fatal auth-failure error.
pub const AUTH_FAILURE_MSG: &str = "wrong cluster secret";

/// One peer of the cluster configuration.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerInfo {
    /// Stable peer identifier.
    pub id: u64,
    /// Validated peer address.
    pub url: PeerUrl,
}

/// Reply to a `?` request-config.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigInfo {
    /// Current cluster membership.
    pub peers: Vec<PeerInfo>,
    /// The replying peer's opinion of the leader, if any.
    pub leader_id: Option<u64>,
}

/// Reply to an `i` request-log-info.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogInfo {
    /// True if the replying peer is the leader.
    pub is_leader: bool,
    /// The replying peer's opinion of the leader, if any.
    pub leader_id: Option<u64>,
    /// Current Raft term.
    pub current_term: Term,
    /// First index logically present in the log.
    pub first_index: LogIndex,
    /// Index applied to the peer's state machine.
    pub last_applied: LogIndex,
    /// Commit index.
    pub commit_index: LogIndex,
    /// Highest index present in the log.
    pub last_index: LogIndex,
    /// Index up to which segments may be pruned.
    pub prune_index: LogIndex,
    /// Size in bytes of the current snapshot (0 if none).
    pub snapshot_size: u64,
}

/// Status byte of an update reply.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum UpdateStatus {
    /// The request was committed (or had already been committed under the
    /// same request id; the original index is returned either way).
    Committed,
    /// The request id's embedded timestamp fell outside the freshness
    /// window and the cluster is configured to reject such updates.
    StaleRequest,
}

/// Reply to a `u` request-update.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateReply {
    /// Outcome of the update.
    pub status: UpdateStatus,
    /// Commit index assigned to the request id (for `Committed`).
    pub commit_index: LogIndex,
}

/// A decoded RPC request.
#[derive(Clone, Debug, PartialEq)]
pub enum Request {
    /// `?` — cluster configuration.
    Config,
    /// `i` — log info tuple.
    LogInfo,
    /// `u` — append an update.
    Update {
        /// Producer-assigned dedup token.
        request_id: RequestId,
        /// Opaque payload.
        payload: Vec<u8>,
    },
    /// `e` — stream entries (or a snapshot transfer) from an index.
    Entries {
        /// First index requested.
        from: LogIndex,
        /// Byte budget for the reply stream (0 = server default).
        byte_budget: u64,
        /// Entry count limit (0 = server default).
        count_limit: u32,
    },
    /// `*` — fan-out publisher URL for this cluster secret.
    PublisherUrl {
        /// Cluster secret acting as the subscription filter.
        secret: Vec<u8>,
    },
}

/// Status of an entry-stream chunk.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum ChunkStatus {
    /// Chunk carries one encoded log entry.
    Entries = 0,
    /// Chunk belongs to a snapshot transfer.
    Snapshot = 1,
    /// Stream finished cleanly; no payload.
    Done = 2,
    /// Stream aborted server-side; payload is a UTF-8 reason.
    Error = 3,
}

impl ChunkStatus {
    /// Decodes a status byte.
    pub fn from_u8(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(ChunkStatus::Entries),
            1 => Some(ChunkStatus::Snapshot),
            2 => Some(ChunkStatus::Done),
            3 => Some(ChunkStatus::Error),
            _ => None,
        }
    }
}

/// One message of an entry stream.
#[derive(Clone, Debug, PartialEq)]
pub struct EntriesChunk {
    /// What the payload carries.
    pub status: ChunkStatus,
    /// For `Entries`: the entry's log index. For `Snapshot`: the
    /// snapshot's last included index.
    pub last_index: LogIndex,
    /// For `Snapshot`: offset of this chunk within the snapshot data.
    pub byte_offset: u64,
    /// For `Snapshot`: total snapshot data size.
    pub byte_size: u64,
    /// For `Snapshot`: true on the final chunk of the transfer.
    pub is_last: bool,
    /// Encoded entry bytes or raw snapshot bytes.
    pub payload: Vec<u8>,
}

impl EntriesChunk {
    /// Chunk wrapping one encoded entry.
    pub fn entry(index: LogIndex, encoded: Vec<u8>) -> Self {
        Self {
            status: ChunkStatus::Entries,
            last_index: index,
            byte_offset: 0,
            byte_size: 0,
            is_last: false,
            payload: encoded,
        }
    }

    /// Chunk of a snapshot transfer.
    pub fn snapshot(
        last_included: LogIndex,
        byte_offset: u64,
        byte_size: u64,
        is_last: bool,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            status: ChunkStatus::Snapshot,
            last_index: last_included,
            byte_offset,
            byte_size,
            is_last,
            payload,
        }
    }

    /// End-of-stream marker carrying the last index served.
    pub fn done(last_index: LogIndex) -> Self {
        Self {
            status: ChunkStatus::Done,
            last_index,
            byte_offset: 0,
            byte_size: 0,
            is_last: true,
            payload: Vec::new(),
        }
    }

    /// Server-side stream abort.
    pub fn error(reason: &str) -> Self {
        Self {
            status: ChunkStatus::Error,
            last_index: LogIndex::ZERO,
            byte_offset: 0,
            byte_size: 0,
            is_last: true,
            payload: reason.as_bytes().to_vec(),
        }
    }
}

/// A decoded RPC response.
#[derive(Clone, Debug, PartialEq)]
pub enum Response {
    /// Reply to `?`.
    Config(ConfigInfo),
    /// Reply to `i`.
    LogInfo(LogInfo),
    /// Reply to `u`.
    Update(UpdateReply),
    /// One message of an `e` stream.
    Chunk(EntriesChunk),
    /// Reply to `*`; None when no publisher is active for the secret.
    PublisherUrl(Option<String>),
    /// The contacted peer is not the leader but knows who is.
    Redirect {
        /// Leader's peer id.
        leader_id: u64,
        /// Leader's address.
        leader_url: String,
    },
    /// The contacted peer is not the leader and has no leader opinion.
    NoLeader,
    /// Request-level failure (wrong secret, malformed request, ...).
    Error {
        /// Human-readable reason.
        msg: String,
    },
}
