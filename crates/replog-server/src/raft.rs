//! Seam to the Raft collaborator.
//!
//! Leader election and log replication are assumed correct per the Raft
//! paper and live outside this workspace. The core consumes the interfaces
//! below: the read surface of [`RaftHandle`], the commit-advance hook the
//! log service drives after a durable leader append, and the persisted
//! `raft-state` file read at startup.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use replog_log::types::{LogIndex, Term};
use replog_net::message::PeerInfo;

use crate::error::{ServerError, ServerResult};

/// Raft role of a peer.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Role {
    /// Accepts updates and publishes broadcasts.
    Leader,
    /// Replicates from the leader.
    Follower,
    /// Electing.
    Candidate,
}

/// Quorum size for `n` voting peers; a zero-peer cluster still needs one
/// acknowledgement (the writer itself).
pub fn majority_of(n: usize) -> usize {
    if n == 0 {
        1
    } else {
        n / 2 + 1
    }
}

/// Read surface of the Raft collaborator, plus the commit hook the log
/// service drives once a leader append is durable.
pub trait RaftHandle: Send + Sync {
    /// This peer's id.
    fn id(&self) -> u64;
    /// Current role.
    fn role(&self) -> Role;
    /// Current opinion of the leader, if any.
    fn leader_hint(&self) -> Option<u64>;
    /// Current term.
    fn current_term(&self) -> Term;
    /// Highest committed index.
    fn commit_index(&self) -> LogIndex;
    /// Current cluster membership.
    fn cluster(&self) -> Vec<PeerInfo>;
    /// Advances the commit index after replication reaches a majority.
    fn advance_commit(&self, index: LogIndex);
}

/// Contents of the persisted `raft-state` file: `{current_term, voted_for,
/// peers}`. Owned by the Raft collaborator; the core reads it at startup
/// and writes it only when bootstrapping a fresh data directory.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PersistentState {
    /// Term at last shutdown.
    pub current_term: Term,
    /// Vote cast in the current term, if any.
    pub voted_for: Option<u64>,
    /// Known cluster membership.
    pub peers: Vec<PeerInfo>,
}

/// File name of the persisted raft state under the data root.
pub const RAFT_STATE_FILE: &str = "raft-state";

/// Loads the persisted raft state. None when the file does not exist.
pub fn load_state(data_root: &Path) -> ServerResult<Option<PersistentState>> {
    let path = data_root.join(RAFT_STATE_FILE);
    if !path.exists() {
        return Ok(None);
    }
    let bytes = fs::read(&path)?;
    let state = bincode::deserialize(&bytes).map_err(|e| ServerError::RaftState {
        msg: format!("{}: {e}", path.display()),
    })?;
    Ok(Some(state))
}

/// Atomically persists the raft state (write temp, fsync, rename).
pub fn store_state(data_root: &Path, state: &PersistentState) -> ServerResult<()> {
    let path = data_root.join(RAFT_STATE_FILE);
    let tmp = data_root.join(format!("{RAFT_STATE_FILE}.tmp"));
    let bytes = bincode::serialize(state).map_err(|e| ServerError::RaftState {
        msg: e.to_string(),
    })?;
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(&tmp)?;
    file.write_all(&bytes)?;
    file.sync_all()?;
    fs::rename(&tmp, &path)?;
    File::open(data_root)?.sync_all()?;
    Ok(())
}

/// Single-peer Raft: the lone peer is always leader and every durable
/// append commits immediately (majority of 1).
pub struct SoloRaft {
    me: PeerInfo,
    term: Term,
    commit: AtomicU64,
}

impl SoloRaft {
    /// Creates a solo leader at `term` with `commit` already reached.
    pub fn new(me: PeerInfo, term: Term, commit: LogIndex) -> Self {
        Self {
            me,
            term,
            commit: AtomicU64::new(commit.as_u64()),
        }
    }
}

impl RaftHandle for SoloRaft {
    fn id(&self) -> u64 {
        self.me.id
    }

    fn role(&self) -> Role {
        Role::Leader
    }

    fn leader_hint(&self) -> Option<u64> {
        Some(self.me.id)
    }

    fn current_term(&self) -> Term {
        self.term
    }

    fn commit_index(&self) -> LogIndex {
        LogIndex::new(self.commit.load(Ordering::Acquire))
    }

    fn cluster(&self) -> Vec<PeerInfo> {
        vec![self.me.clone()]
    }

    fn advance_commit(&self, index: LogIndex) {
        self.commit.fetch_max(index.as_u64(), Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use replog_net::url::PeerUrl;

    fn me() -> PeerInfo {
        PeerInfo {
            id: 1,
            url: PeerUrl::parse("tcp://127.0.0.1:4087").unwrap(),
        }
    }

    #[test]
    fn test_majority_boundaries() {
        assert_eq!(majority_of(0), 1);
        assert_eq!(majority_of(1), 1);
        assert_eq!(majority_of(2), 2);
        assert_eq!(majority_of(3), 2);
        assert_eq!(majority_of(4), 3);
        assert_eq!(majority_of(5), 3);
    }

    #[test]
    fn test_solo_raft_is_leader_of_one() {
        let raft = SoloRaft::new(me(), Term::new(3), LogIndex::new(10));
        assert_eq!(raft.role(), Role::Leader);
        assert_eq!(raft.leader_hint(), Some(1));
        assert_eq!(raft.cluster().len(), 1);
        assert_eq!(raft.commit_index(), LogIndex::new(10));

        raft.advance_commit(LogIndex::new(12));
        assert_eq!(raft.commit_index(), LogIndex::new(12));
        // Commit never regresses.
        raft.advance_commit(LogIndex::new(11));
        assert_eq!(raft.commit_index(), LogIndex::new(12));
    }

    #[test]
    fn test_state_file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load_state(dir.path()).unwrap().is_none());

        let state = PersistentState {
            current_term: Term::new(7),
            voted_for: Some(1),
            peers: vec![me()],
        };
        store_state(dir.path(), &state).unwrap();
        assert_eq!(load_state(dir.path()).unwrap(), Some(state.clone()));

        // Overwrite is atomic and idempotent.
        store_state(dir.path(), &state).unwrap();
        assert_eq!(load_state(dir.path()).unwrap(), Some(state));
    }

    #[test]
    fn test_corrupt_state_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(RAFT_STATE_FILE), b"\xff\x00garbage").unwrap();
        assert!(load_state(dir.path()).is_err());
    }
}
