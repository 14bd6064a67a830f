//! Broadcast (fan-out) message format.
//!
//! Every broadcast message is framed as
//! `[secret | term u32 LE | last_log_index u64 LE | entry_0 | entry_1 | ...]`.
//! A heartbeat is the same message with zero entries. The secret doubles as
//! the subscription filter and a cluster-identity check.

use bytes::Bytes;

use replog_log::codec::decode_entry;
use replog_log::types::{LogEntry, LogIndex, Term};

use crate::error::{NetError, NetResult};
use crate::frames::Frames;

/// A decoded broadcast message.
#[derive(Clone, Debug, PartialEq)]
pub struct BroadcastMsg {
    /// Publisher's current term.
    pub term: Term,
    /// Highest committed index as of this message.
    pub last_log_index: LogIndex,
    /// Encoded entries ending at `last_log_index` (empty for a heartbeat).
    pub entries: Vec<Vec<u8>>,
}

impl BroadcastMsg {
    /// A liveness heartbeat carrying no entries.
    pub fn heartbeat(term: Term, last_log_index: LogIndex) -> Self {
        Self {
            term,
            last_log_index,
            entries: Vec::new(),
        }
    }

    /// True if this message carries no entries.
    pub fn is_heartbeat(&self) -> bool {
        self.entries.is_empty()
    }

    /// Index immediately before the first entry in this message
    /// (`last_log_index - len(entries)`).
    pub fn prev_index(&self) -> LogIndex {
        LogIndex::new(
            self.last_log_index
                .as_u64()
                .saturating_sub(self.entries.len() as u64),
        )
    }

    /// Encodes the message with the given cluster secret.
    pub fn encode(&self, secret: &[u8]) -> Frames {
        let mut frames = Vec::with_capacity(3 + self.entries.len());
        frames.push(Bytes::copy_from_slice(secret));
        frames.push(Bytes::copy_from_slice(&self.term.as_u32().to_le_bytes()));
        frames.push(Bytes::copy_from_slice(
            &self.last_log_index.as_u64().to_le_bytes(),
        ));
        for entry in &self.entries {
            frames.push(Bytes::copy_from_slice(entry));
        }
        frames
    }

    /// Decodes a message, checking the cluster secret.
    pub fn decode(frames: &Frames, secret: &[u8]) -> NetResult<Self> {
        if frames.len() < 3 {
            return Err(NetError::frame(format!(
                "broadcast message needs at least 3 frames, got {}",
                frames.len()
            )));
        }
        if frames[0].as_ref() != secret {
            return Err(NetError::AuthFailure);
        }
        let term: [u8; 4] = frames[1]
            .as_ref()
            .try_into()
            .map_err(|_| NetError::frame("term frame must be 4 bytes"))?;
        let last: [u8; 8] = frames[2]
            .as_ref()
            .try_into()
            .map_err(|_| NetError::frame("last_log_index frame must be 8 bytes"))?;
        Ok(Self {
            term: Term::new(u32::from_le_bytes(term)),
            last_log_index: LogIndex::new(u64::from_le_bytes(last)),
            entries: frames[3..].iter().map(|f| f.to_vec()).collect(),
        })
    }

    /// Decodes the carried entries.
    pub fn decoded_entries(&self) -> NetResult<Vec<LogEntry>> {
        self.entries
            .iter()
            .map(|bytes| {
                decode_entry(bytes).map_err(|e| NetError::frame(format!("bad entry: {e}")))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use replog_log::codec::encode_entry;
    use replog_log::types::RequestId;

    fn encoded(index: u64) -> Vec<u8> {
        encode_entry(&LogEntry::state(
            LogIndex::new(index),
            Term::new(2),
            RequestId::from_parts(1_700_000_000_000, index),
            vec![index as u8],
        ))
    }

    #[test]
    fn test_heartbeat_roundtrip() {
        let msg = BroadcastMsg::heartbeat(Term::new(5), LogIndex::new(99));
        let frames = msg.encode(b"secret");
        assert_eq!(frames.len(), 3);
        let back = BroadcastMsg::decode(&frames, b"secret").unwrap();
        assert_eq!(back, msg);
        assert!(back.is_heartbeat());
        assert_eq!(back.prev_index(), LogIndex::new(99));
    }

    #[test]
    fn test_entries_roundtrip() {
        let msg = BroadcastMsg {
            term: Term::new(2),
            last_log_index: LogIndex::new(12),
            entries: vec![encoded(11), encoded(12)],
        };
        let frames = msg.encode(b"s");
        let back = BroadcastMsg::decode(&frames, b"s").unwrap();
        assert_eq!(back, msg);
        assert_eq!(back.prev_index(), LogIndex::new(10));
        let entries = back.decoded_entries().unwrap();
        assert_eq!(entries[0].index, LogIndex::new(11));
        assert_eq!(entries[1].index, LogIndex::new(12));
    }

    #[test]
    fn test_wrong_secret_is_auth_failure() {
        let msg = BroadcastMsg::heartbeat(Term::new(1), LogIndex::new(1));
        let frames = msg.encode(b"right");
        assert!(matches!(
            BroadcastMsg::decode(&frames, b"wrong"),
            Err(NetError::AuthFailure)
        ));
    }

    #[test]
    fn test_truncated_message_rejected() {
        let msg = BroadcastMsg::heartbeat(Term::new(1), LogIndex::new(1));
        let mut frames = msg.encode(b"s");
        frames.pop();
        assert!(matches!(
            BroadcastMsg::decode(&frames, b"s"),
            Err(NetError::InvalidFrame { .. })
        ));
    }

    #[test]
    fn test_prev_index_saturates() {
        let msg = BroadcastMsg {
            term: Term::new(1),
            last_log_index: LogIndex::new(1),
            entries: vec![encoded(1), encoded(1)],
        };
        assert_eq!(msg.prev_index(), LogIndex::ZERO);
    }
}
