//! Entry stream reader.
//!
//! Wraps the streamed replies of an `e` RPC into typed items and enforces
//! cursor consistency: entries must arrive densely from the requested
//! index, snapshot chunks must arrive in offset order. Any violation
//! surfaces as [`ClientError::OutOfOrder`], which callers resolve by
//! reopening the stream from [`EntriesStream::next_index`].

use std::time::Duration;

use tokio::time::timeout;

use replog_log::codec::decode_entry;
use replog_log::types::{LogEntry, LogIndex};
use replog_net::frames::decode_response;
use replog_net::message::{ChunkStatus, EntriesChunk, Response};
use replog_net::transport::ReplyStream;

use crate::error::{ClientError, ClientResult};

/// One chunk of a snapshot transfer.
#[derive(Clone, Debug, PartialEq)]
pub struct SnapshotChunk {
    /// Snapshot coverage: all entries up to this index are folded in.
    pub last_included_index: LogIndex,
    /// Offset of this chunk within the snapshot data.
    pub byte_offset: u64,
    /// Total snapshot data size.
    pub byte_size: u64,
    /// True on the final chunk.
    pub is_last: bool,
    /// Raw snapshot bytes.
    pub data: Vec<u8>,
}

/// Item yielded by an entry stream (and by the subscriber's read side).
#[derive(Clone, Debug, PartialEq)]
pub enum StreamItem {
    /// One log entry, in dense index order.
    Entry(LogEntry),
    /// One chunk of a snapshot transfer replacing a log prefix.
    Snapshot(SnapshotChunk),
}

/// Lazy reader over one `e` RPC's reply stream.
pub struct EntriesStream {
    reply: ReplyStream,
    pending: Option<EntriesChunk>,
    cursor: LogIndex,
    snapshot_cursor: Option<u64>,
    finished: bool,
    read_timeout: Duration,
}

impl EntriesStream {
    pub(crate) fn new(
        reply: ReplyStream,
        from: LogIndex,
        first: EntriesChunk,
        read_timeout: Duration,
    ) -> Self {
        Self {
            reply,
            pending: Some(first),
            cursor: from,
            snapshot_cursor: None,
            finished: false,
            read_timeout,
        }
    }

    /// Index the next entry is expected to carry. After the stream ends,
    /// this is where a resuming call should start.
    pub fn next_index(&self) -> LogIndex {
        self.cursor
    }

    /// True once the server has closed the stream.
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    async fn next_chunk(&mut self) -> ClientResult<Option<EntriesChunk>> {
        if let Some(chunk) = self.pending.take() {
            return Ok(Some(chunk));
        }
        let frames = match timeout(self.read_timeout, self.reply.next()).await {
            Err(_) => return Err(ClientError::Timeout),
            Ok(Err(e)) => return Err(e.into()),
            Ok(Ok(None)) => return Ok(None),
            Ok(Ok(Some(frames))) => frames,
        };
        match decode_response(&frames)? {
            Response::Chunk(chunk) => Ok(Some(chunk)),
            other => Err(ClientError::Rejected {
                msg: format!("unexpected mid-stream response: {other:?}"),
            }),
        }
    }

    /// Next item, or None when the stream ends cleanly.
    pub async fn next(&mut self) -> ClientResult<Option<StreamItem>> {
        if self.finished {
            return Ok(None);
        }
        let Some(chunk) = self.next_chunk().await? else {
            // Server went away without a Done marker; callers resume from
            // the cursor.
            self.finished = true;
            return Ok(None);
        };
        match chunk.status {
            ChunkStatus::Entries => {
                let entry = decode_entry(&chunk.payload)?;
                if entry.index != self.cursor || chunk.last_index != entry.index {
                    return Err(ClientError::OutOfOrder);
                }
                self.cursor = self.cursor.next();
                Ok(Some(StreamItem::Entry(entry)))
            }
            ChunkStatus::Snapshot => {
                let expected = self.snapshot_cursor.unwrap_or(0);
                if chunk.byte_offset != expected {
                    return Err(ClientError::OutOfOrder);
                }
                let end = chunk.byte_offset + chunk.payload.len() as u64;
                if chunk.is_last {
                    if end != chunk.byte_size {
                        return Err(ClientError::OutOfOrder);
                    }
                    self.snapshot_cursor = None;
                    self.cursor = chunk.last_index.next();
                } else {
                    self.snapshot_cursor = Some(end);
                }
                Ok(Some(StreamItem::Snapshot(SnapshotChunk {
                    last_included_index: chunk.last_index,
                    byte_offset: chunk.byte_offset,
                    byte_size: chunk.byte_size,
                    is_last: chunk.is_last,
                    data: chunk.payload,
                })))
            }
            ChunkStatus::Done => {
                self.finished = true;
                Ok(None)
            }
            ChunkStatus::Error => {
                self.finished = true;
                Err(ClientError::Rejected {
                    msg: String::from_utf8_lossy(&chunk.payload).into_owned(),
                })
            }
        }
    }
}

/// Decodes an entry from a broadcast frame, mapping codec errors the same
/// way the stream reader does.
pub fn decode_broadcast_entry(bytes: &[u8]) -> ClientResult<LogEntry> {
    Ok(decode_entry(bytes)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use replog_log::codec::encode_entry;
    use replog_log::types::{RequestId, Term};
    use replog_net::frames::encode_response;
    use replog_net::transport::rpc_channel;

    fn encoded(index: u64) -> Vec<u8> {
        encode_entry(&LogEntry::state(
            LogIndex::new(index),
            Term::new(1),
            RequestId::from_parts(1_700_000_000_000, index),
            vec![index as u8],
        ))
    }

    async fn stream_of(chunks: Vec<EntriesChunk>, from: u64) -> EntriesStream {
        let (conn, mut listener) = rpc_channel(8);
        let reply = conn.call(vec![]).await.unwrap();
        let rpc = listener.accept().await.unwrap();
        let mut chunks = chunks.into_iter();
        let first = chunks.next().unwrap();
        tokio::spawn(async move {
            for chunk in chunks {
                if rpc
                    .reply(encode_response(&Response::Chunk(chunk)).unwrap())
                    .await
                    .is_err()
                {
                    break;
                }
            }
        });
        EntriesStream::new(reply, LogIndex::new(from), first, Duration::from_millis(200))
    }

    #[tokio::test]
    async fn test_dense_entries_then_done() {
        let mut stream = stream_of(
            vec![
                EntriesChunk::entry(LogIndex::new(3), encoded(3)),
                EntriesChunk::entry(LogIndex::new(4), encoded(4)),
                EntriesChunk::done(LogIndex::new(4)),
            ],
            3,
        )
        .await;

        match stream.next().await.unwrap().unwrap() {
            StreamItem::Entry(e) => assert_eq!(e.index, LogIndex::new(3)),
            other => panic!("unexpected {other:?}"),
        }
        match stream.next().await.unwrap().unwrap() {
            StreamItem::Entry(e) => assert_eq!(e.index, LogIndex::new(4)),
            other => panic!("unexpected {other:?}"),
        }
        assert!(stream.next().await.unwrap().is_none());
        assert!(stream.is_finished());
        assert_eq!(stream.next_index(), LogIndex::new(5));
    }

    #[tokio::test]
    async fn test_gap_in_entries_is_out_of_order() {
        let mut stream = stream_of(
            vec![
                EntriesChunk::entry(LogIndex::new(3), encoded(3)),
                EntriesChunk::entry(LogIndex::new(5), encoded(5)),
            ],
            3,
        )
        .await;
        assert!(stream.next().await.unwrap().is_some());
        assert!(matches!(
            stream.next().await.unwrap_err(),
            ClientError::OutOfOrder
        ));
        // Cursor still points at the restart position.
        assert_eq!(stream.next_index(), LogIndex::new(4));
    }

    #[tokio::test]
    async fn test_snapshot_transfer_then_tail_entries() {
        let mut stream = stream_of(
            vec![
                EntriesChunk::snapshot(LogIndex::new(10), 0, 8, false, vec![1, 2, 3, 4]),
                EntriesChunk::snapshot(LogIndex::new(10), 4, 8, true, vec![5, 6, 7, 8]),
                EntriesChunk::entry(LogIndex::new(11), encoded(11)),
                EntriesChunk::done(LogIndex::new(11)),
            ],
            1,
        )
        .await;

        match stream.next().await.unwrap().unwrap() {
            StreamItem::Snapshot(c) => {
                assert_eq!(c.byte_offset, 0);
                assert!(!c.is_last);
            }
            other => panic!("unexpected {other:?}"),
        }
        match stream.next().await.unwrap().unwrap() {
            StreamItem::Snapshot(c) => {
                assert!(c.is_last);
                assert_eq!(c.last_included_index, LogIndex::new(10));
            }
            other => panic!("unexpected {other:?}"),
        }
        // Cursor fast-forwarded past the snapshot.
        assert_eq!(stream.next_index(), LogIndex::new(11));
        match stream.next().await.unwrap().unwrap() {
            StreamItem::Entry(e) => assert_eq!(e.index, LogIndex::new(11)),
            other => panic!("unexpected {other:?}"),
        }
        assert!(stream.next().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_snapshot_offset_skip_is_out_of_order() {
        let mut stream = stream_of(
            vec![
                EntriesChunk::snapshot(LogIndex::new(10), 0, 8, false, vec![1, 2, 3, 4]),
                EntriesChunk::snapshot(LogIndex::new(10), 6, 8, true, vec![7, 8]),
            ],
            1,
        )
        .await;
        assert!(stream.next().await.unwrap().is_some());
        assert!(matches!(
            stream.next().await.unwrap_err(),
            ClientError::OutOfOrder
        ));
    }

    #[tokio::test]
    async fn test_server_error_chunk() {
        let mut stream = stream_of(vec![EntriesChunk::error("pruned")], 1).await;
        match stream.next().await.unwrap_err() {
            ClientError::Rejected { msg } => assert_eq!(msg, "pruned"),
            other => panic!("unexpected {other:?}"),
        }
        assert!(stream.is_finished());
    }

    #[tokio::test]
    async fn test_silent_server_close_ends_stream() {
        let mut stream = stream_of(
            vec![EntriesChunk::entry(LogIndex::new(1), encoded(1))],
            1,
        )
        .await;
        assert!(stream.next().await.unwrap().is_some());
        // Replier task finished; channel closed without a Done marker.
        assert!(stream.next().await.unwrap().is_none());
        assert_eq!(stream.next_index(), LogIndex::new(2));
    }
}
