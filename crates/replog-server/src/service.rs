//! RPC service over the durable log.
//!
//! Dispatches the five request types against the log, the state machine,
//! the dedup window and the Raft collaborator. Entry streams switch to a
//! chunked snapshot transfer when the requested index predates the log's
//! first index.
//!
//! A `CorruptLog` error is fatal: the service flips its halt signal, the
//! accept loop stops, and the owning node tears down instead of serving
//! further requests over corrupt durability.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::sync::{watch, Mutex};
use tracing::{debug, error, warn};

use replog_log::codec::encode_entry;
use replog_log::log::FileLog;
use replog_log::snapshot::SnapshotFile;
use replog_log::state::{StateMachine, VecState};
use replog_log::types::{LogEntry, LogIndex, RequestId};
use replog_net::frames::{decode_request, encode_response};
use replog_net::message::{
    ConfigInfo, EntriesChunk, LogInfo, Request, Response, UpdateReply, UpdateStatus,
    AUTH_FAILURE_MSG,
};
use replog_net::transport::{IncomingRpc, RpcListener};

use crate::dedup::{DedupDecision, DedupWindow};
use crate::publisher::Publisher;
use crate::raft::{RaftHandle, Role};

/// Service-side limits for entry streams.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Byte budget applied when the request passes 0.
    pub default_byte_budget: u64,
    /// Hard ceiling on the per-request byte budget.
    pub max_byte_budget: u64,
    /// Entry count limit applied when the request passes 0.
    pub default_count_limit: u32,
    /// Snapshot transfer chunk size.
    pub snapshot_chunk_bytes: usize,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            default_byte_budget: 1024 * 1024,
            max_byte_budget: 8 * 1024 * 1024,
            default_count_limit: 4096,
            snapshot_chunk_bytes: 64 * 1024,
        }
    }
}

/// The request dispatcher shared by every connection of one peer.
pub struct LogService {
    secret: Vec<u8>,
    log: Arc<Mutex<FileLog>>,
    sm: Arc<Mutex<VecState>>,
    dedup: Arc<Mutex<DedupWindow>>,
    raft: Arc<dyn RaftHandle>,
    publisher: Arc<Publisher>,
    snapshot_path: PathBuf,
    config: ServiceConfig,
    halt_tx: watch::Sender<bool>,
}

impl LogService {
    /// Wires a service over its collaborators.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        secret: Vec<u8>,
        log: Arc<Mutex<FileLog>>,
        sm: Arc<Mutex<VecState>>,
        dedup: Arc<Mutex<DedupWindow>>,
        raft: Arc<dyn RaftHandle>,
        publisher: Arc<Publisher>,
        snapshot_path: PathBuf,
        config: ServiceConfig,
    ) -> Self {
        let (halt_tx, _) = watch::channel(false);
        Self {
            secret,
            log,
            sm,
            dedup,
            raft,
            publisher,
            snapshot_path,
            config,
            halt_tx,
        }
    }

    /// Watch that flips to true once a fatal log error has halted the
    /// service. The owning node tears down when it fires.
    pub fn halted(&self) -> watch::Receiver<bool> {
        self.halt_tx.subscribe()
    }

    /// Accept loop: one spawned handler per incoming RPC. Exits when the
    /// connectors go away or a fatal log error halts the service.
    pub async fn serve(self: Arc<Self>, mut listener: RpcListener) {
        let mut halted = self.halt_tx.subscribe();
        loop {
            let rpc = tokio::select! {
                _ = halted.changed() => break,
                rpc = listener.accept() => match rpc {
                    Some(rpc) => rpc,
                    None => break,
                },
            };
            let service = self.clone();
            tokio::spawn(async move {
                service.handle(rpc).await;
            });
        }
        debug!("rpc listener closed");
    }

    async fn handle(&self, rpc: IncomingRpc) {
        let request = match decode_request(&rpc.request) {
            Ok(request) => request,
            Err(e) => {
                warn!(error = %e, "undecodable request");
                let _ = self.reply(&rpc, Response::Error { msg: e.to_string() }).await;
                return;
            }
        };
        match request {
            Request::Config => {
                let resp = self.config_info();
                let _ = self.reply(&rpc, resp).await;
            }
            Request::LogInfo => {
                let resp = self.log_info().await;
                let _ = self.reply(&rpc, resp).await;
            }
            Request::Update {
                request_id,
                payload,
            } => {
                let resp = self.update(request_id, payload).await;
                let _ = self.reply(&rpc, resp).await;
            }
            Request::PublisherUrl { secret } => {
                let resp = self.publisher_url(&secret);
                let _ = self.reply(&rpc, resp).await;
            }
            Request::Entries {
                from,
                byte_budget,
                count_limit,
            } => {
                self.entries(&rpc, from, byte_budget, count_limit).await;
            }
        }
    }

    async fn reply(&self, rpc: &IncomingRpc, resp: Response) -> bool {
        match encode_response(&resp) {
            Ok(frames) => rpc.reply(frames).await.is_ok(),
            Err(e) => {
                error!(error = %e, "response encode failed");
                false
            }
        }
    }

    fn config_info(&self) -> Response {
        Response::Config(ConfigInfo {
            peers: self.raft.cluster(),
            leader_id: self.raft.leader_hint(),
        })
    }

    async fn log_info(&self) -> Response {
        let (first_index, last_index) = {
            let log = self.log.lock().await;
            (log.first_index(), log.last_index())
        };
        let last_applied = self.sm.lock().await.last_applied();
        let commit_index = self.raft.commit_index();
        let snapshot_size = SnapshotFile::open(&self.snapshot_path)
            .map(|s| s.meta().data_size)
            .unwrap_or(0);
        Response::LogInfo(LogInfo {
            is_leader: self.raft.role() == Role::Leader,
            leader_id: self.raft.leader_hint(),
            current_term: self.raft.current_term(),
            first_index,
            last_applied,
            commit_index,
            last_index,
            prune_index: last_applied.min(commit_index),
            snapshot_size,
        })
    }

    fn not_leader(&self) -> Response {
        let hint = self.raft.leader_hint().filter(|id| *id != self.raft.id());
        match hint {
            Some(leader_id) => {
                let url = self
                    .raft
                    .cluster()
                    .into_iter()
                    .find(|p| p.id == leader_id)
                    .map(|p| p.url.to_string());
                match url {
                    Some(leader_url) => Response::Redirect {
                        leader_id,
                        leader_url,
                    },
                    None => Response::NoLeader,
                }
            }
            None => Response::NoLeader,
        }
    }

    async fn update(&self, request_id: RequestId, payload: Vec<u8>) -> Response {
        if self.raft.role() != Role::Leader {
            return self.not_leader();
        }
        if request_id.is_zero() {
            return Response::Error {
                msg: "zero request id".to_string(),
            };
        }
        let now_ms = unix_ms();
        let decision = {
            let mut dedup = self.dedup.lock().await;
            dedup.sweep(now_ms);
            dedup.check(&request_id, now_ms)
        };
        match decision {
            DedupDecision::Duplicate(index) => {
                debug!(%request_id, index = index.as_u64(), "duplicate update");
                Response::Update(UpdateReply {
                    status: UpdateStatus::Committed,
                    commit_index: index,
                })
            }
            DedupDecision::Expired => Response::Update(UpdateReply {
                status: UpdateStatus::StaleRequest,
                commit_index: LogIndex::ZERO,
            }),
            DedupDecision::New => match self.append_update(request_id, payload).await {
                Ok(index) => Response::Update(UpdateReply {
                    status: UpdateStatus::Committed,
                    commit_index: index,
                }),
                Err(msg) => Response::Error { msg },
            },
        }
    }

    async fn append_update(
        &self,
        request_id: RequestId,
        payload: Vec<u8>,
    ) -> Result<LogIndex, String> {
        let term = self.raft.current_term();
        let (index, encoded) = {
            let mut log = self.log.lock().await;
            let index = log.last_index().next();
            let entry = LogEntry::state(index, term, request_id, payload);
            let encoded = encode_entry(&entry);
            log.append(entry).map_err(|e| self.log_failure("append", &e))?;
            log.flush().map_err(|e| self.log_failure("flush", &e))?;
            (index, encoded)
        };
        // Majority-of-one: durable on the leader means committed.
        self.raft.advance_commit(index);
        self.dedup.lock().await.record(request_id, index);
        {
            let mut log = self.log.lock().await;
            let mut sm = self.sm.lock().await;
            log.feed_state_machine(&mut *sm, index)
                .map_err(|e| self.log_failure("apply", &e))?;
        }
        self.publisher.publish(term, index, vec![encoded]);
        Ok(index)
    }

    fn publisher_url(&self, secret: &[u8]) -> Response {
        if self.secret != secret || !self.publisher.secret_matches(secret) {
            return Response::Error {
                msg: AUTH_FAILURE_MSG.to_string(),
            };
        }
        if self.raft.role() != Role::Leader {
            return Response::PublisherUrl(None);
        }
        Response::PublisherUrl(Some(self.publisher.url().to_string()))
    }

    async fn entries(&self, rpc: &IncomingRpc, from: LogIndex, byte_budget: u64, count_limit: u32) {
        let budget = if byte_budget == 0 {
            self.config.default_byte_budget
        } else {
            byte_budget.min(self.config.max_byte_budget)
        };
        let limit = if count_limit == 0 {
            self.config.default_count_limit
        } else {
            count_limit
        } as usize;

        let mut cursor = if from.is_zero() { LogIndex::new(1) } else { from };
        let first_index = self.log.lock().await.first_index();

        // A cursor behind the log head is served from the snapshot.
        if cursor < first_index {
            match self.stream_snapshot(rpc).await {
                Some(next) => cursor = next,
                None => return,
            }
        }

        // Collect the window under the lock, then stream without it.
        let batch: Result<Vec<(LogIndex, Vec<u8>)>, _> = {
            let mut log = self.log.lock().await;
            let last = log.last_index();
            let mut batch = Vec::new();
            log.read_range(cursor, last, budget, |entry| {
                batch.push((entry.index, encode_entry(&entry)));
                batch.len() < limit
            })
            .map(|_| batch)
        };
        let batch = match batch {
            Ok(batch) => batch,
            Err(e) => {
                let msg = self.log_failure("read", &e);
                let _ = self
                    .reply(rpc, Response::Chunk(EntriesChunk::error(&msg)))
                    .await;
                return;
            }
        };

        let mut last_sent = cursor.prev();
        for (index, encoded) in batch {
            if rpc.caller_gone() {
                return;
            }
            if !self
                .reply(rpc, Response::Chunk(EntriesChunk::entry(index, encoded)))
                .await
            {
                return;
            }
            last_sent = index;
        }
        let _ = self
            .reply(rpc, Response::Chunk(EntriesChunk::done(last_sent)))
            .await;
    }

    /// Streams the current snapshot; returns the index entries resume at.
    async fn stream_snapshot(&self, rpc: &IncomingRpc) -> Option<LogIndex> {
        let mut snap = match SnapshotFile::open(&self.snapshot_path) {
            Ok(snap) => snap,
            Err(e) => {
                warn!(error = %e, "snapshot requested but unavailable");
                self.log_failure("snapshot open", &e);
                let _ = self
                    .reply(rpc, Response::Chunk(EntriesChunk::error("snapshot unavailable")))
                    .await;
                return None;
            }
        };
        let meta = snap.meta();
        let total = meta.data_size;
        let mut offset = 0u64;
        loop {
            let chunk = match snap.read_chunk(offset, self.config.snapshot_chunk_bytes) {
                Ok(chunk) => chunk,
                Err(e) => {
                    self.log_failure("snapshot read", &e);
                    let _ = self
                        .reply(rpc, Response::Chunk(EntriesChunk::error("snapshot read failed")))
                        .await;
                    return None;
                }
            };
            let end = offset + chunk.len() as u64;
            let is_last = end >= total;
            let sent = self
                .reply(
                    rpc,
                    Response::Chunk(EntriesChunk::snapshot(
                        meta.last_included_index,
                        offset,
                        total,
                        is_last,
                        chunk,
                    )),
                )
                .await;
            if !sent {
                return None;
            }
            if is_last {
                break;
            }
            offset = end;
        }
        Some(meta.last_included_index.next())
    }

    /// Records a log failure; on `CorruptLog` the service halts, stopping
    /// the accept loop so the owning node tears down.
    fn log_failure(&self, op: &str, e: &replog_log::error::LogError) -> String {
        if e.is_fatal() {
            error!(error = %e, op, "fatal log corruption, halting service");
            let _ = self.halt_tx.send(true);
        }
        format!("{op} failed: {e}")
    }
}

fn unix_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
