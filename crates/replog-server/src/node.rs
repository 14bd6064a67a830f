//! Single-peer node harness.
//!
//! Wires the durable log, state machine, dedup window, publisher and RPC
//! service behind a [`SoloRaft`] collaborator: a one-peer cluster in which
//! every durable append is immediately committed, applied, broadcast and
//! acknowledged. Initialisation order is config → log → snapshot → service;
//! teardown is the reverse.

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{error, info};

use replog_log::compact::decompress_state;
use replog_log::log::{FileLog, LogConfig};
use replog_log::snapshot::{self, SnapshotFile};
use replog_log::state::VecState;
use replog_log::types::LogIndex;
use replog_net::message::PeerInfo;
use replog_net::transport::{
    rpc_channel, FanoutDirectory, PeerDirectory, DEFAULT_RPC_CAPACITY,
};
use replog_net::url::PeerUrl;

use crate::dedup::{DedupConfig, DedupWindow};
use crate::error::{ServerError, ServerResult};
use crate::publisher::{Publisher, PublisherConfig};
use crate::raft::{self, PersistentState, RaftHandle, SoloRaft};
use crate::service::{LogService, ServiceConfig};

/// File name of the snapshot under the data root.
pub const SNAPSHOT_FILE: &str = "snap";

/// Node wiring parameters.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Peer id.
    pub id: u64,
    /// RPC endpoint URL.
    pub rpc_url: String,
    /// Fan-out publisher URL.
    pub publisher_url: String,
    /// Data directory holding `log/`, `snap` and `raft-state`.
    pub data_root: PathBuf,
    /// Cluster secret.
    pub secret: Vec<u8>,
    /// Broadcast heartbeat interval.
    pub heartbeat_interval: Duration,
    /// Segment roll-over limits.
    pub log: LogConfig,
    /// Deduplication window settings.
    pub dedup: DedupConfig,
    /// Entry stream limits.
    pub service: ServiceConfig,
}

impl NodeConfig {
    /// Defaults for everything but identity and placement.
    pub fn new(
        id: u64,
        rpc_url: impl Into<String>,
        publisher_url: impl Into<String>,
        data_root: impl Into<PathBuf>,
        secret: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            id,
            rpc_url: rpc_url.into(),
            publisher_url: publisher_url.into(),
            data_root: data_root.into(),
            secret: secret.into(),
            heartbeat_interval: Duration::from_millis(500),
            log: LogConfig::default(),
            dedup: DedupConfig::default(),
            service: ServiceConfig::default(),
        }
    }
}

/// A running single-peer node.
pub struct Node {
    peer: PeerInfo,
    raft: Arc<SoloRaft>,
    rpc_url: String,
    publisher_url: String,
    directory: PeerDirectory,
    fanout: FanoutDirectory,
    serve_task: JoinHandle<()>,
    // Kept alive for the node's lifetime; the service holds clones.
    _publisher: Arc<Publisher>,
}

impl Node {
    /// Opens the data directory and starts serving.
    pub async fn spawn(
        config: NodeConfig,
        directory: &PeerDirectory,
        fanout: &FanoutDirectory,
    ) -> ServerResult<Node> {
        let url = PeerUrl::parse(&config.rpc_url)?;
        let peer = PeerInfo {
            id: config.id,
            url,
        };
        fs::create_dir_all(&config.data_root)?;
        let removed = snapshot::sweep_stale(&config.data_root)?;
        if removed > 0 {
            info!(removed, "removed stale snapshot temporaries");
        }

        let snapshot_path = config.data_root.join(SNAPSHOT_FILE);
        let snap_meta = match SnapshotFile::open(&snapshot_path) {
            Ok(snap) => Some(snap.meta()),
            Err(_) => None,
        };

        let state = match raft::load_state(&config.data_root)? {
            Some(state) => state,
            None => {
                let state = PersistentState {
                    current_term: replog_log::types::Term::new(1),
                    voted_for: Some(config.id),
                    peers: vec![peer.clone()],
                };
                raft::store_state(&config.data_root, &state)?;
                state
            }
        };

        let mut log = FileLog::open(&config.data_root.join("log"), config.log.clone(), snap_meta)?;

        // Rebuild the applied state machine: snapshot first, then the log
        // suffix (a solo peer has everything committed).
        let mut sm = match snap_meta {
            Some(meta) => {
                let mut snap = SnapshotFile::open(&snapshot_path)?;
                let data = snap.read_all()?;
                restore_state(&data, meta.last_included_index)?
            }
            None => VecState::new(),
        };
        let last_index = log.last_index();
        log.feed_state_machine(&mut sm, last_index)?;

        // Re-seed the dedup window from the retained log suffix.
        let mut dedup = DedupWindow::new(config.dedup.clone());
        let first = log.first_index();
        log.read_range(first, last_index, 0, |entry| {
            dedup.record(entry.request_id, entry.index);
            true
        })?;

        let raft = Arc::new(SoloRaft::new(peer.clone(), state.current_term, last_index));
        let publisher = Arc::new(Publisher::spawn(
            config.publisher_url.clone(),
            config.secret.clone(),
            state.current_term,
            last_index,
            PublisherConfig {
                heartbeat_interval: config.heartbeat_interval,
                ..PublisherConfig::default()
            },
        ));
        fanout.register(&config.publisher_url, publisher.hub());

        let service = Arc::new(LogService::new(
            config.secret.clone(),
            Arc::new(Mutex::new(log)),
            Arc::new(Mutex::new(sm)),
            Arc::new(Mutex::new(dedup)),
            raft.clone(),
            publisher.clone(),
            snapshot_path,
            config.service.clone(),
        ));

        let (connector, listener) = rpc_channel(DEFAULT_RPC_CAPACITY);
        directory.register(&config.rpc_url, connector);

        // A fatal log error halts the service; tear the node down with it
        // instead of serving further requests over corrupt durability.
        {
            let mut halted = service.halted();
            let directory = directory.clone();
            let fanout = fanout.clone();
            let rpc_url = config.rpc_url.clone();
            let publisher_url = config.publisher_url.clone();
            let id = config.id;
            tokio::spawn(async move {
                if halted.changed().await.is_ok() && *halted.borrow() {
                    error!(id, "node halting after fatal log error");
                    directory.deregister(&rpc_url);
                    fanout.deregister(&publisher_url);
                }
            });
        }

        let serve_task = tokio::spawn(service.serve(listener));

        info!(
            id = config.id,
            rpc = %config.rpc_url,
            publisher = %config.publisher_url,
            first = first.as_u64(),
            last = last_index.as_u64(),
            "node serving"
        );
        Ok(Node {
            peer,
            raft,
            rpc_url: config.rpc_url,
            publisher_url: config.publisher_url,
            directory: directory.clone(),
            fanout: fanout.clone(),
            serve_task,
            _publisher: publisher,
        })
    }

    /// This node's peer identity.
    pub fn peer_info(&self) -> PeerInfo {
        self.peer.clone()
    }

    /// Current commit index.
    pub fn commit_index(&self) -> LogIndex {
        self.raft.commit_index()
    }

    /// The advertised publisher URL.
    pub fn publisher_url(&self) -> &str {
        &self.publisher_url
    }

    /// Abrupt shutdown: deregisters the endpoints and kills the accept
    /// loop, simulating a peer death mid-conversation.
    pub async fn kill(self) {
        self.directory.deregister(&self.rpc_url);
        self.fanout.deregister(&self.publisher_url);
        self.serve_task.abort();
        info!(id = self.peer.id, "node killed");
    }
}

fn restore_state(data: &[u8], last_applied: LogIndex) -> ServerResult<VecState> {
    // Snapshot data may be stored zstd-compressed by the compaction tool.
    match VecState::restore(data, last_applied) {
        Ok(sm) => Ok(sm),
        Err(_) => {
            let raw = decompress_state(data).map_err(|e| ServerError::RaftState {
                msg: format!("snapshot state undecodable: {e}"),
            })?;
            VecState::restore(&raw, last_applied).map_err(ServerError::Log)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use replog_net::broadcast::BroadcastMsg;
    use replog_net::frames::{encode_request, decode_response};
    use replog_net::message::{Request, Response, UpdateStatus};
    use replog_log::types::RequestId;
    use tokio::time::timeout;

    async fn call(
        directory: &PeerDirectory,
        url: &str,
        req: Request,
    ) -> Response {
        let conn = directory.dial(url).unwrap();
        let mut reply = conn.call(encode_request(&req)).await.unwrap();
        let frames = timeout(Duration::from_millis(500), reply.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        decode_response(&frames).unwrap()
    }

    fn node_config(dir: &std::path::Path) -> NodeConfig {
        NodeConfig::new(
            1,
            "tcp://127.0.0.1:4087",
            "tcp://127.0.0.1:4088",
            dir,
            b"secret".to_vec(),
        )
    }

    #[tokio::test]
    async fn test_update_commits_applies_and_broadcasts() {
        let dir = tempfile::tempdir().unwrap();
        let directory = PeerDirectory::new();
        let fanout = FanoutDirectory::new();
        let node = Node::spawn(node_config(dir.path()), &directory, &fanout)
            .await
            .unwrap();

        let hub = fanout.dial("tcp://127.0.0.1:4088").unwrap();
        let mut sub = hub.subscribe(b"secret".to_vec());

        let resp = call(
            &directory,
            "tcp://127.0.0.1:4087",
            Request::Update {
                request_id: RequestId::generate(),
                payload: b"a".to_vec(),
            },
        )
        .await;
        let Response::Update(reply) = resp else {
            panic!("unexpected {resp:?}");
        };
        assert_eq!(reply.status, UpdateStatus::Committed);
        assert_eq!(reply.commit_index, LogIndex::new(1));
        assert_eq!(node.commit_index(), LogIndex::new(1));

        // The committed entry is broadcast.
        let frames = timeout(Duration::from_millis(500), sub.recv())
            .await
            .unwrap()
            .unwrap();
        let msg = BroadcastMsg::decode(&frames, b"secret").unwrap();
        assert_eq!(msg.last_log_index, LogIndex::new(1));
        assert_eq!(msg.entries.len(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_update_returns_original_index() {
        let dir = tempfile::tempdir().unwrap();
        let directory = PeerDirectory::new();
        let fanout = FanoutDirectory::new();
        let _node = Node::spawn(node_config(dir.path()), &directory, &fanout)
            .await
            .unwrap();

        let rid = RequestId::generate();
        for _ in 0..2 {
            let resp = call(
                &directory,
                "tcp://127.0.0.1:4087",
                Request::Update {
                    request_id: rid,
                    payload: b"x".to_vec(),
                },
            )
            .await;
            let Response::Update(reply) = resp else {
                panic!("unexpected {resp:?}");
            };
            assert_eq!(reply.commit_index, LogIndex::new(1));
        }

        // A different id appends a new entry.
        let resp = call(
            &directory,
            "tcp://127.0.0.1:4087",
            Request::Update {
                request_id: RequestId::generate(),
                payload: b"y".to_vec(),
            },
        )
        .await;
        let Response::Update(reply) = resp else {
            panic!("unexpected {resp:?}");
        };
        assert_eq!(reply.commit_index, LogIndex::new(2));
    }

    #[tokio::test]
    async fn test_log_info_tuple() {
        let dir = tempfile::tempdir().unwrap();
        let directory = PeerDirectory::new();
        let fanout = FanoutDirectory::new();
        let _node = Node::spawn(node_config(dir.path()), &directory, &fanout)
            .await
            .unwrap();

        for payload in [b"a".as_slice(), b"b".as_slice()] {
            call(
                &directory,
                "tcp://127.0.0.1:4087",
                Request::Update {
                    request_id: RequestId::generate(),
                    payload: payload.to_vec(),
                },
            )
            .await;
        }

        let resp = call(&directory, "tcp://127.0.0.1:4087", Request::LogInfo).await;
        let Response::LogInfo(info) = resp else {
            panic!("unexpected {resp:?}");
        };
        assert!(info.is_leader);
        assert_eq!(info.leader_id, Some(1));
        assert_eq!(info.first_index, LogIndex::new(1));
        assert_eq!(info.commit_index, LogIndex::new(2));
        assert_eq!(info.last_index, LogIndex::new(2));
        assert_eq!(info.last_applied, LogIndex::new(2));
    }

    #[tokio::test]
    async fn test_publisher_url_rpc_checks_secret() {
        let dir = tempfile::tempdir().unwrap();
        let directory = PeerDirectory::new();
        let fanout = FanoutDirectory::new();
        let _node = Node::spawn(node_config(dir.path()), &directory, &fanout)
            .await
            .unwrap();

        let resp = call(
            &directory,
            "tcp://127.0.0.1:4087",
            Request::PublisherUrl {
                secret: b"secret".to_vec(),
            },
        )
        .await;
        assert_eq!(
            resp,
            Response::PublisherUrl(Some("tcp://127.0.0.1:4088".to_string()))
        );

        let resp = call(
            &directory,
            "tcp://127.0.0.1:4087",
            Request::PublisherUrl {
                secret: b"nope".to_vec(),
            },
        )
        .await;
        assert!(matches!(resp, Response::Error { .. }));
    }

    #[tokio::test]
    async fn test_fatal_corruption_halts_node() {
        use replog_net::message::ChunkStatus;
        use std::io::{Seek, SeekFrom, Write};

        let dir = tempfile::tempdir().unwrap();
        let directory = PeerDirectory::new();
        let fanout = FanoutDirectory::new();
        let _node = Node::spawn(node_config(dir.path()), &directory, &fanout)
            .await
            .unwrap();

        for payload in [b"a".as_slice(), b"b".as_slice()] {
            call(
                &directory,
                "tcp://127.0.0.1:4087",
                Request::Update {
                    request_id: RequestId::generate(),
                    payload: payload.to_vec(),
                },
            )
            .await;
        }

        // Bit-rot inside the first record of the tail segment.
        let seg = std::fs::read_dir(dir.path().join("log"))
            .unwrap()
            .filter_map(|e| {
                let path = e.unwrap().path();
                (path.extension().and_then(|x| x.to_str()) == Some("seg")).then_some(path)
            })
            .next()
            .unwrap();
        {
            let mut f = std::fs::OpenOptions::new()
                .read(true)
                .write(true)
                .open(&seg)
                .unwrap();
            f.seek(SeekFrom::Start(4 + 10)).unwrap();
            f.write_all(&[0xEE]).unwrap();
        }

        // A read over the corrupt record fails the request...
        let resp = call(
            &directory,
            "tcp://127.0.0.1:4087",
            Request::Entries {
                from: LogIndex::new(1),
                byte_budget: 0,
                count_limit: 0,
            },
        )
        .await;
        let Response::Chunk(chunk) = resp else {
            panic!("unexpected {resp:?}");
        };
        assert_eq!(chunk.status, ChunkStatus::Error);

        // ...and halts the node: the endpoint is torn down rather than
        // serving further requests.
        let mut attempts = 0;
        while directory.dial("tcp://127.0.0.1:4087").is_some() {
            attempts += 1;
            assert!(attempts < 200, "node kept serving after fatal corruption");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn test_restart_preserves_log_and_dedup() {
        let dir = tempfile::tempdir().unwrap();
        let directory = PeerDirectory::new();
        let fanout = FanoutDirectory::new();
        let rid = RequestId::generate();
        {
            let node = Node::spawn(node_config(dir.path()), &directory, &fanout)
                .await
                .unwrap();
            let resp = call(
                &directory,
                "tcp://127.0.0.1:4087",
                Request::Update {
                    request_id: rid,
                    payload: b"persisted".to_vec(),
                },
            )
            .await;
            let Response::Update(reply) = resp else {
                panic!("unexpected {resp:?}");
            };
            assert_eq!(reply.commit_index, LogIndex::new(1));
            node.kill().await;
        }
        // Let the aborted accept loop drop and release the directory lock.
        tokio::time::sleep(Duration::from_millis(50)).await;

        // Restart on the same directory: same request id maps to the same
        // index (scenario: leader failover mid-update).
        let node = Node::spawn(node_config(dir.path()), &directory, &fanout)
            .await
            .unwrap();
        let resp = call(
            &directory,
            "tcp://127.0.0.1:4087",
            Request::Update {
                request_id: rid,
                payload: b"persisted".to_vec(),
            },
        )
        .await;
        let Response::Update(reply) = resp else {
            panic!("unexpected {resp:?}");
        };
        assert_eq!(reply.commit_index, LogIndex::new(1));
        assert_eq!(node.commit_index(), LogIndex::new(1));
    }
}
