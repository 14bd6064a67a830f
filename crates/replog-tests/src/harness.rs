//! Shared fixture: a single-peer cluster with fast timers.

use std::time::Duration;

use tempfile::TempDir;

use replog_client::rpc::{ClientConfig, ClusterClient};
use replog_client::subscriber::{Subscriber, SubscriberOptions};
use replog_log::log::LogConfig;
use replog_log::types::LogIndex;
use replog_net::transport::{FanoutDirectory, PeerDirectory};
use replog_server::node::{Node, NodeConfig};

/// RPC URL of the single test peer.
pub const RPC_URL: &str = "tcp://127.0.0.1:4087";
/// Publisher URL of the single test peer.
pub const PUB_URL: &str = "tcp://127.0.0.1:4088";
/// Cluster secret used throughout the suites.
pub const SECRET: &[u8] = b"hush";

/// Heartbeat interval the fixture runs with.
pub const HEARTBEAT: Duration = Duration::from_millis(50);

/// A single-peer cluster plus the dial directories shared with clients.
pub struct TestCluster {
    /// RPC dial table.
    pub directory: PeerDirectory,
    /// Fan-out dial table.
    pub fanout: FanoutDirectory,
    /// The running node, if alive.
    pub node: Option<Node>,
    tempdir: TempDir,
}

impl TestCluster {
    /// Starts a fresh single-peer cluster.
    pub async fn start() -> Self {
        Self::start_with_log_config(LogConfig::default()).await
    }

    /// Starts with explicit segment roll-over limits.
    pub async fn start_with_log_config(log: LogConfig) -> Self {
        let tempdir = tempfile::tempdir().expect("tempdir");
        let directory = PeerDirectory::new();
        let fanout = FanoutDirectory::new();
        let node = Node::spawn(
            Self::node_config(tempdir.path(), log),
            &directory,
            &fanout,
        )
        .await
        .expect("node spawn");
        Self {
            directory,
            fanout,
            node: Some(node),
            tempdir,
        }
    }

    fn node_config(root: &std::path::Path, log: LogConfig) -> NodeConfig {
        let mut config = NodeConfig::new(1, RPC_URL, PUB_URL, root, SECRET.to_vec());
        config.heartbeat_interval = HEARTBEAT;
        config.log = log;
        config
    }

    /// Client config with timers matched to the fixture's heartbeat.
    pub fn client_config() -> ClientConfig {
        ClientConfig {
            request_timeout: Duration::from_millis(150),
            election_grace: Duration::from_millis(50),
            ..ClientConfig::default()
        }
    }

    /// A fresh RPC client over this cluster.
    pub fn client(&self) -> ClusterClient {
        let peers = self
            .node
            .as_ref()
            .map(|n| vec![n.peer_info()])
            .unwrap_or_default();
        ClusterClient::new(peers, self.directory.clone(), Self::client_config())
            .expect("client")
    }

    /// A subscriber session resuming from `last_index`.
    pub fn subscriber(&self, last_index: LogIndex, read_buffer: usize) -> Subscriber {
        let options = SubscriberOptions {
            secret: SECRET.to_vec(),
            last_index,
            heartbeat_interval: HEARTBEAT,
            read_buffer,
            ordered_updates: false,
        };
        Subscriber::spawn(options, self.client(), self.fanout.clone())
    }

    /// Kills the node, leaving its data directory behind.
    pub async fn kill_node(&mut self) {
        if let Some(node) = self.node.take() {
            node.kill().await;
        }
    }

    /// Restarts the node over the surviving data directory.
    pub async fn restart_node(&mut self) {
        // Give in-flight handlers a moment to release the directory lock.
        tokio::time::sleep(Duration::from_millis(50)).await;
        let node = Node::spawn(
            Self::node_config(self.tempdir.path(), LogConfig::default()),
            &self.directory,
            &self.fanout,
        )
        .await
        .expect("node restart");
        self.node = Some(node);
    }

    /// Path of the node's data directory.
    pub fn data_root(&self) -> &std::path::Path {
        self.tempdir.path()
    }
}
