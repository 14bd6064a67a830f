//! Leader-tracking cluster RPC client.
//!
//! Every RPC goes to the current leader opinion when one is held, otherwise
//! to peers in round-robin order starting at a random offset. Redirects are
//! adopted and retried immediately; a "no leader" reply clears the opinion
//! and backs off for the election grace delay; a timeout demotes the
//! opinion and moves on to the next peer. There is no retry cap — callers
//! bound the loop with a [`CancelToken`].

use std::time::Duration;

use rand::Rng;
use tokio::time::timeout;
use tracing::{debug, warn};

use replog_log::types::{LogIndex, RequestId};
use replog_net::frames::{decode_response, encode_request};
use replog_net::message::{
    ConfigInfo, LogInfo, PeerInfo, Request, Response, UpdateReply, UpdateStatus, AUTH_FAILURE_MSG,
};
use replog_net::transport::PeerDirectory;
use replog_net::url::PeerUrl;

use crate::cancel::CancelToken;
use crate::error::{ClientError, ClientResult};
use crate::stream::EntriesStream;

/// Client-side tunables.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Per-RPC reply deadline.
    pub request_timeout: Duration,
    /// Backoff after a "no leader" reply.
    pub election_grace: Duration,
    /// Byte budget requested per entries stream (0 = server default).
    pub entries_byte_budget: u64,
    /// Entry count limit requested per entries stream (0 = server default).
    pub entries_count_limit: u32,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_millis(500),
            election_grace: Duration::from_millis(300),
            entries_byte_budget: 1024 * 1024,
            entries_count_limit: 4096,
        }
    }
}

/// RPC client holding a peer set and a leader opinion.
#[derive(Clone)]
pub struct ClusterClient {
    peers: Vec<PeerInfo>,
    directory: PeerDirectory,
    config: ClientConfig,
    leader_id: Option<u64>,
    rr: usize,
}

enum Step {
    Reply(Response),
    Retry,
}

impl ClusterClient {
    /// Creates a client over the given peer set.
    pub fn new(
        peers: Vec<PeerInfo>,
        directory: PeerDirectory,
        config: ClientConfig,
    ) -> ClientResult<Self> {
        if peers.is_empty() {
            return Err(ClientError::InvalidArgument {
                msg: "peer set is empty".to_string(),
            });
        }
        let rr = rand::thread_rng().gen_range(0..peers.len());
        Ok(Self {
            peers,
            directory,
            config,
            leader_id: None,
            rr,
        })
    }

    /// Current leader opinion.
    pub fn leader_id(&self) -> Option<u64> {
        self.leader_id
    }

    /// Current peer set.
    pub fn peers(&self) -> &[PeerInfo] {
        &self.peers
    }

    fn pick_target(&mut self) -> PeerInfo {
        if let Some(id) = self.leader_id {
            if let Some(peer) = self.peers.iter().find(|p| p.id == id) {
                return peer.clone();
            }
            // Opinion points at a peer we no longer know.
            self.leader_id = None;
        }
        let peer = self.peers[self.rr % self.peers.len()].clone();
        self.rr = (self.rr + 1) % self.peers.len();
        peer
    }

    fn demote(&mut self) {
        if self.leader_id.take().is_some() {
            debug!("leader opinion demoted to unknown");
        }
    }

    fn adopt(&mut self, leader_id: u64, leader_url: &str) {
        if !self.peers.iter().any(|p| p.id == leader_id) {
            match PeerUrl::parse(leader_url) {
                Ok(url) => self.peers.push(PeerInfo {
                    id: leader_id,
                    url,
                }),
                Err(e) => {
                    warn!(leader_id, url = leader_url, error = %e, "redirect to unparsable url");
                    return;
                }
            }
        }
        debug!(leader_id, "adopted leader opinion");
        self.leader_id = Some(leader_id);
    }

    /// Adopts a freshly learned cluster configuration.
    pub fn adopt_config(&mut self, info: &ConfigInfo) {
        if !info.peers.is_empty() {
            self.peers = info.peers.clone();
            self.rr %= self.peers.len();
        }
        if let Some(id) = info.leader_id {
            if self.peers.iter().any(|p| p.id == id) {
                self.leader_id = Some(id);
            }
        }
    }

    async fn call_once(&self, peer: &PeerInfo, req: &Request) -> ClientResult<Response> {
        let url = peer.url.to_string();
        let Some(conn) = self.directory.dial(&url) else {
            // A dead address behaves like a connect timeout.
            tokio::time::sleep(self.config.request_timeout).await;
            return Err(ClientError::Timeout);
        };
        let mut stream = conn
            .call(encode_request(req))
            .await
            .map_err(|_| ClientError::Timeout)?;
        match timeout(self.config.request_timeout, stream.next()).await {
            Err(_) => Err(ClientError::Timeout),
            Ok(Err(e)) => Err(e.into()),
            Ok(Ok(None)) => Err(ClientError::Timeout),
            Ok(Ok(Some(frames))) => Ok(decode_response(&frames)?),
        }
    }

    async fn step(
        &mut self,
        response: ClientResult<Response>,
        leader_only: bool,
        cancel: &CancelToken,
    ) -> ClientResult<Step> {
        match response {
            Err(ClientError::Timeout) | Err(ClientError::Net(_)) => {
                self.demote();
                Ok(Step::Retry)
            }
            Err(e) => Err(e),
            Ok(Response::Redirect {
                leader_id,
                leader_url,
            }) => {
                self.adopt(leader_id, &leader_url);
                Ok(Step::Retry)
            }
            Ok(Response::NoLeader) => {
                self.demote();
                tokio::select! {
                    _ = cancel.cancelled() => return Err(ClientError::Cancelled),
                    _ = tokio::time::sleep(self.config.election_grace) => {}
                }
                Ok(Step::Retry)
            }
            Ok(Response::Error { msg }) => {
                if msg == AUTH_FAILURE_MSG {
                    Err(ClientError::AuthFailure)
                } else {
                    Err(ClientError::Rejected { msg })
                }
            }
            Ok(Response::LogInfo(info)) if leader_only && !info.is_leader => {
                match info.leader_id {
                    Some(id) if self.peers.iter().any(|p| p.id == id) => {
                        self.leader_id = Some(id);
                    }
                    _ => {
                        self.demote();
                        tokio::select! {
                            _ = cancel.cancelled() => return Err(ClientError::Cancelled),
                            _ = tokio::time::sleep(self.config.election_grace) => {}
                        }
                    }
                }
                Ok(Step::Retry)
            }
            Ok(resp) => Ok(Step::Reply(resp)),
        }
    }

    async fn call(
        &mut self,
        req: Request,
        leader_only: bool,
        cancel: &CancelToken,
    ) -> ClientResult<Response> {
        loop {
            if cancel.is_cancelled() {
                return Err(ClientError::Cancelled);
            }
            let peer = self.pick_target();
            let outcome = tokio::select! {
                _ = cancel.cancelled() => return Err(ClientError::Cancelled),
                r = self.call_once(&peer, &req) => r,
            };
            match self.step(outcome, leader_only, cancel).await? {
                Step::Reply(resp) => return Ok(resp),
                Step::Retry => continue,
            }
        }
    }

    /// `?` — fetches the cluster configuration from any peer and adopts it.
    pub async fn request_config(&mut self, cancel: &CancelToken) -> ClientResult<ConfigInfo> {
        match self.call(Request::Config, false, cancel).await? {
            Response::Config(info) => {
                self.adopt_config(&info);
                Ok(info)
            }
            other => Err(unexpected(other)),
        }
    }

    /// `i` — fetches the log info tuple. With `any_peer == false` the call
    /// is restricted to a peer that identifies as leader.
    pub async fn request_log_info(
        &mut self,
        any_peer: bool,
        cancel: &CancelToken,
    ) -> ClientResult<LogInfo> {
        match self.call(Request::LogInfo, !any_peer, cancel).await? {
            Response::LogInfo(info) => {
                if info.is_leader {
                    if let Some(id) = info.leader_id {
                        self.leader_id = Some(id);
                    }
                }
                Ok(info)
            }
            other => Err(unexpected(other)),
        }
    }

    /// `u` — submits an update and returns its commit index.
    ///
    /// Safe to retransmit: the leader deduplicates on `request_id` and
    /// replies with the original index for a repeat.
    pub async fn request_update(
        &mut self,
        request_id: RequestId,
        payload: Vec<u8>,
        cancel: &CancelToken,
    ) -> ClientResult<LogIndex> {
        if request_id.is_zero() {
            return Err(ClientError::InvalidArgument {
                msg: "zero request id".to_string(),
            });
        }
        let req = Request::Update {
            request_id,
            payload,
        };
        match self.call(req, false, cancel).await? {
            Response::Update(UpdateReply {
                status: UpdateStatus::Committed,
                commit_index,
            }) => Ok(commit_index),
            Response::Update(UpdateReply {
                status: UpdateStatus::StaleRequest,
                ..
            }) => Err(ClientError::Rejected {
                msg: format!("request id {request_id} outside freshness window"),
            }),
            other => Err(unexpected(other)),
        }
    }

    /// `*` — asks any peer for the fan-out publisher URL serving `secret`.
    ///
    /// Returns None when no publisher is currently active.
    pub async fn request_publisher_url(
        &mut self,
        secret: &[u8],
        cancel: &CancelToken,
    ) -> ClientResult<Option<String>> {
        let req = Request::PublisherUrl {
            secret: secret.to_vec(),
        };
        match self.call(req, false, cancel).await? {
            Response::PublisherUrl(url) => Ok(url),
            other => Err(unexpected(other)),
        }
    }

    /// `e` — opens an entry stream from `from`.
    ///
    /// When `from` predates the serving peer's first index, the stream
    /// switches to a snapshot transfer. The stream is resumable: issue a
    /// new call from [`EntriesStream::next_index`] after it ends.
    pub async fn request_entries(
        &mut self,
        from: LogIndex,
        cancel: &CancelToken,
    ) -> ClientResult<EntriesStream> {
        // Index 0 means "no entry"; a stream from 0 starts at the log head.
        let from = if from.is_zero() { LogIndex::new(1) } else { from };
        let req = Request::Entries {
            from,
            byte_budget: self.config.entries_byte_budget,
            count_limit: self.config.entries_count_limit,
        };
        loop {
            if cancel.is_cancelled() {
                return Err(ClientError::Cancelled);
            }
            let peer = self.pick_target();
            let url = peer.url.to_string();
            let Some(conn) = self.directory.dial(&url) else {
                self.demote();
                tokio::select! {
                    _ = cancel.cancelled() => return Err(ClientError::Cancelled),
                    _ = tokio::time::sleep(self.config.request_timeout) => {}
                }
                continue;
            };
            let frames = encode_request(&req);
            let mut reply = match conn.call(frames).await {
                Ok(r) => r,
                Err(_) => {
                    self.demote();
                    continue;
                }
            };
            let first = tokio::select! {
                _ = cancel.cancelled() => return Err(ClientError::Cancelled),
                r = timeout(self.config.request_timeout, reply.next()) => match r {
                    Err(_) => Err(ClientError::Timeout),
                    Ok(Err(e)) => Err(e.into()),
                    Ok(Ok(None)) => Err(ClientError::Timeout),
                    Ok(Ok(Some(frames))) => Ok(decode_response(&frames)?),
                },
            };
            match self.step(first, false, cancel).await? {
                Step::Reply(Response::Chunk(chunk)) => {
                    return Ok(EntriesStream::new(
                        reply,
                        from,
                        chunk,
                        self.config.request_timeout,
                    ));
                }
                Step::Reply(other) => return Err(unexpected(other)),
                Step::Retry => continue,
            }
        }
    }
}

fn unexpected(resp: Response) -> ClientError {
    ClientError::Rejected {
        msg: format!("unexpected response: {resp:?}"),
    }
}
