//! In-process frame transport.
//!
//! Carries the exact wire frames of [`crate::frames`] over tokio channels:
//! a request/reply channel pair with correlation ids for RPC, and a fan-out
//! hub with per-subscriber secret filters for the broadcast stream. A
//! socket transport can replace either at this seam without touching the
//! codec or the components above it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use bytes::Bytes;
use tokio::sync::{broadcast, mpsc};
use tracing::debug;

use crate::error::{NetError, NetResult};
use crate::frames::Frames;

/// Default bound for in-flight requests per listener.
pub const DEFAULT_RPC_CAPACITY: usize = 64;

/// Default fan-out ring capacity per hub.
pub const DEFAULT_FANOUT_CAPACITY: usize = 1024;

/// An RPC arriving at a listener, with its reply path.
pub struct IncomingRpc {
    corr: Bytes,
    /// Decorrelated request frames.
    pub request: Frames,
    replies: mpsc::Sender<Frames>,
}

impl IncomingRpc {
    /// Sends one response message, echoing the request's correlation id as
    /// the first frame. Streaming responses call this repeatedly.
    pub async fn reply(&self, mut response: Frames) -> NetResult<()> {
        let mut frames = Vec::with_capacity(response.len() + 1);
        frames.push(self.corr.clone());
        frames.append(&mut response);
        self.replies.send(frames).await.map_err(|_| NetError::Closed)
    }

    /// True once the caller has gone away (cancellation).
    pub fn caller_gone(&self) -> bool {
        self.replies.is_closed()
    }
}

/// Client handle for one peer endpoint. Cheap to clone.
#[derive(Clone)]
pub struct RpcConnector {
    tx: mpsc::Sender<IncomingRpc>,
    next_corr: Arc<AtomicU64>,
}

/// Server side of an RPC channel.
pub struct RpcListener {
    rx: mpsc::Receiver<IncomingRpc>,
}

/// Creates a connected RPC channel pair.
pub fn rpc_channel(capacity: usize) -> (RpcConnector, RpcListener) {
    let (tx, rx) = mpsc::channel(capacity);
    (
        RpcConnector {
            tx,
            next_corr: Arc::new(AtomicU64::new(1)),
        },
        RpcListener { rx },
    )
}

impl RpcConnector {
    /// Issues a request; the returned stream yields response messages.
    ///
    /// Dropping the stream cancels the request: late replies are dropped on
    /// the floor by the transport.
    pub async fn call(&self, request: Frames) -> NetResult<ReplyStream> {
        let corr = self.next_corr.fetch_add(1, Ordering::Relaxed);
        let corr = Bytes::copy_from_slice(&corr.to_le_bytes());
        let (reply_tx, reply_rx) = mpsc::channel(16);
        self.tx
            .send(IncomingRpc {
                corr: corr.clone(),
                request,
                replies: reply_tx,
            })
            .await
            .map_err(|_| NetError::Closed)?;
        Ok(ReplyStream { corr, rx: reply_rx })
    }

    /// True once the listener side has shut down.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

impl RpcListener {
    /// Waits for the next incoming RPC. None when all connectors are gone.
    pub async fn accept(&mut self) -> Option<IncomingRpc> {
        self.rx.recv().await
    }
}

/// Response stream for one RPC call.
pub struct ReplyStream {
    corr: Bytes,
    rx: mpsc::Receiver<Frames>,
}

impl ReplyStream {
    /// Next response message with the correlation frame verified and
    /// stripped. None when the server closed the stream.
    pub async fn next(&mut self) -> NetResult<Option<Frames>> {
        let Some(mut frames) = self.rx.recv().await else {
            return Ok(None);
        };
        if frames.first() != Some(&self.corr) {
            return Err(NetError::frame("response correlation id mismatch"));
        }
        frames.remove(0);
        Ok(Some(frames))
    }
}

/// Publisher side of the broadcast fan-out.
#[derive(Clone)]
pub struct FanoutHub {
    tx: broadcast::Sender<Frames>,
}

impl FanoutHub {
    /// Creates a hub with the given ring capacity.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Publishes one message to every live subscriber. Returns the number
    /// of subscribers that can still receive it. Messages to a hub with no
    /// subscribers are dropped, matching a linger-free socket.
    pub fn publish(&self, frames: Frames) -> usize {
        self.tx.send(frames).unwrap_or(0)
    }

    /// Number of attached subscriptions.
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Attaches a subscription filtering on `filter` as the first frame.
    pub fn subscribe(&self, filter: Vec<u8>) -> FanoutSubscription {
        FanoutSubscription {
            hub: self.tx.clone(),
            rx: Some(self.tx.subscribe()),
            filter,
        }
    }
}

/// A pausable, filtered fan-out subscription.
///
/// Pausing drops the underlying receiver entirely, shedding load at the
/// source; messages published while paused are simply missed, which the
/// subscriber's gap recovery then repairs.
pub struct FanoutSubscription {
    hub: broadcast::Sender<Frames>,
    rx: Option<broadcast::Receiver<Frames>>,
    filter: Vec<u8>,
}

impl FanoutSubscription {
    /// Receives the next message whose first frame equals the filter.
    ///
    /// Messages dropped by the ring buffer under lag are skipped silently;
    /// the indices carried in later messages expose the gap. Calling this
    /// while paused reports the subscription as closed.
    pub async fn recv(&mut self) -> NetResult<Frames> {
        let Some(rx) = self.rx.as_mut() else {
            return Err(NetError::Closed);
        };
        loop {
            match rx.recv().await {
                Ok(frames) => {
                    if frames.first().map(|f| f.as_ref()) == Some(self.filter.as_slice()) {
                        return Ok(frames);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    debug!(missed = n, "fan-out subscription lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return Err(NetError::Closed),
            }
        }
    }

    /// Detaches from the hub without dropping the subscription handle.
    pub fn pause(&mut self) {
        self.rx = None;
    }

    /// Re-attaches to the hub. Messages published while paused are gone.
    pub fn resume(&mut self) {
        if self.rx.is_none() {
            self.rx = Some(self.hub.subscribe());
        }
    }

    /// True while detached.
    pub fn is_paused(&self) -> bool {
        self.rx.is_none()
    }
}

/// Dial table mapping peer URLs to RPC endpoints.
///
/// The in-process stand-in for establishing a connection: servers register
/// their listener under their advertised URL, clients "dial" by lookup.
#[derive(Clone, Default)]
pub struct PeerDirectory {
    inner: Arc<RwLock<HashMap<String, RpcConnector>>>,
}

impl PeerDirectory {
    /// Creates an empty directory.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers (or replaces) the endpoint behind `url`.
    pub fn register(&self, url: &str, connector: RpcConnector) {
        self.inner
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(url.to_string(), connector);
    }

    /// Removes the endpoint behind `url` (simulates a peer going down).
    pub fn deregister(&self, url: &str) {
        self.inner
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(url);
    }

    /// Dials `url`. None when nothing is listening there.
    pub fn dial(&self, url: &str) -> Option<RpcConnector> {
        self.inner
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(url)
            .cloned()
    }
}

/// Dial table mapping publisher URLs to fan-out hubs.
#[derive(Clone, Default)]
pub struct FanoutDirectory {
    inner: Arc<RwLock<HashMap<String, FanoutHub>>>,
}

impl FanoutDirectory {
    /// Creates an empty directory.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers (or replaces) the hub publishing at `url`.
    pub fn register(&self, url: &str, hub: FanoutHub) {
        self.inner
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(url.to_string(), hub);
    }

    /// Removes the hub behind `url` (simulates a publisher going down).
    pub fn deregister(&self, url: &str) {
        self.inner
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(url);
    }

    /// Dials the publisher at `url`. None when nothing publishes there.
    pub fn dial(&self, url: &str) -> Option<FanoutHub> {
        self.inner
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(url)
            .cloned()
    }
}
