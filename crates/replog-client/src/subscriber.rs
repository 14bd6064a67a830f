//! Broadcast subscriber.
//!
//! A duplex ordered stream over the replicated log. The read side delivers
//! entries (and snapshot chunks) in strict index order with pull-based
//! backpressure; the write side forwards update requests to the cluster
//! through the RPC client. Gaps between broadcast messages are repaired
//! with a missing-entries stream while newer messages queue in the ahead
//! buffer.
//!
//! The session runs in a driver task; the handle communicates with it only
//! through channels, keeping all mutable session state confined to one
//! task.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use replog_log::types::{LogIndex, RequestId};
use replog_net::broadcast::BroadcastMsg;
use replog_net::error::NetError;
use replog_net::transport::{FanoutDirectory, FanoutSubscription};

use crate::cancel::CancelToken;
use crate::error::{ClientError, ClientResult};
use crate::rpc::ClusterClient;
use crate::stream::{decode_broadcast_entry, StreamItem};

/// Floor for the broadcast unresponsiveness timeout.
const MIN_UNRESPONSIVE: Duration = Duration::from_millis(100);

/// Delay between discovery attempts when no publisher is known yet.
const DISCOVERY_RETRY: Duration = Duration::from_millis(100);

/// Subscriber tunables.
#[derive(Debug, Clone)]
pub struct SubscriberOptions {
    /// Cluster secret (subscription filter and identity check).
    pub secret: Vec<u8>,
    /// Resume point: highest index already held by the consumer.
    pub last_index: LogIndex,
    /// Publisher heartbeat interval; the unresponsiveness timeout is
    /// `max(2 × heartbeat_interval, 100 ms)`.
    pub heartbeat_interval: Duration,
    /// Read-side buffer; when full, the subscriber pauses the fan-out.
    pub read_buffer: usize,
    /// Serialise update submission through a single-slot buffer so commit
    /// order matches submission order. Costs write throughput.
    pub ordered_updates: bool,
}

impl Default for SubscriberOptions {
    fn default() -> Self {
        Self {
            secret: Vec::new(),
            last_index: LogIndex::ZERO,
            heartbeat_interval: Duration::from_millis(500),
            read_buffer: 64,
            ordered_updates: false,
        }
    }
}

impl SubscriberOptions {
    /// The broadcast unresponsiveness timeout for these options.
    pub fn unresponsive_timeout(&self) -> Duration {
        (self.heartbeat_interval * 2).max(MIN_UNRESPONSIVE)
    }
}

/// Liveness and freshness notifications from the read side.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SubscriberEvent {
    /// The read side is caught up with the broadcast stream.
    Fresh,
    /// A gap was detected; missing-entries recovery started.
    Stale {
        /// Number of missing entries at detection time.
        gap: u64,
    },
    /// No broadcast arrived within the unresponsiveness timeout; the
    /// subscriber is rediscovering the publisher.
    BroadcastTimeout,
}

#[derive(Default)]
struct Counters {
    last_log_index: AtomicU64,
    last_update_log_index: AtomicU64,
}

struct UpdateJob {
    request_id: RequestId,
    payload: Vec<u8>,
    reply: oneshot::Sender<ClientResult<LogIndex>>,
}

/// Handle to a running subscriber session.
pub struct Subscriber {
    items: mpsc::Receiver<StreamItem>,
    demand: Arc<Notify>,
    events: mpsc::UnboundedReceiver<SubscriberEvent>,
    errors: mpsc::UnboundedReceiver<ClientError>,
    updates: mpsc::Sender<UpdateJob>,
    counters: Arc<Counters>,
    cancel: CancelToken,
    driver: Option<JoinHandle<()>>,
    writer: Option<JoinHandle<()>>,
}

impl Subscriber {
    /// Spawns a subscriber session.
    ///
    /// The session stays in `Disconnected` until the first read or write
    /// demand, then discovers the publisher via the RPC client and the
    /// fan-out directory.
    pub fn spawn(
        options: SubscriberOptions,
        client: ClusterClient,
        fanout: FanoutDirectory,
    ) -> Self {
        let (items_tx, items_rx) = mpsc::channel(options.read_buffer.max(1));
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (errors_tx, errors_rx) = mpsc::unbounded_channel();
        let update_slots = if options.ordered_updates { 1 } else { 64 };
        let (updates_tx, updates_rx) = mpsc::channel(update_slots);
        let demand = Arc::new(Notify::new());
        let counters = Arc::new(Counters {
            last_log_index: AtomicU64::new(options.last_index.as_u64()),
            last_update_log_index: AtomicU64::new(0),
        });
        let cancel = CancelToken::new();

        let driver = Driver {
            last_delivered: options.last_index,
            options: options.clone(),
            client: client.clone(),
            fanout,
            items_tx,
            demand: demand.clone(),
            events_tx,
            errors_tx,
            counters: counters.clone(),
            cancel: cancel.clone(),
            ahead: BTreeMap::new(),
            fresh: false,
        };
        let driver_handle = tokio::spawn(driver.run());
        let writer_handle = tokio::spawn(run_writer(
            client,
            updates_rx,
            counters.clone(),
            cancel.clone(),
            options.ordered_updates,
        ));

        Self {
            items: items_rx,
            demand,
            events: events_rx,
            errors: errors_rx,
            updates: updates_tx,
            counters,
            cancel,
            driver: Some(driver_handle),
            writer: Some(writer_handle),
        }
    }

    /// Pulls the next item in strict index order.
    ///
    /// Returns None once the session is closed. Each pull frees a buffer
    /// slot and wakes a paused session.
    pub async fn next(&mut self) -> Option<StreamItem> {
        self.demand.notify_one();
        let item = self.items.recv().await;
        self.demand.notify_one();
        item
    }

    /// Submits one update and waits for its commit index.
    pub async fn update(&mut self, payload: Vec<u8>) -> ClientResult<LogIndex> {
        self.update_with_id(RequestId::generate(), payload).await
    }

    /// Submits one update under a caller-chosen request id.
    pub async fn update_with_id(
        &mut self,
        request_id: RequestId,
        payload: Vec<u8>,
    ) -> ClientResult<LogIndex> {
        self.demand.notify_one();
        let (reply_tx, reply_rx) = oneshot::channel();
        self.updates
            .send(UpdateJob {
                request_id,
                payload,
                reply: reply_tx,
            })
            .await
            .map_err(|_| ClientError::Closed)?;
        reply_rx.await.map_err(|_| ClientError::Closed)?
    }

    /// Submits a batch of updates concurrently and collects the results in
    /// submission order. Commit order across the batch is not guaranteed
    /// unless `ordered_updates` is set.
    pub async fn update_batch(
        &mut self,
        payloads: Vec<Vec<u8>>,
    ) -> Vec<ClientResult<LogIndex>> {
        self.demand.notify_one();
        let mut pending = Vec::with_capacity(payloads.len());
        for payload in payloads {
            let (reply_tx, reply_rx) = oneshot::channel();
            let job = UpdateJob {
                request_id: RequestId::generate(),
                payload,
                reply: reply_tx,
            };
            if self.updates.send(job).await.is_err() {
                pending.push(None);
            } else {
                pending.push(Some(reply_rx));
            }
        }
        let mut results = Vec::with_capacity(pending.len());
        for slot in pending {
            match slot {
                None => results.push(Err(ClientError::Closed)),
                Some(rx) => results.push(rx.await.unwrap_or(Err(ClientError::Closed))),
            }
        }
        results
    }

    /// Highest entry index delivered on the read side.
    pub fn last_log_index(&self) -> LogIndex {
        LogIndex::new(self.counters.last_log_index.load(Ordering::Relaxed))
    }

    /// Highest commit index acknowledged for writes from this subscriber.
    pub fn last_update_log_index(&self) -> LogIndex {
        LogIndex::new(self.counters.last_update_log_index.load(Ordering::Relaxed))
    }

    /// Next pending event, if any.
    pub fn poll_event(&mut self) -> Option<SubscriberEvent> {
        self.events.try_recv().ok()
    }

    /// Waits for the next event. None once the session is closed.
    pub async fn next_event(&mut self) -> Option<SubscriberEvent> {
        self.events.recv().await
    }

    /// Next unrecoverable session error, if one has been surfaced.
    pub fn poll_error(&mut self) -> Option<ClientError> {
        self.errors.try_recv().ok()
    }

    /// Closes the session: cancels in-flight recovery, discards the ahead
    /// queue, and drops the fan-out subscription without lingering.
    pub async fn close(mut self) {
        self.cancel.cancel();
        self.demand.notify_one();
        if let Some(driver) = self.driver.take() {
            let _ = driver.await;
        }
        if let Some(writer) = self.writer.take() {
            let _ = writer.await;
        }
    }
}

impl Drop for Subscriber {
    fn drop(&mut self) {
        self.cancel.cancel();
        self.demand.notify_one();
    }
}

async fn run_writer(
    client: ClusterClient,
    mut jobs: mpsc::Receiver<UpdateJob>,
    counters: Arc<Counters>,
    cancel: CancelToken,
    ordered: bool,
) {
    loop {
        let job = tokio::select! {
            _ = cancel.cancelled() => return,
            job = jobs.recv() => match job {
                Some(job) => job,
                None => return,
            },
        };
        if ordered {
            submit_update(client.clone(), job, counters.clone(), cancel.clone()).await;
        } else {
            tokio::spawn(submit_update(
                client.clone(),
                job,
                counters.clone(),
                cancel.clone(),
            ));
        }
    }
}

async fn submit_update(
    mut client: ClusterClient,
    job: UpdateJob,
    counters: Arc<Counters>,
    cancel: CancelToken,
) {
    let result = client
        .request_update(job.request_id, job.payload, &cancel)
        .await;
    if let Ok(index) = &result {
        counters
            .last_update_log_index
            .fetch_max(index.as_u64(), Ordering::Relaxed);
    }
    let _ = job.reply.send(result);
}

struct Driver {
    options: SubscriberOptions,
    client: ClusterClient,
    fanout: FanoutDirectory,
    items_tx: mpsc::Sender<StreamItem>,
    demand: Arc<Notify>,
    events_tx: mpsc::UnboundedSender<SubscriberEvent>,
    errors_tx: mpsc::UnboundedSender<ClientError>,
    counters: Arc<Counters>,
    cancel: CancelToken,
    last_delivered: LogIndex,
    ahead: BTreeMap<u64, BroadcastMsg>,
    fresh: bool,
}

impl Driver {
    async fn run(mut self) {
        // Disconnected until the first read or write demand.
        tokio::select! {
            _ = self.cancel.cancelled() => return,
            _ = self.demand.notified() => {}
        }
        loop {
            if self.cancel.is_cancelled() {
                return;
            }
            let mut subscription = match self.discover().await {
                Ok(sub) => sub,
                Err(ClientError::Closed) | Err(ClientError::Cancelled) => return,
                Err(e) => {
                    let _ = self.errors_tx.send(e);
                    return;
                }
            };
            self.fresh = false;
            if self.subscribed_loop(&mut subscription).await.is_err() {
                return;
            }
            // Timer expired or the hub went away: rediscover.
        }
    }

    /// Discovering: learn the cluster config, then the publisher URL, then
    /// attach the fan-out subscription.
    async fn discover(&mut self) -> ClientResult<FanoutSubscription> {
        debug!("subscriber discovering publisher");
        loop {
            if self.cancel.is_cancelled() {
                return Err(ClientError::Cancelled);
            }
            self.client.request_config(&self.cancel).await?;
            let secret = self.options.secret.clone();
            let url = self
                .client
                .request_publisher_url(&secret, &self.cancel)
                .await?;
            if let Some(url) = url {
                if let Some(hub) = self.fanout.dial(&url) {
                    info!(url = %url, "subscriber attached to publisher");
                    return Ok(hub.subscribe(self.options.secret.clone()));
                }
                warn!(url = %url, "publisher url does not resolve");
            }
            tokio::select! {
                _ = self.cancel.cancelled() => return Err(ClientError::Cancelled),
                _ = tokio::time::sleep(DISCOVERY_RETRY) => {}
            }
        }
    }

    /// Subscribed: consume broadcasts until the unresponsiveness timer
    /// fires (Ok → rediscover) or the session dies (Err).
    async fn subscribed_loop(
        &mut self,
        subscription: &mut FanoutSubscription,
    ) -> Result<(), ()> {
        let unresponsive = self.options.unresponsive_timeout();
        loop {
            let frames = tokio::select! {
                _ = self.cancel.cancelled() => return Err(()),
                _ = tokio::time::sleep(unresponsive) => {
                    info!("broadcast unresponsive, rediscovering");
                    let _ = self.events_tx.send(SubscriberEvent::BroadcastTimeout);
                    return Ok(());
                }
                frames = subscription.recv() => match frames {
                    Ok(frames) => frames,
                    Err(_) => return Ok(()),
                },
            };
            let msg = match BroadcastMsg::decode(&frames, &self.options.secret) {
                Ok(msg) => msg,
                Err(NetError::AuthFailure) => {
                    let _ = self.errors_tx.send(ClientError::AuthFailure);
                    return Err(());
                }
                Err(e) => {
                    warn!(error = %e, "dropping malformed broadcast");
                    continue;
                }
            };
            match self.handle_broadcast(msg, subscription).await {
                Ok(()) => {}
                Err(ClientError::Closed) | Err(ClientError::Cancelled) => return Err(()),
                Err(e @ ClientError::AuthFailure) => {
                    let _ = self.errors_tx.send(e);
                    return Err(());
                }
                Err(ClientError::Timeout) => return Ok(()),
                Err(e) => {
                    // Recovery failed; surface and rebuild the session.
                    warn!(error = %e, "broadcast handling failed, rediscovering");
                    let _ = self.errors_tx.send(e);
                    return Ok(());
                }
            }
        }
    }

    async fn handle_broadcast(
        &mut self,
        msg: BroadcastMsg,
        subscription: &mut FanoutSubscription,
    ) -> ClientResult<()> {
        let prev = msg.prev_index();
        if prev <= self.last_delivered {
            self.apply_suffix(&msg, subscription).await?;
            self.mark_fresh();
        } else {
            let gap = prev.as_u64() - self.last_delivered.as_u64();
            debug!(
                gap,
                prev = prev.as_u64(),
                delivered = self.last_delivered.as_u64(),
                "broadcast gap detected"
            );
            self.ahead.insert(msg.last_log_index.as_u64(), msg);
            self.fresh = false;
            let _ = self.events_tx.send(SubscriberEvent::Stale { gap });
            self.recover_gap(subscription).await?;
            self.mark_fresh();
        }
        Ok(())
    }

    /// Applies the suffix of `msg` past `last_delivered`.
    async fn apply_suffix(
        &mut self,
        msg: &BroadcastMsg,
        subscription: &mut FanoutSubscription,
    ) -> ClientResult<()> {
        if msg.last_log_index <= self.last_delivered {
            return Ok(());
        }
        let skip = (self.last_delivered.as_u64() - msg.prev_index().as_u64()) as usize;
        for encoded in msg.entries.iter().skip(skip) {
            let entry = decode_broadcast_entry(encoded)?;
            if entry.index != self.last_delivered.next() {
                warn!(
                    index = entry.index.as_u64(),
                    expected = self.last_delivered.next().as_u64(),
                    "broadcast entry misindexed, dropping message"
                );
                return Ok(());
            }
            let index = entry.index;
            self.deliver(StreamItem::Entry(entry), subscription).await?;
            self.advance_to(index);
        }
        Ok(())
    }

    fn advance_to(&mut self, index: LogIndex) {
        self.last_delivered = index;
        self.counters
            .last_log_index
            .store(index.as_u64(), Ordering::Relaxed);
    }

    /// Pushes one item to the consumer, entering `Paused` when the buffer
    /// is full: the fan-out subscription detaches until the consumer pulls
    /// again.
    async fn deliver(
        &mut self,
        item: StreamItem,
        subscription: &mut FanoutSubscription,
    ) -> ClientResult<()> {
        let mut item = item;
        loop {
            match self.items_tx.try_send(item) {
                Ok(()) => return Ok(()),
                Err(mpsc::error::TrySendError::Closed(_)) => return Err(ClientError::Closed),
                Err(mpsc::error::TrySendError::Full(returned)) => {
                    debug!("consumer full, pausing fan-out");
                    let was_attached = !subscription.is_paused();
                    subscription.pause();
                    tokio::select! {
                        _ = self.cancel.cancelled() => return Err(ClientError::Cancelled),
                        _ = self.demand.notified() => {}
                    }
                    if was_attached {
                        subscription.resume();
                    }
                    item = returned;
                }
            }
        }
    }

    /// Missing-entries recovery: fetch `(last_delivered, target]` through
    /// the streaming RPC while newer broadcasts queue in the ahead buffer,
    /// then drain the buffer in `last_log_index` order. A gap discovered
    /// during the drain repeats the fetch for the smaller gap.
    async fn recover_gap(
        &mut self,
        subscription: &mut FanoutSubscription,
    ) -> ClientResult<()> {
        while let Some(target) = self.ahead.values().next().map(|m| m.prev_index()) {
            if target > self.last_delivered {
                self.fetch_missing(target, subscription).await?;
            }
            // Drain every queued message that now connects.
            loop {
                let head = self.ahead.iter().next().map(|(k, m)| (*k, m.prev_index()));
                let Some((key, prev)) = head else { break };
                if prev > self.last_delivered {
                    break;
                }
                let Some(msg) = self.ahead.remove(&key) else { break };
                self.apply_suffix(&msg, subscription).await?;
            }
        }
        Ok(())
    }

    async fn fetch_missing(
        &mut self,
        target: LogIndex,
        subscription: &mut FanoutSubscription,
    ) -> ClientResult<()> {
        while self.last_delivered < target {
            if self.cancel.is_cancelled() {
                return Err(ClientError::Cancelled);
            }
            let mut stream = self
                .client
                .request_entries(self.last_delivered.next(), &self.cancel)
                .await?;
            loop {
                if self.last_delivered >= target {
                    return Ok(());
                }
                let item = tokio::select! {
                    _ = self.cancel.cancelled() => return Err(ClientError::Cancelled),
                    frames = subscription.recv() => {
                        // Broadcasts keep queueing while the fetch runs.
                        match frames {
                            Ok(frames) => {
                                if let Ok(msg) =
                                    BroadcastMsg::decode(&frames, &self.options.secret)
                                {
                                    self.ahead.insert(msg.last_log_index.as_u64(), msg);
                                }
                                continue;
                            }
                            // Fan-out died mid-recovery; rebuild the session
                            // and resume recovery from the next broadcast.
                            Err(_) => return Err(ClientError::Timeout),
                        }
                    }
                    item = stream.next() => item,
                };
                match item {
                    Ok(Some(StreamItem::Entry(entry))) => {
                        let index = entry.index;
                        if index != self.last_delivered.next() {
                            // Restart from the current position.
                            break;
                        }
                        self.deliver(StreamItem::Entry(entry), subscription).await?;
                        self.advance_to(index);
                    }
                    Ok(Some(StreamItem::Snapshot(chunk))) => {
                        let is_last = chunk.is_last;
                        let covered = chunk.last_included_index;
                        self.deliver(StreamItem::Snapshot(chunk), subscription).await?;
                        if is_last {
                            // The snapshot folds in everything up to its
                            // boundary; the consumer fast-forwards with us.
                            self.advance_to(covered.max(self.last_delivered));
                        }
                    }
                    Ok(None) => break, // Budget exhausted: resume with a new call.
                    Err(ClientError::OutOfOrder) | Err(ClientError::Timeout) => {
                        debug!("missing-entries stream reset, restarting from cursor");
                        break;
                    }
                    Err(e @ ClientError::AuthFailure)
                    | Err(e @ ClientError::Closed)
                    | Err(e @ ClientError::Cancelled) => return Err(e),
                    Err(e) => {
                        warn!(error = %e, "missing-entries fetch failed, retrying");
                        tokio::select! {
                            _ = self.cancel.cancelled() => return Err(ClientError::Cancelled),
                            _ = tokio::time::sleep(DISCOVERY_RETRY) => {}
                        }
                        break;
                    }
                }
            }
        }
        Ok(())
    }

    fn mark_fresh(&mut self) {
        if !self.fresh {
            self.fresh = true;
            let _ = self.events_tx.send(SubscriberEvent::Fresh);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unresponsive_timeout_floor() {
        let mut options = SubscriberOptions::default();
        assert_eq!(options.unresponsive_timeout(), Duration::from_millis(1000));

        options.heartbeat_interval = Duration::from_millis(20);
        assert_eq!(
            options.unresponsive_timeout(),
            MIN_UNRESPONSIVE,
            "twice a fast heartbeat is clamped to the floor"
        );

        options.heartbeat_interval = Duration::from_millis(75);
        assert_eq!(options.unresponsive_timeout(), Duration::from_millis(150));
    }

    #[test]
    fn test_options_defaults() {
        let options = SubscriberOptions::default();
        assert_eq!(options.last_index, LogIndex::ZERO);
        assert_eq!(options.heartbeat_interval, Duration::from_millis(500));
        assert!(!options.ordered_updates);
        assert!(options.read_buffer > 0);
    }

    #[test]
    fn test_event_equality() {
        assert_eq!(
            SubscriberEvent::Stale { gap: 3 },
            SubscriberEvent::Stale { gap: 3 }
        );
        assert_ne!(
            SubscriberEvent::Stale { gap: 3 },
            SubscriberEvent::Stale { gap: 4 }
        );
        assert_ne!(SubscriberEvent::Fresh, SubscriberEvent::BroadcastTimeout);
    }
}
