//! End-to-end scenarios over a single-peer cluster.

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::time::timeout;

    use replog_client::cancel::CancelToken;
    use replog_client::error::ClientError;
    use replog_client::stream::StreamItem;
    use replog_client::subscriber::SubscriberEvent;
    use replog_log::compact::{run_compaction, CompactionOptions};
    use replog_log::log::{FileLog, LogConfig};
    use replog_log::snapshot::SnapshotFile;
    use replog_log::state::VecState;
    use replog_log::types::{LogEntry, LogIndex, RequestId, Term};

    use crate::harness::TestCluster;

    const LONG: Duration = Duration::from_secs(20);

    async fn commit_payloads(cluster: &TestCluster, payloads: &[&[u8]]) -> Vec<LogIndex> {
        let mut client = cluster.client();
        let cancel = CancelToken::new();
        let mut indices = Vec::new();
        for payload in payloads {
            let idx = client
                .request_update(RequestId::generate(), payload.to_vec(), &cancel)
                .await
                .expect("update");
            indices.push(idx);
        }
        indices
    }

    async fn commit_n(cluster: &TestCluster, from: u64, to: u64) {
        let mut client = cluster.client();
        let cancel = CancelToken::new();
        for i in from..=to {
            client
                .request_update(
                    RequestId::generate(),
                    format!("payload-{i}").into_bytes(),
                    &cancel,
                )
                .await
                .expect("update");
        }
    }

    // Scenario 1: single-peer append and read.
    #[tokio::test]
    async fn test_single_peer_append_and_read() {
        let cluster = TestCluster::start().await;
        let mut client = cluster.client();
        let cancel = CancelToken::new();

        let idx = client
            .request_update(RequestId::generate(), b"a".to_vec(), &cancel)
            .await
            .unwrap();
        assert_eq!(idx, LogIndex::new(1));

        let info = client.request_log_info(false, &cancel).await.unwrap();
        assert_eq!(info.commit_index, LogIndex::new(1));
        assert_eq!(info.last_index, LogIndex::new(1));

        let mut stream = client
            .request_entries(LogIndex::ZERO, &cancel)
            .await
            .unwrap();
        match timeout(LONG, stream.next()).await.unwrap().unwrap() {
            Some(StreamItem::Entry(entry)) => {
                assert_eq!(entry.index, LogIndex::new(1));
                assert_eq!(entry.payload, b"a");
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(timeout(LONG, stream.next()).await.unwrap().unwrap().is_none());
    }

    // Scenario 2: subscriber catch-up from index 0 against a populated log.
    #[tokio::test]
    async fn test_subscriber_catch_up() {
        let cluster = TestCluster::start().await;
        commit_n(&cluster, 1, 100).await;

        let mut sub = cluster.subscriber(LogIndex::ZERO, 64);
        let mut delivered = Vec::new();
        while delivered.len() < 100 {
            match timeout(LONG, sub.next()).await.expect("timely delivery") {
                Some(StreamItem::Entry(entry)) => delivered.push(entry),
                Some(other) => panic!("unexpected {other:?}"),
                None => panic!("subscriber closed early"),
            }
        }
        for (i, entry) in delivered.iter().enumerate() {
            assert_eq!(entry.index, LogIndex::new(i as u64 + 1));
            assert_eq!(entry.payload, format!("payload-{}", i + 1).into_bytes());
        }
        assert_eq!(sub.last_log_index(), LogIndex::new(100));

        let mut events = Vec::new();
        while let Some(event) = sub.poll_event() {
            events.push(event);
        }
        assert!(events.contains(&SubscriberEvent::Stale { gap: 100 }));
        assert!(events.contains(&SubscriberEvent::Fresh));

        // Subsequent broadcasts flow live.
        let idx = sub.update(b"after-catchup".to_vec()).await.unwrap();
        assert_eq!(idx, LogIndex::new(101));
        match timeout(LONG, sub.next()).await.unwrap() {
            Some(StreamItem::Entry(entry)) => {
                assert_eq!(entry.index, LogIndex::new(101));
                assert_eq!(entry.payload, b"after-catchup");
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(sub.last_update_log_index(), LogIndex::new(101));
        sub.close().await;
    }

    // Scenario 3: leader death mid-update; the retransmitted request id
    // resolves to the originally committed index.
    #[tokio::test]
    async fn test_leader_failover_idempotent_retransmit() {
        let mut cluster = TestCluster::start().await;
        let mut client = cluster.client();
        let cancel = CancelToken::new();

        let rid = RequestId::generate();
        let idx = client
            .request_update(rid, b"once".to_vec(), &cancel)
            .await
            .unwrap();
        assert_eq!(idx, LogIndex::new(1));

        cluster.kill_node().await;

        // Retransmit against the dead peer; the client loops on timeouts.
        let retry_cancel = cancel.clone();
        let retry = tokio::spawn(async move {
            client.request_update(rid, b"once".to_vec(), &retry_cancel).await
        });

        tokio::time::sleep(Duration::from_millis(400)).await;
        cluster.restart_node().await;

        let idx = timeout(LONG, retry).await.unwrap().unwrap().unwrap();
        assert_eq!(idx, LogIndex::new(1), "dedup returns the original index");
    }

    // Scenario 4: a subscriber that missed ten broadcasts emits one stale
    // event, recovers the exact gap via the streaming RPC, then goes fresh.
    #[tokio::test]
    async fn test_gap_recovery() {
        let cluster = TestCluster::start().await;
        commit_n(&cluster, 1, 15).await;

        // This consumer already holds 1..=5 and missed 6..=15.
        let mut sub = cluster.subscriber(LogIndex::new(5), 64);
        let mut delivered = Vec::new();
        while delivered.len() < 10 {
            match timeout(LONG, sub.next()).await.expect("timely delivery") {
                Some(StreamItem::Entry(entry)) => delivered.push(entry),
                Some(other) => panic!("unexpected {other:?}"),
                None => panic!("subscriber closed early"),
            }
        }
        for (i, entry) in delivered.iter().enumerate() {
            assert_eq!(entry.index, LogIndex::new(i as u64 + 6));
        }
        assert_eq!(sub.last_log_index(), LogIndex::new(15));

        let mut events = Vec::new();
        while let Some(event) = sub.poll_event() {
            events.push(event);
        }
        assert_eq!(
            events
                .iter()
                .filter(|e| matches!(e, SubscriberEvent::Stale { .. }))
                .count(),
            1,
            "exactly one stale episode"
        );
        assert!(events.contains(&SubscriberEvent::Stale { gap: 10 }));
        let stale_pos = events
            .iter()
            .position(|e| matches!(e, SubscriberEvent::Stale { .. }))
            .unwrap();
        let fresh_pos = events
            .iter()
            .position(|e| *e == SubscriberEvent::Fresh)
            .unwrap();
        assert!(stale_pos < fresh_pos, "stale precedes fresh");
        sub.close().await;
    }

    // Scenario 5: compaction at index 500 over a 1000-entry log, then the
    // compacted node serves catch-up as snapshot chunks plus tail entries.
    #[tokio::test]
    async fn test_compaction_install_and_snapshot_stream() {
        let tempdir = tempfile::tempdir().unwrap();
        let log_dir = tempdir.path().join("log");
        let log_config = LogConfig {
            max_entries_per_segment: 100,
            max_bytes_per_segment: 8 * 1024 * 1024,
        };
        {
            let mut log = FileLog::open(&log_dir, log_config.clone(), None).unwrap();
            for i in 1..=1000u64 {
                log.append(LogEntry::state(
                    LogIndex::new(i),
                    Term::new(1),
                    RequestId::generate(),
                    format!("payload-{i}").into_bytes(),
                ))
                .unwrap();
            }
            log.flush().unwrap();
        }

        let mut opts = CompactionOptions::new(tempdir.path());
        opts.snapshot_path = Some(tempdir.path().join("snap"));
        opts.target_index = Some(LogIndex::new(500));
        let mut sm = VecState::new();
        let report = run_compaction(&opts, &mut sm).unwrap();
        assert_eq!(report.meta.last_included_index, LogIndex::new(500));

        // Post-conditions on the log.
        let snap = SnapshotFile::open(&tempdir.path().join("snap")).unwrap();
        {
            let mut log = FileLog::open(&log_dir, log_config, Some(snap.meta())).unwrap();
            assert_eq!(log.first_index(), LogIndex::new(501));
            assert!(log.read(LogIndex::new(500)).unwrap().is_none());
            assert_eq!(
                log.read(LogIndex::new(501)).unwrap().unwrap().payload,
                b"payload-501"
            );
            assert!(log.list_segments_before(LogIndex::new(501)).is_empty());
        }

        // A node over the compacted directory serves old readers from the
        // snapshot.
        use replog_net::transport::{FanoutDirectory, PeerDirectory};
        use replog_server::node::{Node, NodeConfig};
        let directory = PeerDirectory::new();
        let fanout = FanoutDirectory::new();
        let mut config = NodeConfig::new(
            1,
            crate::harness::RPC_URL,
            crate::harness::PUB_URL,
            tempdir.path(),
            crate::harness::SECRET.to_vec(),
        );
        config.heartbeat_interval = crate::harness::HEARTBEAT;
        let _node = Node::spawn(config, &directory, &fanout).await.unwrap();

        let mut client = replog_client::rpc::ClusterClient::new(
            vec![replog_net::message::PeerInfo {
                id: 1,
                url: replog_net::url::PeerUrl::parse(crate::harness::RPC_URL).unwrap(),
            }],
            directory,
            TestCluster::client_config(),
        )
        .unwrap();
        let cancel = CancelToken::new();
        let mut stream = client
            .request_entries(LogIndex::new(1), &cancel)
            .await
            .unwrap();

        let mut snapshot_bytes = 0u64;
        let mut saw_last_chunk = false;
        let mut next_entry = LogIndex::new(501);
        loop {
            match timeout(LONG, stream.next()).await.unwrap().unwrap() {
                Some(StreamItem::Snapshot(chunk)) => {
                    assert_eq!(chunk.last_included_index, LogIndex::new(500));
                    assert!(!saw_last_chunk);
                    snapshot_bytes += chunk.data.len() as u64;
                    if chunk.is_last {
                        saw_last_chunk = true;
                        assert_eq!(snapshot_bytes, chunk.byte_size);
                    }
                }
                Some(StreamItem::Entry(entry)) => {
                    assert!(saw_last_chunk, "entries follow the snapshot");
                    assert_eq!(entry.index, next_entry);
                    next_entry = next_entry.next();
                }
                None => break,
            }
        }
        assert!(saw_last_chunk);
        assert!(next_entry > LogIndex::new(501), "tail entries served");
    }

    // Scenario 6: a consumer that stops pulling pauses the fan-out; on
    // resumption delivery continues with no losses.
    #[tokio::test]
    async fn test_backpressure_pause_resume() {
        let cluster = TestCluster::start().await;
        let mut sub = cluster.subscriber(LogIndex::ZERO, 2);

        commit_payloads(&cluster, &[b"p1", b"p2", b"p3"]).await;
        for i in 1..=3u64 {
            match timeout(LONG, sub.next()).await.unwrap() {
                Some(StreamItem::Entry(entry)) => assert_eq!(entry.index, LogIndex::new(i)),
                other => panic!("unexpected {other:?}"),
            }
        }

        // Stop pulling; keep the cluster busy well past the buffer.
        commit_n(&cluster, 4, 9).await;
        tokio::time::sleep(crate::harness::HEARTBEAT * 4).await;

        // Resume: everything arrives, in order, exactly once.
        for i in 4..=9u64 {
            match timeout(LONG, sub.next()).await.expect("resumed delivery") {
                Some(StreamItem::Entry(entry)) => assert_eq!(entry.index, LogIndex::new(i)),
                other => panic!("unexpected {other:?}"),
            }
        }
        assert_eq!(sub.last_log_index(), LogIndex::new(9));
        sub.close().await;
    }

    // Failed updates surface as errors, not hangs: an unknown peer set is
    // rejected at construction.
    #[tokio::test]
    async fn test_client_requires_peers() {
        let cluster = TestCluster::start().await;
        let result = replog_client::rpc::ClusterClient::new(
            vec![],
            cluster.directory.clone(),
            TestCluster::client_config(),
        );
        assert!(matches!(result, Err(ClientError::InvalidArgument { .. })));
    }
}
