//! Cross-crate invariant checks.

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;
    use std::time::Duration;

    use tokio::time::timeout;

    use replog_client::cancel::CancelToken;
    use replog_client::stream::StreamItem;
    use replog_log::types::{LogIndex, RequestId};

    use crate::harness::TestCluster;

    const LONG: Duration = Duration::from_secs(20);

    // The read-side stream of a subscriber equals the committed sequence,
    // in order, without duplicates.
    #[tokio::test]
    async fn test_subscriber_stream_equals_committed_sequence() {
        let cluster = TestCluster::start().await;
        let mut client = cluster.client();
        let cancel = CancelToken::new();

        let mut committed = Vec::new();
        for i in 0..30u64 {
            let payload = vec![i as u8; (i % 7 + 1) as usize];
            client
                .request_update(RequestId::generate(), payload.clone(), &cancel)
                .await
                .unwrap();
            committed.push(payload);
        }

        let mut sub = cluster.subscriber(LogIndex::ZERO, 8);
        let mut seen_indices = BTreeSet::new();
        let mut delivered = Vec::new();
        while delivered.len() < committed.len() {
            match timeout(LONG, sub.next()).await.unwrap() {
                Some(StreamItem::Entry(entry)) => {
                    assert!(
                        seen_indices.insert(entry.index),
                        "duplicate delivery of {}",
                        entry.index
                    );
                    delivered.push(entry.payload);
                }
                other => panic!("unexpected {other:?}"),
            }
        }
        assert_eq!(delivered, committed);
        sub.close().await;
    }

    // The entries stream observes every completed append in order.
    #[tokio::test]
    async fn test_entries_stream_equals_log() {
        let cluster = TestCluster::start().await;
        let mut client = cluster.client();
        let cancel = CancelToken::new();

        for i in 1..=20u64 {
            client
                .request_update(
                    RequestId::generate(),
                    format!("v{i}").into_bytes(),
                    &cancel,
                )
                .await
                .unwrap();
        }

        let mut stream = client
            .request_entries(LogIndex::new(1), &cancel)
            .await
            .unwrap();
        let mut next = 1u64;
        while let Some(item) = timeout(LONG, stream.next()).await.unwrap().unwrap() {
            match item {
                StreamItem::Entry(entry) => {
                    assert_eq!(entry.index, LogIndex::new(next));
                    assert_eq!(entry.payload, format!("v{next}").into_bytes());
                    next += 1;
                }
                other => panic!("unexpected {other:?}"),
            }
        }
        assert_eq!(next, 21);
    }

    // Idempotence: the same request id never appends twice.
    #[tokio::test]
    async fn test_update_idempotence_across_clients() {
        let cluster = TestCluster::start().await;
        let cancel = CancelToken::new();
        let rid = RequestId::generate();

        let mut first = cluster.client();
        let idx1 = first
            .request_update(rid, b"same".to_vec(), &cancel)
            .await
            .unwrap();

        // A different client instance retransmitting the same id.
        let mut second = cluster.client();
        let idx2 = second
            .request_update(rid, b"same".to_vec(), &cancel)
            .await
            .unwrap();
        assert_eq!(idx1, idx2);

        let info = second.request_log_info(false, &cancel).await.unwrap();
        assert_eq!(info.last_index, LogIndex::new(1), "single log append");
    }

    // Batched writes commit every request exactly once; ordering across a
    // concurrent batch is not guaranteed, only coverage.
    #[tokio::test]
    async fn test_update_batch_commits_all() {
        let cluster = TestCluster::start().await;
        let mut sub = cluster.subscriber(LogIndex::ZERO, 64);

        let payloads: Vec<Vec<u8>> = (0..10u8).map(|i| vec![i]).collect();
        let results = sub.update_batch(payloads).await;

        let mut indices = BTreeSet::new();
        for result in results {
            assert!(indices.insert(result.unwrap()));
        }
        let expected: BTreeSet<LogIndex> = (1..=10).map(LogIndex::new).collect();
        assert_eq!(indices, expected);
        assert_eq!(sub.last_update_log_index(), LogIndex::new(10));
        sub.close().await;
    }

    // Freshness law: once fresh, the next broadcast connects to the
    // delivered prefix (observed as uninterrupted in-order delivery).
    #[tokio::test]
    async fn test_fresh_then_live_tail_is_dense() {
        let cluster = TestCluster::start().await;
        let mut sub = cluster.subscriber(LogIndex::ZERO, 16);

        for round in 0..3u64 {
            let base = round * 5;
            for i in 1..=5u64 {
                sub.update(format!("r{}-{}", round, i).into_bytes())
                    .await
                    .unwrap();
            }
            for i in 1..=5u64 {
                match timeout(LONG, sub.next()).await.unwrap() {
                    Some(StreamItem::Entry(entry)) => {
                        assert_eq!(entry.index, LogIndex::new(base + i));
                    }
                    other => panic!("unexpected {other:?}"),
                }
            }
        }
        sub.close().await;
    }
}
