//! Coordinator behaviour against an in-process cluster
//!
//! Run with: cargo test -p ringstore-cluster --test replication

mod common;

use bytes::Bytes;
use common::{content_on, key, two_node_config, TestCluster};
use ringstore_cluster::{CoordinatorConfig, NodeOutcome, OperationState};
use ringstore_core::{
    Compression, EntryMetadata, KeyCodec, QuorumTier, RingStoreError, StoredEntry,
};

#[tokio::test]
async fn test_minimal_then_optimal_completion() {
    let cluster = TestCluster::new(two_node_config(), 1000);
    let coordinator = cluster.coordinator();

    let mut op = coordinator.put(key("doc"), Bytes::from_static(b"payload"));
    op.complete_minimally().await.unwrap();
    assert_eq!(op.result().success_count(), 1);
    assert!(op.succeeded_minimally());
    assert!(!op.succeeded_optimally());

    let result = op.complete_optimally().await.unwrap().finish().unwrap();
    assert_eq!(result.success_count(), 2);
    assert_eq!(result.fail_count(), 0);
    assert_eq!(result.ignore_count(), 0);
    assert!(result.succeeded_maximally());

    for service in &cluster.services {
        assert_eq!(
            content_on(service, "doc"),
            Some(Bytes::from_static(b"payload"))
        );
    }
}

#[tokio::test]
async fn test_finish_after_minimal_ignores_rest() {
    let mut config = two_node_config();
    config.coordinator = CoordinatorConfig::default()
        .with_thresholds(1, 1, 2)
        .with_retries(false);
    let cluster = TestCluster::new(config, 1000);
    let coordinator = cluster.coordinator();

    let mut op = coordinator.put(key("doc"), Bytes::from_static(b"payload"));
    let result = op.complete_minimally().await.unwrap().finish().unwrap();
    assert_eq!(result.success_count(), 1);
    assert_eq!(result.ignore_count(), 1);
    assert_eq!(op.state(), OperationState::Finished);

    // only the primary holds the entry
    let primary = &coordinator.candidates(&key("doc"))[0];
    for service in &cluster.services {
        let expected = service.node_id() == primary;
        assert_eq!(content_on(service, "doc").is_some(), expected);
    }
}

#[tokio::test]
async fn test_put_get_info_delete() {
    let cluster = TestCluster::new(two_node_config(), 1000);
    let coordinator = cluster.coordinator();
    let content = Bytes::from(vec![b'r'; 8192]);

    coordinator
        .put(key("blob"), content.clone())
        .complete_optimally()
        .await
        .unwrap();

    let read = coordinator.get(&key("blob")).await.unwrap();
    assert_eq!(read.content, Some(content.clone()));
    assert_eq!(read.served_by.as_ref(), coordinator.candidates(&key("blob")).first());
    let info = read.info.unwrap();
    assert_eq!(info.compression, Compression::Lzf);
    assert_eq!(info.original_length, 8192);
    assert_eq!(info.last_modified, 1000);
    assert_eq!(read.result.ignore_count(), 1);

    let info = coordinator.find_info(&key("blob")).await.unwrap();
    assert_eq!(info.result.success_count(), 2);
    assert_eq!(info.per_node.len(), 2);
    assert!(info.per_node.iter().all(|(_, i)| i.is_some()));
    let expected_hash = cluster.services[0].codec().content_hash(&content);
    assert_eq!(info.newest().unwrap().content_hash, expected_hash);

    assert_eq!(
        coordinator.get_content_length(&key("blob")).await.unwrap(),
        Some(8192)
    );

    cluster.clock.advance(10);
    coordinator
        .delete(key("blob"))
        .complete_optimally()
        .await
        .unwrap();

    let read = coordinator.get(&key("blob")).await.unwrap();
    assert!(read.content.is_none());
    assert_eq!(read.result.success_count(), 2);

    let info = coordinator.find_info(&key("blob")).await.unwrap();
    assert!(info.per_node.iter().all(|(_, i)| i.is_none()));
    assert_eq!(
        coordinator.get_content_length(&key("blob")).await.unwrap(),
        None
    );
}

#[tokio::test]
async fn test_partial_delete_with_node_down() {
    let cluster = TestCluster::new(two_node_config(), 1000);
    let coordinator = cluster.coordinator();
    coordinator
        .put(key("doc"), Bytes::from_static(b"v1"))
        .complete_optimally()
        .await
        .unwrap();

    let primary = coordinator.candidates(&key("doc"))[0].clone();
    cluster.transport.set_offline(&primary, true);
    cluster.clock.advance(5);

    let mut op = coordinator.delete(key("doc"));
    op.complete_optimally().await.unwrap();
    let result = op.finish().unwrap();
    assert_eq!(result.success_count(), 1);
    assert_eq!(result.fail_count(), 1);
    let record = result.record(&primary).unwrap();
    assert_eq!(record.outcome, NodeOutcome::Failed);
    assert!(record.last_error.is_some());

    // the primary is down, the secondary has the tombstone
    let read = coordinator.get(&key("doc")).await.unwrap();
    assert!(read.content.is_none());
    assert_eq!(read.result.fail_count(), 1);
}

#[tokio::test]
async fn test_all_nodes_down() {
    let cluster = TestCluster::new(two_node_config(), 1000);
    let coordinator = cluster.coordinator();
    cluster.set_offline("node-1", true);
    cluster.set_offline("node-2", true);

    let mut op = coordinator.put(key("doc"), Bytes::from_static(b"v1"));
    let err = op.complete_minimally().await.err().unwrap();
    assert!(matches!(
        err,
        RingStoreError::ThresholdUnreachable {
            tier: QuorumTier::Minimal,
            needed: 1,
            achieved: 0
        }
    ));
    assert_eq!(op.finish().unwrap().fail_count(), 2);

    assert!(coordinator.get(&key("doc")).await.is_err());
    assert!(coordinator.find_info(&key("doc")).await.is_err());
    assert!(coordinator.get_content_length(&key("doc")).await.is_err());
}

#[tokio::test]
async fn test_retry_reaches_node_back_online() {
    let mut config = two_node_config();
    config.coordinator.allow_retries = true;
    config.coordinator.max_retry_rounds = 1;
    config.coordinator.retry_delay_ms = 500;
    let cluster = TestCluster::new(config, 1000);
    let coordinator = cluster.coordinator();
    cluster.set_offline("node-2", true);

    let clock = cluster.clock.clone();
    let transport = cluster.transport.clone();
    let mut op = coordinator.put(key("doc"), Bytes::from_static(b"v1"));
    let driver = async {
        op.complete_optimally().await.map(|op| op.result().success_count())
    };
    let helper = async {
        // the operation sleeps before its retry round
        clock.wait_for_sleepers(1).await;
        transport.set_offline(&"node-2".into(), false);
        clock.advance(500);
    };
    let (succeeded, ()) = tokio::join!(driver, helper);
    assert_eq!(succeeded.unwrap(), 2);

    let result = op.finish().unwrap();
    assert_eq!(result.record(&"node-2".into()).unwrap().attempts, 2);
    assert_eq!(result.fail_count(), 0);
}

#[tokio::test]
async fn test_corrupt_replica_skipped_on_read() {
    let cluster = TestCluster::new(two_node_config(), 1000);
    let coordinator = cluster.coordinator();
    coordinator
        .put(key("doc"), Bytes::from_static(b"good content"))
        .complete_optimally()
        .await
        .unwrap();

    // damage the primary's copy behind the service's back
    let candidates = coordinator.candidates(&key("doc"));
    let primary = cluster.service(candidates[0].as_str());
    let metadata: EntryMetadata = primary
        .local_header(&key("doc"))
        .unwrap()
        .unwrap()
        .metadata;
    primary
        .store()
        .put(StoredEntry::new(
            key("doc"),
            metadata,
            Bytes::from_static(b"evil content"),
            1000,
        ))
        .unwrap();

    let read = coordinator.get(&key("doc")).await.unwrap();
    assert_eq!(read.content, Some(Bytes::from_static(b"good content")));
    assert_eq!(read.served_by.as_ref(), Some(&candidates[1]));
    assert_eq!(read.result.fail_count(), 1);
}
