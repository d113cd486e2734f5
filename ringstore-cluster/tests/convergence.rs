//! Background sync and node life-cycle against an in-process cluster
//!
//! Every test drives time through the shared virtual clock: each running
//! sync agent parks in one `sleep` between cycles, so waiting for the
//! expected number of sleepers means every agent finished its cycle.

mod common;

use std::sync::Arc;

use bytes::Bytes;
use common::{content_on, key, put_direct, stop_all, two_node_config, TestCluster};
use ringstore_cluster::{
    CleanupConfig, ClusterConfig, EntryCleaner, NodeId, NodeRuntime, PutOutcome,
};
use ringstore_core::{Compression, RingStoreError, VirtualClock};
use ringstore_storage::StoreConfig;

fn node(id: &str) -> NodeId {
    NodeId::from(id)
}

/// Yield to the spawned agents until `done` holds
async fn settle(mut done: impl FnMut() -> bool) {
    for _ in 0..1000 {
        if done() {
            return;
        }
        tokio::task::yield_now().await;
    }
    panic!("cluster did not settle");
}

#[tokio::test]
async fn test_concurrent_writes_converge_on_newest() {
    let cluster = TestCluster::new(two_node_config(), 1000);
    let runtimes = cluster.start_runtimes();
    cluster.clock.wait_for_sleepers(2).await;

    let node1 = cluster.service("node-1");
    let node2 = cluster.service("node-2");
    assert_eq!(
        put_direct(node1, "shared", b"X"),
        PutOutcome::Stored {
            last_modified: 1000
        }
    );
    cluster.clock.advance(90);
    assert_eq!(
        put_direct(node2, "shared", b"Y"),
        PutOutcome::Stored {
            last_modified: 1090
        }
    );

    cluster.clock.advance(12_000);
    cluster.clock.wait_for_sleepers(2).await;

    assert_eq!(content_on(node1, "shared"), Some(Bytes::from_static(b"Y")));
    assert_eq!(content_on(node2, "shared"), Some(Bytes::from_static(b"Y")));
    for runtime in &runtimes {
        for (_, state) in runtime.peer_states() {
            assert_eq!(state.fail_count, 0);
        }
    }

    stop_all(runtimes).await;
}

#[tokio::test]
async fn test_converged_replicas_stay_stable() {
    let cluster = TestCluster::new(two_node_config(), 1000);
    let runtimes = cluster.start_runtimes();
    cluster.clock.wait_for_sleepers(2).await;

    let node1 = cluster.service("node-1");
    let node2 = cluster.service("node-2");
    put_direct(node1, "shared", b"X");
    cluster.clock.advance(90);
    put_direct(node2, "shared", b"Y");
    cluster.clock.advance(12_000);
    cluster.clock.wait_for_sleepers(2).await;

    let pulled = |runtimes: &[NodeRuntime]| -> u64 {
        runtimes
            .iter()
            .flat_map(|r| r.peer_states())
            .map(|(_, state)| state.entries_pulled)
            .sum()
    };
    let pulled_at_convergence = pulled(&runtimes);

    for _ in 0..6 {
        cluster.clock.advance(5_000);
        cluster.clock.wait_for_sleepers(2).await;
        for service in [node1, node2] {
            assert_eq!(content_on(service, "shared"), Some(Bytes::from_static(b"Y")));
            let header = service.local_header(&key("shared")).unwrap().unwrap();
            assert_eq!(header.metadata.last_modified, 1090);
        }
    }
    // later cycles find both sides equal and copy nothing
    assert_eq!(pulled(&runtimes), pulled_at_convergence);

    stop_all(runtimes).await;
}

#[tokio::test]
async fn test_sync_copies_metadata_unchanged() {
    let cluster = TestCluster::new(two_node_config(), 1000);
    let node1 = cluster.service("node-1");
    let node2 = cluster.service("node-2");
    put_direct(node1, "blob", &[b'z'; 4096]);

    let runtimes = cluster.start_runtimes();
    cluster.clock.wait_for_sleepers(2).await;
    assert!(node2.local_header(&key("blob")).unwrap().is_none());

    cluster.clock.advance(5_000);
    cluster.clock.wait_for_sleepers(2).await;

    let original = node1.local_header(&key("blob")).unwrap().unwrap();
    let copy = node2.local_header(&key("blob")).unwrap().unwrap();
    assert_eq!(copy.metadata, original.metadata);
    assert_eq!(copy.metadata.compression, Compression::Lzf);
    assert_eq!(copy.metadata.last_modified, 1000);
    // the copy carries the receiving node's own change stamp
    assert_eq!(copy.local_modified, 6000);
    assert_eq!(content_on(node2, "blob"), Some(Bytes::from(vec![b'z'; 4096])));

    let state = runtimes[1].peer_state(&node("node-1")).unwrap();
    assert_eq!(state.synced_up_to, 5000);
    assert_eq!(state.entries_pulled, 1);
    assert_eq!(state.last_sync_at, Some(6000));

    stop_all(runtimes).await;
}

#[tokio::test]
async fn test_unreachable_peer_counts_failures_then_recovers() {
    let cluster = TestCluster::new(two_node_config(), 1000);
    let node2 = cluster.service("node-2");
    put_direct(cluster.service("node-1"), "doc", b"hello");
    cluster.set_offline("node-1", true);

    let runtimes = cluster.start_runtimes();
    cluster.clock.wait_for_sleepers(2).await;
    let state = runtimes[1].peer_state(&node("node-1")).unwrap();
    assert_eq!(state.fail_count, 1);
    assert_eq!(state.synced_up_to, 0);

    cluster.clock.advance(5_000);
    cluster.clock.wait_for_sleepers(2).await;
    let state = runtimes[1].peer_state(&node("node-1")).unwrap();
    assert_eq!(state.fail_count, 2);
    assert_eq!(state.synced_up_to, 0);
    assert!(content_on(node2, "doc").is_none());

    // node-1 itself keeps syncing from node-2 meanwhile
    assert_eq!(
        runtimes[0].peer_state(&node("node-2")).unwrap().fail_count,
        0
    );

    cluster.set_offline("node-1", false);
    cluster.clock.advance(5_000);
    cluster.clock.wait_for_sleepers(2).await;
    let state = runtimes[1].peer_state(&node("node-1")).unwrap();
    assert_eq!(state.fail_count, 0);
    assert_eq!(state.synced_up_to, 10_000);
    assert_eq!(content_on(node2, "doc"), Some(Bytes::from_static(b"hello")));

    stop_all(runtimes).await;
}

#[tokio::test]
async fn test_tombstone_propagates_and_is_cleaned() {
    let cluster = TestCluster::new(two_node_config(), 1000);
    let node1 = cluster.service("node-1");
    let node2 = cluster.service("node-2");
    put_direct(node1, "doc", b"short lived");

    let runtimes = cluster.start_runtimes();
    cluster.clock.wait_for_sleepers(2).await;
    cluster.clock.advance(5_000);
    cluster.clock.wait_for_sleepers(2).await;
    assert!(content_on(node2, "doc").is_some());

    node1.handle_delete(&key("doc")).unwrap();
    cluster.clock.advance(5_000);
    cluster.clock.wait_for_sleepers(2).await;

    assert!(content_on(node2, "doc").is_none());
    for service in [node1, node2] {
        let header = service.local_header(&key("doc")).unwrap().unwrap();
        assert!(header.metadata.deleted);
        assert_eq!(header.metadata.last_modified, 6000);
    }

    stop_all(runtimes).await;

    let cleanup = CleanupConfig {
        tombstone_ttl_ms: 1_000,
        ..Default::default()
    };
    for service in [node1, node2] {
        let report = EntryCleaner::new(service.clone(), cleanup.clone())
            .run_once()
            .unwrap();
        assert_eq!(report.tombstones_removed, 1);
        assert!(service.local_header(&key("doc")).unwrap().is_none());
    }
}

#[tokio::test]
async fn test_wake_runs_cycle_before_check_period() {
    let cluster = TestCluster::new(two_node_config(), 1000);
    let runtimes = cluster.start_runtimes();
    cluster.clock.wait_for_sleepers(2).await;

    put_direct(cluster.service("node-1"), "doc", b"now");
    cluster.clock.advance(2_000);
    assert!(content_on(cluster.service("node-2"), "doc").is_none());

    runtimes[1].wake_sync();
    let node2 = cluster.service("node-2").clone();
    settle(|| content_on(&node2, "doc").is_some()).await;

    let state = runtimes[1].peer_state(&node("node-1")).unwrap();
    assert_eq!(state.synced_up_to, 2000);

    stop_all(runtimes).await;
}

#[tokio::test]
async fn test_stop_ends_background_tasks() {
    let mut config = two_node_config();
    config.cleanup.enabled = true;
    let cluster = TestCluster::new(config, 1000);
    let runtimes = cluster.start_runtimes();
    // one agent and one cleaner per node
    cluster.clock.wait_for_sleepers(4).await;

    for runtime in runtimes {
        runtime.stop().await.unwrap();
    }
    assert_eq!(cluster.clock.pending_sleepers(), 0);
}

#[tokio::test]
async fn test_disabled_sync_spawns_no_agents() {
    let mut config = two_node_config();
    config.sync.enabled = false;
    let cluster = TestCluster::new(config, 1000);
    let runtimes = cluster.start_runtimes();
    for runtime in &runtimes {
        assert!(runtime.peer_states().is_empty());
    }
    stop_all(runtimes).await;
}

#[tokio::test]
async fn test_start_rejects_unknown_node() {
    let cluster = TestCluster::new(two_node_config(), 1000);
    let stranger =
        NodeRuntime::open_service(&cluster.config, node("node-9"), cluster.clock.clone()).unwrap();

    let err = NodeRuntime::start(
        stranger,
        &cluster.topology,
        cluster.transport.clone(),
        cluster.config.clone(),
    )
    .err()
    .unwrap();
    assert!(matches!(err, RingStoreError::Configuration(_)));
}

#[tokio::test]
async fn test_sled_node_keeps_entries_across_restart() {
    let dir = tempfile::tempdir().unwrap();
    let config = ClusterConfig {
        storage: StoreConfig::new(dir.path().join("node-1")),
        ..two_node_config()
    };
    let clock = VirtualClock::new(1000);

    {
        let service = NodeRuntime::open_service(&config, node("node-1"), clock.clone()).unwrap();
        put_direct(&service, "doc", b"durable");
        service.store().flush().unwrap();
    }

    clock.advance(10);
    let service: Arc<_> = NodeRuntime::open_service(&config, node("node-1"), clock.clone()).unwrap();
    assert_eq!(content_on(&service, "doc"), Some(Bytes::from_static(b"durable")));
    let header = service.local_header(&key("doc")).unwrap().unwrap();
    assert_eq!(header.metadata.last_modified, 1000);
}
