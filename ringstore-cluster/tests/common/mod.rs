//! In-process cluster harness shared by the integration tests
#![allow(dead_code)]

use std::sync::Arc;

use bytes::Bytes;
use ringstore_cluster::{
    ClusterConfig, CoordinatorConfig, GetResponse, InProcessTransport, NodeId, NodeRuntime,
    NodeService, PutOutcome, PutRequest, ReplicationCoordinator, RingTopology,
};
use ringstore_core::{BasicKeyCodec, EntryKey, KeyCodec, VirtualClock};
use ringstore_storage::StoreConfig;
use tracing_subscriber::EnvFilter;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Two nodes that both cover the whole ring, starting half a ring apart
pub fn two_node_config() -> ClusterConfig {
    let mut config = ClusterConfig {
        ring_size: 360,
        coordinator: CoordinatorConfig::default()
            .with_thresholds(1, 2, 2)
            .with_retries(false),
        storage: StoreConfig::memory(),
        ..Default::default()
    }
    .with_node("node-1", "127.0.0.1:7001", 0, 360)
    .with_node("node-2", "127.0.0.1:7002", 180, 360);
    config.service.sync_grace_period_ms = 1_000;
    config.sync.check_period_ms = 5_000;
    config.sync.call_timeout_ms = 0;
    config.cleanup.enabled = false;
    config
}

pub struct TestCluster {
    pub config: ClusterConfig,
    pub clock: Arc<VirtualClock>,
    pub transport: Arc<InProcessTransport>,
    pub topology: Arc<RingTopology>,
    pub services: Vec<Arc<NodeService>>,
}

impl TestCluster {
    pub fn new(config: ClusterConfig, start_millis: u64) -> Self {
        init_tracing();
        config.validate().unwrap();
        let topology = Arc::new(config.topology().unwrap());
        let clock = VirtualClock::new(start_millis);
        let transport = Arc::new(InProcessTransport::new());

        let services: Vec<Arc<NodeService>> = config
            .nodes
            .iter()
            .map(|node| NodeRuntime::open_service(&config, node.id.clone(), clock.clone()).unwrap())
            .collect();
        for service in &services {
            transport.register(service.clone());
        }

        Self {
            config,
            clock,
            transport,
            topology,
            services,
        }
    }

    pub fn service(&self, id: &str) -> &Arc<NodeService> {
        self.services
            .iter()
            .find(|s| s.node_id().as_str() == id)
            .unwrap()
    }

    pub fn coordinator(&self) -> ReplicationCoordinator {
        self.coordinator_with(self.config.coordinator.clone())
    }

    pub fn coordinator_with(&self, config: CoordinatorConfig) -> ReplicationCoordinator {
        ReplicationCoordinator::new(
            self.topology.clone(),
            self.transport.clone(),
            Arc::new(BasicKeyCodec::new()),
            self.clock.clone(),
            config,
        )
    }

    pub fn start_runtimes(&self) -> Vec<NodeRuntime> {
        self.services
            .iter()
            .map(|service| {
                NodeRuntime::start(
                    service.clone(),
                    &self.topology,
                    self.transport.clone(),
                    self.config.clone(),
                )
                .unwrap()
            })
            .collect()
    }

    pub fn set_offline(&self, id: &str, offline: bool) {
        self.transport.set_offline(&NodeId::from(id), offline);
    }
}

pub fn key(path: &str) -> EntryKey {
    BasicKeyCodec::new().key("", path).unwrap()
}

/// Write straight into one node, bypassing the coordinator
pub fn put_direct(service: &NodeService, path: &str, content: &[u8]) -> PutOutcome {
    service
        .handle_put(PutRequest {
            key: key(path),
            content: Bytes::copy_from_slice(content),
            content_hash: BasicKeyCodec::new().content_hash(content),
            max_ttl_secs: None,
        })
        .unwrap()
}

/// Uncompressed live content on one node
pub fn content_on(service: &NodeService, path: &str) -> Option<Bytes> {
    match service.handle_get(&key(path)).unwrap() {
        GetResponse::Found(read) => Some(
            ringstore_core::decompress_content(
                read.metadata.compression,
                &read.content,
                read.metadata.original_length as usize,
            )
            .unwrap(),
        ),
        GetResponse::NotFound => None,
    }
}

pub async fn stop_all(runtimes: Vec<NodeRuntime>) {
    for runtime in runtimes {
        runtime.stop().await.unwrap();
    }
}
