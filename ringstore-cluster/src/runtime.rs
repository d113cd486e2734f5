//! Node life-cycle
//!
//! A [`NodeRuntime`] owns the background work of one node: a sync agent for
//! every peer whose range overlaps the local one, plus the entry cleaner.
//! Stopping signals every task and waits at most the shutdown grace period.

use std::sync::Arc;

use futures::future::join_all;
use ringstore_core::clock::Clock;
use ringstore_core::error::{Result, RingStoreError};
use ringstore_core::key::{BasicKeyCodec, KeyCodec};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::cleanup::EntryCleaner;
use crate::config::ClusterConfig;
use crate::metrics;
use crate::service::NodeService;
use crate::sync::{PeerSyncState, SyncAgent, SyncHandle};
use crate::topology::{NodeId, RingTopology};
use crate::transport::PeerTransport;

/// Running background tasks of one node
pub struct NodeRuntime {
    service: Arc<NodeService>,
    agents: Vec<SyncHandle>,
    cleaner: Option<JoinHandle<()>>,
    shutdown_tx: watch::Sender<bool>,
    config: ClusterConfig,
}

impl NodeRuntime {
    /// Open the configured store and build the service of `node_id`
    pub fn open_service(
        config: &ClusterConfig,
        node_id: NodeId,
        clock: Arc<dyn Clock>,
    ) -> Result<Arc<NodeService>> {
        let store = config.storage.open()?;
        let codec: Arc<dyn KeyCodec> = Arc::new(BasicKeyCodec::new());
        Ok(Arc::new(NodeService::new(
            node_id,
            store,
            codec,
            clock,
            config.service.clone(),
        )))
    }

    /// Spawn sync agents and the cleaner for `service`
    pub fn start(
        service: Arc<NodeService>,
        topology: &RingTopology,
        transport: Arc<dyn PeerTransport>,
        config: ClusterConfig,
    ) -> Result<Self> {
        let local = topology.node(service.node_id()).ok_or_else(|| {
            RingStoreError::Configuration(format!(
                "node {} is not part of the topology",
                service.node_id()
            ))
        })?;
        metrics::describe_metrics();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let mut agents = Vec::new();
        if config.sync.enabled {
            for peer in topology.peers_of(&local.id) {
                let agent = SyncAgent::new(
                    service.clone(),
                    local.range,
                    peer.clone(),
                    transport.clone(),
                    config.sync.clone(),
                );
                agents.push(agent.spawn(shutdown_rx.clone()));
            }
        }

        let cleaner = config.cleanup.enabled.then(|| {
            EntryCleaner::new(service.clone(), config.cleanup.clone()).spawn(shutdown_rx.clone())
        });

        info!(
            node = %local.id,
            range = %local.range,
            peers = agents.len(),
            cleanup = cleaner.is_some(),
            "Node runtime started"
        );

        Ok(Self {
            service,
            agents,
            cleaner,
            shutdown_tx,
            config,
        })
    }

    pub fn service(&self) -> &Arc<NodeService> {
        &self.service
    }

    pub fn node_id(&self) -> &NodeId {
        self.service.node_id()
    }

    /// Run a sync cycle against every peer now
    pub fn wake_sync(&self) {
        for agent in &self.agents {
            agent.wake();
        }
    }

    /// Sync progress per peer
    pub fn peer_states(&self) -> Vec<(NodeId, PeerSyncState)> {
        self.agents
            .iter()
            .map(|agent| (agent.peer().clone(), agent.state()))
            .collect()
    }

    pub fn peer_state(&self, peer: &NodeId) -> Option<PeerSyncState> {
        self.agents
            .iter()
            .find(|agent| agent.peer() == peer)
            .map(|agent| agent.state())
    }

    /// Signal every background task to stop after its current step
    pub fn prepare_for_stop(&self) {
        info!(node = %self.node_id(), "Preparing to stop");
        // receivers only go away once their tasks ended
        let _ = self.shutdown_tx.send(true);
    }

    /// Stop background tasks, aborting those still busy after the grace
    /// period, then flush the store
    pub async fn stop(self) -> Result<()> {
        self.prepare_for_stop();

        let node = self.service.node_id().clone();
        let clock = self.service.clock().clone();
        let grace = self.config.shutdown_grace_period();

        let tasks: Vec<JoinHandle<()>> = self
            .agents
            .into_iter()
            .map(SyncHandle::into_task)
            .chain(self.cleaner)
            .collect();
        let aborts: Vec<_> = tasks.iter().map(|task| task.abort_handle()).collect();

        tokio::select! {
            results = join_all(tasks) => {
                for result in results {
                    if let Err(e) = result {
                        error!(node = %node, error = %e, "Background task failed");
                    }
                }
            }
            _ = clock.sleep(grace) => {
                warn!(node = %node, grace = ?grace, "Background tasks still running after grace period, aborting");
                for abort in aborts {
                    abort.abort();
                }
            }
        }

        self.service.store().flush()?;
        info!(node = %node, "Node runtime stopped");
        Ok(())
    }
}
