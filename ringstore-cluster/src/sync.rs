//! Background replica synchronization
//!
//! One [`SyncAgent`] per (local node, peer) pair pulls the peer's change
//! stream for the key ranges both nodes own and applies whatever wins
//! conflict resolution. Progress is the peer stamp `synced_up_to`: every
//! peer change at or below it has been reconciled here.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use ringstore_core::clock::Clock;
use ringstore_core::entry::StoredEntry;
use ringstore_core::error::{Result, RingStoreError};
use ringstore_core::key::EntryKey;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, trace, warn};

use crate::config::SyncConfig;
use crate::conflict::Resolution;
use crate::metrics;
use crate::service::NodeService;
use crate::topology::{ClusterNode, KeyRange, NodeId};
use crate::transport::{
    call_with_timeout, PeerTransport, SyncListItem, SyncListRequest, SyncPullRequest,
};

/// Sync progress against one peer
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PeerSyncState {
    /// Peer stamp up to which this node is reconciled
    pub synced_up_to: u64,
    /// Consecutive failed cycles
    pub fail_count: u32,
    /// Local time the last cycle ended
    pub last_sync_at: Option<u64>,
    /// Entries copied from the peer since start
    pub entries_pulled: u64,
}

/// What one cycle did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncCycleReport {
    pub listed: usize,
    pub pulled: usize,
    /// Pulled entries that changed the local store
    pub applied: usize,
    pub failed: bool,
    pub more: bool,
    pub synced_up_to: u64,
}

/// Pulls changes from one peer
pub struct SyncAgent {
    service: Arc<NodeService>,
    local_range: KeyRange,
    peer: ClusterNode,
    transport: Arc<dyn PeerTransport>,
    clock: Arc<dyn Clock>,
    config: SyncConfig,
    state: Arc<Mutex<PeerSyncState>>,
}

impl SyncAgent {
    pub fn new(
        service: Arc<NodeService>,
        local_range: KeyRange,
        peer: ClusterNode,
        transport: Arc<dyn PeerTransport>,
        config: SyncConfig,
    ) -> Self {
        let clock = service.clock().clone();
        Self {
            service,
            local_range,
            peer,
            transport,
            clock,
            config,
            state: Arc::new(Mutex::new(PeerSyncState::default())),
        }
    }

    pub fn peer(&self) -> &NodeId {
        &self.peer.id
    }

    pub fn state(&self) -> PeerSyncState {
        self.state.lock().clone()
    }

    /// List, pull and apply once
    ///
    /// Fails only when the listing itself cannot be fetched. Failures while
    /// pulling or applying are reported through `failed` and hold
    /// `synced_up_to` below the first entry that could not be applied.
    #[instrument(skip(self), fields(node = %self.service.node_id(), peer = %self.peer.id))]
    pub async fn run_cycle(&self) -> Result<SyncCycleReport> {
        let ranges = self.local_range.overlap(&self.peer.range);
        let since = self.state.lock().synced_up_to;
        if ranges.is_empty() {
            return Ok(SyncCycleReport {
                synced_up_to: since,
                ..Default::default()
            });
        }

        let request = SyncListRequest {
            ranges,
            since,
            max_entries: self.config.max_list_entries,
        };
        let listing = match call_with_timeout(
            self.clock.as_ref(),
            self.config.call_timeout(),
            self.transport.sync_list(&self.peer.id, request),
        )
        .await
        {
            Ok(listing) => listing,
            Err(e) => {
                self.end_cycle(since, true, 0);
                return Err(RingStoreError::NodeCommunication {
                    node: self.peer.id.to_string(),
                    reason: e.to_string(),
                });
            }
        };

        let mut first_failure: Option<u64> = None;
        let mut wanted: Vec<SyncListItem> = Vec::new();
        let listed = listing.items.len();
        for item in listing.items {
            match self.service.local_header(&item.key) {
                Ok(None) => wanted.push(item),
                Ok(Some(local)) => {
                    let resolution = self
                        .service
                        .resolver()
                        .resolve(&local.metadata, &item.metadata);
                    if resolution == Resolution::TakeIncoming {
                        wanted.push(item);
                    }
                }
                Err(e) => {
                    warn!(key = %item.key, error = %e, "Failed to read local version");
                    note_failure(&mut first_failure, item.local_modified);
                }
            }
        }

        let mut pulled = 0;
        let mut applied = 0;
        for batch in wanted.chunks(self.config.max_pull_batch.max(1)) {
            let request = SyncPullRequest {
                keys: batch.iter().map(|item| item.key.clone()).collect(),
            };
            let response = match call_with_timeout(
                self.clock.as_ref(),
                self.config.call_timeout(),
                self.transport.sync_pull(&self.peer.id, request),
            )
            .await
            {
                Ok(response) => response,
                Err(e) => {
                    warn!(batch = batch.len(), error = %e, "Sync pull failed");
                    note_failure(&mut first_failure, batch[0].local_modified);
                    break;
                }
            };

            let mut entries: HashMap<EntryKey, StoredEntry> = response
                .entries
                .into_iter()
                .map(|entry| (entry.key.clone(), entry))
                .collect();
            for item in batch {
                let Some(entry) = entries.remove(&item.key) else {
                    // purged on the peer since it was listed
                    trace!(key = %item.key, "Listed entry no longer on peer");
                    continue;
                };
                pulled += 1;
                match self.service.apply_remote(entry) {
                    Ok(outcome) => {
                        if outcome.is_write() {
                            applied += 1;
                        }
                    }
                    Err(e) => {
                        warn!(key = %item.key, error = %e, "Failed to apply pulled entry");
                        note_failure(&mut first_failure, item.local_modified);
                    }
                }
            }
        }

        let failed = first_failure.is_some();
        let synced_up_to = match first_failure {
            Some(stamp) => since.max(stamp.saturating_sub(1)),
            None => listing.cursor,
        };
        self.end_cycle(synced_up_to, failed, pulled);

        if applied > 0 || failed {
            debug!(listed, pulled, applied, failed, synced_up_to, "Sync cycle done");
        }
        Ok(SyncCycleReport {
            listed,
            pulled,
            applied,
            failed,
            more: listing.more,
            synced_up_to,
        })
    }

    fn end_cycle(&self, synced_up_to: u64, failed: bool, pulled: usize) {
        let mut state = self.state.lock();
        state.synced_up_to = synced_up_to;
        state.fail_count = if failed { state.fail_count + 1 } else { 0 };
        state.last_sync_at = Some(self.clock.now_millis());
        state.entries_pulled += pulled as u64;
        metrics::record_sync_cycle(self.peer.id.as_str(), failed, pulled, synced_up_to);
    }

    /// Cycle until `shutdown` flips, sleeping `check_period` between cycles
    /// unless woken or the peer reported more entries
    pub async fn run(self, wake: Arc<Notify>, mut shutdown: watch::Receiver<bool>) {
        info!(node = %self.service.node_id(), peer = %self.peer.id, "Sync agent started");
        loop {
            if *shutdown.borrow() {
                break;
            }

            let more = match self.run_cycle().await {
                Ok(report) => report.more && !report.failed,
                Err(e) => {
                    warn!(peer = %self.peer.id, error = %e, "Sync cycle failed");
                    false
                }
            };
            if more {
                tokio::task::yield_now().await;
                continue;
            }

            tokio::select! {
                _ = self.clock.sleep(self.config.check_period()) => {}
                _ = wake.notified() => {
                    trace!(peer = %self.peer.id, "Sync agent woken");
                }
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        info!(node = %self.service.node_id(), peer = %self.peer.id, "Sync agent stopped");
    }

    /// Run on the tokio runtime
    pub fn spawn(self, shutdown: watch::Receiver<bool>) -> SyncHandle {
        let peer = self.peer.id.clone();
        let state = self.state.clone();
        let wake = Arc::new(Notify::new());
        let task = tokio::spawn(self.run(wake.clone(), shutdown));
        SyncHandle {
            peer,
            state,
            wake,
            task,
        }
    }
}

fn note_failure(first_failure: &mut Option<u64>, stamp: u64) {
    *first_failure = Some(first_failure.map_or(stamp, |s| s.min(stamp)));
}

/// Handle to a running sync agent
pub struct SyncHandle {
    peer: NodeId,
    state: Arc<Mutex<PeerSyncState>>,
    wake: Arc<Notify>,
    task: JoinHandle<()>,
}

impl SyncHandle {
    pub fn peer(&self) -> &NodeId {
        &self.peer
    }

    pub fn state(&self) -> PeerSyncState {
        self.state.lock().clone()
    }

    /// Start the next cycle without waiting for the check period
    pub fn wake(&self) {
        self.wake.notify_one();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    pub(crate) fn into_task(self) -> JoinHandle<()> {
        self.task
    }
}
