//! Garbage collection of tombstones and expired entries

use std::sync::Arc;

use ringstore_core::error::Result;
use ringstore_storage::{EntryHeader, ScanCursor};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::CleanupConfig;
use crate::metrics;
use crate::service::NodeService;

/// What one cleanup pass removed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub scanned: usize,
    pub tombstones_removed: usize,
    pub expired_removed: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PurgeReason {
    Tombstone,
    Expired,
}

/// Periodically removes old tombstones and expired entries
pub struct EntryCleaner {
    service: Arc<NodeService>,
    config: CleanupConfig,
}

impl EntryCleaner {
    pub fn new(service: Arc<NodeService>, config: CleanupConfig) -> Self {
        Self { service, config }
    }

    fn purge_reason(&self, header: &EntryHeader, now: u64) -> Option<PurgeReason> {
        let metadata = &header.metadata;
        if metadata.deleted {
            let age = now.saturating_sub(metadata.last_modified);
            (age >= self.config.tombstone_ttl_ms).then_some(PurgeReason::Tombstone)
        } else if metadata.is_expired(now) {
            Some(PurgeReason::Expired)
        } else {
            None
        }
    }

    /// Scan the whole store once
    pub fn run_once(&self) -> Result<CleanupReport> {
        let now = self.service.clock().now_millis();
        let batch = self.config.scan_batch.max(1);
        let mut report = CleanupReport::default();
        let mut cursor = ScanCursor::start();

        loop {
            let page = self.service.store().scan_modified(&cursor, batch)?;
            report.scanned += page.len();

            for header in &page {
                let Some(reason) = self.purge_reason(header, now) else {
                    continue;
                };
                // a newer version may have arrived since the scan
                if !self.service.purge_if_unchanged(header)? {
                    continue;
                }
                match reason {
                    PurgeReason::Tombstone => report.tombstones_removed += 1,
                    PurgeReason::Expired => report.expired_removed += 1,
                }
            }

            match page.last() {
                Some(last) if page.len() == batch => cursor = ScanCursor::after(last),
                _ => break,
            }
        }

        metrics::record_cleanup("tombstone", report.tombstones_removed);
        metrics::record_cleanup("expired", report.expired_removed);
        if report.tombstones_removed + report.expired_removed > 0 {
            info!(
                node = %self.service.node_id(),
                tombstones = report.tombstones_removed,
                expired = report.expired_removed,
                "Cleanup removed entries"
            );
        }
        Ok(report)
    }

    /// Run a pass every `period` until `shutdown` flips
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let clock = self.service.clock().clone();
        debug!(node = %self.service.node_id(), "Entry cleaner started");
        loop {
            tokio::select! {
                _ = clock.sleep(self.config.period()) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            }

            if let Err(e) = self.run_once() {
                warn!(node = %self.service.node_id(), error = %e, "Cleanup pass failed");
            }
        }
        debug!(node = %self.service.node_id(), "Entry cleaner stopped");
    }

    pub fn spawn(self, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }
}
