//! Metrics for replication, sync and cleanup
//!
//! Recorded through the `metrics` facade; no-ops unless the embedding
//! process installs a recorder.

use metrics::{counter, describe_counter, describe_gauge, gauge};

/// Metric names as constants
pub mod names {
    // Coordinator metrics
    pub const NODE_CALLS_TOTAL: &str = "ringstore_node_calls_total";
    pub const OPERATIONS_TOTAL: &str = "ringstore_operations_total";
    pub const THRESHOLD_UNREACHABLE_TOTAL: &str = "ringstore_threshold_unreachable_total";

    // Sync metrics
    pub const SYNC_CYCLES_TOTAL: &str = "ringstore_sync_cycles_total";
    pub const SYNC_FAILURES_TOTAL: &str = "ringstore_sync_failures_total";
    pub const SYNC_ENTRIES_PULLED: &str = "ringstore_sync_entries_pulled_total";
    pub const SYNC_SYNCED_UP_TO: &str = "ringstore_sync_synced_up_to_millis";

    // Cleanup metrics
    pub const CLEANUP_REMOVED_TOTAL: &str = "ringstore_cleanup_removed_total";
}

/// Initialize metric descriptions
pub fn describe_metrics() {
    describe_counter!(
        names::NODE_CALLS_TOTAL,
        "Calls made by coordinators to individual nodes, by operation and outcome"
    );
    describe_counter!(
        names::OPERATIONS_TOTAL,
        "Replicated operations finished, by operation"
    );
    describe_counter!(
        names::THRESHOLD_UNREACHABLE_TOTAL,
        "Operations that could not reach their minimal tier"
    );

    describe_counter!(names::SYNC_CYCLES_TOTAL, "Sync cycles run, by peer");
    describe_counter!(
        names::SYNC_FAILURES_TOTAL,
        "Sync cycles that ended with a failure, by peer"
    );
    describe_counter!(
        names::SYNC_ENTRIES_PULLED,
        "Entries copied from peers, by peer"
    );
    describe_gauge!(
        names::SYNC_SYNCED_UP_TO,
        "Peer stamp up to which this node is reconciled"
    );

    describe_counter!(
        names::CLEANUP_REMOVED_TOTAL,
        "Tombstones and expired entries removed, by reason"
    );
}

pub(crate) fn record_node_call(operation: &'static str, success: bool) {
    let outcome = if success { "success" } else { "failure" };
    counter!(names::NODE_CALLS_TOTAL, "operation" => operation, "outcome" => outcome).increment(1);
}

pub(crate) fn record_operation(operation: &'static str) {
    counter!(names::OPERATIONS_TOTAL, "operation" => operation).increment(1);
}

pub(crate) fn record_threshold_unreachable(operation: &'static str) {
    counter!(names::THRESHOLD_UNREACHABLE_TOTAL, "operation" => operation).increment(1);
}

pub(crate) fn record_sync_cycle(peer: &str, failed: bool, pulled: usize, synced_up_to: u64) {
    let peer = peer.to_string();
    counter!(names::SYNC_CYCLES_TOTAL, "peer" => peer.clone()).increment(1);
    if failed {
        counter!(names::SYNC_FAILURES_TOTAL, "peer" => peer.clone()).increment(1);
    }
    counter!(names::SYNC_ENTRIES_PULLED, "peer" => peer.clone()).increment(pulled as u64);
    gauge!(names::SYNC_SYNCED_UP_TO, "peer" => peer).set(synced_up_to as f64);
}

pub(crate) fn record_cleanup(reason: &'static str, removed: usize) {
    if removed > 0 {
        counter!(names::CLEANUP_REMOVED_TOTAL, "reason" => reason).increment(removed as u64);
    }
}
