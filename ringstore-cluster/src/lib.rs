//! RingStore Cluster
//!
//! Replication for the RingStore content store:
//! - `RingTopology` maps keys onto the nodes owning their ring position
//! - `ReplicationCoordinator` drives tiered PUT/DELETE and GET/INFO calls
//! - `NodeService` handles requests on a node and feeds its change stream
//! - `SyncAgent` pulls peer changes so replicas converge
//! - `EntryCleaner` and `NodeRuntime` run the background work of a node

pub mod cleanup;
pub mod config;
pub mod conflict;
pub mod coordinator;
pub mod metrics;
pub mod runtime;
pub mod service;
pub mod sync;
pub mod topology;
pub mod transport;

pub use cleanup::{CleanupReport, EntryCleaner};
pub use config::{
    CleanupConfig, ClusterConfig, ConfigError, CoordinatorConfig, NodeSettings, ServiceConfig,
    SyncConfig,
};
pub use conflict::{ConflictResolver, Resolution};
pub use coordinator::{
    InfoResult, NodeCallRecord, NodeOutcome, OperationKind, OperationResult, OperationState,
    ReadResult, ReplicationCoordinator, WriteOperation,
};
pub use runtime::NodeRuntime;
pub use service::{ApplyOutcome, NodeService};
pub use sync::{PeerSyncState, SyncAgent, SyncCycleReport, SyncHandle};
pub use topology::{ClusterNode, KeyRange, NodeId, RingTopology};
pub use transport::{
    call_with_timeout, CallError, CallResult, DeleteOutcome, GetResponse, HeadResponse,
    InProcessTransport, ItemInfo, PeerTransport, PutOutcome, PutRequest, ReadContent,
    SyncListItem, SyncListRequest, SyncListResponse, SyncPullRequest, SyncPullResponse,
};
