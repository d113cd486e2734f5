//! Node-to-node calls
//!
//! [`PeerTransport`] is the seam between replication logic and the network.
//! Coordinators and sync agents only talk to other nodes through it.
//! [`InProcessTransport`] routes calls straight to [`NodeService`] instances
//! living in the same process.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use ringstore_core::clock::Clock;
use ringstore_core::entry::{Compression, EntryMetadata, StoredEntry};
use ringstore_core::error::RingStoreError;
use ringstore_core::key::EntryKey;
use thiserror::Error;
use tracing::debug;

use crate::service::NodeService;
use crate::topology::{KeyRange, NodeId};

/// Why a single node call failed
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CallError {
    #[error("Node unreachable: {0}")]
    Unreachable(String),

    #[error("Call timed out after {0:?}")]
    Timeout(Duration),

    #[error("Request rejected: {0}")]
    Rejected(String),
}

impl From<RingStoreError> for CallError {
    fn from(e: RingStoreError) -> Self {
        CallError::Rejected(e.to_string())
    }
}

pub type CallResult<T> = std::result::Result<T, CallError>;

// ===== Client requests =====

/// Content write as sent by a client
#[derive(Debug, Clone)]
pub struct PutRequest {
    pub key: EntryKey,
    /// Uncompressed content
    pub content: Bytes,
    /// Client-computed hash of `content`
    pub content_hash: u32,
    pub max_ttl_secs: Option<u32>,
}

/// What a node did with a write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    /// New version stored
    Stored { last_modified: u64 },
    /// Identical content already present
    Unchanged { last_modified: u64 },
    /// A newer local version won
    Superseded { last_modified: u64 },
}

impl PutOutcome {
    pub fn last_modified(&self) -> u64 {
        match self {
            PutOutcome::Stored { last_modified }
            | PutOutcome::Unchanged { last_modified }
            | PutOutcome::Superseded { last_modified } => *last_modified,
        }
    }
}

/// Stored form of an entry as returned by GET
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadContent {
    pub metadata: EntryMetadata,
    /// Bytes as stored, compressed per `metadata.compression`
    pub content: Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GetResponse {
    Found(ReadContent),
    NotFound,
}

/// HEAD-style metadata of a live entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ItemInfo {
    pub original_length: u64,
    pub content_hash: u32,
    pub compression: Compression,
    pub storage_length: u64,
    pub last_modified: u64,
}

impl From<&EntryMetadata> for ItemInfo {
    fn from(metadata: &EntryMetadata) -> Self {
        Self {
            original_length: metadata.original_length,
            content_hash: metadata.content_hash,
            compression: metadata.compression,
            storage_length: metadata.storage_length,
            last_modified: metadata.last_modified,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeadResponse {
    Found(ItemInfo),
    NotFound,
}

/// What a node did with a delete
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    /// Live content replaced by a tombstone
    Deleted,
    /// Nothing live to delete; a tombstone is in place
    Absent,
    /// A newer local version won
    Superseded,
}

// ===== Sync requests =====

/// Ask a peer for its changes after `since`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncListRequest {
    /// Only keys whose ring position falls in one of these ranges
    pub ranges: Vec<KeyRange>,
    /// Exclusive lower bound on the peer's local stamp
    pub since: u64,
    pub max_entries: usize,
}

/// One changed entry, without content
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncListItem {
    pub key: EntryKey,
    pub metadata: EntryMetadata,
    /// Stamp at which the peer stored this version
    pub local_modified: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncListResponse {
    /// Ordered by `local_modified`
    pub items: Vec<SyncListItem>,
    /// Stamp up to which the listing is complete
    pub cursor: u64,
    /// More entries are waiting past `cursor`
    pub more: bool,
}

/// Fetch full entries, tombstones included
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncPullRequest {
    pub keys: Vec<EntryKey>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncPullResponse {
    /// Requested entries the peer still has; missing keys are left out
    pub entries: Vec<StoredEntry>,
}

/// Sends requests to other nodes
#[async_trait]
pub trait PeerTransport: Send + Sync + 'static {
    async fn put(&self, node: &NodeId, request: PutRequest) -> CallResult<PutOutcome>;

    async fn get(&self, node: &NodeId, key: &EntryKey) -> CallResult<GetResponse>;

    async fn head(&self, node: &NodeId, key: &EntryKey) -> CallResult<HeadResponse>;

    async fn delete(&self, node: &NodeId, key: &EntryKey) -> CallResult<DeleteOutcome>;

    async fn sync_list(
        &self,
        node: &NodeId,
        request: SyncListRequest,
    ) -> CallResult<SyncListResponse>;

    async fn sync_pull(
        &self,
        node: &NodeId,
        request: SyncPullRequest,
    ) -> CallResult<SyncPullResponse>;
}

/// Run `call`, failing with [`CallError::Timeout`] once `timeout` passes on
/// `clock`. A zero timeout waits indefinitely.
pub async fn call_with_timeout<T, F>(clock: &dyn Clock, timeout: Duration, call: F) -> CallResult<T>
where
    F: Future<Output = CallResult<T>>,
{
    if timeout.is_zero() {
        return call.await;
    }
    tokio::select! {
        biased;
        result = call => result,
        _ = clock.sleep(timeout) => Err(CallError::Timeout(timeout)),
    }
}

/// Transport for nodes running in the same process
#[derive(Default)]
pub struct InProcessTransport {
    services: RwLock<HashMap<NodeId, Arc<NodeService>>>,
    offline: RwLock<HashSet<NodeId>>,
}

impl InProcessTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make a node's service reachable
    pub fn register(&self, service: Arc<NodeService>) {
        let id = service.node_id().clone();
        debug!(node = %id, "Registered in-process node");
        self.services.write().insert(id, service);
    }

    /// Simulate a node going down or coming back
    pub fn set_offline(&self, node: &NodeId, offline: bool) {
        let mut set = self.offline.write();
        if offline {
            set.insert(node.clone());
        } else {
            set.remove(node);
        }
    }

    pub fn is_offline(&self, node: &NodeId) -> bool {
        self.offline.read().contains(node)
    }

    fn service(&self, node: &NodeId) -> CallResult<Arc<NodeService>> {
        if self.is_offline(node) {
            return Err(CallError::Unreachable(format!("{} is offline", node)));
        }
        self.services
            .read()
            .get(node)
            .cloned()
            .ok_or_else(|| CallError::Unreachable(format!("{} is not registered", node)))
    }
}

#[async_trait]
impl PeerTransport for InProcessTransport {
    async fn put(&self, node: &NodeId, request: PutRequest) -> CallResult<PutOutcome> {
        Ok(self.service(node)?.handle_put(request)?)
    }

    async fn get(&self, node: &NodeId, key: &EntryKey) -> CallResult<GetResponse> {
        Ok(self.service(node)?.handle_get(key)?)
    }

    async fn head(&self, node: &NodeId, key: &EntryKey) -> CallResult<HeadResponse> {
        Ok(self.service(node)?.handle_head(key)?)
    }

    async fn delete(&self, node: &NodeId, key: &EntryKey) -> CallResult<DeleteOutcome> {
        Ok(self.service(node)?.handle_delete(key)?)
    }

    async fn sync_list(
        &self,
        node: &NodeId,
        request: SyncListRequest,
    ) -> CallResult<SyncListResponse> {
        Ok(self.service(node)?.handle_sync_list(&request)?)
    }

    async fn sync_pull(
        &self,
        node: &NodeId,
        request: SyncPullRequest,
    ) -> CallResult<SyncPullResponse> {
        Ok(self.service(node)?.handle_sync_pull(&request)?)
    }
}
