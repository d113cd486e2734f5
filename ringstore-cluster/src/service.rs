//! Request handling on a single node
//!
//! `NodeService` owns the node's view of its local store: it stamps and
//! verifies incoming writes, serves reads, and feeds the change stream that
//! peers pull from during sync. Writes to one key are serialized through a
//! striped lock table; the store itself replaces entries atomically.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};
use ringstore_core::clock::Clock;
use ringstore_core::entry::{compress_content, Compression, EntryMetadata, StoredEntry};
use ringstore_core::error::{Result, RingStoreError};
use ringstore_core::key::{EntryKey, KeyCodec};
use ringstore_storage::{EntryHeader, LocalStore, ScanCursor};
use tracing::{debug, trace};

use crate::config::ServiceConfig;
use crate::conflict::{ConflictResolver, Resolution};
use crate::topology::NodeId;
use crate::transport::{
    DeleteOutcome, GetResponse, HeadResponse, ItemInfo, PutOutcome, PutRequest, ReadContent,
    SyncListItem, SyncListRequest, SyncListResponse, SyncPullRequest, SyncPullResponse,
};

/// What happened to a version received from a peer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// Key was unknown here
    Inserted,
    /// Remote version replaced the local one
    Replaced,
    /// Local version is newer
    KeptLocal,
    /// Already had this exact version
    Unchanged,
}

impl ApplyOutcome {
    /// Whether the local store changed
    pub fn is_write(&self) -> bool {
        matches!(self, ApplyOutcome::Inserted | ApplyOutcome::Replaced)
    }
}

/// Server side of one node
pub struct NodeService {
    node_id: NodeId,
    store: Arc<dyn LocalStore>,
    codec: Arc<dyn KeyCodec>,
    clock: Arc<dyn Clock>,
    resolver: ConflictResolver,
    config: ServiceConfig,
    locks: Vec<Mutex<()>>,
    last_stamp: AtomicU64,
}

impl NodeService {
    pub fn new(
        node_id: NodeId,
        store: Arc<dyn LocalStore>,
        codec: Arc<dyn KeyCodec>,
        clock: Arc<dyn Clock>,
        config: ServiceConfig,
    ) -> Self {
        let stripes = config.lock_stripes.max(1);
        Self {
            node_id,
            store,
            codec,
            clock,
            resolver: ConflictResolver::new(),
            config,
            locks: (0..stripes).map(|_| Mutex::new(())).collect(),
            last_stamp: AtomicU64::new(0),
        }
    }

    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    pub fn store(&self) -> &Arc<dyn LocalStore> {
        &self.store
    }

    pub fn codec(&self) -> &Arc<dyn KeyCodec> {
        &self.codec
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    pub fn resolver(&self) -> &ConflictResolver {
        &self.resolver
    }

    /// Clock millis, never lower than any stamp handed out before
    fn next_stamp(&self) -> u64 {
        let now = self.clock.now_millis();
        let previous = self.last_stamp.fetch_max(now, Ordering::SeqCst);
        previous.max(now)
    }

    fn lock_key(&self, key: &EntryKey) -> MutexGuard<'_, ()> {
        let slot = self.codec.content_hash(key.as_bytes()) as usize % self.locks.len();
        self.locks[slot].lock()
    }

    /// Store client content
    pub fn handle_put(&self, request: PutRequest) -> Result<PutOutcome> {
        let PutRequest {
            key,
            content,
            content_hash,
            max_ttl_secs,
        } = request;

        let actual = self.codec.content_hash(&content);
        if actual != content_hash {
            return Err(RingStoreError::HashMismatch {
                expected: content_hash,
                actual,
            });
        }

        let (compression, stored) = compress_content(&content, self.config.compress_threshold);
        let compressed_hash = match compression {
            Compression::None => 0,
            Compression::Lzf => self.codec.content_hash(&stored),
        };

        let _guard = self.lock_key(&key);
        let now = self.clock.now_millis();
        let existing = self.store.get_header(&key)?;

        if let Some(local) = &existing {
            let live = !local.metadata.deleted && !local.metadata.is_expired(now);
            if live
                && local.metadata.content_hash == actual
                && local.metadata.original_length == content.len() as u64
                && local.metadata.max_ttl_secs == max_ttl_secs
            {
                trace!(node = %self.node_id, key = %key, "Put with unchanged content");
                return Ok(PutOutcome::Unchanged {
                    last_modified: local.metadata.last_modified,
                });
            }
        }

        let stamp = self.next_stamp();
        let metadata = EntryMetadata {
            content_hash: actual,
            compressed_hash,
            compression,
            original_length: content.len() as u64,
            storage_length: stored.len() as u64,
            last_modified: stamp,
            deleted: false,
            max_ttl_secs,
        };

        if let Some(local) = &existing {
            match self.resolver.resolve(&local.metadata, &metadata) {
                Resolution::TakeIncoming => {}
                Resolution::KeepLocal => {
                    debug!(
                        node = %self.node_id,
                        key = %key,
                        local = local.metadata.last_modified,
                        "Put superseded by newer local version"
                    );
                    return Ok(PutOutcome::Superseded {
                        last_modified: local.metadata.last_modified,
                    });
                }
                Resolution::Same => {
                    return Ok(PutOutcome::Unchanged {
                        last_modified: local.metadata.last_modified,
                    });
                }
            }
        }

        debug!(
            node = %self.node_id,
            key = %key,
            size = content.len(),
            compression = ?compression,
            stamp,
            "Stored entry"
        );
        self.store
            .put(StoredEntry::new(key, metadata, stored, stamp))?;
        Ok(PutOutcome::Stored {
            last_modified: stamp,
        })
    }

    /// Stored bytes and metadata of a live entry
    pub fn handle_get(&self, key: &EntryKey) -> Result<GetResponse> {
        let now = self.clock.now_millis();
        Ok(match self.store.get(key)? {
            Some(entry) if !entry.is_tombstone() && !entry.metadata.is_expired(now) => {
                GetResponse::Found(ReadContent {
                    metadata: entry.metadata,
                    content: entry.content,
                })
            }
            _ => GetResponse::NotFound,
        })
    }

    /// Metadata of a live entry
    pub fn handle_head(&self, key: &EntryKey) -> Result<HeadResponse> {
        let now = self.clock.now_millis();
        Ok(match self.store.get_header(key)? {
            Some(header) if !header.metadata.deleted && !header.metadata.is_expired(now) => {
                HeadResponse::Found(ItemInfo::from(&header.metadata))
            }
            _ => HeadResponse::NotFound,
        })
    }

    /// Replace the entry with a tombstone
    ///
    /// A tombstone is written even when the key is unknown here, so the
    /// delete still wins over content that arrives later through sync.
    pub fn handle_delete(&self, key: &EntryKey) -> Result<DeleteOutcome> {
        let _guard = self.lock_key(key);
        let now = self.clock.now_millis();
        let existing = self.store.get_header(key)?;

        let outcome = match &existing {
            Some(local) if local.metadata.deleted => return Ok(DeleteOutcome::Absent),
            Some(local) if local.metadata.is_expired(now) => DeleteOutcome::Absent,
            Some(_) => DeleteOutcome::Deleted,
            None => DeleteOutcome::Absent,
        };

        let stamp = self.next_stamp();
        let tombstone = StoredEntry::tombstone(key.clone(), stamp, stamp);
        if let Some(local) = &existing {
            if self.resolver.resolve(&local.metadata, &tombstone.metadata)
                == Resolution::KeepLocal
            {
                debug!(node = %self.node_id, key = %key, "Delete superseded by newer local version");
                return Ok(DeleteOutcome::Superseded);
            }
        }

        debug!(node = %self.node_id, key = %key, stamp, outcome = ?outcome, "Wrote tombstone");
        self.store.put(tombstone)?;
        Ok(outcome)
    }

    /// Entries stored after `since`, for a peer's sync agent
    ///
    /// Only entries at least one grace period old are listed, so a write that
    /// is still being stamped cannot slip behind the returned cursor. A run of
    /// entries sharing one stamp is never split across responses.
    pub fn handle_sync_list(&self, request: &SyncListRequest) -> Result<SyncListResponse> {
        let now = self.clock.now_millis();
        let cutoff = now.saturating_sub(self.config.sync_grace_period_ms);
        if cutoff <= request.since {
            return Ok(SyncListResponse {
                items: Vec::new(),
                cursor: request.since,
                more: false,
            });
        }

        let max_entries = request.max_entries.max(1);
        let page_size = max_entries + 1;
        let complete = |items| SyncListResponse {
            items,
            cursor: cutoff,
            more: false,
        };

        let mut items: Vec<SyncListItem> = Vec::new();
        let mut last_stamp = request.since;
        let mut from = ScanCursor::after_stamp(request.since);

        loop {
            let page = self.store.scan_modified(&from, page_size)?;
            for header in &page {
                if header.local_modified > cutoff {
                    return Ok(complete(items));
                }
                if items.len() >= max_entries && header.local_modified != last_stamp {
                    trace!(node = %self.node_id, listed = items.len(), cursor = last_stamp, "Sync listing truncated");
                    return Ok(SyncListResponse {
                        items,
                        cursor: last_stamp,
                        more: true,
                    });
                }
                last_stamp = header.local_modified;

                let routing_hash = self.codec.routing_hash(&header.key);
                let in_range = request
                    .ranges
                    .iter()
                    .any(|range| range.contains_hash(routing_hash));
                if in_range && !header.metadata.is_expired(now) {
                    items.push(SyncListItem {
                        key: header.key.clone(),
                        metadata: header.metadata.clone(),
                        local_modified: header.local_modified,
                    });
                }
            }

            match page.last() {
                Some(last) if page.len() == page_size => from = ScanCursor::after(last),
                _ => return Ok(complete(items)),
            }
        }
    }

    /// Full entries for a peer's sync agent
    pub fn handle_sync_pull(&self, request: &SyncPullRequest) -> Result<SyncPullResponse> {
        let mut entries = Vec::with_capacity(request.keys.len());
        for key in &request.keys {
            if let Some(entry) = self.store.get(key)? {
                entries.push(entry);
            }
        }
        Ok(SyncPullResponse { entries })
    }

    /// Local header of `key`, tombstones included
    pub fn local_header(&self, key: &EntryKey) -> Result<Option<EntryHeader>> {
        self.store.get_header(key)
    }

    /// Store a version pulled from a peer
    ///
    /// `last_modified` travels with the entry; the local stamp is fresh so
    /// the entry shows up in this node's own change stream.
    pub fn apply_remote(&self, entry: StoredEntry) -> Result<ApplyOutcome> {
        entry.verify(self.codec.as_ref())?;

        let _guard = self.lock_key(&entry.key);
        let outcome = match self.store.get_header(&entry.key)? {
            None => ApplyOutcome::Inserted,
            Some(local) => match self.resolver.resolve(&local.metadata, &entry.metadata) {
                Resolution::TakeIncoming => ApplyOutcome::Replaced,
                Resolution::KeepLocal => return Ok(ApplyOutcome::KeptLocal),
                Resolution::Same => return Ok(ApplyOutcome::Unchanged),
            },
        };

        let stamp = self.next_stamp();
        trace!(
            node = %self.node_id,
            key = %entry.key,
            last_modified = entry.metadata.last_modified,
            stamp,
            "Applied remote version"
        );
        self.store.put(StoredEntry {
            local_modified: stamp,
            ..entry
        })?;
        Ok(outcome)
    }

    /// Physically remove an entry if it is still the version in `header`
    pub fn purge_if_unchanged(&self, header: &EntryHeader) -> Result<bool> {
        let _guard = self.lock_key(&header.key);
        match self.store.get_header(&header.key)? {
            Some(current)
                if current.local_modified == header.local_modified
                    && current.metadata.same_version(&header.metadata) =>
            {
                self.store.remove(&header.key)
            }
            _ => Ok(false),
        }
    }
}
