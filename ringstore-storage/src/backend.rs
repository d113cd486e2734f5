//! Local store trait
//!
//! Defines the interface every node-local entry store must follow.
//! Besides point access, stores keep entries ordered by their local
//! modification stamp so peers can page through changes.

use bytes::{BufMut, Bytes, BytesMut};
use ringstore_core::entry::{EntryMetadata, StoredEntry};
use ringstore_core::error::Result;
use ringstore_core::key::EntryKey;

/// Storage statistics
#[derive(Debug, Clone, Default)]
pub struct StorageStats {
    /// Entries stored, tombstones included
    pub entry_count: u64,

    /// Entries that are tombstones
    pub tombstone_count: u64,

    /// Stored content bytes
    pub bytes_used: u64,

    /// Total storage capacity (0 = unlimited)
    pub bytes_capacity: u64,

    /// Number of read operations
    pub reads: u64,

    /// Number of write operations
    pub writes: u64,

    /// Number of physical removals
    pub removals: u64,
}

impl StorageStats {
    /// Calculate usage percentage
    pub fn usage_percent(&self) -> f64 {
        if self.bytes_capacity == 0 {
            0.0
        } else {
            (self.bytes_used as f64 / self.bytes_capacity as f64) * 100.0
        }
    }

    /// Check if storage is full
    pub fn is_full(&self) -> bool {
        self.bytes_capacity > 0 && self.bytes_used >= self.bytes_capacity
    }

    /// Available space in bytes
    pub fn bytes_available(&self) -> u64 {
        if self.bytes_capacity == 0 {
            u64::MAX
        } else {
            self.bytes_capacity.saturating_sub(self.bytes_used)
        }
    }
}

/// Entry metadata without content, as returned by scans
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryHeader {
    pub key: EntryKey,
    pub metadata: EntryMetadata,
    pub local_modified: u64,
}

impl From<&StoredEntry> for EntryHeader {
    fn from(entry: &StoredEntry) -> Self {
        Self {
            key: entry.key.clone(),
            metadata: entry.metadata.clone(),
            local_modified: entry.local_modified,
        }
    }
}

/// Inclusive lower bound of a modification-ordered scan
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct ScanCursor {
    pub local_modified: u64,
    pub key: Bytes,
}

impl ScanCursor {
    /// Start of the whole index
    pub fn start() -> Self {
        Self {
            local_modified: 0,
            key: Bytes::new(),
        }
    }

    /// First position with a stamp strictly greater than `since`
    pub fn after_stamp(since: u64) -> Self {
        Self {
            local_modified: since.saturating_add(1),
            key: Bytes::new(),
        }
    }

    /// Position right after `header`
    pub fn after(header: &EntryHeader) -> Self {
        // appending a zero byte gives the smallest key greater than this one
        let raw = header.key.as_bytes();
        let mut key = BytesMut::with_capacity(raw.len() + 1);
        key.put_slice(raw);
        key.put_u8(0);
        Self {
            local_modified: header.local_modified,
            key: key.freeze(),
        }
    }
}

/// Node-local entry store
///
/// Implementations must replace entries atomically: a concurrent reader sees
/// either the previous or the new version, never a mix.
pub trait LocalStore: Send + Sync {
    /// Retrieve an entry
    fn get(&self, key: &EntryKey) -> Result<Option<StoredEntry>>;

    /// Retrieve only the metadata of an entry
    fn get_header(&self, key: &EntryKey) -> Result<Option<EntryHeader>> {
        Ok(self.get(key)?.as_ref().map(EntryHeader::from))
    }

    /// Insert or replace an entry, returning the metadata it replaced
    fn put(&self, entry: StoredEntry) -> Result<Option<EntryMetadata>>;

    /// Physically remove an entry
    fn remove(&self, key: &EntryKey) -> Result<bool>;

    /// Up to `limit` headers ordered by (local stamp, key), starting at `from`
    fn scan_modified(&self, from: &ScanCursor, limit: usize) -> Result<Vec<EntryHeader>>;

    /// Number of stored entries, tombstones included
    fn entry_count(&self) -> Result<u64>;

    /// Get storage statistics
    fn stats(&self) -> Result<StorageStats>;

    /// Flush any pending writes
    fn flush(&self) -> Result<()>;
}
