//! In-memory entry store
//!
//! Used for testing and embedded clusters. Not persistent.

use crate::backend::{EntryHeader, LocalStore, ScanCursor, StorageStats};
use bytes::Bytes;
use parking_lot::RwLock;
use ringstore_core::entry::{EntryMetadata, StoredEntry};
use ringstore_core::error::{Result, RingStoreError};
use ringstore_core::key::EntryKey;
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Default)]
struct MemoryState {
    entries: HashMap<Bytes, StoredEntry>,
    /// (local stamp, raw key) of every entry
    by_modified: BTreeSet<(u64, Bytes)>,
    bytes_used: u64,
}

/// In-memory entry store
pub struct MemoryStore {
    /// Entries plus modification index, updated under one lock
    state: RwLock<MemoryState>,

    /// Maximum capacity (0 = unlimited)
    max_capacity: u64,

    /// Operation counters
    reads: AtomicU64,
    writes: AtomicU64,
    removals: AtomicU64,
}

impl MemoryStore {
    /// Create a new in-memory store
    pub fn new() -> Self {
        Self::with_capacity(0)
    }

    /// Create with a maximum capacity
    pub fn with_capacity(max_bytes: u64) -> Self {
        Self {
            state: RwLock::new(MemoryState::default()),
            max_capacity: max_bytes,
            reads: AtomicU64::new(0),
            writes: AtomicU64::new(0),
            removals: AtomicU64::new(0),
        }
    }

    /// Clear all stored entries
    pub fn clear(&self) {
        let mut state = self.state.write();
        *state = MemoryState::default();
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalStore for MemoryStore {
    fn get(&self, key: &EntryKey) -> Result<Option<StoredEntry>> {
        self.reads.fetch_add(1, Ordering::Relaxed);
        let state = self.state.read();
        Ok(state.entries.get(key.raw()).cloned())
    }

    fn get_header(&self, key: &EntryKey) -> Result<Option<EntryHeader>> {
        self.reads.fetch_add(1, Ordering::Relaxed);
        let state = self.state.read();
        Ok(state.entries.get(key.raw()).map(EntryHeader::from))
    }

    fn put(&self, entry: StoredEntry) -> Result<Option<EntryMetadata>> {
        let raw = entry.key.raw().clone();
        let data_len = entry.content.len() as u64;

        let mut state = self.state.write();

        let old_len = state
            .entries
            .get(&raw)
            .map(|old| old.content.len() as u64)
            .unwrap_or(0);
        if self.max_capacity > 0 {
            let projected = state.bytes_used - old_len + data_len;
            if projected > self.max_capacity {
                return Err(RingStoreError::StorageFull {
                    used: state.bytes_used,
                    capacity: self.max_capacity,
                });
            }
        }

        let stamp = entry.local_modified;
        let previous = state.entries.insert(raw.clone(), entry);
        if let Some(old) = &previous {
            state.by_modified.remove(&(old.local_modified, raw.clone()));
        }
        state.by_modified.insert((stamp, raw));
        state.bytes_used = state.bytes_used - old_len + data_len;
        self.writes.fetch_add(1, Ordering::Relaxed);

        Ok(previous.map(|old| old.metadata))
    }

    fn remove(&self, key: &EntryKey) -> Result<bool> {
        let mut state = self.state.write();

        if let Some(old) = state.entries.remove(key.raw()) {
            state
                .by_modified
                .remove(&(old.local_modified, key.raw().clone()));
            state.bytes_used -= old.content.len() as u64;
            self.removals.fetch_add(1, Ordering::Relaxed);
            Ok(true)
        } else {
            Ok(false)
        }
    }

    fn scan_modified(&self, from: &ScanCursor, limit: usize) -> Result<Vec<EntryHeader>> {
        let state = self.state.read();
        let start = (from.local_modified, from.key.clone());
        Ok(state
            .by_modified
            .range(start..)
            .take(limit)
            .filter_map(|(_, raw)| state.entries.get(raw))
            .map(EntryHeader::from)
            .collect())
    }

    fn entry_count(&self) -> Result<u64> {
        Ok(self.state.read().entries.len() as u64)
    }

    fn stats(&self) -> Result<StorageStats> {
        let state = self.state.read();
        Ok(StorageStats {
            entry_count: state.entries.len() as u64,
            tombstone_count: state.entries.values().filter(|e| e.is_tombstone()).count() as u64,
            bytes_used: state.bytes_used,
            bytes_capacity: self.max_capacity,
            reads: self.reads.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
            removals: self.removals.load(Ordering::Relaxed),
        })
    }

    fn flush(&self) -> Result<()> {
        // No-op for in-memory storage
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ringstore_core::entry::Compression;
    use ringstore_core::key::BasicKeyCodec;

    fn entry(path: &str, content: &'static [u8], stamp: u64) -> StoredEntry {
        let codec = BasicKeyCodec::new();
        let metadata = EntryMetadata {
            content_hash: 1,
            compressed_hash: 0,
            compression: Compression::None,
            original_length: content.len() as u64,
            storage_length: content.len() as u64,
            last_modified: stamp,
            deleted: false,
            max_ttl_secs: None,
        };
        StoredEntry::new(
            codec.key("", path).unwrap(),
            metadata,
            Bytes::from_static(content),
            stamp,
        )
    }

    #[test]
    fn test_put_get() {
        let store = MemoryStore::new();
        let e = entry("a", b"hello world", 10);

        assert!(store.put(e.clone()).unwrap().is_none());
        let retrieved = store.get(&e.key).unwrap().unwrap();
        assert_eq!(retrieved, e);

        let header = store.get_header(&e.key).unwrap().unwrap();
        assert_eq!(header.local_modified, 10);
    }

    #[test]
    fn test_replace_moves_index() {
        let store = MemoryStore::new();
        store.put(entry("a", b"v1", 10)).unwrap();
        store.put(entry("b", b"v1", 11)).unwrap();

        let previous = store.put(entry("a", b"v2", 20)).unwrap().unwrap();
        assert_eq!(previous.last_modified, 10);

        let scanned = store.scan_modified(&ScanCursor::start(), 10).unwrap();
        let order: Vec<u64> = scanned.iter().map(|h| h.local_modified).collect();
        assert_eq!(order, vec![11, 20]);
        assert_eq!(store.entry_count().unwrap(), 2);
    }

    #[test]
    fn test_scan_paging() {
        let store = MemoryStore::new();
        for (i, path) in ["a", "b", "c", "d", "e"].iter().enumerate() {
            // two entries share each stamp
            store.put(entry(path, b"x", 100 + i as u64 / 2)).unwrap();
        }

        let first = store.scan_modified(&ScanCursor::after_stamp(99), 3).unwrap();
        assert_eq!(first.len(), 3);
        let rest = store
            .scan_modified(&ScanCursor::after(&first[2]), 10)
            .unwrap();
        assert_eq!(rest.len(), 2);

        let all: Vec<_> = first.iter().chain(rest.iter()).map(|h| h.key.path().to_vec()).collect();
        assert_eq!(all, vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec(), b"d".to_vec(), b"e".to_vec()]);

        let newer = store.scan_modified(&ScanCursor::after_stamp(100), 10).unwrap();
        assert_eq!(newer.len(), 3);
    }

    #[test]
    fn test_remove() {
        let store = MemoryStore::new();
        let e = entry("a", b"hello", 1);
        store.put(e.clone()).unwrap();

        assert!(store.remove(&e.key).unwrap());
        assert!(store.get(&e.key).unwrap().is_none());
        assert!(store.scan_modified(&ScanCursor::start(), 10).unwrap().is_empty());

        // Removing non-existent returns false
        assert!(!store.remove(&e.key).unwrap());
    }

    #[test]
    fn test_capacity_limit() {
        let store = MemoryStore::with_capacity(10);
        store.put(entry("a", b"12345", 1)).unwrap();
        store.put(entry("b", b"12345", 2)).unwrap();

        let result = store.put(entry("c", b"1", 3));
        assert!(matches!(result, Err(RingStoreError::StorageFull { .. })));

        // replacing in place does not grow usage
        store.put(entry("a", b"54321", 4)).unwrap();
    }

    #[test]
    fn test_stats() {
        let store = MemoryStore::with_capacity(1000);
        let e = entry("a", &[0u8; 100], 1);
        store.put(e.clone()).unwrap();
        store
            .put(StoredEntry::tombstone(
                BasicKeyCodec::new().key("", "gone").unwrap(),
                2,
                2,
            ))
            .unwrap();
        store.get(&e.key).unwrap();
        store.get(&e.key).unwrap();

        let stats = store.stats().unwrap();
        assert_eq!(stats.entry_count, 2);
        assert_eq!(stats.tombstone_count, 1);
        assert_eq!(stats.bytes_used, 100);
        assert_eq!(stats.writes, 2);
        assert_eq!(stats.reads, 2);
        assert_eq!(stats.usage_percent(), 10.0);
    }
}
