//! Sled-based persistent entry store
//!
//! Three trees:
//! - `headers`: raw key -> bincode(metadata + local stamp)
//! - `contents`: raw key -> stored bytes
//! - `modified`: stamp (u64 BE) ++ raw key -> empty, the change index
//!
//! A put rewrites all three inside one sled transaction.

use crate::backend::{EntryHeader, LocalStore, ScanCursor, StorageStats};
use bytes::Bytes;
use ringstore_core::entry::{EntryMetadata, StoredEntry};
use ringstore_core::error::{Result, RingStoreError};
use ringstore_core::key::EntryKey;
use serde::{Deserialize, Serialize};
use sled::transaction::{ConflictableTransactionError, TransactionError};
use sled::Transactional;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info};

const STAMP_LENGTH: usize = 8;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct HeaderRecord {
    metadata: EntryMetadata,
    local_modified: u64,
}

fn index_key(stamp: u64, raw_key: &[u8]) -> Vec<u8> {
    let mut key = Vec::with_capacity(STAMP_LENGTH + raw_key.len());
    key.extend_from_slice(&stamp.to_be_bytes());
    key.extend_from_slice(raw_key);
    key
}

fn storage_err(e: sled::Error) -> RingStoreError {
    RingStoreError::Storage(e.to_string())
}

/// Sled-based entry store
pub struct SledStore {
    db: sled::Db,
    headers: sled::Tree,
    contents: sled::Tree,
    modified: sled::Tree,

    reads: AtomicU64,
    writes: AtomicU64,
    removals: AtomicU64,
}

impl SledStore {
    /// Open or create a store
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        info!(path = ?path.as_ref(), "Opening Sled entry store");

        let db = sled::open(path.as_ref())
            .map_err(|e| RingStoreError::Storage(format!("Failed to open Sled: {}", e)))?;
        Self::with_db(db)
    }

    /// Open a store that is deleted on drop (for testing)
    pub fn open_temporary() -> Result<Self> {
        let config = sled::Config::new().temporary(true);
        let db = config
            .open()
            .map_err(|e| RingStoreError::Storage(format!("Failed to open Sled: {}", e)))?;
        Self::with_db(db)
    }

    fn with_db(db: sled::Db) -> Result<Self> {
        let headers = db.open_tree("headers").map_err(storage_err)?;
        let contents = db.open_tree("contents").map_err(storage_err)?;
        let modified = db.open_tree("modified").map_err(storage_err)?;
        Ok(Self {
            db,
            headers,
            contents,
            modified,
            reads: AtomicU64::new(0),
            writes: AtomicU64::new(0),
            removals: AtomicU64::new(0),
        })
    }

    fn read_header(&self, raw_key: &[u8]) -> Result<Option<HeaderRecord>> {
        match self.headers.get(raw_key).map_err(storage_err)? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Get database size estimate
    pub fn size_on_disk(&self) -> u64 {
        self.db.size_on_disk().unwrap_or(0)
    }
}

fn map_transaction_error(err: TransactionError<String>) -> RingStoreError {
    match err {
        TransactionError::Abort(reason) => RingStoreError::Storage(reason),
        TransactionError::Storage(e) => storage_err(e),
    }
}

impl LocalStore for SledStore {
    fn get(&self, key: &EntryKey) -> Result<Option<StoredEntry>> {
        self.reads.fetch_add(1, Ordering::Relaxed);

        // Read header and content from one snapshot
        let found = (&self.headers, &self.contents)
            .transaction(|(headers, contents)| {
                let header = headers.get(key.as_bytes())?;
                let content = contents.get(key.as_bytes())?;
                Ok::<_, ConflictableTransactionError<String>>(header.zip(content))
            })
            .map_err(map_transaction_error)?;

        match found {
            Some((header, content)) => {
                let record: HeaderRecord = bincode::deserialize(&header)?;
                Ok(Some(StoredEntry::new(
                    key.clone(),
                    record.metadata,
                    Bytes::copy_from_slice(&content),
                    record.local_modified,
                )))
            }
            None => Ok(None),
        }
    }

    fn get_header(&self, key: &EntryKey) -> Result<Option<EntryHeader>> {
        self.reads.fetch_add(1, Ordering::Relaxed);
        Ok(self.read_header(key.as_bytes())?.map(|record| EntryHeader {
            key: key.clone(),
            metadata: record.metadata,
            local_modified: record.local_modified,
        }))
    }

    fn put(&self, entry: StoredEntry) -> Result<Option<EntryMetadata>> {
        let raw = entry.key.as_bytes();
        let encoded = bincode::serialize(&HeaderRecord {
            metadata: entry.metadata.clone(),
            local_modified: entry.local_modified,
        })?;
        let new_index = index_key(entry.local_modified, raw);

        let previous = (&self.headers, &self.contents, &self.modified)
            .transaction(|(headers, contents, modified)| {
                let previous = match headers.insert(raw, encoded.as_slice())? {
                    Some(old) => {
                        let old: HeaderRecord = bincode::deserialize(&old)
                            .map_err(|e| ConflictableTransactionError::Abort(e.to_string()))?;
                        modified.remove(index_key(old.local_modified, raw))?;
                        Some(old.metadata)
                    }
                    None => None,
                };
                contents.insert(raw, &entry.content[..])?;
                modified.insert(new_index.as_slice(), &[0u8; 0][..])?;
                Ok(previous)
            })
            .map_err(map_transaction_error)?;

        self.writes.fetch_add(1, Ordering::Relaxed);
        debug!(key = %entry.key, stamp = entry.local_modified, "Stored entry");
        Ok(previous)
    }

    fn remove(&self, key: &EntryKey) -> Result<bool> {
        let raw = key.as_bytes();
        let removed = (&self.headers, &self.contents, &self.modified)
            .transaction(|(headers, contents, modified)| {
                match headers.remove(raw)? {
                    Some(old) => {
                        let old: HeaderRecord = bincode::deserialize(&old)
                            .map_err(|e| ConflictableTransactionError::Abort(e.to_string()))?;
                        modified.remove(index_key(old.local_modified, raw))?;
                        contents.remove(raw)?;
                        Ok(true)
                    }
                    None => Ok(false),
                }
            })
            .map_err(map_transaction_error)?;

        if removed {
            self.removals.fetch_add(1, Ordering::Relaxed);
        }
        Ok(removed)
    }

    fn scan_modified(&self, from: &ScanCursor, limit: usize) -> Result<Vec<EntryHeader>> {
        let start = index_key(from.local_modified, &from.key);
        let mut headers = Vec::new();

        for item in self.modified.range(start..) {
            if headers.len() >= limit {
                break;
            }
            let (index, _) = item.map_err(storage_err)?;
            if index.len() < STAMP_LENGTH {
                continue;
            }
            let mut stamp = [0u8; STAMP_LENGTH];
            stamp.copy_from_slice(&index[..STAMP_LENGTH]);
            let stamp = u64::from_be_bytes(stamp);
            let raw = &index[STAMP_LENGTH..];

            // The entry may have been replaced since the index was read
            let Some(record) = self.read_header(raw)? else {
                continue;
            };
            if record.local_modified != stamp {
                continue;
            }
            headers.push(EntryHeader {
                key: EntryKey::from_raw(Bytes::copy_from_slice(raw))?,
                metadata: record.metadata,
                local_modified: record.local_modified,
            });
        }

        Ok(headers)
    }

    fn entry_count(&self) -> Result<u64> {
        Ok(self.headers.len() as u64)
    }

    fn stats(&self) -> Result<StorageStats> {
        let mut tombstone_count = 0;
        let mut bytes_used = 0;
        for item in self.headers.iter() {
            let (_, value) = item.map_err(storage_err)?;
            let record: HeaderRecord = bincode::deserialize(&value)?;
            if record.metadata.deleted {
                tombstone_count += 1;
            }
            bytes_used += record.metadata.storage_length;
        }
        Ok(StorageStats {
            entry_count: self.headers.len() as u64,
            tombstone_count,
            bytes_used,
            bytes_capacity: 0,
            reads: self.reads.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
            removals: self.removals.load(Ordering::Relaxed),
        })
    }

    fn flush(&self) -> Result<()> {
        self.db.flush().map_err(storage_err)?;
        Ok(())
    }
}
