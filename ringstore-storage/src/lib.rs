//! RingStore Storage Backend
//!
//! Provides node-local entry stores:
//! - `LocalStore` trait for pluggable storage
//! - `SledStore` for persistent storage
//! - `MemoryStore` for testing and embedded clusters

pub mod backend;
pub mod memory;
pub mod sled_backend;

pub use backend::{EntryHeader, LocalStore, ScanCursor, StorageStats};
pub use memory::MemoryStore;
pub use sled_backend::SledStore;

use ringstore_core::error::Result;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Which store implementation a node uses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StoreKind {
    Memory,
    #[default]
    Sled,
}

/// Storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Backend to open
    pub kind: StoreKind,

    /// Path to storage directory (sled only)
    pub path: std::path::PathBuf,

    /// Maximum storage capacity in bytes (0 = unlimited, memory only)
    pub max_capacity: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            kind: StoreKind::Sled,
            path: std::path::PathBuf::from("./ringstore_data"),
            max_capacity: 0, // Unlimited
        }
    }
}

impl StoreConfig {
    /// Persistent store at `path`
    pub fn new(path: impl Into<std::path::PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Default::default()
        }
    }

    /// Non-persistent store
    pub fn memory() -> Self {
        Self {
            kind: StoreKind::Memory,
            ..Default::default()
        }
    }

    /// Set maximum capacity
    pub fn with_max_capacity(mut self, bytes: u64) -> Self {
        self.max_capacity = bytes;
        self
    }

    /// Open the configured store
    pub fn open(&self) -> Result<Arc<dyn LocalStore>> {
        Ok(match self.kind {
            StoreKind::Memory => Arc::new(MemoryStore::with_capacity(self.max_capacity)),
            StoreKind::Sled => Arc::new(SledStore::open(&self.path)?),
        })
    }
}
