//! RingStore Core Library
//!
//! Core abstractions for the RingStore replicated content store.
//! This crate provides:
//! - The entry key format and the `KeyCodec` that routes keys onto the ring
//! - Murmur3 hashing (block and incremental) for routing and checksums
//! - The stored entry model with optional LZF compression
//! - Injectable clocks, including a virtual clock for tests
//! - Common error handling

pub mod clock;
pub mod entry;
pub mod error;
pub mod hash;
pub mod key;

pub use clock::{Clock, SystemClock, VirtualClock};
pub use entry::{compress_content, decompress_content, Compression, EntryMetadata, StoredEntry};
pub use error::{QuorumTier, Result, RingStoreError};
pub use hash::{murmur3_32, IncrementalMurmur3, StreamingHasher};
pub use key::{BasicKeyCodec, EntryKey, KeyCodec, RequestPath};

/// Content at or above this size is stored LZF-compressed when that helps
pub const DEFAULT_COMPRESS_THRESHOLD: usize = 1024;
