//! Conflict resolution between versions of one key
//!
//! Last write wins on `last_modified`. Equal timestamps are broken the same
//! way on every node: a tombstone beats live content, then the larger
//! content hash, then the larger original length, then the later expiry
//! (no TTL counts as earliest).

use ringstore_core::entry::EntryMetadata;

/// Which version to keep
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// Local version wins; drop the incoming one
    KeepLocal,
    /// Incoming version wins; overwrite the local one
    TakeIncoming,
    /// Both describe the same write
    Same,
}

/// Deterministic last-write-wins resolver
#[derive(Debug, Clone, Copy, Default)]
pub struct ConflictResolver;

impl ConflictResolver {
    pub fn new() -> Self {
        Self
    }

    fn rank(metadata: &EntryMetadata) -> (u64, bool, u32, u64, Option<u32>) {
        (
            metadata.last_modified,
            metadata.deleted,
            metadata.content_hash,
            metadata.original_length,
            metadata.max_ttl_secs,
        )
    }

    /// Decide between the local version and an incoming one
    pub fn resolve(&self, local: &EntryMetadata, incoming: &EntryMetadata) -> Resolution {
        match Self::rank(incoming).cmp(&Self::rank(local)) {
            std::cmp::Ordering::Greater => Resolution::TakeIncoming,
            std::cmp::Ordering::Less => Resolution::KeepLocal,
            std::cmp::Ordering::Equal => Resolution::Same,
        }
    }
}
