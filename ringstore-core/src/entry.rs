//! Stored entries and their metadata
//!
//! Content is kept either as-is or LZF-compressed. `last_modified` is the
//! timestamp assigned by the node that first accepted the write and travels
//! with the entry; `local_modified` is when this node stored its copy.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::{Result, RingStoreError};
use crate::key::{EntryKey, KeyCodec};

/// Compression applied to stored bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum Compression {
    #[default]
    None,
    Lzf,
}

/// Metadata kept with every entry and exchanged during sync
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryMetadata {
    /// Hash of the uncompressed content
    pub content_hash: u32,
    /// Hash of the stored bytes when compressed, 0 otherwise
    pub compressed_hash: u32,
    pub compression: Compression,
    pub original_length: u64,
    pub storage_length: u64,
    /// Millis assigned by the accepting node; decides conflicts
    pub last_modified: u64,
    /// Tombstone marker
    pub deleted: bool,
    /// Optional time-to-live, counted from `last_modified`
    pub max_ttl_secs: Option<u32>,
}

impl EntryMetadata {
    /// Metadata of a deletion marker
    pub fn tombstone(last_modified: u64) -> Self {
        Self {
            content_hash: 0,
            compressed_hash: 0,
            compression: Compression::None,
            original_length: 0,
            storage_length: 0,
            last_modified,
            deleted: true,
            max_ttl_secs: None,
        }
    }

    /// Hash the stored bytes must match
    pub fn stored_hash(&self) -> u32 {
        match self.compression {
            Compression::None => self.content_hash,
            Compression::Lzf => self.compressed_hash,
        }
    }

    /// Whether the time-to-live has run out at `now_millis`
    pub fn is_expired(&self, now_millis: u64) -> bool {
        match self.max_ttl_secs {
            Some(ttl) => {
                let expires_at = self
                    .last_modified
                    .saturating_add(u64::from(ttl).saturating_mul(1000));
                now_millis >= expires_at
            }
            None => false,
        }
    }

    /// Both describe the very same write
    pub fn same_version(&self, other: &EntryMetadata) -> bool {
        self.last_modified == other.last_modified
            && self.deleted == other.deleted
            && self.content_hash == other.content_hash
            && self.original_length == other.original_length
            && self.max_ttl_secs == other.max_ttl_secs
    }

    /// Live entries with the same content, regardless of when written
    pub fn same_content(&self, other: &EntryMetadata) -> bool {
        !self.deleted
            && !other.deleted
            && self.content_hash == other.content_hash
            && self.original_length == other.original_length
    }
}

/// An entry as held by a local store
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredEntry {
    pub key: EntryKey,
    pub metadata: EntryMetadata,
    /// Stored bytes, compressed per `metadata.compression`
    pub content: Bytes,
    /// Millis at which this node stored the entry
    pub local_modified: u64,
}

impl StoredEntry {
    pub fn new(key: EntryKey, metadata: EntryMetadata, content: Bytes, local_modified: u64) -> Self {
        Self {
            key,
            metadata,
            content,
            local_modified,
        }
    }

    /// Deletion marker for `key`
    pub fn tombstone(key: EntryKey, last_modified: u64, local_modified: u64) -> Self {
        Self {
            key,
            metadata: EntryMetadata::tombstone(last_modified),
            content: Bytes::new(),
            local_modified,
        }
    }

    pub fn is_tombstone(&self) -> bool {
        self.metadata.deleted
    }

    /// Uncompressed content
    pub fn decoded_content(&self) -> Result<Bytes> {
        decompress_content(
            self.metadata.compression,
            &self.content,
            self.metadata.original_length as usize,
        )
    }

    /// Check stored bytes against the recorded hash
    pub fn verify(&self, codec: &dyn KeyCodec) -> Result<()> {
        if self.is_tombstone() {
            return Ok(());
        }
        if self.content.len() as u64 != self.metadata.storage_length {
            return Err(RingStoreError::Storage(format!(
                "entry {} has {} stored bytes, metadata says {}",
                self.key,
                self.content.len(),
                self.metadata.storage_length
            )));
        }
        let actual = codec.content_hash(&self.content);
        let expected = self.metadata.stored_hash();
        if actual != expected {
            return Err(RingStoreError::HashMismatch { expected, actual });
        }
        Ok(())
    }
}

/// Compress `data` with LZF if it is at least `threshold` bytes and shrinks
pub fn compress_content(data: &Bytes, threshold: usize) -> (Compression, Bytes) {
    if threshold == 0 || data.len() < threshold {
        return (Compression::None, data.clone());
    }
    match lzf::compress(data) {
        Ok(compressed) if compressed.len() < data.len() => {
            (Compression::Lzf, Bytes::from(compressed))
        }
        // NoCompressionPossible and friends: store as-is
        _ => (Compression::None, data.clone()),
    }
}

/// Largest output per input byte an LZF stream can produce: a three byte
/// back reference copies at most 264 bytes
pub const MAX_LZF_EXPANSION: usize = 88;

/// Undo `compress_content`
///
/// `original_length` comes from metadata a peer sent, so it is checked
/// against what `data` can possibly expand to before allocating.
pub fn decompress_content(
    compression: Compression,
    data: &Bytes,
    original_length: usize,
) -> Result<Bytes> {
    match compression {
        Compression::None => Ok(data.clone()),
        Compression::Lzf => {
            if original_length == 0 {
                return Ok(Bytes::new());
            }
            if original_length > data.len().saturating_mul(MAX_LZF_EXPANSION) {
                return Err(RingStoreError::Compression(format!(
                    "{} stored bytes cannot expand to {}",
                    data.len(),
                    original_length
                )));
            }
            let out = lzf::decompress(data, original_length)
                .map_err(|e| RingStoreError::Compression(format!("{:?}", e)))?;
            if out.len() != original_length {
                return Err(RingStoreError::Compression(format!(
                    "decompressed {} bytes, expected {}",
                    out.len(),
                    original_length
                )));
            }
            Ok(Bytes::from(out))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::BasicKeyCodec;

    fn compressible(size: usize) -> Bytes {
        Bytes::from(
            "Some fairly compressible text, repeated. "
                .repeat(size / 41 + 1)
                .into_bytes()[..size]
                .to_vec(),
        )
    }

    #[test]
    fn test_implausible_length_rejected() {
        let data = compressible(4000);
        let (compression, stored) = compress_content(&data, 1000);
        assert_eq!(compression, Compression::Lzf);

        let limit = stored.len() * MAX_LZF_EXPANSION;
        assert!(matches!(
            decompress_content(compression, &stored, limit + 1),
            Err(RingStoreError::Compression(_))
        ));
        assert!(matches!(
            decompress_content(compression, &stored, usize::MAX),
            Err(RingStoreError::Compression(_))
        ));
        assert!(decompress_content(Compression::Lzf, &Bytes::new(), 10).is_err());
    }

    #[test]
    fn test_compress_round_trip() {
        let data = compressible(4000);
        let (compression, stored) = compress_content(&data, 1000);
        assert_eq!(compression, Compression::Lzf);
        assert!(stored.len() < data.len());

        let restored = decompress_content(compression, &stored, data.len()).unwrap();
        assert_eq!(restored, data);
    }

    #[test]
    fn test_compress_below_threshold() {
        let data = compressible(500);
        let (compression, stored) = compress_content(&data, 1000);
        assert_eq!(compression, Compression::None);
        assert_eq!(stored, data);

        let (compression, _) = compress_content(&data, 0);
        assert_eq!(compression, Compression::None);
    }

    #[test]
    fn test_incompressible_stays_plain() {
        // xorshift noise does not compress
        let mut x: u32 = 0x9e37_79b9;
        let noise: Vec<u8> = (0..2048)
            .map(|_| {
                x ^= x << 13;
                x ^= x >> 17;
                x ^= x << 5;
                x as u8
            })
            .collect();
        let data = Bytes::from(noise);
        let (compression, stored) = compress_content(&data, 16);
        assert_eq!(compression, Compression::None);
        assert_eq!(stored, data);
    }

    #[test]
    fn test_decompress_corrupt() {
        let garbage = Bytes::from_static(&[0xff, 0xff, 0xff, 0xff]);
        assert!(decompress_content(Compression::Lzf, &garbage, 100).is_err());
    }

    #[test]
    fn test_expiry() {
        let mut meta = EntryMetadata::tombstone(10_000);
        meta.deleted = false;
        assert!(!meta.is_expired(u64::MAX));

        meta.max_ttl_secs = Some(5);
        assert!(!meta.is_expired(14_999));
        assert!(meta.is_expired(15_000));
    }

    #[test]
    fn test_verify() {
        let codec = BasicKeyCodec::new();
        let key = codec.key("", "verify").unwrap();
        let content = compressible(3000);
        let (compression, stored) = compress_content(&content, 1000);

        let metadata = EntryMetadata {
            content_hash: codec.content_hash(&content),
            compressed_hash: codec.content_hash(&stored),
            compression,
            original_length: content.len() as u64,
            storage_length: stored.len() as u64,
            last_modified: 1,
            deleted: false,
            max_ttl_secs: None,
        };
        let entry = StoredEntry::new(key.clone(), metadata.clone(), stored.clone(), 1);
        entry.verify(&codec).unwrap();
        assert_eq!(entry.decoded_content().unwrap(), content);

        let mut broken = metadata;
        broken.compressed_hash ^= 1;
        let entry = StoredEntry::new(key.clone(), broken, stored, 1);
        assert!(matches!(
            entry.verify(&codec),
            Err(RingStoreError::HashMismatch { .. })
        ));

        let tombstone = StoredEntry::tombstone(key, 5, 5);
        assert!(tombstone.is_tombstone());
        tombstone.verify(&codec).unwrap();
    }

    #[test]
    fn test_version_comparison() {
        let a = EntryMetadata {
            content_hash: 7,
            compressed_hash: 0,
            compression: Compression::None,
            original_length: 3,
            storage_length: 3,
            last_modified: 100,
            deleted: false,
            max_ttl_secs: None,
        };
        let mut b = a.clone();
        b.last_modified = 200;
        assert!(!a.same_version(&b));
        assert!(a.same_content(&b));

        let t = EntryMetadata::tombstone(100);
        assert!(!a.same_content(&t));
    }
}
