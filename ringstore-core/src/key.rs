//! Entry keys and the key codec
//!
//! Raw key layout:
//! ```text
//! +----------------+------------------+-----------------+
//! | len (u16, BE)  | partition id     | path            |
//! +----------------+------------------+-----------------+
//! ```
//! String form: `rs:<partition id>@<path>`. An empty partition id means the
//! key has none, and the whole path is then used for routing.

use std::borrow::Cow;
use std::fmt;

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{Result, RingStoreError};
use crate::hash::{murmur3_32, IncrementalMurmur3, StreamingHasher, DEFAULT_SEED};

/// Size of the partition id length header
pub const KEY_HEADER_LENGTH: usize = 2;

/// Longest partition id the header can describe
pub const MAX_PARTITION_ID_LENGTH: usize = 0x7FFF;

/// Prefix of the string form
pub const KEY_PREFIX: &str = "rs:";

/// Separates partition id from path in the string form
pub const KEY_SEPARATOR: char = '@';

/// Query parameter carrying the partition id in request paths
pub const PARTITION_ID_PARAM: &str = "partition";

/// Mask applied to routing hashes so they stay non-negative as i32
pub const ROUTING_HASH_MASK: u32 = 0x7FFF_FFFF;

/// An immutable entry key: optional partition id plus path
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntryKey {
    raw: Bytes,
    partition_id_len: usize,
}

impl EntryKey {
    /// Build a key from its parts
    pub fn new(partition_id: &[u8], path: &[u8]) -> Result<Self> {
        if partition_id.len() > MAX_PARTITION_ID_LENGTH {
            return Err(RingStoreError::PartitionIdTooLong {
                length: partition_id.len(),
                max: MAX_PARTITION_ID_LENGTH,
            });
        }
        let mut buf = BytesMut::with_capacity(KEY_HEADER_LENGTH + partition_id.len() + path.len());
        buf.put_u16(partition_id.len() as u16);
        buf.put_slice(partition_id);
        buf.put_slice(path);
        Ok(Self {
            raw: buf.freeze(),
            partition_id_len: partition_id.len(),
        })
    }

    /// Validate and wrap a raw key
    pub fn from_raw(raw: Bytes) -> Result<Self> {
        if raw.len() < KEY_HEADER_LENGTH {
            return Err(RingStoreError::InvalidKeyEncoding(format!(
                "key of {} bytes is shorter than its header",
                raw.len()
            )));
        }
        let declared = usize::from(u16::from_be_bytes([raw[0], raw[1]]));
        if declared > MAX_PARTITION_ID_LENGTH {
            return Err(RingStoreError::InvalidKeyEncoding(format!(
                "declared partition id length {} exceeds {}",
                declared, MAX_PARTITION_ID_LENGTH
            )));
        }
        let available = raw.len() - KEY_HEADER_LENGTH;
        if declared > available {
            return Err(RingStoreError::InvalidKeyEncoding(format!(
                "declared partition id length {} but only {} bytes follow the header",
                declared, available
            )));
        }
        Ok(Self {
            raw,
            partition_id_len: declared,
        })
    }

    /// Full raw encoding, header included
    pub fn as_bytes(&self) -> &[u8] {
        &self.raw
    }

    /// Shared handle to the raw encoding
    pub fn raw(&self) -> &Bytes {
        &self.raw
    }

    pub fn partition_id(&self) -> &[u8] {
        &self.raw[KEY_HEADER_LENGTH..KEY_HEADER_LENGTH + self.partition_id_len]
    }

    pub fn has_partition_id(&self) -> bool {
        self.partition_id_len > 0
    }

    pub fn path(&self) -> &[u8] {
        &self.raw[KEY_HEADER_LENGTH + self.partition_id_len..]
    }

    /// Bytes that determine where the key lives on the ring
    pub fn routing_bytes(&self) -> &[u8] {
        if self.has_partition_id() {
            self.partition_id()
        } else {
            &self.raw[KEY_HEADER_LENGTH..]
        }
    }

    /// Path as text, replacing invalid UTF-8
    pub fn path_lossy(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(self.path())
    }

    /// Canonical string form
    pub fn to_key_string(&self) -> String {
        let partition = String::from_utf8_lossy(self.partition_id());
        let path = String::from_utf8_lossy(self.path());
        let mut out = String::with_capacity(KEY_PREFIX.len() + partition.len() + 1 + path.len());
        out.push_str(KEY_PREFIX);
        out.push_str(&partition);
        out.push(KEY_SEPARATOR);
        out.push_str(&path);
        out
    }
}

impl fmt::Display for EntryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_key_string())
    }
}

impl fmt::Debug for EntryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EntryKey({})", self.to_key_string())
    }
}

/// Key as it travels in a request: path segment plus optional query parameter
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestPath {
    pub path: String,
    pub partition_id: Option<String>,
}

impl RequestPath {
    /// Query string for the partition parameter, if any
    pub fn query(&self) -> Option<String> {
        self.partition_id
            .as_ref()
            .map(|p| format!("{}={}", PARTITION_ID_PARAM, p))
    }
}

/// Conversion between keys, their encodings and their hashes
pub trait KeyCodec: Send + Sync {
    /// Build a key from partition id and path
    fn encode(&self, partition_id: &[u8], path: &[u8]) -> Result<EntryKey>;

    /// Parse a raw key
    fn decode(&self, raw: &[u8]) -> Result<EntryKey>;

    /// Parse the string form
    fn parse_str(&self, text: &str) -> Result<EntryKey>;

    /// Render the string form
    fn format(&self, key: &EntryKey) -> String;

    /// Non-negative hash that places the key on the ring
    fn routing_hash(&self, key: &EntryKey) -> u32;

    /// Checksum of entry content
    fn content_hash(&self, content: &[u8]) -> u32;

    /// Incremental hasher producing the same values as `content_hash`
    fn streaming_hasher(&self) -> Box<dyn StreamingHasher>;

    /// Split a key into request path and partition parameter
    fn to_request_path(&self, key: &EntryKey) -> RequestPath;

    /// Rebuild a key from request path and partition parameter
    fn from_request_path(&self, partition_id: Option<&str>, path: &str) -> Result<EntryKey>;
}

/// Default codec: 16-bit length header, murmur3 hashing
#[derive(Debug, Clone)]
pub struct BasicKeyCodec {
    seed: u32,
}

impl BasicKeyCodec {
    pub fn new() -> Self {
        Self { seed: DEFAULT_SEED }
    }

    /// Convenience for textual partition id and path
    pub fn key(&self, partition_id: &str, path: &str) -> Result<EntryKey> {
        self.encode(partition_id.as_bytes(), path.as_bytes())
    }
}

impl Default for BasicKeyCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl KeyCodec for BasicKeyCodec {
    fn encode(&self, partition_id: &[u8], path: &[u8]) -> Result<EntryKey> {
        EntryKey::new(partition_id, path)
    }

    fn decode(&self, raw: &[u8]) -> Result<EntryKey> {
        EntryKey::from_raw(Bytes::copy_from_slice(raw))
    }

    fn parse_str(&self, text: &str) -> Result<EntryKey> {
        let rest = text.strip_prefix(KEY_PREFIX).ok_or_else(|| {
            RingStoreError::InvalidKeyEncoding(format!(
                "key '{}' does not start with '{}'",
                text, KEY_PREFIX
            ))
        })?;
        let (partition_id, path) = rest.split_once(KEY_SEPARATOR).ok_or_else(|| {
            RingStoreError::InvalidKeyEncoding(format!(
                "key '{}' has no '{}' separator",
                text, KEY_SEPARATOR
            ))
        })?;
        self.encode(partition_id.as_bytes(), path.as_bytes())
    }

    fn format(&self, key: &EntryKey) -> String {
        key.to_key_string()
    }

    fn routing_hash(&self, key: &EntryKey) -> u32 {
        murmur3_32(key.routing_bytes(), self.seed) & ROUTING_HASH_MASK
    }

    fn content_hash(&self, content: &[u8]) -> u32 {
        murmur3_32(content, self.seed)
    }

    fn streaming_hasher(&self) -> Box<dyn StreamingHasher> {
        Box::new(IncrementalMurmur3::new(self.seed))
    }

    fn to_request_path(&self, key: &EntryKey) -> RequestPath {
        RequestPath {
            path: key.path_lossy().into_owned(),
            partition_id: key
                .has_partition_id()
                .then(|| String::from_utf8_lossy(key.partition_id()).into_owned()),
        }
    }

    fn from_request_path(&self, partition_id: Option<&str>, path: &str) -> Result<EntryKey> {
        let partition_id = partition_id.unwrap_or("");
        self.encode(partition_id.as_bytes(), path.as_bytes())
    }
}
