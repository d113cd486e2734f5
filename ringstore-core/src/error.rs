//! Error types for RingStore
//!
//! Provides a unified error type for key handling, storage and replication.

use std::fmt;

use thiserror::Error;

/// Result type alias for RingStore operations
pub type Result<T> = std::result::Result<T, RingStoreError>;

/// Acknowledgement tier of a replicated operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuorumTier {
    Minimal,
    Optimal,
    Maximal,
}

impl fmt::Display for QuorumTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QuorumTier::Minimal => write!(f, "minimal"),
            QuorumTier::Optimal => write!(f, "optimal"),
            QuorumTier::Maximal => write!(f, "maximal"),
        }
    }
}

/// Unified error type for RingStore
#[derive(Error, Debug)]
pub enum RingStoreError {
    // ===== Key Errors =====
    #[error("Invalid key encoding: {0}")]
    InvalidKeyEncoding(String),

    #[error("Partition id too long: {length} bytes (max: {max})")]
    PartitionIdTooLong { length: usize, max: usize },

    // ===== Replication Errors =====
    #[error("Could not reach {tier} tier: {achieved}/{needed} successful calls")]
    ThresholdUnreachable {
        tier: QuorumTier,
        needed: usize,
        achieved: usize,
    },

    #[error("Call to node {node} failed: {reason}")]
    NodeCommunication { node: String, reason: String },

    #[error("Invalid operation state: {0}")]
    InvalidState(String),

    // ===== Content Errors =====
    #[error("Content hash mismatch: expected {expected:#010x}, got {actual:#010x}")]
    HashMismatch { expected: u32, actual: u32 },

    #[error("Compression error: {0}")]
    Compression(String),

    // ===== Storage Errors =====
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Storage full: {used} / {capacity} bytes")]
    StorageFull { used: u64, capacity: u64 },

    // ===== I/O Errors =====
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // ===== Serialization Errors =====
    #[error("Serialization error: {0}")]
    Serialization(String),

    // ===== Configuration Errors =====
    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl From<bincode::Error> for RingStoreError {
    fn from(err: bincode::Error) -> Self {
        RingStoreError::Serialization(err.to_string())
    }
}
