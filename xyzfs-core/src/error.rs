//! Error types for xyzFS
//!
//! Provides a unified error type for storage, transport and gossip operations.

use thiserror::Error;

/// Result type alias for xyzFS operations
pub type Result<T> = std::result::Result<T, XyzError>;

/// Unified error type for xyzFS
#[derive(Error, Debug)]
pub enum XyzError {
    // ===== Transient / Retryable Errors =====
    #[error("Connection error to {node}: {reason}")]
    Connection { node: String, reason: String },

    #[error("Ack checksum mismatch from {node}: expected {expected:#010x}, got {actual:#010x}")]
    AckChecksumMismatch {
        node: String,
        expected: u32,
        actual: u32,
    },

    #[error("Timed out waiting for {node}")]
    Timeout { node: String },

    // ===== Protocol / Format Errors =====
    #[error("Malformed message: {0}")]
    MalformedMessage(String),

    #[error("Invalid shard header: {0}")]
    InvalidShardHeader(String),

    #[error("Corrupt data: {0}")]
    CorruptData(String),

    #[error("Checksum mismatch: expected {expected:#010x}, got {actual:#010x}")]
    ChecksumMismatch { expected: u32, actual: u32 },

    // ===== Capacity / Validation Errors =====
    #[error("File too large: {size} bytes (max: {max})")]
    FileTooLarge { size: u64, max: u64 },

    #[error("Shard {shard} full: requested {requested} bytes, {available} available")]
    ShardFull {
        shard: String,
        requested: u64,
        available: u64,
    },

    #[error("Capacity error: {0}")]
    Capacity(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    // ===== Not Found Errors =====
    #[error("File not found: {name} (scanned {scanned} indices)")]
    FileNotFound { name: String, scanned: u32 },

    #[error("Shard not found: {0}")]
    ShardNotFound(String),

    #[error("Block not found: {0}")]
    BlockNotFound(String),

    // ===== Remote Errors =====
    #[error("Peer {node} rejected request: {message}")]
    Remote { node: String, message: String },

    // ===== Routing Errors =====
    #[error("No available node")]
    NoAvailableNode,

    // ===== Invariant Errors =====
    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    // ===== Erasure Coding Errors =====
    #[error("Erasure coding error: {0}")]
    ErasureCoding(String),

    // ===== I/O Errors =====
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // ===== Serialization Errors =====
    #[error("Serialization error: {0}")]
    Serialization(String),

    // ===== Configuration Errors =====
    #[error("Configuration error: {0}")]
    Configuration(String),

    // ===== Generic Errors =====
    #[error("Internal error: {0}")]
    Internal(String),
}

impl XyzError {
    /// Shorthand for a connection failure.
    pub fn connection(node: impl Into<String>, reason: impl ToString) -> Self {
        XyzError::Connection {
            node: node.into(),
            reason: reason.to_string(),
        }
    }

    /// Whether a fresh attempt on another connection may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            XyzError::Connection { .. }
                | XyzError::AckChecksumMismatch { .. }
                | XyzError::Timeout { .. }
                | XyzError::Io(_)
        )
    }

    /// Whether the error reports a missing file, shard or block.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            XyzError::FileNotFound { .. } | XyzError::ShardNotFound(_) | XyzError::BlockNotFound(_)
        )
    }
}

impl From<reed_solomon_erasure::Error> for XyzError {
    fn from(err: reed_solomon_erasure::Error) -> Self {
        XyzError::ErasureCoding(err.to_string())
    }
}

impl From<bincode::Error> for XyzError {
    fn from(err: bincode::Error) -> Self {
        XyzError::Serialization(err.to_string())
    }
}

impl From<serde_json::Error> for XyzError {
    fn from(err: serde_json::Error) -> Self {
        XyzError::Serialization(err.to_string())
    }
}

impl From<uuid::Error> for XyzError {
    fn from(err: uuid::Error) -> Self {
        XyzError::InvalidArgument(err.to_string())
    }
}
