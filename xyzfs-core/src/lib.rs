//! xyzFS Core Library
//!
//! Shared building blocks for the xyzFS distributed object store.
//! This crate provides:
//! - Reed-Solomon erasure coding over whole blocks (10 data + 3 parity shards)
//! - CRC32 (Castagnoli) checksums used on disk and on the wire
//! - File metadata records packed into shards
//! - A rolling performance profiler for peer connections
//! - Common error handling

pub mod checksum;
pub mod erasure;
pub mod error;
pub mod file_meta;
pub mod profiler;

pub use checksum::{crc32c, Crc32cHasher};
pub use erasure::{ErasureConfig, ErasureEncoder};
pub use error::{Result, XyzError};
pub use file_meta::FileMeta;
pub use profiler::{Measurement, PerformanceProfiler, PerformanceStats};

/// Default erasure coding configuration
/// - 10 data shards hold packed file contents
/// - 3 parity shards protect the block
pub const DATA_SHARDS: usize = 10;
pub const PARITY_SHARDS: usize = 3;
pub const TOTAL_SHARDS: usize = DATA_SHARDS + PARITY_SHARDS;

/// Default shard capacity
pub const SHARD_SIZE: u32 = 32 * 1024 * 1024; // 32 MB

/// Largest single file accepted by a node
pub const MAX_FILE_SIZE: u64 = SHARD_SIZE as u64;

/// Current unix time in whole seconds
pub fn unix_now() -> u64 {
    chrono::Utc::now().timestamp().max(0) as u64
}
