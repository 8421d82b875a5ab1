//! xyzFS Storage Engine
//!
//! Shard-based storage with Bloom-filter indices:
//! - `Shard` packs files into one append-only buffer with a binary on-disk format
//! - `ShardIndex` answers "might this shard hold file X" without touching contents
//! - `Block` groups data and parity shards for erasure coding
//! - `Volume` is a storage root recovered by scanning its directory

pub mod block;
pub mod bloom;
pub mod broadcast;
pub mod shard;
pub mod shard_file_meta;
pub mod shard_index;
pub mod shard_meta;
pub mod volume;

pub use block::Block;
pub use bloom::BloomFilter;
pub use broadcast::{IndexBroadcaster, NoopBroadcaster};
pub use shard::{BufferMode, Shard, ShardDescriptor};
pub use shard_file_meta::ShardFileMeta;
pub use shard_index::ShardIndex;
pub use shard_meta::ShardMeta;
pub use volume::Volume;

use xyzfs_core::ErasureConfig;

/// Storage configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StorageConfig {
    /// Capacity of each shard in bytes
    pub shard_size: u32,

    /// Data/parity shard counts per block
    pub erasure: ErasureConfig,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            shard_size: xyzfs_core::SHARD_SIZE,
            erasure: ErasureConfig::default(),
        }
    }
}

impl StorageConfig {
    /// Set shard capacity
    pub fn with_shard_size(mut self, bytes: u32) -> Self {
        self.shard_size = bytes;
        self
    }

    /// Set the erasure layout
    pub fn with_erasure(mut self, erasure: ErasureConfig) -> Self {
        self.erasure = erasure;
        self
    }
}

/// Storage statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StorageStats {
    /// Number of blocks
    pub block_count: u64,

    /// Number of shards, data and parity
    pub shard_count: u64,

    /// Number of files across data shards
    pub file_count: u64,

    /// Bytes written into data shards
    pub bytes_used: u64,

    /// Total data shard capacity
    pub bytes_capacity: u64,
}

impl StorageStats {
    /// Calculate usage percentage
    pub fn usage_percent(&self) -> f64 {
        if self.bytes_capacity == 0 {
            0.0
        } else {
            (self.bytes_used as f64 / self.bytes_capacity as f64) * 100.0
        }
    }

    /// Available space in bytes
    pub fn bytes_available(&self) -> u64 {
        self.bytes_capacity.saturating_sub(self.bytes_used)
    }

    pub fn merge(&mut self, other: &StorageStats) {
        self.block_count += other.block_count;
        self.shard_count += other.shard_count;
        self.file_count += other.file_count;
        self.bytes_used += other.bytes_used;
        self.bytes_capacity += other.bytes_capacity;
    }
}
