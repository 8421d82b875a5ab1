//! Shard index
//!
//! A Bloom filter over the full names of the files packed into one shard,
//! tagged with the shard ID. Indices are exchanged between nodes so a file
//! can be located without asking every peer.
//!
//! Byte layout (big-endian):
//! `u32 bloom_len | bloom bytes | u32 id_len | id bytes`

use crate::bloom::BloomFilter;
use bytes::{Buf, BufMut};
use uuid::Uuid;
use xyzfs_core::error::{Result, XyzError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardIndex {
    shard_id: Uuid,
    bloom: BloomFilter,
}

impl ShardIndex {
    /// Empty index sized for one million files at 1% false positives
    pub fn new(shard_id: Uuid) -> Self {
        Self::with_filter(shard_id, BloomFilter::default())
    }

    pub fn with_filter(shard_id: Uuid, bloom: BloomFilter) -> Self {
        Self { shard_id, bloom }
    }

    pub fn shard_id(&self) -> Uuid {
        self.shard_id
    }

    pub fn add(&mut self, full_name: &str) {
        self.bloom.add(full_name);
    }

    pub fn test(&self, full_name: &str) -> bool {
        self.bloom.contains(full_name)
    }

    pub fn reset(&mut self) {
        self.bloom.clear();
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let bloom = self.bloom.to_bytes()?;
        let id = self.shard_id.as_bytes();
        let mut buf = Vec::with_capacity(8 + bloom.len() + id.len());
        buf.put_u32(bloom.len() as u32);
        buf.put_slice(&bloom);
        buf.put_u32(id.len() as u32);
        buf.put_slice(id);
        Ok(buf)
    }

    pub fn from_bytes(mut bytes: &[u8]) -> Result<Self> {
        let bloom_len = read_len(&mut bytes, "bloom")?;
        let bloom = BloomFilter::from_bytes(&bytes[..bloom_len])?;
        bytes.advance(bloom_len);

        let id_len = read_len(&mut bytes, "shard id")?;
        let shard_id = Uuid::from_slice(&bytes[..id_len])
            .map_err(|e| XyzError::CorruptData(format!("shard index id: {e}")))?;
        Ok(Self { shard_id, bloom })
    }
}

/// Read a u32 length prefix and check that many bytes follow.
fn read_len(bytes: &mut &[u8], what: &str) -> Result<usize> {
    if bytes.remaining() < 4 {
        return Err(XyzError::CorruptData(format!(
            "shard index truncated before {what} length"
        )));
    }
    let len = bytes.get_u32() as usize;
    if bytes.remaining() < len {
        return Err(XyzError::CorruptData(format!(
            "shard index {what} needs {len} bytes, {} left",
            bytes.remaining()
        )));
    }
    Ok(len)
}
