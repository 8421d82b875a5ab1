//! Bloom filter
//!
//! Bit array with `k` probe positions derived from a single Blake3 digest by
//! double hashing. Probe positions depend only on the key, the bit count and
//! the hash count, so filters built on different nodes agree.

use serde::{Deserialize, Serialize};
use xyzfs_core::error::{Result, XyzError};

/// Expected items per shard index
pub const DEFAULT_EXPECTED_ITEMS: u64 = 1_000_000;

/// Target false positive rate per shard index
pub const DEFAULT_FALSE_POSITIVE_RATE: f64 = 0.01;

/// Probabilistic set membership over strings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BloomFilter {
    num_bits: u64,
    num_hashes: u32,
    bits: Vec<u8>,
}

impl BloomFilter {
    /// Create a filter with an explicit bit count and hash count.
    pub fn new(num_bits: u64, num_hashes: u32) -> Self {
        let num_bits = num_bits.max(8);
        let num_hashes = num_hashes.max(1);
        Self {
            num_bits,
            num_hashes,
            bits: vec![0u8; num_bits.div_ceil(8) as usize],
        }
    }

    /// Size a filter for `expected_items` at false positive rate `fp_rate`.
    ///
    /// One million items at 1% gives 9,585,059 bits and 7 hashes.
    pub fn with_rate(expected_items: u64, fp_rate: f64) -> Self {
        let n = expected_items.max(1) as f64;
        let ln2 = std::f64::consts::LN_2;
        let m = (-n * fp_rate.ln() / (ln2 * ln2)).ceil();
        let k = (m / n * ln2).ceil();
        Self::new(m as u64, k as u32)
    }

    pub fn num_bits(&self) -> u64 {
        self.num_bits
    }

    pub fn num_hashes(&self) -> u32 {
        self.num_hashes
    }

    pub fn add(&mut self, key: &str) {
        for bit in self.positions(key) {
            self.bits[(bit / 8) as usize] |= 1 << (bit % 8);
        }
    }

    /// `false` means definitely absent; `true` means probably present.
    pub fn contains(&self, key: &str) -> bool {
        self.positions(key)
            .all(|bit| self.bits[(bit / 8) as usize] & (1 << (bit % 8)) != 0)
    }

    /// Number of set bits
    pub fn count_ones(&self) -> u64 {
        self.bits.iter().map(|b| b.count_ones() as u64).sum()
    }

    pub fn clear(&mut self) {
        self.bits.iter_mut().for_each(|b| *b = 0);
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let filter: Self = bincode::deserialize(bytes)?;
        if filter.num_bits == 0
            || filter.num_hashes == 0
            || filter.bits.len() as u64 != filter.num_bits.div_ceil(8)
        {
            return Err(XyzError::CorruptData(format!(
                "bloom filter with {} bits, {} hashes and {} bytes",
                filter.num_bits,
                filter.num_hashes,
                filter.bits.len()
            )));
        }
        Ok(filter)
    }

    fn positions(&self, key: &str) -> impl Iterator<Item = u64> {
        let digest = blake3::hash(key.as_bytes());
        let bytes = digest.as_bytes();
        let mut lo = [0u8; 8];
        let mut hi = [0u8; 8];
        lo.copy_from_slice(&bytes[..8]);
        hi.copy_from_slice(&bytes[8..16]);
        let h1 = u64::from_le_bytes(lo);
        let h2 = u64::from_le_bytes(hi) | 1;
        let m = self.num_bits;
        (0..self.num_hashes as u64).map(move |i| h1.wrapping_add(i.wrapping_mul(h2)) % m)
    }
}

impl Default for BloomFilter {
    fn default() -> Self {
        Self::with_rate(DEFAULT_EXPECTED_ITEMS, DEFAULT_FALSE_POSITIVE_RATE)
    }
}
