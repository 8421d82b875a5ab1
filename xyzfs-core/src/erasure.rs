//! Reed-Solomon Erasure Coding
//!
//! Encodes a whole block at once: every data shard is zero-padded to the
//! shard size and the parity shards are computed from them. Data shard
//! bytes are never modified by encoding.

use crate::error::{Result, XyzError};
use crate::{DATA_SHARDS, PARITY_SHARDS};
use rayon::prelude::*;
use reed_solomon_erasure::galois_8::ReedSolomon;
use serde::{Deserialize, Serialize};

/// Erasure coding configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErasureConfig {
    /// Number of data shards per block
    pub data_shards: usize,
    /// Number of parity shards per block
    pub parity_shards: usize,
}

impl Default for ErasureConfig {
    fn default() -> Self {
        Self {
            data_shards: DATA_SHARDS,
            parity_shards: PARITY_SHARDS,
        }
    }
}

impl ErasureConfig {
    /// Create a new erasure config
    pub fn new(data_shards: usize, parity_shards: usize) -> Result<Self> {
        if data_shards == 0 {
            return Err(XyzError::Configuration(
                "data_shards must be > 0".to_string(),
            ));
        }
        if parity_shards == 0 {
            return Err(XyzError::Configuration(
                "parity_shards must be > 0".to_string(),
            ));
        }
        Ok(Self {
            data_shards,
            parity_shards,
        })
    }

    /// Total number of shards in a block
    pub fn total_shards(&self) -> usize {
        self.data_shards + self.parity_shards
    }

    /// Maximum number of lost shards a block survives
    pub fn max_failures(&self) -> usize {
        self.parity_shards
    }
}

/// Reed-Solomon block encoder
pub struct ErasureEncoder {
    config: ErasureConfig,
    encoder: ReedSolomon,
}

impl ErasureEncoder {
    /// Create a new encoder with default configuration (10, 3)
    pub fn new() -> Result<Self> {
        Self::with_config(ErasureConfig::default())
    }

    /// Create a new encoder with custom configuration
    pub fn with_config(config: ErasureConfig) -> Result<Self> {
        let encoder = ReedSolomon::new(config.data_shards, config.parity_shards)?;
        Ok(Self { config, encoder })
    }

    pub fn config(&self) -> &ErasureConfig {
        &self.config
    }

    /// Compute parity in place.
    ///
    /// `shards` holds all data shards followed by all parity shards, every
    /// one of identical length. Only the parity entries are written.
    pub fn encode_shards(&self, shards: &mut [Vec<u8>]) -> Result<()> {
        self.check_layout(shards.len())?;
        let len = shards.first().map(Vec::len).unwrap_or(0);
        if shards.iter().any(|s| s.len() != len) {
            return Err(XyzError::ErasureCoding(
                "all shards must have the same length".to_string(),
            ));
        }
        self.encoder.encode(shards)?;
        Ok(())
    }

    /// Pad each data shard to `shard_size` and return the parity shards.
    ///
    /// Data contents shorter than `shard_size` are zero-extended on a copy;
    /// the caller's buffers are left untouched.
    pub fn encode_block(&self, data: &[&[u8]], shard_size: usize) -> Result<Vec<Vec<u8>>> {
        if data.len() != self.config.data_shards {
            return Err(XyzError::ErasureCoding(format!(
                "expected {} data shards, got {}",
                self.config.data_shards,
                data.len()
            )));
        }
        if let Some(oversized) = data.iter().find(|d| d.len() > shard_size) {
            return Err(XyzError::ErasureCoding(format!(
                "data shard of {} bytes exceeds shard size {}",
                oversized.len(),
                shard_size
            )));
        }

        let mut shards: Vec<Vec<u8>> = data
            .par_iter()
            .map(|d| {
                let mut padded = Vec::with_capacity(shard_size);
                padded.extend_from_slice(d);
                padded.resize(shard_size, 0);
                padded
            })
            .collect();
        shards.extend((0..self.config.parity_shards).map(|_| vec![0u8; shard_size]));

        self.encode_shards(&mut shards)?;
        Ok(shards.split_off(self.config.data_shards))
    }

    /// Rebuild missing shards (`None`) from the surviving ones.
    pub fn reconstruct(&self, shards: &mut [Option<Vec<u8>>]) -> Result<()> {
        self.check_layout(shards.len())?;
        let available = shards.iter().filter(|s| s.is_some()).count();
        if available < self.config.data_shards {
            return Err(XyzError::ErasureCoding(format!(
                "insufficient shards: have {}, need {}",
                available, self.config.data_shards
            )));
        }
        self.encoder.reconstruct(shards)?;
        Ok(())
    }

    /// Verify parity against data (for health checking)
    pub fn verify(&self, shards: &[Vec<u8>]) -> Result<bool> {
        self.check_layout(shards.len())?;
        Ok(self.encoder.verify(shards)?)
    }

    fn check_layout(&self, count: usize) -> Result<()> {
        if count != self.config.total_shards() {
            return Err(XyzError::ErasureCoding(format!(
                "expected {} shards, got {}",
                self.config.total_shards(),
                count
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_data(count: usize, len: usize) -> Vec<Vec<u8>> {
        (0..count)
            .map(|i| (0..len).map(|j| ((i * 31 + j) % 251) as u8).collect())
            .collect()
    }

    #[test]
    fn test_erasure_config() {
        let config = ErasureConfig::default();
        assert_eq!(config.data_shards, 10);
        assert_eq!(config.parity_shards, 3);
        assert_eq!(config.total_shards(), 13);
        assert_eq!(config.max_failures(), 3);
        assert!(ErasureConfig::new(0, 3).is_err());
    }

    #[test]
    fn test_encode_block_leaves_data_untouched() {
        let encoder = ErasureEncoder::new().unwrap();
        let data = sample_data(10, 100);
        let before = data.clone();
        let refs: Vec<&[u8]> = data.iter().map(|d| d.as_slice()).collect();

        let parity = encoder.encode_block(&refs, 128).unwrap();
        assert_eq!(parity.len(), 3);
        assert!(parity.iter().all(|p| p.len() == 128));
        assert_eq!(data, before);
    }

    #[test]
    fn test_reconstruct_after_losing_parity_count() {
        let encoder = ErasureEncoder::with_config(ErasureConfig::new(4, 2).unwrap()).unwrap();
        let data = sample_data(4, 64);
        let refs: Vec<&[u8]> = data.iter().map(|d| d.as_slice()).collect();
        let parity = encoder.encode_block(&refs, 64).unwrap();

        let mut all: Vec<Option<Vec<u8>>> = data.iter().cloned().chain(parity).map(Some).collect();
        all[1] = None;
        all[4] = None;
        encoder.reconstruct(&mut all).unwrap();
        assert_eq!(all[1].as_deref(), Some(data[1].as_slice()));
    }

    #[test]
    fn test_reconstruct_insufficient() {
        let encoder = ErasureEncoder::with_config(ErasureConfig::new(3, 2).unwrap()).unwrap();
        let mut shards: Vec<Option<Vec<u8>>> = vec![Some(vec![1; 8]), Some(vec![2; 8]), None, None, None];
        assert!(matches!(
            encoder.reconstruct(&mut shards),
            Err(XyzError::ErasureCoding(_))
        ));
    }

    #[test]
    fn test_encode_shards_and_verify() {
        let encoder = ErasureEncoder::with_config(ErasureConfig::new(3, 2).unwrap()).unwrap();
        let mut shards = sample_data(3, 32);
        shards.push(vec![0; 32]);
        shards.push(vec![0; 32]);
        encoder.encode_shards(&mut shards).unwrap();
        assert!(encoder.verify(&shards).unwrap());

        shards[0][0] ^= 0xFF;
        assert!(!encoder.verify(&shards).unwrap());
    }

    #[test]
    fn test_oversized_data_shard_rejected() {
        let encoder = ErasureEncoder::with_config(ErasureConfig::new(2, 1).unwrap()).unwrap();
        let big = vec![0u8; 20];
        let small = vec![0u8; 4];
        let refs: Vec<&[u8]> = vec![&big, &small];
        assert!(encoder.encode_block(&refs, 16).is_err());
    }
}
