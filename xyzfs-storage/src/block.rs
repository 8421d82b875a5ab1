//! Blocks
//!
//! A block groups up to `D` data shards and `P` parity shards that are
//! erasure-coded together. Blocks are created empty and populated through
//! explicit shard registration.

use crate::broadcast::IndexBroadcaster;
use crate::shard::{Shard, ShardDescriptor};
use crate::{StorageConfig, StorageStats};
use parking_lot::RwLock;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;
use xyzfs_core::error::{Result, XyzError};
use xyzfs_core::ErasureEncoder;

/// Directory name prefix of a block inside its volume
pub const BLOCK_DIR_PREFIX: &str = "b=";

pub struct Block {
    id: Uuid,
    dir: PathBuf,
    config: StorageConfig,
    broadcaster: Arc<dyn IndexBroadcaster>,
    data: RwLock<Vec<Arc<Shard>>>,
    parity: RwLock<Vec<Arc<Shard>>>,
}

impl std::fmt::Debug for Block {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Block")
            .field("id", &self.id)
            .field("dir", &self.dir)
            .field("data_shards", &self.data.read().len())
            .field("parity_shards", &self.parity.read().len())
            .finish()
    }
}

impl Block {
    /// Empty block living in `<volume_dir>/b=<id>`.
    pub fn new(
        id: Uuid,
        volume_dir: &Path,
        config: StorageConfig,
        broadcaster: Arc<dyn IndexBroadcaster>,
    ) -> Self {
        Self {
            id,
            dir: volume_dir.join(format!("{BLOCK_DIR_PREFIX}{id}")),
            config,
            broadcaster,
            data: RwLock::new(Vec::new()),
            parity: RwLock::new(Vec::new()),
        }
    }

    /// New block with every data and parity shard allocated.
    pub fn create(
        volume_dir: &Path,
        config: StorageConfig,
        broadcaster: Arc<dyn IndexBroadcaster>,
    ) -> Result<Self> {
        let block = Self::new(Uuid::new_v4(), volume_dir, config, broadcaster);
        for _ in 0..config.erasure.data_shards {
            block.new_shard(false)?;
        }
        for _ in 0..config.erasure.parity_shards {
            block.new_shard(true)?;
        }
        info!(block = %block.id, dir = ?block.dir, "Block created");
        Ok(block)
    }

    /// Recover a block from its directory; shards stay unloaded.
    pub fn open(
        dir: &Path,
        config: StorageConfig,
        broadcaster: Arc<dyn IndexBroadcaster>,
    ) -> Result<Self> {
        let name = dir
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| XyzError::InvalidArgument(format!("block dir {}", dir.display())))?;
        let id = parse_block_dir(name)
            .ok_or_else(|| XyzError::InvalidArgument(format!("not a block dir: {name}")))?;
        let parent = dir.parent().unwrap_or(Path::new("."));
        let block = Self::new(id, parent, config, broadcaster);

        let mut descriptors: Vec<ShardDescriptor> = Vec::new();
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let file_name = entry.file_name();
            let Some(name) = file_name.to_str() else {
                continue;
            };
            match ShardDescriptor::parse_file_name(id, name) {
                Some(d) => descriptors.push(d),
                None => debug!(block = %id, file = name, "Skipping non-shard file"),
            }
        }
        descriptors.sort_by_key(|d| d.block_index);

        for d in descriptors {
            let shard = Shard::open(d, &block.dir, config.shard_size, block.broadcaster.clone());
            block.register_shard(Arc::new(shard))?;
        }
        debug!(block = %id, shards = block.shard_count(), "Block opened");
        Ok(block)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn config(&self) -> &StorageConfig {
        &self.config
    }

    /// Register a shard; fails when the block already holds its quota.
    pub fn register_shard(&self, shard: Arc<Shard>) -> Result<()> {
        let (list, max, kind) = if shard.is_parity() {
            (&self.parity, self.config.erasure.parity_shards, "parity")
        } else {
            (&self.data, self.config.erasure.data_shards, "data")
        };
        let mut list = list.write();
        if list.len() >= max {
            return Err(XyzError::InvariantViolation(format!(
                "block {} already holds {} {} shards",
                self.id, max, kind
            )));
        }
        if list.iter().any(|s| s.id() == shard.id()) {
            return Err(XyzError::InvariantViolation(format!(
                "shard {} registered twice in block {}",
                shard.id(),
                self.id
            )));
        }
        list.push(shard);
        Ok(())
    }

    /// Allocate and register a fresh shard at the next free block index.
    pub fn new_shard(&self, parity: bool) -> Result<Arc<Shard>> {
        self.new_shard_with_id(Uuid::new_v4(), parity)
    }

    /// Allocate a fresh shard with a caller-chosen ID (replica placement).
    pub fn new_shard_with_id(&self, id: Uuid, parity: bool) -> Result<Arc<Shard>> {
        let block_index = self.next_block_index(parity);
        let descriptor = ShardDescriptor {
            id,
            block_id: self.id,
            block_index,
            parity,
        };
        let shard = Arc::new(Shard::new(
            descriptor,
            &self.dir,
            self.config.shard_size,
            self.broadcaster.clone(),
        ));
        self.register_shard(shard.clone())?;
        Ok(shard)
    }

    fn next_block_index(&self, parity: bool) -> u32 {
        if parity {
            let taken: Vec<u32> = self.parity.read().iter().map(|s| s.block_index()).collect();
            let base = self.config.erasure.data_shards as u32;
            (base..).find(|i| !taken.contains(i)).unwrap_or(base)
        } else {
            let taken: Vec<u32> = self.data.read().iter().map(|s| s.block_index()).collect();
            (0..).find(|i| !taken.contains(i)).unwrap_or(0)
        }
    }

    /// Data shards ordered by block index
    pub fn data_shards(&self) -> Vec<Arc<Shard>> {
        let mut shards = self.data.read().clone();
        shards.sort_by_key(|s| s.block_index());
        shards
    }

    /// Parity shards ordered by block index
    pub fn parity_shards(&self) -> Vec<Arc<Shard>> {
        let mut shards = self.parity.read().clone();
        shards.sort_by_key(|s| s.block_index());
        shards
    }

    pub fn shards(&self) -> Vec<Arc<Shard>> {
        let mut all = self.data_shards();
        all.extend(self.parity_shards());
        all
    }

    pub fn shard_count(&self) -> usize {
        self.data.read().len() + self.parity.read().len()
    }

    pub fn shard(&self, id: Uuid) -> Option<Arc<Shard>> {
        self.data
            .read()
            .iter()
            .chain(self.parity.read().iter())
            .find(|s| s.id() == id)
            .cloned()
    }

    /// Ensure the directory exists and persist every shard.
    pub fn persist(&self) -> Result<()> {
        fs::create_dir_all(&self.dir)?;
        for shard in self.shards() {
            shard.persist()?;
        }
        debug!(block = %self.id, "Block persisted");
        Ok(())
    }

    /// Compute parity from the data shards and store it in the parity shards.
    ///
    /// Data shards are padded to the shard size on a copy and left unchanged.
    pub fn erasure_encode(&self) -> Result<()> {
        let (data, parity) = self.full_layout()?;
        let contents: Vec<Vec<u8>> = data
            .iter()
            .map(|s| s.contents_bytes())
            .collect::<Result<_>>()?;
        let refs: Vec<&[u8]> = contents.iter().map(Vec::as_slice).collect();

        let encoder = ErasureEncoder::with_config(self.config.erasure)?;
        let encoded = encoder.encode_block(&refs, self.config.shard_size as usize)?;
        for (shard, bytes) in parity.iter().zip(encoded) {
            shard.set_parity_contents(bytes)?;
        }
        info!(block = %self.id, "Block parity computed");
        Ok(())
    }

    /// Rebuild the padded contents of every data shard.
    ///
    /// Shards whose contents cannot be read are treated as lost. Fails with
    /// `CorruptData` when the rebuilt shards do not form a consistent stripe.
    pub fn recover_data_contents(&self) -> Result<Vec<Vec<u8>>> {
        let (data, parity) = self.full_layout()?;
        let size = self.config.shard_size as usize;
        let mut slots: Vec<Option<Vec<u8>>> = data
            .iter()
            .chain(parity.iter())
            .map(|shard| match shard.contents_bytes() {
                Ok(mut bytes) if bytes.len() <= size => {
                    if shard.is_parity() && bytes.len() != size {
                        return None;
                    }
                    bytes.resize(size, 0);
                    Some(bytes)
                }
                Ok(_) => None,
                Err(e) => {
                    warn!(block = %self.id, shard = %shard.id(), error = %e, "Shard unreadable");
                    None
                }
            })
            .collect();

        let encoder = ErasureEncoder::with_config(self.config.erasure)?;
        encoder.reconstruct(&mut slots)?;
        let mut shards: Vec<Vec<u8>> = slots
            .into_iter()
            .map(|s| s.ok_or_else(|| XyzError::ErasureCoding("reconstruction failed".into())))
            .collect::<Result<_>>()?;

        // Surviving shards beyond the ones decoded from must agree with the result.
        if !encoder.verify(&shards)? {
            return Err(XyzError::CorruptData(format!(
                "block {} parity does not match recovered data",
                self.id
            )));
        }
        shards.truncate(self.config.erasure.data_shards);
        Ok(shards)
    }

    fn full_layout(&self) -> Result<(Vec<Arc<Shard>>, Vec<Arc<Shard>>)> {
        let data = self.data_shards();
        let parity = self.parity_shards();
        if data.len() != self.config.erasure.data_shards
            || parity.len() != self.config.erasure.parity_shards
        {
            return Err(XyzError::InvariantViolation(format!(
                "block {} has {}+{} shards, erasure coding needs {}+{}",
                self.id,
                data.len(),
                parity.len(),
                self.config.erasure.data_shards,
                self.config.erasure.parity_shards
            )));
        }
        Ok((data, parity))
    }

    pub fn stats(&self) -> Result<StorageStats> {
        let mut stats = StorageStats {
            block_count: 1,
            ..Default::default()
        };
        for shard in self.data_shards() {
            stats.shard_count += 1;
            stats.file_count += shard.file_count()? as u64;
            stats.bytes_used += shard.used_bytes()? as u64;
            stats.bytes_capacity += shard.shard_size() as u64;
        }
        stats.shard_count += self.parity.read().len() as u64;
        Ok(stats)
    }
}

/// Parse `b=<uuid>` into the block ID
pub fn parse_block_dir(name: &str) -> Option<Uuid> {
    name.strip_prefix(BLOCK_DIR_PREFIX)
        .and_then(|id| Uuid::parse_str(id).ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broadcast::NoopBroadcaster;
    use tempfile::TempDir;
    use xyzfs_core::{ErasureConfig, FileMeta};

    fn small_config() -> StorageConfig {
        StorageConfig::default()
            .with_shard_size(4096)
            .with_erasure(ErasureConfig::new(4, 2).unwrap())
    }

    #[test]
    fn test_register_beyond_capacity() {
        let dir = TempDir::new().unwrap();
        let block = Block::create(dir.path(), small_config(), Arc::new(NoopBroadcaster)).unwrap();
        assert_eq!(block.shard_count(), 6);
        assert!(matches!(
            block.new_shard(false),
            Err(XyzError::InvariantViolation(_))
        ));
        assert!(matches!(
            block.new_shard(true),
            Err(XyzError::InvariantViolation(_))
        ));
    }

    #[test]
    fn test_block_indices() {
        let dir = TempDir::new().unwrap();
        let block = Block::create(dir.path(), small_config(), Arc::new(NoopBroadcaster)).unwrap();
        let indices: Vec<u32> = block.shards().iter().map(|s| s.block_index()).collect();
        assert_eq!(indices, vec![0, 1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_erasure_keeps_data_shards() {
        let dir = TempDir::new().unwrap();
        let block = Block::create(dir.path(), small_config(), Arc::new(NoopBroadcaster)).unwrap();
        for (i, shard) in block.data_shards().iter().enumerate() {
            shard
                .add_file(FileMeta::new(format!("/e/{i}")), &vec![i as u8 + 1; 100 * (i + 1)])
                .unwrap();
        }
        let before: Vec<Vec<u8>> = block
            .data_shards()
            .iter()
            .map(|s| s.contents_bytes().unwrap())
            .collect();

        block.erasure_encode().unwrap();

        let after: Vec<Vec<u8>> = block
            .data_shards()
            .iter()
            .map(|s| s.contents_bytes().unwrap())
            .collect();
        assert_eq!(before, after);
        for parity in block.parity_shards() {
            assert_eq!(parity.used_bytes().unwrap(), 4096);
        }
    }

    #[test]
    fn test_open_recovers_layout() {
        let dir = TempDir::new().unwrap();
        let config = small_config();
        let block = Block::create(dir.path(), config, Arc::new(NoopBroadcaster)).unwrap();
        block.data_shards()[2]
            .add_file(FileMeta::new("/o/file"), b"open me")
            .unwrap();
        block.persist().unwrap();

        let reopened = Block::open(block.dir(), config, Arc::new(NoopBroadcaster)).unwrap();
        assert_eq!(reopened.id(), block.id());
        assert_eq!(reopened.data_shards().len(), 4);
        assert_eq!(reopened.parity_shards().len(), 2);
        let shard = reopened.data_shards()[2].clone();
        assert!(!shard.is_loaded());
        assert_eq!(shard.read_file("/o/file").unwrap().0, b"open me");
    }

    #[test]
    fn test_recover_lost_data_shard() {
        let dir = TempDir::new().unwrap();
        let block = Block::create(dir.path(), small_config(), Arc::new(NoopBroadcaster)).unwrap();
        for (i, shard) in block.data_shards().iter().enumerate() {
            shard
                .add_file(FileMeta::new(format!("/r/{i}")), format!("payload {i}").as_bytes())
                .unwrap();
        }
        block.erasure_encode().unwrap();
        block.persist().unwrap();

        let lost = block.data_shards()[1].clone();
        let expected = lost.contents_bytes().unwrap();
        lost.unload().unwrap();
        fs::remove_file(lost.file_path()).unwrap();

        let recovered = block.recover_data_contents().unwrap();
        assert_eq!(recovered.len(), 4);
        assert_eq!(&recovered[1][..expected.len()], expected.as_slice());
        assert!(recovered[1][expected.len()..].iter().all(|b| *b == 0));
    }

    #[test]
    fn test_recover_rejects_inconsistent_parity() {
        let dir = TempDir::new().unwrap();
        let block = Block::create(dir.path(), small_config(), Arc::new(NoopBroadcaster)).unwrap();
        for (i, shard) in block.data_shards().iter().enumerate() {
            shard
                .add_file(FileMeta::new(format!("/c/{i}")), format!("payload {i}").as_bytes())
                .unwrap();
        }
        block.erasure_encode().unwrap();
        assert_eq!(block.recover_data_contents().unwrap().len(), 4);

        block.parity_shards()[1]
            .set_parity_contents(vec![0xAB; 4096])
            .unwrap();
        block.persist().unwrap();
        let lost = block.data_shards()[1].clone();
        lost.unload().unwrap();
        fs::remove_file(lost.file_path()).unwrap();

        assert!(matches!(
            block.recover_data_contents(),
            Err(XyzError::CorruptData(_))
        ));
    }
}
