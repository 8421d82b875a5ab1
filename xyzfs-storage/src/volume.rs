//! Volumes
//!
//! A volume is a storage root directory named `v=<uuid>` that owns blocks.
//! At startup every volume under the base path is recovered by scanning its
//! block sub-folders.

use crate::block::{parse_block_dir, Block};
use crate::broadcast::IndexBroadcaster;
use crate::shard::Shard;
use crate::{StorageConfig, StorageStats};
use parking_lot::RwLock;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;
use xyzfs_core::error::{Result, XyzError};

/// Directory name prefix of a volume under the volume base path
pub const VOLUME_DIR_PREFIX: &str = "v=";

pub struct Volume {
    id: Uuid,
    path: PathBuf,
    config: StorageConfig,
    broadcaster: Arc<dyn IndexBroadcaster>,
    blocks: RwLock<Vec<Arc<Block>>>,
}

impl Volume {
    /// Create a new volume directory under `base`.
    pub fn create(
        base: &Path,
        config: StorageConfig,
        broadcaster: Arc<dyn IndexBroadcaster>,
    ) -> Result<Self> {
        let id = Uuid::new_v4();
        let path = base.join(format!("{VOLUME_DIR_PREFIX}{id}"));
        fs::create_dir_all(&path)?;
        info!(volume = %id, path = ?path, "Volume created");
        Ok(Self {
            id,
            path,
            config,
            broadcaster,
            blocks: RwLock::new(Vec::new()),
        })
    }

    /// Open a volume directory and recover its blocks.
    pub fn open(
        path: &Path,
        config: StorageConfig,
        broadcaster: Arc<dyn IndexBroadcaster>,
    ) -> Result<Self> {
        let id = path
            .file_name()
            .and_then(|n| n.to_str())
            .and_then(parse_volume_dir)
            .ok_or_else(|| XyzError::InvalidArgument(format!("not a volume dir: {}", path.display())))?;

        let mut blocks = Vec::new();
        for entry in fs::read_dir(path)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let is_block = entry
                .file_name()
                .to_str()
                .and_then(parse_block_dir)
                .is_some();
            if !is_block {
                continue;
            }
            match Block::open(&entry.path(), config, broadcaster.clone()) {
                Ok(block) => blocks.push(Arc::new(block)),
                Err(e) => warn!(volume = %id, dir = ?entry.path(), error = %e, "Skipping unreadable block"),
            }
        }

        info!(volume = %id, blocks = blocks.len(), "Volume recovered");
        Ok(Self {
            id,
            path: path.to_path_buf(),
            config,
            broadcaster,
            blocks: RwLock::new(blocks),
        })
    }

    /// Recover every `v=<uuid>` directory under `base`.
    pub fn scan(
        base: &Path,
        config: StorageConfig,
        broadcaster: Arc<dyn IndexBroadcaster>,
    ) -> Result<Vec<Self>> {
        if !base.exists() {
            return Ok(Vec::new());
        }
        let mut volumes = Vec::new();
        for entry in fs::read_dir(base)? {
            let entry = entry?;
            let is_volume = entry.file_type()?.is_dir()
                && entry
                    .file_name()
                    .to_str()
                    .and_then(parse_volume_dir)
                    .is_some();
            if is_volume {
                volumes.push(Self::open(&entry.path(), config, broadcaster.clone())?);
            }
        }
        Ok(volumes)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn blocks(&self) -> Vec<Arc<Block>> {
        self.blocks.read().clone()
    }

    pub fn block(&self, id: Uuid) -> Option<Arc<Block>> {
        self.blocks.read().iter().find(|b| b.id() == id).cloned()
    }

    /// Allocate a full block (data and parity shards) in this volume.
    pub fn new_block(&self) -> Result<Arc<Block>> {
        let block = Arc::new(Block::create(&self.path, self.config, self.broadcaster.clone())?);
        self.blocks.write().push(block.clone());
        Ok(block)
    }

    /// Return the block with `id`, creating an empty one if absent.
    pub fn get_or_create_block(&self, id: Uuid) -> Arc<Block> {
        let mut blocks = self.blocks.write();
        if let Some(block) = blocks.iter().find(|b| b.id() == id) {
            return block.clone();
        }
        let block = Arc::new(Block::new(id, &self.path, self.config, self.broadcaster.clone()));
        blocks.push(block.clone());
        block
    }

    pub fn shard(&self, id: Uuid) -> Option<Arc<Shard>> {
        self.blocks.read().iter().find_map(|b| b.shard(id))
    }

    pub fn shards(&self) -> Vec<Arc<Shard>> {
        self.blocks.read().iter().flat_map(|b| b.shards()).collect()
    }

    pub fn persist(&self) -> Result<()> {
        for block in self.blocks() {
            block.persist()?;
        }
        Ok(())
    }

    pub fn stats(&self) -> Result<StorageStats> {
        let mut total = StorageStats::default();
        for block in self.blocks() {
            total.merge(&block.stats()?);
        }
        Ok(total)
    }
}

/// Parse `v=<uuid>` into the volume ID
pub fn parse_volume_dir(name: &str) -> Option<Uuid> {
    name.strip_prefix(VOLUME_DIR_PREFIX)
        .and_then(|id| Uuid::parse_str(id).ok())
}
