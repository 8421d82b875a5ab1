//! Ordered list of the files packed into a shard, serialized as JSON.

use serde::{Deserialize, Serialize};
use xyzfs_core::error::Result;
use xyzfs_core::FileMeta;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardFileMeta {
    files: Vec<FileMeta>,
}

impl ShardFileMeta {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, meta: FileMeta) {
        self.files.push(meta);
    }

    /// Latest entry with the given full name
    pub fn get_by_name(&self, full_name: &str) -> Option<&FileMeta> {
        self.files.iter().rev().find(|f| f.full_name == full_name)
    }

    pub fn files(&self) -> &[FileMeta] {
        &self.files
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn clear(&mut self) {
        self.files.clear();
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}
