//! File lookup across local shards and remote shard indices
//!
//! Every peer broadcasts the Bloom-filter index of its shards. The locator
//! keeps the latest index per `(shard, node)` and answers "which shards may
//! hold this path" by testing every local and remote filter.

use parking_lot::RwLock;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;
use xyzfs_core::{Result, XyzError};
use xyzfs_storage::{Shard, ShardIndex};

/// Node name used for shards held by this process
pub const LOCAL_NODE: &str = "localhost";

/// Where a copy of a shard lives
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ShardLocation {
    pub node: String,
    pub local: bool,
}

/// Result of a successful lookup
#[derive(Debug, Clone)]
pub struct LocateResult {
    /// Shards whose index reports the path, local ones first
    pub shards: Vec<Uuid>,
    /// Number of indices tested
    pub scanned: u32,
}

#[derive(Default)]
pub struct FileLocator {
    remote_indices: RwLock<HashMap<(Uuid, String), ShardIndex>>,
    locations: RwLock<HashMap<Uuid, Vec<ShardLocation>>>,
}

impl FileLocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store the index `node` reported for one of its shards.
    pub fn load_index(&self, node: &str, index: ShardIndex) {
        let shard_id = index.shard_id();
        debug!(shard = %shard_id, node = %node, "Loading remote shard index");
        self.remote_indices
            .write()
            .insert((shard_id, node.to_string()), index);
        self.add_location(shard_id, node, false);
    }

    /// Drop every index reported by `node`.
    pub fn forget_node(&self, node: &str) {
        let mut indices = self.remote_indices.write();
        let before = indices.len();
        indices.retain(|(_, n), _| n != node);
        let removed = before - indices.len();
        drop(indices);

        let mut locations = self.locations.write();
        for list in locations.values_mut() {
            list.retain(|l| l.node != node);
        }
        locations.retain(|_, list| !list.is_empty());
        if removed > 0 {
            info!(node = %node, removed, "Forgot remote shard indices");
        }
    }

    pub fn remote_index_count(&self) -> usize {
        self.remote_indices.read().len()
    }

    /// Test `full_name` against every local shard and every remote index.
    pub fn locate(&self, local_shards: &[Arc<Shard>], full_name: &str) -> Result<LocateResult> {
        let mut shards = Vec::new();
        let mut scanned = 0u32;

        for shard in local_shards {
            scanned += 1;
            if shard.test_contains_file(full_name)? {
                shards.push(shard.id());
            }
        }

        for ((shard_id, _), index) in self.remote_indices.read().iter() {
            scanned += 1;
            if index.test(full_name) && !shards.contains(shard_id) {
                shards.push(*shard_id);
            }
        }

        if shards.is_empty() {
            return Err(XyzError::FileNotFound {
                name: full_name.to_string(),
                scanned,
            });
        }
        Ok(LocateResult { shards, scanned })
    }

    /// Shard to node mapping; local shards are registered on the way.
    pub fn shard_locations(&self, local_shards: &[Arc<Shard>]) -> BTreeMap<Uuid, Vec<ShardLocation>> {
        for shard in local_shards {
            self.add_location(shard.id(), LOCAL_NODE, true);
        }
        self.locations
            .read()
            .iter()
            .map(|(id, list)| (*id, list.clone()))
            .collect()
    }

    fn add_location(&self, shard_id: Uuid, node: &str, local: bool) {
        let mut locations = self.locations.write();
        let list = locations.entry(shard_id).or_default();
        if !list.iter().any(|l| l.node == node) {
            list.push(ShardLocation {
                node: node.to_string(),
                local,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn index_with(shard_id: Uuid, names: &[&str]) -> ShardIndex {
        let mut index = ShardIndex::new(shard_id);
        for name in names {
            index.add(name);
        }
        index
    }

    #[test]
    fn test_locate_remote() {
        let locator = FileLocator::new();
        let shard = Uuid::new_v4();
        locator.load_index("10.0.0.2", index_with(shard, &["/a.txt"]));

        let found = locator.locate(&[], "/a.txt").unwrap();
        assert_eq!(found.shards, vec![shard]);
        assert_eq!(found.scanned, 1);

        match locator.locate(&[], "/missing.txt") {
            Err(XyzError::FileNotFound { name, scanned }) => {
                assert_eq!(name, "/missing.txt");
                assert_eq!(scanned, 1);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_same_shard_on_two_nodes() {
        let locator = FileLocator::new();
        let shard = Uuid::new_v4();
        locator.load_index("10.0.0.2", index_with(shard, &["/a.txt"]));
        locator.load_index("10.0.0.3", index_with(shard, &["/a.txt"]));
        locator.load_index("10.0.0.3", index_with(shard, &["/a.txt", "/b.txt"]));

        assert_eq!(locator.remote_index_count(), 2);
        let found = locator.locate(&[], "/a.txt").unwrap();
        assert_eq!(found.shards, vec![shard]);
        assert_eq!(found.scanned, 2);

        let locations = locator.shard_locations(&[]);
        assert_eq!(locations[&shard].len(), 2);
        assert!(locations[&shard].iter().all(|l| !l.local));
    }

    #[test]
    fn test_forget_node() {
        let locator = FileLocator::new();
        let shard = Uuid::new_v4();
        locator.load_index("10.0.0.2", index_with(shard, &["/a.txt"]));
        locator.forget_node("10.0.0.2");
        assert_eq!(locator.remote_index_count(), 0);
        assert!(locator.shard_locations(&[]).is_empty());
        assert!(locator.locate(&[], "/a.txt").is_err());
    }
}
