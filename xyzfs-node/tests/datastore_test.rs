//! Single-node datastore behaviour: placement, lookup and recovery from disk

use parking_lot::Mutex;
use std::sync::Arc;
use tempfile::TempDir;
use uuid::Uuid;
use xyzfs_core::{ErasureConfig, XyzError};
use xyzfs_node::{Datastore, DatastoreConfig, Membership, NodeMetrics, NodeRouter, LOCAL_NODE};
use xyzfs_storage::{IndexBroadcaster, ShardIndex, StorageConfig};

/// No peers; this node is 127.0.0.1
struct Alone;

impl Membership for Alone {
    fn nodes(&self) -> Vec<String> {
        Vec::new()
    }

    fn is_fresh(&self, _node: &str) -> bool {
        false
    }

    fn is_local(&self, node: &str) -> bool {
        node == "127.0.0.1" || node == "localhost"
    }

    fn local_node(&self) -> String {
        "127.0.0.1".to_string()
    }
}

#[derive(Default)]
struct Recorded(Mutex<Vec<Uuid>>);

impl IndexBroadcaster for Recorded {
    fn broadcast_index(&self, shard_id: Uuid, index_bytes: Vec<u8>) {
        assert_eq!(ShardIndex::from_bytes(&index_bytes).unwrap().shard_id(), shard_id);
        self.0.lock().push(shard_id);
    }
}

fn config(dir: &TempDir) -> DatastoreConfig {
    let storage = StorageConfig::default()
        .with_shard_size(64 * 1024)
        .with_erasure(ErasureConfig::new(3, 2).unwrap());
    DatastoreConfig::new(dir.path().join("data"), storage)
        .with_max_file_size(32 * 1024)
        .with_replicas(1)
}

fn open(dir: &TempDir, broadcaster: Arc<dyn IndexBroadcaster>) -> Arc<Datastore> {
    Datastore::open(
        config(dir),
        broadcaster,
        NodeRouter::new(Arc::new(Alone)),
        NodeMetrics::new("datastore-test"),
    )
    .unwrap()
}

fn content(len: usize, seed: u8) -> Vec<u8> {
    (0..len).map(|i| (i as u8).wrapping_mul(7).wrapping_add(seed)).collect()
}

#[tokio::test]
async fn test_local_write_locate_and_read() {
    let dir = TempDir::new().unwrap();
    let broadcasts = Arc::new(Recorded::default());
    let store = open(&dir, broadcasts.clone());

    let a = content(10_000, 1);
    let b = content(20_000, 2);
    let meta_a = store.add_file("/docs/a.bin", a.clone()).await.unwrap();
    let meta_b = store.add_file("/docs/b.bin", b.clone()).await.unwrap();

    assert_eq!(meta_a.size, 10_000);
    assert_eq!(meta_a.start_offset, 0);
    assert_eq!(meta_b.start_offset, 10_000);
    assert_eq!(broadcasts.0.lock().len(), 2);

    let (read, from_memory) = store.read_local_file("/docs/b.bin").unwrap();
    assert_eq!(read, b);
    assert!(from_memory);

    let located = store.locate_file("/docs/a.bin").unwrap();
    assert_eq!(located.shards.len(), 1);
    assert_eq!(located.scanned as usize, store.local_shards().len());

    match store.locate_file("/docs/missing.bin") {
        Err(XyzError::FileNotFound { scanned, .. }) => {
            assert_eq!(scanned as usize, store.local_shards().len())
        }
        other => panic!("unexpected {other:?}"),
    }

    let shard_id = located.shards[0];
    let locations = store.shard_by_id_str(&shard_id.to_string()).unwrap();
    assert_eq!(locations.len(), 1);
    assert_eq!(locations[0].node, LOCAL_NODE);
    assert!(locations[0].local);
    assert_eq!(store.shard_locations().len(), store.local_shards().len());
}

#[tokio::test]
async fn test_files_survive_reopen() {
    let dir = TempDir::new().unwrap();
    let data = content(12_345, 9);
    let shard_id = {
        let store = open(&dir, Arc::new(Recorded::default()));
        store.add_file("/keep/me.bin", data.clone()).await.unwrap();
        store.flush().unwrap();
        store.locate_file("/keep/me.bin").unwrap().shards[0]
    };

    let store = open(&dir, Arc::new(Recorded::default()));
    assert_eq!(store.volumes().len(), 1);
    let shard = store.local_shard_by_id_str(&shard_id.to_string()).unwrap();
    assert!(!shard.is_loaded());

    let (read, from_memory) = store.read_local_file("/keep/me.bin").unwrap();
    assert_eq!(read, data);
    assert!(!from_memory);

    let stats = store.stats().unwrap();
    assert_eq!(stats.file_count, 1);
    assert_eq!(stats.bytes_used, 12_345);
}

#[tokio::test]
async fn test_writes_fill_shards_then_new_block() {
    let dir = TempDir::new().unwrap();
    let store = open(&dir, Arc::new(Recorded::default()));

    // 3 data shards of 64 KiB hold 6 files of 30 000 bytes
    for i in 0..7 {
        store
            .add_file(&format!("/fill/{i}"), content(30_000, i as u8))
            .await
            .unwrap();
    }
    let blocks: usize = store.volumes().iter().map(|v| v.blocks().len()).sum();
    assert_eq!(blocks, 2);

    for i in 0..7 {
        let (read, _) = store.read_local_file(&format!("/fill/{i}")).unwrap();
        assert_eq!(read, content(30_000, i as u8));
    }
}
