//! Two full nodes on 127.0.0.1 and 127.0.0.2 sharing one set of ports

use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use xyzfs_node::{AppContext, NodeConfig};

fn free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

struct Ports {
    gossip: u16,
    binary: u16,
    udp: u16,
}

impl Ports {
    fn free() -> Self {
        let udp = std::net::UdpSocket::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();
        Self {
            gossip: free_port(),
            binary: free_port(),
            udp,
        }
    }
}

fn node_config(host: &str, ports: &Ports, dir: &TempDir, seeds: &[&str]) -> NodeConfig {
    let mut config = NodeConfig::default();
    config.node.bind_address = host.to_string();
    config.node.seeds = seeds.iter().map(|s| s.to_string()).collect();
    config.network.gossip_port = ports.gossip;
    config.network.binary_port = ports.binary;
    config.network.binary_udp_port = ports.udp;
    config.network.dial_attempts = 3;
    config.network.dial_backoff_ms = 50;
    config.network.checkout_timeout_ms = 50;
    config.network.response_timeout_secs = 5;
    config.storage.meta_path = dir.path().join("meta");
    config.storage.volume_path = dir.path().join("data");
    config.storage.data_shards = 2;
    config.storage.parity_shards = 1;
    config.storage.shard_size = 1024 * 1024;
    config.storage.max_file_size = 512 * 1024;
    config.storage.replicas = 1;
    config.gossip.tick_interval_ms = 100;
    config.transfer.chunk_size = 4096;
    config.validate().unwrap();
    config
}

async fn eventually<F: Fn() -> bool>(what: &str, check: F) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(15);
    while !check() {
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

async fn cluster() -> (Arc<AppContext>, Arc<AppContext>, TempDir, TempDir) {
    let ports = Ports::free();
    let (dir_a, dir_b) = (TempDir::new().unwrap(), TempDir::new().unwrap());
    let a = AppContext::build(node_config("127.0.0.1", &ports, &dir_a, &["127.0.0.2"])).unwrap();
    let b = AppContext::build(node_config("127.0.0.2", &ports, &dir_b, &[])).unwrap();
    b.start().await.unwrap();
    a.start().await.unwrap();

    eventually("handshake", || {
        a.gossip().is_fresh("127.0.0.2") && b.gossip().is_fresh("127.0.0.1")
    })
    .await;
    (a, b, dir_a, dir_b)
}

fn content(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 13 % 251) as u8).collect()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_write_is_forwarded_and_replicated() {
    let (a, b, _dir_a, _dir_b) = cluster().await;

    // With one fresh peer the router always forwards to it.
    let data = content(50_000);
    let meta = a
        .datastore()
        .add_file("/cluster/photo.jpg", data.clone())
        .await
        .unwrap();
    assert_eq!(meta.size, 50_000);

    eventually("file on b", || b.datastore().read_local_file("/cluster/photo.jpg").is_ok()).await;
    let (on_b, _) = b.datastore().read_local_file("/cluster/photo.jpg").unwrap();
    assert_eq!(on_b, data);

    // b replicates back to a into a shard with the same id.
    eventually("replica on a", || a.datastore().read_local_file("/cluster/photo.jpg").is_ok()).await;
    let (on_a, _) = a.datastore().read_local_file("/cluster/photo.jpg").unwrap();
    assert_eq!(on_a, data);

    let shard_on_b = b.datastore().locate_file("/cluster/photo.jpg").unwrap().shards[0];
    let replica = a
        .datastore()
        .local_shard_by_id_str(&shard_on_b.to_string())
        .unwrap();
    assert_eq!(replica.id(), shard_on_b);
    assert!(replica.is_flushed());

    // a learned b's shard index through the broadcast.
    eventually("remote index on a", || {
        a.datastore()
            .shard_by_id_str(&shard_on_b.to_string())
            .map(|locations| locations.iter().any(|l| l.node == "127.0.0.2"))
            .unwrap_or(false)
    })
    .await;

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_peer_list_persisted_on_shutdown() {
    let (a, b, dir_a, _dir_b) = cluster().await;
    a.shutdown().await;
    b.shutdown().await;

    let saved = std::fs::read_to_string(dir_a.path().join("meta").join("gossip_nodes.json")).unwrap();
    let nodes: Vec<String> = serde_json::from_str(&saved).unwrap();
    assert_eq!(nodes, vec!["127.0.0.2"]);
}
