//! Prometheus metrics for the xyzFS node
//!
//! Exposes storage, replication and membership metrics.

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tracing::info;
use xyzfs_storage::StorageStats;

/// Metric names as constants
pub mod names {
    // Storage metrics
    pub const STORAGE_BYTES_USED: &str = "xyzfs_storage_bytes_used";
    pub const STORAGE_BYTES_CAPACITY: &str = "xyzfs_storage_bytes_capacity";
    pub const STORAGE_FILES_TOTAL: &str = "xyzfs_storage_files_total";
    pub const STORAGE_SHARDS_TOTAL: &str = "xyzfs_storage_shards_total";

    // Write metrics
    pub const FILES_WRITTEN: &str = "xyzfs_files_written_total";
    pub const FILE_BYTES_WRITTEN: &str = "xyzfs_file_bytes_written_total";
    pub const WRITE_DURATION: &str = "xyzfs_write_duration_seconds";
    pub const REPLICAS_SENT: &str = "xyzfs_replicas_sent_total";
    pub const REPLICA_FAILURES: &str = "xyzfs_replica_failures_total";

    // Binary transport metrics
    pub const INDICES_RECEIVED: &str = "xyzfs_shard_indices_received_total";
    pub const TRANSFERS_COMPLETED: &str = "xyzfs_transfers_completed_total";
    pub const TRANSFERS_FAILED: &str = "xyzfs_transfers_failed_total";

    // Health metrics
    pub const NODE_UP: &str = "xyzfs_node_up";
    pub const NODE_START_TIME: &str = "xyzfs_node_start_time_seconds";
}

/// Initialize metric descriptions
pub fn init_metrics() {
    describe_gauge!(names::STORAGE_BYTES_USED, "Bytes stored in local data shards");
    describe_gauge!(
        names::STORAGE_BYTES_CAPACITY,
        "Capacity of local data shards in bytes"
    );
    describe_gauge!(names::STORAGE_FILES_TOTAL, "Files stored in local shards");
    describe_gauge!(names::STORAGE_SHARDS_TOTAL, "Local shards, data and parity");

    describe_counter!(names::FILES_WRITTEN, "Files written, labelled by origin");
    describe_counter!(names::FILE_BYTES_WRITTEN, "File bytes written");
    describe_histogram!(names::WRITE_DURATION, "File write duration in seconds");
    describe_counter!(names::REPLICAS_SENT, "Replica copies sent to peers");
    describe_counter!(names::REPLICA_FAILURES, "Replica copies that could not be sent");

    describe_counter!(names::INDICES_RECEIVED, "Shard indices received from peers");
    describe_counter!(names::TRANSFERS_COMPLETED, "File transfers reassembled");
    describe_counter!(names::TRANSFERS_FAILED, "File transfers that could not be stored");

    describe_gauge!(names::NODE_UP, "Whether the node is up (1) or down (0)");
    describe_gauge!(names::NODE_START_TIME, "Unix timestamp when the node started");

    describe_counter!("xyzfs_shard_files_written_total", "Files appended to any shard");
    describe_counter!("xyzfs_shard_bytes_written_total", "Bytes appended to any shard");

    xyzfs_network::describe_metrics();
}

/// Where a stored file came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOrigin {
    /// Client write routed to this node
    Client,
    /// Untargeted transfer from a peer
    Forwarded,
    /// Targeted replica copy
    Replica,
}

impl WriteOrigin {
    pub fn as_str(&self) -> &'static str {
        match self {
            WriteOrigin::Client => "client",
            WriteOrigin::Forwarded => "forwarded",
            WriteOrigin::Replica => "replica",
        }
    }
}

/// Metrics recorder for one node
#[derive(Clone)]
pub struct NodeMetrics {
    node_id: String,
    start_time: std::time::Instant,
}

impl NodeMetrics {
    pub fn new(node_id: impl Into<String>) -> Self {
        let metrics = Self {
            node_id: node_id.into(),
            start_time: std::time::Instant::now(),
        };

        gauge!(names::NODE_UP, "node_id" => metrics.node_id.clone()).set(1.0);
        gauge!(names::NODE_START_TIME, "node_id" => metrics.node_id.clone())
            .set(xyzfs_core::unix_now() as f64);

        metrics
    }

    /// Record a file stored in a local shard
    pub fn record_write(&self, origin: WriteOrigin, size: usize, duration: std::time::Duration) {
        let labels = [
            ("node_id", self.node_id.clone()),
            ("origin", origin.as_str().to_string()),
        ];
        counter!(names::FILES_WRITTEN, &labels).increment(1);
        counter!(names::FILE_BYTES_WRITTEN, &labels).increment(size as u64);
        histogram!(names::WRITE_DURATION, &labels).record(duration.as_secs_f64());
    }

    pub fn record_replica(&self, success: bool) {
        if success {
            counter!(names::REPLICAS_SENT, "node_id" => self.node_id.clone()).increment(1);
        } else {
            counter!(names::REPLICA_FAILURES, "node_id" => self.node_id.clone()).increment(1);
        }
    }

    pub fn record_index_received(&self) {
        counter!(names::INDICES_RECEIVED, "node_id" => self.node_id.clone()).increment(1);
    }

    pub fn record_transfer(&self, success: bool) {
        if success {
            counter!(names::TRANSFERS_COMPLETED, "node_id" => self.node_id.clone()).increment(1);
        } else {
            counter!(names::TRANSFERS_FAILED, "node_id" => self.node_id.clone()).increment(1);
        }
    }

    /// Update storage gauges
    pub fn update_storage(&self, stats: &StorageStats) {
        gauge!(names::STORAGE_BYTES_USED, "node_id" => self.node_id.clone()).set(stats.bytes_used as f64);
        gauge!(names::STORAGE_BYTES_CAPACITY, "node_id" => self.node_id.clone())
            .set(stats.bytes_capacity as f64);
        gauge!(names::STORAGE_FILES_TOTAL, "node_id" => self.node_id.clone()).set(stats.file_count as f64);
        gauge!(names::STORAGE_SHARDS_TOTAL, "node_id" => self.node_id.clone()).set(stats.shard_count as f64);
    }

    /// Mark node as down
    pub fn mark_down(&self) {
        gauge!(names::NODE_UP, "node_id" => self.node_id.clone()).set(0.0);
    }

    pub fn uptime_secs(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

/// Prometheus scrape endpoint
pub struct MetricsServer {
    addr: SocketAddr,
}

impl MetricsServer {
    pub fn new(bind_host: &str, port: u16) -> Result<Self, Box<dyn std::error::Error + Send + Sync>> {
        let addr: SocketAddr = format!("{}:{}", bind_host, port).parse()?;
        Ok(Self { addr })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Install the global recorder and serve `/metrics`; needs a tokio runtime.
    pub fn start(self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        PrometheusBuilder::new()
            .with_http_listener(self.addr)
            .install()?;
        info!(addr = %self.addr, "Metrics exporter listening");
        Ok(())
    }
}
