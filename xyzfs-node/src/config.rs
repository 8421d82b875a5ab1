//! Configuration management for the xyzFS node
//!
//! Supports loading from TOML files, CLI flags and environment variables.

use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use xyzfs_core::ErasureConfig;
use xyzfs_network::{GossipConfig, TransportConfig};
use xyzfs_storage::StorageConfig;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse config file: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

/// Complete node configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Node identity and seeds
    #[serde(default)]
    pub node: NodeSettings,

    /// Ports and transport tuning
    #[serde(default)]
    pub network: NetworkSettings,

    /// Volumes, shards and replication
    #[serde(default)]
    pub storage: StorageSettings,

    /// Membership timing
    #[serde(default)]
    pub gossip: GossipSettings,

    /// File transfer chunking
    #[serde(default)]
    pub transfer: TransferSettings,

    /// Prometheus exporter
    #[serde(default)]
    pub metrics: MetricsSettings,
}

impl NodeConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: NodeConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Load configuration with fallback to defaults
    pub fn load_or_default(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        if !path.exists() {
            tracing::debug!(path = ?path, "No config file, using defaults");
            return Self::default();
        }
        match Self::from_file(path) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to load config, using defaults");
                Self::default()
            }
        }
    }

    /// Validate the configuration and prepare directories
    pub fn validate(&self) -> Result<(), ConfigError> {
        for dir in [&self.storage.meta_path, &self.storage.volume_path] {
            if !dir.exists() {
                tracing::info!(path = ?dir, "Creating directory");
                std::fs::create_dir_all(dir).map_err(|e| {
                    ConfigError::ValidationError(format!("Cannot create directory {:?}: {}", dir, e))
                })?;
            }
        }

        let ports = [
            ("gossip", self.network.gossip_port),
            ("binary", self.network.binary_port),
            ("binary UDP", self.network.binary_udp_port),
        ];
        for (name, port) in ports {
            if port == 0 {
                return Err(ConfigError::ValidationError(format!("{name} port cannot be 0")));
            }
        }
        if self.network.gossip_port == self.network.binary_port {
            return Err(ConfigError::ValidationError(
                "gossip and binary ports must differ".to_string(),
            ));
        }

        ErasureConfig::new(self.storage.data_shards, self.storage.parity_shards)
            .map_err(|e| ConfigError::ValidationError(e.to_string()))?;
        if self.storage.shard_size == 0 {
            return Err(ConfigError::ValidationError("shard size cannot be 0".to_string()));
        }
        if self.storage.max_file_size > self.storage.shard_size as u64 {
            return Err(ConfigError::ValidationError(format!(
                "max file size {} exceeds shard size {}",
                self.storage.max_file_size, self.storage.shard_size
            )));
        }
        if self.transfer.chunk_size < 1024 {
            return Err(ConfigError::ValidationError(
                "transfer chunk size must be at least 1024 bytes".to_string(),
            ));
        }
        if self.gossip.freshness_secs < self.gossip.hello_interval_secs {
            return Err(ConfigError::ValidationError(
                "gossip freshness window must not be shorter than the hello interval".to_string(),
            ));
        }
        Ok(())
    }

    /// Override config with CLI arguments
    pub fn with_overrides(mut self, seeds: Option<Vec<String>>, bind_address: Option<String>) -> Self {
        if let Some(seeds) = seeds {
            self.node.seeds = seeds;
        }
        if let Some(addr) = bind_address {
            self.node.bind_address = addr;
        }
        self
    }

    /// Apply `XYZFS_*` environment variable overrides
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(addr) = std::env::var("XYZFS_BIND_ADDRESS") {
            self.node.bind_address = addr;
        }
        if let Ok(seeds) = std::env::var("XYZFS_SEEDS") {
            self.node.seeds = split_list(&seeds);
        }
        if let Ok(path) = std::env::var("XYZFS_META_PATH") {
            self.storage.meta_path = PathBuf::from(path);
        }
        if let Ok(path) = std::env::var("XYZFS_VOLUME_PATH") {
            self.storage.volume_path = PathBuf::from(path);
        }
        if let Some(port) = env_parse("XYZFS_GOSSIP_PORT") {
            self.network.gossip_port = port;
        }
        if let Some(port) = env_parse("XYZFS_BINARY_PORT") {
            self.network.binary_port = port;
        }
        if let Some(port) = env_parse("XYZFS_BINARY_UDP_PORT") {
            self.network.binary_udp_port = port;
        }
        if let Some(replicas) = env_parse("XYZFS_REPLICAS") {
            self.storage.replicas = replicas;
        }
        self
    }

    /// Shard engine settings
    pub fn storage_config(&self) -> Result<StorageConfig, ConfigError> {
        let erasure = ErasureConfig::new(self.storage.data_shards, self.storage.parity_shards)
            .map_err(|e| ConfigError::ValidationError(e.to_string()))?;
        Ok(StorageConfig::default()
            .with_shard_size(self.storage.shard_size)
            .with_erasure(erasure))
    }

    /// Transport settings for one service on `port`
    pub fn transport_config(&self, service: &str, port: u16) -> TransportConfig {
        let net = &self.network;
        let mut config = TransportConfig::new(service, self.node.bind_address.clone(), port)
            .with_pool_size(net.pool_size)
            .with_response_timeout(Duration::from_secs(net.response_timeout_secs))
            .with_dial(net.dial_attempts, Duration::from_millis(net.dial_backoff_ms))
            .with_checkout_timeout(Duration::from_millis(net.checkout_timeout_ms));
        config.max_frame_len = net.max_frame_mb * 1024 * 1024;
        config.trace_log = net.trace_log;
        config
    }

    pub fn gossip_config(&self) -> GossipConfig {
        let mut config = GossipConfig::new(
            self.node.bind_address.clone(),
            self.network.gossip_port,
            self.storage.meta_path.clone(),
        )
        .with_transport(self.transport_config("gossip", self.network.gossip_port))
        .with_hello_interval(Duration::from_secs(self.gossip.hello_interval_secs))
        .with_tick_interval(Duration::from_millis(self.gossip.tick_interval_ms));
        config.freshness = Duration::from_secs(self.gossip.freshness_secs);
        config
    }
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}

/// Node identity configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSettings {
    /// Address every service binds to; a concrete IP is also used for outbound sockets
    #[serde(default = "default_bind_addr")]
    pub bind_address: String,

    /// Gossip seeds, `host` or `host:port`
    #[serde(default)]
    pub seeds: Vec<String>,
}

impl Default for NodeSettings {
    fn default() -> Self {
        Self {
            bind_address: default_bind_addr(),
            seeds: Vec::new(),
        }
    }
}

impl NodeSettings {
    /// The bind address when it names one concrete IP
    pub fn bind_ip(&self) -> Option<IpAddr> {
        self.bind_address
            .parse::<IpAddr>()
            .ok()
            .filter(|ip| !ip.is_unspecified())
    }
}

fn default_bind_addr() -> String {
    "0.0.0.0".to_string()
}

/// Network configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkSettings {
    #[serde(default = "default_gossip_port")]
    pub gossip_port: u16,

    #[serde(default = "default_binary_port")]
    pub binary_port: u16,

    #[serde(default = "default_binary_udp_port")]
    pub binary_udp_port: u16,

    /// Idle connections kept per peer and service
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,

    /// How long a send waits for its acknowledgement
    #[serde(default = "default_response_timeout")]
    pub response_timeout_secs: u64,

    #[serde(default = "default_checkout_timeout")]
    pub checkout_timeout_ms: u64,

    #[serde(default = "default_dial_attempts")]
    pub dial_attempts: u32,

    #[serde(default = "default_dial_backoff")]
    pub dial_backoff_ms: u64,

    /// Largest accepted frame in MB
    #[serde(default = "default_max_frame")]
    pub max_frame_mb: usize,

    /// Log every pool checkout and return
    #[serde(default)]
    pub trace_log: bool,
}

impl Default for NetworkSettings {
    fn default() -> Self {
        Self {
            gossip_port: default_gossip_port(),
            binary_port: default_binary_port(),
            binary_udp_port: default_binary_udp_port(),
            pool_size: default_pool_size(),
            response_timeout_secs: default_response_timeout(),
            checkout_timeout_ms: default_checkout_timeout(),
            dial_attempts: default_dial_attempts(),
            dial_backoff_ms: default_dial_backoff(),
            max_frame_mb: default_max_frame(),
            trace_log: false,
        }
    }
}

fn default_gossip_port() -> u16 {
    3322
}

fn default_binary_port() -> u16 {
    3323
}

fn default_binary_udp_port() -> u16 {
    3324
}

fn default_pool_size() -> usize {
    4
}

fn default_response_timeout() -> u64 {
    15
}

fn default_checkout_timeout() -> u64 {
    1000
}

fn default_dial_attempts() -> u32 {
    5
}

fn default_dial_backoff() -> u64 {
    1000
}

fn default_max_frame() -> usize {
    64
}

/// Storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageSettings {
    /// Node metadata such as the gossip peer list
    #[serde(default = "default_meta_path")]
    pub meta_path: PathBuf,

    /// Base directory holding `v=<uuid>` volumes
    #[serde(default = "default_volume_path")]
    pub volume_path: PathBuf,

    #[serde(default = "default_data_shards")]
    pub data_shards: usize,

    #[serde(default = "default_parity_shards")]
    pub parity_shards: usize,

    /// Shard capacity in bytes
    #[serde(default = "default_shard_size")]
    pub shard_size: u32,

    /// Largest file accepted by `add_file`
    #[serde(default = "default_max_file_size")]
    pub max_file_size: u64,

    /// Extra copies made of every untargeted write
    #[serde(default = "default_replicas")]
    pub replicas: usize,

    /// How often dirty shards are flushed to disk
    #[serde(default = "default_flush_interval")]
    pub flush_interval_secs: u64,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            meta_path: default_meta_path(),
            volume_path: default_volume_path(),
            data_shards: default_data_shards(),
            parity_shards: default_parity_shards(),
            shard_size: default_shard_size(),
            max_file_size: default_max_file_size(),
            replicas: default_replicas(),
            flush_interval_secs: default_flush_interval(),
        }
    }
}

fn default_meta_path() -> PathBuf {
    PathBuf::from("/xyzfs/meta")
}

fn default_volume_path() -> PathBuf {
    PathBuf::from("/xyzfs/data")
}

fn default_data_shards() -> usize {
    xyzfs_core::DATA_SHARDS
}

fn default_parity_shards() -> usize {
    xyzfs_core::PARITY_SHARDS
}

fn default_shard_size() -> u32 {
    xyzfs_core::SHARD_SIZE
}

fn default_max_file_size() -> u64 {
    xyzfs_core::MAX_FILE_SIZE
}

fn default_replicas() -> usize {
    1
}

fn default_flush_interval() -> u64 {
    10
}

/// Gossip configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GossipSettings {
    #[serde(default = "default_hello_interval")]
    pub hello_interval_secs: u64,

    /// Peers silent for longer than this are not routed to
    #[serde(default = "default_freshness")]
    pub freshness_secs: u64,

    #[serde(default = "default_tick_interval")]
    pub tick_interval_ms: u64,
}

impl Default for GossipSettings {
    fn default() -> Self {
        Self {
            hello_interval_secs: default_hello_interval(),
            freshness_secs: default_freshness(),
            tick_interval_ms: default_tick_interval(),
        }
    }
}

fn default_hello_interval() -> u64 {
    5
}

fn default_freshness() -> u64 {
    10
}

fn default_tick_interval() -> u64 {
    1000
}

/// File transfer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferSettings {
    /// Size of one file chunk message in bytes
    #[serde(default = "default_chunk_size")]
    pub chunk_size: u32,

    /// Incomplete transfers idle this long are dropped
    #[serde(default = "default_receiver_idle")]
    pub receiver_idle_secs: u64,
}

impl Default for TransferSettings {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            receiver_idle_secs: default_receiver_idle(),
        }
    }
}

fn default_chunk_size() -> u32 {
    xyzfs_network::DEFAULT_CHUNK_SIZE
}

fn default_receiver_idle() -> u64 {
    60
}

/// Metrics configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSettings {
    /// Serve Prometheus metrics
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

impl Default for MetricsSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            port: default_metrics_port(),
        }
    }
}

fn default_metrics_port() -> u16 {
    9090
}
