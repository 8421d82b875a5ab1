//! xyzFS Storage Node Library
//!
//! Provides the components of a storage node:
//! - Configuration management
//! - Application context wiring gossip, binary transport and storage
//! - Datastore orchestration, file location and node routing
//! - Prometheus metrics

pub mod binary_service;
pub mod config;
pub mod context;
pub mod datastore;
pub mod file_locator;
pub mod metrics;
pub mod router;

pub use binary_service::{BinaryService, BinaryServiceConfig};
pub use config::{
    ConfigError, GossipSettings, MetricsSettings, NetworkSettings, NodeConfig, NodeSettings,
    StorageSettings, TransferSettings,
};
pub use context::{AppContext, ListenAddrs};
pub use datastore::{Datastore, DatastoreConfig, PeerFileSender};
pub use file_locator::{FileLocator, LocateResult, ShardLocation, LOCAL_NODE};
pub use metrics::{init_metrics, MetricsServer, NodeMetrics, WriteOrigin};
pub use router::{Membership, NodeRouter, RouteCriteria};
