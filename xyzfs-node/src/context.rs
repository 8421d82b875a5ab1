//! Application context
//!
//! Owns every long-lived component of a node and wires them together:
//!
//! ```text
//! Gossip ──listener──▶ BinaryService ──weak──▶ Datastore
//!   ▲                       ▲                     │
//!   └────── router ─────────┼──── sender ─────────┘
//!                           └──── broadcaster (volumes/shards)
//! ```
//!
//! Back references are weak so dropping the context releases everything.

use crate::binary_service::{BinaryService, BinaryServiceConfig};
use crate::config::NodeConfig;
use crate::datastore::{Datastore, DatastoreConfig};
use crate::metrics::NodeMetrics;
use crate::router::{Membership, NodeRouter};
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use xyzfs_core::{Result, XyzError};
use xyzfs_network::{parse_seeds, Gossip, RuntimeInfo};

/// Addresses the node listens on
#[derive(Debug, Clone, Copy)]
pub struct ListenAddrs {
    pub gossip: SocketAddr,
    pub binary: SocketAddr,
}

pub struct AppContext {
    config: NodeConfig,
    runtime: Arc<RuntimeInfo>,
    gossip: Arc<Gossip>,
    binary: Arc<BinaryService>,
    datastore: Arc<Datastore>,
    metrics: NodeMetrics,
    shutdown: CancellationToken,
}

impl AppContext {
    /// Build every component; nothing listens until [`AppContext::start`].
    pub fn build(config: NodeConfig) -> Result<Arc<Self>> {
        let storage = config
            .storage_config()
            .map_err(|e| XyzError::Configuration(e.to_string()))?;

        let runtime = RuntimeInfo::new(config.node.bind_address.clone());
        let metrics = NodeMetrics::new(runtime.id());
        let gossip = Gossip::new(config.gossip_config(), Arc::clone(&runtime));

        let binary_config = BinaryServiceConfig::new(
            config.transport_config("binary", config.network.binary_port),
        )
        .with_udp_port(config.network.binary_udp_port)
        .with_chunk_size(config.transfer.chunk_size)
        .with_receiver_idle(Duration::from_secs(config.transfer.receiver_idle_secs));
        let binary = BinaryService::new(binary_config, metrics.clone());

        let datastore_config = DatastoreConfig::new(config.storage.volume_path.clone(), storage)
            .with_max_file_size(config.storage.max_file_size)
            .with_replicas(config.storage.replicas);
        let membership: Arc<dyn Membership> = gossip.clone();
        let datastore = Datastore::open(
            datastore_config,
            binary.clone(),
            NodeRouter::new(membership),
            metrics.clone(),
        )?;

        datastore.set_sender(binary.clone());
        let weak_membership: Weak<dyn Membership> = Arc::downgrade(&gossip) as Weak<dyn Membership>;
        binary.attach(&datastore, weak_membership);
        gossip.set_listener(binary.clone());

        info!(runtime_id = %runtime.id(), bind = %config.node.bind_address, "Node context built");
        Ok(Arc::new(Self {
            config,
            runtime,
            gossip,
            binary,
            datastore,
            metrics,
            shutdown: CancellationToken::new(),
        }))
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn runtime(&self) -> &Arc<RuntimeInfo> {
        &self.runtime
    }

    pub fn gossip(&self) -> &Arc<Gossip> {
        &self.gossip
    }

    pub fn binary(&self) -> &Arc<BinaryService> {
        &self.binary
    }

    pub fn datastore(&self) -> &Arc<Datastore> {
        &self.datastore
    }

    pub fn metrics(&self) -> &NodeMetrics {
        &self.metrics
    }

    /// Start listeners, seed gossip and begin periodic flushing.
    pub async fn start(self: &Arc<Self>) -> Result<ListenAddrs> {
        let binary = self.binary.start().await?;
        let gossip = self.gossip.start().await?;

        self.gossip.recover_from_disk();
        let seeds = parse_seeds(&self.config.node.seeds.join(","), self.config.network.gossip_port);
        if !seeds.is_empty() {
            info!(seeds = ?seeds, "Discovering seeds");
            self.gossip.discover(&seeds);
        }

        self.spawn_flusher(Duration::from_secs(self.config.storage.flush_interval_secs.max(1)));
        info!(gossip = %gossip, binary = %binary, "Node started");
        Ok(ListenAddrs { gossip, binary })
    }

    fn spawn_flusher(self: &Arc<Self>, interval: Duration) {
        let context = Arc::downgrade(self);
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => return,
                    _ = ticker.tick() => {}
                }
                let Some(context) = context.upgrade() else {
                    return;
                };
                let datastore = Arc::clone(&context.datastore);
                match tokio::task::spawn_blocking(move || datastore.flush()).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => warn!(error = %e, "Periodic flush failed"),
                    Err(e) => error!(error = %e, "Flush task panicked"),
                }
            }
        });
    }

    /// Persist dirty shards and refresh storage gauges.
    pub fn flush(&self) -> Result<()> {
        self.datastore.flush()
    }

    /// Stop background work, flush to disk and close listeners.
    pub async fn shutdown(&self) {
        info!("Shutting down node");
        self.shutdown.cancel();
        if let Err(e) = self.flush() {
            error!(error = %e, "Final flush failed");
        }
        self.gossip.persist_nodes();
        self.gossip.shutdown().await;
        self.binary.shutdown().await;
        self.metrics.mark_down();
    }
}
