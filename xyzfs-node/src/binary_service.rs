//! Binary service: shard indices, file chunks and shard creation between peers
//!
//! One service owns the binary TCP transport and its UDP companion. It is
//! the glue between the datastore and the network:
//! - publishes shard indices to every known peer,
//! - sends files to peers as chunk streams,
//! - reassembles inbound chunk streams and hands them to the datastore,
//! - reacts to gossip handshakes by opening a pool (first contact) or
//!   re-sending the full index snapshot (re-established peers).

use crate::datastore::{run_blocking, Datastore, PeerFileSender};
use crate::metrics::NodeMetrics;
use crate::router::Membership;
use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;
use xyzfs_core::{FileMeta, Result, XyzError};
use xyzfs_network::{
    BinaryMessageType, ConnectionMeta, CreateShardRequest, FileSplitter, GossipListener, Message,
    NetworkTransport, ReceiverRegistry, TransportConfig, TransportHandler, UdpTransport,
};
use xyzfs_storage::{IndexBroadcaster, ShardIndex};

/// Binary service settings
#[derive(Debug, Clone)]
pub struct BinaryServiceConfig {
    pub transport: TransportConfig,
    /// UDP companion port; `None` disables the datagram path
    pub udp_port: Option<u16>,
    pub chunk_size: u32,
    pub receiver_idle: Duration,
}

impl BinaryServiceConfig {
    pub fn new(transport: TransportConfig) -> Self {
        Self {
            transport,
            udp_port: None,
            chunk_size: xyzfs_network::DEFAULT_CHUNK_SIZE,
            receiver_idle: Duration::from_secs(60),
        }
    }

    pub fn with_udp_port(mut self, port: u16) -> Self {
        self.udp_port = Some(port);
        self
    }

    pub fn with_chunk_size(mut self, bytes: u32) -> Self {
        self.chunk_size = bytes;
        self
    }

    pub fn with_receiver_idle(mut self, idle: Duration) -> Self {
        self.receiver_idle = idle;
        self
    }
}

pub struct BinaryService {
    config: BinaryServiceConfig,
    transport: Arc<NetworkTransport>,
    udp: Option<Arc<UdpTransport>>,
    splitter: FileSplitter,
    receivers: Arc<ReceiverRegistry>,
    metrics: NodeMetrics,
    datastore: OnceLock<Weak<Datastore>>,
    membership: OnceLock<Weak<dyn Membership>>,
}

impl BinaryService {
    pub fn new(config: BinaryServiceConfig, metrics: NodeMetrics) -> Arc<Self> {
        let transport = NetworkTransport::new(config.transport.clone());
        let udp = config.udp_port.map(|port| {
            UdpTransport::new(
                format!("{}_udp", config.transport.service),
                config.transport.bind_host.clone(),
                port,
            )
        });
        let service = Arc::new(Self {
            splitter: FileSplitter::new(config.chunk_size),
            receivers: Arc::new(ReceiverRegistry::new(config.receiver_idle)),
            config,
            transport,
            udp,
            metrics,
            datastore: OnceLock::new(),
            membership: OnceLock::new(),
        });

        let handler = Arc::new(Handler {
            service: Arc::downgrade(&service),
        });
        service.transport.set_handler(handler.clone());
        if let Some(udp) = &service.udp {
            udp.set_handler(handler);
        }
        service
    }

    /// Wire in the datastore and membership; both are held weakly.
    pub fn attach(&self, datastore: &Arc<Datastore>, membership: Weak<dyn Membership>) {
        if self.datastore.set(Arc::downgrade(datastore)).is_err() {
            warn!("Binary service datastore already attached");
        }
        if self.membership.set(membership).is_err() {
            warn!("Binary service membership already attached");
        }
    }

    pub fn transport(&self) -> &Arc<NetworkTransport> {
        &self.transport
    }

    pub fn receivers(&self) -> &Arc<ReceiverRegistry> {
        &self.receivers
    }

    /// Start the TCP listener, the UDP loop and the receiver sweeper.
    pub async fn start(self: &Arc<Self>) -> Result<SocketAddr> {
        let addr = self.transport.start().await?;
        if let Some(udp) = &self.udp {
            udp.start().await?;
        }
        self.receivers.spawn_sweeper(self.config.receiver_idle);
        info!(addr = %addr, "Binary service started");
        Ok(addr)
    }

    pub async fn shutdown(&self) {
        if let Some(udp) = &self.udp {
            udp.shutdown();
        }
        self.transport.shutdown().await;
    }

    fn datastore(&self) -> Result<Arc<Datastore>> {
        self.datastore
            .get()
            .and_then(Weak::upgrade)
            .ok_or_else(|| XyzError::Configuration("binary service has no datastore".to_string()))
    }

    fn peers(&self) -> Vec<String> {
        self.membership
            .get()
            .and_then(Weak::upgrade)
            .map(|m| m.nodes())
            .unwrap_or_default()
    }

    /// Push the index of every local shard to `node`.
    pub async fn send_shard_indices(&self, node: &str) -> Result<usize> {
        let datastore = self.datastore()?;
        send_shard_indices(&self.transport, &datastore, node).await
    }

    fn spawn_send_shard_indices(&self, node: &str) {
        let datastore = match self.datastore() {
            Ok(datastore) => datastore,
            Err(e) => {
                warn!(node = %node, error = %e, "Shard index snapshot skipped");
                return;
            }
        };
        let transport = Arc::clone(&self.transport);
        let node = node.to_string();
        tokio::spawn(async move {
            if let Err(e) = send_shard_indices(&transport, &datastore, &node).await {
                warn!(node = %node, error = %e, "Shard index snapshot failed");
            }
        });
    }

    async fn dispatch(&self, meta: ConnectionMeta, payload: Vec<u8>) -> Result<Option<Vec<u8>>> {
        let msg = Message::from_bytes(&payload)?;
        match msg.kind::<BinaryMessageType>()? {
            BinaryMessageType::Empty => Ok(None),
            BinaryMessageType::ShardIndex => {
                let index = ShardIndex::from_bytes(msg.data())?;
                self.datastore()?.locator().load_index(&meta.node, index);
                self.metrics.record_index_received();
                Ok(None)
            }
            BinaryMessageType::FileChunk => {
                let Some(transfer) = self.receivers.accept(&meta.node, msg.data())? else {
                    return Ok(None);
                };
                debug!(
                    node = %meta.node,
                    transfer = transfer.transfer,
                    file = %transfer.meta.full_name,
                    "Transfer complete"
                );
                let stored = self.datastore()?.receive_file(transfer).await;
                self.metrics.record_transfer(stored.is_ok());
                stored?;
                Ok(None)
            }
            BinaryMessageType::CreateShard => {
                let request = CreateShardRequest::from_bytes(msg.data())?;
                let datastore = self.datastore()?;
                run_blocking(move || datastore.create_shard(request).map(|_| ())).await?;
                Ok(None)
            }
        }
    }
}

impl IndexBroadcaster for BinaryService {
    fn broadcast_index(&self, shard_id: Uuid, index_bytes: Vec<u8>) {
        let peers = self.peers();
        if peers.is_empty() {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            debug!(shard = %shard_id, "No runtime, index broadcast skipped");
            return;
        };
        let msg = Message::new(BinaryMessageType::ShardIndex, index_bytes).to_bytes();
        for node in peers {
            let transport = Arc::clone(&self.transport);
            let msg = msg.clone();
            runtime.spawn(async move {
                if let Err(e) = transport.send(&node, &msg).await {
                    warn!(node = %node, shard = %shard_id, error = %e, "Index broadcast failed");
                }
            });
        }
    }
}

#[async_trait]
impl PeerFileSender for BinaryService {
    async fn send_file(
        &self,
        node: &str,
        meta: &FileMeta,
        data: &[u8],
        target: Option<CreateShardRequest>,
    ) -> Result<()> {
        if let Some(request) = target {
            self.transport
                .send(node, &request.to_message().to_bytes())
                .await?;
        }
        let chunks = self
            .splitter
            .split(meta, data, target.map(|t| t.shard_id))?;
        debug!(node = %node, file = %meta.full_name, chunks = chunks.len(), "Sending file");
        for chunk in chunks {
            self.transport.send(node, &chunk.to_bytes()).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl GossipListener for BinaryService {
    async fn on_handshake_complete(&self, node: &str, reestablished: bool) {
        if reestablished || self.transport.has_pool(node) {
            info!(node = %node, reestablished, "Peer re-established, resending shard indices");
            self.spawn_send_shard_indices(node);
        } else {
            self.transport.connect(node);
        }
    }

    async fn on_peer_restarted(&self, node: &str) {
        self.transport.close_pool(node).await;
        if let Ok(datastore) = self.datastore() {
            datastore.locator().forget_node(node);
        }
    }
}

async fn send_shard_indices(
    transport: &Arc<NetworkTransport>,
    datastore: &Datastore,
    node: &str,
) -> Result<usize> {
    let shards = datastore.local_shards();
    info!(node = %node, shards = shards.len(), "Sending local shard indices");
    let mut sent = 0;
    for shard in shards {
        let msg = Message::new(BinaryMessageType::ShardIndex, shard.index_bytes()?);
        match transport.send(node, &msg.to_bytes()).await {
            Ok(_) => sent += 1,
            Err(e) => warn!(node = %node, shard = %shard.id(), error = %e, "Shard index send failed"),
        }
    }
    Ok(sent)
}

/// Transport handler holding the service weakly
struct Handler {
    service: Weak<BinaryService>,
}

#[async_trait]
impl TransportHandler for Handler {
    async fn on_message(&self, meta: ConnectionMeta, payload: Vec<u8>) -> Result<Option<Vec<u8>>> {
        let service = self
            .service
            .upgrade()
            .ok_or_else(|| XyzError::Internal("binary service dropped".to_string()))?;
        service.dispatch(meta, payload).await
    }

    async fn on_connect(&self, node: String) {
        if let Some(service) = self.service.upgrade() {
            service.spawn_send_shard_indices(&node);
        }
    }
}
