//! Gossip membership
//!
//! Nodes find each other through hello messages on a dedicated transport.
//! A hello carries the sender's runtime id, so a restarted peer is noticed
//! and its state reset. Once hellos have travelled both ways the peer is
//! `Established`: we send it our node list and tell the listener, which
//! brings up the data transport.

use crate::connection::ConnectionMeta;
use crate::message::{GossipMessageType, Message};
use crate::node_state::{GossipNodeState, HandshakeEvent, RuntimeChange};
use crate::peer_list::PeerListStore;
use crate::transport::{NetworkTransport, TransportConfig, TransportHandler};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;
use xyzfs_core::error::{Result, XyzError};
use xyzfs_core::unix_now;

/// Gossip configuration
#[derive(Debug, Clone)]
pub struct GossipConfig {
    pub bind_host: String,
    pub port: u16,
    /// Re-send hello once our last one is this old
    pub hello_interval: Duration,
    /// A peer is fresh while both hello directions are younger than this
    pub freshness: Duration,
    pub tick_interval: Duration,
    /// Directory holding the persisted peer list
    pub meta_path: PathBuf,
    pub transport: TransportConfig,
}

impl GossipConfig {
    pub fn new(bind_host: impl Into<String>, port: u16, meta_path: impl Into<PathBuf>) -> Self {
        let bind_host = bind_host.into();
        Self {
            transport: TransportConfig::new("gossip", bind_host.clone(), port),
            bind_host,
            port,
            hello_interval: Duration::from_secs(5),
            freshness: Duration::from_secs(10),
            tick_interval: Duration::from_secs(1),
            meta_path: meta_path.into(),
        }
    }

    pub fn with_transport(mut self, transport: TransportConfig) -> Self {
        self.transport = transport;
        self
    }

    pub fn with_hello_interval(mut self, interval: Duration) -> Self {
        self.hello_interval = interval;
        self
    }

    pub fn with_tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval = interval;
        self
    }
}

/// Identity of this process
#[derive(Debug)]
pub struct RuntimeInfo {
    id: String,
    bind_host: String,
    local_node: RwLock<Option<String>>,
}

impl RuntimeInfo {
    /// Fresh runtime id for this process
    pub fn new(bind_host: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            id: Uuid::new_v4().to_string(),
            bind_host: bind_host.into(),
            local_node: RwLock::new(None),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Our own node name, once learned from a hello we sent ourselves
    pub fn local_node(&self) -> Option<String> {
        self.local_node.read().clone()
    }

    pub fn set_local_node(&self, node: &str) {
        let mut local = self.local_node.write();
        if local.as_deref() != Some(node) {
            info!(node = %node, "Detected local node address");
            *local = Some(node.to_string());
        }
    }

    /// Name this node goes by: the learned address, the bind IP or `localhost`.
    pub fn node_name(&self) -> String {
        if let Some(node) = self.local_node() {
            return node;
        }
        match self.bind_host.parse::<IpAddr>() {
            Ok(ip) if !ip.is_unspecified() => ip.to_string(),
            _ => "localhost".to_string(),
        }
    }

    /// `node` refers to this process.
    pub fn is_local(&self, node: &str) -> bool {
        node == "localhost"
            || self.local_node.read().as_deref() == Some(node)
            || (node == self.bind_host
                && node
                    .parse::<IpAddr>()
                    .map(|ip| !ip.is_unspecified())
                    .unwrap_or(false))
    }
}

/// Reacts to membership changes
#[async_trait]
pub trait GossipListener: Send + Sync + 'static {
    /// Hellos now flow both ways with `node`.
    async fn on_handshake_complete(&self, node: &str, reestablished: bool);

    /// `node` came back with a new runtime id.
    async fn on_peer_restarted(&self, _node: &str) {}
}

/// Split a `--seeds` value into node names, dropping ports.
pub fn parse_seeds(input: &str, gossip_port: u16) -> Vec<String> {
    let mut seeds = Vec::new();
    for raw in input.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        let (host, port) = split_host_port(raw);
        if let Some(port) = port {
            if port != gossip_port {
                warn!(seed = %raw, port, gossip_port, "Seed port differs from the cluster gossip port, ignoring it");
            }
        }
        if !seeds.iter().any(|s| s == host) {
            seeds.push(host.to_string());
        }
    }
    seeds
}

fn split_host_port(raw: &str) -> (&str, Option<u16>) {
    if let Ok(addr) = raw.parse::<SocketAddr>() {
        return match addr {
            SocketAddr::V4(_) => (raw.rsplit_once(':').map(|(h, _)| h).unwrap_or(raw), Some(addr.port())),
            SocketAddr::V6(_) => {
                let host = raw
                    .rsplit_once(':')
                    .map(|(h, _)| h.trim_start_matches('[').trim_end_matches(']'))
                    .unwrap_or(raw);
                (host, Some(addr.port()))
            }
        };
    }
    if raw.parse::<IpAddr>().is_ok() {
        return (raw, None);
    }
    match raw.rsplit_once(':') {
        Some((host, port)) => match port.parse::<u16>() {
            Ok(port) => (host, Some(port)),
            Err(_) => (raw, None),
        },
        None => (raw, None),
    }
}

pub struct Gossip {
    config: GossipConfig,
    runtime: Arc<RuntimeInfo>,
    transport: Arc<NetworkTransport>,
    nodes: RwLock<HashMap<String, GossipNodeState>>,
    listener: RwLock<Option<Arc<dyn GossipListener>>>,
    hellos_in_flight: Mutex<HashSet<String>>,
    peer_list: PeerListStore,
    shutdown: CancellationToken,
}

struct GossipHandler {
    gossip: Weak<Gossip>,
}

#[async_trait]
impl TransportHandler for GossipHandler {
    async fn on_message(&self, meta: ConnectionMeta, payload: Vec<u8>) -> Result<Option<Vec<u8>>> {
        let gossip = self
            .gossip
            .upgrade()
            .ok_or_else(|| XyzError::Internal("gossip stopped".to_string()))?;
        gossip.handle_message(meta, &payload)?;
        Ok(None)
    }

    async fn on_connect(&self, node: String) {
        if let Some(gossip) = self.gossip.upgrade() {
            gossip.spawn_hello(node);
        }
    }
}

impl Gossip {
    pub fn new(config: GossipConfig, runtime: Arc<RuntimeInfo>) -> Arc<Self> {
        let transport = NetworkTransport::new(config.transport.clone());
        let gossip = Arc::new(Self {
            peer_list: PeerListStore::new(&config.meta_path),
            config,
            runtime,
            transport,
            nodes: RwLock::new(HashMap::new()),
            listener: RwLock::new(None),
            hellos_in_flight: Mutex::new(HashSet::new()),
            shutdown: CancellationToken::new(),
        });
        gossip.transport.set_handler(Arc::new(GossipHandler {
            gossip: Arc::downgrade(&gossip),
        }));
        gossip
    }

    pub fn config(&self) -> &GossipConfig {
        &self.config
    }

    pub fn runtime(&self) -> &Arc<RuntimeInfo> {
        &self.runtime
    }

    pub fn transport(&self) -> &Arc<NetworkTransport> {
        &self.transport
    }

    pub fn set_listener(&self, listener: Arc<dyn GossipListener>) {
        *self.listener.write() = Some(listener);
    }

    fn listener(&self) -> Option<Arc<dyn GossipListener>> {
        self.listener.read().clone()
    }

    /// Start the gossip transport and the hello ticker.
    pub async fn start(self: &Arc<Self>) -> Result<SocketAddr> {
        let addr = self.transport.start().await?;
        let gossip = Arc::downgrade(self);
        let interval = self.config.tick_interval;
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => return,
                    _ = ticker.tick() => {}
                }
                let Some(gossip) = gossip.upgrade() else {
                    return;
                };
                gossip.tick();
            }
        });
        info!(addr = %addr, runtime = %self.runtime.id(), "Gossip started");
        Ok(addr)
    }

    /// Say hello to every seed.
    pub fn discover(self: &Arc<Self>, seeds: &[String]) {
        for seed in seeds {
            if self.runtime.is_local(seed) {
                continue;
            }
            self.spawn_hello(seed.clone());
        }
    }

    /// Restart gossip with the peers saved by a previous run.
    pub fn recover_from_disk(self: &Arc<Self>) {
        match self.peer_list.load() {
            Ok(nodes) if !nodes.is_empty() => {
                info!(peers = nodes.len(), "Recovered gossip peers from disk");
                self.start_from_list(nodes);
            }
            Ok(_) => {}
            Err(e) => warn!(path = %self.peer_list.path().display(), error = %e, "Failed to read peer list"),
        }
    }

    /// Known peers, excluding ourselves
    pub fn nodes(&self) -> Vec<String> {
        let mut nodes: Vec<String> = self
            .nodes
            .read()
            .keys()
            .filter(|n| !self.runtime.is_local(n))
            .cloned()
            .collect();
        nodes.sort();
        nodes
    }

    pub fn node_state(&self, node: &str) -> Option<GossipNodeState> {
        self.nodes.read().get(node).cloned()
    }

    pub fn node_states(&self) -> Vec<GossipNodeState> {
        let mut states: Vec<GossipNodeState> = self.nodes.read().values().cloned().collect();
        states.sort_by(|a, b| a.node.cmp(&b.node));
        states
    }

    pub fn is_fresh(&self, node: &str) -> bool {
        let window = self.config.freshness.as_secs();
        self.nodes
            .read()
            .get(node)
            .map(|s| s.is_fresh(unix_now(), window))
            .unwrap_or(false)
    }

    pub fn fresh_nodes(&self) -> Vec<String> {
        self.nodes()
            .into_iter()
            .filter(|n| self.is_fresh(n))
            .collect()
    }

    pub fn node_list_json(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(&self.nodes())?)
    }

    pub fn persist_nodes(&self) {
        if let Err(e) = self.peer_list.save(&self.nodes()) {
            warn!(path = %self.peer_list.path().display(), error = %e, "Failed to persist peer list");
        }
    }

    /// Send a hello in the background unless one to `node` is already underway.
    fn spawn_hello(self: &Arc<Self>, node: String) {
        if !self.hellos_in_flight.lock().insert(node.clone()) {
            return;
        }
        let gossip = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = gossip.send_hello(&node).await {
                debug!(node = %node, error = %e, "Hello failed");
            }
            gossip.hellos_in_flight.lock().remove(&node);
        });
    }

    /// Send our runtime id to `node`.
    pub async fn send_hello(self: &Arc<Self>, node: &str) -> Result<()> {
        let msg = Message::new(GossipMessageType::Hello, self.runtime.id().as_bytes().to_vec());
        self.transport.send(node, &msg.to_bytes()).await?;

        // Our own hello has been seen by the receiving side by now.
        if self.runtime.is_local(node) {
            self.forget_local(node);
            return Ok(());
        }
        let (event, new_peer) = {
            let mut nodes = self.nodes.write();
            let new_peer = !nodes.contains_key(node);
            let state = nodes
                .entry(node.to_string())
                .or_insert_with(|| GossipNodeState::new(node));
            (state.mark_sent(unix_now()), new_peer)
        };
        if new_peer {
            self.persist_nodes();
        }
        if let Some(event) = event {
            self.on_established(node.to_string(), event);
        }
        Ok(())
    }

    fn handle_message(self: &Arc<Self>, meta: ConnectionMeta, payload: &[u8]) -> Result<()> {
        let msg = Message::from_bytes(payload)?;
        match msg.kind::<GossipMessageType>()? {
            GossipMessageType::Hello => self.receive_hello(&meta, msg.data()),
            GossipMessageType::NodeList => self.receive_node_list(&meta, msg.data()),
            GossipMessageType::NodeState => {
                debug!(node = %meta.node, len = msg.data().len(), "Ignoring node state message");
                Ok(())
            }
            GossipMessageType::Empty => Ok(()),
        }
    }

    fn receive_hello(self: &Arc<Self>, meta: &ConnectionMeta, data: &[u8]) -> Result<()> {
        let runtime_id = std::str::from_utf8(data)
            .map_err(|_| XyzError::MalformedMessage("hello runtime id is not utf-8".to_string()))?;
        let node = meta.node.as_str();

        if runtime_id == self.runtime.id() {
            self.runtime.set_local_node(node);
            self.forget_local(node);
            debug!(node = %node, "Ignoring hello from ourselves");
            return Ok(());
        }

        let now = unix_now();
        let interval = self.config.hello_interval.as_secs();
        let (change, event, reply, new_peer) = {
            let mut nodes = self.nodes.write();
            let new_peer = !nodes.contains_key(node);
            let state = nodes
                .entry(node.to_string())
                .or_insert_with(|| GossipNodeState::new(node));
            let change = state.observe_runtime(runtime_id);
            let event = state.mark_received(now);
            (change, event, state.hello_due(now, interval), new_peer)
        };

        if change == RuntimeChange::Restarted {
            warn!(node = %node, runtime = %runtime_id, "Peer runtime changed, gossip state reset");
            let gossip = Arc::clone(self);
            let node = node.to_string();
            tokio::spawn(async move {
                gossip.transport.close_pool(&node).await;
                if let Some(listener) = gossip.listener() {
                    listener.on_peer_restarted(&node).await;
                }
            });
        }
        if new_peer {
            info!(node = %node, "Discovered new peer");
            self.persist_nodes();
        }
        if let Some(event) = event {
            self.on_established(node.to_string(), event);
        }
        if reply {
            self.spawn_hello(node.to_string());
        }
        Ok(())
    }

    fn receive_node_list(self: &Arc<Self>, meta: &ConnectionMeta, data: &[u8]) -> Result<()> {
        let list: Vec<String> = serde_json::from_slice(data)?;
        debug!(node = %meta.node, peers = list.len(), "Received node list");
        self.start_from_list(list);
        Ok(())
    }

    fn start_from_list(self: &Arc<Self>, list: Vec<String>) {
        let new: Vec<String> = {
            let nodes = self.nodes.read();
            list.into_iter()
                .filter(|n| !nodes.contains_key(n) && !self.runtime.is_local(n))
                .collect()
        };
        if !new.is_empty() {
            info!(nodes = ?new, "Discovered new nodes");
        }
        for node in new {
            self.spawn_hello(node);
        }
    }

    fn on_established(self: &Arc<Self>, node: String, event: HandshakeEvent) {
        info!(node = %node, reestablished = event.reestablished, "Gossip handshake complete");
        metrics::counter!("xyzfs_gossip_handshakes_total").increment(1);
        let gossip = Arc::clone(self);
        tokio::spawn(async move {
            match gossip.node_list_json() {
                Ok(list) => {
                    let msg = Message::new(GossipMessageType::NodeList, list);
                    if let Err(e) = gossip.transport.send(&node, &msg.to_bytes()).await {
                        warn!(node = %node, error = %e, "Failed to send node list");
                    }
                }
                Err(e) => warn!(error = %e, "Failed to encode node list"),
            }
            if let Some(listener) = gossip.listener() {
                listener.on_handshake_complete(&node, event.reestablished).await;
            }
        });
    }

    fn forget_local(&self, node: &str) {
        if self.nodes.write().remove(node).is_some() {
            debug!(node = %node, "Removed local address from peer table");
        }
    }

    /// One heartbeat: refresh stats and re-send due hellos.
    ///
    /// The peer list is saved when a new peer is seen and on shutdown.
    pub fn tick(self: &Arc<Self>) {
        let now = unix_now();
        let interval = self.config.hello_interval.as_secs();
        let window = self.config.freshness.as_secs();
        let mut due = Vec::new();
        let mut fresh = 0usize;
        {
            let mut nodes = self.nodes.write();
            for (node, state) in nodes.iter_mut() {
                if let Some(stats) = self.transport.pool_stats(node) {
                    state.stats = Some(stats);
                }
                if state.is_fresh(now, window) {
                    fresh += 1;
                }
                if state.hello_due(now, interval) {
                    due.push(node.clone());
                }
            }
        }
        metrics::gauge!("xyzfs_gossip_fresh_peers").set(fresh as f64);
        for node in due {
            if !self.runtime.is_local(&node) {
                self.spawn_hello(node);
            }
        }
    }

    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        self.persist_nodes();
        self.transport.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_seeds() {
        let seeds = parse_seeds("10.0.0.1, 10.0.0.2:3322,host-a:9999,,[::1]:3322,::2,10.0.0.1", 3322);
        assert_eq!(seeds, vec!["10.0.0.1", "10.0.0.2", "host-a", "::1", "::2"]);
    }

    #[test]
    fn test_runtime_locality() {
        let runtime = RuntimeInfo::new("127.0.0.2");
        assert!(runtime.is_local("localhost"));
        assert!(runtime.is_local("127.0.0.2"));
        assert!(!runtime.is_local("127.0.0.1"));
        assert_eq!(runtime.node_name(), "127.0.0.2");

        let runtime = RuntimeInfo::new("0.0.0.0");
        assert!(!runtime.is_local("0.0.0.0"));
        assert_eq!(runtime.node_name(), "localhost");
        runtime.set_local_node("10.1.1.1");
        assert!(runtime.is_local("10.1.1.1"));
        assert_eq!(runtime.node_name(), "10.1.1.1");
    }

    #[test]
    fn test_tick_leaves_peer_list_alone() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = PeerListStore::new(dir.path());
        store.save(&["10.9.9.9".to_string()]).unwrap();
        let saved = std::fs::read_to_string(store.path()).unwrap();

        let gossip = Gossip::new(
            GossipConfig::new("127.0.0.1", 0, dir.path()),
            RuntimeInfo::new("127.0.0.1"),
        );
        gossip.tick();
        gossip.tick();
        assert_eq!(std::fs::read_to_string(store.path()).unwrap(), saved);
    }
}
