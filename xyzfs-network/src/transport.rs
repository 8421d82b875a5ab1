//! Framed request/response transport over TCP
//!
//! Every service (gossip, binary data) runs its own `NetworkTransport` on
//! its own port. Inbound connections get one task each; outbound sends go
//! through a per-peer [`ConnectionPool`] and are acknowledged with the CRC32C
//! of the request, so a corrupted or misrouted exchange is detected and
//! retried on a fresh connection.

use crate::codec;
use crate::connection::{ConnectionMeta, DialConfig};
use crate::pool::{ConnectionPool, PoolConfig};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::BufReader;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use xyzfs_core::error::{Result, XyzError};
use xyzfs_core::{crc32c, PerformanceStats};

/// Callbacks invoked by a transport
#[async_trait]
pub trait TransportHandler: Send + Sync + 'static {
    /// Handle one decompressed request; the returned bytes travel back in the ack.
    async fn on_message(&self, meta: ConnectionMeta, payload: Vec<u8>) -> Result<Option<Vec<u8>>>;

    /// A pool to `node` was created for the first time.
    async fn on_connect(&self, _node: String) {}
}

/// Transport configuration
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Service name used in logs and metrics
    pub service: String,
    /// Address the listener binds to
    pub bind_host: String,
    /// Port this service uses on every node
    pub port: u16,
    pub pool_size: usize,
    pub checkout_timeout: Duration,
    pub dial_attempts: u32,
    pub dial_backoff: Duration,
    pub connect_timeout: Duration,
    /// Total attempts per send, including the first
    pub max_send_attempts: u32,
    /// How long a sender waits for the acknowledgement
    pub response_timeout: Duration,
    pub max_frame_len: usize,
    pub trace_log: bool,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            service: "transport".to_string(),
            bind_host: "0.0.0.0".to_string(),
            port: 0,
            pool_size: 4,
            checkout_timeout: Duration::from_secs(1),
            dial_attempts: 5,
            dial_backoff: Duration::from_secs(1),
            connect_timeout: Duration::from_secs(5),
            max_send_attempts: 3,
            response_timeout: Duration::from_secs(15),
            max_frame_len: codec::DEFAULT_MAX_FRAME_LEN,
            trace_log: false,
        }
    }
}

impl TransportConfig {
    pub fn new(service: impl Into<String>, bind_host: impl Into<String>, port: u16) -> Self {
        Self {
            service: service.into(),
            bind_host: bind_host.into(),
            port,
            ..Default::default()
        }
    }

    pub fn with_pool_size(mut self, size: usize) -> Self {
        self.pool_size = size;
        self
    }

    pub fn with_response_timeout(mut self, timeout: Duration) -> Self {
        self.response_timeout = timeout;
        self
    }

    pub fn with_dial(mut self, attempts: u32, backoff: Duration) -> Self {
        self.dial_attempts = attempts;
        self.dial_backoff = backoff;
        self
    }

    pub fn with_max_send_attempts(mut self, attempts: u32) -> Self {
        self.max_send_attempts = attempts;
        self
    }

    pub fn with_checkout_timeout(mut self, timeout: Duration) -> Self {
        self.checkout_timeout = timeout;
        self
    }

    /// Concrete local IP outbound sockets bind to, if `bind_host` names one
    pub fn local_ip(&self) -> Option<IpAddr> {
        self.bind_host
            .parse::<IpAddr>()
            .ok()
            .filter(|ip| !ip.is_unspecified())
    }

    fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            size: self.pool_size,
            checkout_timeout: self.checkout_timeout,
            trace_log: self.trace_log,
            dial: DialConfig {
                port: self.port,
                local_ip: self.local_ip(),
                attempts: self.dial_attempts,
                backoff: self.dial_backoff,
                connect_timeout: self.connect_timeout,
            },
        }
    }
}

pub struct NetworkTransport {
    config: TransportConfig,
    handler: RwLock<Option<Arc<dyn TransportHandler>>>,
    pools: RwLock<HashMap<String, Arc<ConnectionPool>>>,
    local_addr: RwLock<Option<SocketAddr>>,
    shutdown: CancellationToken,
}

impl NetworkTransport {
    pub fn new(config: TransportConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            handler: RwLock::new(None),
            pools: RwLock::new(HashMap::new()),
            local_addr: RwLock::new(None),
            shutdown: CancellationToken::new(),
        })
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    pub fn set_handler(&self, handler: Arc<dyn TransportHandler>) {
        *self.handler.write() = Some(handler);
    }

    fn handler(&self) -> Option<Arc<dyn TransportHandler>> {
        self.handler.read().clone()
    }

    /// Address the listener is bound to, once started
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.read()
    }

    /// Bind the listener and start accepting connections.
    pub async fn start(self: &Arc<Self>) -> Result<SocketAddr> {
        let handler = self.handler().ok_or_else(|| {
            XyzError::Configuration(format!(
                "{} transport started without a message handler",
                self.config.service
            ))
        })?;

        let listener = TcpListener::bind((self.config.bind_host.as_str(), self.config.port)).await?;
        let addr = listener.local_addr()?;
        *self.local_addr.write() = Some(addr);
        info!(service = %self.config.service, addr = %addr, "Transport listening");

        let transport = Arc::clone(self);
        tokio::spawn(async move {
            transport.accept_loop(listener, handler).await;
        });
        Ok(addr)
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener, handler: Arc<dyn TransportHandler>) {
        loop {
            let accepted = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                accepted = listener.accept() => accepted,
            };
            match accepted {
                Ok((stream, remote)) => {
                    let transport = Arc::clone(&self);
                    let handler = Arc::clone(&handler);
                    tokio::spawn(async move {
                        if let Err(e) = transport.serve_connection(stream, remote, handler).await {
                            debug!(
                                service = %transport.config.service,
                                remote = %remote,
                                error = %e,
                                "Inbound connection ended with error"
                            );
                        }
                    });
                }
                Err(e) => {
                    error!(service = %self.config.service, error = %e, "Accept failed");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
        debug!(service = %self.config.service, "Accept loop stopped");
    }

    async fn serve_connection(
        &self,
        stream: TcpStream,
        remote: SocketAddr,
        handler: Arc<dyn TransportHandler>,
    ) -> Result<()> {
        stream.set_nodelay(true)?;
        let meta = ConnectionMeta::from_remote(remote);
        let (reader, mut writer) = stream.into_split();
        let mut reader = BufReader::new(reader);

        loop {
            let frame = tokio::select! {
                _ = self.shutdown.cancelled() => return Ok(()),
                frame = codec::read_frame(&mut reader, self.config.max_frame_len) => frame?,
            };
            let Some(compressed) = frame else {
                return Ok(());
            };

            let payload = codec::gunzip(&compressed, self.config.max_frame_len)?;
            let crc = crc32c(&payload);
            let response = match handler.on_message(meta.clone(), payload).await {
                Ok(response) => codec::ok_body(&response.unwrap_or_default()),
                Err(e) => {
                    warn!(
                        service = %self.config.service,
                        node = %meta.node,
                        error = %e,
                        "Message handler failed"
                    );
                    codec::error_body(&e.to_string())
                }
            };
            codec::write_response(&mut writer, crc, &response).await?;
        }
    }

    /// Ensure a pool to `node` exists, firing `on_connect` when it is new.
    pub fn connect(self: &Arc<Self>, node: &str) -> Arc<ConnectionPool> {
        if let Some(pool) = self.pools.read().get(node) {
            return Arc::clone(pool);
        }

        let pool = {
            let mut pools = self.pools.write();
            if let Some(pool) = pools.get(node) {
                return Arc::clone(pool);
            }
            let pool = ConnectionPool::new(node, self.config.pool_config());
            pools.insert(node.to_string(), Arc::clone(&pool));
            pool
        };
        pool.prepare();
        debug!(service = %self.config.service, node = %node, "Connection pool created");

        if let Some(handler) = self.handler() {
            let node = node.to_string();
            tokio::spawn(async move {
                handler.on_connect(node).await;
            });
        }
        pool
    }

    pub fn has_pool(&self, node: &str) -> bool {
        self.pools.read().contains_key(node)
    }

    /// Drop the pool to `node`; the next send builds a new one.
    pub async fn close_pool(&self, node: &str) {
        let pool = self.pools.write().remove(node);
        if let Some(pool) = pool {
            pool.close().await;
        }
    }

    pub fn pool_stats(&self, node: &str) -> Option<PerformanceStats> {
        self.pools.read().get(node).map(|p| p.stats())
    }

    /// Send `payload` to `node` and return the handler's reply.
    ///
    /// A handler error on the peer comes back as [`XyzError::Remote`] and is
    /// not retried.
    #[instrument(skip(self, payload), fields(service = %self.config.service, node = %node, len = payload.len()))]
    pub async fn send(self: &Arc<Self>, node: &str, payload: &[u8]) -> Result<Vec<u8>> {
        let compressed = codec::gzip(payload)?;
        let crc = crc32c(payload);
        let pool = self.connect(node);
        let attempts = self.config.max_send_attempts.max(1);
        let mut last_error = None;

        for attempt in 1..=attempts {
            let mut conn = match pool.get_connection().await {
                Ok(conn) => conn,
                Err(e) => {
                    warn!(node = %node, attempt, error = %e, "No connection available");
                    last_error = Some(e);
                    continue;
                }
            };

            match conn
                .request(&compressed, crc, self.config.response_timeout, self.config.max_frame_len)
                .await
            {
                Ok(response) => {
                    pool.return_connection(conn);
                    metrics::counter!("xyzfs_transport_sent_total", "service" => self.config.service.clone())
                        .increment(1);
                    return codec::decode_body(node, response);
                }
                Err(e) => {
                    warn!(node = %node, attempt, conn = conn.id(), error = %e, "Send failed, discarding connection");
                    metrics::counter!("xyzfs_transport_retries_total", "service" => self.config.service.clone())
                        .increment(1);
                    pool.discard_connection(conn);
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| XyzError::connection(node, "send failed")))
    }

    /// Stop accepting, end inbound connections and close every pool.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let pools: Vec<Arc<ConnectionPool>> = self.pools.write().drain().map(|(_, p)| p).collect();
        for pool in pools {
            pool.close().await;
        }
        info!(service = %self.config.service, "Transport stopped");
    }
}
