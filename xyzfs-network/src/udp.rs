//! Best-effort datagram path
//!
//! No framing, compression or acknowledgement: each datagram is handed to
//! the handler as-is and any response is dropped.

use crate::connection::ConnectionMeta;
use crate::transport::TransportHandler;
use parking_lot::RwLock;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use xyzfs_core::error::{Result, XyzError};

/// Largest datagram the receive loop accepts
pub const MAX_DATAGRAM_LEN: usize = 65_507;

pub struct UdpTransport {
    service: String,
    bind_host: String,
    port: u16,
    handler: RwLock<Option<Arc<dyn TransportHandler>>>,
    local_addr: RwLock<Option<SocketAddr>>,
    shutdown: CancellationToken,
}

impl UdpTransport {
    pub fn new(service: impl Into<String>, bind_host: impl Into<String>, port: u16) -> Arc<Self> {
        Arc::new(Self {
            service: service.into(),
            bind_host: bind_host.into(),
            port,
            handler: RwLock::new(None),
            local_addr: RwLock::new(None),
            shutdown: CancellationToken::new(),
        })
    }

    pub fn set_handler(&self, handler: Arc<dyn TransportHandler>) {
        *self.handler.write() = Some(handler);
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.read()
    }

    /// Bind the socket and start the receive loop.
    pub async fn start(self: &Arc<Self>) -> Result<SocketAddr> {
        let handler = self.handler.read().clone().ok_or_else(|| {
            XyzError::Configuration(format!("{} transport started without a message handler", self.service))
        })?;
        let socket = UdpSocket::bind((self.bind_host.as_str(), self.port)).await?;
        let addr = socket.local_addr()?;
        *self.local_addr.write() = Some(addr);
        info!(service = %self.service, addr = %addr, "UDP transport listening");

        let transport = Arc::clone(self);
        tokio::spawn(async move {
            let mut buf = vec![0u8; MAX_DATAGRAM_LEN];
            loop {
                let received = tokio::select! {
                    _ = transport.shutdown.cancelled() => break,
                    received = socket.recv_from(&mut buf) => received,
                };
                match received {
                    Ok((len, remote)) => {
                        let meta = ConnectionMeta::from_remote(remote);
                        debug!(service = %transport.service, node = %meta.node, len, "Datagram received");
                        let payload = buf[..len].to_vec();
                        let handler = Arc::clone(&handler);
                        let service = transport.service.clone();
                        tokio::spawn(async move {
                            if let Err(e) = handler.on_message(meta, payload).await {
                                warn!(service = %service, error = %e, "Datagram handler failed");
                            }
                        });
                    }
                    Err(e) => error!(service = %transport.service, error = %e, "UDP receive error"),
                }
            }
        });
        Ok(addr)
    }

    /// Fire-and-forget send of one datagram to `node`.
    pub async fn send_datagram(&self, node: &str, payload: &[u8]) -> Result<()> {
        if payload.len() > MAX_DATAGRAM_LEN {
            return Err(XyzError::Capacity(format!(
                "datagram of {} bytes exceeds {MAX_DATAGRAM_LEN}",
                payload.len()
            )));
        }
        let socket = UdpSocket::bind((self.bind_host.as_str(), 0)).await?;
        socket.send_to(payload, (node, self.port)).await?;
        Ok(())
    }

    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}
