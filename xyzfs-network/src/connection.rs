//! Pooled transport connections
//!
//! A `TransportConnection` wraps one TCP stream to a peer. The stream is
//! dialed lazily and re-dialed after it has been closed.

use crate::codec;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use tokio::net::{lookup_host, TcpSocket, TcpStream};
use tracing::{debug, warn};
use xyzfs_core::error::{Result, XyzError};
use xyzfs_core::Measurement;

/// Identifies the peer on the other side of an inbound connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionMeta {
    /// Remote socket address
    pub remote_addr: SocketAddr,
    /// Node name, the host part of the remote address
    pub node: String,
}

impl ConnectionMeta {
    pub fn from_remote(remote_addr: SocketAddr) -> Self {
        Self {
            node: remote_addr.ip().to_string(),
            remote_addr,
        }
    }
}

/// How outbound connections are dialed
#[derive(Debug, Clone)]
pub struct DialConfig {
    /// Port every peer listens on for this service
    pub port: u16,
    /// Local address outbound sockets bind to, if any
    pub local_ip: Option<IpAddr>,
    pub attempts: u32,
    pub backoff: Duration,
    pub connect_timeout: Duration,
}

impl Default for DialConfig {
    fn default() -> Self {
        Self {
            port: 0,
            local_ip: None,
            attempts: 5,
            backoff: Duration::from_secs(1),
            connect_timeout: Duration::from_secs(5),
        }
    }
}

pub struct TransportConnection {
    id: u64,
    node: String,
    dial: DialConfig,
    stream: Option<TcpStream>,
    measurement: Option<Measurement>,
}

impl std::fmt::Debug for TransportConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportConnection")
            .field("id", &self.id)
            .field("node", &self.node)
            .field("connected", &self.stream.is_some())
            .finish()
    }
}

impl TransportConnection {
    /// Unconnected handle; the first request dials.
    pub fn new(id: u64, node: impl Into<String>, dial: DialConfig) -> Self {
        Self {
            id,
            node: node.into(),
            dial,
            stream: None,
            measurement: None,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn node(&self) -> &str {
        &self.node
    }

    pub fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    pub(crate) fn attach_measurement(&mut self, measurement: Measurement) {
        self.measurement = Some(measurement);
    }

    pub(crate) fn take_measurement(&mut self) -> Option<Measurement> {
        self.measurement.take()
    }

    /// Dial if not connected, retrying with a fixed backoff.
    pub async fn ensure_connected(&mut self) -> Result<()> {
        if self.stream.is_some() {
            return Ok(());
        }
        let mut last_error = None;
        for attempt in 1..=self.dial.attempts.max(1) {
            match self.dial_once().await {
                Ok(stream) => {
                    debug!(node = %self.node, conn = self.id, attempt, "Connection established");
                    self.stream = Some(stream);
                    return Ok(());
                }
                Err(e) => {
                    debug!(node = %self.node, conn = self.id, attempt, error = %e, "Dial failed");
                    last_error = Some(e);
                    if attempt < self.dial.attempts {
                        tokio::time::sleep(self.dial.backoff).await;
                    }
                }
            }
        }
        let err = last_error
            .map(|e| e.to_string())
            .unwrap_or_else(|| "no dial attempts".to_string());
        warn!(node = %self.node, port = self.dial.port, error = %err, "Giving up dialing peer");
        Err(XyzError::connection(&self.node, err))
    }

    async fn dial_once(&self) -> std::io::Result<TcpStream> {
        let addr = lookup_host((self.node.as_str(), self.dial.port))
            .await?
            .next()
            .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::NotFound, "no address"))?;

        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        if let Some(ip) = self.dial.local_ip {
            if ip.is_ipv4() == addr.is_ipv4() {
                socket.bind(SocketAddr::new(ip, 0))?;
            }
        }

        let stream = tokio::time::timeout(self.dial.connect_timeout, socket.connect(addr))
            .await
            .map_err(|_| std::io::Error::new(std::io::ErrorKind::TimedOut, "connect timed out"))??;
        stream.set_nodelay(true)?;
        Ok(stream)
    }

    /// Send one compressed request and wait for its acknowledgement.
    ///
    /// `expected_crc` is the checksum of the uncompressed request; a
    /// different echo fails with `AckChecksumMismatch`.
    pub async fn request(
        &mut self,
        compressed: &[u8],
        expected_crc: u32,
        response_timeout: Duration,
        max_frame_len: usize,
    ) -> Result<Vec<u8>> {
        self.ensure_connected().await?;
        let node = self.node.clone();
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| XyzError::connection(&node, "not connected"))?;

        codec::write_request(stream, compressed).await?;
        let (crc, body) = tokio::time::timeout(
            response_timeout,
            codec::read_response(stream, max_frame_len),
        )
        .await
        .map_err(|_| XyzError::Timeout { node: node.clone() })??;

        if crc != expected_crc {
            return Err(XyzError::AckChecksumMismatch {
                node,
                expected: expected_crc,
                actual: crc,
            });
        }
        Ok(body)
    }

    pub fn close(&mut self) {
        if self.stream.take().is_some() {
            debug!(node = %self.node, conn = self.id, "Connection closed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_dial_failure_after_attempts() {
        // Bind then drop to get a port nobody listens on.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let dial = DialConfig {
            port,
            attempts: 2,
            backoff: Duration::from_millis(10),
            ..Default::default()
        };
        let mut conn = TransportConnection::new(1, "127.0.0.1", dial);
        let err = conn.ensure_connected().await.unwrap_err();
        assert!(matches!(err, XyzError::Connection { .. }));
        assert!(!conn.is_connected());
    }

    #[test]
    fn test_meta_from_remote() {
        let meta = ConnectionMeta::from_remote("10.1.2.3:5555".parse().unwrap());
        assert_eq!(meta.node, "10.1.2.3");
    }
}
