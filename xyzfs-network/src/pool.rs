//! Per-peer connection pool
//!
//! Idle connections live in a bounded channel. Checkout waits briefly for an
//! idle member and otherwise dials a fresh one; returning never blocks.
//! A connection is only ever held by one sender at a time.

use crate::connection::{DialConfig, TransportConnection};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, trace, warn};
use xyzfs_core::error::{Result, XyzError};
use xyzfs_core::{PerformanceProfiler, PerformanceStats};

/// Pool configuration
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum idle connections kept per peer
    pub size: usize,
    /// How long checkout waits for an idle connection before dialing
    pub checkout_timeout: Duration,
    /// Log every checkout and return
    pub trace_log: bool,
    pub dial: DialConfig,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            size: 4,
            checkout_timeout: Duration::from_secs(1),
            trace_log: false,
            dial: DialConfig::default(),
        }
    }
}

pub struct ConnectionPool {
    node: String,
    config: PoolConfig,
    idle_tx: mpsc::Sender<TransportConnection>,
    idle_rx: Mutex<mpsc::Receiver<TransportConnection>>,
    closed: AtomicBool,
    next_id: AtomicU64,
    profiler: Arc<PerformanceProfiler>,
}

impl ConnectionPool {
    pub fn new(node: impl Into<String>, config: PoolConfig) -> Arc<Self> {
        let node = node.into();
        let (idle_tx, idle_rx) = mpsc::channel(config.size.max(1));
        Arc::new(Self {
            profiler: PerformanceProfiler::new(format!("pool:{node}:{}", config.dial.port)),
            node,
            config,
            idle_tx,
            idle_rx: Mutex::new(idle_rx),
            closed: AtomicBool::new(false),
            next_id: AtomicU64::new(1),
        })
    }

    pub fn node(&self) -> &str {
        &self.node
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Idle connections currently in the pool
    pub fn idle_count(&self) -> usize {
        self.idle_tx.max_capacity() - self.idle_tx.capacity()
    }

    pub fn stats(&self) -> PerformanceStats {
        self.profiler.stats()
    }

    /// Dial up to `size` connections in the background.
    pub fn prepare(self: &Arc<Self>) {
        let pool = Arc::clone(self);
        tokio::spawn(async move {
            for _ in 0..pool.config.size {
                if pool.is_closed() {
                    return;
                }
                let mut conn = pool.new_handle();
                if let Err(e) = conn.ensure_connected().await {
                    debug!(node = %pool.node, error = %e, "Pool warm-up stopped");
                    return;
                }
                pool.push_idle(conn);
            }
        });
    }

    /// Check out a connection, dialing one if none is idle in time.
    pub async fn get_connection(&self) -> Result<TransportConnection> {
        if self.is_closed() {
            return Err(XyzError::connection(&self.node, "pool closed"));
        }

        let idle = tokio::time::timeout(self.config.checkout_timeout, async {
            self.idle_rx.lock().await.recv().await
        })
        .await
        .ok()
        .flatten();

        let mut conn = match idle {
            Some(conn) => conn,
            None => {
                let mut conn = self.new_handle();
                conn.ensure_connected().await?;
                conn
            }
        };
        if self.config.trace_log {
            trace!(node = %self.node, conn = conn.id(), "Connection checked out");
        }
        conn.attach_measurement(self.profiler.start());
        Ok(conn)
    }

    /// Give a healthy connection back. Never blocks.
    pub fn return_connection(&self, mut conn: TransportConnection) {
        if let Some(m) = conn.take_measurement() {
            m.success();
        }
        if self.config.trace_log {
            trace!(node = %self.node, conn = conn.id(), "Connection returned");
        }
        self.push_idle(conn);
    }

    /// Close a broken connection and dial a replacement in the background.
    pub fn discard_connection(self: &Arc<Self>, mut conn: TransportConnection) {
        if let Some(m) = conn.take_measurement() {
            m.error();
        }
        conn.close();
        metrics::counter!("xyzfs_pool_discarded_total").increment(1);
        if self.is_closed() {
            return;
        }

        let pool = Arc::clone(self);
        tokio::spawn(async move {
            let mut replacement = pool.new_handle();
            match replacement.ensure_connected().await {
                Ok(()) => pool.push_idle(replacement),
                Err(e) => warn!(node = %pool.node, error = %e, "Replacement dial failed"),
            }
        });
    }

    /// Close the pool and every idle member.
    pub async fn close(&self) {
        self.closed.store(true, Ordering::Release);
        let mut rx = self.idle_rx.lock().await;
        while let Ok(mut conn) = rx.try_recv() {
            conn.close();
        }
        debug!(node = %self.node, "Pool closed");
    }

    fn new_handle(&self) -> TransportConnection {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        TransportConnection::new(id, self.node.clone(), self.config.dial.clone())
    }

    fn push_idle(&self, mut conn: TransportConnection) {
        if self.is_closed() {
            conn.close();
            return;
        }
        if let Err(err) = self.idle_tx.try_send(conn) {
            let mut conn = match err {
                mpsc::error::TrySendError::Full(c) | mpsc::error::TrySendError::Closed(c) => c,
            };
            conn.close();
        }
    }
}
