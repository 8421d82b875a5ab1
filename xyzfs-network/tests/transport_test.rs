//! Transport tests against a hand-rolled peer
//!
//! The fake peer speaks the wire protocol directly so acknowledgements can
//! be corrupted on purpose.

use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use xyzfs_core::{crc32c, Result, XyzError};
use xyzfs_network::codec::{self, DEFAULT_MAX_FRAME_LEN};
use xyzfs_network::{ConnectionMeta, NetworkTransport, TransportConfig, TransportHandler};

/// Accepts connections and acks every request; the first `bad_acks`
/// requests get a wrong checksum.
async fn fake_peer(bad_acks: usize) -> (u16, Arc<AtomicUsize>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let requests = Arc::new(AtomicUsize::new(0));

    let counter = Arc::clone(&requests);
    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                return;
            };
            let counter = Arc::clone(&counter);
            tokio::spawn(async move {
                while let Ok(Some(frame)) = codec::read_frame(&mut stream, DEFAULT_MAX_FRAME_LEN).await {
                    let payload = codec::gunzip(&frame, DEFAULT_MAX_FRAME_LEN).unwrap();
                    let n = counter.fetch_add(1, Ordering::SeqCst);
                    let crc = if n < bad_acks {
                        crc32c(&payload) ^ 0xFFFF
                    } else {
                        crc32c(&payload)
                    };
                    if codec::write_response(&mut stream, crc, &codec::ok_body(b"ok")).await.is_err() {
                        return;
                    }
                }
            });
        }
    });
    (port, requests)
}

fn client(port: u16) -> Arc<NetworkTransport> {
    NetworkTransport::new(
        TransportConfig::new("test-client", "127.0.0.1", port)
            .with_pool_size(1)
            .with_dial(2, Duration::from_millis(20))
            .with_checkout_timeout(Duration::from_millis(50))
            .with_response_timeout(Duration::from_secs(2)),
    )
}

#[tokio::test]
async fn test_corrupted_ack_is_resent() {
    let (port, requests) = fake_peer(1).await;
    let transport = client(port);

    let response = transport.send("127.0.0.1", b"payload").await.unwrap();
    assert_eq!(response, b"ok");
    assert_eq!(requests.load(Ordering::SeqCst), 2);

    let stats = transport.pool_stats("127.0.0.1").unwrap();
    assert_eq!(stats.error_count, 1);
    assert_eq!(stats.success_count, 1);
}

#[tokio::test]
async fn test_gives_up_after_max_attempts() {
    let (port, requests) = fake_peer(usize::MAX).await;
    let transport = client(port);

    let err = transport.send("127.0.0.1", b"payload").await.unwrap_err();
    assert!(matches!(err, XyzError::AckChecksumMismatch { .. }));
    assert!(err.is_retryable());
    assert_eq!(requests.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_unreachable_node_is_connection_error() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let transport = client(port);
    assert!(matches!(
        transport.send("127.0.0.1", b"x").await,
        Err(XyzError::Connection { .. })
    ));
}

struct Failing;

#[async_trait]
impl TransportHandler for Failing {
    async fn on_message(&self, _meta: ConnectionMeta, _payload: Vec<u8>) -> Result<Option<Vec<u8>>> {
        Err(XyzError::Internal("boom".to_string()))
    }
}

struct FailingCounted(Arc<AtomicUsize>);

#[async_trait]
impl TransportHandler for FailingCounted {
    async fn on_message(&self, meta: ConnectionMeta, payload: Vec<u8>) -> Result<Option<Vec<u8>>> {
        self.0.fetch_add(1, Ordering::SeqCst);
        Failing.on_message(meta, payload).await
    }
}

#[tokio::test]
async fn test_handler_error_reaches_sender() {
    let calls = Arc::new(AtomicUsize::new(0));
    let server = NetworkTransport::new(TransportConfig::new("failing", "127.0.0.1", 0));
    server.set_handler(Arc::new(FailingCounted(Arc::clone(&calls))));
    let addr = server.start().await.unwrap();

    let transport = client(addr.port());
    match transport.send("127.0.0.1", b"anything").await {
        Err(XyzError::Remote { node, message }) => {
            assert_eq!(node, "127.0.0.1");
            assert!(message.contains("boom"));
        }
        other => panic!("unexpected {other:?}"),
    }
    // Rejections are not retried, and the connection stays usable.
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    let stats = transport.pool_stats("127.0.0.1").unwrap();
    assert_eq!(stats.error_count, 0);
    server.shutdown().await;
}

struct CountConnects(Arc<AtomicUsize>);

#[async_trait]
impl TransportHandler for CountConnects {
    async fn on_message(&self, _meta: ConnectionMeta, _payload: Vec<u8>) -> Result<Option<Vec<u8>>> {
        Ok(None)
    }

    async fn on_connect(&self, _node: String) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

#[tokio::test]
async fn test_on_connect_fires_once_per_pool() {
    let (port, _requests) = fake_peer(0).await;
    let connects = Arc::new(AtomicUsize::new(0));
    let transport = client(port);
    transport.set_handler(Arc::new(CountConnects(Arc::clone(&connects))));

    transport.connect("127.0.0.1");
    transport.connect("127.0.0.1");
    transport.send("127.0.0.1", b"x").await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(connects.load(Ordering::SeqCst), 1);

    transport.close_pool("127.0.0.1").await;
    assert!(!transport.has_pool("127.0.0.1"));
    transport.connect("127.0.0.1");
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(connects.load(Ordering::SeqCst), 2);
}
