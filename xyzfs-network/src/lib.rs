//! xyzFS Network Layer
//!
//! Everything nodes use to talk to each other:
//! - **codec / transport**: gzip-compressed, length-prefixed request frames
//!   acknowledged with the CRC32C of the request, over pooled TCP connections
//! - **udp**: best-effort datagram receive path
//! - **chunker**: splitting files into transfer chunks and reassembling them
//! - **gossip**: hello-based membership with a persisted peer list
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                        xyzfs node                         │
//! │                                                           │
//! │  ┌──────────────────┐          ┌──────────────────────┐  │
//! │  │ Gossip           │ handshake│ binary service        │  │
//! │  │  hello / list    │─────────▶│  index / chunks       │  │
//! │  └────────┬─────────┘          └──────────┬───────────┘  │
//! │           │                               │               │
//! │  ┌────────▼─────────┐          ┌──────────▼───────────┐  │
//! │  │ NetworkTransport │          │ NetworkTransport      │  │
//! │  │  port 3322       │          │  port 3323 (+UDP 3324)│  │
//! │  └────────┬─────────┘          └──────────┬───────────┘  │
//! └───────────│───────────────────────────────│──────────────┘
//!             ▼                               ▼
//!      ConnectionPool per peer         ConnectionPool per peer
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use xyzfs_network::{Gossip, GossipConfig, RuntimeInfo};
//!
//! let runtime = RuntimeInfo::new("0.0.0.0");
//! let gossip = Gossip::new(GossipConfig::new("0.0.0.0", 3322, "/xyzfs/meta"), runtime);
//! gossip.start().await?;
//! gossip.discover(&["10.0.0.2".to_string()]);
//! ```

pub mod chunker;
pub mod codec;
pub mod connection;
pub mod gossip;
pub mod message;
pub mod node_state;
pub mod peer_list;
pub mod pool;
pub mod transport;
pub mod udp;

// Re-exports
pub use chunker::{CompletedTransfer, FileReceiver, FileSplitter, ReceiverRegistry, DEFAULT_CHUNK_SIZE};
pub use connection::{ConnectionMeta, DialConfig, TransportConnection};
pub use gossip::{parse_seeds, Gossip, GossipConfig, GossipListener, RuntimeInfo};
pub use message::{BinaryMessageType, CreateShardRequest, GossipMessageType, Message, MESSAGE_VERSION};
pub use node_state::{GossipNodeState, HandshakeEvent, HandshakeState, RuntimeChange};
pub use peer_list::{PeerListStore, PEER_LIST_FILE};
pub use pool::{ConnectionPool, PoolConfig};
pub use transport::{NetworkTransport, TransportConfig, TransportHandler};
pub use udp::UdpTransport;

/// Register descriptions for the metrics emitted by this crate
pub fn describe_metrics() {
    use metrics::{describe_counter, describe_gauge, describe_histogram};

    describe_counter!("xyzfs_transport_sent_total", "Requests acknowledged by a peer");
    describe_counter!("xyzfs_transport_retries_total", "Request attempts that had to be retried");
    describe_counter!("xyzfs_pool_discarded_total", "Pooled connections discarded after a failure");
    describe_counter!("xyzfs_gossip_handshakes_total", "Gossip handshakes established");
    describe_gauge!("xyzfs_gossip_fresh_peers", "Peers inside the freshness window");
    describe_histogram!(
        "xyzfs_profiler_latency_seconds",
        "Latency of profiled operations by outcome"
    );
}
