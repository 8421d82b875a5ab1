//! Hook used by shards to publish their index to the rest of the cluster.
//!
//! The storage crate knows nothing about peers; the node wires in an
//! implementation that fans the bytes out over the binary transport.

use uuid::Uuid;

pub trait IndexBroadcaster: Send + Sync {
    /// Fire-and-forget: implementations must not block on the network.
    fn broadcast_index(&self, shard_id: Uuid, index_bytes: Vec<u8>);
}

/// Broadcaster that drops every index; used when a shard has no cluster.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopBroadcaster;

impl IndexBroadcaster for NoopBroadcaster {
    fn broadcast_index(&self, _shard_id: Uuid, _index_bytes: Vec<u8>) {}
}
