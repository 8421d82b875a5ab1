//! Node selection for writes
//!
//! The router picks one node out of the gossip membership. Candidates are
//! every known peer; the local node is only a candidate when no peer is known.

use rand::seq::SliceRandom;
use std::sync::Arc;
use tracing::debug;
use xyzfs_core::{Result, XyzError};
use xyzfs_network::Gossip;

/// View of cluster membership used for routing
pub trait Membership: Send + Sync {
    /// Known peers, local node excluded
    fn nodes(&self) -> Vec<String>;

    /// Whether `node` exchanged hellos recently in both directions
    fn is_fresh(&self, node: &str) -> bool;

    /// Whether `node` names this process
    fn is_local(&self, node: &str) -> bool;

    /// Name this node is reachable under
    fn local_node(&self) -> String;
}

impl Membership for Gossip {
    fn nodes(&self) -> Vec<String> {
        Gossip::nodes(self)
    }

    fn is_fresh(&self, node: &str) -> bool {
        Gossip::is_fresh(self, node)
    }

    fn is_local(&self, node: &str) -> bool {
        self.runtime().is_local(node)
    }

    fn local_node(&self) -> String {
        self.runtime().node_name()
    }
}

/// Filters applied by [`NodeRouter::pick_node`]
#[derive(Debug, Clone, Copy, Default)]
pub struct RouteCriteria {
    /// Never return an alias of this node
    pub exclude_local: bool,
}

impl RouteCriteria {
    pub fn remote_only() -> Self {
        Self { exclude_local: true }
    }
}

pub struct NodeRouter {
    membership: Arc<dyn Membership>,
}

impl NodeRouter {
    pub fn new(membership: Arc<dyn Membership>) -> Self {
        Self { membership }
    }

    /// Every node that passes `criteria`, in random order
    pub fn candidates(&self, criteria: RouteCriteria) -> Vec<String> {
        let peers = self.membership.nodes();
        let mut candidates: Vec<String> = if peers.is_empty() {
            vec![self.membership.local_node()]
        } else {
            peers
        };

        candidates.retain(|node| {
            let local = self.membership.is_local(node);
            if criteria.exclude_local && local {
                return false;
            }
            local || self.membership.is_fresh(node)
        });
        candidates.shuffle(&mut rand::thread_rng());
        candidates
    }

    /// Pick one node, uniformly at random among the candidates.
    pub fn pick_node(&self, criteria: RouteCriteria) -> Result<String> {
        let node = self
            .candidates(criteria)
            .into_iter()
            .next()
            .ok_or(XyzError::NoAvailableNode)?;
        debug!(node = %node, exclude_local = criteria.exclude_local, "Node picked");
        Ok(node)
    }

    pub fn is_local(&self, node: &str) -> bool {
        self.membership.is_local(node)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::HashMap;

    /// Static membership for tests
    #[derive(Default)]
    pub(crate) struct StaticMembership {
        pub peers: Mutex<HashMap<String, bool>>,
    }

    impl StaticMembership {
        pub fn with_peers(peers: &[(&str, bool)]) -> Arc<Self> {
            let map = peers.iter().map(|(n, f)| (n.to_string(), *f)).collect();
            Arc::new(Self {
                peers: Mutex::new(map),
            })
        }
    }

    impl Membership for StaticMembership {
        fn nodes(&self) -> Vec<String> {
            let mut nodes: Vec<String> = self.peers.lock().keys().cloned().collect();
            nodes.sort();
            nodes
        }

        fn is_fresh(&self, node: &str) -> bool {
            self.peers.lock().get(node).copied().unwrap_or(false)
        }

        fn is_local(&self, node: &str) -> bool {
            node == "localhost"
        }

        fn local_node(&self) -> String {
            "localhost".to_string()
        }
    }

    #[test]
    fn test_no_peers_falls_back_to_local() {
        let router = NodeRouter::new(StaticMembership::with_peers(&[]));
        assert_eq!(router.pick_node(RouteCriteria::default()).unwrap(), "localhost");
        assert!(matches!(
            router.pick_node(RouteCriteria::remote_only()),
            Err(XyzError::NoAvailableNode)
        ));
    }

    #[test]
    fn test_stale_peers_are_skipped() {
        let router = NodeRouter::new(StaticMembership::with_peers(&[
            ("10.0.0.1", false),
            ("10.0.0.2", true),
        ]));
        for _ in 0..50 {
            assert_eq!(router.pick_node(RouteCriteria::remote_only()).unwrap(), "10.0.0.2");
        }
    }

    #[test]
    fn test_all_stale_is_no_available_node() {
        let router = NodeRouter::new(StaticMembership::with_peers(&[("10.0.0.1", false)]));
        assert!(matches!(
            router.pick_node(RouteCriteria::default()),
            Err(XyzError::NoAvailableNode)
        ));
    }

    #[test]
    fn test_pick_is_spread_across_fresh_peers() {
        let router = NodeRouter::new(StaticMembership::with_peers(&[
            ("10.0.0.1", true),
            ("10.0.0.2", true),
            ("10.0.0.3", true),
        ]));
        let mut seen = std::collections::HashSet::new();
        for _ in 0..200 {
            seen.insert(router.pick_node(RouteCriteria::default()).unwrap());
        }
        assert_eq!(seen.len(), 3);
    }
}
