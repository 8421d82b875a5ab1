//! Per-peer gossip state
//!
//! The handshake state is never stored; it is derived from the hello
//! timestamps. Zero means "never".

use serde::{Deserialize, Serialize};
use xyzfs_core::PerformanceStats;

/// Handshake progress with one peer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HandshakeState {
    /// Nothing sent or received
    Unknown,
    /// Hello travelled in one direction only
    HandshakeInProgress,
    /// Hellos travelled both ways
    Established,
}

/// Raised when a peer moves into `Established`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandshakeEvent {
    /// The peer had completed a handshake before, e.g. prior to a restart
    pub reestablished: bool,
}

/// Outcome of comparing a hello's runtime id with the recorded one
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeChange {
    Unchanged,
    /// No runtime id was known yet
    First,
    /// The peer restarted; state has been reset
    Restarted,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GossipNodeState {
    pub node: String,
    pub runtime_id: Option<String>,
    /// Unix seconds of the last hello we delivered
    pub last_hello_sent: u64,
    /// Unix seconds of the last hello we received
    pub last_hello_received: u64,
    pub stats: Option<PerformanceStats>,
    handshakes: u32,
}

impl GossipNodeState {
    pub fn new(node: impl Into<String>) -> Self {
        Self {
            node: node.into(),
            runtime_id: None,
            last_hello_sent: 0,
            last_hello_received: 0,
            stats: None,
            handshakes: 0,
        }
    }

    pub fn state(&self) -> HandshakeState {
        match (self.last_hello_sent > 0, self.last_hello_received > 0) {
            (true, true) => HandshakeState::Established,
            (false, false) => HandshakeState::Unknown,
            _ => HandshakeState::HandshakeInProgress,
        }
    }

    /// Completed handshakes since this state was created
    pub fn handshakes(&self) -> u32 {
        self.handshakes
    }

    pub fn mark_sent(&mut self, now: u64) -> Option<HandshakeEvent> {
        let before = self.state();
        self.last_hello_sent = now.max(1);
        self.transition(before)
    }

    pub fn mark_received(&mut self, now: u64) -> Option<HandshakeEvent> {
        let before = self.state();
        self.last_hello_received = now.max(1);
        self.transition(before)
    }

    fn transition(&mut self, before: HandshakeState) -> Option<HandshakeEvent> {
        if before == HandshakeState::Established || self.state() != HandshakeState::Established {
            return None;
        }
        self.handshakes += 1;
        Some(HandshakeEvent {
            reestablished: self.handshakes > 1,
        })
    }

    /// Record the runtime id carried by a hello, resetting on change.
    pub fn observe_runtime(&mut self, runtime_id: &str) -> RuntimeChange {
        match self.runtime_id.as_deref() {
            Some(known) if known == runtime_id => RuntimeChange::Unchanged,
            Some(_) => {
                self.reset();
                self.runtime_id = Some(runtime_id.to_string());
                RuntimeChange::Restarted
            }
            None => {
                self.runtime_id = Some(runtime_id.to_string());
                RuntimeChange::First
            }
        }
    }

    /// Back to `Unknown`.
    pub fn reset(&mut self) {
        self.last_hello_sent = 0;
        self.last_hello_received = 0;
        self.runtime_id = None;
    }

    /// Both directions were active within `window` seconds.
    pub fn is_fresh(&self, now: u64, window: u64) -> bool {
        self.state() == HandshakeState::Established
            && now.saturating_sub(self.last_hello_sent) <= window
            && now.saturating_sub(self.last_hello_received) <= window
    }

    /// Our last hello is at least `interval` seconds old.
    pub fn hello_due(&self, now: u64, interval: u64) -> bool {
        self.last_hello_sent == 0 || now.saturating_sub(self.last_hello_sent) >= interval
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handshake_progression() {
        let mut state = GossipNodeState::new("10.0.0.2");
        assert_eq!(state.state(), HandshakeState::Unknown);

        assert!(state.mark_sent(100).is_none());
        assert_eq!(state.state(), HandshakeState::HandshakeInProgress);

        let event = state.mark_received(101).unwrap();
        assert!(!event.reestablished);
        assert_eq!(state.state(), HandshakeState::Established);

        // Further hellos do not re-announce
        assert!(state.mark_sent(105).is_none());
        assert!(state.mark_received(106).is_none());
    }

    #[test]
    fn test_restart_resets_and_reestablishes() {
        let mut state = GossipNodeState::new("10.0.0.2");
        assert_eq!(state.observe_runtime("run-a"), RuntimeChange::First);
        state.mark_received(10);
        state.mark_sent(10);
        assert_eq!(state.observe_runtime("run-a"), RuntimeChange::Unchanged);

        assert_eq!(state.observe_runtime("run-b"), RuntimeChange::Restarted);
        assert_eq!(state.state(), HandshakeState::Unknown);
        assert_eq!(state.runtime_id.as_deref(), Some("run-b"));

        state.mark_received(20);
        let event = state.mark_sent(20).unwrap();
        assert!(event.reestablished);
        assert_eq!(state.handshakes(), 2);
    }

    #[test]
    fn test_freshness_window() {
        let mut state = GossipNodeState::new("n");
        state.mark_sent(100);
        assert!(!state.is_fresh(100, 10));
        state.mark_received(95);
        assert!(state.is_fresh(105, 10));
        assert!(!state.is_fresh(106, 10));
    }

    #[test]
    fn test_hello_due() {
        let mut state = GossipNodeState::new("n");
        assert!(state.hello_due(50, 5));
        state.mark_sent(50);
        assert!(!state.hello_due(54, 5));
        assert!(state.hello_due(55, 5));
    }
}
