//! Peer registry: tracking discovered peers, their liveness and last known
//! activity state.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::identity::PeerId;
use crate::message::MemberState;

/// Information about a peer seen on the local network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerInfo {
    /// The peer's unique identifier.
    pub id: PeerId,
    /// Dialable addresses the peer announced.
    pub addresses: Vec<String>,
    /// Whether a live connection to the peer exists.
    pub connected: bool,
    /// Last time the peer was announced or seen connected.
    pub last_seen: DateTime<Utc>,
    /// Last activity state reported for the peer.
    pub state: MemberState,
}

impl PeerInfo {
    /// A freshly observed, unconnected, idle peer.
    pub fn observed(id: PeerId, addresses: Vec<String>) -> Self {
        Self {
            id,
            addresses,
            connected: false,
            last_seen: Utc::now(),
            state: MemberState::Idle,
        }
    }
}

/// Result of a connectivity check for one peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Unchanged,
    Connected,
    Disconnected,
}

/// Registry of all known peers.
#[derive(Debug, Default)]
pub struct PeerRegistry {
    peers: HashMap<PeerId, PeerInfo>,
}

impl PeerRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            peers: HashMap::new(),
        }
    }

    /// Record an announcement. Returns `true` if the peer was not yet known;
    /// known peers only get their addresses and `last_seen` refreshed.
    pub fn observe(&mut self, peer_id: &PeerId, addresses: Vec<String>) -> bool {
        if let Some(peer) = self.peers.get_mut(peer_id) {
            peer.addresses = addresses;
            peer.last_seen = Utc::now();
            return false;
        }
        self.peers
            .insert(peer_id.clone(), PeerInfo::observed(peer_id.clone(), addresses));
        true
    }

    /// Add or replace a peer entry.
    pub fn add_peer(&mut self, info: PeerInfo) {
        self.peers.insert(info.id.clone(), info);
    }

    /// Remove a peer by ID.
    pub fn remove_peer(&mut self, peer_id: &PeerId) -> Option<PeerInfo> {
        self.peers.remove(peer_id)
    }

    /// Get a peer by ID.
    pub fn get_peer(&self, peer_id: &PeerId) -> Option<&PeerInfo> {
        self.peers.get(peer_id)
    }

    /// All known peers keyed by id.
    pub fn snapshot(&self) -> HashMap<PeerId, PeerInfo> {
        self.peers.clone()
    }

    /// IDs of every known peer.
    pub fn ids(&self) -> Vec<PeerId> {
        self.peers.keys().cloned().collect()
    }

    /// IDs of peers with a live connection.
    pub fn connected_ids(&self) -> Vec<PeerId> {
        self.peers
            .values()
            .filter(|p| p.connected)
            .map(|p| p.id.clone())
            .collect()
    }

    /// Return the total number of known peers.
    pub fn total_count(&self) -> usize {
        self.peers.len()
    }

    /// Mark a peer connected after a successful dial.
    pub fn mark_connected(&mut self, peer_id: &PeerId) {
        if let Some(peer) = self.peers.get_mut(peer_id) {
            peer.connected = true;
            peer.last_seen = Utc::now();
        }
    }

    /// Apply the result of a liveness probe and report the transition.
    pub fn set_connected(&mut self, peer_id: &PeerId, connected: bool) -> Transition {
        let Some(peer) = self.peers.get_mut(peer_id) else {
            return Transition::Unchanged;
        };
        let was_connected = peer.connected;
        peer.connected = connected;
        if connected {
            peer.last_seen = Utc::now();
        }
        match (was_connected, connected) {
            (true, false) => Transition::Disconnected,
            (false, true) => Transition::Connected,
            _ => Transition::Unchanged,
        }
    }

    /// Record the activity state reported for a peer.
    pub fn update_state(&mut self, peer_id: &PeerId, state: MemberState) {
        if let Some(peer) = self.peers.get_mut(peer_id) {
            peer.state = state;
            peer.last_seen = Utc::now();
        }
    }

    /// Drop every peer whose `last_seen` is older than `ttl` at `now`,
    /// regardless of connection state. Returns the removed ids.
    pub fn prune_stale(&mut self, now: DateTime<Utc>, ttl: Duration) -> Vec<PeerId> {
        let ttl = chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::MAX);
        let stale: Vec<PeerId> = self
            .peers
            .values()
            .filter(|p| now.signed_duration_since(p.last_seen) > ttl)
            .map(|p| p.id.clone())
            .collect();
        for id in &stale {
            self.peers.remove(id);
        }
        stale
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(id: &str) -> PeerId {
        PeerId::from_string(id)
    }

    #[test]
    fn test_observe_new_and_known() {
        let mut registry = PeerRegistry::new();
        assert!(registry.observe(&peer("alpha"), vec!["10.0.0.1:4000".into()]));
        assert!(!registry.observe(&peer("alpha"), vec!["10.0.0.2:4000".into()]));

        let info = registry.get_peer(&peer("alpha")).unwrap();
        assert_eq!(info.addresses, vec!["10.0.0.2:4000".to_string()]);
        assert!(!info.connected);
        assert_eq!(info.state, MemberState::Idle);
        assert_eq!(registry.total_count(), 1);
    }

    #[test]
    fn test_registry_remove() {
        let mut registry = PeerRegistry::new();
        registry.observe(&peer("beta"), Vec::new());
        assert!(registry.remove_peer(&peer("beta")).is_some());
        assert_eq!(registry.total_count(), 0);
    }

    #[test]
    fn test_connection_transitions() {
        let mut registry = PeerRegistry::new();
        registry.observe(&peer("gamma"), Vec::new());

        assert_eq!(
            registry.set_connected(&peer("gamma"), false),
            Transition::Unchanged
        );
        assert_eq!(
            registry.set_connected(&peer("gamma"), true),
            Transition::Connected
        );
        assert_eq!(
            registry.set_connected(&peer("gamma"), true),
            Transition::Unchanged
        );
        assert_eq!(
            registry.set_connected(&peer("gamma"), false),
            Transition::Disconnected
        );
        assert_eq!(
            registry.set_connected(&peer("unknown"), true),
            Transition::Unchanged
        );
    }

    #[test]
    fn test_connected_ids() {
        let mut registry = PeerRegistry::new();
        for id in ["delta", "epsilon", "zeta"] {
            registry.observe(&peer(id), Vec::new());
        }
        registry.mark_connected(&peer("delta"));
        registry.mark_connected(&peer("zeta"));

        let mut connected = registry.connected_ids();
        connected.sort();
        assert_eq!(connected, vec![peer("delta"), peer("zeta")]);
        assert_eq!(registry.snapshot().len(), 3);
    }

    #[test]
    fn test_update_state() {
        let mut registry = PeerRegistry::new();
        registry.observe(&peer("eta"), Vec::new());
        registry.update_state(&peer("eta"), MemberState::Work);
        assert_eq!(
            registry.get_peer(&peer("eta")).unwrap().state,
            MemberState::Work
        );
    }

    #[test]
    fn test_prune_stale_ignores_connection_state() {
        let mut registry = PeerRegistry::new();
        let now = Utc::now();

        let mut stale = PeerInfo::observed(peer("stale"), Vec::new());
        stale.last_seen = now - chrono::Duration::minutes(6);
        stale.connected = true;
        registry.add_peer(stale);

        let mut recent = PeerInfo::observed(peer("recent"), Vec::new());
        recent.last_seen = now - chrono::Duration::minutes(4);
        registry.add_peer(recent);

        let removed = registry.prune_stale(now, Duration::from_secs(300));
        assert_eq!(removed, vec![peer("stale")]);
        assert!(registry.get_peer(&peer("stale")).is_none());
        assert!(registry.get_peer(&peer("recent")).is_some());
    }
}
