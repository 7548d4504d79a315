//! PomoNode: top-level coordinator for the networking layer.
//!
//! [`PomoNode`] is the primary public API for pomo_network. It owns:
//! - the [`Host`] (listener, peer connections, topic pub/sub)
//! - LAN discovery (find peers on the local network)
//! - the [`RoomManager`] (membership and state of one room)
//!
//! All background work hangs off one shutdown signal, so [`PomoNode::close`]
//! tears everything down.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::config::NetworkConfig;
use crate::discovery::{DiscoveryConfig, DiscoveryEvent, DiscoveryService};
use crate::error::NetworkError;
use crate::host::Host;
use crate::identity::{NodeIdentity, PeerId};
use crate::message::Member;
use crate::peer::PeerInfo;
use crate::room::RoomManager;
use crate::shutdown::Shutdown;

/// A pomo network node.
///
/// Create one per application instance with [`PomoNode::new`], then call
/// [`start()`](PomoNode::start) to begin discovering peers.
pub struct PomoNode {
    identity: Arc<NodeIdentity>,
    config: NetworkConfig,
    host: Arc<Host>,
    discovery: Arc<DiscoveryService>,
    rooms: RoomManager,
    shutdown: Shutdown,
    started: AtomicBool,
}

impl PomoNode {
    /// Bind the host and build discovery and the room manager. Failing to
    /// bind the host is the only fatal error.
    pub async fn new(identity: NodeIdentity, config: NetworkConfig) -> Result<Self, NetworkError> {
        let identity = Arc::new(identity);
        let shutdown = Shutdown::new();

        let host = Host::bind(
            Arc::clone(&identity),
            config.listen_addr,
            config.connection_timeout,
            shutdown.child(),
        )
        .await?;

        let discovery = DiscoveryService::new(
            Arc::clone(&host),
            DiscoveryConfig::from_network(&config),
            shutdown.child(),
        );
        let rooms = RoomManager::new(
            Arc::clone(&host),
            identity.name.clone(),
            &config,
            shutdown.child(),
        );

        info!(
            "Node '{}' ({}) ready on {}",
            identity.name,
            identity.peer_id,
            host.listen_addr()
        );

        Ok(Self {
            identity,
            config,
            host,
            discovery,
            rooms,
            shutdown,
            started: AtomicBool::new(false),
        })
    }

    /// Create a node with an ephemeral identity and default config.
    pub async fn with_defaults(name: impl Into<String>) -> Result<Self, NetworkError> {
        Self::new(NodeIdentity::generate(name), NetworkConfig::default()).await
    }

    /// Start LAN discovery (when enabled) and dial the bootstrap peers.
    ///
    /// A discovery failure is logged and otherwise ignored; the node keeps
    /// working with manual and bootstrap connections.
    pub async fn start(&self) -> Result<(), NetworkError> {
        if self.shutdown.is_triggered() {
            return Err(NetworkError::NotRunning);
        }
        if self.started.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        if self.config.discovery_enabled {
            if let Err(e) = self.discovery.start().await {
                warn!("Discovery start failed (non-fatal): {e}");
            }
        }

        for addr in &self.config.known_peers {
            let addr = addr.clone();
            let host = Arc::clone(&self.host);
            tokio::spawn(async move {
                match host.connect(&addr).await {
                    Ok(peer_id) => info!("Connected to bootstrap peer {peer_id} at {addr}"),
                    Err(e) => warn!("Failed to connect to bootstrap peer {addr}: {e}"),
                }
            });
        }

        info!("Node {} started", self.identity.peer_id);
        Ok(())
    }

    /// Dial a peer by address.
    pub async fn connect_to(&self, addr: &str) -> Result<PeerId, NetworkError> {
        self.host.connect(addr).await
    }

    /// Leave any room, stop discovery and shut the host down. Safe to call
    /// more than once.
    pub async fn close(&self) {
        if self.shutdown.is_triggered() {
            return;
        }
        self.rooms.close().await;
        self.discovery.stop();
        self.host.close();
        self.shutdown.trigger();
        info!("Node {} closed", self.identity.peer_id);
    }

    /// Return the node's peer ID.
    pub fn peer_id(&self) -> &PeerId {
        &self.identity.peer_id
    }

    pub fn identity(&self) -> &NodeIdentity {
        &self.identity
    }

    pub fn config(&self) -> &NetworkConfig {
        &self.config
    }

    /// The address peers can dial.
    pub fn listen_addr(&self) -> SocketAddr {
        self.host.listen_addr()
    }

    pub fn is_running(&self) -> bool {
        !self.shutdown.is_triggered()
    }

    pub fn host(&self) -> &Arc<Host> {
        &self.host
    }

    pub fn discovery(&self) -> &Arc<DiscoveryService> {
        &self.discovery
    }

    pub fn rooms(&self) -> &RoomManager {
        &self.rooms
    }

    // ── Convenience pass-throughs ─────────────────────────────────────

    pub async fn join_room(&self, room_key: &str) -> Result<(), NetworkError> {
        self.rooms.join_room(room_key).await
    }

    pub async fn leave_room(&self) -> Result<(), NetworkError> {
        self.rooms.leave_room().await
    }

    pub async fn broadcast_state(&self, member: Member) -> Result<usize, NetworkError> {
        self.rooms.broadcast_state(member).await
    }

    pub fn members(&self) -> Option<HashMap<String, Member>> {
        self.rooms.members()
    }

    pub fn peers(&self) -> HashMap<PeerId, PeerInfo> {
        self.discovery.peers()
    }

    pub fn connected_peers(&self) -> Vec<PeerInfo> {
        self.discovery.connected_peers()
    }

    /// Subscribe to peer-found / peer-lost events.
    pub fn discovery_events(&self) -> broadcast::Receiver<DiscoveryEvent> {
        self.discovery.subscribe()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
