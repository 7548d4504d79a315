//! LAN peer discovery via UDP broadcast.
//!
//! The [`DiscoveryService`] periodically broadcasts an announcement packet
//! on the local network and listens for announcements from other peers.
//! Newly seen peers are recorded in a [`PeerRegistry`], dialed in the
//! background and reported as [`DiscoveryEvent`]s. Two more loops keep the
//! registry honest: a connection monitor and a stale-peer sweep.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::net::UdpSocket;
use tokio::sync::broadcast;
use tracing::{debug, info, trace, warn};

use crate::config::NetworkConfig;
use crate::error::NetworkError;
use crate::host::Host;
use crate::identity::PeerId;
use crate::message::MemberState;
use crate::peer::{PeerInfo, PeerRegistry, Transition};
use crate::shutdown::Shutdown;

/// Capacity of the discovery event channel.
const EVENT_CHANNEL_SIZE: usize = 64;

/// Largest announcement packet accepted.
const MAX_PACKET: usize = 4096;

/// An announcement broadcast by a peer on the LAN.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Announcement {
    /// The peer's unique ID.
    pub peer_id: PeerId,
    /// Addresses the peer accepts WebSocket connections on.
    pub listen_addrs: Vec<String>,
    /// Human-readable node name.
    pub name: String,
    /// Software version.
    pub version: String,
}

/// An announcement together with where it came from.
#[derive(Debug, Clone)]
pub struct DiscoveredPeer {
    /// The discovered peer's announcement.
    pub announcement: Announcement,
    /// The source address of the UDP packet.
    pub source_addr: SocketAddr,
}

impl DiscoveredPeer {
    /// Dialable addresses for the peer. Unspecified hosts (`0.0.0.0`) are
    /// replaced with the packet's source ip.
    pub fn addresses(&self) -> Vec<String> {
        self.announcement
            .listen_addrs
            .iter()
            .map(|addr| match addr.parse::<SocketAddr>() {
                Ok(parsed) if parsed.ip().is_unspecified() => {
                    SocketAddr::new(self.source_addr.ip(), parsed.port()).to_string()
                }
                _ => addr.clone(),
            })
            .collect()
    }
}

/// Peer arrival and departure notifications.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryEvent {
    PeerFound(PeerId),
    PeerLost(PeerId),
}

/// Configuration for the discovery service.
#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    /// UDP port to broadcast on and listen on.
    pub port: u16,
    /// How often to broadcast an announcement.
    pub announce_interval: Duration,
    pub monitor_interval: Duration,
    pub cleanup_interval: Duration,
    /// Age after which an unrefreshed peer is dropped.
    pub peer_ttl: Duration,
    /// Upper bound on each connection attempt to a discovered peer.
    pub connection_timeout: Duration,
}

impl DiscoveryConfig {
    pub fn from_network(config: &NetworkConfig) -> Self {
        Self {
            port: config.discovery_port,
            announce_interval: config.announce_interval,
            monitor_interval: config.monitor_interval,
            cleanup_interval: config.cleanup_interval,
            peer_ttl: config.peer_ttl,
            connection_timeout: config.connection_timeout,
        }
    }
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self::from_network(&NetworkConfig::default())
    }
}

/// LAN discovery service using UDP broadcast.
pub struct DiscoveryService {
    host: Arc<Host>,
    config: DiscoveryConfig,
    announcement: Announcement,
    peers: RwLock<PeerRegistry>,
    events: broadcast::Sender<DiscoveryEvent>,
    parent_shutdown: Shutdown,
    running: Mutex<Option<Shutdown>>,
}

impl DiscoveryService {
    /// Create a stopped service that announces `host`. Background loops are
    /// bound to a child of `shutdown`.
    pub fn new(host: Arc<Host>, config: DiscoveryConfig, shutdown: Shutdown) -> Arc<Self> {
        let identity = host.identity();
        let announcement = Announcement {
            peer_id: identity.peer_id.clone(),
            listen_addrs: vec![host.listen_addr().to_string()],
            name: identity.name.clone(),
            version: identity.version.clone(),
        };
        let (events, _) = broadcast::channel(EVENT_CHANNEL_SIZE);

        Arc::new(Self {
            host,
            config,
            announcement,
            peers: RwLock::new(PeerRegistry::new()),
            events,
            parent_shutdown: shutdown,
            running: Mutex::new(None),
        })
    }

    /// The announcement this node broadcasts.
    pub fn announcement(&self) -> &Announcement {
        &self.announcement
    }

    /// Receive peer-found / peer-lost events from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<DiscoveryEvent> {
        self.events.subscribe()
    }

    /// Start the discovery service in the background.
    ///
    /// Spawns four tasks: the announcement broadcaster, the announcement
    /// listener, the connection monitor and the stale-peer cleanup. Fails if
    /// the discovery socket cannot be bound.
    pub async fn start(self: &Arc<Self>) -> Result<(), NetworkError> {
        let bind_addr = SocketAddr::from(([0, 0, 0, 0], self.config.port));

        let listener_socket = UdpSocket::bind(bind_addr)
            .await
            .map_err(|e| NetworkError::Discovery(format!("Bind failed: {e}")))?;
        listener_socket
            .set_broadcast(true)
            .map_err(|e| NetworkError::Discovery(format!("Set broadcast: {e}")))?;

        let sender_socket = UdpSocket::bind("0.0.0.0:0")
            .await
            .map_err(|e| NetworkError::Discovery(format!("Sender bind: {e}")))?;
        sender_socket
            .set_broadcast(true)
            .map_err(|e| NetworkError::Discovery(format!("Set broadcast: {e}")))?;

        let announcement_bytes = serde_json::to_vec(&self.announcement)?;

        let signal = self.parent_shutdown.child();
        if let Some(previous) = self.running.lock().replace(signal.clone()) {
            previous.trigger();
        }

        info!("Discovery service listening on {bind_addr}");

        let broadcast_addr = SocketAddr::from(([255, 255, 255, 255], self.config.port));
        tokio::spawn(Self::broadcast_loop(
            sender_socket,
            announcement_bytes,
            broadcast_addr,
            self.config.announce_interval,
            signal.clone(),
        ));
        tokio::spawn(Arc::clone(self).listen_loop(listener_socket, signal.clone()));
        tokio::spawn(Arc::clone(self).monitor_loop(signal.clone()));
        tokio::spawn(Arc::clone(self).cleanup_loop(signal));
        Ok(())
    }

    /// Stop every background loop and release the sockets.
    pub fn stop(&self) {
        if let Some(signal) = self.running.lock().take() {
            signal.trigger();
            info!("Discovery service stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.running
            .lock()
            .as_ref()
            .is_some_and(|signal| !signal.is_triggered())
    }

    async fn broadcast_loop(
        socket: UdpSocket,
        packet: Vec<u8>,
        target: SocketAddr,
        every: Duration,
        shutdown: Shutdown,
    ) {
        let mut ticker = tokio::time::interval(every);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match socket.send_to(&packet, target).await {
                        Ok(_) => trace!("Broadcast announcement sent"),
                        Err(e) => debug!("Broadcast send failed: {e}"),
                    }
                }
                _ = shutdown.cancelled() => {
                    debug!("Discovery broadcaster shutting down");
                    break;
                }
            }
        }
    }

    async fn listen_loop(self: Arc<Self>, socket: UdpSocket, shutdown: Shutdown) {
        let mut buf = vec![0u8; MAX_PACKET];
        loop {
            tokio::select! {
                result = socket.recv_from(&mut buf) => match result {
                    Ok((len, src_addr)) => self.handle_packet(&buf[..len], src_addr),
                    Err(e) => warn!("Discovery recv error: {e}"),
                },
                _ = shutdown.cancelled() => {
                    debug!("Discovery listener shutting down");
                    break;
                }
            }
        }
    }

    async fn monitor_loop(self: Arc<Self>, shutdown: Shutdown) {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.config.monitor_interval) => self.check_connections(),
                _ = shutdown.cancelled() => break,
            }
        }
    }

    async fn cleanup_loop(self: Arc<Self>, shutdown: Shutdown) {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.config.cleanup_interval) => {
                    self.prune_stale(Utc::now());
                }
                _ = shutdown.cancelled() => break,
            }
        }
    }

    /// Parse one datagram and feed it to discovery. Our own announcements and
    /// garbage are ignored.
    fn handle_packet(self: &Arc<Self>, packet: &[u8], src_addr: SocketAddr) {
        let announcement = match serde_json::from_slice::<Announcement>(packet) {
            Ok(announcement) => announcement,
            Err(e) => {
                trace!("Ignoring malformed announcement from {src_addr}: {e}");
                return;
            }
        };
        if announcement.peer_id == self.announcement.peer_id {
            return;
        }

        let discovered = DiscoveredPeer {
            announcement,
            source_addr: src_addr,
        };
        let addresses = discovered.addresses();
        self.handle_peer_found(&discovered.announcement.peer_id, addresses);
    }

    /// Record a peer observation. A new peer is added idle and unconnected,
    /// dialed in the background and reported; a known one only has its
    /// addresses and `last_seen` refreshed. Returns `true` for new peers.
    pub fn handle_peer_found(self: &Arc<Self>, peer_id: &PeerId, addresses: Vec<String>) -> bool {
        let is_new = self.peers.write().observe(peer_id, addresses.clone());
        if !is_new {
            trace!("Refreshed peer {peer_id}");
            return false;
        }

        info!("Discovered peer {peer_id} at {addresses:?}");
        let service = Arc::clone(self);
        let id = peer_id.clone();
        tokio::spawn(async move {
            let timeout = service.config.connection_timeout;
            match tokio::time::timeout(timeout, service.host.connect_peer(&id, &addresses)).await {
                Ok(Ok(())) => {
                    service.peers.write().mark_connected(&id);
                    info!("Connected to discovered peer {id}");
                }
                Ok(Err(e)) => warn!("Connection to discovered peer {id} failed: {e}"),
                Err(_) => warn!("Connection to discovered peer {id} timed out"),
            }
        });

        let _ = self.events.send(DiscoveryEvent::PeerFound(peer_id.clone()));
        true
    }

    /// Compare every tracked peer against the host's live connections.
    pub fn check_connections(&self) {
        let mut lost = Vec::new();
        {
            let mut peers = self.peers.write();
            for id in peers.ids() {
                match peers.set_connected(&id, self.host.is_connected(&id)) {
                    Transition::Disconnected => {
                        info!("Peer {id} disconnected");
                        lost.push(id);
                    }
                    Transition::Connected => debug!("Peer {id} connected"),
                    Transition::Unchanged => {}
                }
            }
        }
        for id in lost {
            let _ = self.events.send(DiscoveryEvent::PeerLost(id));
        }
    }

    /// Forget peers not seen within the ttl. Returns the removed ids.
    pub fn prune_stale(&self, now: DateTime<Utc>) -> Vec<PeerId> {
        let removed = self.peers.write().prune_stale(now, self.config.peer_ttl);
        for id in &removed {
            info!("Removed stale peer {id}");
        }
        removed
    }

    /// Copy of every known peer.
    pub fn peers(&self) -> HashMap<PeerId, PeerInfo> {
        self.peers.read().snapshot()
    }

    /// Copies of the peers currently marked connected.
    pub fn connected_peers(&self) -> Vec<PeerInfo> {
        let peers = self.peers.read();
        peers
            .connected_ids()
            .iter()
            .filter_map(|id| peers.get_peer(id).cloned())
            .collect()
    }

    /// Record the activity state reported for a peer.
    pub fn update_peer_state(&self, peer_id: &PeerId, state: MemberState) {
        self.peers.write().update_state(peer_id, state);
    }

    pub fn peer_info(&self, peer_id: &PeerId) -> Option<PeerInfo> {
        self.peers.read().get_peer(peer_id).cloned()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
