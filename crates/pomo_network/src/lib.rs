//! Pomo Network: LAN presence for pomodoro sessions.
//!
//! This crate lets independent pomo processes on a local network find each
//! other, gather in a named room and keep an eventually consistent view of
//! every member's activity (working, resting or idle, timer, current task).
//!
//! # Architecture
//!
//! - **Identity**: Ed25519 keypair persisted to disk; the peer id is derived
//!   from the public key.
//! - **Host**: WebSocket (via `tokio-tungstenite`) connections between peers,
//!   authenticated with a signed hello, plus topic publish/subscribe with
//!   flood forwarding.
//! - **Discovery**: UDP broadcast on the LAN for automatic peer discovery,
//!   with connection monitoring and stale-peer cleanup.
//! - **Rooms**: Join / Leave / StateUpdate messages folded into a
//!   last-write-wins member map.
//!
//! # Quick start
//!
//! ```rust,no_run
//! use pomo_network::{Member, MemberState, NetworkConfig, PomoNode, TimerInfo};
//! use pomo_network::identity::NodeIdentity;
//!
//! # async fn example() -> Result<(), pomo_network::NetworkError> {
//! let identity = NodeIdentity::generate("my-node");
//! let node = PomoNode::new(identity, NetworkConfig::default()).await?;
//! node.start().await?;
//!
//! node.join_room("team").await?;
//! let me = Member::new(
//!     node.peer_id().as_str(),
//!     "my-node",
//!     MemberState::Work,
//!     TimerInfo::default(),
//!     "write docs",
//! );
//! node.broadcast_state(me).await?;
//! println!("{:?}", node.members());
//!
//! node.close().await;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod discovery;
pub mod error;
pub mod host;
pub mod identity;
pub mod message;
pub mod node;
pub mod peer;
pub mod pubsub;
pub mod room;
pub mod shutdown;
pub mod transport;

// ── Re-exports for convenience ──────────────────────────────────────────

pub use config::NetworkConfig;
pub use discovery::{DiscoveryEvent, DiscoveryService};
pub use error::NetworkError;
pub use host::Host;
pub use identity::{NodeIdentity, PeerId};
pub use message::{Member, MemberState, Message, MessageKind, TimerInfo};
pub use node::PomoNode;
pub use peer::{PeerInfo, PeerRegistry};
pub use pubsub::{InboundMessage, Subscription, Topic};
pub use room::{Room, RoomManager};
pub use shutdown::Shutdown;
