//! Network error types.

use std::time::Duration;

/// Errors that can occur in the pomo_network crate.
#[derive(Debug, thiserror::Error)]
pub enum NetworkError {
    /// A transport-level error (WebSocket connect/send/receive).
    #[error("Transport error: {0}")]
    Transport(String),

    /// The requested peer was not found or could not be reached.
    #[error("Peer not found: {0}")]
    PeerNotFound(String),

    /// JSON serialization / deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Discovery subsystem error.
    #[error("Discovery error: {0}")]
    Discovery(String),

    /// The connection handshake failed or the remote identity did not check out.
    #[error("Handshake failed: {0}")]
    Handshake(String),

    /// Key material could not be loaded, created or used.
    #[error("Identity error: {0}")]
    Identity(String),

    /// A protocol message failed validation.
    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    /// An operation that needs an active room was issued outside of one.
    #[error("Not in a room")]
    NotInRoom,

    /// The topic already has an open handle on this host.
    #[error("Topic already joined: {0}")]
    TopicAlreadyJoined(String),

    /// The topic handle was closed.
    #[error("Topic closed: {0}")]
    TopicClosed(String),

    /// An operation timed out.
    #[error("Timeout after {0:?}")]
    Timeout(Duration),

    /// The node (or host) has been shut down.
    #[error("Node not running")]
    NotRunning,

    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
