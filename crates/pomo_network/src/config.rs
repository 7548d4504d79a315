//! Network configuration for a pomo node.

use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::NetworkError;

/// Configuration for the pomo networking layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Address to listen on for incoming peer connections.
    #[serde(with = "socket_addr_serde")]
    pub listen_addr: SocketAddr,

    /// Whether LAN discovery (UDP broadcast) is enabled.
    pub discovery_enabled: bool,

    /// UDP port used for LAN discovery announcements.
    pub discovery_port: u16,

    /// Interval between discovery announcements.
    #[serde(with = "duration_serde")]
    pub announce_interval: Duration,

    /// Timeout for establishing a new connection.
    #[serde(with = "duration_serde")]
    pub connection_timeout: Duration,

    /// How often tracked peers are checked for a live connection.
    #[serde(with = "duration_serde")]
    pub monitor_interval: Duration,

    /// How often stale peers are swept from the discovery table.
    #[serde(with = "duration_serde")]
    pub cleanup_interval: Duration,

    /// Age after which an unrefreshed peer is forgotten.
    #[serde(with = "duration_serde")]
    pub peer_ttl: Duration,

    /// Delay between subscribing to a room topic and announcing ourselves.
    #[serde(with = "duration_ms_serde")]
    pub join_grace: Duration,

    /// Prefix prepended to a room key to form its topic name.
    pub topic_prefix: String,

    /// List of bootstrap peer addresses to connect to on startup.
    pub known_peers: Vec<String>,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 0)),
            discovery_enabled: true,
            discovery_port: 9471,
            announce_interval: Duration::from_secs(5),
            connection_timeout: Duration::from_secs(10),
            monitor_interval: Duration::from_secs(30),
            cleanup_interval: Duration::from_secs(60),
            peer_ttl: Duration::from_secs(5 * 60),
            join_grace: Duration::from_millis(100),
            topic_prefix: "pomo-room-".to_string(),
            known_peers: Vec::new(),
        }
    }
}

impl NetworkConfig {
    /// The topic name for a room key.
    pub fn room_topic(&self, room_key: &str) -> String {
        format!("{}{room_key}", self.topic_prefix)
    }

    /// Save the config to a JSON file.
    pub fn save_to_file(&self, path: &Path) -> Result<(), NetworkError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    /// Load config from a JSON file, or return defaults if the file is missing.
    pub fn load_or_default(path: &Path) -> Self {
        if path.exists() {
            match std::fs::read_to_string(path) {
                Ok(data) => match serde_json::from_str::<NetworkConfig>(&data) {
                    Ok(config) => return config,
                    Err(e) => {
                        tracing::warn!("Corrupt config file, using defaults: {e}");
                    }
                },
                Err(e) => {
                    tracing::warn!("Cannot read config file, using defaults: {e}");
                }
            }
        }
        Self::default()
    }
}

// ---------------------------------------------------------------------------
// Serde helpers
// ---------------------------------------------------------------------------

mod socket_addr_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::net::SocketAddr;

    pub fn serialize<S: Serializer>(addr: &SocketAddr, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&addr.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<SocketAddr, D::Error> {
        let s = String::deserialize(d)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

mod duration_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(dur: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(dur.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = u64::deserialize(d)?;
        Ok(Duration::from_secs(secs))
    }
}

mod duration_ms_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(dur: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(dur.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let millis = u64::deserialize(d)?;
        Ok(Duration::from_millis(millis))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = NetworkConfig::default();
        assert_eq!(config.listen_addr.port(), 0);
        assert!(config.discovery_enabled);
        assert_eq!(config.discovery_port, 9471);
        assert_eq!(config.connection_timeout, Duration::from_secs(10));
        assert_eq!(config.monitor_interval, Duration::from_secs(30));
        assert_eq!(config.cleanup_interval, Duration::from_secs(60));
        assert_eq!(config.peer_ttl, Duration::from_secs(300));
        assert_eq!(config.join_grace, Duration::from_millis(100));
        assert!(config.known_peers.is_empty());
    }

    #[test]
    fn test_room_topic() {
        let config = NetworkConfig::default();
        assert_eq!(config.room_topic("focus"), "pomo-room-focus");
    }

    #[test]
    fn test_config_serialize_roundtrip() {
        let config = NetworkConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        let deserialized: NetworkConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(deserialized.listen_addr, config.listen_addr);
        assert_eq!(deserialized.join_grace, config.join_grace);
        assert_eq!(deserialized.peer_ttl, config.peer_ttl);
        assert_eq!(deserialized.topic_prefix, config.topic_prefix);
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let config: NetworkConfig = serde_json::from_str(r#"{"discovery_port": 10000}"#).unwrap();
        assert_eq!(config.discovery_port, 10000);
        assert_eq!(config.monitor_interval, Duration::from_secs(30));
    }

    #[test]
    fn test_config_save_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");

        let mut original = NetworkConfig::default();
        original.discovery_enabled = false;
        original.known_peers = vec!["192.168.1.100:9470".to_string()];
        original.save_to_file(&path).unwrap();

        let loaded = NetworkConfig::load_or_default(&path);
        assert!(!loaded.discovery_enabled);
        assert_eq!(loaded.known_peers.len(), 1);
    }

    #[test]
    fn test_config_load_missing_returns_default() {
        let dir = tempfile::tempdir().unwrap();
        let config = NetworkConfig::load_or_default(&dir.path().join("missing.json"));
        assert_eq!(config.discovery_port, 9471);
    }

    #[test]
    fn test_config_load_corrupt_returns_default() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, "{ nope").unwrap();

        let config = NetworkConfig::load_or_default(&path);
        assert!(config.discovery_enabled);
    }
}
