//! Broker configuration
//!
//! Loads broker settings from a TOML file. Every section is optional and a
//! missing file yields the defaults.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use crate::connection::DEFAULT_OUTBOUND_QUEUE;
use crate::room::slugify;

/// Default configuration file name
pub const CONFIG_FILE: &str = "broker.toml";

/// Default listening port
pub const DEFAULT_PORT: u16 = 3001;

/// Default WebSocket endpoint path
pub const DEFAULT_PATH: &str = "/ws";

/// Errors that can occur during config operations
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Read(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Listener settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ServerSettings {
    /// Address to bind to
    pub bind: String,
    /// Port to listen on
    pub port: u16,
    /// Path of the WebSocket endpoint
    pub path: String,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1".to_string(),
            port: DEFAULT_PORT,
            path: DEFAULT_PATH.to_string(),
        }
    }
}

/// Per-connection limits
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Limits {
    /// Frames buffered per connection before it is dropped as too slow
    pub outbound_queue: usize,
    /// Close connections that stay silent this long
    pub idle_timeout_secs: Option<u64>,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            outbound_queue: DEFAULT_OUTBOUND_QUEUE,
            idle_timeout_secs: None,
        }
    }
}

/// A room created at startup and kept while empty
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RoomPreset {
    /// Display name
    pub name: String,
    /// Room id, derived from the name when omitted
    #[serde(default)]
    pub id: Option<String>,
}

impl RoomPreset {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            id: None,
        }
    }

    /// Room id clients use to address this room
    pub fn room_id(&self) -> String {
        self.id.clone().unwrap_or_else(|| slugify(&self.name))
    }
}

/// Display name for a member identifier
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MemberProfile {
    pub id: String,
    pub name: String,
}

/// Broker configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct BrokerConfig {
    /// Announce joins and leaves to the room
    #[serde(default)]
    pub announce_membership: bool,
    #[serde(default)]
    pub server: ServerSettings,
    #[serde(default)]
    pub limits: Limits,
    /// Rooms seeded at startup
    #[serde(default)]
    pub rooms: Vec<RoomPreset>,
    /// Known members
    #[serde(default)]
    pub members: Vec<MemberProfile>,
}

impl BrokerConfig {
    /// Load configuration from a file, falling back to defaults when absent
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parse configuration from TOML text
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    /// Override the bind address
    pub fn with_bind(mut self, bind: Option<String>) -> Self {
        if let Some(bind) = bind {
            self.server.bind = bind;
        }
        self
    }

    /// Override the port
    pub fn with_port(mut self, port: Option<u16>) -> Self {
        if let Some(port) = port {
            self.server.port = port;
        }
        self
    }

    /// Override the endpoint path
    pub fn with_path(mut self, path: Option<String>) -> Self {
        if let Some(path) = path {
            self.server.path = path;
        }
        self
    }

    /// Get the socket address to bind to
    pub fn socket_addr(&self) -> String {
        format!("{}:{}", self.server.bind, self.server.port)
    }

    /// Idle timeout, if configured
    pub fn idle_timeout(&self) -> Option<Duration> {
        self.limits.idle_timeout_secs.map(Duration::from_secs)
    }

    /// Display name for a member, or the identifier itself
    pub fn display_name<'a>(&'a self, member_id: &'a str) -> &'a str {
        self.members
            .iter()
            .find(|m| m.id == member_id)
            .map(|m| m.name.as_str())
            .unwrap_or(member_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn test_default_config() {
        let config = BrokerConfig::default();
        assert_eq!(config.socket_addr(), "127.0.0.1:3001");
        assert_eq!(config.server.path, "/ws");
        assert_eq!(config.limits.outbound_queue, DEFAULT_OUTBOUND_QUEUE);
        assert!(config.idle_timeout().is_none());
        assert!(!config.announce_membership);
        assert!(config.rooms.is_empty());
    }

    #[test]
    fn test_load_nonexistent_returns_default() {
        let dir = tempdir().unwrap();
        let config = BrokerConfig::load(&dir.path().join(CONFIG_FILE)).unwrap();
        assert_eq!(config, BrokerConfig::default());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE);
        fs::write(
            &path,
            r#"
announce_membership = true

[server]
bind = "0.0.0.0"
port = 4000

[limits]
idle_timeout_secs = 30

[[rooms]]
name = "Public"

[[rooms]]
name = "Private Channel"

[[rooms]]
name = "Lobby"
id = "main"

[[members]]
id = "JohnCena"
name = "Johnathan Cena"
"#,
        )
        .unwrap();

        let config = BrokerConfig::load(&path).unwrap();
        assert!(config.announce_membership);
        assert_eq!(config.socket_addr(), "0.0.0.0:4000");
        // Unspecified keys keep their defaults
        assert_eq!(config.server.path, "/ws");
        assert_eq!(config.limits.outbound_queue, DEFAULT_OUTBOUND_QUEUE);
        assert_eq!(config.idle_timeout(), Some(Duration::from_secs(30)));

        let ids: Vec<String> = config.rooms.iter().map(|r| r.room_id()).collect();
        assert_eq!(ids, vec!["public", "private_channel", "main"]);
        assert_eq!(config.display_name("JohnCena"), "Johnathan Cena");
        assert_eq!(config.display_name("someone"), "someone");
    }

    #[test]
    fn test_invalid_toml() {
        let result = BrokerConfig::from_toml("[server\nport = 1");
        assert!(matches!(result, Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_cli_overrides() {
        let config = BrokerConfig::default()
            .with_bind(Some("0.0.0.0".to_string()))
            .with_port(Some(9000))
            .with_path(None);
        assert_eq!(config.socket_addr(), "0.0.0.0:9000");
        assert_eq!(config.server.path, "/ws");
    }
}
