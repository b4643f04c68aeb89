//! # Configuration Management
//!
//! One explicit `Config` value, loaded from YAML and passed into the
//! constructors that need it. There is no process-global configuration
//! state anywhere in the workspace.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub general: GeneralConfig,
    pub network: NetworkConfig,
    pub database: DatabaseConfig,
    pub api: ApiConfig,
    pub websocket: WebsocketConfig,
    /// Consumed by the adapters; the core never reads it.
    pub auth: AuthConfig,
}

impl Config {
    /// Load configuration from a YAML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref()).map_err(|e| Error::Io {
            message: format!("failed to read config {:?}", path.as_ref()),
            source: e,
        })?;
        serde_yaml::from_str(&raw).map_err(|e| Error::malformed("config", e.to_string()))
    }

    /// Write the configuration as YAML.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let raw = serde_yaml::to_string(self)
            .map_err(|e| Error::internal(format!("config serialization: {e}")))?;
        std::fs::write(path.as_ref(), raw).map_err(|e| Error::Io {
            message: format!("failed to write config {:?}", path.as_ref()),
            source: e,
        })?;
        Ok(())
    }
}

/// General node settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    pub data_dir: PathBuf,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
        }
    }
}

/// Peer-to-peer networking settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Multiaddresses the swarm binds.
    pub listen_addresses: Vec<String>,
    /// Peers dialed at startup.
    pub bootstrap_peers: Vec<String>,
    pub mdns: MdnsConfig,
    pub dht: DhtConfig,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            listen_addresses: vec![
                "/ip4/0.0.0.0/tcp/9000".to_string(),
                "/ip4/0.0.0.0/udp/9001/quic-v1".to_string(),
            ],
            bootstrap_peers: Vec::new(),
            mdns: MdnsConfig::default(),
            dht: DhtConfig::default(),
        }
    }
}

/// LAN discovery tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MdnsConfig {
    pub enabled: bool,
    /// Retained for config compatibility; the DNS-SD service name itself is
    /// fixed by the mDNS implementation.
    pub service_name: String,
    /// Query interval in seconds.
    pub interval: u64,
}

impl Default for MdnsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            service_name: "meshdb".to_string(),
            interval: 10,
        }
    }
}

/// WAN discovery tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DhtConfig {
    pub enabled: bool,
    /// `client` or `server`.
    pub mode: String,
    /// Seconds between bootstrap rounds.
    pub bootstrap_interval: u64,
}

impl Default for DhtConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            mode: "client".to_string(),
            bootstrap_interval: 300,
        }
    }
}

/// Database-level settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub backup: BackupConfig,
}

/// Scheduled snapshot policy
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackupConfig {
    pub auto_backup: bool,
    /// Seconds between automatic snapshots.
    pub interval: u64,
    /// Oldest backups beyond this count are pruned. Zero keeps everything.
    pub max_backups: usize,
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            auto_backup: false,
            interval: 3600,
            max_backups: 5,
        }
    }
}

/// HTTP API settings (adapter-level)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub enabled: bool,
    pub port: u16,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: 8080,
        }
    }
}

/// WebSocket feed settings (adapter-level)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WebsocketConfig {
    pub enabled: bool,
    pub port: u16,
}

impl Default for WebsocketConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: 8081,
        }
    }
}

/// Opaque to the core; the HTTP adapter hands it to whatever principal
/// authority is plugged in.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    pub jwt: JwtConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct JwtConfig {
    pub secret: String,
    /// Token lifetime in seconds.
    pub expiration: u64,
}

impl Default for JwtConfig {
    fn default() -> Self {
        Self {
            secret: String::new(),
            expiration: 86_400,
        }
    }
}
