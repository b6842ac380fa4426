//! Core configuration types and loading.

use serde::Deserialize;
use slroom_proto::ServerName;
use std::path::Path;
use thiserror::Error;

use super::input::{BackfillConfig, InputConfig};
use super::links::LinkBlock;
use super::storage::StorageConfig;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Server identity.
    pub server: ServerConfig,
    /// Event, snapshot and output log storage.
    #[serde(default)]
    pub storage: StorageConfig,
    /// Input pipeline tuning.
    #[serde(default)]
    pub input: InputConfig,
    /// Backfill limits.
    #[serde(default)]
    pub backfill: BackfillConfig,
    /// Peer servers hosted in this process.
    #[serde(default)]
    pub links: Vec<LinkBlock>,
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    /// In-memory configuration for a named server with default tuning.
    pub fn for_server(name: &ServerName) -> Self {
        Self {
            server: ServerConfig {
                name: name.to_string(),
                perspective_servers: Vec::new(),
                metrics_port: Some(0),
                log_format: LogFormat::Text,
            },
            storage: StorageConfig::memory(),
            input: InputConfig::default(),
            backfill: BackfillConfig::default(),
            links: Vec::new(),
        }
    }

    /// The validated server name.
    ///
    /// Callers are expected to have run [`super::validate`] first.
    pub fn server_name(&self) -> Result<ServerName, slroom_proto::IdParseError> {
        ServerName::parse(self.server.name.as_str())
    }

    /// Perspective servers that parse; invalid entries are reported by validation.
    pub fn perspective_servers(&self) -> Vec<ServerName> {
        self.server
            .perspective_servers
            .iter()
            .filter_map(|s| ServerName::parse(s.as_str()).ok())
            .collect()
    }
}

/// Server identity configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Server name (e.g., "rooms.straylight.net").
    pub name: String,
    /// Servers trusted first when backfilling, in preference order.
    #[serde(default)]
    pub perspective_servers: Vec<String>,
    /// Prometheus metrics HTTP port (default: 9090, 0 disables).
    pub metrics_port: Option<u16>,
    /// Log output format.
    #[serde(default)]
    pub log_format: LogFormat,
}

/// Log output format for the tracing subscriber.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}
