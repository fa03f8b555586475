// Configuration management for the chatrelay node
//
// Cross-platform config stored in:
// - macOS: ~/Library/Application Support/chatrelay/config.json
// - Linux: ~/.config/chatrelay/config.json
// - Windows: %APPDATA%\chatrelay\config.json

use anyhow::{Context, Result};
use chatrelay_core::relay::DEFAULT_SEEN_CAPACITY;
use chatrelay_core::RelayNodeConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    /// Interface to bind
    pub bind_host: String,

    /// Port for client and peer connections
    pub listen_port: u16,

    /// Address other nodes and clients dial to reach us
    pub advertised_address: Option<String>,

    /// Stable node id (random per start when unset)
    pub node_id: Option<String>,

    /// Neighbour nodes dialed on start
    pub neighbours: Vec<String>,

    /// Network settings
    pub network: NetworkConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Close idle clients after this many seconds (0 disables)
    pub heartbeat_timeout: u64,

    /// Duplicate envelope cache size
    pub seen_cache_capacity: usize,

    /// Largest accepted frame in bytes
    pub max_frame_bytes: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_host: "0.0.0.0".to_string(),
            listen_port: 3000,
            advertised_address: None,
            node_id: None,
            neighbours: vec![
                // Empty by default - operators add their own
            ],
            network: NetworkConfig::default(),
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            heartbeat_timeout: 0,
            seen_cache_capacity: DEFAULT_SEEN_CAPACITY,
            max_frame_bytes: 1024 * 1024,
        }
    }
}

impl Config {
    /// Get the config directory path (cross-platform)
    pub fn config_dir() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .context("Failed to determine config directory")?
            .join("chatrelay");
        Ok(config_dir)
    }

    /// Get the default config file path
    pub fn config_file() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.json"))
    }

    /// Load config from `path`, or create it with defaults if missing
    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let contents = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file {}", path.display()))?;
            let config: Config =
                serde_json::from_str(&contents).context("Failed to parse config file")?;
            Ok(config)
        } else {
            let config = Config::default();
            config.save_to(path)?;
            Ok(config)
        }
    }

    /// Save config to `path`, creating parent directories
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).context("Failed to create config directory")?;
        }
        let contents = serde_json::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(path, contents)
            .with_context(|| format!("Failed to write config file {}", path.display()))?;
        Ok(())
    }

    /// Add a neighbour; returns false if it was already listed
    pub fn add_neighbour(&mut self, address: &str) -> bool {
        if self.neighbours.iter().any(|n| n == address) {
            return false;
        }
        self.neighbours.push(address.to_string());
        true
    }

    /// Remove a neighbour; returns false if it was not listed
    pub fn remove_neighbour(&mut self, address: &str) -> bool {
        let before = self.neighbours.len();
        self.neighbours.retain(|n| n != address);
        self.neighbours.len() != before
    }

    /// Set a config value
    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        match key {
            "bind_host" => self.bind_host = value.to_string(),
            "listen_port" => {
                self.listen_port = value.parse().context("Invalid port number")?;
            }
            "advertised_address" => {
                self.advertised_address = (!value.is_empty()).then(|| value.to_string());
            }
            "node_id" => {
                self.node_id = (!value.is_empty()).then(|| value.to_string());
            }
            "heartbeat_timeout" => {
                self.network.heartbeat_timeout = value.parse().context("Invalid number")?;
            }
            "seen_cache_capacity" => {
                self.network.seen_cache_capacity = value.parse().context("Invalid number")?;
            }
            "max_frame_bytes" => {
                self.network.max_frame_bytes = value.parse().context("Invalid number")?;
            }
            _ => anyhow::bail!("Unknown config key: {}", key),
        }
        Ok(())
    }

    /// List all config values
    pub fn list(&self) -> Vec<(String, String)> {
        vec![
            ("bind_host".to_string(), self.bind_host.clone()),
            ("listen_port".to_string(), self.listen_port.to_string()),
            (
                "advertised_address".to_string(),
                self.advertised_address
                    .clone()
                    .unwrap_or_else(|| "(bound address)".to_string()),
            ),
            (
                "node_id".to_string(),
                self.node_id.clone().unwrap_or_else(|| "(random)".to_string()),
            ),
            (
                "heartbeat_timeout".to_string(),
                match self.network.heartbeat_timeout {
                    0 => "off".to_string(),
                    secs => format!("{}s", secs),
                },
            ),
            (
                "seen_cache_capacity".to_string(),
                self.network.seen_cache_capacity.to_string(),
            ),
            (
                "max_frame_bytes".to_string(),
                self.network.max_frame_bytes.to_string(),
            ),
            ("neighbours".to_string(), self.neighbours.join(", ")),
        ]
    }

    /// Relay node settings derived from this file
    pub fn node_config(&self) -> RelayNodeConfig {
        RelayNodeConfig {
            listen_addr: format!("{}:{}", self.bind_host, self.listen_port),
            advertised_address: self.advertised_address.clone(),
            node_id: self.node_id.clone(),
            neighbours: self.neighbours.clone(),
            heartbeat_timeout: match self.network.heartbeat_timeout {
                0 => None,
                secs => Some(Duration::from_secs(secs)),
            },
            seen_cache_capacity: self.network.seen_cache_capacity,
            max_frame_bytes: self.network.max_frame_bytes,
            ..Default::default()
        }
    }
}
