/// Configuration management for the veleta client core
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::core::ServerAddress;
use crate::error::DriverResult;
use crate::select::strategy::StrategyKind;
use crate::select::ReadMode;
use crate::wire::DEFAULT_MAX_MESSAGE_SIZE;

/// Main client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Deployment to connect to
    pub deployment: DeploymentConfig,
    /// Per-server connection pool configuration
    pub pool: PoolConfig,
    /// Operation dispatch configuration
    pub operation: OperationConfig,
    /// Topology monitoring configuration
    pub monitor: MonitorConfig,
}

/// Deployment configuration.
///
/// The set of deployment kinds is closed: a standalone server or a replica
/// set. Sharded-router deployments are a distinct topology type this crate
/// does not model.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum DeploymentConfig {
    #[serde(rename = "standalone")]
    Standalone {
        /// Address of the single server, `host:port`
        address: String,
    },
    #[serde(rename = "replica_set")]
    ReplicaSet {
        /// Seed addresses, `host:port`; discovery expands this via gossip
        seeds: Vec<String>,
        /// Expected replica-set name; when absent, the first member's
        /// reported name is adopted
        set_name: Option<String>,
    },
}

/// Per-server connection pool configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Number of connections each server pool opens
    pub size: usize,
    /// Connect timeout in milliseconds
    pub connect_timeout_ms: u64,
}

/// Operation dispatch configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationConfig {
    /// Per-request timeout in milliseconds; 0 disables the timer
    pub request_timeout_ms: u64,
    /// Maximum operations buffered while the topology is not ready;
    /// exceeding it fails every buffered operation. None means unbounded.
    pub pending_buffer_limit: Option<usize>,
    /// Largest tolerated wire message; larger declared lengths are treated
    /// as stream corruption
    pub max_message_size_bytes: usize,
    /// Read preference applied when an operation does not carry one
    pub default_read_mode: ReadMode,
}

/// Topology monitoring configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// HA monitor tick interval in milliseconds
    pub ha_interval_ms: u64,
    /// Ping strategy probe interval in milliseconds
    pub ping_interval_ms: u64,
    /// Fence above the lowest observed latency within which a candidate is
    /// still eligible, in milliseconds
    pub acceptable_latency_ms: u64,
    /// Latency-based selection strategy; None falls back to round-robin
    pub strategy: Option<StrategyKind>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            deployment: DeploymentConfig::ReplicaSet {
                seeds: vec!["127.0.0.1:27017".to_string()],
                set_name: None,
            },
            pool: PoolConfig {
                size: 5,
                connect_timeout_ms: 10_000,
            },
            operation: OperationConfig {
                request_timeout_ms: 30_000,
                pending_buffer_limit: Some(1000),
                max_message_size_bytes: DEFAULT_MAX_MESSAGE_SIZE,
                default_read_mode: ReadMode::Primary,
            },
            monitor: MonitorConfig {
                ha_interval_ms: 2_000,
                ping_interval_ms: 5_000,
                acceptable_latency_ms: 15,
                strategy: None,
            },
        }
    }
}

impl ClientConfig {
    /// Load configuration from a TOML file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|e| ConfigError::IoError(e.to_string()))?;

        let config: ClientConfig =
            toml::from_str(&content).map_err(|e| ConfigError::ParseError(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let content =
            toml::to_string_pretty(self).map_err(|e| ConfigError::SerializeError(e.to_string()))?;

        fs::write(path, content).map_err(|e| ConfigError::IoError(e.to_string()))?;

        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        match &self.deployment {
            DeploymentConfig::Standalone { address } => {
                ServerAddress::parse(address).map_err(|_| {
                    ConfigError::ValidationError(format!("Invalid server address: {address}"))
                })?;
            }
            DeploymentConfig::ReplicaSet { seeds, set_name } => {
                if seeds.is_empty() {
                    return Err(ConfigError::ValidationError(
                        "seeds cannot be empty".to_string(),
                    ));
                }
                for seed in seeds {
                    ServerAddress::parse(seed).map_err(|_| {
                        ConfigError::ValidationError(format!("Invalid seed address: {seed}"))
                    })?;
                }
                if let Some(name) = set_name {
                    if name.trim().is_empty() {
                        return Err(ConfigError::ValidationError(
                            "set_name cannot be blank".to_string(),
                        ));
                    }
                }
            }
        }

        if self.pool.size == 0 {
            return Err(ConfigError::ValidationError(
                "pool size must be greater than 0".to_string(),
            ));
        }

        if self.pool.connect_timeout_ms == 0 {
            return Err(ConfigError::ValidationError(
                "connect_timeout_ms must be greater than 0".to_string(),
            ));
        }

        if self.operation.max_message_size_bytes < crate::wire::HEADER_SIZE {
            return Err(ConfigError::ValidationError(
                "max_message_size_bytes is smaller than the wire header".to_string(),
            ));
        }

        if self.monitor.ha_interval_ms == 0 {
            return Err(ConfigError::ValidationError(
                "ha_interval_ms must be greater than 0".to_string(),
            ));
        }

        if self.monitor.strategy == Some(StrategyKind::Ping) && self.monitor.ping_interval_ms == 0 {
            return Err(ConfigError::ValidationError(
                "ping_interval_ms must be greater than 0 for the ping strategy".to_string(),
            ));
        }

        Ok(())
    }

    /// Seed addresses for discovery (the standalone address counts as its
    /// own one-element seed list)
    pub fn seed_addresses(&self) -> DriverResult<Vec<ServerAddress>> {
        match &self.deployment {
            DeploymentConfig::Standalone { address } => Ok(vec![ServerAddress::parse(address)?]),
            DeploymentConfig::ReplicaSet { seeds, .. } => {
                seeds.iter().map(|s| ServerAddress::parse(s)).collect()
            }
        }
    }

    /// Configured replica-set name, when any
    pub fn set_name(&self) -> Option<&str> {
        match &self.deployment {
            DeploymentConfig::Standalone { .. } => None,
            DeploymentConfig::ReplicaSet { set_name, .. } => set_name.as_deref(),
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.pool.connect_timeout_ms)
    }

    pub fn request_timeout(&self) -> Option<Duration> {
        match self.operation.request_timeout_ms {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        }
    }

    pub fn ha_interval(&self) -> Duration {
        Duration::from_millis(self.monitor.ha_interval_ms)
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_millis(self.monitor.ping_interval_ms)
    }

    pub fn acceptable_latency(&self) -> Duration {
        Duration::from_millis(self.monitor.acceptable_latency_ms)
    }
}

/// Configuration error types
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    IoError(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Serialize error: {0}")]
    SerializeError(String),

    #[error("Validation error: {0}")]
    ValidationError(String),
}
