// src/config/mod.rs

pub mod schema;
pub mod validator;

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

/// Prefix of environment variables overriding file values.
pub const ENV_PREFIX: &str = "VIRTANCE_AGENT";

/// Complete configuration of the compute-node agent
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Template image cache
    pub cache: CacheConfig,

    /// Host bridges
    pub network: NetworkConfig,

    /// Packet filter and lock settings
    pub firewall: FirewallConfig,

    /// Storage pool conventions
    pub storage: StorageConfig,

    /// Logging output
    pub logging: LoggingConfig,
}

/// Template image cache configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Directory holding downloaded templates
    pub directory: PathBuf,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("/var/lib/libvirt/template_cache"),
        }
    }
}

/// Host bridge configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Bridge carrying floating IP aliases
    pub external_bridge: String,

    /// Bridge for the public interface of a virtance
    pub public_bridge: String,

    /// Bridge for the tenant-private interface
    pub private_bridge: String,

    /// Bridge for the VPC interface
    pub vpc_bridge: String,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            external_bridge: "br-ext".to_string(),
            public_bridge: "br-ext".to_string(),
            private_bridge: "br-int".to_string(),
            vpc_bridge: "br-vpc".to_string(),
        }
    }
}

/// Packet filter configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FirewallConfig {
    /// Prefix of per-entity inbound chains
    pub in_chain_prefix: String,

    /// Prefix of per-entity outbound chains
    pub out_chain_prefix: String,

    /// Line at which jump rules are inserted into the forward chain
    pub insert_line: u32,

    /// Suffix appended to the live FORWARD/PREROUTING chain names
    pub chain_suffix: String,

    /// File holding the host-wide lock state
    pub state_file: PathBuf,

    /// Maximum wait for the lock, in seconds
    pub state_timeout_secs: u64,

    /// Lock poll interval, in milliseconds
    pub poll_interval_ms: u64,
}

impl Default for FirewallConfig {
    fn default() -> Self {
        Self {
            in_chain_prefix: "FW_I_".to_string(),
            out_chain_prefix: "FW_O_".to_string(),
            insert_line: 2,
            chain_suffix: String::new(),
            state_file: PathBuf::from("/var/run/firewalld/locked"),
            state_timeout_secs: 120,
            poll_interval_ms: 1000,
        }
    }
}

impl FirewallConfig {
    /// Lock acquisition timeout
    pub fn state_timeout(&self) -> Duration {
        Duration::from_secs(self.state_timeout_secs)
    }

    /// Lock poll interval
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Storage pool conventions
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Case-insensitive substring identifying backup pools
    pub backup_pool_pattern: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backup_pool_pattern: "backup".to_string(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter directive, overridden by `RUST_LOG`
    pub level: String,

    /// Output format
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Plain,
        }
    }
}

/// Log format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable text
    Plain,

    /// One JSON object per line
    Json,
}

/// Configuration manager
pub struct ConfigManager {
    /// Current active configuration
    config: AgentConfig,

    /// Configuration file path
    config_path: Option<PathBuf>,
}

impl ConfigManager {
    /// Creates a manager holding the default configuration
    pub fn new() -> Self {
        Self {
            config: AgentConfig::default(),
            config_path: None,
        }
    }

    /// Loads configuration from a YAML file layered with environment overrides
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if !path.is_file() {
            return Err(ConfigError::FileReadError {
                path: path.display().to_string(),
                error: "file does not exist".to_string(),
            });
        }

        let settings = config::Config::builder()
            .add_source(config::File::from(path).format(config::FileFormat::Yaml))
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| ConfigError::ParseError(e.to_string()))?;

        let config: AgentConfig = settings
            .try_deserialize()
            .map_err(|e| ConfigError::ParseError(e.to_string()))?;

        let manager = Self::from_config(config)?;
        info!("Configuration loaded from {}", path.display());

        Ok(Self {
            config_path: Some(path.to_path_buf()),
            ..manager
        })
    }

    /// Wraps an in-memory configuration after validating it
    pub fn from_config(config: AgentConfig) -> Result<Self, ConfigError> {
        let manager = Self {
            config,
            config_path: None,
        };
        manager.validate()?;
        Ok(manager)
    }

    /// Saves the current configuration as YAML
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let config_str = serde_yaml::to_string(&self.config)
            .map_err(|e| ConfigError::SerializationError(e.to_string()))?;

        std::fs::write(&path, config_str).map_err(|e| ConfigError::FileWriteError {
            path: path.as_ref().display().to_string(),
            error: e.to_string(),
        })?;

        info!("Configuration saved to {}", path.as_ref().display());
        Ok(())
    }

    /// Validates the current configuration against the schema and semantic rules
    pub fn validate(&self) -> Result<(), ConfigError> {
        let value = serde_json::to_value(&self.config)
            .map_err(|e| ConfigError::SerializationError(e.to_string()))?;
        schema::validate_config_against_schema(&value).map_err(ConfigError::ValidationError)?;

        validator::ConfigValidator::new().validate(&self.config)?;
        debug!("Configuration validated successfully");
        Ok(())
    }

    /// Gets the current configuration
    pub fn get_config(&self) -> &AgentConfig {
        &self.config
    }

    /// Path the configuration was loaded from, if any
    pub fn config_path(&self) -> Option<&Path> {
        self.config_path.as_deref()
    }
}

impl Default for ConfigManager {
    fn default() -> Self {
        Self::new()
    }
}

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read configuration file {path}: {error}")]
    FileReadError { path: String, error: String },

    #[error("Failed to write configuration file {path}: {error}")]
    FileWriteError { path: String, error: String },

    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    #[error("Failed to serialize configuration: {0}")]
    SerializationError(String),

    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}
