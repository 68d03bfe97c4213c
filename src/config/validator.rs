// src/config/validator.rs

use crate::config::{
    AgentConfig, CacheConfig, ConfigError, FirewallConfig, NetworkConfig, StorageConfig,
};

/// Semantic checks the schema cannot express
pub struct ConfigValidator {}

impl ConfigValidator {
    /// Creates a new configuration validator
    pub fn new() -> Self {
        Self {}
    }

    /// Validates a configuration
    pub fn validate(&self, config: &AgentConfig) -> Result<(), ConfigError> {
        self.validate_cache(&config.cache)?;
        self.validate_network(&config.network)?;
        self.validate_firewall(&config.firewall)?;
        self.validate_storage(&config.storage)?;
        Ok(())
    }

    fn validate_cache(&self, cache: &CacheConfig) -> Result<(), ConfigError> {
        if !cache.directory.is_absolute() {
            return Err(ConfigError::ValidationError(format!(
                "Cache directory must be absolute: {}",
                cache.directory.display()
            )));
        }
        Ok(())
    }

    fn validate_network(&self, network: &NetworkConfig) -> Result<(), ConfigError> {
        if network.private_bridge == network.public_bridge {
            return Err(ConfigError::ValidationError(
                "Private and public bridges must differ".to_string(),
            ));
        }
        Ok(())
    }

    /// Validates firewall configuration
    fn validate_firewall(&self, firewall: &FirewallConfig) -> Result<(), ConfigError> {
        if firewall.in_chain_prefix == firewall.out_chain_prefix {
            return Err(ConfigError::ValidationError(
                "Inbound and outbound chain prefixes must differ".to_string(),
            ));
        }

        if firewall.state_timeout_secs == 0 {
            return Err(ConfigError::ValidationError(
                "Firewall state timeout cannot be zero".to_string(),
            ));
        }

        if firewall.poll_interval() > firewall.state_timeout() {
            return Err(ConfigError::ValidationError(
                "Lock poll interval cannot exceed the state timeout".to_string(),
            ));
        }

        if !firewall.state_file.is_absolute() {
            return Err(ConfigError::ValidationError(format!(
                "Firewall state file must be absolute: {}",
                firewall.state_file.display()
            )));
        }

        Ok(())
    }

    fn validate_storage(&self, storage: &StorageConfig) -> Result<(), ConfigError> {
        if storage.backup_pool_pattern.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "Backup pool pattern cannot be blank".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for ConfigValidator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_identical_prefixes_rejected() {
        let mut config = AgentConfig::default();
        config.firewall.out_chain_prefix = config.firewall.in_chain_prefix.clone();
        assert!(ConfigValidator::new().validate(&config).is_err());
    }

    #[test]
    fn test_poll_interval_longer_than_timeout_rejected() {
        let mut config = AgentConfig::default();
        config.firewall.state_timeout_secs = 1;
        config.firewall.poll_interval_ms = 5_000;
        assert!(ConfigValidator::new().validate(&config).is_err());
    }

    #[test]
    fn test_relative_cache_dir_rejected() {
        let mut config = AgentConfig::default();
        config.cache.directory = PathBuf::from("cache");
        assert!(ConfigValidator::new().validate(&config).is_err());
    }
}
