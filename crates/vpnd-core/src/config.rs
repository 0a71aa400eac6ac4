//! Engine Configuration

use crate::settings::Settings;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Termination attempts before giving up on a disconnect
    pub terminate_attempts: u32,
    /// Delay between termination attempts (ms)
    pub retry_delay_ms: u64,
    /// Mirror the audit log to this file
    pub log_file: Option<PathBuf>,
    /// Persist settings to this TOML file
    pub settings_file: Option<PathBuf>,
    /// Settings used when no settings file exists
    pub initial_settings: Settings,
}

impl EngineConfig {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.terminate_attempts == 0 {
            return Err(ConfigError::NoTerminateAttempts);
        }
        Ok(())
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            terminate_attempts: 3,
            retry_delay_ms: 500,
            log_file: None,
            settings_file: None,
            initial_settings: Settings::default(),
        }
    }
}

/// Configuration errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConfigError {
    #[error("terminate_attempts must be at least 1")]
    NoTerminateAttempts,

    #[error("engine must be created inside a Tokio runtime")]
    NoRuntime,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_default() {
        let config = EngineConfig::default();

        assert_eq!(config.terminate_attempts, 3);
        assert_eq!(config.retry_delay(), Duration::from_millis(500));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_attempts_invalid() {
        let config = EngineConfig {
            terminate_attempts: 0,
            ..EngineConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_toml() {
        let config: EngineConfig = toml::from_str("retry_delay_ms = 10").unwrap();

        assert_eq!(config.retry_delay_ms, 10);
        assert_eq!(config.terminate_attempts, 3);
    }
}
