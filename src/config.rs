use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{Error, Result};

fn default_total_permits() -> u32 {
    1
}

fn default_query_timeout_secs() -> u64 {
    10
}

fn default_acquire_poll_millis() -> u64 {
    1000
}

fn default_heartbeat_interval_ms() -> u64 {
    10_000
}

fn default_heartbeat_timeout_multiplier() -> u32 {
    4
}

/// Per-semaphore configuration, loadable from TOML file.
#[derive(Debug, Clone, Deserialize)]
pub struct SemaphoreConfig {
    /// Initial permit capacity when this process creates the semaphore row.
    #[serde(default = "default_total_permits")]
    pub total_permits: u32,
    /// Fail construction if the semaphore already exists with a different
    /// total capacity.
    #[serde(default)]
    pub strict: bool,
    /// Per-statement ceiling applied to every transaction.
    #[serde(default = "default_query_timeout_secs")]
    pub query_timeout_secs: u64,
    /// Maximum wait between acquire retries under contention.
    #[serde(default = "default_acquire_poll_millis")]
    pub acquire_poll_millis: u64,
    /// Declared beat interval for this process's liveness row.
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
    /// A liveness row older than `interval * multiplier` is dead.
    #[serde(default = "default_heartbeat_timeout_multiplier")]
    pub heartbeat_timeout_multiplier: u32,
}

impl Default for SemaphoreConfig {
    fn default() -> Self {
        Self {
            total_permits: default_total_permits(),
            strict: false,
            query_timeout_secs: default_query_timeout_secs(),
            acquire_poll_millis: default_acquire_poll_millis(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            heartbeat_timeout_multiplier: default_heartbeat_timeout_multiplier(),
        }
    }
}

impl SemaphoreConfig {
    /// Load config from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        let config: SemaphoreConfig =
            toml::from_str(&content).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.query_timeout_secs == 0 {
            return Err(Error::Config("query_timeout_secs must be >= 1".into()));
        }
        if self.acquire_poll_millis == 0 {
            return Err(Error::Config("acquire_poll_millis must be >= 1".into()));
        }
        if self.heartbeat_interval_ms == 0 {
            return Err(Error::Config("heartbeat_interval_ms must be >= 1".into()));
        }
        if self.heartbeat_timeout_multiplier < 2 {
            return Err(Error::Config(
                "heartbeat_timeout_multiplier must be >= 2".into(),
            ));
        }
        Ok(())
    }

    pub fn query_timeout(&self) -> Duration {
        Duration::from_secs(self.query_timeout_secs)
    }

    pub fn acquire_poll(&self) -> Duration {
        Duration::from_millis(self.acquire_poll_millis)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = SemaphoreConfig::default();
        assert_eq!(config.total_permits, 1);
        assert!(!config.strict);
        assert_eq!(config.query_timeout_secs, 10);
        assert_eq!(config.acquire_poll_millis, 1000);
        assert_eq!(config.heartbeat_interval_ms, 10_000);
        assert_eq!(config.heartbeat_timeout_multiplier, 4);
        config.validate().unwrap();
    }

    #[test]
    fn test_partial_toml_fills_defaults() {
        let config: SemaphoreConfig =
            toml::from_str("total_permits = 8\nstrict = true").unwrap();
        assert_eq!(config.total_permits, 8);
        assert!(config.strict);
        assert_eq!(config.heartbeat_interval_ms, 10_000);
    }

    #[test]
    fn test_validate_rejects_zero_intervals() {
        let config = SemaphoreConfig {
            heartbeat_interval_ms: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = SemaphoreConfig {
            heartbeat_timeout_multiplier: 1,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
