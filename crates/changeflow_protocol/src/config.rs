//! System configuration shared by the server and the CLI.

use crate::defaults::{
    DEFAULT_CHANNEL_CAPACITY, DEFAULT_MAX_CONCURRENT_PLAN_CHECKS,
    DEFAULT_PLAN_CHECK_INTERVAL_SECS, DEFAULT_RUNNER_INTERVAL_SECS,
    DEFAULT_SIGNAL_POLL_INTERVAL_SECS, DEFAULT_WEBHOOK_TIMEOUT_SECS,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// License plan tiers, lowest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PlanTier {
    #[default]
    Free,
    Team,
    Enterprise,
}

/// Canonical system configuration.
///
/// Every field has a default so a partial TOML file is valid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SystemConfig {
    /// SQLite database file. Relative paths resolve against the home dir.
    pub database_path: PathBuf,
    /// Interval of the approval finder and slow-query runners.
    pub runner_interval_secs: u64,
    /// Interval of the plan-check scheduler when nothing tickles it.
    pub plan_check_interval_secs: u64,
    /// Interval at which signals written by other replicas are polled.
    pub signal_poll_interval_secs: u64,
    /// Capacity of each scheduler channel.
    pub channel_capacity: usize,
    /// Concurrent plan-check runs.
    pub max_concurrent_plan_checks: usize,
    /// Timeout for one webhook delivery attempt.
    pub webhook_timeout_secs: u64,
    /// Licensed plan tier.
    pub plan: PlanTier,
    /// Replica identifier written into signals.
    pub replica_id: String,
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from("changeflow.db"),
            runner_interval_secs: DEFAULT_RUNNER_INTERVAL_SECS,
            plan_check_interval_secs: DEFAULT_PLAN_CHECK_INTERVAL_SECS,
            signal_poll_interval_secs: DEFAULT_SIGNAL_POLL_INTERVAL_SECS,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            max_concurrent_plan_checks: DEFAULT_MAX_CONCURRENT_PLAN_CHECKS,
            webhook_timeout_secs: DEFAULT_WEBHOOK_TIMEOUT_SECS,
            plan: PlanTier::Enterprise,
            replica_id: "replica-0".to_string(),
        }
    }
}

/// Errors raised while loading the configuration file.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },
}

impl SystemConfig {
    /// Loads configuration from a TOML file. A missing file yields defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        toml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })
    }

    pub fn runner_interval(&self) -> Duration {
        Duration::from_secs(self.runner_interval_secs.max(1))
    }

    pub fn plan_check_interval(&self) -> Duration {
        Duration::from_secs(self.plan_check_interval_secs.max(1))
    }

    pub fn signal_poll_interval(&self) -> Duration {
        Duration::from_secs(self.signal_poll_interval_secs.max(1))
    }

    pub fn webhook_timeout(&self) -> Duration {
        Duration::from_secs(self.webhook_timeout_secs.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_yields_defaults() {
        let dir = tempfile::TempDir::new().unwrap();
        let config = SystemConfig::load(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config, SystemConfig::default());
    }

    #[test]
    fn test_partial_file_keeps_other_defaults() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("changeflow.toml");
        std::fs::write(&path, "plan = \"free\"\nrunner_interval_secs = 3\n").unwrap();
        let config = SystemConfig::load(&path).unwrap();
        assert_eq!(config.plan, PlanTier::Free);
        assert_eq!(config.runner_interval_secs, 3);
        assert_eq!(config.channel_capacity, DEFAULT_CHANNEL_CAPACITY);
    }

    #[test]
    fn test_malformed_file_is_error() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "plan = [").unwrap();
        assert!(matches!(
            SystemConfig::load(&path),
            Err(ConfigError::Parse { .. })
        ));
    }
}
