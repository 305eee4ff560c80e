//! `config.yaml`: primary group, bulk-reset rate and call timeouts.
//!
//! ```yaml
//! primary_group: "100"
//! sync_all:
//!   calls_per_second: 1.0
//! call_timeout_secs: 30
//! topology: /srv/rolesync/topology.yaml
//! ```
//!
//! Every field is optional; a missing file yields [`Config::default`].

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::paths::{config_path, topology_path};
use crate::types::GroupId;

pub const DEFAULT_CALLS_PER_SECOND: f64 = 1.0;
pub const DEFAULT_CALL_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Source-of-truth group for explicit resets.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub primary_group: Option<GroupId>,

    #[serde(default)]
    pub sync_all: SyncAllConfig,

    /// Upper bound on any single platform call; `0` disables the timeout.
    #[serde(default = "default_call_timeout_secs")]
    pub call_timeout_secs: u64,

    /// Topology snapshot served by the daemon's platform adapter.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topology: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SyncAllConfig {
    #[serde(default = "default_calls_per_second")]
    pub calls_per_second: f64,
}

impl Default for SyncAllConfig {
    fn default() -> Self {
        Self {
            calls_per_second: DEFAULT_CALLS_PER_SECOND,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            primary_group: None,
            sync_all: SyncAllConfig::default(),
            call_timeout_secs: DEFAULT_CALL_TIMEOUT_SECS,
            topology: None,
        }
    }
}

fn default_calls_per_second() -> f64 {
    DEFAULT_CALLS_PER_SECOND
}

fn default_call_timeout_secs() -> u64 {
    DEFAULT_CALL_TIMEOUT_SECS
}

impl Config {
    /// Load `<home>/.rolesync/config.yaml`, falling back to defaults when absent.
    pub fn load_at(home: &Path) -> Result<Self, ConfigError> {
        let path = config_path(home);
        if !path.exists() {
            return Ok(Self::default());
        }
        let contents = std::fs::read_to_string(&path).map_err(|e| ConfigError::Io {
            path: path.clone(),
            source: e,
        })?;
        let config: Config = serde_yaml::from_str(&contents)
            .map_err(|e| ConfigError::Parse { path, source: e })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let cps = self.sync_all.calls_per_second;
        if !cps.is_finite() || cps <= 0.0 {
            return Err(ConfigError::Invalid(format!(
                "sync_all.calls_per_second must be a positive number, got {cps}"
            )));
        }
        if let Some(primary) = &self.primary_group {
            if primary.0.trim().is_empty() {
                return Err(ConfigError::Invalid("primary_group is empty".to_string()));
            }
        }
        Ok(())
    }

    /// `None` when timeouts are disabled.
    pub fn call_timeout(&self) -> Option<Duration> {
        (self.call_timeout_secs > 0).then(|| Duration::from_secs(self.call_timeout_secs))
    }

    /// Resolved topology path, defaulting to `<home>/.rolesync/topology.yaml`.
    pub fn topology_path_at(&self, home: &Path) -> PathBuf {
        self.topology
            .clone()
            .unwrap_or_else(|| topology_path(home))
    }
}
