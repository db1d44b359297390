//! Runtime configuration for the queue core.
//!
//! The host application may ship a small JSON file; every field has a
//! default so an absent or partial file is fine.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct QueueConfig {
    /// Where the job database lives. `None` means the canonical location
    /// under the user's home directory (`db::default_database_path`).
    pub database_path: Option<PathBuf>,
    /// Upper bound on how long the idle processor sleeps between
    /// eligibility checks when no event wakes it sooner.
    pub idle_poll_ms: u64,
    /// Capacity of the lifecycle event broadcast channel.
    pub event_capacity: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            database_path: None,
            idle_poll_ms: 2000,
            event_capacity: 100,
        }
    }
}

impl QueueConfig {
    pub fn idle_poll(&self) -> Duration {
        Duration::from_millis(self.idle_poll_ms)
    }
}

pub fn load_config<P: AsRef<Path>>(path: P) -> Result<QueueConfig, ConfigError> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadFile {
        path: path.to_path_buf(),
        source: e,
    })?;

    load_config_from_str(&content)
}

pub fn load_config_from_str(content: &str) -> Result<QueueConfig, ConfigError> {
    let config: QueueConfig = serde_json::from_str(content)?;
    Ok(config)
}
