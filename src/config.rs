//! Coordinator configuration.
//!
//! All knobs have built-in defaults and can be loaded from a TOML file.
//! Durations are plain integer fields (milliseconds for tick intervals,
//! seconds for the body timeout) so config files stay readable.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;
use tracing::info;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Maximum tasks running at once (pool capacity)
    pub max_concurrent_tasks: usize,
    /// Body timeout applied when a task does not set its own
    pub default_timeout_secs: u64,
    /// Retry budget applied when a task does not set its own
    pub default_max_retries: u32,
    /// Queue capacity; submissions beyond it are rejected
    pub max_queue_size: usize,
    /// Coordinator loop tick interval
    pub coordinator_tick_ms: u64,
    /// Scheduler loop tick interval
    pub scheduler_tick_ms: u64,
    /// Whether the cleanup loop runs at all
    pub cleanup_enabled: bool,
    /// Cleanup loop tick interval
    pub cleanup_interval_ms: u64,
    /// Terminal tasks retained before the cleanup loop evicts the oldest
    pub max_completed_history: usize,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            max_concurrent_tasks: 10,
            default_timeout_secs: 300,
            default_max_retries: 0,
            max_queue_size: 1000,
            coordinator_tick_ms: 100,
            scheduler_tick_ms: 1000,
            cleanup_enabled: true,
            cleanup_interval_ms: 3_600_000,
            max_completed_history: 100,
        }
    }
}

impl CoordinatorConfig {
    pub fn default_timeout(&self) -> Duration {
        Duration::from_secs(self.default_timeout_secs)
    }

    pub fn coordinator_tick(&self) -> Duration {
        Duration::from_millis(self.coordinator_tick_ms)
    }

    pub fn scheduler_tick(&self) -> Duration {
        Duration::from_millis(self.scheduler_tick_ms)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_millis(self.cleanup_interval_ms)
    }

    /// Load from a TOML file; missing keys fall back to defaults
    pub fn from_toml_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        let config: CoordinatorConfig = toml::from_str(&content)
            .with_context(|| format!("parsing config file {}", path.display()))?;
        info!("loaded coordinator config from {}", path.display());
        Ok(config)
    }

    /// Save to a TOML file
    pub fn to_toml_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let content = toml::to_string_pretty(self).context("serializing coordinator config")?;
        fs::write(path, content)
            .with_context(|| format!("writing config file {}", path.display()))?;
        Ok(())
    }
}
