//! Configuration loading for Fleetline.
//!
//! Every section can be omitted from the TOML file and falls back to the
//! documented defaults; unknown keys are rejected.

use crate::ConfigError;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct FleetlineConfig {
    pub sync: SyncConfig,
    pub cache: CacheConfig,
}

/// Background sync tuning.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct SyncConfig {
    /// Reconnects attempted after a channel error before giving up.
    pub max_reconnect_attempts: u32,
    /// Base of the exponential backoff; attempt `n` waits `2^n * base`.
    pub reconnect_base_ms: u64,
    /// Offline queue length that triggers trimming.
    pub queue_capacity: usize,
    /// Entries kept (most recent first) once the queue overflows.
    pub queue_retain: usize,
    /// Entries replayed concurrently per drain batch.
    pub drain_batch_size: usize,
    /// Default period of the organization-wide staleness sweep.
    pub periodic_interval_ms: u64,
    /// Buffer of the per-channel message queue between transport and pump.
    pub channel_buffer: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_reconnect_attempts: 5,
            reconnect_base_ms: 1000,
            queue_capacity: 100,
            queue_retain: 50,
            drain_batch_size: 10,
            periodic_interval_ms: 5 * 60 * 1000,
            channel_buffer: 256,
        }
    }
}

impl SyncConfig {
    /// Delay before reconnect attempt number `attempt` (zero based).
    pub fn reconnect_delay(&self, attempt: u32) -> Duration {
        let factor = 2u64.saturating_pow(attempt);
        Duration::from_millis(factor.saturating_mul(self.reconnect_base_ms))
    }

    pub fn periodic_interval(&self) -> Duration {
        Duration::from_millis(self.periodic_interval_ms)
    }
}

/// Staleness budgets used when preloading related data.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct CacheConfig {
    pub work_order_stale_ms: u64,
    pub notes_stale_ms: u64,
    pub team_stale_ms: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            work_order_stale_ms: 2 * 60 * 1000,
            notes_stale_ms: 5 * 60 * 1000,
            team_stale_ms: 5 * 60 * 1000,
        }
    }
}

impl CacheConfig {
    pub fn work_order_stale_time(&self) -> Duration {
        Duration::from_millis(self.work_order_stale_ms)
    }

    pub fn notes_stale_time(&self) -> Duration {
        Duration::from_millis(self.notes_stale_ms)
    }

    pub fn team_stale_time(&self) -> Duration {
        Duration::from_millis(self.team_stale_ms)
    }
}

impl FleetlineConfig {
    pub fn load() -> Result<Self, ConfigError> {
        let path = config_path_from_args().or_else(config_path_from_env);
        let path = path.ok_or(ConfigError::MissingConfigPath)?;
        Self::from_path(&path)
    }

    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml_str(&contents)
    }

    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        let config: FleetlineConfig = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let sync = &self.sync;
        if sync.max_reconnect_attempts == 0 {
            return Err(invalid("sync.max_reconnect_attempts", "must be > 0"));
        }
        if sync.reconnect_base_ms == 0 {
            return Err(invalid("sync.reconnect_base_ms", "must be > 0"));
        }
        if sync.queue_capacity == 0 {
            return Err(invalid("sync.queue_capacity", "must be > 0"));
        }
        if sync.queue_retain == 0 {
            return Err(invalid("sync.queue_retain", "must be > 0"));
        }
        if sync.queue_retain > sync.queue_capacity {
            return Err(invalid("sync.queue_retain", "must be <= queue_capacity"));
        }
        if sync.drain_batch_size == 0 {
            return Err(invalid("sync.drain_batch_size", "must be > 0"));
        }
        if sync.periodic_interval_ms == 0 {
            return Err(invalid("sync.periodic_interval_ms", "must be > 0"));
        }
        if sync.channel_buffer == 0 {
            return Err(invalid("sync.channel_buffer", "must be > 0"));
        }
        let cache = &self.cache;
        if cache.work_order_stale_ms == 0 {
            return Err(invalid("cache.work_order_stale_ms", "must be > 0"));
        }
        if cache.notes_stale_ms == 0 {
            return Err(invalid("cache.notes_stale_ms", "must be > 0"));
        }
        if cache.team_stale_ms == 0 {
            return Err(invalid("cache.team_stale_ms", "must be > 0"));
        }
        Ok(())
    }
}

fn invalid(field: &'static str, reason: &str) -> ConfigError {
    ConfigError::InvalidValue {
        field,
        reason: reason.to_string(),
    }
}

fn config_path_from_env() -> Option<PathBuf> {
    std::env::var("FLEETLINE_CONFIG").ok().map(PathBuf::from)
}

fn config_path_from_args() -> Option<PathBuf> {
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        if arg == "--config" {
            return args.next().map(PathBuf::from);
        }
    }
    None
}
