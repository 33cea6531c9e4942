//! Error types for Fleetline operations

use crate::{EntityType, TenantId};
use thiserror::Error;

/// Query cache errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CacheError {
    #[error("Fetch failed for key {key}: {reason}")]
    FetchFailed { key: String, reason: String },
}

/// Realtime transport errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("Failed to open channel {channel}: {reason}")]
    OpenFailed { channel: String, reason: String },

    #[error("Subscribe failed on channel {channel}: {reason}")]
    SubscribeFailed { channel: String, reason: String },

    #[error("Channel {channel} is closed")]
    ChannelClosed { channel: String },
}

/// Background sync errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SyncError {
    #[error("Replay failed for {entity} change of tenant {tenant_id}: {reason}")]
    ReplayFailed {
        tenant_id: TenantId,
        entity: EntityType,
        reason: String,
    },

    #[error("Queue drain stopped with {remaining} entries left: {reason}")]
    DrainStopped { remaining: usize, reason: String },

    #[error("Reconnect attempts exhausted for tenant {tenant_id} after {attempts} attempts")]
    ReconnectExhausted { tenant_id: TenantId, attempts: u32 },
}

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing configuration file path (use --config or FLEETLINE_CONFIG)")]
    MissingConfigPath,

    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid config value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },
}

/// Master error type for all Fleetline errors.
#[derive(Debug, Error)]
pub enum FleetlineError {
    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Sync error: {0}")]
    Sync(#[from] SyncError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
}

/// Result type alias for Fleetline operations.
pub type FleetlineResult<T> = Result<T, FleetlineError>;

// =============================================================================
// TESTS
// =============================================================================
