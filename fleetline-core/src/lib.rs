//! Fleetline Core - Shared Vocabulary
//!
//! Pure data types shared by the cache and sync crates. This crate holds
//! identifiers, the entity tables that emit change events, the change event
//! envelope itself, the error taxonomy, and configuration. No I/O lives here
//! apart from reading a config file.

pub mod config;
pub mod enums;
pub mod error;
pub mod event;
pub mod identity;

pub use config::{CacheConfig, FleetlineConfig, SyncConfig};
pub use enums::{ChangeKind, EntityType};
pub use error::{
    CacheError, ConfigError, FleetlineError, FleetlineResult, SyncError, TransportError,
};
pub use event::{ChangeEvent, Row};
pub use identity::{RecordId, TenantId, Timestamp};
