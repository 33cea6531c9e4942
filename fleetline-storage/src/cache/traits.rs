//! Query cache interface.
//!
//! The cache manager never owns cached data. It drives whatever query cache
//! the application attaches through the [`QueryCache`] trait, which mirrors
//! the operations a client-side query cache exposes: invalidate, cancel,
//! read, write, prefetch, enumerate, remove and clear.

use async_trait::async_trait;
use fleetline_core::CacheError;
use serde_json::Value;
use std::time::Duration;

use super::key::{CacheKey, KeyPattern};

/// Selects the cache entries an operation applies to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryFilter {
    /// Exactly one key.
    Exact(CacheKey),
    /// Every key the pattern is a prefix of.
    Pattern(KeyPattern),
    /// Every key matched by at least one pattern.
    AnyOf(Vec<KeyPattern>),
    /// Every entry.
    All,
}

impl QueryFilter {
    pub fn matches(&self, key: &CacheKey) -> bool {
        match self {
            QueryFilter::Exact(expected) => expected == key,
            QueryFilter::Pattern(pattern) => pattern.matches(key),
            QueryFilter::AnyOf(patterns) => patterns.iter().any(|p| p.matches(key)),
            QueryFilter::All => true,
        }
    }
}

impl From<KeyPattern> for QueryFilter {
    fn from(pattern: KeyPattern) -> Self {
        QueryFilter::Pattern(pattern)
    }
}

impl From<CacheKey> for QueryFilter {
    fn from(key: CacheKey) -> Self {
        QueryFilter::Pattern(KeyPattern::from(key))
    }
}

/// Whether a query currently has a request in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FetchStatus {
    #[default]
    Idle,
    Fetching,
    Paused,
}

/// Outcome of the last completed fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QueryStatus {
    #[default]
    Pending,
    Success,
    Error,
}

/// Read-only view of one cache entry, as handed to diagnostics.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntrySnapshot {
    pub key: CacheKey,
    /// Number of mounted consumers reading this entry.
    pub observer_count: usize,
    pub is_stale: bool,
    pub fetch_status: FetchStatus,
    pub status: QueryStatus,
}

/// Prefetch with a per-request staleness budget.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrefetchRequest {
    pub key: CacheKey,
    /// Cached data younger than this is not refetched.
    pub stale_time: Duration,
}

impl PrefetchRequest {
    pub fn new(key: CacheKey, stale_time: Duration) -> Self {
        Self { key, stale_time }
    }
}

/// Query cache backend trait.
///
/// Implementations must be cheap to call concurrently; the sync service calls
/// `invalidate_queries` from every tenant's event pump.
#[async_trait]
pub trait QueryCache: Send + Sync {
    /// Mark matching entries stale so their next read refetches.
    async fn invalidate_queries(&self, filter: &QueryFilter);

    /// Cancel in-flight fetches for the key; a cancelled fetch must not
    /// overwrite data written afterwards.
    async fn cancel_queries(&self, key: &CacheKey);

    async fn get_query_data(&self, key: &CacheKey) -> Option<Value>;

    async fn set_query_data(&self, key: &CacheKey, value: Value);

    /// Fetch the key unless cached data is fresher than `stale_time`.
    async fn prefetch_query(&self, request: PrefetchRequest) -> Result<(), CacheError>;

    async fn get_all_cache_entries(&self) -> Vec<CacheEntrySnapshot>;

    async fn remove_queries(&self, filter: &QueryFilter);

    async fn clear_all(&self);
}

/// Statistics about the attached query cache.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub total_queries: usize,
    /// Entries with at least one observer.
    pub active_queries: usize,
    pub stale_queries: usize,
    pub fetching_queries: usize,
    pub error_queries: usize,
}

impl CacheStats {
    pub fn from_entries(entries: &[CacheEntrySnapshot]) -> Self {
        entries.iter().fold(
            CacheStats {
                total_queries: entries.len(),
                ..Default::default()
            },
            |mut stats, entry| {
                if entry.observer_count > 0 {
                    stats.active_queries += 1;
                }
                if entry.is_stale {
                    stats.stale_queries += 1;
                }
                if entry.fetch_status == FetchStatus::Fetching {
                    stats.fetching_queries += 1;
                }
                if entry.status == QueryStatus::Error {
                    stats.error_queries += 1;
                }
                stats
            },
        )
    }

    /// Fraction of entries that are stale (0.0 to 1.0).
    pub fn stale_ratio(&self) -> f64 {
        if self.total_queries == 0 {
            0.0
        } else {
            self.stale_queries as f64 / self.total_queries as f64
        }
    }
}
