//! In-process query cache.
//!
//! Entries carry explicit staleness: an entry is stale once invalidated, or
//! once its data is older than the stale time it was fetched with. Reads via
//! [`MemoryQueryCache::fetch_query`] refetch stale entries through the
//! configured [`QueryFetcher`].

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use fleetline_core::CacheError;
use serde_json::Value;
use tokio::sync::RwLock;
use tokio::time::Instant;

use super::key::CacheKey;
use super::traits::{
    CacheEntrySnapshot, FetchStatus, PrefetchRequest, QueryCache, QueryFilter, QueryStatus,
};

/// Loads the data behind a cache key from the backend.
#[async_trait]
pub trait QueryFetcher: Send + Sync {
    async fn fetch(&self, key: &CacheKey) -> Result<Value, CacheError>;
}

#[derive(Debug, Default)]
struct Entry {
    data: Option<Value>,
    updated_at: Option<Instant>,
    stale_time: Option<Duration>,
    invalidated: bool,
    observers: usize,
    fetch_status: FetchStatus,
    status: QueryStatus,
    error: Option<String>,
    /// Bumped by every fetch start and every cancel; a fetch only commits if
    /// the generation it started with is still current.
    generation: u64,
}

impl Entry {
    fn is_stale(&self, now: Instant) -> bool {
        if self.invalidated || self.data.is_none() {
            return true;
        }
        match (self.updated_at, self.stale_time) {
            (Some(updated_at), Some(stale_time)) => now.duration_since(updated_at) >= stale_time,
            _ => false,
        }
    }

    fn is_fresh_for(&self, now: Instant, stale_time: Duration) -> bool {
        if self.invalidated || self.data.is_none() {
            return false;
        }
        self.updated_at
            .map(|updated_at| now.duration_since(updated_at) < stale_time)
            .unwrap_or(false)
    }
}

/// Query cache kept in process memory.
pub struct MemoryQueryCache {
    entries: RwLock<HashMap<CacheKey, Entry>>,
    fetcher: Option<Arc<dyn QueryFetcher>>,
}

impl Default for MemoryQueryCache {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryQueryCache {
    /// Cache without a fetcher; prefetches of missing keys fail.
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            fetcher: None,
        }
    }

    pub fn with_fetcher(fetcher: Arc<dyn QueryFetcher>) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            fetcher: Some(fetcher),
        }
    }

    /// Register a consumer of `key`. Creates an empty entry if needed.
    pub async fn observe(&self, key: &CacheKey) -> usize {
        let mut entries = self.entries.write().await;
        let entry = entries.entry(key.clone()).or_default();
        entry.observers += 1;
        entry.observers
    }

    pub async fn unobserve(&self, key: &CacheKey) -> usize {
        let mut entries = self.entries.write().await;
        match entries.get_mut(key) {
            Some(entry) => {
                entry.observers = entry.observers.saturating_sub(1);
                entry.observers
            }
            None => 0,
        }
    }

    pub async fn is_stale(&self, key: &CacheKey) -> bool {
        let entries = self.entries.read().await;
        entries
            .get(key)
            .map(|entry| entry.is_stale(Instant::now()))
            .unwrap_or(true)
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    /// Return cached data, refetching first when it is older than
    /// `stale_time` or has been invalidated.
    pub async fn fetch_query(
        &self,
        key: &CacheKey,
        stale_time: Duration,
    ) -> Result<Option<Value>, CacheError> {
        let generation = {
            let mut entries = self.entries.write().await;
            let now = Instant::now();
            let entry = entries.entry(key.clone()).or_default();
            if entry.is_fresh_for(now, stale_time) {
                return Ok(entry.data.clone());
            }
            entry.generation += 1;
            entry.fetch_status = FetchStatus::Fetching;
            entry.generation
        };

        let result = match &self.fetcher {
            Some(fetcher) => fetcher.fetch(key).await,
            None => Err(CacheError::FetchFailed {
                key: key.to_string(),
                reason: "no fetcher configured".to_string(),
            }),
        };

        let mut entries = self.entries.write().await;
        let Some(entry) = entries.get_mut(key) else {
            // Removed while the fetch was in flight.
            return result.map(Some);
        };
        if entry.generation != generation {
            // Cancelled or superseded; keep whatever was written since.
            return Ok(entry.data.clone());
        }
        entry.fetch_status = FetchStatus::Idle;
        match result {
            Ok(value) => {
                entry.data = Some(value);
                entry.updated_at = Some(Instant::now());
                entry.stale_time = Some(stale_time);
                entry.invalidated = false;
                entry.status = QueryStatus::Success;
                entry.error = None;
                Ok(entry.data.clone())
            }
            Err(err) => {
                entry.status = QueryStatus::Error;
                entry.error = Some(err.to_string());
                Err(err)
            }
        }
    }

    /// Last fetch error recorded for the key.
    pub async fn error(&self, key: &CacheKey) -> Option<String> {
        let entries = self.entries.read().await;
        entries.get(key).and_then(|entry| entry.error.clone())
    }
}

#[async_trait]
impl QueryCache for MemoryQueryCache {
    async fn invalidate_queries(&self, filter: &QueryFilter) {
        let mut entries = self.entries.write().await;
        for (key, entry) in entries.iter_mut() {
            if filter.matches(key) {
                entry.invalidated = true;
            }
        }
    }

    async fn cancel_queries(&self, key: &CacheKey) {
        let mut entries = self.entries.write().await;
        if let Some(entry) = entries.get_mut(key) {
            if entry.fetch_status == FetchStatus::Fetching {
                entry.generation += 1;
                entry.fetch_status = FetchStatus::Idle;
            }
        }
    }

    async fn get_query_data(&self, key: &CacheKey) -> Option<Value> {
        let entries = self.entries.read().await;
        entries.get(key).and_then(|entry| entry.data.clone())
    }

    async fn set_query_data(&self, key: &CacheKey, value: Value) {
        let mut entries = self.entries.write().await;
        let entry = entries.entry(key.clone()).or_default();
        entry.data = Some(value);
        entry.updated_at = Some(Instant::now());
        entry.invalidated = false;
        entry.status = QueryStatus::Success;
        entry.error = None;
    }

    async fn prefetch_query(&self, request: PrefetchRequest) -> Result<(), CacheError> {
        self.fetch_query(&request.key, request.stale_time)
            .await
            .map(|_| ())
    }

    async fn get_all_cache_entries(&self) -> Vec<CacheEntrySnapshot> {
        let entries = self.entries.read().await;
        let now = Instant::now();
        let mut snapshots: Vec<CacheEntrySnapshot> = entries
            .iter()
            .map(|(key, entry)| CacheEntrySnapshot {
                key: key.clone(),
                observer_count: entry.observers,
                is_stale: entry.is_stale(now),
                fetch_status: entry.fetch_status,
                status: entry.status,
            })
            .collect();
        snapshots.sort_by(|a, b| a.key.cmp(&b.key));
        snapshots
    }

    async fn remove_queries(&self, filter: &QueryFilter) {
        let mut entries = self.entries.write().await;
        entries.retain(|key, _| !filter.matches(key));
    }

    async fn clear_all(&self) {
        self.entries.write().await.clear();
    }
}
