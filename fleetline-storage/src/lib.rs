//! Fleetline Storage - Query Cache Coordination
//!
//! Defines the query-cache abstraction the application plugs in, the static
//! invalidation tables for every entity type, and the [`CacheManager`] that
//! applies them. An in-memory [`MemoryQueryCache`] is provided for tests and
//! for hosts without a cache of their own.

pub mod cache;

pub use cache::{
    family, plan_for_event, BatchOperation, CacheEntrySnapshot, CacheKey, CacheManager, CacheStats,
    FetchStatus, InvalidationPlan, KeyPattern, MemoryQueryCache, PrefetchRequest, PreloadTarget,
    QueryCache, QueryFetcher, QueryFilter, QueryStatus, Segment,
};
