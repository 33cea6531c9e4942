//! Cache layer: keys, invalidation rules and the cache manager.
//!
//! This module coordinates a client-side query cache without owning it.
//! Domain writes are translated into key patterns by the static tables in
//! [`rules`], and [`CacheManager`] forwards them to the attached
//! [`QueryCache`].
//!
//! # Key Scoping
//!
//! Every key produced here is `[family, tenant, ...]`. Patterns match by
//! tuple prefix, so invalidating `[family, tenant]` reaches every record key
//! beneath it and nothing belonging to another tenant.
//!
//! # Example
//!
//! ```ignore
//! let manager = CacheManager::with_cache(Arc::new(MemoryQueryCache::new()), CacheConfig::default());
//!
//! // A work order on equipment eq-1 changed
//! manager
//!     .invalidate_work_order_related(&tenant, &work_order_id, Some(&equipment_id))
//!     .await;
//!
//! // Several changes collapse into one cache call
//! manager.batch_invalidate(&tenant, &operations).await;
//! ```

pub mod key;
pub mod manager;
pub mod memory;
pub mod rules;
pub mod traits;

pub use key::{family, CacheKey, KeyPattern, Segment};
pub use manager::{CacheManager, PreloadTarget};
pub use memory::{MemoryQueryCache, QueryFetcher};
pub use rules::{plan_for_event, BatchOperation, InvalidationPlan};
pub use traits::{
    CacheEntrySnapshot, CacheStats, FetchStatus, PrefetchRequest, QueryCache, QueryFilter,
    QueryStatus,
};
