//! Replaying queued changes.

use async_trait::async_trait;
use fleetline_core::SyncError;
use fleetline_storage::{plan_for_event, CacheManager};
use std::sync::Arc;

use crate::queue::SyncQueueEntry;

/// Applies one queued change once connectivity is back.
#[async_trait]
pub trait QueueReplayer: Send + Sync {
    async fn replay(&self, entry: &SyncQueueEntry) -> Result<(), SyncError>;
}

/// Re-runs the change's invalidation plan so anything cached while offline
/// is refetched.
#[derive(Clone)]
pub struct CacheReplayer {
    cache: Arc<CacheManager>,
}

impl CacheReplayer {
    pub fn new(cache: Arc<CacheManager>) -> Self {
        Self { cache }
    }
}

#[async_trait]
impl QueueReplayer for CacheReplayer {
    async fn replay(&self, entry: &SyncQueueEntry) -> Result<(), SyncError> {
        let plan = plan_for_event(&entry.payload);
        self.cache.apply(&entry.tenant_id, &plan).await;
        Ok(())
    }
}
