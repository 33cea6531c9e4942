//! Cache manager: invalidation policy over an attached query cache.
//!
//! The manager owns no cached data. It translates domain writes into the
//! set of keys that must go stale and forwards them to whichever
//! [`QueryCache`] is attached. Until a cache is attached every operation is
//! a silent no-op, so mutation flows never fail because of caching.

use std::collections::BTreeSet;
use std::future::Future;
use std::sync::{Arc, PoisonError, RwLock};

use fleetline_core::{CacheConfig, EntityType, RecordId, TenantId};
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use super::key::{self, CacheKey, KeyPattern};
use super::rules::{self, BatchOperation, InvalidationPlan};
use super::traits::{CacheStats, PrefetchRequest, QueryCache, QueryFilter};

/// Record whose neighbours should be prefetched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PreloadTarget {
    Equipment(RecordId),
    WorkOrder(RecordId),
    Team(RecordId),
}

/// Invalidation policy engine.
///
/// Construct one per application and share it through an `Arc`; tests call
/// [`CacheManager::reset`] to detach the cache between cases.
pub struct CacheManager {
    cache: RwLock<Option<Arc<dyn QueryCache>>>,
    config: CacheConfig,
}

impl Default for CacheManager {
    fn default() -> Self {
        Self::new(CacheConfig::default())
    }
}

impl CacheManager {
    /// Create a detached manager.
    pub fn new(config: CacheConfig) -> Self {
        Self {
            cache: RwLock::new(None),
            config,
        }
    }

    /// Create a manager with a cache already attached.
    pub fn with_cache(cache: Arc<dyn QueryCache>, config: CacheConfig) -> Self {
        Self {
            cache: RwLock::new(Some(cache)),
            config,
        }
    }

    /// Staleness budgets used by preloading.
    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Attach `cache`, replacing any cache attached before.
    pub fn attach(&self, cache: Arc<dyn QueryCache>) {
        *self.cache.write().unwrap_or_else(PoisonError::into_inner) = Some(cache);
    }

    /// Detach and return the current cache. Later calls become no-ops.
    pub fn detach(&self) -> Option<Arc<dyn QueryCache>> {
        self.cache
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    /// Detach the cache. Equivalent to a freshly constructed manager.
    pub fn reset(&self) {
        self.detach();
    }

    /// Whether a cache is attached.
    pub fn is_attached(&self) -> bool {
        self.cache
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    fn cache(&self) -> Option<Arc<dyn QueryCache>> {
        let cache = self
            .cache
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if cache.is_none() {
            trace!("No query cache attached, skipping");
        }
        cache
    }

    async fn invalidate_patterns(&self, patterns: Vec<KeyPattern>) {
        let Some(cache) = self.cache() else {
            return;
        };
        for pattern in patterns {
            cache.invalidate_queries(&QueryFilter::Pattern(pattern)).await;
        }
    }

    // ========================================================================
    // INVALIDATION
    // ========================================================================

    /// Invalidate every tenant-scoped family. Used when the downstream
    /// effects of a change are unknown.
    pub async fn invalidate_organization_data(&self, tenant: &TenantId) {
        debug!(tenant_id = %tenant, "Invalidating organization data");
        self.invalidate_patterns(rules::organization_patterns(tenant))
            .await;
    }

    /// Invalidate the equipment list, the equipment's work orders and notes,
    /// and the dashboard.
    pub async fn invalidate_equipment_related(&self, tenant: &TenantId, equipment: &RecordId) {
        debug!(tenant_id = %tenant, equipment_id = %equipment, "Invalidating equipment");
        self.invalidate_patterns(rules::equipment_patterns(tenant, equipment))
            .await;
    }

    /// Invalidate the work-order views; with an equipment id the equipment's
    /// derived aggregates are invalidated as well.
    pub async fn invalidate_work_order_related(
        &self,
        tenant: &TenantId,
        work_order: &RecordId,
        equipment: Option<&RecordId>,
    ) {
        debug!(
            tenant_id = %tenant,
            work_order_id = %work_order,
            equipment_id = ?equipment.map(RecordId::as_str),
            "Invalidating work order"
        );
        self.invalidate_patterns(rules::work_order_patterns(tenant, work_order, None))
            .await;
        if let Some(equipment) = equipment {
            self.invalidate_equipment_related(tenant, equipment).await;
        }
    }

    /// Invalidate team lists and the work-order views that show assignees.
    pub async fn invalidate_team_related(&self, tenant: &TenantId, team: &RecordId) {
        debug!(tenant_id = %tenant, team_id = %team, "Invalidating team");
        self.invalidate_patterns(rules::team_patterns(tenant)).await;
    }

    /// Invalidate member and admin lists, and the teams built from them.
    pub async fn invalidate_organization_member_related(&self, tenant: &TenantId) {
        debug!(tenant_id = %tenant, "Invalidating organization members");
        self.invalidate_patterns(rules::member_patterns(tenant)).await;
    }

    /// Invalidate seat slots, their availability and purchases.
    pub async fn invalidate_organization_slot_related(&self, tenant: &TenantId) {
        debug!(tenant_id = %tenant, "Invalidating organization slots");
        self.invalidate_patterns(rules::slot_patterns(tenant)).await;
    }

    /// Invalidate invitations and, since accepting one consumes a seat, the
    /// slot views.
    pub async fn invalidate_organization_invitation_related(&self, tenant: &TenantId) {
        debug!(tenant_id = %tenant, "Invalidating organization invitations");
        self.invalidate_patterns(rules::invitation_patterns(tenant))
            .await;
    }

    /// Dispatch a plan to the matching named invalidation.
    pub async fn apply(&self, tenant: &TenantId, plan: &InvalidationPlan) {
        match plan {
            InvalidationPlan::Organization => self.invalidate_organization_data(tenant).await,
            InvalidationPlan::Equipment { equipment_id } => {
                self.invalidate_equipment_related(tenant, equipment_id)
                    .await
            }
            InvalidationPlan::WorkOrder {
                work_order_id,
                equipment_id,
            } => {
                self.invalidate_work_order_related(tenant, work_order_id, equipment_id.as_ref())
                    .await
            }
            InvalidationPlan::Team { team_id } => {
                self.invalidate_team_related(tenant, team_id).await
            }
            InvalidationPlan::Members => {
                self.invalidate_organization_member_related(tenant).await
            }
            InvalidationPlan::Slots => self.invalidate_organization_slot_related(tenant).await,
            InvalidationPlan::Invitations => {
                self.invalidate_organization_invitation_related(tenant)
                    .await
            }
            InvalidationPlan::Nothing => {}
        }
    }

    /// Deduplicate `operations` and invalidate their union with a single
    /// cache call. Returns the number of distinct patterns sent.
    pub async fn batch_invalidate(
        &self,
        tenant: &TenantId,
        operations: &[BatchOperation],
    ) -> usize {
        if operations.is_empty() {
            return 0;
        }
        let Some(cache) = self.cache() else {
            return 0;
        };

        let unique: BTreeSet<&BatchOperation> = operations.iter().collect();
        let patterns: BTreeSet<KeyPattern> = unique
            .iter()
            .flat_map(|op| op.plan().patterns(tenant))
            .collect();
        if patterns.is_empty() {
            return 0;
        }

        let count = patterns.len();
        debug!(
            tenant_id = %tenant,
            operations = operations.len(),
            unique_operations = unique.len(),
            patterns = count,
            "Batch invalidation"
        );
        cache
            .invalidate_queries(&QueryFilter::AnyOf(patterns.into_iter().collect()))
            .await;
        count
    }

    // ========================================================================
    // OPTIMISTIC UPDATES
    // ========================================================================

    /// Write `updater(current)` to `key` before `mutation` completes.
    ///
    /// On success the optimistic value stays in place. On failure the key is
    /// restored to its previous value (removed if it had none) and the
    /// mutation's error is returned unchanged.
    pub async fn optimistic_update<U, M, Fut, T, E>(
        &self,
        key: &CacheKey,
        updater: U,
        mutation: M,
    ) -> Result<T, E>
    where
        U: FnOnce(Option<&Value>) -> Value,
        M: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let Some(cache) = self.cache() else {
            return mutation().await;
        };

        cache.cancel_queries(key).await;
        let snapshot = cache.get_query_data(key).await;
        cache.set_query_data(key, updater(snapshot.as_ref())).await;

        match mutation().await {
            Ok(value) => Ok(value),
            Err(err) => {
                debug!(key = %key, "Optimistic mutation failed, rolling back");
                match snapshot {
                    Some(previous) => cache.set_query_data(key, previous).await,
                    None => cache.remove_queries(&QueryFilter::Exact(key.clone())).await,
                }
                Err(err)
            }
        }
    }

    // ========================================================================
    // PRELOAD, STATS, CLEARING
    // ========================================================================

    /// Start background prefetches for data likely needed next. Each has its
    /// own staleness budget. The returned handles may be dropped.
    pub fn preload_related_data(
        &self,
        tenant: &TenantId,
        target: &PreloadTarget,
    ) -> Vec<JoinHandle<()>> {
        let Some(cache) = self.cache() else {
            return Vec::new();
        };

        let requests = match target {
            PreloadTarget::Equipment(equipment) => vec![
                PrefetchRequest::new(
                    key::equipment_work_orders(tenant, equipment),
                    self.config.work_order_stale_time(),
                ),
                PrefetchRequest::new(
                    key::equipment_notes(tenant, equipment),
                    self.config.notes_stale_time(),
                ),
            ],
            PreloadTarget::WorkOrder(work_order) => vec![PrefetchRequest::new(
                key::work_order_detail(tenant, work_order),
                self.config.work_order_stale_time(),
            )],
            PreloadTarget::Team(_) => vec![PrefetchRequest::new(
                key::team_list(tenant),
                self.config.team_stale_time(),
            )],
        };

        requests
            .into_iter()
            .map(|request| {
                let cache = Arc::clone(&cache);
                tokio::spawn(async move {
                    let key = request.key.clone();
                    if let Err(e) = cache.prefetch_query(request).await {
                        debug!(key = %key, error = %e, "Prefetch failed");
                    }
                })
            })
            .collect()
    }

    /// Diagnostic counts over the attached cache, `None` when detached.
    pub async fn get_cache_stats(&self) -> Option<CacheStats> {
        let cache = self.cache()?;
        let entries = cache.get_all_cache_entries().await;
        Some(CacheStats::from_entries(&entries))
    }

    /// Remove entries matching `pattern`, or everything when `None`.
    pub async fn clear_cache(&self, pattern: Option<&KeyPattern>) {
        let Some(cache) = self.cache() else {
            return;
        };
        match pattern {
            Some(pattern) => {
                debug!(pattern = %pattern, "Clearing cache entries");
                cache
                    .remove_queries(&QueryFilter::Pattern(pattern.clone()))
                    .await
            }
            None => {
                debug!("Clearing entire cache");
                cache.clear_all().await
            }
        }
    }

    /// Convenience for the common batch of one entity type.
    pub async fn batch_invalidate_entities(
        &self,
        tenant: &TenantId,
        entity: EntityType,
        ids: &[RecordId],
    ) -> usize {
        let operations: Vec<BatchOperation> = ids
            .iter()
            .map(|id| BatchOperation::new(entity, id.clone()))
            .collect();
        self.batch_invalidate(tenant, &operations).await
    }
}
