//! Fleetline Test Utilities
//!
//! Centralized test infrastructure for the Fleetline workspace:
//! - Recording query cache and scripted realtime transport
//! - Proptest generators for identifiers, events and batch operations
//! - Row and event fixtures for common scenarios
//! - Custom assertions over recorded cache calls

// Re-export core types for convenience
pub use fleetline_core::{
    CacheConfig, ChangeEvent, ChangeKind, EntityType, RecordId, Row, SyncConfig, SyncError,
    TenantId, TransportError,
};
pub use fleetline_storage::{
    CacheEntrySnapshot, CacheKey, CacheManager, KeyPattern, MemoryQueryCache, QueryCache,
    QueryFilter,
};
pub use fleetline_sync::{
    channel_name, ChannelId, ChannelMessage, ChannelStatus, ConnectivityMonitor, QueueReplayer,
    RealtimeTransport, SyncQueueEntry, TableTopic,
};

use async_trait::async_trait;
use fleetline_core::CacheError;
use fleetline_storage::PrefetchRequest;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Install a test-friendly subscriber honoring `RUST_LOG`. Safe to call from
/// every test.
pub fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
}

// ============================================================================
// RECORDING QUERY CACHE
// ============================================================================

/// One call made against a [`RecordingQueryCache`].
#[derive(Debug, Clone, PartialEq)]
pub enum CacheCall {
    Invalidate(QueryFilter),
    Cancel(CacheKey),
    Get(CacheKey),
    Set(CacheKey, Value),
    Prefetch(PrefetchRequest),
    Entries,
    Remove(QueryFilter),
    Clear,
}

/// Query cache that records every call and delegates storage to a
/// [`MemoryQueryCache`].
#[derive(Default)]
pub struct RecordingQueryCache {
    inner: MemoryQueryCache,
    calls: Mutex<Vec<CacheCall>>,
    snapshots: Mutex<Option<Vec<CacheEntrySnapshot>>>,
    failing_prefetches: AtomicUsize,
}

impl RecordingQueryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Report these entries from `get_all_cache_entries` instead of the
    /// backing cache's.
    pub fn with_snapshots(snapshots: Vec<CacheEntrySnapshot>) -> Self {
        let cache = Self::default();
        *lock(&cache.snapshots) = Some(snapshots);
        cache
    }

    /// Make the next `n` prefetches fail.
    pub fn fail_next_prefetches(&self, n: usize) {
        self.failing_prefetches.store(n, Ordering::SeqCst);
    }

    pub fn backing(&self) -> &MemoryQueryCache {
        &self.inner
    }

    pub fn calls(&self) -> Vec<CacheCall> {
        lock(&self.calls).clone()
    }

    pub fn clear_calls(&self) {
        lock(&self.calls).clear();
    }

    /// Filters passed to `invalidate_queries`, in call order.
    pub fn invalidations(&self) -> Vec<QueryFilter> {
        lock(&self.calls)
            .iter()
            .filter_map(|call| match call {
                CacheCall::Invalidate(filter) => Some(filter.clone()),
                _ => None,
            })
            .collect()
    }

    /// Patterns of every `Pattern` invalidation, in call order.
    pub fn invalidated_patterns(&self) -> Vec<KeyPattern> {
        self.invalidations()
            .into_iter()
            .filter_map(|filter| match filter {
                QueryFilter::Pattern(pattern) => Some(pattern),
                _ => None,
            })
            .collect()
    }

    pub fn prefetched_keys(&self) -> Vec<CacheKey> {
        lock(&self.calls)
            .iter()
            .filter_map(|call| match call {
                CacheCall::Prefetch(request) => Some(request.key.clone()),
                _ => None,
            })
            .collect()
    }

    fn record(&self, call: CacheCall) {
        lock(&self.calls).push(call);
    }
}

#[async_trait]
impl QueryCache for RecordingQueryCache {
    async fn invalidate_queries(&self, filter: &QueryFilter) {
        self.record(CacheCall::Invalidate(filter.clone()));
        self.inner.invalidate_queries(filter).await;
    }

    async fn cancel_queries(&self, key: &CacheKey) {
        self.record(CacheCall::Cancel(key.clone()));
        self.inner.cancel_queries(key).await;
    }

    async fn get_query_data(&self, key: &CacheKey) -> Option<Value> {
        self.record(CacheCall::Get(key.clone()));
        self.inner.get_query_data(key).await
    }

    async fn set_query_data(&self, key: &CacheKey, value: Value) {
        self.record(CacheCall::Set(key.clone(), value.clone()));
        self.inner.set_query_data(key, value).await;
    }

    async fn prefetch_query(&self, request: PrefetchRequest) -> Result<(), CacheError> {
        self.record(CacheCall::Prefetch(request.clone()));
        let failing = self
            .failing_prefetches
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(CacheError::FetchFailed {
                key: request.key.to_string(),
                reason: "scripted failure".to_string(),
            });
        }
        Ok(())
    }

    async fn get_all_cache_entries(&self) -> Vec<CacheEntrySnapshot> {
        self.record(CacheCall::Entries);
        let scripted = lock(&self.snapshots).clone();
        match scripted {
            Some(snapshots) => snapshots,
            None => self.inner.get_all_cache_entries().await,
        }
    }

    async fn remove_queries(&self, filter: &QueryFilter) {
        self.record(CacheCall::Remove(filter.clone()));
        self.inner.remove_queries(filter).await;
    }

    async fn clear_all(&self) {
        self.record(CacheCall::Clear);
        self.inner.clear_all().await;
    }
}

// ============================================================================
// MOCK TRANSPORT
// ============================================================================

#[derive(Default)]
struct MockChannel {
    name: String,
    topics: Vec<TableTopic>,
    sink: Option<mpsc::Sender<ChannelMessage>>,
    closed: bool,
}

#[derive(Default)]
struct TransportState {
    next_id: u64,
    channels: HashMap<ChannelId, MockChannel>,
    opened: Vec<String>,
    closed: Vec<ChannelId>,
    failing_opens: usize,
    failing_subscribes: usize,
}

/// In-process realtime transport. Tests push messages into open channels
/// with [`MockTransport::emit`].
pub struct MockTransport {
    state: Mutex<TransportState>,
    auto_subscribe: bool,
}

impl MockTransport {
    /// Transport that reports `Subscribed` as soon as a channel subscribes.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(TransportState::default()),
            auto_subscribe: true,
        }
    }

    /// Transport that only delivers what the test emits.
    pub fn manual() -> Self {
        Self {
            state: Mutex::new(TransportState::default()),
            auto_subscribe: false,
        }
    }

    pub fn fail_next_opens(&self, n: usize) {
        lock(&self.state).failing_opens = n;
    }

    pub fn fail_next_subscribes(&self, n: usize) {
        lock(&self.state).failing_subscribes = n;
    }

    /// Channel names in open order, including failed-over ones.
    pub fn opened(&self) -> Vec<String> {
        lock(&self.state).opened.clone()
    }

    pub fn open_count(&self) -> usize {
        lock(&self.state).opened.len()
    }

    pub fn close_count(&self) -> usize {
        lock(&self.state).closed.len()
    }

    pub fn closed_channels(&self) -> Vec<ChannelId> {
        lock(&self.state).closed.clone()
    }

    /// Channels opened and not closed yet.
    pub fn live_channels(&self) -> usize {
        lock(&self.state)
            .channels
            .values()
            .filter(|channel| !channel.closed)
            .count()
    }

    /// Most recent live channel with the given name.
    pub fn live_channel(&self, name: &str) -> Option<ChannelId> {
        let state = lock(&self.state);
        state
            .channels
            .iter()
            .filter(|(_, channel)| !channel.closed && channel.name == name)
            .map(|(id, _)| *id)
            .max()
    }

    pub fn topics(&self, channel: ChannelId) -> Vec<TableTopic> {
        lock(&self.state)
            .channels
            .get(&channel)
            .map(|channel| channel.topics.clone())
            .unwrap_or_default()
    }

    /// Deliver a message on the tenant's live channel. Returns false when
    /// there is no subscribed channel to deliver on.
    pub async fn emit(&self, tenant: &TenantId, message: ChannelMessage) -> bool {
        let sink = {
            let state = lock(&self.state);
            let name = channel_name(tenant);
            state
                .channels
                .iter()
                .filter(|(_, channel)| !channel.closed && channel.name == name)
                .max_by_key(|(id, _)| **id)
                .and_then(|(_, channel)| channel.sink.clone())
        };
        match sink {
            Some(sink) => sink.send(message).await.is_ok(),
            None => false,
        }
    }

    pub async fn emit_change(&self, tenant: &TenantId, event: ChangeEvent) -> bool {
        self.emit(tenant, ChannelMessage::Change(event)).await
    }

    pub async fn emit_status(&self, tenant: &TenantId, status: ChannelStatus) -> bool {
        self.emit(tenant, ChannelMessage::Status(status)).await
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RealtimeTransport for MockTransport {
    async fn open_channel(&self, name: &str) -> Result<ChannelId, TransportError> {
        let mut state = lock(&self.state);
        state.opened.push(name.to_string());
        if state.failing_opens > 0 {
            state.failing_opens -= 1;
            return Err(TransportError::OpenFailed {
                channel: name.to_string(),
                reason: "scripted failure".to_string(),
            });
        }
        state.next_id += 1;
        let id = ChannelId(state.next_id);
        state.channels.insert(
            id,
            MockChannel {
                name: name.to_string(),
                ..MockChannel::default()
            },
        );
        Ok(id)
    }

    async fn on_table_change(
        &self,
        channel: ChannelId,
        topic: TableTopic,
    ) -> Result<(), TransportError> {
        let mut state = lock(&self.state);
        match state.channels.get_mut(&channel) {
            Some(open) if !open.closed => {
                open.topics.push(topic);
                Ok(())
            }
            _ => Err(TransportError::ChannelClosed {
                channel: channel.to_string(),
            }),
        }
    }

    async fn subscribe(
        &self,
        channel: ChannelId,
        sink: mpsc::Sender<ChannelMessage>,
    ) -> Result<(), TransportError> {
        let mut state = lock(&self.state);
        if state.failing_subscribes > 0 {
            state.failing_subscribes -= 1;
            return Err(TransportError::SubscribeFailed {
                channel: channel.to_string(),
                reason: "scripted failure".to_string(),
            });
        }
        let open = match state.channels.get_mut(&channel) {
            Some(open) if !open.closed => open,
            _ => {
                return Err(TransportError::ChannelClosed {
                    channel: channel.to_string(),
                })
            }
        };
        if self.auto_subscribe {
            let _ = sink.try_send(ChannelMessage::Status(ChannelStatus::Subscribed));
        }
        open.sink = Some(sink);
        Ok(())
    }

    async fn close_channel(&self, channel: ChannelId) {
        let mut state = lock(&self.state);
        let newly_closed = match state.channels.get_mut(&channel) {
            Some(open) if !open.closed => {
                open.closed = true;
                open.sink = None;
                true
            }
            _ => false,
        };
        if newly_closed {
            state.closed.push(channel);
        }
    }
}

// ============================================================================
// SCRIPTED REPLAYER
// ============================================================================

/// Replayer that records what it replays and fails on demand.
#[derive(Default)]
pub struct FlakyReplayer {
    failing: AtomicUsize,
    replayed: Mutex<Vec<SyncQueueEntry>>,
}

impl FlakyReplayer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` replays fail.
    pub fn fail_next(&self, n: usize) {
        self.failing.store(n, Ordering::SeqCst);
    }

    pub fn replayed(&self) -> Vec<SyncQueueEntry> {
        lock(&self.replayed).clone()
    }
}

#[async_trait]
impl QueueReplayer for FlakyReplayer {
    async fn replay(&self, entry: &SyncQueueEntry) -> Result<(), SyncError> {
        let failing = self
            .failing
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(SyncError::ReplayFailed {
                tenant_id: entry.tenant_id.clone(),
                entity: entry.entity,
                reason: "scripted failure".to_string(),
            });
        }
        lock(&self.replayed).push(entry.clone());
        Ok(())
    }
}

// ============================================================================
// PROPTEST GENERATORS
// ============================================================================

pub mod generators {
    //! Proptest strategies for Fleetline types.

    use super::*;
    use fleetline_storage::BatchOperation;
    use proptest::prelude::*;

    pub fn arb_tenant_id() -> impl Strategy<Value = TenantId> {
        "org-[a-z0-9]{1,8}".prop_map(TenantId::from)
    }

    pub fn arb_record_id() -> impl Strategy<Value = RecordId> {
        "[a-z]{2}-[0-9]{1,4}".prop_map(RecordId::from)
    }

    pub fn arb_entity_type() -> impl Strategy<Value = EntityType> {
        proptest::sample::select(EntityType::ALL.to_vec())
    }

    pub fn arb_change_kind() -> impl Strategy<Value = ChangeKind> {
        prop_oneof![
            Just(ChangeKind::Insert),
            Just(ChangeKind::Update),
            Just(ChangeKind::Delete),
        ]
    }

    pub fn arb_batch_operation() -> impl Strategy<Value = BatchOperation> {
        (
            arb_entity_type(),
            arb_record_id(),
            proptest::option::of(arb_record_id()),
        )
            .prop_map(|(entity, id, equipment_id)| BatchOperation {
                entity,
                id,
                equipment_id,
            })
    }

    /// Change event whose row carries an id and, sometimes, an equipment id.
    pub fn arb_change_event() -> impl Strategy<Value = ChangeEvent> {
        (
            arb_entity_type(),
            arb_change_kind(),
            arb_record_id(),
            proptest::option::of(arb_record_id()),
        )
            .prop_map(|(entity, kind, id, equipment)| {
                let row = fixtures::row(id.as_str(), equipment.as_ref().map(RecordId::as_str));
                match kind {
                    ChangeKind::Insert => ChangeEvent::insert(entity, row),
                    ChangeKind::Update => ChangeEvent::update(entity, row, None),
                    ChangeKind::Delete => ChangeEvent::delete(entity, row),
                }
            })
    }

    /// Key segment drawn from a small alphabet so prefixes collide often.
    pub fn arb_segment() -> impl Strategy<Value = String> {
        "[ab]{1,3}"
    }

    pub fn arb_cache_key() -> impl Strategy<Value = CacheKey> {
        prop::collection::vec(arb_segment(), 1..5).prop_map(CacheKey::new)
    }
}

// ============================================================================
// TEST FIXTURES
// ============================================================================

pub mod fixtures {
    //! Pre-built rows and events for common scenarios.

    use super::*;
    use serde_json::json;

    pub fn tenant() -> TenantId {
        TenantId::from("org-1")
    }

    pub fn other_tenant() -> TenantId {
        TenantId::from("org-2")
    }

    /// Row with an `id` and optionally an `equipment_id`.
    pub fn row(id: &str, equipment_id: Option<&str>) -> Row {
        let mut row = Row::new();
        row.insert("id".into(), json!(id));
        if let Some(equipment_id) = equipment_id {
            row.insert("equipment_id".into(), json!(equipment_id));
        }
        row
    }

    pub fn equipment_updated(id: &str) -> ChangeEvent {
        ChangeEvent::update(EntityType::Equipment, row(id, None), None)
    }

    pub fn equipment_deleted(id: &str) -> ChangeEvent {
        ChangeEvent::delete(EntityType::Equipment, row(id, None))
    }

    pub fn work_order_inserted(id: &str, equipment_id: Option<&str>) -> ChangeEvent {
        ChangeEvent::insert(EntityType::WorkOrder, row(id, equipment_id))
    }

    pub fn note_inserted(id: &str, equipment_id: Option<&str>) -> ChangeEvent {
        ChangeEvent::insert(EntityType::EquipmentNote, row(id, equipment_id))
    }

    pub fn team_updated(id: &str) -> ChangeEvent {
        ChangeEvent::update(EntityType::Team, row(id, None), None)
    }

    pub fn member_inserted(id: &str) -> ChangeEvent {
        ChangeEvent::insert(EntityType::OrganizationMember, row(id, None))
    }

    /// Sync config with the production defaults.
    pub fn sync_config() -> SyncConfig {
        SyncConfig::default()
    }
}

// ============================================================================
// CUSTOM ASSERTIONS
// ============================================================================

pub mod assertions {
    //! Assertions over recorded cache calls.

    use super::*;

    /// Assert that a pattern invalidation for exactly these segments was
    /// issued.
    #[track_caller]
    pub fn assert_invalidated(cache: &RecordingQueryCache, segments: &[&str]) {
        let expected = KeyPattern::new(segments.iter().copied());
        let patterns = cache.invalidated_patterns();
        assert!(
            patterns.contains(&expected),
            "Expected invalidation of {}, got: {:?}",
            expected,
            patterns
        );
    }

    #[track_caller]
    pub fn assert_not_invalidated(cache: &RecordingQueryCache, segments: &[&str]) {
        let unexpected = KeyPattern::new(segments.iter().copied());
        assert!(
            !cache.invalidated_patterns().contains(&unexpected),
            "Unexpected invalidation of {}",
            unexpected
        );
    }

    /// Assert that a tenant-wide invalidation of every organization family
    /// was issued.
    #[track_caller]
    pub fn assert_organization_wide(cache: &RecordingQueryCache, tenant: &TenantId) {
        for family in fleetline_storage::family::ORGANIZATION_WIDE {
            assert_invalidated(cache, &[family, tenant.as_str()]);
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
