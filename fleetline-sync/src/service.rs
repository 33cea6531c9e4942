//! Background sync service.
//!
//! Keeps one realtime channel per tenant, routes each change through the
//! invalidation rules, queues changes while offline and reconnects failed
//! channels with exponential backoff. Every owned resource (channel, message
//! pump, periodic timer) lives in a single registry so teardown is uniform.

use fleetline_core::{ChangeEvent, EntityType, SyncConfig, SyncError, TenantId, TransportError};
use fleetline_storage::{plan_for_event, CacheManager, InvalidationPlan};
use futures_util::future::{try_join_all, BoxFuture};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

use crate::connectivity::Connectivity;
use crate::queue::{SyncQueue, SyncQueueEntry};
use crate::replay::{CacheReplayer, QueueReplayer};
use crate::transport::{
    channel_name, ChannelId, ChannelMessage, ChannelStatus, RealtimeTransport, TableTopic,
};

/// Point-in-time view of the service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncStatus {
    pub is_online: bool,
    pub active_subscriptions: usize,
    pub queued_items: usize,
    /// Sum of reconnect attempts across tenants. A tenant that gave up keeps
    /// contributing its final count until it is subscribed again.
    pub reconnect_attempts: u32,
    pub periodic_syncs: usize,
}

/// Lifecycle of one tenant subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionState {
    Connecting,
    Subscribed,
    Reconnecting,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum RegistryKey {
    Subscription(TenantId),
    Periodic(TenantId),
}

enum RegistryEntry {
    Subscription(Subscription),
    Periodic(PeriodicSync),
}

struct Subscription {
    /// Distinguishes successive connections for the same tenant so stale
    /// status messages and reconnect timers can be ignored.
    epoch: u64,
    state: SubscriptionState,
    channel: Option<ChannelId>,
    pump: Option<JoinHandle<()>>,
}

struct PeriodicSync {
    interval: Duration,
    task: JoinHandle<()>,
}

struct SyncState {
    is_online: bool,
    registry: HashMap<RegistryKey, RegistryEntry>,
    reconnect_attempts: HashMap<TenantId, u32>,
    queue: SyncQueue,
    next_epoch: u64,
    listener: Option<JoinHandle<()>>,
}

impl SyncState {
    fn subscription_mut(&mut self, tenant: &TenantId, epoch: u64) -> Option<&mut Subscription> {
        match self
            .registry
            .get_mut(&RegistryKey::Subscription(tenant.clone()))
        {
            Some(RegistryEntry::Subscription(sub)) if sub.epoch == epoch => Some(sub),
            _ => None,
        }
    }

    fn subscription_count(&self) -> usize {
        self.registry
            .keys()
            .filter(|key| matches!(key, RegistryKey::Subscription(_)))
            .count()
    }

    fn periodic_count(&self) -> usize {
        self.registry
            .keys()
            .filter(|key| matches!(key, RegistryKey::Periodic(_)))
            .count()
    }
}

struct SyncInner {
    cache: Arc<CacheManager>,
    transport: Arc<dyn RealtimeTransport>,
    connectivity: Arc<dyn Connectivity>,
    replayer: Arc<dyn QueueReplayer>,
    config: SyncConfig,
    state: Mutex<SyncState>,
    drain_lock: Mutex<()>,
}

/// Realtime subscription manager.
///
/// Cloning is cheap and every clone drives the same registry.
#[derive(Clone)]
pub struct BackgroundSyncService {
    inner: Arc<SyncInner>,
}

impl BackgroundSyncService {
    /// Service that replays queued changes through the cache manager.
    pub fn new(
        cache: Arc<CacheManager>,
        transport: Arc<dyn RealtimeTransport>,
        connectivity: Arc<dyn Connectivity>,
        config: SyncConfig,
    ) -> Self {
        let replayer = Arc::new(CacheReplayer::new(Arc::clone(&cache)));
        Self::with_replayer(cache, transport, connectivity, replayer, config)
    }

    /// Service that replays queued changes through `replayer`.
    pub fn with_replayer(
        cache: Arc<CacheManager>,
        transport: Arc<dyn RealtimeTransport>,
        connectivity: Arc<dyn Connectivity>,
        replayer: Arc<dyn QueueReplayer>,
        config: SyncConfig,
    ) -> Self {
        let state = SyncState {
            is_online: connectivity.is_online(),
            registry: HashMap::new(),
            reconnect_attempts: HashMap::new(),
            queue: SyncQueue::from_config(&config),
            next_epoch: 0,
            listener: None,
        };
        Self {
            inner: Arc::new(SyncInner {
                cache,
                transport,
                connectivity,
                replayer,
                config,
                state: Mutex::new(state),
                drain_lock: Mutex::new(()),
            }),
        }
    }

    /// Timing and queue limits the service was built with.
    pub fn config(&self) -> &SyncConfig {
        &self.inner.config
    }

    /// Start following connectivity transitions. Calling it again is a no-op.
    pub async fn start(&self) {
        {
            let mut state = self.inner.state.lock().await;
            if state.listener.is_some() {
                return;
            }
            let rx = self.inner.connectivity.subscribe();
            state.listener = Some(tokio::spawn(watch_connectivity(
                Arc::downgrade(&self.inner),
                rx,
            )));
        }
        let online = self.inner.connectivity.is_online();
        self.inner.on_connectivity_change(online).await;
        tracing::info!(online, "Background sync started");
    }

    /// Open the tenant's change channel. Does nothing if the tenant already
    /// has a subscription, whatever its state.
    pub async fn subscribe_to_organization(&self, tenant: &TenantId) {
        self.inner.open_subscription(tenant, true).await;
    }

    /// Close the tenant's channel and forget its reconnect attempts.
    pub async fn unsubscribe_from_organization(&self, tenant: &TenantId) {
        let entry = {
            let mut state = self.inner.state.lock().await;
            state.reconnect_attempts.remove(tenant);
            state
                .registry
                .remove(&RegistryKey::Subscription(tenant.clone()))
        };
        if let Some(entry) = entry {
            self.inner.teardown(entry).await;
            tracing::info!(tenant_id = %tenant, "Unsubscribed from organization changes");
        }
    }

    /// Invalidate the tenant's data every `every` (default from config)
    /// while online. Replaces any timer already running for the tenant.
    pub async fn start_periodic_sync(&self, tenant: &TenantId, every: Option<Duration>) {
        let configured = self.inner.config.periodic_interval();
        let every = match every {
            Some(every) if every.is_zero() => {
                tracing::warn!(tenant_id = %tenant, "Zero periodic interval, using configured default");
                configured
            }
            Some(every) => every,
            None => configured,
        };

        let task = tokio::spawn(run_periodic_sync(
            Arc::downgrade(&self.inner),
            tenant.clone(),
            every,
        ));
        let previous = {
            let mut state = self.inner.state.lock().await;
            state.registry.insert(
                RegistryKey::Periodic(tenant.clone()),
                RegistryEntry::Periodic(PeriodicSync {
                    interval: every,
                    task,
                }),
            )
        };
        if let Some(previous) = previous {
            self.inner.teardown(previous).await;
        }
        tracing::info!(
            tenant_id = %tenant,
            interval_ms = every.as_millis() as u64,
            "Periodic sync started"
        );
    }

    /// Cancel the tenant's periodic sync, if any.
    pub async fn stop_periodic_sync(&self, tenant: &TenantId) {
        let entry = {
            let mut state = self.inner.state.lock().await;
            state.registry.remove(&RegistryKey::Periodic(tenant.clone()))
        };
        if let Some(entry) = entry {
            self.inner.teardown(entry).await;
            tracing::info!(tenant_id = %tenant, "Periodic sync stopped");
        }
    }

    /// Interval of the tenant's periodic sync, if one is running.
    pub async fn periodic_interval(&self, tenant: &TenantId) -> Option<Duration> {
        let state = self.inner.state.lock().await;
        match state.registry.get(&RegistryKey::Periodic(tenant.clone())) {
            Some(RegistryEntry::Periodic(periodic)) => Some(periodic.interval),
            _ => None,
        }
    }

    /// Snapshot of connectivity, subscriptions, queue and timers.
    pub async fn get_sync_status(&self) -> SyncStatus {
        let state = self.inner.state.lock().await;
        SyncStatus {
            is_online: state.is_online,
            active_subscriptions: state.subscription_count(),
            queued_items: state.queue.len(),
            reconnect_attempts: state.reconnect_attempts.values().sum(),
            periodic_syncs: state.periodic_count(),
        }
    }

    /// Lifecycle state of the tenant's subscription, `None` if not subscribed.
    pub async fn subscription_state(&self, tenant: &TenantId) -> Option<SubscriptionState> {
        let state = self.inner.state.lock().await;
        match state
            .registry
            .get(&RegistryKey::Subscription(tenant.clone()))
        {
            Some(RegistryEntry::Subscription(sub)) => Some(sub.state),
            _ => None,
        }
    }

    /// Reconnect attempts made since the tenant last reached `Subscribed`.
    pub async fn reconnect_attempts(&self, tenant: &TenantId) -> u32 {
        let state = self.inner.state.lock().await;
        state.reconnect_attempts.get(tenant).copied().unwrap_or(0)
    }

    /// Copy of the offline queue, oldest first.
    pub async fn queued_entries(&self) -> Vec<SyncQueueEntry> {
        let state = self.inner.state.lock().await;
        state.queue.iter().cloned().collect()
    }

    /// Connectivity as last observed by the service.
    pub async fn is_online(&self) -> bool {
        self.inner.state.lock().await.is_online
    }

    /// Apply a connectivity transition directly. The listener started by
    /// [`Self::start`] calls the same path.
    pub async fn set_online(&self, online: bool) {
        self.inner.on_connectivity_change(online).await;
    }

    /// Replay queued changes in batches. Stops at the first failing batch,
    /// which is put back at the front of the queue.
    pub async fn process_sync_queue(&self) -> Result<usize, SyncError> {
        self.inner.process_sync_queue().await
    }

    /// Tear down every channel and timer.
    pub async fn cleanup(&self) {
        let entries: Vec<RegistryEntry> = {
            let mut state = self.inner.state.lock().await;
            state.reconnect_attempts.clear();
            state.registry.drain().map(|(_, entry)| entry).collect()
        };

        let mut channels = 0usize;
        let mut timers = 0usize;
        for entry in entries {
            match entry {
                RegistryEntry::Subscription(_) => channels += 1,
                RegistryEntry::Periodic(_) => timers += 1,
            }
            self.inner.teardown(entry).await;
        }
        tracing::info!(channels, timers, "Background sync cleaned up");
    }

    /// Cleanup plus stopping the connectivity listener and dropping the
    /// offline queue.
    pub async fn dispose(&self) {
        self.cleanup().await;
        let mut state = self.inner.state.lock().await;
        if let Some(listener) = state.listener.take() {
            listener.abort();
        }
        let discarded = state.queue.len();
        state.queue.clear();
        tracing::info!(discarded, "Background sync disposed");
    }
}

impl SyncInner {
    async fn open_subscription(self: &Arc<Self>, tenant: &TenantId, fresh: bool) {
        let epoch = {
            let mut state = self.state.lock().await;
            let key = RegistryKey::Subscription(tenant.clone());
            if state.registry.contains_key(&key) {
                tracing::debug!(tenant_id = %tenant, "Already subscribed");
                return;
            }
            if fresh {
                state.reconnect_attempts.remove(tenant);
            }
            state.next_epoch += 1;
            let epoch = state.next_epoch;
            state.registry.insert(
                key,
                RegistryEntry::Subscription(Subscription {
                    epoch,
                    state: SubscriptionState::Connecting,
                    channel: None,
                    pump: None,
                }),
            );
            epoch
        };

        tracing::info!(tenant_id = %tenant, epoch, "Subscribing to organization changes");
        match self.connect(tenant).await {
            Ok((channel, rx)) => {
                let pump = tokio::spawn(pump_messages(
                    Arc::downgrade(self),
                    tenant.clone(),
                    epoch,
                    rx,
                ));
                let mut state = self.state.lock().await;
                if let Some(sub) = state.subscription_mut(tenant, epoch) {
                    sub.channel = Some(channel);
                    sub.pump = Some(pump);
                    return;
                }
                drop(state);
                // Unsubscribed while the channel was opening.
                pump.abort();
                self.transport.close_channel(channel).await;
                tracing::debug!(tenant_id = %tenant, %channel, "Discarded channel of removed subscription");
            }
            Err(err) => {
                tracing::warn!(tenant_id = %tenant, error = %err, "Failed to open organization channel");
                self.schedule_reconnect(tenant, epoch).await;
            }
        }
    }

    async fn connect(
        &self,
        tenant: &TenantId,
    ) -> Result<(ChannelId, mpsc::Receiver<ChannelMessage>), TransportError> {
        let channel = self.transport.open_channel(&channel_name(tenant)).await?;
        let (tx, rx) = mpsc::channel(self.config.channel_buffer);
        match self.register_topics(channel, tenant, tx).await {
            Ok(()) => Ok((channel, rx)),
            Err(err) => {
                self.transport.close_channel(channel).await;
                Err(err)
            }
        }
    }

    async fn register_topics(
        &self,
        channel: ChannelId,
        tenant: &TenantId,
        sink: mpsc::Sender<ChannelMessage>,
    ) -> Result<(), TransportError> {
        for entity in EntityType::ALL {
            self.transport
                .on_table_change(channel, TableTopic::for_tenant(entity, tenant))
                .await?;
        }
        self.transport.subscribe(channel, sink).await
    }

    async fn handle_change(&self, tenant: &TenantId, event: ChangeEvent) {
        let plan = plan_for_event(&event);
        tracing::debug!(
            tenant_id = %tenant,
            entity = %event.entity,
            kind = %event.kind,
            ?plan,
            "Routing change event"
        );
        if plan == InvalidationPlan::Nothing {
            return;
        }
        self.cache.apply(tenant, &plan).await;

        let mut state = self.state.lock().await;
        if !state.is_online {
            let dropped = state.queue.push(SyncQueueEntry::new(tenant.clone(), event));
            if dropped > 0 {
                tracing::warn!(
                    tenant_id = %tenant,
                    dropped,
                    retained = state.queue.len(),
                    "Offline queue over capacity, dropped oldest entries"
                );
            }
        }
    }

    async fn handle_status(self: &Arc<Self>, tenant: &TenantId, epoch: u64, status: ChannelStatus) {
        match status {
            ChannelStatus::Subscribed => {
                let mut state = self.state.lock().await;
                let current = match state.subscription_mut(tenant, epoch) {
                    Some(sub) => {
                        sub.state = SubscriptionState::Subscribed;
                        true
                    }
                    None => false,
                };
                if current {
                    state.reconnect_attempts.remove(tenant);
                    tracing::info!(tenant_id = %tenant, epoch, "Organization channel subscribed");
                }
            }
            status if status.is_failure() => {
                tracing::warn!(tenant_id = %tenant, epoch, ?status, "Organization channel failed");
                self.schedule_reconnect(tenant, epoch).await;
            }
            status => {
                tracing::debug!(tenant_id = %tenant, epoch, ?status, "Organization channel status");
            }
        }
    }

    async fn schedule_reconnect(self: &Arc<Self>, tenant: &TenantId, epoch: u64) {
        let mut state = self.state.lock().await;
        match state.subscription_mut(tenant, epoch) {
            Some(sub) if sub.state != SubscriptionState::Reconnecting => {}
            _ => return,
        }

        let attempts = state.reconnect_attempts.get(tenant).copied().unwrap_or(0);
        if attempts >= self.config.max_reconnect_attempts {
            let entry = state
                .registry
                .remove(&RegistryKey::Subscription(tenant.clone()));
            drop(state);
            let err = SyncError::ReconnectExhausted {
                tenant_id: tenant.clone(),
                attempts,
            };
            tracing::error!(tenant_id = %tenant, attempts, error = %err, "Giving up on organization channel");
            if let Some(entry) = entry {
                // The caller may be the pump being torn down.
                let inner = Arc::clone(self);
                tokio::spawn(async move { inner.teardown(entry).await });
            }
            return;
        }

        state.reconnect_attempts.insert(tenant.clone(), attempts + 1);
        if let Some(sub) = state.subscription_mut(tenant, epoch) {
            sub.state = SubscriptionState::Reconnecting;
        }
        drop(state);

        let delay = self.config.reconnect_delay(attempts);
        tracing::info!(
            tenant_id = %tenant,
            attempt = attempts + 1,
            delay_ms = delay.as_millis() as u64,
            "Scheduling reconnect"
        );
        let inner = Arc::downgrade(self);
        let tenant = tenant.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(inner) = inner.upgrade() {
                inner.reconnect(tenant, epoch).await;
            }
        });
    }

    /// Boxed so the reconnect cycle through `open_subscription` has a
    /// nameable future type.
    fn reconnect(self: Arc<Self>, tenant: TenantId, epoch: u64) -> BoxFuture<'static, ()> {
        Box::pin(async move {
            let entry = {
                let mut state = self.state.lock().await;
                if state.subscription_mut(&tenant, epoch).is_none() {
                    tracing::debug!(tenant_id = %tenant, epoch, "Reconnect abandoned");
                    return;
                }
                state
                    .registry
                    .remove(&RegistryKey::Subscription(tenant.clone()))
            };
            if let Some(entry) = entry {
                self.teardown(entry).await;
            }
            self.open_subscription(&tenant, false).await;
        })
    }

    async fn reconnect_all(self: &Arc<Self>) {
        let entries: Vec<(TenantId, RegistryEntry)> = {
            let mut state = self.state.lock().await;
            let mut tenants: Vec<TenantId> = state
                .registry
                .keys()
                .filter_map(|key| match key {
                    RegistryKey::Subscription(tenant) => Some(tenant.clone()),
                    RegistryKey::Periodic(_) => None,
                })
                .collect();
            tenants.sort();
            tenants
                .into_iter()
                .filter_map(|tenant| {
                    state
                        .registry
                        .remove(&RegistryKey::Subscription(tenant.clone()))
                        .map(|entry| (tenant, entry))
                })
                .collect()
        };

        let count = entries.len();
        for (tenant, entry) in entries {
            self.teardown(entry).await;
            self.open_subscription(&tenant, false).await;
        }
        if count > 0 {
            tracing::info!(subscriptions = count, "Reconnected organization channels");
        }
    }

    async fn teardown(&self, entry: RegistryEntry) {
        match entry {
            RegistryEntry::Subscription(sub) => {
                if let Some(pump) = sub.pump {
                    pump.abort();
                }
                if let Some(channel) = sub.channel {
                    self.transport.close_channel(channel).await;
                }
            }
            RegistryEntry::Periodic(periodic) => periodic.task.abort(),
        }
    }

    async fn on_connectivity_change(self: &Arc<Self>, online: bool) {
        let queued = {
            let mut state = self.state.lock().await;
            if state.is_online == online {
                return;
            }
            state.is_online = online;
            state.queue.len()
        };

        if online {
            tracing::info!(queued, "Connectivity restored");
            if let Err(err) = self.process_sync_queue().await {
                tracing::warn!(error = %err, "Offline queue replay incomplete");
            }
            self.reconnect_all().await;
        } else {
            tracing::info!(queued, "Connectivity lost, queueing changes");
        }
    }

    async fn periodic_tick(&self, tenant: &TenantId) {
        if !self.state.lock().await.is_online {
            tracing::trace!(tenant_id = %tenant, "Offline, skipping periodic sync");
            return;
        }
        self.cache.invalidate_organization_data(tenant).await;
        if let Err(err) = self.process_sync_queue().await {
            tracing::warn!(tenant_id = %tenant, error = %err, "Offline queue replay incomplete");
        }
        tracing::trace!(tenant_id = %tenant, "Periodic sync completed");
    }

    async fn process_sync_queue(&self) -> Result<usize, SyncError> {
        // One drain at a time; a concurrent caller finds nothing to do.
        let Ok(_guard) = self.drain_lock.try_lock() else {
            return Ok(0);
        };

        let mut replayed = 0usize;
        loop {
            let batch = {
                let mut state = self.state.lock().await;
                if !state.is_online {
                    break;
                }
                state.queue.take_batch(self.config.drain_batch_size)
            };
            if batch.is_empty() {
                break;
            }

            let outcome = try_join_all(batch.iter().map(|entry| self.replayer.replay(entry))).await;
            if let Err(err) = outcome {
                let mut state = self.state.lock().await;
                state.queue.restore_front(batch);
                let remaining = state.queue.len();
                tracing::warn!(error = %err, remaining, replayed, "Queue replay failed, batch re-queued");
                return Err(SyncError::DrainStopped {
                    remaining,
                    reason: err.to_string(),
                });
            }
            replayed += batch.len();
        }

        if replayed > 0 {
            tracing::info!(replayed, "Offline queue replayed");
        }
        Ok(replayed)
    }
}

async fn pump_messages(
    inner: Weak<SyncInner>,
    tenant: TenantId,
    epoch: u64,
    mut rx: mpsc::Receiver<ChannelMessage>,
) {
    // Messages are handled to completion one at a time, in receive order.
    while let Some(message) = rx.recv().await {
        let Some(service) = inner.upgrade() else {
            return;
        };
        match message {
            ChannelMessage::Change(event) => service.handle_change(&tenant, event).await,
            ChannelMessage::Status(status) => service.handle_status(&tenant, epoch, status).await,
        }
    }

    // The transport dropped the sink. Torn-down subscriptions abort their
    // pump first, so a current epoch here means the channel died under us.
    let Some(service) = inner.upgrade() else {
        return;
    };
    tracing::warn!(tenant_id = %tenant, epoch, "Channel message stream ended");
    service.schedule_reconnect(&tenant, epoch).await;
}

async fn run_periodic_sync(inner: Weak<SyncInner>, tenant: TenantId, every: Duration) {
    let mut ticker = interval_at(Instant::now() + every, every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        ticker.tick().await;
        let Some(service) = inner.upgrade() else {
            break;
        };
        service.periodic_tick(&tenant).await;
    }
}

async fn watch_connectivity(inner: Weak<SyncInner>, mut rx: watch::Receiver<bool>) {
    while rx.changed().await.is_ok() {
        let online = *rx.borrow_and_update();
        let Some(service) = inner.upgrade() else {
            break;
        };
        service.on_connectivity_change(online).await;
    }
}
