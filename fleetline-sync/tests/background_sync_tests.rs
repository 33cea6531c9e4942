//! Background Sync Service Tests
//!
//! Drives the service through an in-process transport under paused time:
//! subscription lifecycle, change routing, offline queueing, reconnect
//! backoff, periodic sync and teardown.

use fleetline_storage::{CacheManager, KeyPattern};
use fleetline_sync::{
    channel_name, BackgroundSyncService, ChannelStatus, ConnectivityMonitor, SubscriptionState,
};
use fleetline_test_utils::assertions::{
    assert_invalidated, assert_not_invalidated, assert_organization_wide,
};
use fleetline_test_utils::{
    fixtures, init_tracing, CacheConfig, ChangeEvent, EntityType, FlakyReplayer, MockTransport,
    RealtimeTransport, RecordingQueryCache, TenantId,
};
use std::sync::Arc;
use std::time::Duration;

struct Harness {
    cache: Arc<RecordingQueryCache>,
    transport: Arc<MockTransport>,
    connectivity: Arc<ConnectivityMonitor>,
    replayer: Arc<FlakyReplayer>,
    service: BackgroundSyncService,
}

fn harness_with(transport: MockTransport) -> Harness {
    init_tracing();
    let cache = Arc::new(RecordingQueryCache::new());
    let manager = Arc::new(CacheManager::with_cache(
        cache.clone(),
        CacheConfig::default(),
    ));
    let transport = Arc::new(transport);
    let connectivity = Arc::new(ConnectivityMonitor::new(true));
    let replayer = Arc::new(FlakyReplayer::new());
    let service = BackgroundSyncService::with_replayer(
        manager,
        transport.clone(),
        connectivity.clone(),
        replayer.clone(),
        fixtures::sync_config(),
    );
    Harness {
        cache,
        transport,
        connectivity,
        replayer,
        service,
    }
}

fn harness() -> Harness {
    harness_with(MockTransport::new())
}

/// Let every ready task run to completion. Time is paused, so this only
/// advances the clock by a millisecond.
async fn settle() {
    tokio::time::sleep(Duration::from_millis(1)).await;
}

// ============================================================================
// SUBSCRIPTIONS
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_subscribe_twice_opens_one_channel() {
    let h = harness();
    let tenant = fixtures::tenant();

    h.service.subscribe_to_organization(&tenant).await;
    h.service.subscribe_to_organization(&tenant).await;
    settle().await;

    assert_eq!(h.transport.open_count(), 1);
    assert_eq!(h.transport.opened(), vec![channel_name(&tenant)]);
    assert_eq!(h.service.get_sync_status().await.active_subscriptions, 1);
    assert_eq!(
        h.service.subscription_state(&tenant).await,
        Some(SubscriptionState::Subscribed)
    );
}

#[tokio::test(start_paused = true)]
async fn test_channel_registers_every_table() {
    let h = harness();
    let tenant = fixtures::tenant();
    h.service.subscribe_to_organization(&tenant).await;

    let channel = h
        .transport
        .live_channel(&channel_name(&tenant))
        .expect("live channel");
    let topics = h.transport.topics(channel);
    assert_eq!(topics.len(), EntityType::ALL.len());
    for topic in &topics {
        if topic.entity == EntityType::EquipmentNote {
            assert_eq!(topic.filter, None);
        } else {
            assert_eq!(topic.filter.as_deref(), Some("organization_id=eq.org-1"));
        }
    }
}

#[tokio::test(start_paused = true)]
async fn test_unsubscribe_closes_channel() {
    let h = harness();
    let tenant = fixtures::tenant();
    h.service.subscribe_to_organization(&tenant).await;

    h.service.unsubscribe_from_organization(&tenant).await;
    h.service.unsubscribe_from_organization(&tenant).await;

    assert_eq!(h.transport.close_count(), 1);
    assert_eq!(h.service.subscription_state(&tenant).await, None);
    assert_eq!(h.service.get_sync_status().await.active_subscriptions, 0);
}

// ============================================================================
// ROUTING
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_equipment_delete_invalidates_whole_tenant() {
    let h = harness();
    let tenant = fixtures::tenant();
    h.service.subscribe_to_organization(&tenant).await;
    settle().await;

    assert!(
        h.transport
            .emit_change(&tenant, fixtures::equipment_deleted("eq-1"))
            .await
    );
    settle().await;

    assert_eq!(h.cache.invalidations().len(), 12);
    assert_organization_wide(&h.cache, &tenant);
}

#[tokio::test(start_paused = true)]
async fn test_changes_are_applied_in_delivery_order() {
    let h = harness();
    let tenant = fixtures::tenant();
    h.service.subscribe_to_organization(&tenant).await;
    settle().await;

    h.transport
        .emit_change(&tenant, fixtures::team_updated("t-1"))
        .await;
    h.transport
        .emit_change(&tenant, fixtures::member_inserted("m-1"))
        .await;
    settle().await;

    assert_eq!(
        h.cache.invalidated_patterns(),
        vec![
            KeyPattern::new(["teams", "org-1"]),
            KeyPattern::new(["work-orders-enhanced", "org-1"]),
            KeyPattern::new(["organization-members", "org-1"]),
            KeyPattern::new(["organization-admins", "org-1"]),
            KeyPattern::new(["teams", "org-1"]),
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_online_change_is_not_queued() {
    let h = harness();
    let tenant = fixtures::tenant();
    h.service.subscribe_to_organization(&tenant).await;
    settle().await;

    h.transport
        .emit_change(&tenant, fixtures::equipment_updated("eq-1"))
        .await;
    settle().await;

    assert_eq!(h.cache.invalidations().len(), 4);
    assert_invalidated(&h.cache, &["equipment-work-orders", "org-1", "eq-1"]);
    assert_eq!(h.service.get_sync_status().await.queued_items, 0);
}

#[tokio::test(start_paused = true)]
async fn test_note_without_equipment_is_ignored() {
    let h = harness();
    let tenant = fixtures::tenant();
    h.service.subscribe_to_organization(&tenant).await;
    settle().await;

    h.transport
        .emit_change(&tenant, fixtures::note_inserted("n-1", None))
        .await;
    h.transport
        .emit_change(&tenant, fixtures::note_inserted("n-2", Some("eq-7")))
        .await;
    settle().await;

    assert_invalidated(&h.cache, &["equipment-notes", "org-1", "eq-7"]);
    assert_eq!(h.cache.invalidations().len(), 4);
}

#[tokio::test(start_paused = true)]
async fn test_work_order_routing_follows_equipment_id() {
    let h = harness();
    let tenant = fixtures::tenant();
    h.service.subscribe_to_organization(&tenant).await;
    settle().await;

    h.transport
        .emit_change(&tenant, fixtures::work_order_inserted("wo-1", Some("eq-1")))
        .await;
    settle().await;

    assert_invalidated(&h.cache, &["work-orders-enhanced", "org-1"]);
    assert_invalidated(&h.cache, &["work-order", "org-1", "wo-1"]);
    assert_invalidated(&h.cache, &["equipment-notes", "org-1", "eq-1"]);
    assert_invalidated(&h.cache, &["equipment-work-orders", "org-1", "eq-1"]);

    h.cache.clear_calls();
    h.transport
        .emit_change(
            &tenant,
            ChangeEvent::delete(EntityType::WorkOrder, fixtures::row("wo-2", None)),
        )
        .await;
    settle().await;

    assert_invalidated(&h.cache, &["work-orders-enhanced", "org-1"]);
    assert_invalidated(&h.cache, &["work-order", "org-1", "wo-2"]);
    assert_invalidated(&h.cache, &["dashboard-stats", "org-1"]);
    assert_not_invalidated(&h.cache, &["equipment-optimized", "org-1"]);
    assert_eq!(h.cache.invalidations().len(), 3);
}

// ============================================================================
// OFFLINE QUEUE
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_offline_change_is_applied_and_queued() {
    let h = harness();
    let tenant = fixtures::tenant();
    h.service.subscribe_to_organization(&tenant).await;
    settle().await;

    h.service.set_online(false).await;
    h.transport
        .emit_change(&tenant, fixtures::equipment_updated("eq-1"))
        .await;
    settle().await;

    assert_invalidated(&h.cache, &["equipment-optimized", "org-1"]);
    let status = h.service.get_sync_status().await;
    assert!(!status.is_online);
    assert_eq!(status.queued_items, 1);
    let queued = h.service.queued_entries().await;
    assert_eq!(queued[0].entity, EntityType::Equipment);
    assert_eq!(queued[0].tenant_id, tenant);
}

#[tokio::test(start_paused = true)]
async fn test_queue_overflow_keeps_latest_fifty() {
    let h = harness();
    let tenant = fixtures::tenant();
    h.service.subscribe_to_organization(&tenant).await;
    settle().await;
    h.service.set_online(false).await;

    for n in 0..101 {
        h.transport
            .emit_change(&tenant, fixtures::equipment_updated(&format!("eq-{}", n)))
            .await;
    }
    settle().await;

    let queued = h.service.queued_entries().await;
    assert_eq!(queued.len(), 50);
    assert_eq!(queued[0].payload.field("id"), Some("eq-51"));
    assert_eq!(queued[49].payload.field("id"), Some("eq-100"));
}

#[tokio::test(start_paused = true)]
async fn test_going_online_drains_queue_and_reconnects() {
    let h = harness();
    let tenant = fixtures::tenant();
    h.service.subscribe_to_organization(&tenant).await;
    settle().await;
    h.service.set_online(false).await;
    for n in 0..3 {
        h.transport
            .emit_change(&tenant, fixtures::equipment_updated(&format!("eq-{}", n)))
            .await;
    }
    settle().await;

    h.service.set_online(true).await;
    settle().await;

    assert_eq!(h.replayer.replayed().len(), 3);
    assert_eq!(h.service.get_sync_status().await.queued_items, 0);
    assert_eq!(h.transport.open_count(), 2);
    assert_eq!(h.transport.close_count(), 1);
    assert_eq!(
        h.service.subscription_state(&tenant).await,
        Some(SubscriptionState::Subscribed)
    );
}

#[tokio::test(start_paused = true)]
async fn test_failed_batch_is_requeued_in_order() {
    let h = harness();
    let tenant = fixtures::tenant();
    h.service.subscribe_to_organization(&tenant).await;
    settle().await;
    h.service.set_online(false).await;
    for n in 0..15 {
        h.transport
            .emit_change(&tenant, fixtures::equipment_updated(&format!("eq-{}", n)))
            .await;
    }
    settle().await;

    h.replayer.fail_next(1);
    h.service.set_online(true).await;
    settle().await;

    let queued = h.service.queued_entries().await;
    assert_eq!(queued.len(), 15);
    assert_eq!(queued[0].payload.field("id"), Some("eq-0"));
    assert_eq!(queued[14].payload.field("id"), Some("eq-14"));

    assert_eq!(h.service.process_sync_queue().await, Ok(15));
    let replayed: Vec<String> = h
        .replayer
        .replayed()
        .iter()
        .filter_map(|entry| entry.payload.field("id").map(str::to_string))
        .collect();
    assert_eq!(replayed.first().map(String::as_str), Some("eq-0"));
    assert_eq!(replayed.last().map(String::as_str), Some("eq-14"));
}

#[tokio::test(start_paused = true)]
async fn test_drain_is_noop_while_offline() {
    let h = harness();
    h.service.set_online(false).await;
    assert_eq!(h.service.process_sync_queue().await, Ok(0));
}

// ============================================================================
// RECONNECT
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_reconnect_backs_off_then_gives_up() {
    let h = harness_with(MockTransport::manual());
    let tenant = fixtures::tenant();
    h.service.subscribe_to_organization(&tenant).await;
    settle().await;

    for (attempt, delay_ms) in [1000u64, 2000, 4000, 8000, 16000].into_iter().enumerate() {
        let opened = h.transport.open_count();
        assert!(
            h.transport
                .emit_status(&tenant, ChannelStatus::ChannelError("dropped".into()))
                .await
        );
        tokio::time::sleep(Duration::from_millis(delay_ms - 1)).await;
        assert_eq!(h.transport.open_count(), opened, "attempt {} fired early", attempt + 1);
        assert_eq!(
            h.service.get_sync_status().await.reconnect_attempts,
            attempt as u32 + 1
        );
        tokio::time::sleep(Duration::from_millis(2)).await;
        assert_eq!(h.transport.open_count(), opened + 1);
    }

    h.transport
        .emit_status(&tenant, ChannelStatus::TimedOut)
        .await;
    settle().await;
    tokio::time::sleep(Duration::from_secs(120)).await;

    assert_eq!(h.transport.open_count(), 6);
    assert_eq!(h.transport.live_channels(), 0);
    assert_eq!(h.service.subscription_state(&tenant).await, None);
    assert_eq!(h.service.reconnect_attempts(&tenant).await, 5);
    assert_eq!(h.service.get_sync_status().await.reconnect_attempts, 5);

    h.service.subscribe_to_organization(&tenant).await;
    assert_eq!(h.transport.open_count(), 7);
    assert_eq!(h.service.reconnect_attempts(&tenant).await, 0);
    assert_eq!(h.service.get_sync_status().await.reconnect_attempts, 0);
}

#[tokio::test(start_paused = true)]
async fn test_subscribed_status_resets_attempts() {
    let h = harness_with(MockTransport::manual());
    let tenant = fixtures::tenant();
    h.service.subscribe_to_organization(&tenant).await;

    h.transport
        .emit_status(&tenant, ChannelStatus::TimedOut)
        .await;
    tokio::time::sleep(Duration::from_millis(1001)).await;
    assert_eq!(h.service.reconnect_attempts(&tenant).await, 1);

    h.transport
        .emit_status(&tenant, ChannelStatus::Subscribed)
        .await;
    settle().await;
    assert_eq!(h.service.reconnect_attempts(&tenant).await, 0);
    assert_eq!(
        h.service.subscription_state(&tenant).await,
        Some(SubscriptionState::Subscribed)
    );
}

#[tokio::test(start_paused = true)]
async fn test_unsubscribe_abandons_pending_reconnect() {
    let h = harness_with(MockTransport::manual());
    let tenant = fixtures::tenant();
    h.service.subscribe_to_organization(&tenant).await;

    h.transport
        .emit_status(&tenant, ChannelStatus::ChannelError("dropped".into()))
        .await;
    settle().await;
    h.service.unsubscribe_from_organization(&tenant).await;
    tokio::time::sleep(Duration::from_secs(5)).await;

    assert_eq!(h.transport.open_count(), 1);
    assert_eq!(h.service.subscription_state(&tenant).await, None);
}

#[tokio::test(start_paused = true)]
async fn test_subscribe_failure_schedules_reconnect() {
    let h = harness();
    let tenant = fixtures::tenant();
    h.transport.fail_next_subscribes(1);

    h.service.subscribe_to_organization(&tenant).await;
    assert_eq!(h.transport.close_count(), 1);
    assert_eq!(
        h.service.subscription_state(&tenant).await,
        Some(SubscriptionState::Reconnecting)
    );

    tokio::time::sleep(Duration::from_millis(1001)).await;
    assert_eq!(h.transport.open_count(), 2);
    assert_eq!(
        h.service.subscription_state(&tenant).await,
        Some(SubscriptionState::Subscribed)
    );
}

#[tokio::test(start_paused = true)]
async fn test_open_failure_schedules_reconnect() {
    let h = harness();
    let tenant = fixtures::tenant();
    h.transport.fail_next_opens(1);

    h.service.subscribe_to_organization(&tenant).await;
    assert_eq!(h.transport.open_count(), 1);
    assert_eq!(h.transport.live_channels(), 0);
    assert_eq!(h.service.reconnect_attempts(&tenant).await, 1);
    assert_eq!(
        h.service.subscription_state(&tenant).await,
        Some(SubscriptionState::Reconnecting)
    );

    tokio::time::sleep(Duration::from_millis(1001)).await;
    assert_eq!(h.transport.open_count(), 2);
    assert_eq!(h.transport.live_channels(), 1);
    assert_eq!(h.service.reconnect_attempts(&tenant).await, 0);
    assert_eq!(
        h.service.subscription_state(&tenant).await,
        Some(SubscriptionState::Subscribed)
    );
}

#[tokio::test(start_paused = true)]
async fn test_channel_dropped_by_transport_is_reopened() {
    let h = harness();
    let tenant = fixtures::tenant();
    h.service.subscribe_to_organization(&tenant).await;
    settle().await;

    let channel = h
        .transport
        .live_channel(&channel_name(&tenant))
        .expect("live channel");
    h.transport.close_channel(channel).await;
    settle().await;
    assert_eq!(
        h.service.subscription_state(&tenant).await,
        Some(SubscriptionState::Reconnecting)
    );

    tokio::time::sleep(Duration::from_millis(1000)).await;
    assert_eq!(h.transport.closed_channels(), vec![channel]);
    assert_eq!(h.transport.open_count(), 2);
    assert_eq!(h.transport.live_channels(), 1);
    assert_eq!(
        h.service.subscription_state(&tenant).await,
        Some(SubscriptionState::Subscribed)
    );
    assert!(
        h.transport
            .emit_change(&tenant, fixtures::team_updated("t-1"))
            .await
    );
}

#[tokio::test(start_paused = true)]
async fn test_online_transition_reconnects_every_tenant() {
    let h = harness();
    let first = fixtures::tenant();
    let second = fixtures::other_tenant();
    h.service.subscribe_to_organization(&first).await;
    h.service.subscribe_to_organization(&second).await;
    settle().await;

    h.service.set_online(false).await;
    h.service.set_online(true).await;
    settle().await;

    assert_eq!(h.transport.open_count(), 4);
    assert_eq!(h.transport.close_count(), 2);
    assert_eq!(h.transport.live_channels(), 2);
    assert_eq!(h.service.get_sync_status().await.active_subscriptions, 2);
}

#[tokio::test(start_paused = true)]
async fn test_connectivity_listener_follows_monitor() {
    let h = harness();
    h.service.start().await;

    h.connectivity.go_offline();
    settle().await;
    assert!(!h.service.is_online().await);

    h.connectivity.go_online();
    settle().await;
    assert!(h.service.is_online().await);
}

// ============================================================================
// PERIODIC SYNC AND TEARDOWN
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_periodic_sync_invalidates_when_online() {
    let h = harness();
    let tenant = fixtures::tenant();
    h.service
        .start_periodic_sync(&tenant, Some(Duration::from_secs(60)))
        .await;
    settle().await;
    assert!(h.cache.invalidations().is_empty());

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(h.cache.invalidations().len(), 12);

    h.service.set_online(false).await;
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(h.cache.invalidations().len(), 12);
}

#[tokio::test(start_paused = true)]
async fn test_periodic_tick_drains_offline_queue() {
    let h = harness();
    let tenant = fixtures::tenant();
    h.service.subscribe_to_organization(&tenant).await;
    settle().await;
    h.service.set_online(false).await;
    for n in 0..3 {
        h.transport
            .emit_change(&tenant, fixtures::equipment_updated(&format!("eq-{}", n)))
            .await;
    }
    settle().await;

    h.replayer.fail_next(1);
    h.service.set_online(true).await;
    settle().await;
    assert_eq!(h.service.get_sync_status().await.queued_items, 3);
    assert!(h.replayer.replayed().is_empty());

    h.service
        .start_periodic_sync(&tenant, Some(Duration::from_secs(60)))
        .await;
    tokio::time::sleep(Duration::from_secs(60)).await;

    assert_eq!(h.service.get_sync_status().await.queued_items, 0);
    assert_eq!(h.replayer.replayed().len(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_second_periodic_sync_replaces_first() {
    let h = harness();
    let tenant = fixtures::tenant();
    h.service
        .start_periodic_sync(&tenant, Some(Duration::from_secs(60)))
        .await;
    h.service.start_periodic_sync(&tenant, None).await;

    assert_eq!(h.service.get_sync_status().await.periodic_syncs, 1);
    assert_eq!(
        h.service.periodic_interval(&tenant).await,
        Some(Duration::from_secs(300))
    );

    tokio::time::sleep(Duration::from_secs(61)).await;
    assert!(h.cache.invalidations().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_cleanup_releases_channel_and_timer() {
    let h = harness();
    let tenant = fixtures::tenant();
    h.service.subscribe_to_organization(&tenant).await;
    h.service
        .start_periodic_sync(&tenant, Some(Duration::from_secs(60)))
        .await;

    h.service.cleanup().await;

    assert_eq!(h.transport.close_count(), 1);
    let status = h.service.get_sync_status().await;
    assert_eq!(status.active_subscriptions, 0);
    assert_eq!(status.periodic_syncs, 0);

    tokio::time::sleep(Duration::from_secs(120)).await;
    assert!(h.cache.invalidations().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_dispose_drops_queue() {
    let h = harness();
    let tenant = TenantId::from("org-9");
    h.service.subscribe_to_organization(&tenant).await;
    settle().await;
    h.service.set_online(false).await;
    h.transport
        .emit_change(&tenant, fixtures::equipment_updated("eq-1"))
        .await;
    settle().await;

    h.service.dispose().await;

    let status = h.service.get_sync_status().await;
    assert_eq!(status.queued_items, 0);
    assert_eq!(status.active_subscriptions, 0);
    assert_eq!(h.transport.live_channels(), 0);
}
