//! Realtime transport interface.
//!
//! A transport multiplexes several table-level change topics onto one
//! channel per tenant. Messages for a channel are pushed into the sender
//! handed to [`RealtimeTransport::subscribe`] and MUST be sent in the order
//! the backend delivered them; the sync service handles them strictly in
//! receive order and relies on that for per-tenant ordering.

use async_trait::async_trait;
use fleetline_core::{ChangeEvent, EntityType, TenantId, TransportError};
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::mpsc;

/// Transport-assigned channel handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChannelId(pub u64);

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "channel-{}", self.0)
    }
}

/// Name of the channel carrying a tenant's change topics.
pub fn channel_name(tenant: &TenantId) -> String {
    format!("org-{}-changes", tenant)
}

/// One table-level change topic registered on a channel.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TableTopic {
    pub entity: EntityType,
    /// Row filter in `column=eq.value` form; `None` subscribes to every row.
    pub filter: Option<String>,
}

impl TableTopic {
    /// Topic for `entity` restricted to the tenant's rows where the table
    /// allows it.
    pub fn for_tenant(entity: EntityType, tenant: &TenantId) -> Self {
        let filter = entity
            .is_tenant_filtered()
            .then(|| format!("organization_id=eq.{}", tenant));
        Self { entity, filter }
    }

    pub fn table(&self) -> &'static str {
        self.entity.table_name()
    }
}

/// Subscription status reported by the transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "reason", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChannelStatus {
    Subscribed,
    ChannelError(String),
    TimedOut,
    Closed,
}

impl ChannelStatus {
    /// Statuses that should trigger a reconnect.
    pub fn is_failure(&self) -> bool {
        matches!(self, ChannelStatus::ChannelError(_) | ChannelStatus::TimedOut)
    }
}

/// Everything a channel can deliver.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelMessage {
    Status(ChannelStatus),
    Change(ChangeEvent),
}

/// Realtime change-feed transport.
#[async_trait]
pub trait RealtimeTransport: Send + Sync {
    async fn open_channel(&self, name: &str) -> Result<ChannelId, TransportError>;

    /// Register a table topic. Must be called before [`Self::subscribe`].
    async fn on_table_change(
        &self,
        channel: ChannelId,
        topic: TableTopic,
    ) -> Result<(), TransportError>;

    /// Start delivery. Status changes and row changes for every registered
    /// topic are sent, in order, through `sink`.
    async fn subscribe(
        &self,
        channel: ChannelId,
        sink: mpsc::Sender<ChannelMessage>,
    ) -> Result<(), TransportError>;

    /// Stop delivery and release the channel. Closing twice is harmless.
    async fn close_channel(&self, channel: ChannelId);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topic_filters_by_tenant() {
        let tenant = TenantId::from("org-1");
        let topic = TableTopic::for_tenant(EntityType::WorkOrder, &tenant);
        assert_eq!(topic.table(), "work_orders");
        assert_eq!(topic.filter.as_deref(), Some("organization_id=eq.org-1"));
    }

    #[test]
    fn test_note_topic_is_unfiltered() {
        let topic = TableTopic::for_tenant(EntityType::EquipmentNote, &TenantId::from("org-1"));
        assert_eq!(topic.filter, None);
    }

    #[test]
    fn test_channel_name() {
        assert_eq!(channel_name(&TenantId::from("org-1")), "org-org-1-changes");
    }

    #[test]
    fn test_failure_statuses() {
        assert!(ChannelStatus::ChannelError("boom".into()).is_failure());
        assert!(ChannelStatus::TimedOut.is_failure());
        assert!(!ChannelStatus::Subscribed.is_failure());
        assert!(!ChannelStatus::Closed.is_failure());
    }
}
