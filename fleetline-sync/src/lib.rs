//! Fleetline realtime sync
//!
//! Subscribes to per-tenant change channels, turns every row change into
//! cache invalidations and keeps working through connectivity loss.

pub mod connectivity;
pub mod queue;
pub mod replay;
pub mod service;
pub mod transport;

pub use connectivity::{Connectivity, ConnectivityMonitor};
pub use queue::{SyncQueue, SyncQueueEntry};
pub use replay::{CacheReplayer, QueueReplayer};
pub use service::{BackgroundSyncService, SubscriptionState, SyncStatus};
pub use transport::{
    channel_name, ChannelId, ChannelMessage, ChannelStatus, RealtimeTransport, TableTopic,
};
