//! Bounded offline queue.
//!
//! Changes that arrive while offline are kept here and replayed once
//! connectivity returns. When the queue grows past its capacity only the
//! most recent entries are retained; older ones are dropped and counted.

use chrono::Utc;
use fleetline_core::{ChangeEvent, EntityType, SyncConfig, TenantId, Timestamp};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// A change recorded while offline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncQueueEntry {
    pub entity: EntityType,
    pub tenant_id: TenantId,
    pub payload: ChangeEvent,
    pub timestamp: Timestamp,
}

impl SyncQueueEntry {
    pub fn new(tenant_id: TenantId, payload: ChangeEvent) -> Self {
        Self {
            entity: payload.entity,
            tenant_id,
            payload,
            timestamp: Utc::now(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SyncQueue {
    entries: VecDeque<SyncQueueEntry>,
    capacity: usize,
    retain: usize,
    dropped: u64,
}

impl SyncQueue {
    /// `retain` is clamped to `capacity`.
    pub fn new(capacity: usize, retain: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            capacity,
            retain: retain.min(capacity),
            dropped: 0,
        }
    }

    pub fn from_config(config: &SyncConfig) -> Self {
        Self::new(config.queue_capacity, config.queue_retain)
    }

    /// Append an entry. Returns how many of the oldest entries were dropped
    /// to get back under capacity.
    pub fn push(&mut self, entry: SyncQueueEntry) -> usize {
        self.entries.push_back(entry);
        self.enforce_capacity()
    }

    /// Remove up to `size` entries from the front.
    pub fn take_batch(&mut self, size: usize) -> Vec<SyncQueueEntry> {
        let n = size.min(self.entries.len());
        self.entries.drain(..n).collect()
    }

    /// Put a failed batch back at the front in its original order.
    pub fn restore_front(&mut self, batch: Vec<SyncQueueEntry>) -> usize {
        for entry in batch.into_iter().rev() {
            self.entries.push_front(entry);
        }
        self.enforce_capacity()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Total entries dropped by the capacity policy since creation.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = &SyncQueueEntry> {
        self.entries.iter()
    }

    fn enforce_capacity(&mut self) -> usize {
        if self.entries.len() <= self.capacity {
            return 0;
        }
        let excess = self.entries.len() - self.retain;
        self.entries.drain(..excess);
        self.dropped += excess as u64;
        excess
    }
}

impl Default for SyncQueue {
    fn default() -> Self {
        Self::from_config(&SyncConfig::default())
    }
}
