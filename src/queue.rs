// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Persistent offline queue for payloads that cannot be sent immediately.
//!
//! Durable FIFO over the per-origin store, capacity-bounded (oldest evicted
//! first) and age-bounded. Expiration is enforced lazily on every read path;
//! there is no background sweep. The queue is owned exclusively by the
//! transport.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::clock::SharedClock;
use crate::config::QueueConfig;
use crate::error::StorageError;
use crate::storage::{load_json, store_json, SharedStore};

/// Storage key for the persisted queue.
pub const OFFLINE_QUEUE_KEY: &str = "errwatch_offline_queue";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueItem {
    pub payload: Value,
    /// Unix epoch milliseconds at enqueue time.
    pub enqueued_at_ms: i64,
}

pub struct OfflineQueue {
    config: QueueConfig,
    store: SharedStore,
    clock: SharedClock,
}

impl OfflineQueue {
    pub fn new(config: &QueueConfig, store: SharedStore, clock: SharedClock) -> Self {
        Self {
            config: config.clone(),
            store,
            clock,
        }
    }

    /// Load the persisted queue, dropping expired items.
    ///
    /// Corrupt or non-array stored data is treated as an empty queue. If
    /// expiration removed anything, the filtered remainder is persisted.
    fn load(&self) -> Vec<QueueItem> {
        let items: Vec<QueueItem> =
            load_json(self.store.as_ref(), OFFLINE_QUEUE_KEY).unwrap_or_default();
        let cutoff = self.clock.now_ms() - self.config.max_age_secs * 1000;
        let before = items.len();
        let items: Vec<QueueItem> = items
            .into_iter()
            .filter(|item| item.enqueued_at_ms >= cutoff)
            .collect();
        if items.len() != before {
            debug!(dropped = before - items.len(), "expired offline queue items");
            self.persist(&items);
        }
        items
    }

    /// Persist, swallowing every storage failure.
    fn persist(&self, items: &[QueueItem]) {
        if let Err(err) = store_json(self.store.as_ref(), OFFLINE_QUEUE_KEY, &items) {
            debug!(%err, "offline queue not persisted");
        }
    }

    /// Append a payload, evicting from the front when over capacity.
    ///
    /// On a quota failure the oldest half is discarded and the write retried
    /// once; if that also fails the payload is lost silently.
    pub fn enqueue(&self, payload: Value) {
        let mut items = self.load();
        items.push(QueueItem {
            payload,
            enqueued_at_ms: self.clock.now_ms(),
        });
        while items.len() > self.config.max_size {
            items.remove(0);
        }

        match store_json(self.store.as_ref(), OFFLINE_QUEUE_KEY, &items) {
            Ok(()) => {}
            Err(StorageError::QuotaExceeded(_)) => {
                let keep_from = items.len() / 2;
                let items = items.split_off(keep_from);
                if let Err(err) = store_json(self.store.as_ref(), OFFLINE_QUEUE_KEY, &items) {
                    debug!(%err, "offline queue write failed after pruning, dropping payload");
                }
            }
            Err(err) => {
                debug!(%err, "offline queue write failed, dropping payload");
            }
        }
    }

    /// Pop the oldest payload, or None when empty.
    pub fn dequeue(&self) -> Option<Value> {
        let mut items = self.load();
        if items.is_empty() {
            return None;
        }
        let item = items.remove(0);
        self.persist(&items);
        Some(item.payload)
    }

    /// All live payloads, oldest first.
    pub fn get_all(&self) -> Vec<Value> {
        self.load().into_iter().map(|item| item.payload).collect()
    }

    pub fn len(&self) -> usize {
        self.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.load().is_empty()
    }

    pub fn clear(&self) {
        self.store.remove(OFFLINE_QUEUE_KEY);
    }
}
