// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Cross-page session identity and idle-timeout tracking.
//!
//! A session is the unit of correlation between error reports, replay
//! buffers, and recovery sessions. The record lives in the durable per-origin
//! store so it survives full-page navigations; idle expiry mints a fresh
//! UUID-identified record.

use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::clock::SharedClock;
use crate::config::SessionConfig;
use crate::storage::{load_json, store_json, SharedStore};

/// Storage key for the persisted session record.
pub const SESSION_STATE_KEY: &str = "errwatch_session";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PageVisit {
    pub url: String,
    /// Unix epoch milliseconds.
    pub timestamp_ms: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    pub session_id: String,
    pub started_at_ms: i64,
    pub last_activity_at_ms: i64,
    pub page_count: u32,
    pub pages: Vec<PageVisit>,
}

impl SessionRecord {
    fn mint(now_ms: i64) -> Self {
        Self {
            session_id: Uuid::new_v4().to_string(),
            started_at_ms: now_ms,
            last_activity_at_ms: now_ms,
            page_count: 1,
            pages: Vec::new(),
        }
    }

    fn is_expired(&self, now_ms: i64, idle_timeout_secs: i64) -> bool {
        now_ms - self.last_activity_at_ms > idle_timeout_secs * 1000
    }
}

pub struct SessionManager {
    record: SessionRecord,
    config: SessionConfig,
    store: SharedStore,
    clock: SharedClock,
}

impl SessionManager {
    /// Load the durable session record, minting a fresh one if it is absent,
    /// corrupt, or idle-expired.
    pub fn new(config: &SessionConfig, store: SharedStore, clock: SharedClock) -> Self {
        let now = clock.now_ms();
        let record = match load_json::<SessionRecord>(store.as_ref(), SESSION_STATE_KEY) {
            Some(record) if !record.is_expired(now, config.idle_timeout_secs) => record,
            Some(record) => {
                debug!(session_id = %record.session_id, "session idle-expired, minting new");
                SessionRecord::mint(now)
            }
            None => SessionRecord::mint(now),
        };
        let manager = Self {
            record,
            config: config.clone(),
            store,
            clock,
        };
        manager.persist();
        manager
    }

    /// The single fixed identity correlating all reports for this session.
    pub fn get_session_id(&self) -> &str {
        &self.record.session_id
    }

    pub fn page_count(&self) -> u32 {
        self.record.page_count
    }

    pub fn record(&self) -> &SessionRecord {
        &self.record
    }

    /// Register a page load or in-page navigation.
    pub fn track_page_view(&mut self, url: impl Into<String>) {
        let now = self.clock.now_ms();
        self.record.page_count += 1;
        self.record.pages.push(PageVisit {
            url: url.into(),
            timestamp_ms: now,
        });
        while self.record.pages.len() > self.config.max_pages {
            self.record.pages.remove(0);
        }
        self.record.last_activity_at_ms = now;
        self.persist();
    }

    /// Refresh the idle timer without recording a navigation.
    pub fn touch(&mut self) {
        self.record.last_activity_at_ms = self.clock.now_ms();
        self.persist();
    }

    fn persist(&self) {
        if let Err(err) = store_json(self.store.as_ref(), SESSION_STATE_KEY, &self.record) {
            debug!(%err, "session record not persisted");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::storage::MemoryStore;
    use std::sync::Arc;

    fn manager_with(
        store: SharedStore,
        clock: Arc<ManualClock>,
        idle_timeout_secs: i64,
    ) -> SessionManager {
        let config = SessionConfig {
            idle_timeout_secs,
            max_pages: 3,
        };
        SessionManager::new(&config, store, clock)
    }

    #[test]
    fn test_mints_fresh_session() {
        let clock = Arc::new(ManualClock::default());
        let store: SharedStore = Arc::new(MemoryStore::new());
        let manager = manager_with(store, clock, 1800);
        assert_eq!(manager.page_count(), 1);
        assert!(!manager.get_session_id().is_empty());
    }

    #[test]
    fn test_session_survives_reload() {
        let clock = Arc::new(ManualClock::default());
        let store: SharedStore = Arc::new(MemoryStore::new());

        let first = manager_with(store.clone(), clock.clone(), 1800);
        let id = first.get_session_id().to_string();
        drop(first);

        clock.advance_secs(60);
        let second = manager_with(store, clock, 1800);
        assert_eq!(second.get_session_id(), id);
    }

    #[test]
    fn test_idle_expiry_mints_new_id() {
        let clock = Arc::new(ManualClock::default());
        let store: SharedStore = Arc::new(MemoryStore::new());

        let first = manager_with(store.clone(), clock.clone(), 1800);
        let id = first.get_session_id().to_string();
        drop(first);

        clock.advance_secs(1801);
        let second = manager_with(store, clock, 1800);
        assert_ne!(second.get_session_id(), id);
        assert_eq!(second.page_count(), 1);
    }

    #[test]
    fn test_track_page_view_caps_pages() {
        let clock = Arc::new(ManualClock::default());
        let store: SharedStore = Arc::new(MemoryStore::new());
        let mut manager = manager_with(store, clock, 1800);

        for i in 0..5 {
            manager.track_page_view(format!("/page/{i}"));
        }
        assert_eq!(manager.page_count(), 6);
        assert_eq!(manager.record().pages.len(), 3);
        assert_eq!(manager.record().pages[0].url, "/page/2");
    }

    #[test]
    fn test_activity_refresh_prevents_expiry() {
        let clock = Arc::new(ManualClock::default());
        let store: SharedStore = Arc::new(MemoryStore::new());

        let mut first = manager_with(store.clone(), clock.clone(), 600);
        let id = first.get_session_id().to_string();
        clock.advance_secs(500);
        first.touch();
        drop(first);

        clock.advance_secs(500);
        let second = manager_with(store, clock, 600);
        assert_eq!(second.get_session_id(), id);
    }

    #[test]
    fn test_corrupt_record_mints_new() {
        let clock = Arc::new(ManualClock::default());
        let store: SharedStore = Arc::new(MemoryStore::new());
        store.set(SESSION_STATE_KEY, "[]").unwrap();
        let manager = manager_with(store, clock, 1800);
        assert_eq!(manager.page_count(), 1);
    }
}
