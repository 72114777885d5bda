// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Circuit breaker guarding the ingestion endpoint.
//!
//! Classic closed/open/half-open machine. The `open -> half_open` transition
//! is evaluated lazily inside [`CircuitBreaker::is_open`]; there is no timer.
//! State is persisted to the session-scoped store on every transition so a
//! reload within the same browsing session does not hammer a dead endpoint.
//! A missing or corrupt snapshot loads as closed: the breaker fails open
//! toward availability, never toward blocking.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::clock::SharedClock;
use crate::config::BreakerConfig;
use crate::storage::{load_json, store_json, SharedStore};

/// Storage key for the persisted snapshot.
pub const BREAKER_STATE_KEY: &str = "errwatch_breaker_state";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation, requests pass through.
    Closed,
    /// Fast-failing, requests are routed to the offline queue.
    Open,
    /// Probing recovery with a bounded number of trial requests.
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half_open"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct BreakerSnapshot {
    state: CircuitState,
    failure_count: u32,
    opened_at_ms: Option<i64>,
    half_open_attempts: u32,
}

impl Default for BreakerSnapshot {
    fn default() -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            opened_at_ms: None,
            half_open_attempts: 0,
        }
    }
}

impl BreakerSnapshot {
    /// `opened_at_ms` must be present exactly while open.
    fn is_coherent(&self) -> bool {
        (self.state == CircuitState::Open) == self.opened_at_ms.is_some()
    }
}

pub struct CircuitBreaker {
    snapshot: BreakerSnapshot,
    config: BreakerConfig,
    store: SharedStore,
    clock: SharedClock,
}

impl CircuitBreaker {
    /// Create a breaker, restoring persisted state when it loads cleanly.
    pub fn new(config: &BreakerConfig, store: SharedStore, clock: SharedClock) -> Self {
        let snapshot = load_json::<BreakerSnapshot>(store.as_ref(), BREAKER_STATE_KEY)
            .filter(BreakerSnapshot::is_coherent)
            .unwrap_or_default();
        Self {
            snapshot,
            config: config.clone(),
            store,
            clock,
        }
    }

    /// True only while the circuit is open.
    ///
    /// Side-effecting: performs the lazy `open -> half_open` transition once
    /// the configured timeout has elapsed since the circuit opened.
    pub fn is_open(&mut self) -> bool {
        if self.snapshot.state != CircuitState::Open {
            return false;
        }
        let opened_at = self.snapshot.opened_at_ms.unwrap_or(0);
        if self.clock.now_ms() - opened_at >= self.config.timeout_secs * 1000 {
            debug!("circuit breaker timeout elapsed, entering half-open");
            self.snapshot.state = CircuitState::HalfOpen;
            self.snapshot.opened_at_ms = None;
            self.snapshot.half_open_attempts = 0;
            self.persist();
            return false;
        }
        true
    }

    pub fn is_half_open(&self) -> bool {
        self.snapshot.state == CircuitState::HalfOpen
    }

    pub fn state(&self) -> CircuitState {
        self.snapshot.state
    }

    pub fn failure_count(&self) -> u32 {
        self.snapshot.failure_count
    }

    /// Record a successful delivery. Never throws.
    pub fn record_success(&mut self) {
        match self.snapshot.state {
            CircuitState::HalfOpen => {
                debug!("circuit breaker closing after successful trial");
                self.close();
            }
            CircuitState::Closed => {
                if self.snapshot.failure_count != 0 {
                    self.snapshot.failure_count = 0;
                    self.persist();
                }
            }
            // A success cannot be observed while open; no request passed.
            CircuitState::Open => {}
        }
    }

    /// Record a failed delivery. Never throws.
    pub fn record_failure(&mut self) {
        match self.snapshot.state {
            CircuitState::Closed => {
                self.snapshot.failure_count += 1;
                if self.snapshot.failure_count >= self.config.failure_threshold {
                    debug!(
                        failures = self.snapshot.failure_count,
                        "circuit breaker opening"
                    );
                    self.open();
                } else {
                    self.persist();
                }
            }
            CircuitState::HalfOpen => {
                self.snapshot.half_open_attempts += 1;
                if self.snapshot.half_open_attempts >= self.config.half_open_max_attempts {
                    debug!("circuit breaker reopening after failed trial");
                    self.open();
                } else {
                    self.persist();
                }
            }
            CircuitState::Open => {}
        }
    }

    fn open(&mut self) {
        self.snapshot.state = CircuitState::Open;
        self.snapshot.opened_at_ms = Some(self.clock.now_ms());
        self.persist();
    }

    fn close(&mut self) {
        self.snapshot.state = CircuitState::Closed;
        self.snapshot.failure_count = 0;
        self.snapshot.opened_at_ms = None;
        self.snapshot.half_open_attempts = 0;
        self.persist();
    }

    /// Persist the snapshot, continuing in-memory if storage fails.
    fn persist(&self) {
        if let Err(err) = store_json(self.store.as_ref(), BREAKER_STATE_KEY, &self.snapshot) {
            debug!(%err, "circuit breaker state not persisted");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::storage::MemoryStore;
    use std::sync::Arc;

    fn breaker() -> (CircuitBreaker, Arc<ManualClock>, SharedStore) {
        let clock = Arc::new(ManualClock::default());
        let store: SharedStore = Arc::new(MemoryStore::new());
        let config = BreakerConfig {
            failure_threshold: 3,
            timeout_secs: 60,
            half_open_max_attempts: 1,
        };
        (
            CircuitBreaker::new(&config, store.clone(), clock.clone()),
            clock,
            store,
        )
    }

    #[test]
    fn test_opens_after_threshold_failures() {
        let (mut breaker, _clock, _store) = breaker();
        breaker.record_failure();
        breaker.record_failure();
        assert!(!breaker.is_open());
        breaker.record_failure();
        assert!(breaker.is_open());
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[test]
    fn test_half_open_after_timeout_then_closes_on_success() {
        let (mut breaker, clock, _store) = breaker();
        for _ in 0..3 {
            breaker.record_failure();
        }
        assert!(breaker.is_open());

        clock.advance_secs(61);
        assert!(!breaker.is_open());
        assert!(breaker.is_half_open());

        breaker.record_success();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.failure_count(), 0);
    }

    #[test]
    fn test_half_open_failure_reopens() {
        let (mut breaker, clock, _store) = breaker();
        for _ in 0..3 {
            breaker.record_failure();
        }
        clock.advance_secs(61);
        assert!(!breaker.is_open());

        breaker.record_failure();
        assert!(breaker.is_open());
    }

    #[test]
    fn test_success_resets_consecutive_failures() {
        let (mut breaker, _clock, _store) = breaker();
        breaker.record_failure();
        breaker.record_failure();
        breaker.record_success();
        assert_eq!(breaker.failure_count(), 0);
        breaker.record_failure();
        breaker.record_failure();
        assert!(!breaker.is_open());
    }

    #[test]
    fn test_state_persists_across_instances() {
        let clock = Arc::new(ManualClock::default());
        let store: SharedStore = Arc::new(MemoryStore::new());
        let config = BreakerConfig {
            failure_threshold: 2,
            timeout_secs: 60,
            half_open_max_attempts: 1,
        };

        let mut first = CircuitBreaker::new(&config, store.clone(), clock.clone());
        first.record_failure();
        first.record_failure();
        assert!(first.is_open());

        let mut second = CircuitBreaker::new(&config, store.clone(), clock.clone());
        assert!(second.is_open());
    }

    #[test]
    fn test_corrupt_state_loads_closed() {
        let clock = Arc::new(ManualClock::default());
        let store: SharedStore = Arc::new(MemoryStore::new());
        store.set(BREAKER_STATE_KEY, "{oops").unwrap();

        let mut breaker =
            CircuitBreaker::new(&BreakerConfig::default(), store.clone(), clock.clone());
        assert!(!breaker.is_open());
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[test]
    fn test_incoherent_snapshot_loads_closed() {
        let clock = Arc::new(ManualClock::default());
        let store: SharedStore = Arc::new(MemoryStore::new());
        // Open state without an opened_at timestamp violates the invariant.
        store
            .set(
                BREAKER_STATE_KEY,
                r#"{"state":"open","failure_count":9,"opened_at_ms":null,"half_open_attempts":0}"#,
            )
            .unwrap();

        let mut breaker = CircuitBreaker::new(&BreakerConfig::default(), store, clock);
        assert!(!breaker.is_open());
    }

    #[test]
    fn test_multiple_half_open_trials() {
        let clock = Arc::new(ManualClock::default());
        let store: SharedStore = Arc::new(MemoryStore::new());
        let config = BreakerConfig {
            failure_threshold: 1,
            timeout_secs: 10,
            half_open_max_attempts: 2,
        };
        let mut breaker = CircuitBreaker::new(&config, store, clock.clone());

        breaker.record_failure();
        assert!(breaker.is_open());
        clock.advance_secs(11);
        assert!(!breaker.is_open());

        // First trial failure stays half-open, second reopens.
        breaker.record_failure();
        assert!(breaker.is_half_open());
        assert!(!breaker.is_open());
        breaker.record_failure();
        assert!(breaker.is_open());
    }
}
