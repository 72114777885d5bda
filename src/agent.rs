// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Top-level agent wiring the capture pipeline together.
//!
//! [`TelemetryAgent`] is an explicit instance the host integration constructs
//! once and passes by handle to its call sites; the crate keeps no hidden
//! global state. Public operations are total: past construction, no call can
//! fail in a way the host observes. When `enabled` is false in the config,
//! every operation is a no-op.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;
use tracing::debug;

use crate::clock::{SharedClock, SystemClock};
use crate::config::AgentConfig;
use crate::detector::{CaptureResult, DetectorStats, ErrorDetector};
use crate::error::ConfigError;
use crate::replay::{BufferStats, ReplayBuffer, ReplayEvent, EVENT_TYPE_PAGE_TRANSITION};
use crate::session::SessionManager;
use crate::storage::{FileStore, MemoryStore, SharedStore};
use crate::transport::{HttpIngestApi, IngestApi, ReplayLinkage, Transport};
use crate::types::{ErrorReport, RawError};

/// Durable key holding the replay snapshot across navigations.
pub const REPLAY_SNAPSHOT_KEY: &str = "errwatch_replay_snapshot";

/// How often the recovery driver re-checks its stop conditions.
const RECOVERY_POLL_MS: u64 = 500;

/// Most-recent breadcrumbs embedded per report.
const MAX_BREADCRUMBS: usize = 30;

pub struct TelemetryAgent {
    config: AgentConfig,
    buffer: Arc<Mutex<ReplayBuffer>>,
    detector: Mutex<ErrorDetector>,
    session: Mutex<SessionManager>,
    transport: Transport,
    durable_store: SharedStore,
    current_url: Mutex<Option<String>>,
    clock: SharedClock,
}

impl TelemetryAgent {
    /// Construct with production defaults: real clock, reqwest transport,
    /// in-memory session-scoped store, file-backed durable store.
    ///
    /// The one fail-fast path in the crate: a malformed DSN or missing API
    /// key errors here and nowhere else.
    pub fn new(config: AgentConfig) -> Result<Arc<Self>, ConfigError> {
        let durable: SharedStore = match FileStore::open_default() {
            Ok(store) => Arc::new(store),
            Err(err) => {
                debug!(%err, "durable store unavailable, falling back to memory");
                Arc::new(MemoryStore::new())
            }
        };
        Self::with_parts(
            config,
            Arc::new(HttpIngestApi::new()),
            Arc::new(MemoryStore::new()),
            durable,
            Arc::new(SystemClock),
        )
    }

    /// Construct with every seam injected. Used by tests and by hosts that
    /// bring their own storage or clock.
    pub fn with_parts(
        config: AgentConfig,
        api: Arc<dyn IngestApi>,
        session_store: SharedStore,
        durable_store: SharedStore,
        clock: SharedClock,
    ) -> Result<Arc<Self>, ConfigError> {
        let (config, dsn) = config.validate()?;

        let buffer = Self::restore_buffer(&config, durable_store.clone(), clock.clone());
        let buffer = Arc::new(Mutex::new(buffer));

        let session = SessionManager::new(&config.session, durable_store.clone(), clock.clone());
        let detector = ErrorDetector::new(
            &config.detector,
            buffer.clone(),
            session.get_session_id(),
            clock.clone(),
        );
        let transport = Transport::new(
            &config,
            &dsn,
            api,
            session_store,
            durable_store.clone(),
            clock.clone(),
        );

        Ok(Arc::new(Self {
            config,
            buffer,
            detector: Mutex::new(detector),
            session: Mutex::new(session),
            transport,
            durable_store,
            current_url: Mutex::new(None),
            clock,
        }))
    }

    /// Restore the replay buffer persisted by a previous page, if any.
    fn restore_buffer(
        config: &AgentConfig,
        durable_store: SharedStore,
        clock: SharedClock,
    ) -> ReplayBuffer {
        match durable_store.get(REPLAY_SNAPSHOT_KEY) {
            Some(snapshot) => {
                durable_store.remove(REPLAY_SNAPSHOT_KEY);
                ReplayBuffer::deserialize(&snapshot, &config.replay, clock)
            }
            None => ReplayBuffer::new(&config.replay, clock),
        }
    }

    /// Run a raw failure through the detector and, when accepted, deliver
    /// the combined error+replay payload and begin a recovery recording.
    ///
    /// Returns None when disabled, ignored, or deduplicated.
    pub async fn capture_error(
        self: &Arc<Self>,
        error: RawError,
        report: Option<ErrorReport>,
    ) -> Option<CaptureResult> {
        if !self.config.enabled {
            return None;
        }

        let report = report.unwrap_or_else(|| {
            ErrorReport::from_raw(&error, self.config.environment.clone(), self.clock.now_ms())
        });
        let payload = self.finish_report(report);

        let capture = self
            .detector
            .lock()
            .expect("detector lock")
            .handle_error(&error, &payload)?;

        let linkage = ReplayLinkage {
            session_id: capture.session_id.clone(),
            events: capture.events.clone(),
        };
        self.transport.send(payload, Some(linkage)).await;

        let generation = self
            .detector
            .lock()
            .expect("detector lock")
            .start_recovery_recording();
        self.spawn_recovery_driver(generation);

        Some(capture)
    }

    /// Feed one interaction event (click, DOM snapshot, ...) into the buffer.
    pub fn record_event(&self, event: ReplayEvent) -> bool {
        if !self.config.enabled {
            return false;
        }
        self.buffer.lock().expect("replay buffer lock").add_event(event)
    }

    /// Register a page load or in-page navigation.
    pub fn track_page_view(&self, url: impl Into<String>) {
        if !self.config.enabled {
            return;
        }
        let url = url.into();
        self.session
            .lock()
            .expect("session lock")
            .track_page_view(url.clone());
        let event = ReplayEvent::new(EVENT_TYPE_PAGE_TRANSITION, self.clock.now_ms())
            .with_url(url.clone());
        self.buffer.lock().expect("replay buffer lock").add_event(event);
        *self.current_url.lock().expect("url lock") = Some(url);
    }

    /// Best-effort teardown on page hide/unload.
    ///
    /// Ships any live recovery recording over the beacon channel, persists
    /// the replay buffer for the next page, and flushes queued payloads.
    /// Synchronous: nothing here waits on the network.
    pub fn flush_on_unload(&self) {
        if !self.config.enabled {
            return;
        }

        let active = self
            .detector
            .lock()
            .expect("detector lock")
            .active_recovery_generation();
        if let Some(generation) = active {
            let session = self
                .detector
                .lock()
                .expect("detector lock")
                .finalize_recovery(generation, self.current_url());
            if let Some(session) = session {
                self.transport.send_recovery_beacon(&session);
            }
        }

        let snapshot = self.buffer.lock().expect("replay buffer lock").serialize();
        if let Err(err) = self.durable_store.set(REPLAY_SNAPSHOT_KEY, &snapshot) {
            debug!(%err, "replay snapshot not persisted");
        }

        self.transport.flush_with_beacon();
    }

    pub fn session_id(&self) -> String {
        self.session
            .lock()
            .expect("session lock")
            .get_session_id()
            .to_string()
    }

    pub fn detector_stats(&self) -> DetectorStats {
        self.detector.lock().expect("detector lock").stats().clone()
    }

    pub fn buffer_stats(&self) -> BufferStats {
        self.buffer.lock().expect("replay buffer lock").get_stats()
    }

    fn current_url(&self) -> Option<String> {
        self.current_url.lock().expect("url lock").clone()
    }

    /// Fill in the session/url fields the host usually leaves to the agent.
    fn finish_report(&self, mut report: ErrorReport) -> Value {
        if report.session_id.is_none() {
            report.session_id = Some(self.session_id());
        }
        if report.url.is_none() {
            report.url = self.current_url();
        }
        if report.release.is_none() {
            report.release = self.config.release.clone();
        }
        if report.breadcrumbs.len() > MAX_BREADCRUMBS {
            let start = report.breadcrumbs.len() - MAX_BREADCRUMBS;
            report.breadcrumbs.drain(..start);
        }
        serde_json::to_value(&report).unwrap_or(Value::Null)
    }

    /// Drive the two-phase recovery recording to completion.
    ///
    /// Polls the stop conditions (after-error limits, recording already
    /// stopped, 2-minute safety deadline) and ships the recovery window once
    /// one fires. Exits silently if a newer recording superseded this one,
    /// so the state is released exactly once either way.
    fn spawn_recovery_driver(self: &Arc<Self>, generation: u64) {
        if tokio::runtime::Handle::try_current().is_err() {
            debug!("no async runtime, recovery recording will ship on unload");
            return;
        }
        let agent = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(Duration::from_millis(RECOVERY_POLL_MS)).await;
                let (current, should_finalize) = {
                    let detector = agent.detector.lock().expect("detector lock");
                    (
                        detector.recovery_is_current(generation),
                        detector.recovery_should_finalize(generation),
                    )
                };
                if !current {
                    return;
                }
                if !should_finalize {
                    continue;
                }

                let session = agent
                    .detector
                    .lock()
                    .expect("detector lock")
                    .finalize_recovery(generation, agent.current_url());
                if let Some(session) = session {
                    agent.transport.send_recovery_session(&session, false).await;
                }
                return;
            }
        });
    }
}
