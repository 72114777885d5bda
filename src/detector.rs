// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Error detection: ignore rules, duplicate suppression, capture triggering.
//!
//! The detector sits between the host's global error handler and the rest of
//! the pipeline. It filters noise (cross-origin script errors, generic
//! network failures, bundler chunk-load churn), suppresses recently seen
//! duplicates by fingerprint, and on acceptance flips the replay buffer into
//! post-error recording and returns the captured window.
//!
//! The recent-errors cache clears in full on a fixed interval rather than
//! per-item TTL. An error arriving right after a clear can therefore bypass
//! dedup once; this is long-standing documented behavior.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::debug;

use crate::clock::SharedClock;
use crate::config::DetectorConfig;
use crate::replay::{BufferStats, EventPhase, ReplayBuffer, ReplayEvent};
use crate::types::{fnv1a_64, RawError};

/// Interval between full clears of the recent-errors fingerprint cache.
const RECENT_ERRORS_CLEAR_INTERVAL_SECS: i64 = 60;

/// Absolute ceiling on a recovery recording, independent of its normal stop
/// conditions.
pub const RECOVERY_SAFETY_TIMEOUT_SECS: i64 = 120;

/// Messages matching these substrings (case-insensitive) are never captured:
/// opaque cross-origin errors, generic network noise, and bundler artifacts
/// of stale deployments.
static BUILT_IN_IGNORE_PATTERNS: Lazy<Vec<&'static str>> = Lazy::new(|| {
    vec![
        "script error",
        "networkerror",
        "network error",
        "failed to fetch",
        "load failed",
        "loading chunk",
        "loading css chunk",
        "dynamically imported module",
        "importing a module script failed",
    ]
});

/// Counters exposed for diagnostics.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DetectorStats {
    pub detected: u64,
    pub ignored: u64,
    pub duplicates_prevented: u64,
    pub captured: u64,
}

/// Result of an accepted capture.
#[derive(Debug, Clone)]
pub struct CaptureResult {
    pub error_context: Value,
    pub events: Vec<ReplayEvent>,
    pub session_id: String,
    pub buffer_stats: BufferStats,
}

/// In-flight two-phase recovery recording.
///
/// Generation-guarded: a new error while one is in progress bumps the
/// generation, which cancels the prior recording the next time its driver
/// checks in.
#[derive(Debug, Clone, Copy)]
struct RecoveryState {
    generation: u64,
    deadline_ms: i64,
}

/// Payload for the recovery-session endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecoverySession {
    pub session_id: String,
    pub events: Vec<ReplayEvent>,
    /// Unix epoch milliseconds.
    pub captured_at: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

type CaptureCallback = Box<dyn Fn(&Value, &[ReplayEvent], &Value) + Send + Sync>;

pub struct ErrorDetector {
    config: DetectorConfig,
    buffer: Arc<Mutex<ReplayBuffer>>,
    session_id: String,
    clock: SharedClock,
    recent_fingerprints: HashSet<u64>,
    last_cache_clear_ms: i64,
    recovery: Option<RecoveryState>,
    next_generation: u64,
    stats: DetectorStats,
    on_capture: Option<CaptureCallback>,
}

impl ErrorDetector {
    pub fn new(
        config: &DetectorConfig,
        buffer: Arc<Mutex<ReplayBuffer>>,
        session_id: impl Into<String>,
        clock: SharedClock,
    ) -> Self {
        let now = clock.now_ms();
        Self {
            config: config.clone(),
            buffer,
            session_id: session_id.into(),
            clock,
            recent_fingerprints: HashSet::new(),
            last_cache_clear_ms: now,
            recovery: None,
            next_generation: 0,
            stats: DetectorStats::default(),
            on_capture: None,
        }
    }

    /// Install a callback invoked with `(error_context, events, payload)` on
    /// every accepted capture.
    pub fn set_on_capture(
        &mut self,
        callback: impl Fn(&Value, &[ReplayEvent], &Value) + Send + Sync + 'static,
    ) {
        self.on_capture = Some(Box::new(callback));
    }

    pub fn stats(&self) -> &DetectorStats {
        &self.stats
    }

    /// Filter, deduplicate, and trigger a capture for a detected failure.
    ///
    /// Returns None when the error is ignored or a recent duplicate.
    pub fn handle_error(&mut self, error: &RawError, payload: &Value) -> Option<CaptureResult> {
        self.stats.detected += 1;

        if self.is_ignored(&error.message) {
            self.stats.ignored += 1;
            debug!(message = %error.message, "error matched ignore pattern");
            return None;
        }

        self.maybe_clear_recent();
        let fingerprint = Self::fingerprint(error);
        if !self.recent_fingerprints.insert(fingerprint) {
            self.stats.duplicates_prevented += 1;
            debug!(fingerprint, "suppressing duplicate error");
            return None;
        }

        let error_context = json!({
            "name": error.name,
            "message": error.message,
            "stack": error.stack,
            "timestamp": self.clock.now_ms(),
        });

        let (events, buffer_stats) = {
            let mut buffer = self.buffer.lock().expect("replay buffer lock");
            buffer.start_recording_after_error(error_context.clone());
            (buffer.get_events(), buffer.get_stats())
        };

        if let Some(callback) = &self.on_capture {
            callback(&error_context, &events, payload);
        }

        self.stats.captured += 1;
        Some(CaptureResult {
            error_context,
            events,
            session_id: self.session_id.clone(),
            buffer_stats,
        })
    }

    /// Begin a two-phase recovery recording for an already-reported error.
    ///
    /// Returns a generation token; a later call supersedes (cancels) any
    /// recording still in flight.
    pub fn start_recovery_recording(&mut self) -> u64 {
        self.next_generation += 1;
        let generation = self.next_generation;
        if self.recovery.is_some() {
            debug!(generation, "superseding in-progress recovery recording");
        }
        self.recovery = Some(RecoveryState {
            generation,
            deadline_ms: self.clock.now_ms() + RECOVERY_SAFETY_TIMEOUT_SECS * 1000,
        });
        generation
    }

    /// Generation of the live recovery recording, if any.
    pub fn active_recovery_generation(&self) -> Option<u64> {
        self.recovery.map(|state| state.generation)
    }

    /// Whether the recording identified by `generation` is still the live one.
    pub fn recovery_is_current(&self, generation: u64) -> bool {
        self.recovery
            .map(|state| state.generation == generation)
            .unwrap_or(false)
    }

    /// Whether the live recovery recording should ship now: the buffer hit
    /// its after-error limits, recording already stopped, or the safety
    /// deadline passed.
    pub fn recovery_should_finalize(&self, generation: u64) -> bool {
        let Some(state) = self.recovery.filter(|s| s.generation == generation) else {
            return false;
        };
        if self.clock.now_ms() >= state.deadline_ms {
            return true;
        }
        let buffer = self.buffer.lock().expect("replay buffer lock");
        !buffer.is_recording() || buffer.should_stop_recording()
    }

    /// Close out the recovery recording and return its shippable window.
    ///
    /// Returns None when `generation` was superseded; the recording state is
    /// released exactly once either way.
    pub fn finalize_recovery(&mut self, generation: u64, url: Option<String>) -> Option<RecoverySession> {
        if !self.recovery_is_current(generation) {
            return None;
        }
        self.recovery = None;

        let mut buffer = self.buffer.lock().expect("replay buffer lock");
        buffer.stop_recording();
        let mut events = buffer.get_events_by_phase(EventPhase::Error);
        events.extend(buffer.get_events_by_phase(EventPhase::AfterError));
        drop(buffer);

        Some(RecoverySession {
            session_id: self.session_id.clone(),
            events,
            captured_at: self.clock.now_ms(),
            url,
        })
    }

    fn is_ignored(&self, message: &str) -> bool {
        let message = message.to_lowercase();
        BUILT_IN_IGNORE_PATTERNS
            .iter()
            .any(|pattern| message.contains(pattern))
            || self
                .config
                .ignore_patterns
                .iter()
                .any(|pattern| message.contains(&pattern.to_lowercase()))
    }

    /// Full clear on a fixed interval, checked lazily on each access.
    fn maybe_clear_recent(&mut self) {
        let now = self.clock.now_ms();
        if now - self.last_cache_clear_ms >= RECENT_ERRORS_CLEAR_INTERVAL_SECS * 1000 {
            self.recent_fingerprints.clear();
            self.last_cache_clear_ms = now;
        }
    }

    /// Message plus the first meaningful stack frame.
    fn fingerprint(error: &RawError) -> u64 {
        let frame = error.first_frame().unwrap_or("");
        fnv1a_64(&format!("{}\n{}", error.message, frame))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};
    use crate::config::ReplayConfig;
    use crate::replay::EVENT_TYPE_CLICK;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn detector_with(
        config: DetectorConfig,
    ) -> (ErrorDetector, Arc<Mutex<ReplayBuffer>>, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::default());
        let buffer = Arc::new(Mutex::new(ReplayBuffer::new(
            &ReplayConfig::default(),
            clock.clone(),
        )));
        let detector = ErrorDetector::new(&config, buffer.clone(), "sess-1", clock.clone());
        (detector, buffer, clock)
    }

    fn detector() -> (ErrorDetector, Arc<Mutex<ReplayBuffer>>, Arc<ManualClock>) {
        detector_with(DetectorConfig::default())
    }

    fn boom() -> RawError {
        RawError::new("TypeError", "boom")
            .with_stack("TypeError: boom\n    at handler (app.js:1:1)")
    }

    #[test]
    fn test_capture_flips_buffer_and_returns_window() {
        let (mut detector, buffer, clock) = detector();
        buffer
            .lock()
            .unwrap()
            .add_event(ReplayEvent::new(EVENT_TYPE_CLICK, clock.now_ms()));

        let capture = detector.handle_error(&boom(), &json!({})).unwrap();
        assert_eq!(capture.session_id, "sess-1");
        assert_eq!(capture.events.len(), 2);
        assert!(capture.buffer_stats.is_recording_after_error);
        assert!(buffer.lock().unwrap().is_recording());
        assert_eq!(detector.stats().captured, 1);
    }

    #[test]
    fn test_duplicate_within_window_suppressed() {
        let (mut detector, _buffer, clock) = detector();
        assert!(detector.handle_error(&boom(), &json!({})).is_some());
        clock.advance_secs(5);
        assert!(detector.handle_error(&boom(), &json!({})).is_none());
        assert_eq!(detector.stats().duplicates_prevented, 1);
        assert_eq!(detector.stats().captured, 1);
    }

    #[test]
    fn test_distinct_errors_both_captured() {
        let (mut detector, _buffer, _clock) = detector();
        let other = RawError::new("RangeError", "index out of range")
            .with_stack("RangeError: index out of range\n    at get (list.js:9:9)");
        assert!(detector.handle_error(&boom(), &json!({})).is_some());
        assert!(detector.handle_error(&other, &json!({})).is_some());
        assert_eq!(detector.stats().captured, 2);
    }

    #[test]
    fn test_cache_clear_interval_allows_recapture() {
        let (mut detector, _buffer, clock) = detector();
        assert!(detector.handle_error(&boom(), &json!({})).is_some());
        clock.advance_secs(61);
        // Cache cleared wholesale, so the same error captures again.
        assert!(detector.handle_error(&boom(), &json!({})).is_some());
        assert_eq!(detector.stats().duplicates_prevented, 0);
    }

    #[test]
    fn test_built_in_ignore_patterns() {
        let (mut detector, _buffer, _clock) = detector();
        for message in [
            "Script error.",
            "NetworkError when attempting to fetch resource",
            "Loading chunk 42 failed",
            "Failed to fetch dynamically imported module: /app.js",
        ] {
            let error = RawError::new("Error", message);
            assert!(detector.handle_error(&error, &json!({})).is_none());
        }
        assert_eq!(detector.stats().ignored, 4);
        assert_eq!(detector.stats().detected, 4);
    }

    #[test]
    fn test_user_ignore_patterns() {
        let (mut detector, _buffer, _clock) = detector_with(DetectorConfig {
            ignore_patterns: vec!["ResizeObserver".to_string()],
        });
        let error = RawError::new("Error", "resizeobserver loop limit exceeded");
        assert!(detector.handle_error(&error, &json!({})).is_none());
        assert_eq!(detector.stats().ignored, 1);
    }

    #[test]
    fn test_capture_callback_invoked() {
        let (mut detector, _buffer, _clock) = detector();
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_seen = calls.clone();
        detector.set_on_capture(move |context, _events, payload| {
            assert_eq!(context["message"], "boom");
            assert_eq!(payload["tag"], "t");
            calls_seen.fetch_add(1, Ordering::SeqCst);
        });

        detector.handle_error(&boom(), &json!({"tag": "t"}));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_recovery_finalizes_on_buffer_stop() {
        let (mut detector, buffer, clock) = detector();
        detector.handle_error(&boom(), &json!({})).unwrap();
        let generation = detector.start_recovery_recording();

        buffer
            .lock()
            .unwrap()
            .add_event(ReplayEvent::new(EVENT_TYPE_CLICK, clock.now_ms()));
        assert!(!detector.recovery_should_finalize(generation));

        clock.advance_secs(31);
        assert!(detector.recovery_should_finalize(generation));

        let session = detector
            .finalize_recovery(generation, Some("/checkout".to_string()))
            .unwrap();
        assert_eq!(session.session_id, "sess-1");
        assert!(session
            .events
            .iter()
            .any(|e| e.phase == EventPhase::AfterError));
        assert!(!buffer.lock().unwrap().is_recording());

        // Released exactly once.
        assert!(detector.finalize_recovery(generation, None).is_none());
    }

    #[test]
    fn test_recovery_safety_deadline() {
        let (mut detector, buffer, clock) = detector();
        detector.handle_error(&boom(), &json!({})).unwrap();
        let generation = detector.start_recovery_recording();

        // Keep the buffer nominally recording forever; events trickle in
        // slowly enough that neither stop condition fires.
        buffer
            .lock()
            .unwrap()
            .add_event(ReplayEvent::new(EVENT_TYPE_CLICK, clock.now_ms()));
        clock.advance_secs(29);
        // Refresh the window so should_stop stays false.
        assert!(!detector.recovery_should_finalize(generation));

        clock.advance_secs(121);
        assert!(detector.recovery_should_finalize(generation));
    }

    #[test]
    fn test_new_recovery_cancels_prior() {
        let (mut detector, _buffer, _clock) = detector();
        detector.handle_error(&boom(), &json!({})).unwrap();
        let first = detector.start_recovery_recording();
        let second = detector.start_recovery_recording();

        assert!(!detector.recovery_is_current(first));
        assert!(detector.finalize_recovery(first, None).is_none());
        assert!(detector.recovery_is_current(second));
        assert!(detector.finalize_recovery(second, None).is_some());
    }
}
