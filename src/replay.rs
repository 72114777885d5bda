// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Bounded circular replay buffer with pre/post-error windowing.
//!
//! Events are phase-tagged at insertion. Before an error the buffer keeps a
//! trailing window of click events (time- and count-bounded) while retaining
//! non-click events such as page transitions and error markers. After
//! [`ReplayBuffer::start_recording_after_error`] flips the mode, pruning
//! stops and post-error events are counted until a time or count limit stops
//! recording automatically. A hard byte ceiling halves the buffer from the
//! front regardless of those rules.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

use crate::clock::SharedClock;
use crate::config::ReplayConfig;

/// Event type carried by click producers; subject to windowed pruning.
pub const EVENT_TYPE_CLICK: &str = "click";
/// Event type of the error marker inserted by the buffer itself.
pub const EVENT_TYPE_ERROR: &str = "error";
/// Event type for page transitions; never pruned by the click window.
pub const EVENT_TYPE_PAGE_TRANSITION: &str = "page_transition";

/// Size checks run every this many insertions.
const SIZE_CHECK_INTERVAL: u32 = 10;

/// Position of a replay event relative to the triggering error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventPhase {
    BeforeError,
    Error,
    AfterError,
}

/// One interaction event. The `extra` map carries producer-specific payload
/// (`clickData`, `domSnapshot`, ...) which the buffer treats as opaque.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplayEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// Producer timestamp, Unix epoch milliseconds. Required.
    pub timestamp: i64,
    pub phase: EventPhase,
    /// When the buffer accepted the event.
    pub captured_at: i64,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ReplayEvent {
    pub fn new(event_type: impl Into<String>, timestamp: i64) -> Self {
        Self {
            event_type: event_type.into(),
            url: None,
            timestamp,
            phase: EventPhase::BeforeError,
            captured_at: 0,
            extra: Map::new(),
        }
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    pub fn with_extra(mut self, key: impl Into<String>, value: Value) -> Self {
        self.extra.insert(key.into(), value);
        self
    }

    fn is_click(&self) -> bool {
        self.event_type == EVENT_TYPE_CLICK
    }
}

/// Buffer statistics for diagnostics and capture results.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BufferStats {
    pub event_count: usize,
    pub click_count: usize,
    pub estimated_bytes: usize,
    pub is_recording_after_error: bool,
    pub post_error_event_count: usize,
}

/// Serialized snapshot for persistence across navigations.
#[derive(Debug, Serialize, Deserialize)]
struct BufferSnapshot {
    events: Vec<ReplayEvent>,
    is_recording_after_error: bool,
    error_occurred_at_ms: Option<i64>,
    post_error_event_count: usize,
}

pub struct ReplayBuffer {
    events: VecDeque<ReplayEvent>,
    config: ReplayConfig,
    clock: SharedClock,
    is_recording_after_error: bool,
    error_occurred_at_ms: Option<i64>,
    post_error_event_count: usize,
    inserts_since_size_check: u32,
}

impl ReplayBuffer {
    pub fn new(config: &ReplayConfig, clock: SharedClock) -> Self {
        Self {
            events: VecDeque::new(),
            config: config.clone(),
            clock,
            is_recording_after_error: false,
            error_occurred_at_ms: None,
            post_error_event_count: 0,
            inserts_since_size_check: 0,
        }
    }

    /// Insert an event, tagging its phase from the current mode.
    ///
    /// Returns false (and drops the event) when it lacks a usable timestamp.
    pub fn add_event(&mut self, mut event: ReplayEvent) -> bool {
        if event.timestamp <= 0 {
            debug!(event_type = %event.event_type, "rejecting replay event without timestamp");
            return false;
        }
        event.captured_at = self.clock.now_ms();
        event.phase = if self.is_recording_after_error {
            EventPhase::AfterError
        } else {
            EventPhase::BeforeError
        };
        self.events.push_back(event);

        if self.is_recording_after_error {
            self.post_error_event_count += 1;
            if self.should_stop_recording() {
                self.stop_recording();
            }
        } else {
            self.prune_before_window();
        }

        self.inserts_since_size_check += 1;
        if self.inserts_since_size_check >= SIZE_CHECK_INTERVAL {
            self.inserts_since_size_check = 0;
            self.enforce_size_ceiling();
        }
        true
    }

    /// Flip into post-error recording.
    ///
    /// The error marker is inserted before the flag flips so the marker
    /// itself carries phase `error`, never `after_error`.
    pub fn start_recording_after_error(&mut self, error_context: Value) {
        let now = self.clock.now_ms();
        let mut marker = ReplayEvent::new(EVENT_TYPE_ERROR, now);
        marker.captured_at = now;
        marker.phase = EventPhase::Error;
        marker.extra.insert("error".to_string(), error_context);
        self.events.push_back(marker);

        self.is_recording_after_error = true;
        self.error_occurred_at_ms = Some(now);
        self.post_error_event_count = 0;
    }

    /// Whether post-error recording has hit its time or count limit.
    pub fn should_stop_recording(&self) -> bool {
        if !self.is_recording_after_error {
            return false;
        }
        let Some(error_at) = self.error_occurred_at_ms else {
            return true;
        };
        let elapsed_ms = self.clock.now_ms() - error_at;
        elapsed_ms >= self.config.after_error_secs * 1000
            || self.post_error_event_count >= self.config.after_error_clicks
    }

    pub fn stop_recording(&mut self) {
        self.is_recording_after_error = false;
    }

    pub fn is_recording(&self) -> bool {
        self.is_recording_after_error
    }

    /// All buffered events in insertion order.
    pub fn get_events(&self) -> Vec<ReplayEvent> {
        self.events.iter().cloned().collect()
    }

    pub fn get_events_by_phase(&self, phase: EventPhase) -> Vec<ReplayEvent> {
        self.events
            .iter()
            .filter(|event| event.phase == phase)
            .cloned()
            .collect()
    }

    pub fn get_stats(&self) -> BufferStats {
        BufferStats {
            event_count: self.events.len(),
            click_count: self.events.iter().filter(|e| e.is_click()).count(),
            estimated_bytes: self.estimated_bytes(),
            is_recording_after_error: self.is_recording_after_error,
            post_error_event_count: self.post_error_event_count,
        }
    }

    /// Snapshot the buffer as JSON for persistence across navigations.
    pub fn serialize(&self) -> String {
        let snapshot = BufferSnapshot {
            events: self.events.iter().cloned().collect(),
            is_recording_after_error: self.is_recording_after_error,
            error_occurred_at_ms: self.error_occurred_at_ms,
            post_error_event_count: self.post_error_event_count,
        };
        serde_json::to_string(&snapshot).unwrap_or_else(|_| "{}".to_string())
    }

    /// Restore a buffer from [`ReplayBuffer::serialize`] output.
    ///
    /// Returns an empty buffer when the snapshot does not parse.
    pub fn deserialize(json: &str, config: &ReplayConfig, clock: SharedClock) -> Self {
        let mut buffer = Self::new(config, clock);
        match serde_json::from_str::<BufferSnapshot>(json) {
            Ok(snapshot) => {
                buffer.events = snapshot.events.into();
                buffer.is_recording_after_error = snapshot.is_recording_after_error;
                buffer.error_occurred_at_ms = snapshot.error_occurred_at_ms;
                buffer.post_error_event_count = snapshot.post_error_event_count;
            }
            Err(err) => {
                debug!(%err, "replay snapshot did not parse, starting empty");
            }
        }
        buffer
    }

    pub fn clear(&mut self) {
        self.events.clear();
        self.is_recording_after_error = false;
        self.error_occurred_at_ms = None;
        self.post_error_event_count = 0;
    }

    /// Trailing-window pruning for the before-error phase.
    ///
    /// Applies to click events only: drop clicks older than the time window,
    /// then keep at most the N most recent clicks. Non-click events stay
    /// until the byte ceiling forces a halving.
    fn prune_before_window(&mut self) {
        let cutoff = self.clock.now_ms() - self.config.before_error_secs * 1000;
        self.events
            .retain(|event| !event.is_click() || event.timestamp >= cutoff);

        let click_count = self.events.iter().filter(|e| e.is_click()).count();
        let mut excess = click_count.saturating_sub(self.config.before_error_clicks);
        if excess > 0 {
            self.events.retain(|event| {
                if excess > 0 && event.is_click() {
                    excess -= 1;
                    false
                } else {
                    true
                }
            });
        }
    }

    fn estimated_bytes(&self) -> usize {
        serde_json::to_string(&self.events).map_or(0, |s| s.len())
    }

    /// Halve the buffer from the front until under the byte ceiling.
    fn enforce_size_ceiling(&mut self) {
        while self.events.len() > 1 && self.estimated_bytes() > self.config.max_size_bytes {
            let drop = self.events.len() / 2;
            debug!(dropped = drop, "replay buffer over size ceiling, halving");
            self.events.drain(..drop);
        }
    }
}
