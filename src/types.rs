// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Core type definitions shared across the pipeline.
//!
//! [`RawError`] is what an external error source hands the detector;
//! [`ErrorReport`] is the flat JSON body posted to the ingestion endpoint.
//! Breadcrumbs and the `clickData`/`domSnapshot` sub-fields of replay events
//! come from external collectors and are carried as opaque JSON.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A raw runtime failure as delivered by a global error/rejection handler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawError {
    /// Error class name (e.g. "TypeError").
    pub name: String,
    /// Human-readable message.
    pub message: String,
    /// Multi-line stack trace, header line first.
    #[serde(default)]
    pub stack: Option<String>,
}

impl RawError {
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
            stack: None,
        }
    }

    pub fn with_stack(mut self, stack: impl Into<String>) -> Self {
        self.stack = Some(stack.into());
        self
    }

    /// First stack line after the header, trimmed. Used for fingerprinting.
    pub fn first_frame(&self) -> Option<&str> {
        self.stack
            .as_deref()?
            .lines()
            .skip(1)
            .map(str::trim)
            .find(|line| !line.is_empty())
    }

    /// Up to `n` stack frame lines after the header.
    pub fn frames(&self, n: usize) -> Vec<&str> {
        self.stack
            .as_deref()
            .map(|s| {
                s.lines()
                    .skip(1)
                    .map(str::trim)
                    .filter(|line| !line.is_empty())
                    .take(n)
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// A single breadcrumb entry from the external collector.
///
/// The core caps the list and embeds it verbatim; `data` is opaque.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Breadcrumb {
    pub category: String,
    pub message: String,
    /// Unix epoch milliseconds.
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// Flat error payload posted to the primary ingestion endpoint.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ErrorReport {
    #[serde(rename = "type")]
    pub error_type: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub line: Option<u32>,
    pub stack_trace: Vec<String>,
    pub level: String,
    pub source: String,
    pub environment: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub release: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub http_method: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub http_status_code: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    /// Unix epoch milliseconds.
    pub timestamp: i64,
    pub runtime: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
    pub breadcrumbs: Vec<Breadcrumb>,
    pub context: HashMap<String, Value>,
    pub tags: HashMap<String, String>,
    /// Replay linkage, present only when a replay capture fired.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub replay_session_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub replay_data: Option<Vec<Value>>,
}

impl ErrorReport {
    /// Build a report from a raw error with the agent-level fields filled in.
    pub fn from_raw(raw: &RawError, environment: impl Into<String>, timestamp: i64) -> Self {
        Self {
            error_type: raw.name.clone(),
            message: raw.message.clone(),
            stack_trace: raw
                .stack
                .as_deref()
                .map(|s| s.lines().map(String::from).collect())
                .unwrap_or_default(),
            level: "error".to_string(),
            source: "client".to_string(),
            environment: environment.into(),
            timestamp,
            runtime: "errwatch-rust".to_string(),
            ..Default::default()
        }
    }
}

/// FNV-1a 64-bit digest.
///
/// Fast, deterministic, and non-cryptographic; sufficient for error
/// fingerprints and duplicate signatures.
pub fn fnv1a_64(input: &str) -> u64 {
    const OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;
    let mut hash = OFFSET;
    for byte in input.as_bytes() {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(PRIME);
    }
    hash
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_frame_skips_header() {
        let raw = RawError::new("TypeError", "x is not a function")
            .with_stack("TypeError: x is not a function\n    at foo (app.js:10:5)\n    at bar");
        assert_eq!(raw.first_frame(), Some("at foo (app.js:10:5)"));
    }

    #[test]
    fn test_first_frame_without_stack() {
        let raw = RawError::new("Error", "boom");
        assert_eq!(raw.first_frame(), None);
        assert!(raw.frames(3).is_empty());
    }

    #[test]
    fn test_frames_takes_at_most_n() {
        let raw = RawError::new("Error", "boom")
            .with_stack("Error: boom\na\nb\nc\nd");
        assert_eq!(raw.frames(3), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_error_report_serializes_type_field() {
        let raw = RawError::new("RangeError", "out of range");
        let report = ErrorReport::from_raw(&raw, "production", 1_000);
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["type"], "RangeError");
        assert_eq!(json["level"], "error");
        assert_eq!(json["environment"], "production");
        assert!(json.get("replay_session_id").is_none());
    }

    #[test]
    fn test_fnv1a_is_deterministic_and_discriminating() {
        assert_eq!(fnv1a_64("abc"), fnv1a_64("abc"));
        assert_ne!(fnv1a_64("abc"), fnv1a_64("abd"));
        // Known FNV-1a vector: empty string hashes to the offset basis.
        assert_eq!(fnv1a_64(""), 0xcbf2_9ce4_8422_2325);
    }
}
