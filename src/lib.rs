// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Errwatch - client-resident error telemetry with replay capture.
//!
//! The agent detects runtime failures, captures a bounded window of
//! user-interaction history around each failure, and delivers the combined
//! payload to a remote ingestion endpoint. Its defining contract is silent
//! degradation: past construction, no internal failure ever propagates to
//! the host application — at worst a report is delayed or dropped.
//!
//! # Architecture
//!
//! The crate is organized into the following modules:
//!
//! - [`types`] - Core type definitions (RawError, ErrorReport, Breadcrumb)
//! - [`error`] - Error types and result aliases
//! - [`config`] - Configuration structs, DSN parsing, hard caps
//! - [`clock`] - Injected clock for lazy time-based transitions
//! - [`storage`] - Session-scoped and durable key-value state stores
//! - [`limiter`] - Token-bucket rate limiter
//! - [`breaker`] - Circuit breaker guarding the ingestion endpoint
//! - [`queue`] - Persistent offline queue
//! - [`session`] - Cross-page session identity
//! - [`replay`] - Phase-tagged bounded replay buffer
//! - [`detector`] - Error filtering, dedup, and capture triggering
//! - [`transport`] - Resilient delivery: retry, backoff, beacon flushing
//! - [`agent`] - Top-level pipeline wiring
//! - [`telemetry`] - Tracing initialization for the agent's own diagnostics
//!
//! # Example
//!
//! ```rust,ignore
//! use errwatch::{AgentConfig, RawError, TelemetryAgent};
//!
//! let config = AgentConfig::new("https://ingest.example.com/42", "api-key");
//! let agent = TelemetryAgent::new(config)?;
//!
//! agent.track_page_view("/checkout");
//! agent.capture_error(
//!     RawError::new("TypeError", "x is not a function"),
//!     None,
//! ).await;
//! ```

pub mod agent;
pub mod breaker;
pub mod clock;
pub mod config;
pub mod detector;
pub mod error;
pub mod limiter;
pub mod queue;
pub mod replay;
pub mod session;
pub mod storage;
pub mod telemetry;
pub mod transport;
pub mod types;

// Re-export commonly used types at crate root
pub use agent::TelemetryAgent;
pub use breaker::{CircuitBreaker, CircuitState};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{AgentConfig, Dsn};
pub use detector::{CaptureResult, DetectorStats, ErrorDetector, RecoverySession};
pub use error::{ConfigError, DeliveryError, Result, StorageError};
pub use limiter::TokenBucket;
pub use queue::OfflineQueue;
pub use replay::{BufferStats, EventPhase, ReplayBuffer, ReplayEvent};
pub use session::SessionManager;
pub use storage::{FileStore, MemoryStore, StateStore};
pub use telemetry::{init_telemetry, TelemetryConfig, TelemetryGuard};
pub use transport::{HttpIngestApi, IngestApi, ReplayLinkage, Transport};
pub use types::{Breadcrumb, ErrorReport, RawError};
