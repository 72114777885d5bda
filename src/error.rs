// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Error types for the errwatch telemetry agent.
//!
//! This module provides strongly-typed errors for different parts of the agent,
//! using `thiserror` for ergonomic error definitions and `anyhow` for error
//! propagation. Only [`ConfigError`] is ever surfaced to the host application
//! (at construction); everything else is handled internally per the
//! silent-degradation contract.

use thiserror::Error;

/// Errors that can occur while parsing or validating configuration.
///
/// These are the only errors the agent surfaces to the caller: an invalid DSN
/// or missing credential is a deployment mistake, not a runtime condition.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid DSN: {0}")]
    InvalidDsn(String),

    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },

    #[error("JSON parsing error: {0}")]
    JsonError(String),

    #[error("IO error reading config: {0}")]
    IoError(String),
}

impl From<std::io::Error> for ConfigError {
    fn from(err: std::io::Error) -> Self {
        Self::IoError(err.to_string())
    }
}

impl From<serde_json::Error> for ConfigError {
    fn from(err: serde_json::Error) -> Self {
        Self::JsonError(err.to_string())
    }
}

/// Errors that can occur in the persistent state stores.
///
/// Never propagated past the component that hits them: callers prune, clear,
/// or fall back to in-memory defaults instead.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Storage quota exceeded writing {0}")]
    QuotaExceeded(String),

    #[error("Storage unavailable: {0}")]
    Unavailable(String),

    #[error("Corrupt stored data under {0}")]
    Corrupt(String),

    #[error("IO error: {0}")]
    IoError(String),
}

impl From<std::io::Error> for StorageError {
    fn from(err: std::io::Error) -> Self {
        Self::IoError(err.to_string())
    }
}

/// Errors that can occur during a delivery attempt.
#[derive(Error, Debug)]
pub enum DeliveryError {
    #[error("Request timed out after {0}ms")]
    Timeout(u64),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Server responded with status {0}")]
    Status(u16),
}

impl DeliveryError {
    /// Whether the in-process retry loop should try again.
    ///
    /// Timeouts are excluded: a timed-out payload goes straight to the
    /// offline queue and waits for the next drain cycle.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Network(_) | Self::Status(_))
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }
}

/// Convenient Result type alias using anyhow.
pub type Result<T> = anyhow::Result<T>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delivery_error_retryable() {
        assert!(DeliveryError::Network("reset".into()).is_retryable());
        assert!(DeliveryError::Status(503).is_retryable());
        assert!(!DeliveryError::Timeout(10_000).is_retryable());
    }

    #[test]
    fn test_delivery_error_timeout() {
        assert!(DeliveryError::Timeout(10_000).is_timeout());
        assert!(!DeliveryError::Status(500).is_timeout());
    }

    #[test]
    fn test_config_error_display() {
        let err = ConfigError::InvalidDsn("no scheme".into());
        assert_eq!(err.to_string(), "Invalid DSN: no scheme");
    }

    #[test]
    fn test_storage_error_from_io() {
        let io = std::io::Error::other("disk full");
        let err: StorageError = io.into();
        assert!(matches!(err, StorageError::IoError(_)));
    }
}
