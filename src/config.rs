// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Agent configuration: typed structs, DSN parsing, and hard caps.
//!
//! Every resource-relevant knob is clamped to a fixed range at construction,
//! so a misconfigured host cannot make the agent consume unbounded memory or
//! traffic. DSN validation is the single fail-fast path in the crate: a
//! malformed DSN indicates a deployment mistake and surfaces as
//! [`ConfigError`] from [`AgentConfig::validate`].

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Parsed ingestion endpoint identifier: `scheme://host[:port]/projectId`.
///
/// Credentials are supplied out-of-band via the API key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dsn {
    pub scheme: String,
    pub host: String,
    pub project_id: String,
}

impl Dsn {
    /// Parse a DSN string, rejecting anything structurally invalid.
    pub fn parse(raw: &str) -> Result<Self, ConfigError> {
        let raw = raw.trim();
        let (scheme, rest) = raw
            .split_once("://")
            .ok_or_else(|| ConfigError::InvalidDsn(format!("missing scheme: {raw}")))?;
        if scheme != "http" && scheme != "https" {
            return Err(ConfigError::InvalidDsn(format!(
                "unsupported scheme: {scheme}"
            )));
        }
        let (host, project_id) = rest
            .split_once('/')
            .ok_or_else(|| ConfigError::InvalidDsn(format!("missing project id: {raw}")))?;
        let project_id = project_id.trim_matches('/');
        if host.is_empty() {
            return Err(ConfigError::InvalidDsn("empty host".to_string()));
        }
        if project_id.is_empty() || project_id.contains('/') {
            return Err(ConfigError::InvalidDsn(format!(
                "invalid project id: {project_id}"
            )));
        }
        Ok(Self {
            scheme: scheme.to_string(),
            host: host.to_string(),
            project_id: project_id.to_string(),
        })
    }

    /// Primary error-ingestion endpoint.
    pub fn endpoint(&self) -> String {
        format!(
            "{}://{}/api/{}/errors",
            self.scheme, self.host, self.project_id
        )
    }

    /// Endpoint for post-error recovery replay sessions.
    pub fn recovery_endpoint(&self) -> String {
        format!(
            "{}://{}/api/{}/replay/recovery",
            self.scheme, self.host, self.project_id
        )
    }
}

impl std::fmt::Display for Dsn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}://{}/{}", self.scheme, self.host, self.project_id)
    }
}

fn clamp_u32(value: u32, min: u32, max: u32) -> u32 {
    value.clamp(min, max)
}

fn clamp_i64(value: i64, min: i64, max: i64) -> i64 {
    value.clamp(min, max)
}

/// Circuit breaker tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BreakerConfig {
    /// Consecutive failures before the circuit opens.
    pub failure_threshold: u32,
    /// Seconds the circuit stays open before allowing a half-open trial.
    pub timeout_secs: i64,
    /// Failed half-open trials allowed before reopening.
    pub half_open_max_attempts: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            timeout_secs: 60,
            half_open_max_attempts: 1,
        }
    }
}

impl BreakerConfig {
    fn clamped(mut self) -> Self {
        self.failure_threshold = clamp_u32(self.failure_threshold, 1, 20);
        self.timeout_secs = clamp_i64(self.timeout_secs, 5, 600);
        self.half_open_max_attempts = clamp_u32(self.half_open_max_attempts, 1, 5);
        self
    }
}

/// Token-bucket rate limiter tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LimiterConfig {
    pub max_tokens: u32,
    /// Tokens added per second of elapsed wall-clock time.
    pub refill_rate: f64,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            max_tokens: 10,
            refill_rate: 1.0,
        }
    }
}

impl LimiterConfig {
    fn clamped(mut self) -> Self {
        self.max_tokens = clamp_u32(self.max_tokens, 1, 100);
        self.refill_rate = self.refill_rate.clamp(0.1, 50.0);
        self
    }
}

/// Offline queue bounds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct QueueConfig {
    pub max_size: usize,
    /// Items older than this are dropped lazily on read.
    pub max_age_secs: i64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_size: 50,
            max_age_secs: 24 * 3600,
        }
    }
}

impl QueueConfig {
    fn clamped(mut self) -> Self {
        self.max_size = self.max_size.clamp(1, 500);
        self.max_age_secs = clamp_i64(self.max_age_secs, 60, 7 * 24 * 3600);
        self
    }
}

/// Session identity tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SessionConfig {
    /// Idle time after which the session expires and a new one is minted.
    pub idle_timeout_secs: i64,
    /// Cap on the per-session visited-pages list.
    pub max_pages: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            idle_timeout_secs: 30 * 60,
            max_pages: 50,
        }
    }
}

impl SessionConfig {
    fn clamped(mut self) -> Self {
        self.idle_timeout_secs = clamp_i64(self.idle_timeout_secs, 60, 24 * 3600);
        self.max_pages = self.max_pages.clamp(1, 200);
        self
    }
}

/// Replay buffer windowing and size governance.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ReplayConfig {
    /// Trailing window of click events retained before an error.
    pub before_error_secs: i64,
    /// Maximum time spent recording after an error.
    pub after_error_secs: i64,
    /// Most-recent click events retained before an error.
    pub before_error_clicks: usize,
    /// Post-error events recorded before recording stops.
    pub after_error_clicks: usize,
    /// Hard ceiling on the serialized buffer size.
    pub max_size_bytes: usize,
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self {
            before_error_secs: 30,
            after_error_secs: 30,
            before_error_clicks: 10,
            after_error_clicks: 15,
            max_size_bytes: 512 * 1024,
        }
    }
}

impl ReplayConfig {
    fn clamped(mut self) -> Self {
        self.before_error_secs = clamp_i64(self.before_error_secs, 1, 300);
        self.after_error_secs = clamp_i64(self.after_error_secs, 1, 300);
        self.before_error_clicks = self.before_error_clicks.clamp(1, 100);
        self.after_error_clicks = self.after_error_clicks.clamp(1, 100);
        self.max_size_bytes = self.max_size_bytes.clamp(1024, 2 * 1024 * 1024);
        self
    }
}

/// Error detector filtering.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DetectorConfig {
    /// Case-insensitive substrings; errors whose message matches are ignored.
    pub ignore_patterns: Vec<String>,
}

/// Transport scrubbing.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ScrubConfig {
    /// Extra sensitive-key substrings on top of the built-in list.
    pub sensitive_keys: Vec<String>,
}

/// Top-level agent configuration.
///
/// Can be deserialized from JSON; unspecified sections take defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentConfig {
    /// Ingestion target: `scheme://host[:port]/projectId`.
    pub dsn: String,
    /// API key sent as `X-Api-Key`.
    pub api_key: String,
    #[serde(default = "default_environment")]
    pub environment: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub release: Option<String>,
    /// Master switch: when false, every public operation is a no-op.
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub breaker: BreakerConfig,
    #[serde(default)]
    pub limiter: LimiterConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub replay: ReplayConfig,
    #[serde(default)]
    pub detector: DetectorConfig,
    #[serde(default)]
    pub scrub: ScrubConfig,
}

fn default_environment() -> String {
    "production".to_string()
}

fn default_true() -> bool {
    true
}

impl AgentConfig {
    /// Minimal configuration with everything else defaulted.
    pub fn new(dsn: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            dsn: dsn.into(),
            api_key: api_key.into(),
            environment: default_environment(),
            release: None,
            enabled: true,
            breaker: BreakerConfig::default(),
            limiter: LimiterConfig::default(),
            queue: QueueConfig::default(),
            session: SessionConfig::default(),
            replay: ReplayConfig::default(),
            detector: DetectorConfig::default(),
            scrub: ScrubConfig::default(),
        }
    }

    /// Load from a JSON string.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str::<Self>(json)?)
    }

    /// Load from a JSON file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_json_str(&contents)
    }

    /// Validate the fail-fast fields and clamp every capped knob.
    ///
    /// Returns the parsed [`Dsn`] alongside the normalized config.
    pub fn validate(mut self) -> Result<(Self, Dsn), ConfigError> {
        let dsn = Dsn::parse(&self.dsn)?;
        if self.api_key.trim().is_empty() {
            return Err(ConfigError::MissingField("apiKey".to_string()));
        }
        self.breaker = self.breaker.clamped();
        self.limiter = self.limiter.clamped();
        self.queue = self.queue.clamped();
        self.session = self.session.clamped();
        self.replay = self.replay.clamped();
        Ok((self, dsn))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dsn_parse_roundtrip() {
        let dsn = Dsn::parse("https://ingest.example.com/42").unwrap();
        assert_eq!(dsn.scheme, "https");
        assert_eq!(dsn.host, "ingest.example.com");
        assert_eq!(dsn.project_id, "42");
        assert_eq!(dsn.to_string(), "https://ingest.example.com/42");
        assert_eq!(dsn.endpoint(), "https://ingest.example.com/api/42/errors");
        assert_eq!(
            dsn.recovery_endpoint(),
            "https://ingest.example.com/api/42/replay/recovery"
        );
    }

    #[test]
    fn test_dsn_parse_with_port() {
        let dsn = Dsn::parse("http://localhost:8080/proj").unwrap();
        assert_eq!(dsn.host, "localhost:8080");
        assert_eq!(dsn.endpoint(), "http://localhost:8080/api/proj/errors");
    }

    #[test]
    fn test_dsn_rejects_malformed() {
        assert!(Dsn::parse("ingest.example.com/42").is_err());
        assert!(Dsn::parse("ftp://host/1").is_err());
        assert!(Dsn::parse("https://host").is_err());
        assert!(Dsn::parse("https:///42").is_err());
        assert!(Dsn::parse("https://host/").is_err());
        assert!(Dsn::parse("https://host/a/b").is_err());
    }

    #[test]
    fn test_validate_requires_api_key() {
        let config = AgentConfig::new("https://host/1", "  ");
        assert!(matches!(
            config.validate(),
            Err(ConfigError::MissingField(_))
        ));
    }

    #[test]
    fn test_validate_clamps_knobs() {
        let mut config = AgentConfig::new("https://host/1", "key");
        config.breaker.failure_threshold = 0;
        config.breaker.timeout_secs = 100_000;
        config.limiter.max_tokens = 10_000;
        config.limiter.refill_rate = 0.0;
        config.queue.max_size = 0;
        config.replay.before_error_secs = 9_999;
        config.replay.max_size_bytes = 1;

        let (config, _dsn) = config.validate().unwrap();
        assert_eq!(config.breaker.failure_threshold, 1);
        assert_eq!(config.breaker.timeout_secs, 600);
        assert_eq!(config.limiter.max_tokens, 100);
        assert_eq!(config.limiter.refill_rate, 0.1);
        assert_eq!(config.queue.max_size, 1);
        assert_eq!(config.replay.before_error_secs, 300);
        assert_eq!(config.replay.max_size_bytes, 1024);
    }

    #[test]
    fn test_from_json_defaults() {
        let config =
            AgentConfig::from_json_str(r#"{"dsn":"https://h/1","apiKey":"k"}"#).unwrap();
        assert!(config.enabled);
        assert_eq!(config.environment, "production");
        assert_eq!(config.breaker.failure_threshold, 5);
        assert_eq!(config.replay.before_error_clicks, 10);
    }

    #[test]
    fn test_from_json_camel_case_sections() {
        let json = r#"{
            "dsn": "https://h/1",
            "apiKey": "k",
            "limiter": { "maxTokens": 3, "refillRate": 2.0 },
            "replay": { "beforeErrorClicks": 20 }
        }"#;
        let config = AgentConfig::from_json_str(json).unwrap();
        assert_eq!(config.limiter.max_tokens, 3);
        assert_eq!(config.replay.before_error_clicks, 20);
    }
}
