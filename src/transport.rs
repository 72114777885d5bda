// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Resilient delivery: scrub, dedup, rate-limit, queue-or-send, retry, and
//! unload-safe flushing.
//!
//! The transport owns the token bucket, circuit breaker, and offline queue.
//! Its internal send queue is drained strictly FIFO under a single in-flight
//! flag; a `send` arriving while a drain is in progress appends to the same
//! queue rather than starting a parallel drain. Network calls are the only
//! suspension points, and no lock is held across an `.await`.
//!
//! Every per-send failure is recovered internally. Nothing here propagates
//! an error to the caller.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::breaker::CircuitBreaker;
use crate::clock::SharedClock;
use crate::config::{AgentConfig, Dsn};
use crate::detector::RecoverySession;
use crate::error::DeliveryError;
use crate::limiter::TokenBucket;
use crate::queue::OfflineQueue;
use crate::replay::ReplayEvent;
use crate::storage::SharedStore;
use crate::types::fnv1a_64;

/// Additional in-process retries after the first attempt.
const MAX_RETRIES: u32 = 2;
/// First backoff delay; doubles per attempt.
const BASE_BACKOFF_MS: u64 = 1_000;
/// Hard per-request timeout.
pub const REQUEST_TIMEOUT_MS: u64 = 10_000;
/// Window within which an identical signature is dropped as a duplicate.
const DEDUP_WINDOW_SECS: i64 = 5;
/// Signature cache size that triggers eviction of expired entries.
const DEDUP_CACHE_SOFT_CAP: usize = 64;
/// Offline items drained after one successful delivery.
const OFFLINE_DRAIN_LIMIT: usize = 3;
/// Most-recent payloads included in an unload beacon batch.
const BEACON_MAX_ITEMS: usize = 10;

/// Built-in sensitive-key substrings, matched case-insensitively against
/// object keys anywhere in the payload.
static BUILT_IN_SENSITIVE_KEYS: Lazy<Vec<&'static str>> = Lazy::new(|| {
    vec![
        "password",
        "passwd",
        "secret",
        "token",
        "api_key",
        "apikey",
        "authorization",
        "auth",
        "cookie",
        "credential",
        "credit_card",
        "card_number",
        "cvv",
        "ssn",
        "private_key",
    ]
});

const FILTERED_PLACEHOLDER: &str = "[Filtered]";

/// HTTP seam so tests can script delivery outcomes.
#[async_trait]
pub trait IngestApi: Send + Sync {
    /// POST a JSON body and wait for the response status.
    async fn post_json(
        &self,
        url: &str,
        api_key: Option<&str>,
        body: &Value,
    ) -> Result<u16, DeliveryError>;

    /// Fire-and-forget POST for unload paths. No headers are available on
    /// this channel; credentials travel in the body. Returns whether the
    /// request was handed off.
    fn post_beacon(&self, url: &str, body: Value) -> bool;
}

/// Production [`IngestApi`] over reqwest.
pub struct HttpIngestApi {
    client: reqwest::Client,
}

impl HttpIngestApi {
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(REQUEST_TIMEOUT_MS))
            .user_agent(concat!("errwatch/", env!("CARGO_PKG_VERSION")))
            .build()
            .expect("Failed to build HTTP client");
        Self { client }
    }
}

impl Default for HttpIngestApi {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl IngestApi for HttpIngestApi {
    async fn post_json(
        &self,
        url: &str,
        api_key: Option<&str>,
        body: &Value,
    ) -> Result<u16, DeliveryError> {
        let mut request = self.client.post(url).json(body);
        if let Some(key) = api_key {
            request = request.header("X-Api-Key", key);
        }
        match request.send().await {
            Ok(response) => Ok(response.status().as_u16()),
            Err(err) if err.is_timeout() => Err(DeliveryError::Timeout(REQUEST_TIMEOUT_MS)),
            Err(err) => Err(DeliveryError::Network(err.to_string())),
        }
    }

    fn post_beacon(&self, url: &str, body: Value) -> bool {
        let client = self.client.clone();
        let url = url.to_string();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    let _ = client.post(&url).json(&body).send().await;
                });
                true
            }
            Err(_) => false,
        }
    }
}

/// Replay linkage merged into an outbound error payload.
#[derive(Debug, Clone)]
pub struct ReplayLinkage {
    pub session_id: String,
    pub events: Vec<ReplayEvent>,
}

pub struct Transport {
    endpoint: String,
    recovery_endpoint: String,
    dsn: String,
    api_key: String,
    api: Arc<dyn IngestApi>,
    limiter: Mutex<TokenBucket>,
    breaker: Mutex<CircuitBreaker>,
    queue: OfflineQueue,
    pending: Mutex<VecDeque<Value>>,
    sending: AtomicBool,
    recent_signatures: Mutex<HashMap<u64, i64>>,
    extra_sensitive_keys: Vec<String>,
    clock: SharedClock,
}

impl Transport {
    /// Wire up the transport and the resources it exclusively owns.
    pub fn new(
        config: &AgentConfig,
        dsn: &Dsn,
        api: Arc<dyn IngestApi>,
        session_store: SharedStore,
        durable_store: SharedStore,
        clock: SharedClock,
    ) -> Self {
        Self {
            endpoint: dsn.endpoint(),
            recovery_endpoint: dsn.recovery_endpoint(),
            dsn: dsn.to_string(),
            api_key: config.api_key.clone(),
            api,
            limiter: Mutex::new(TokenBucket::new(&config.limiter, clock.clone())),
            breaker: Mutex::new(CircuitBreaker::new(
                &config.breaker,
                session_store,
                clock.clone(),
            )),
            queue: OfflineQueue::new(&config.queue, durable_store, clock.clone()),
            pending: Mutex::new(VecDeque::new()),
            sending: AtomicBool::new(false),
            recent_signatures: Mutex::new(HashMap::new()),
            extra_sensitive_keys: config
                .scrub
                .sensitive_keys
                .iter()
                .map(|k| k.to_lowercase())
                .collect(),
            clock,
        }
    }

    /// Deliver an error payload, merging replay linkage when present.
    ///
    /// Recovers every failure internally: duplicates and rate-limited sends
    /// are dropped or queued silently.
    pub async fn send(&self, mut payload: Value, replay: Option<ReplayLinkage>) {
        if let Some(linkage) = replay {
            if let Value::Object(map) = &mut payload {
                map.insert("replay_session_id".to_string(), json!(linkage.session_id));
                map.insert(
                    "replay_data".to_string(),
                    serde_json::to_value(&linkage.events).unwrap_or(Value::Null),
                );
            }
        }
        self.scrub(&mut payload);

        if self.is_recent_duplicate(&payload) {
            debug!("dropping duplicate payload within dedup window");
            return;
        }

        if !self.limiter.lock().expect("limiter lock").consume() {
            debug!("rate limit exhausted, queueing payload");
            self.queue.enqueue(payload);
            return;
        }

        self.pending
            .lock()
            .expect("pending lock")
            .push_back(payload);
        self.drain_pending().await;
    }

    /// Drain the internal queue FIFO. The `sending` flag guarantees a single
    /// drain loop; concurrent callers return immediately after appending.
    async fn drain_pending(&self) {
        if self.sending.swap(true, Ordering::SeqCst) {
            return;
        }
        loop {
            let next = self.pending.lock().expect("pending lock").pop_front();
            match next {
                Some(payload) => self.send_to_api(payload).await,
                None => {
                    self.sending.store(false, Ordering::SeqCst);
                    // A concurrent send can append between the empty pop and
                    // the flag clearing; re-acquire and keep draining if so.
                    if self.pending.lock().expect("pending lock").is_empty()
                        || self.sending.swap(true, Ordering::SeqCst)
                    {
                        return;
                    }
                }
            }
        }
    }

    /// One payload through breaker, timeout, retry, and queue fallback.
    async fn send_to_api(&self, payload: Value) {
        if self.breaker.lock().expect("breaker lock").is_open() {
            debug!("circuit open, queueing without network call");
            self.queue.enqueue(payload);
            return;
        }

        let mut attempt: u32 = 0;
        loop {
            let outcome = self
                .api
                .post_json(&self.endpoint, Some(&self.api_key), &payload)
                .await;
            let error = match outcome {
                Ok(status) if (200..300).contains(&status) => {
                    self.breaker.lock().expect("breaker lock").record_success();
                    self.drain_offline().await;
                    return;
                }
                Ok(status) => DeliveryError::Status(status),
                Err(err) => err,
            };

            if error.is_timeout() {
                // Timeouts skip in-process retries; the next drain cycle
                // picks the payload up from the offline queue.
                warn!(%error, "delivery timed out, queueing for later");
                self.breaker.lock().expect("breaker lock").record_failure();
                self.queue.enqueue(payload);
                return;
            }
            if attempt >= MAX_RETRIES {
                warn!(%error, attempts = attempt + 1, "delivery failed, queueing");
                self.breaker.lock().expect("breaker lock").record_failure();
                self.queue.enqueue(payload);
                return;
            }
            let delay = BASE_BACKOFF_MS << attempt;
            debug!(%error, attempt, delay_ms = delay, "delivery failed, backing off");
            tokio::time::sleep(Duration::from_millis(delay)).await;
            attempt += 1;
        }
    }

    /// After a success, recover a bounded number of queued payloads so the
    /// endpoint is not hit with an unbounded burst.
    async fn drain_offline(&self) {
        for _ in 0..OFFLINE_DRAIN_LIMIT {
            let Some(payload) = self.queue.dequeue() else {
                return;
            };
            if self.breaker.lock().expect("breaker lock").is_open() {
                self.queue.enqueue(payload);
                return;
            }
            match self
                .api
                .post_json(&self.endpoint, Some(&self.api_key), &payload)
                .await
            {
                Ok(status) if (200..300).contains(&status) => {
                    self.breaker.lock().expect("breaker lock").record_success();
                }
                Ok(_) | Err(_) => {
                    self.breaker.lock().expect("breaker lock").record_failure();
                    self.queue.enqueue(payload);
                    return;
                }
            }
        }
    }

    /// Last-chance delivery on page hide/unload.
    ///
    /// Combines in-memory and persisted items, caps the batch to the most
    /// recent [`BEACON_MAX_ITEMS`], and hands it to the fire-and-forget
    /// channel. On an accepted handoff both queues are cleared optimistically;
    /// the channel gives no delivery confirmation. A refused handoff keeps
    /// the persisted queue intact and parks the in-memory payloads alongside
    /// it, so a page that resumes instead of dying can still deliver them.
    pub fn flush_with_beacon(&self) {
        let pending: Vec<Value> = self
            .pending
            .lock()
            .expect("pending lock")
            .drain(..)
            .collect();
        let mut items: Vec<Value> = self.queue.get_all();
        items.extend(pending.iter().cloned());
        if items.is_empty() {
            return;
        }
        let start = items.len().saturating_sub(BEACON_MAX_ITEMS);
        let batch: Vec<Value> = items.split_off(start);

        let body = json!({ "dsn": self.dsn, "errors": batch });
        if self.api.post_beacon(&self.endpoint, body) {
            self.queue.clear();
        } else {
            debug!("beacon handoff refused, parking payloads offline");
            for payload in pending {
                self.queue.enqueue(payload);
            }
        }
    }

    /// Ship a post-error recovery window on its dedicated endpoint.
    ///
    /// `use_beacon` selects the unload-safe channel; the API key then travels
    /// in the body because headers are unavailable there.
    pub async fn send_recovery_session(&self, session: &RecoverySession, use_beacon: bool) {
        if use_beacon {
            self.send_recovery_beacon(session);
            return;
        }
        let Some(body) = Self::recovery_body(session) else {
            return;
        };
        if let Err(err) = self
            .api
            .post_json(&self.recovery_endpoint, Some(&self.api_key), &body)
            .await
        {
            debug!(%err, "recovery session delivery failed");
        }
    }

    /// Synchronous beacon variant for unload/visibility-change paths.
    pub fn send_recovery_beacon(&self, session: &RecoverySession) {
        let Some(mut body) = Self::recovery_body(session) else {
            return;
        };
        if let Value::Object(map) = &mut body {
            map.insert("apiKey".to_string(), json!(self.api_key));
        }
        self.api.post_beacon(&self.recovery_endpoint, body);
    }

    fn recovery_body(session: &RecoverySession) -> Option<Value> {
        match serde_json::to_value(session) {
            Ok(body) => Some(body),
            Err(err) => {
                debug!(%err, "recovery session did not serialize");
                None
            }
        }
    }

    /// Live items currently parked in the offline queue.
    pub fn offline_len(&self) -> usize {
        self.queue.len()
    }

    /// Replace sensitive values anywhere in the payload.
    fn scrub(&self, value: &mut Value) {
        match value {
            Value::Object(map) => {
                for (key, entry) in map.iter_mut() {
                    if self.is_sensitive_key(key) {
                        *entry = json!(FILTERED_PLACEHOLDER);
                    } else {
                        self.scrub(entry);
                    }
                }
            }
            Value::Array(entries) => {
                for entry in entries.iter_mut() {
                    self.scrub(entry);
                }
            }
            _ => {}
        }
    }

    fn is_sensitive_key(&self, key: &str) -> bool {
        let key = key.to_lowercase();
        BUILT_IN_SENSITIVE_KEYS
            .iter()
            .any(|needle| key.contains(needle))
            || self
                .extra_sensitive_keys
                .iter()
                .any(|needle| key.contains(needle.as_str()))
    }

    /// Signature over type, message, and the first three stack frames.
    fn duplicate_signature(payload: &Value) -> u64 {
        let error_type = payload["type"].as_str().unwrap_or("");
        let message = payload["message"].as_str().unwrap_or("");
        let frames = payload["stack_trace"]
            .as_array()
            .map(|frames| {
                frames
                    .iter()
                    .take(3)
                    .filter_map(Value::as_str)
                    .collect::<Vec<_>>()
                    .join("\n")
            })
            .unwrap_or_default();
        fnv1a_64(&format!("{error_type}\n{message}\n{frames}"))
    }

    /// Record the payload's signature; true when it was already seen within
    /// the dedup window. Expired entries are evicted once the cache grows
    /// past its soft cap.
    fn is_recent_duplicate(&self, payload: &Value) -> bool {
        let signature = Self::duplicate_signature(payload);
        let now = self.clock.now_ms();
        let mut cache = self.recent_signatures.lock().expect("signature lock");

        if cache.len() > DEDUP_CACHE_SOFT_CAP {
            cache.retain(|_, seen_at| now - *seen_at < DEDUP_WINDOW_SECS * 1000);
        }

        if let Some(seen_at) = cache.get(&signature) {
            if now - seen_at < DEDUP_WINDOW_SECS * 1000 {
                return true;
            }
        }
        cache.insert(signature, now);
        false
    }
}
