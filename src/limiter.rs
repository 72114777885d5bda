// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Token-bucket rate limiter for outbound error volume.
//!
//! Refill is computed lazily from wall-clock deltas on each check, never from
//! a background timer, so the math stays correct even if the host page sits
//! backgrounded for hours.

use crate::clock::SharedClock;
use crate::config::LimiterConfig;

/// Token bucket with lazy whole-token refill.
pub struct TokenBucket {
    tokens: f64,
    max_tokens: f64,
    refill_rate: f64,
    last_refill_ms: i64,
    clock: SharedClock,
}

impl TokenBucket {
    /// Create a full bucket.
    pub fn new(config: &LimiterConfig, clock: SharedClock) -> Self {
        let max_tokens = f64::from(config.max_tokens);
        Self {
            tokens: max_tokens,
            max_tokens,
            refill_rate: config.refill_rate,
            last_refill_ms: clock.now_ms(),
            clock,
        }
    }

    /// Apply pending refill. Whole tokens only; the fractional remainder
    /// stays banked by not advancing `last_refill_ms` until at least one
    /// token has accrued.
    fn refill(&mut self) {
        let now = self.clock.now_ms();
        let elapsed_secs = (now - self.last_refill_ms).max(0) as f64 / 1000.0;
        let accrued = (elapsed_secs * self.refill_rate).floor();
        if accrued >= 1.0 {
            self.tokens = (self.tokens + accrued).min(self.max_tokens);
            self.last_refill_ms = now;
        }
    }

    /// Take one token if available.
    ///
    /// Returns false without mutating the count when the bucket is empty.
    pub fn consume(&mut self) -> bool {
        self.refill();
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Peek: would `consume` succeed right now?
    pub fn is_allowed(&mut self) -> bool {
        self.refill();
        self.tokens >= 1.0
    }

    /// Current token count after applying pending refill.
    pub fn get_tokens(&mut self) -> f64 {
        self.refill();
        self.tokens
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::sync::Arc;

    fn bucket(max_tokens: u32, refill_rate: f64) -> (TokenBucket, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::default());
        let config = LimiterConfig {
            max_tokens,
            refill_rate,
        };
        (TokenBucket::new(&config, clock.clone()), clock)
    }

    #[test]
    fn test_exactly_capacity_consumes_succeed() {
        let (mut bucket, _clock) = bucket(3, 1.0);
        assert!(bucket.consume());
        assert!(bucket.consume());
        assert!(bucket.consume());
        assert!(!bucket.consume());
        assert!(!bucket.consume());
        assert_eq!(bucket.get_tokens(), 0.0);
    }

    #[test]
    fn test_refill_floors_elapsed_tokens() {
        let (mut bucket, clock) = bucket(3, 2.0);
        for _ in 0..3 {
            assert!(bucket.consume());
        }
        assert!(!bucket.consume());

        clock.advance_ms(1_100);
        assert_eq!(bucket.get_tokens(), 2.0);
    }

    #[test]
    fn test_refill_never_exceeds_capacity() {
        let (mut bucket, clock) = bucket(5, 10.0);
        assert!(bucket.consume());
        clock.advance_secs(3_600);
        assert_eq!(bucket.get_tokens(), 5.0);
    }

    #[test]
    fn test_partial_elapsed_banks_fraction() {
        let (mut bucket, clock) = bucket(2, 1.0);
        assert!(bucket.consume());
        assert!(bucket.consume());

        // 0.6s accrues no whole token and must not reset the refill anchor.
        clock.advance_ms(600);
        assert!(!bucket.is_allowed());
        clock.advance_ms(600);
        assert!(bucket.is_allowed());
        assert_eq!(bucket.get_tokens(), 1.0);
    }

    #[test]
    fn test_is_allowed_does_not_decrement() {
        let (mut bucket, _clock) = bucket(1, 1.0);
        assert!(bucket.is_allowed());
        assert!(bucket.is_allowed());
        assert!(bucket.consume());
        assert!(!bucket.is_allowed());
    }
}
