// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Adaptive token-bucket rate limiter.
//!
//! The bucket refills continuously at the current rate and never exceeds the
//! burst capacity. [`AdaptiveRateLimiter::wait_for_permission`] blocks until a
//! whole token is available; the wait is computed from the deficit rather than
//! polled on a fixed interval, so callers wake close to when their token
//! exists.
//!
//! The rate itself moves between `min_rate` and `max_rate` based on observed
//! health: the pipeline feeds back a blended success/latency score through
//! [`AdaptiveRateLimiter::adapt_rate`] after each lookup settles.

use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;
use tokio::time::Instant;

/// Invalid limiter configuration.
#[derive(Debug, Error)]
pub enum RateLimiterConfigError {
    /// A rate or capacity was zero or negative.
    #[error("rate limiter values must be positive: {0}")]
    NonPositive(&'static str),
    /// `min_rate` exceeded `max_rate`.
    #[error("min_rate ({min}) must not exceed max_rate ({max})")]
    InvertedBounds {
        /// Configured minimum rate.
        min: f64,
        /// Configured maximum rate.
        max: f64,
    },
}

/// Configuration for the adaptive rate limiter.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct RateLimiterConfig {
    /// Starting request rate in tokens per second (default: 10).
    pub base_rate: f64,
    /// Floor the adapted rate never goes below (default: 2).
    pub min_rate: f64,
    /// Ceiling the adapted rate never exceeds (default: 20).
    pub max_rate: f64,
    /// Maximum tokens the bucket holds (default: 5).
    pub burst_capacity: f64,
    /// Fraction of the gap to the bound closed per adaptation (default: 0.2).
    pub adaptation_factor: f64,
    /// Success rate treated as fully healthy (default: 0.95).
    pub target_success_rate: f64,
    /// Response time treated as fully healthy (default: 1s).
    pub target_response_time: Duration,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            base_rate: 10.0,
            min_rate: 2.0,
            max_rate: 20.0,
            burst_capacity: 5.0,
            adaptation_factor: 0.2,
            target_success_rate: 0.95,
            target_response_time: Duration::from_secs(1),
        }
    }
}

impl RateLimiterConfig {
    /// Creates a configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the starting rate in tokens per second.
    #[must_use]
    pub fn with_base_rate(mut self, rate: f64) -> Self {
        self.base_rate = rate;
        self
    }

    /// Sets the rate bounds the adaptation moves within.
    #[must_use]
    pub fn with_rate_bounds(mut self, min: f64, max: f64) -> Self {
        self.min_rate = min;
        self.max_rate = max;
        self
    }

    /// Sets the burst capacity.
    #[must_use]
    pub fn with_burst_capacity(mut self, capacity: f64) -> Self {
        self.burst_capacity = capacity;
        self
    }

    /// Sets the fraction of the gap to a bound closed per adaptation.
    #[must_use]
    pub fn with_adaptation_factor(mut self, factor: f64) -> Self {
        self.adaptation_factor = factor;
        self
    }

    /// Validates the configuration.
    pub fn validate(&self) -> Result<(), RateLimiterConfigError> {
        if self.base_rate <= 0.0 {
            return Err(RateLimiterConfigError::NonPositive("base_rate"));
        }
        if self.min_rate <= 0.0 {
            return Err(RateLimiterConfigError::NonPositive("min_rate"));
        }
        if self.burst_capacity <= 0.0 {
            return Err(RateLimiterConfigError::NonPositive("burst_capacity"));
        }
        if self.adaptation_factor <= 0.0 {
            return Err(RateLimiterConfigError::NonPositive("adaptation_factor"));
        }
        if self.min_rate > self.max_rate {
            return Err(RateLimiterConfigError::InvertedBounds {
                min: self.min_rate,
                max: self.max_rate,
            });
        }
        Ok(())
    }
}

#[derive(Debug)]
struct BucketInner {
    tokens: f64,
    current_rate: f64,
    last_refill: Instant,
}

/// Token bucket whose refill rate adapts to observed provider health.
#[derive(Debug)]
pub struct AdaptiveRateLimiter {
    config: RateLimiterConfig,
    inner: Mutex<BucketInner>,
}

impl Default for AdaptiveRateLimiter {
    fn default() -> Self {
        Self::new(RateLimiterConfig::default())
    }
}

impl AdaptiveRateLimiter {
    /// Creates a limiter with a full bucket.
    ///
    /// Starting full lets a fresh batch burst up to `burst_capacity` requests
    /// immediately before settling into the steady rate.
    #[must_use]
    pub fn new(config: RateLimiterConfig) -> Self {
        let tokens = config.burst_capacity;
        let current_rate = config.base_rate.clamp(config.min_rate, config.max_rate);
        Self {
            config,
            inner: Mutex::new(BucketInner {
                tokens,
                current_rate,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Blocks until a token is available, then consumes it.
    ///
    /// Waiters sleep outside the lock, so permission checks from other tasks
    /// (and rate adaptations) proceed while one task waits.
    pub async fn wait_for_permission(&self) {
        loop {
            let wait = {
                let mut inner = self.inner.lock();
                Self::refill(&mut inner, self.config.burst_capacity);
                if inner.tokens >= 1.0 {
                    inner.tokens -= 1.0;
                    return;
                }
                Duration::from_secs_f64((1.0 - inner.tokens) / inner.current_rate)
            };
            tokio::time::sleep(wait).await;
        }
    }

    /// Consumes a token if one is available right now.
    #[must_use]
    pub fn try_acquire(&self) -> bool {
        let mut inner = self.inner.lock();
        Self::refill(&mut inner, self.config.burst_capacity);
        if inner.tokens >= 1.0 {
            inner.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    fn refill(inner: &mut BucketInner, burst_capacity: f64) {
        let now = Instant::now();
        let elapsed = now.duration_since(inner.last_refill).as_secs_f64();
        inner.tokens = (inner.tokens + elapsed * inner.current_rate).min(burst_capacity);
        inner.last_refill = now;
    }

    /// Moves the rate toward its bounds based on observed health.
    ///
    /// The score blends success rate (weight 0.6) against the success target
    /// with response time (weight 0.4) against the response-time target. A
    /// score above 0.9 steps the rate toward `max_rate`; below 0.7 steps it
    /// toward `min_rate`; in between the rate holds.
    pub fn adapt_rate(&self, success_rate: f64, avg_response_time: Duration) {
        let success_factor = (success_rate / self.config.target_success_rate).min(1.0);
        let response_factor = (self.config.target_response_time.as_secs_f64()
            / avg_response_time.as_secs_f64().max(f64::EPSILON))
        .min(1.0);
        let score = 0.6 * success_factor + 0.4 * response_factor;

        let mut inner = self.inner.lock();
        let old_rate = inner.current_rate;
        if score > 0.9 {
            inner.current_rate +=
                (self.config.max_rate - inner.current_rate) * self.config.adaptation_factor;
        } else if score < 0.7 {
            inner.current_rate -=
                (inner.current_rate - self.config.min_rate) * self.config.adaptation_factor;
        }
        inner.current_rate = inner
            .current_rate
            .clamp(self.config.min_rate, self.config.max_rate);
        if (inner.current_rate - old_rate).abs() > f64::EPSILON {
            tracing::debug!(
                score = format!("{score:.3}"),
                old_rate = format!("{old_rate:.2}"),
                new_rate = format!("{:.2}", inner.current_rate),
                "rate adapted"
            );
        }
    }

    /// The current adapted rate in tokens per second.
    #[must_use]
    pub fn current_rate(&self) -> f64 {
        self.inner.lock().current_rate
    }

    /// Snapshot of the limiter for diagnostics.
    #[must_use]
    pub fn status(&self) -> RateLimiterStatus {
        let mut inner = self.inner.lock();
        Self::refill(&mut inner, self.config.burst_capacity);
        RateLimiterStatus {
            current_rate: inner.current_rate,
            available_tokens: inner.tokens,
            utilization_percent: inner.current_rate / self.config.max_rate * 100.0,
        }
    }
}

/// Point-in-time view of the limiter.
#[derive(Debug, Clone, Serialize)]
pub struct RateLimiterStatus {
    /// Current adapted rate in tokens per second.
    pub current_rate: f64,
    /// Tokens available right now.
    pub available_tokens: f64,
    /// Current rate as a percentage of `max_rate`.
    pub utilization_percent: f64,
}
