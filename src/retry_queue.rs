// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Keyed retry queue with exponential backoff and circuit-breaker gating.
//!
//! Failed lookups park here between retry rounds. Each entry is keyed by the
//! lookup key, so a key re-added after another failure updates its existing
//! entry instead of duplicating it. Release of ready entries is gated on the
//! shared [`CircuitBreaker`]: while the circuit is open nothing leaves the
//! queue, regardless of how long entries have waited.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rand::Rng;
use serde::Serialize;
use tokio::time::Instant;

use crate::circuit_breaker::CircuitBreaker;
use crate::classifier::{classify, Classification};
use crate::error::FetchError;

/// Configuration for the retry queue.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct RetryQueueConfig {
    /// Attempts after which a key is abandoned (default: 3).
    pub max_retry_attempts: u32,
    /// Ceiling on the exponential backoff delay (default: 16s).
    pub max_delay: Duration,
}

impl Default for RetryQueueConfig {
    fn default() -> Self {
        Self {
            max_retry_attempts: 3,
            max_delay: Duration::from_secs(16),
        }
    }
}

impl RetryQueueConfig {
    /// Creates a configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the attempt limit after which a key is abandoned.
    #[must_use]
    pub fn with_max_retry_attempts(mut self, attempts: u32) -> Self {
        self.max_retry_attempts = attempts.max(1);
        self
    }

    /// Sets the backoff delay ceiling.
    #[must_use]
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }
}

/// A lookup waiting to be retried.
#[derive(Debug, Clone)]
pub struct RetryRequest {
    /// The lookup key.
    pub key: String,
    /// Position of this key in the original batch, for order restoration.
    pub original_index: usize,
    /// Attempts made so far, including the initial one.
    pub attempt_count: u32,
    /// When the key first failed.
    pub first_attempt_at: Instant,
    /// When the key most recently failed.
    pub last_attempt_at: Instant,
    /// The most recent failure.
    pub last_error: FetchError,
    /// Earliest instant this entry may be released.
    ready_at: Instant,
}

impl RetryRequest {
    /// Earliest instant this entry may be released.
    #[must_use]
    pub fn ready_at(&self) -> Instant {
        self.ready_at
    }
}

/// What happened when a failure was offered to the queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// The key was scheduled (or rescheduled) for a retry.
    Scheduled {
        /// Backoff delay applied before the entry becomes ready.
        delay: Duration,
    },
    /// The failure is permanent; the key was not queued.
    RejectedPermanent,
    /// The key exhausted its retry budget and was dropped from the queue.
    Exhausted,
}

/// Cumulative retry counters for a batch.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RetryStats {
    /// Entries released for a retry attempt.
    pub total_retry_attempts: u64,
    /// Retries that ultimately succeeded.
    pub retries_succeeded: u64,
    /// Retry attempts that failed again.
    pub retries_failed: u64,
    /// Release attempts blocked by an open circuit.
    pub circuit_breaker_triggered: u64,
    /// Rate-limited failures that entered the queue.
    pub rate_limit_hits: u64,
    /// Configured attempt limit, for reporting alongside the counters.
    pub max_retry_attempts: u32,
}

#[derive(Debug, Default)]
struct Counters {
    total_retry_attempts: u64,
    retries_succeeded: u64,
    retries_failed: u64,
    circuit_breaker_triggered: u64,
    rate_limit_hits: u64,
}

/// Keyed retry scheduler shared between the pipeline phases.
pub struct RetryQueue {
    config: RetryQueueConfig,
    breaker: Arc<CircuitBreaker>,
    entries: Mutex<HashMap<String, RetryRequest>>,
    counters: Mutex<Counters>,
}

impl RetryQueue {
    /// Creates a queue gated on the given breaker.
    #[must_use]
    pub fn new(config: RetryQueueConfig, breaker: Arc<CircuitBreaker>) -> Self {
        Self {
            config,
            breaker,
            entries: Mutex::new(HashMap::new()),
            counters: Mutex::new(Counters::default()),
        }
    }

    /// Offers a failed lookup to the queue.
    ///
    /// Permanent failures are rejected outright. Otherwise the entry's attempt
    /// count is incremented; an entry that reaches `max_retry_attempts` is
    /// dropped and [`RetryDecision::Exhausted`] tells the caller to report a
    /// final failure for it. Scheduled entries get a jittered exponential
    /// backoff delay, floored by the provider's `Retry-After` when the failure
    /// was a rate limit.
    pub fn add_retry_request(
        &self,
        key: &str,
        original_index: usize,
        error: FetchError,
    ) -> RetryDecision {
        let classification = classify(&error);
        if !classification.is_retryable() {
            return RetryDecision::RejectedPermanent;
        }

        if let Some(_delay) = classification.rate_limit_delay() {
            self.counters.lock().rate_limit_hits += 1;
        }

        let now = Instant::now();
        let mut entries = self.entries.lock();
        let (attempt_count, first_attempt_at) = match entries.get(key) {
            Some(existing) => (existing.attempt_count + 1, existing.first_attempt_at),
            None => (1, now),
        };

        if attempt_count >= self.config.max_retry_attempts {
            entries.remove(key);
            tracing::debug!(key, attempts = attempt_count, "retry budget exhausted");
            return RetryDecision::Exhausted;
        }

        let base_delay = match classification {
            Classification::Retryable { base_delay } => base_delay,
            _ => Duration::from_secs(1),
        };
        let mut delay = backoff_delay(base_delay, attempt_count, self.config.max_delay);
        if let Some(floor) = classification.rate_limit_delay() {
            delay = delay.max(floor);
        }

        entries.insert(
            key.to_string(),
            RetryRequest {
                key: key.to_string(),
                original_index,
                attempt_count,
                first_attempt_at,
                last_attempt_at: now,
                last_error: error,
                ready_at: now + delay,
            },
        );
        tracing::debug!(key, attempts = attempt_count, delay_ms = delay.as_millis() as u64, "retry scheduled");
        RetryDecision::Scheduled { delay }
    }

    /// Removes and returns every entry whose backoff has elapsed.
    ///
    /// Returns an empty vec without draining anything while the circuit is
    /// open; those blocked releases are counted in the stats.
    pub fn get_ready_retry_requests(&self) -> Vec<RetryRequest> {
        if !self.breaker.can_execute() {
            self.counters.lock().circuit_breaker_triggered += 1;
            tracing::debug!("retry release blocked by open circuit");
            return Vec::new();
        }

        let now = Instant::now();
        let mut entries = self.entries.lock();
        let ready_keys: Vec<String> = entries
            .values()
            .filter(|r| r.ready_at <= now)
            .map(|r| r.key.clone())
            .collect();
        let mut ready: Vec<RetryRequest> = ready_keys
            .iter()
            .filter_map(|k| entries.remove(k))
            .collect();
        drop(entries);

        // Stable output order for the round.
        ready.sort_by_key(|r| r.original_index);
        self.counters.lock().total_retry_attempts += ready.len() as u64;
        ready
    }

    /// Records that a released retry succeeded.
    pub fn record_retry_success(&self, key: &str) {
        self.counters.lock().retries_succeeded += 1;
        self.breaker.record_success();
        tracing::debug!(key, "retry succeeded");
    }

    /// Records that a released retry failed again and re-offers it.
    ///
    /// The breaker sees every failed retry. The entry is re-queued (or
    /// dropped) per the same rules as [`add_retry_request`].
    pub fn record_retry_failure(
        &self,
        key: &str,
        original_index: usize,
        error: FetchError,
    ) -> RetryDecision {
        self.counters.lock().retries_failed += 1;
        self.breaker.record_failure();
        self.add_retry_request(key, original_index, error)
    }

    /// The earliest instant at which any queued entry becomes ready.
    #[must_use]
    pub fn next_ready_at(&self) -> Option<Instant> {
        self.entries.lock().values().map(|r| r.ready_at).min()
    }

    /// Whether the queue holds no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Number of queued entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Removes and returns every remaining entry, ready or not.
    ///
    /// Used when retry rounds end with work still queued and the leftovers
    /// must be reported as final failures.
    pub fn drain_remaining(&self) -> Vec<RetryRequest> {
        let mut drained: Vec<RetryRequest> =
            self.entries.lock().drain().map(|(_, r)| r).collect();
        drained.sort_by_key(|r| r.original_index);
        drained
    }

    /// Clears all entries and counters.
    pub fn reset(&self) {
        self.entries.lock().clear();
        *self.counters.lock() = Counters::default();
    }

    /// Snapshot of the retry counters.
    #[must_use]
    pub fn stats(&self) -> RetryStats {
        let counters = self.counters.lock();
        RetryStats {
            total_retry_attempts: counters.total_retry_attempts,
            retries_succeeded: counters.retries_succeeded,
            retries_failed: counters.retries_failed,
            circuit_breaker_triggered: counters.circuit_breaker_triggered,
            rate_limit_hits: counters.rate_limit_hits,
            max_retry_attempts: self.config.max_retry_attempts,
        }
    }
}

/// `min(base * 2^(attempt-1), max) * uniform[0.8, 1.2]`.
///
/// Jitter spreads simultaneous failures so a retry round does not hammer the
/// provider with a synchronized burst.
fn backoff_delay(base: Duration, attempt: u32, max: Duration) -> Duration {
    let exp = attempt.saturating_sub(1).min(16);
    let unjittered = base
        .saturating_mul(1u32 << exp)
        .min(max);
    let jitter = rand::thread_rng().gen_range(0.8..=1.2);
    unjittered.mul_f64(jitter)
}
