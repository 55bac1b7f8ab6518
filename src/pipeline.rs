// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Batch orchestration.
//!
//! [`LookupPipeline::process`] takes a batch of keys and returns one
//! [`LookupOutcome`] per key, in input order, after three phases:
//!
//! 1. **Full pass**: every key is dispatched through the worker pool under
//!    the adaptive controls. Retryable failures are parked in the retry
//!    queue; everything else settles.
//! 2. **Retry rounds**: up to `max_retry_rounds` passes over whatever became
//!    ready in the queue, at reduced concurrency so retries never crowd out
//!    a healthy provider.
//! 3. **Settlement**: whatever is still queued is reported as a final
//!    failure, and batch statistics are computed.
//!
//! The adaptive components (limiter, monitor, breaker) persist across
//! batches, so a second batch against the same provider starts from the
//! rates the first one learned. Retry bookkeeping is per batch.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::time::Instant;

use crate::caches::LookupCache;
use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerStats, CircuitState};
use crate::classifier::classify;
use crate::error::{FetchError, PipelineError, Result};
use crate::fetcher::{Fetcher, LookupOutcome};
use crate::lookup_queue::{
    CancelHandle, LookupQueue, LookupQueueConfig, ProgressCallback, QueueItem,
};
use crate::performance::{PerformanceMetrics, PerformanceMonitor, PerformanceMonitorConfig};
use crate::rate_limiter::{AdaptiveRateLimiter, RateLimiterConfig, RateLimiterStatus};
use crate::retry_queue::{RetryDecision, RetryQueue, RetryQueueConfig, RetryStats};

/// Top-level configuration for a pipeline.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct PipelineConfig {
    /// Rate limiter settings.
    pub rate_limiter: RateLimiterConfig,
    /// Circuit breaker settings.
    pub circuit_breaker: CircuitBreakerConfig,
    /// Retry queue settings.
    pub retry_queue: RetryQueueConfig,
    /// Performance monitor settings.
    pub performance: PerformanceMonitorConfig,
    /// Worker pool bounds.
    pub queue: LookupQueueConfig,
    /// Retry passes after the full pass (default: 3).
    pub max_retry_rounds: u32,
    /// How far below the monitor's recommendation retry rounds run
    /// (default: 2, floored at the pool minimum).
    pub retry_concurrency_reduction: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            rate_limiter: RateLimiterConfig::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            retry_queue: RetryQueueConfig::default(),
            performance: PerformanceMonitorConfig::default(),
            queue: LookupQueueConfig::default(),
            max_retry_rounds: 3,
            retry_concurrency_reduction: 2,
        }
    }
}

impl PipelineConfig {
    /// Creates a configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the number of retry passes after the full pass.
    #[must_use]
    pub fn with_max_retry_rounds(mut self, rounds: u32) -> Self {
        self.max_retry_rounds = rounds;
        self
    }

    /// Sets the rate limiter settings.
    #[must_use]
    pub fn with_rate_limiter(mut self, config: RateLimiterConfig) -> Self {
        self.rate_limiter = config;
        self
    }

    /// Sets the circuit breaker settings.
    #[must_use]
    pub fn with_circuit_breaker(mut self, config: CircuitBreakerConfig) -> Self {
        self.circuit_breaker = config;
        self
    }

    /// Sets the retry queue settings.
    #[must_use]
    pub fn with_retry_queue(mut self, config: RetryQueueConfig) -> Self {
        self.retry_queue = config;
        self
    }

    /// Sets the performance monitor settings.
    #[must_use]
    pub fn with_performance(mut self, config: PerformanceMonitorConfig) -> Self {
        self.performance = config;
        self
    }
}

/// Statistics for the most recent batch.
#[derive(Debug, Clone, Serialize)]
pub struct LookupStats {
    /// Keys in the batch.
    pub total: usize,
    /// Lookups that actually ran to a verdict; cancelled and
    /// never-dispatched keys are excluded.
    pub completed: usize,
    /// Keys that produced a value.
    pub successful: usize,
    /// Keys that did not produce a value, including not-found keys.
    pub failed: usize,
    /// Successes served from the cache without a fetch.
    pub cache_hits: usize,
    /// Wall-clock time for the whole batch.
    #[serde(with = "crate::serde_duration")]
    pub elapsed: Duration,
    /// Retry counters for the batch.
    pub retry: RetryStats,
    /// Final failure reasons, keyed by stable label.
    pub final_failure_reasons: HashMap<String, u64>,
}

/// Adaptive concurrent lookup pipeline.
///
/// Construct one per upstream provider and reuse it across batches.
pub struct LookupPipeline<V> {
    config: PipelineConfig,
    breaker: Arc<CircuitBreaker>,
    limiter: Arc<AdaptiveRateLimiter>,
    monitor: Arc<PerformanceMonitor>,
    retry_queue: RetryQueue,
    queue: LookupQueue<V>,
    cancel: CancelHandle,
    last_stats: Mutex<Option<LookupStats>>,
}

impl<V> LookupPipeline<V>
where
    V: Clone + Send + Sync + 'static,
{
    /// Builds a pipeline from its injected seams.
    ///
    /// Fails with [`PipelineError::Configuration`] when the configuration is
    /// not internally consistent.
    pub fn new(
        fetcher: Arc<dyn Fetcher<V>>,
        cache: Arc<dyn LookupCache<V>>,
        config: PipelineConfig,
    ) -> Result<Self> {
        config
            .rate_limiter
            .validate()
            .map_err(|e| PipelineError::Configuration(e.to_string()))?;
        if config.queue.min_concurrency > config.queue.max_concurrency {
            return Err(PipelineError::Configuration(format!(
                "min_concurrency ({}) exceeds max_concurrency ({})",
                config.queue.min_concurrency, config.queue.max_concurrency
            )));
        }

        let breaker = Arc::new(CircuitBreaker::new(config.circuit_breaker.clone()));
        let limiter = Arc::new(AdaptiveRateLimiter::new(config.rate_limiter.clone()));
        let monitor = Arc::new(PerformanceMonitor::new(config.performance.clone()));
        let retry_queue = RetryQueue::new(config.retry_queue.clone(), Arc::clone(&breaker));
        let cancel = CancelHandle::new();
        let queue = LookupQueue::new(
            fetcher,
            cache,
            Arc::clone(&limiter),
            Arc::clone(&monitor),
            cancel.clone(),
            config.queue.clone(),
        );
        Ok(Self {
            config,
            breaker,
            limiter,
            monitor,
            retry_queue,
            queue,
            cancel,
            last_stats: Mutex::new(None),
        })
    }

    /// Builds a pipeline with default configuration.
    pub fn with_defaults(
        fetcher: Arc<dyn Fetcher<V>>,
        cache: Arc<dyn LookupCache<V>>,
    ) -> Result<Self> {
        Self::new(fetcher, cache, PipelineConfig::new())
    }

    /// Processes a batch of keys and returns one outcome per key, in input
    /// order.
    ///
    /// `on_progress` fires with `(completed, total)` as keys settle during
    /// the full pass; retry rounds report through [`LookupStats`] instead.
    /// The only fatal error is an unusable cache layer.
    pub async fn process(
        &self,
        keys: Vec<String>,
        on_progress: Option<ProgressCallback>,
    ) -> Result<Vec<LookupOutcome<V>>> {
        let started = Instant::now();
        let total = keys.len();
        self.retry_queue.reset();

        let mut slots: Vec<Option<LookupOutcome<V>>> =
            std::iter::repeat_with(|| None).take(total).collect();

        // Phase 1: full pass over the batch.
        let items: Vec<QueueItem> = keys
            .into_iter()
            .enumerate()
            .map(|(index, key)| (key, index))
            .collect();
        let first_pass = self.queue.run(items, None, on_progress).await?;
        for (index, key, outcome) in first_pass {
            match outcome {
                LookupOutcome::Failure(err) if !matches!(err, FetchError::Cancelled) => {
                    match self.retry_queue.add_retry_request(&key, index, err.clone()) {
                        RetryDecision::Scheduled { .. } => {}
                        RetryDecision::RejectedPermanent | RetryDecision::Exhausted => {
                            slots[index] = Some(LookupOutcome::Failure(err));
                        }
                    }
                }
                settled => slots[index] = Some(settled),
            }
        }

        // Phase 2: bounded retry rounds at reduced concurrency.
        for round in 0..self.config.max_retry_rounds {
            if self.cancel.is_cancelled() || self.retry_queue.is_empty() {
                break;
            }
            if let Some(next_ready) = self.retry_queue.next_ready_at() {
                // Backoff waits race the cancel signal; a cancelled batch
                // must not sleep out a Retry-After with nothing in flight.
                tokio::select! {
                    () = tokio::time::sleep_until(next_ready) => {}
                    () = self.cancel.cancelled() => break,
                }
            }
            let ready = self.retry_queue.get_ready_retry_requests();
            if ready.is_empty() {
                // Circuit still open; the round is consumed waiting it out.
                tokio::select! {
                    () = tokio::time::sleep(Duration::from_secs(1u64 << round)) => {}
                    () = self.cancel.cancelled() => break,
                }
                continue;
            }

            let ceiling = self
                .monitor
                .recommended_concurrency()
                .saturating_sub(self.config.retry_concurrency_reduction)
                .max(self.config.queue.min_concurrency);
            tracing::debug!(round, items = ready.len(), ceiling, "retry round starting");

            let retry_items: Vec<QueueItem> = ready
                .into_iter()
                .map(|r| (r.key, r.original_index))
                .collect();
            let round_results = self.queue.run(retry_items, Some(ceiling), None).await?;
            for (index, key, outcome) in round_results {
                match outcome {
                    LookupOutcome::Failure(FetchError::Cancelled) => {
                        slots[index] = Some(LookupOutcome::Failure(FetchError::Cancelled));
                    }
                    LookupOutcome::Failure(err) => {
                        match self.retry_queue.record_retry_failure(&key, index, err.clone())
                        {
                            RetryDecision::Scheduled { .. } => {}
                            RetryDecision::RejectedPermanent | RetryDecision::Exhausted => {
                                slots[index] = Some(LookupOutcome::Failure(err));
                            }
                        }
                    }
                    settled => {
                        self.retry_queue.record_retry_success(&key);
                        slots[index] = Some(settled);
                    }
                }
            }

            if round + 1 < self.config.max_retry_rounds && !self.retry_queue.is_empty() {
                tokio::select! {
                    () = tokio::time::sleep(Duration::from_secs(1u64 << round)) => {}
                    () = self.cancel.cancelled() => break,
                }
            }
        }

        // Phase 3: settle leftovers and compute stats.
        let breaker_open = self.breaker.state() == CircuitState::Open;
        for leftover in self.retry_queue.drain_remaining() {
            let error = if breaker_open {
                FetchError::CircuitOpen
            } else {
                leftover.last_error
            };
            slots[leftover.original_index] = Some(LookupOutcome::Failure(error));
        }

        // Unsettled slots belong to cancelled-before-dispatch keys, or to a
        // worker that panicked; only the former should read as cancelled.
        let fill_error = if self.cancel.is_cancelled() {
            FetchError::Cancelled
        } else {
            FetchError::other("lookup task failed")
        };
        let outcomes: Vec<LookupOutcome<V>> = slots
            .into_iter()
            .map(|slot| {
                slot.unwrap_or_else(|| LookupOutcome::Failure(fill_error.clone()))
            })
            .collect();

        let stats = self.compute_stats(&outcomes, total, started.elapsed());
        tracing::info!(
            total = stats.total,
            completed = stats.completed,
            successful = stats.successful,
            failed = stats.failed,
            cache_hits = stats.cache_hits,
            elapsed_ms = stats.elapsed.as_millis() as u64,
            "batch complete"
        );
        *self.last_stats.lock() = Some(stats);

        Ok(outcomes)
    }

    fn compute_stats(
        &self,
        outcomes: &[LookupOutcome<V>],
        total: usize,
        elapsed: Duration,
    ) -> LookupStats {
        let mut completed = 0;
        let mut successful = 0;
        let mut failed = 0;
        let mut cache_hits = 0;
        let mut final_failure_reasons: HashMap<String, u64> = HashMap::new();
        for outcome in outcomes {
            match outcome {
                LookupOutcome::Success { from_cache, .. } => {
                    completed += 1;
                    successful += 1;
                    if *from_cache {
                        cache_hits += 1;
                    }
                }
                LookupOutcome::NotFound => {
                    completed += 1;
                    failed += 1;
                    *final_failure_reasons
                        .entry("Not Found".to_string())
                        .or_insert(0) += 1;
                }
                LookupOutcome::Failure(err) => {
                    failed += 1;
                    if !matches!(err, FetchError::Cancelled) {
                        completed += 1;
                    }
                    let label = match err {
                        FetchError::Cancelled => "Cancelled",
                        FetchError::CircuitOpen => "Circuit Breaker Open",
                        other => classify(other).reason_label(),
                    };
                    *final_failure_reasons.entry(label.to_string()).or_insert(0) += 1;
                }
            }
        }
        LookupStats {
            total,
            completed,
            successful,
            failed,
            cache_hits,
            elapsed,
            retry: self.retry_queue.stats(),
            final_failure_reasons,
        }
    }

    /// Statistics for the most recent completed batch.
    #[must_use]
    pub fn stats(&self) -> Option<LookupStats> {
        self.last_stats.lock().clone()
    }

    /// Live view of the rate limiter.
    #[must_use]
    pub fn rate_limiter_status(&self) -> RateLimiterStatus {
        self.limiter.status()
    }

    /// Live view of the circuit breaker.
    #[must_use]
    pub fn circuit_breaker_stats(&self) -> CircuitBreakerStats {
        self.breaker.stats()
    }

    /// Live view of the performance monitor.
    #[must_use]
    pub fn performance_metrics(&self) -> PerformanceMetrics {
        self.monitor.metrics()
    }

    /// The handle used to cancel an in-flight batch.
    #[must_use]
    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::caches::InMemoryLookupCache;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn fast_config() -> PipelineConfig {
        PipelineConfig::new().with_rate_limiter(
            RateLimiterConfig::new()
                .with_base_rate(10_000.0)
                .with_rate_bounds(10_000.0, 10_000.0)
                .with_burst_capacity(10_000.0),
        )
    }

    struct FlakyFetcher {
        fail_first: usize,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Fetcher<String> for FlakyFetcher {
        async fn fetch(&self, key: &str) -> Result<String, FetchError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.fail_first {
                Err(FetchError::http(500, "flaky"))
            } else {
                Ok(format!("value-{key}"))
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_config_rejected() {
        let fetcher = Arc::new(FlakyFetcher {
            fail_first: 0,
            calls: AtomicUsize::new(0),
        });
        let config = PipelineConfig::new()
            .with_rate_limiter(RateLimiterConfig::new().with_base_rate(-1.0));
        let result = LookupPipeline::new(
            fetcher,
            Arc::new(InMemoryLookupCache::<String>::new()),
            config,
        );
        assert!(matches!(result, Err(PipelineError::Configuration(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_outcomes_preserve_input_order() {
        let fetcher = Arc::new(FlakyFetcher {
            fail_first: 0,
            calls: AtomicUsize::new(0),
        });
        let pipeline = LookupPipeline::new(
            fetcher,
            Arc::new(InMemoryLookupCache::new()),
            fast_config(),
        )
        .unwrap();
        let keys: Vec<String> = (0..12).map(|i| format!("key-{i}")).collect();
        let outcomes = pipeline.process(keys.clone(), None).await.unwrap();
        assert_eq!(outcomes.len(), keys.len());
        for (i, outcome) in outcomes.iter().enumerate() {
            assert_eq!(outcome.value(), Some(&format!("value-key-{i}")));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failures_recover_via_retry() {
        // First two calls fail with a retryable 500, everything after
        // succeeds: both affected keys recover in retry rounds.
        let fetcher = Arc::new(FlakyFetcher {
            fail_first: 2,
            calls: AtomicUsize::new(0),
        });
        let pipeline = LookupPipeline::new(
            fetcher,
            Arc::new(InMemoryLookupCache::new()),
            fast_config(),
        )
        .unwrap();
        let keys: Vec<String> = (0..20).map(|i| format!("key-{i}")).collect();
        let outcomes = pipeline.process(keys, None).await.unwrap();
        assert!(outcomes.iter().all(LookupOutcome::is_success));
        let stats = pipeline.stats().unwrap();
        assert_eq!(stats.successful, 20);
        assert_eq!(stats.failed, 0);
        assert_eq!(stats.completed, 20);
        assert_eq!(stats.retry.total_retry_attempts, 2);
        assert_eq!(stats.retry.retries_succeeded, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_not_found_settles_once_with_reason() {
        struct NotFoundFetcher;
        #[async_trait]
        impl Fetcher<String> for NotFoundFetcher {
            async fn fetch(&self, _key: &str) -> Result<String, FetchError> {
                Err(FetchError::NotFound)
            }
        }
        let pipeline = LookupPipeline::new(
            Arc::new(NotFoundFetcher),
            Arc::new(InMemoryLookupCache::new()),
            fast_config(),
        )
        .unwrap();
        let outcomes = pipeline
            .process(vec!["ghost".to_string()], None)
            .await
            .unwrap();
        assert_eq!(outcomes[0], LookupOutcome::NotFound);
        let stats = pipeline.stats().unwrap();
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.final_failure_reasons.get("Not Found"), Some(&1));
        // Never offered to the retry queue.
        assert_eq!(stats.retry.total_retry_attempts, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_failures_never_retried() {
        struct ForbiddenFetcher {
            calls: AtomicUsize,
        }
        #[async_trait]
        impl Fetcher<String> for ForbiddenFetcher {
            async fn fetch(&self, _key: &str) -> Result<String, FetchError> {
                self.calls.fetch_add(1, Ordering::SeqCst);
                Err(FetchError::http(403, "forbidden"))
            }
        }
        let fetcher = Arc::new(ForbiddenFetcher {
            calls: AtomicUsize::new(0),
        });
        let pipeline = LookupPipeline::new(
            Arc::clone(&fetcher) as _,
            Arc::new(InMemoryLookupCache::new()),
            fast_config(),
        )
        .unwrap();
        let outcomes = pipeline
            .process(vec!["a".to_string(), "b".to_string()], None)
            .await
            .unwrap();
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 2);
        assert!(outcomes
            .iter()
            .all(|o| matches!(o, LookupOutcome::Failure(_))));
        let stats = pipeline.stats().unwrap();
        assert_eq!(stats.final_failure_reasons.get("Permanent Failure"), Some(&2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_retries_report_last_error() {
        struct AlwaysTimeout;
        #[async_trait]
        impl Fetcher<String> for AlwaysTimeout {
            async fn fetch(&self, _key: &str) -> Result<String, FetchError> {
                Err(FetchError::timeout("still slow"))
            }
        }
        let pipeline = LookupPipeline::new(
            Arc::new(AlwaysTimeout),
            Arc::new(InMemoryLookupCache::new()),
            fast_config(),
        )
        .unwrap();
        let outcomes = pipeline.process(vec!["k".to_string()], None).await.unwrap();
        assert!(matches!(
            &outcomes[0],
            LookupOutcome::Failure(FetchError::Timeout(_))
        ));
        let stats = pipeline.stats().unwrap();
        assert_eq!(stats.failed, 1);
        assert!(stats.retry.retries_failed >= 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cached_batch_is_all_hits() {
        let cache = Arc::new(InMemoryLookupCache::new());
        cache.put("a", "cached-a".to_string()).await.unwrap();
        cache.put("b", "cached-b".to_string()).await.unwrap();
        let fetcher = Arc::new(FlakyFetcher {
            fail_first: usize::MAX,
            calls: AtomicUsize::new(0),
        });
        let pipeline =
            LookupPipeline::new(fetcher, Arc::clone(&cache) as _, fast_config()).unwrap();
        let outcomes = pipeline
            .process(vec!["a".to_string(), "b".to_string()], None)
            .await
            .unwrap();
        assert!(outcomes.iter().all(LookupOutcome::is_success));
        let stats = pipeline.stats().unwrap();
        assert_eq!(stats.cache_hits, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_settles_every_slot() {
        let fetcher = Arc::new(FlakyFetcher {
            fail_first: 0,
            calls: AtomicUsize::new(0),
        });
        let pipeline = LookupPipeline::new(
            fetcher,
            Arc::new(InMemoryLookupCache::new()),
            fast_config(),
        )
        .unwrap();
        pipeline.cancel_handle().cancel();
        let keys: Vec<String> = (0..8).map(|i| format!("key-{i}")).collect();
        let outcomes = pipeline.process(keys, None).await.unwrap();
        assert_eq!(outcomes.len(), 8);
        assert!(outcomes
            .iter()
            .all(|o| matches!(o, LookupOutcome::Failure(FetchError::Cancelled))));
        let stats = pipeline.stats().unwrap();
        assert_eq!(stats.final_failure_reasons.get("Cancelled"), Some(&8));
        // None of the lookups actually ran.
        assert_eq!(stats.completed, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_interrupts_retry_backoff() {
        struct ThrottledFetcher;
        #[async_trait]
        impl Fetcher<String> for ThrottledFetcher {
            async fn fetch(&self, _key: &str) -> Result<String, FetchError> {
                Err(FetchError::http_with_retry_after(
                    429,
                    Duration::from_secs(5),
                    "slow down",
                ))
            }
        }
        let pipeline = LookupPipeline::new(
            Arc::new(ThrottledFetcher),
            Arc::new(InMemoryLookupCache::new()),
            fast_config(),
        )
        .unwrap();

        let handle = pipeline.cancel_handle();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            handle.cancel();
        });

        let started = Instant::now();
        let outcomes = pipeline.process(vec!["hot".to_string()], None).await.unwrap();
        // Returns when cancelled, not after the 5s Retry-After backoff.
        assert!(
            started.elapsed() < Duration::from_secs(1),
            "cancel took {:?}",
            started.elapsed()
        );
        assert_eq!(outcomes.len(), 1);
        assert!(matches!(&outcomes[0], LookupOutcome::Failure(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_panicked_worker_not_reported_as_cancelled() {
        struct PanickingFetcher;
        #[async_trait]
        impl Fetcher<String> for PanickingFetcher {
            async fn fetch(&self, _key: &str) -> Result<String, FetchError> {
                panic!("fetch blew up");
            }
        }
        let pipeline = LookupPipeline::new(
            Arc::new(PanickingFetcher),
            Arc::new(InMemoryLookupCache::new()),
            fast_config(),
        )
        .unwrap();
        let outcomes = pipeline.process(vec!["k".to_string()], None).await.unwrap();
        assert!(matches!(
            &outcomes[0],
            LookupOutcome::Failure(FetchError::Other(_))
        ));
        let stats = pipeline.stats().unwrap();
        assert_eq!(stats.final_failure_reasons.get("Cancelled"), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stats_serialize_to_json() {
        let fetcher = Arc::new(FlakyFetcher {
            fail_first: 0,
            calls: AtomicUsize::new(0),
        });
        let pipeline = LookupPipeline::new(
            fetcher,
            Arc::new(InMemoryLookupCache::new()),
            fast_config(),
        )
        .unwrap();
        pipeline
            .process(vec!["a".to_string()], None)
            .await
            .unwrap();

        let stats_json = serde_json::to_value(pipeline.stats().unwrap()).unwrap();
        assert_eq!(stats_json["total"], 1);
        assert_eq!(stats_json["successful"], 1);
        assert!(stats_json["elapsed"].is_number());

        let breaker_json = serde_json::to_value(pipeline.circuit_breaker_stats()).unwrap();
        assert_eq!(breaker_json["state"], "Closed");
        let limiter_json = serde_json::to_value(pipeline.rate_limiter_status()).unwrap();
        assert!(limiter_json["current_rate"].is_number());
    }

    #[tokio::test(start_paused = true)]
    async fn test_progress_fires_for_full_pass() {
        let fetcher = Arc::new(FlakyFetcher {
            fail_first: 0,
            calls: AtomicUsize::new(0),
        });
        let pipeline = LookupPipeline::new(
            fetcher,
            Arc::new(InMemoryLookupCache::new()),
            fast_config(),
        )
        .unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_cb = Arc::clone(&seen);
        let progress: ProgressCallback =
            Arc::new(move |done, total| seen_cb.lock().push((done, total)));
        let keys: Vec<String> = (0..5).map(|i| format!("key-{i}")).collect();
        pipeline.process(keys, Some(progress)).await.unwrap();
        let seen = seen.lock();
        assert_eq!(seen.len(), 5);
        assert_eq!(seen.last(), Some(&(5, 5)));
    }
}
