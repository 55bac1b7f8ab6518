// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Bounded-concurrency dispatch of a set of lookups.
//!
//! [`LookupQueue::run`] drives one pass over a list of keyed items: cache
//! check, rate-limited fetch, telemetry feedback. Concurrency is bounded by
//! the [`PerformanceMonitor`]'s current recommendation and re-read on every
//! dispatch, so the pool grows and shrinks mid-batch as the recommendation
//! moves. A fixed ceiling can be supplied instead for retry rounds.
//!
//! Workers are spawned into a [`JoinSet`] one per item rather than behind a
//! semaphore: a semaphore's permit count is fixed at construction, and the
//! whole point here is a limit that changes while the batch runs.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::Notify;
use tokio::task::JoinSet;
use tokio::time::Instant;

use crate::caches::LookupCache;
use crate::classifier::{classify, Classification};
use crate::error::{FetchError, PipelineError};
use crate::fetcher::{Fetcher, LookupOutcome};
use crate::performance::PerformanceMonitor;
use crate::rate_limiter::AdaptiveRateLimiter;

/// Progress callback: `(completed, total)` after each item settles.
pub type ProgressCallback = Arc<dyn Fn(usize, usize) + Send + Sync>;

/// Cooperative cancellation flag shared with a running batch.
///
/// Cancellation is best-effort: items already dispatched may still complete,
/// items not yet dispatched are skipped.
#[derive(Debug, Clone, Default)]
pub struct CancelHandle {
    flag: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl CancelHandle {
    /// Creates a fresh, uncancelled handle.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation and wakes anything waiting in
    /// [`cancelled`](Self::cancelled).
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    /// Whether cancellation has been requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Resolves once cancellation is requested.
    ///
    /// Lets long sleeps race the cancel signal instead of polling the flag.
    pub async fn cancelled(&self) {
        loop {
            if self.is_cancelled() {
                return;
            }
            let notified = self.notify.notified();
            // The flag may have flipped between the check above and
            // registering the waiter.
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }

    /// Clears the flag so the handle can gate another batch.
    pub fn reset(&self) {
        self.flag.store(false, Ordering::SeqCst);
    }
}

/// Concurrency bounds for the worker pool.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct LookupQueueConfig {
    /// Workers always allowed (default: 3).
    pub min_concurrency: usize,
    /// Workers never exceeded (default: 8).
    pub max_concurrency: usize,
}

impl Default for LookupQueueConfig {
    fn default() -> Self {
        Self {
            min_concurrency: 3,
            max_concurrency: 8,
        }
    }
}

/// One item handed to [`LookupQueue::run`]: the key and its slot in the
/// caller's batch.
pub type QueueItem = (String, usize);

/// A settled item: original slot, key, outcome.
pub type QueueResult<V> = (usize, String, LookupOutcome<V>);

/// Worker pool that executes lookups under the adaptive controls.
pub struct LookupQueue<V> {
    fetcher: Arc<dyn Fetcher<V>>,
    cache: Arc<dyn LookupCache<V>>,
    limiter: Arc<AdaptiveRateLimiter>,
    monitor: Arc<PerformanceMonitor>,
    cancel: CancelHandle,
    config: LookupQueueConfig,
    in_flight: Arc<AtomicUsize>,
}

impl<V> LookupQueue<V>
where
    V: Clone + Send + Sync + 'static,
{
    /// Creates a queue wiring the shared components together.
    pub fn new(
        fetcher: Arc<dyn Fetcher<V>>,
        cache: Arc<dyn LookupCache<V>>,
        limiter: Arc<AdaptiveRateLimiter>,
        monitor: Arc<PerformanceMonitor>,
        cancel: CancelHandle,
        config: LookupQueueConfig,
    ) -> Self {
        Self {
            fetcher,
            cache,
            limiter,
            monitor,
            cancel,
            config,
            in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Runs one pass over `items` and returns a settled result per item.
    ///
    /// `ceiling`, when given, replaces the monitor's recommendation as the
    /// concurrency limit for this pass. The only fatal error is an unusable
    /// cache; per-key fetch failures come back as
    /// [`LookupOutcome::Failure`] entries.
    pub async fn run(
        &self,
        items: Vec<QueueItem>,
        ceiling: Option<usize>,
        progress: Option<ProgressCallback>,
    ) -> Result<Vec<QueueResult<V>>, PipelineError> {
        let total = items.len();
        let mut pending = items.into_iter();
        let mut next_item = pending.next();
        let mut results: Vec<QueueResult<V>> = Vec::with_capacity(total);
        let mut workers: JoinSet<Result<QueueResult<V>, PipelineError>> = JoinSet::new();
        let mut completed = 0usize;

        loop {
            self.monitor.maybe_adjust();
            let limit = ceiling
                .unwrap_or_else(|| self.monitor.recommended_concurrency())
                .clamp(self.config.min_concurrency, self.config.max_concurrency);

            while next_item.is_some() && workers.len() < limit {
                if self.cancel.is_cancelled() {
                    // Skip everything not yet dispatched.
                    while let Some((key, index)) = next_item.take() {
                        results.push((index, key, LookupOutcome::Failure(FetchError::Cancelled)));
                        next_item = pending.next();
                    }
                    break;
                }
                let (key, index) = match next_item.take() {
                    Some(item) => item,
                    None => break,
                };
                next_item = pending.next();
                let worker = Worker {
                    fetcher: Arc::clone(&self.fetcher),
                    cache: Arc::clone(&self.cache),
                    limiter: Arc::clone(&self.limiter),
                    monitor: Arc::clone(&self.monitor),
                    cancel: self.cancel.clone(),
                    in_flight: Arc::clone(&self.in_flight),
                };
                workers.spawn(async move { worker.lookup_one(key, index).await });
            }

            let Some(joined) = workers.join_next().await else {
                break;
            };
            match joined {
                Ok(Ok(result)) => {
                    completed += 1;
                    if let Some(ref cb) = progress {
                        cb(completed, total);
                    }
                    results.push(result);
                }
                Ok(Err(fatal)) => {
                    workers.shutdown().await;
                    return Err(fatal);
                }
                Err(join_err) => {
                    // A panicked worker loses its slot; the orchestrator
                    // reports the missing key as failed.
                    tracing::warn!(error = %join_err, "lookup worker panicked");
                    completed += 1;
                }
            }
        }

        Ok(results)
    }

    /// The cancellation handle gating this queue.
    #[must_use]
    pub fn cancel_handle(&self) -> &CancelHandle {
        &self.cancel
    }
}

/// Per-task clone of the shared components.
struct Worker<V> {
    fetcher: Arc<dyn Fetcher<V>>,
    cache: Arc<dyn LookupCache<V>>,
    limiter: Arc<AdaptiveRateLimiter>,
    monitor: Arc<PerformanceMonitor>,
    cancel: CancelHandle,
    in_flight: Arc<AtomicUsize>,
}

impl<V> Worker<V>
where
    V: Clone + Send + Sync + 'static,
{
    async fn lookup_one(
        self,
        key: String,
        index: usize,
    ) -> Result<QueueResult<V>, PipelineError> {
        // Cache hits bypass the limiter and the monitor entirely.
        match self.cache.get(&key).await {
            Ok(Some(value)) => {
                return Ok((
                    index,
                    key,
                    LookupOutcome::Success {
                        value,
                        from_cache: true,
                    },
                ));
            }
            Ok(None) => {}
            Err(err) => {
                return Err(PipelineError::Cache(err.to_string()));
            }
        }

        if self.cancel.is_cancelled() {
            return Ok((index, key, LookupOutcome::Failure(FetchError::Cancelled)));
        }

        self.limiter.wait_for_permission().await;

        let depth = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.monitor.update_queue_depth(depth);
        let started = Instant::now();
        let fetched = self.fetcher.fetch(&key).await;
        let elapsed = started.elapsed();
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        let outcome = match fetched {
            Ok(value) => {
                self.monitor.record_success(elapsed);
                if let Err(err) = self.cache.put(&key, value.clone()).await {
                    // A write-back failure costs a future cache hit, nothing
                    // more; the value is already in hand.
                    tracing::warn!(key, error = %err, "cache write-back failed");
                }
                LookupOutcome::Success {
                    value,
                    from_cache: false,
                }
            }
            Err(err) if err.is_not_found() => {
                // A conclusive 404 is a healthy answer from the provider.
                self.monitor.record_success(elapsed);
                LookupOutcome::NotFound
            }
            Err(err) => {
                let is_throttled =
                    matches!(classify(&err), Classification::RateLimited { .. });
                self.monitor.record_failure(Some(elapsed), is_throttled);
                LookupOutcome::Failure(err)
            }
        };

        let metrics = self.monitor.metrics();
        self.limiter
            .adapt_rate(metrics.window_success_rate, metrics.window_avg_response_time);

        Ok((index, key, outcome))
    }
}
