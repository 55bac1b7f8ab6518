// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Rolling-window performance telemetry and concurrency recommendation.
//!
//! The monitor keeps small ring buffers of recent response times and
//! success/failure outcomes, and periodically converts them into a
//! recommended concurrency level for the worker pool. Adjustments are
//! self-gated: callers invoke [`PerformanceMonitor::maybe_adjust`] as often
//! as they like and the monitor ignores calls inside the cadence window or
//! without enough samples.

use std::collections::VecDeque;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::time::Instant;

/// Configuration for the performance monitor.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct PerformanceMonitorConfig {
    /// Ring buffer capacity for recent samples (default: 20).
    pub window_size: usize,
    /// Concurrency floor (default: 3).
    pub min_concurrency: usize,
    /// Concurrency ceiling (default: 8).
    pub max_concurrency: usize,
    /// Fraction of the gap to a bound closed per adjustment (default: 0.3).
    pub adjustment_sensitivity: f64,
    /// Success rate treated as fully healthy (default: 0.95).
    pub target_success_rate: f64,
    /// Response time treated as fully healthy (default: 1s).
    pub target_response_time: Duration,
    /// Minimum time between adjustments (default: 5s).
    pub adjustment_interval: Duration,
    /// Samples required before the first adjustment (default: 10).
    pub min_samples: usize,
}

impl Default for PerformanceMonitorConfig {
    fn default() -> Self {
        Self {
            window_size: 20,
            min_concurrency: 3,
            max_concurrency: 8,
            adjustment_sensitivity: 0.3,
            target_success_rate: 0.95,
            target_response_time: Duration::from_secs(1),
            adjustment_interval: Duration::from_secs(5),
            min_samples: 10,
        }
    }
}

impl PerformanceMonitorConfig {
    /// Creates a configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the concurrency bounds.
    #[must_use]
    pub fn with_concurrency_bounds(mut self, min: usize, max: usize) -> Self {
        self.min_concurrency = min.max(1);
        self.max_concurrency = max.max(self.min_concurrency);
        self
    }

    /// Sets the minimum time between adjustments.
    #[must_use]
    pub fn with_adjustment_interval(mut self, interval: Duration) -> Self {
        self.adjustment_interval = interval;
        self
    }

    /// Sets the samples required before the first adjustment.
    #[must_use]
    pub fn with_min_samples(mut self, samples: usize) -> Self {
        self.min_samples = samples;
        self
    }
}

#[derive(Debug)]
struct MonitorInner {
    response_times: VecDeque<Duration>,
    outcomes: VecDeque<bool>,
    total_requests: u64,
    total_successes: u64,
    total_failures: u64,
    total_throttled: u64,
    throttled_since_adjust: u64,
    queue_depth_avg: f64,
    queue_depth_samples: u64,
    peak_concurrency: usize,
    recommended_concurrency: usize,
    last_adjustment: Instant,
}

/// Sliding-window health tracker that recommends a concurrency level.
#[derive(Debug)]
pub struct PerformanceMonitor {
    config: PerformanceMonitorConfig,
    inner: Mutex<MonitorInner>,
}

impl Default for PerformanceMonitor {
    fn default() -> Self {
        Self::new(PerformanceMonitorConfig::default())
    }
}

impl PerformanceMonitor {
    /// Creates a monitor recommending the configured minimum concurrency.
    ///
    /// Starting at the floor means a cold pipeline ramps up only after it has
    /// seen evidence the provider is healthy.
    #[must_use]
    pub fn new(config: PerformanceMonitorConfig) -> Self {
        let recommended = config.min_concurrency;
        Self {
            config,
            inner: Mutex::new(MonitorInner {
                response_times: VecDeque::new(),
                outcomes: VecDeque::new(),
                total_requests: 0,
                total_successes: 0,
                total_failures: 0,
                total_throttled: 0,
                throttled_since_adjust: 0,
                queue_depth_avg: 0.0,
                queue_depth_samples: 0,
                peak_concurrency: 0,
                recommended_concurrency: recommended,
                last_adjustment: Instant::now(),
            }),
        }
    }

    /// Records a successful lookup and its response time.
    pub fn record_success(&self, response_time: Duration) {
        let mut inner = self.inner.lock();
        push_capped(&mut inner.response_times, response_time, self.config.window_size);
        push_capped(&mut inner.outcomes, true, self.config.window_size);
        inner.total_requests += 1;
        inner.total_successes += 1;
    }

    /// Records a failed lookup.
    ///
    /// A response time is recorded when the failure produced one (an HTTP
    /// error still measures the round trip; a connect failure may not).
    /// `is_throttled` marks rate-limit failures, which feed the concurrency
    /// penalty.
    pub fn record_failure(&self, response_time: Option<Duration>, is_throttled: bool) {
        let mut inner = self.inner.lock();
        if let Some(rt) = response_time {
            push_capped(&mut inner.response_times, rt, self.config.window_size);
        }
        push_capped(&mut inner.outcomes, false, self.config.window_size);
        inner.total_requests += 1;
        inner.total_failures += 1;
        if is_throttled {
            inner.total_throttled += 1;
            inner.throttled_since_adjust += 1;
        }
    }

    /// Records the current number of in-flight lookups.
    pub fn update_queue_depth(&self, depth: usize) {
        let mut inner = self.inner.lock();
        inner.queue_depth_samples += 1;
        let n = inner.queue_depth_samples as f64;
        inner.queue_depth_avg += (depth as f64 - inner.queue_depth_avg) / n;
        inner.peak_concurrency = inner.peak_concurrency.max(depth);
    }

    /// Recomputes the recommendation if the cadence window has elapsed and
    /// enough samples exist. Safe to call on every dispatch.
    pub fn maybe_adjust(&self) {
        let mut inner = self.inner.lock();
        if inner.last_adjustment.elapsed() < self.config.adjustment_interval {
            return;
        }
        if inner.outcomes.len() < self.config.min_samples {
            return;
        }

        let success_rate = window_success_rate(&inner.outcomes);
        let avg_rt = window_avg_response_time(&inner.response_times);
        let success_factor = (success_rate / self.config.target_success_rate).min(1.0);
        let response_factor = (self.config.target_response_time.as_secs_f64()
            / avg_rt.as_secs_f64().max(f64::EPSILON))
        .min(1.0);
        let score = 0.7 * success_factor + 0.3 * response_factor;

        let current = inner.recommended_concurrency as f64;
        let min = self.config.min_concurrency as f64;
        let max = self.config.max_concurrency as f64;
        let mut next = current;
        if score > 0.95 {
            next += ((max - current) * self.config.adjustment_sensitivity).ceil();
        } else if score < 0.8 {
            next -= ((current - min) * self.config.adjustment_sensitivity).ceil();
        }

        // Recent throttling pushes concurrency down regardless of the score.
        let penalty = ((inner.throttled_since_adjust as f64) / 5.0).min(2.0);
        next -= penalty;

        let clamped = next.clamp(min, max).round() as usize;
        if clamped != inner.recommended_concurrency {
            tracing::debug!(
                score = format!("{score:.3}"),
                from = inner.recommended_concurrency,
                to = clamped,
                throttled = inner.throttled_since_adjust,
                "concurrency recommendation adjusted"
            );
        }
        inner.recommended_concurrency = clamped;
        inner.throttled_since_adjust = 0;
        inner.last_adjustment = Instant::now();
    }

    /// The current recommended concurrency level.
    #[must_use]
    pub fn recommended_concurrency(&self) -> usize {
        self.inner.lock().recommended_concurrency
    }

    /// Snapshot of the monitor's cumulative and windowed metrics.
    #[must_use]
    pub fn metrics(&self) -> PerformanceMetrics {
        let inner = self.inner.lock();
        PerformanceMetrics {
            total_requests: inner.total_requests,
            total_successes: inner.total_successes,
            total_failures: inner.total_failures,
            total_throttled: inner.total_throttled,
            window_success_rate: window_success_rate(&inner.outcomes),
            window_avg_response_time: window_avg_response_time(&inner.response_times),
            avg_queue_depth: inner.queue_depth_avg,
            peak_concurrency: inner.peak_concurrency,
            recommended_concurrency: inner.recommended_concurrency,
        }
    }

    /// Clears all samples and counters and returns the recommendation to the
    /// configured minimum.
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.response_times.clear();
        inner.outcomes.clear();
        inner.total_requests = 0;
        inner.total_successes = 0;
        inner.total_failures = 0;
        inner.total_throttled = 0;
        inner.throttled_since_adjust = 0;
        inner.queue_depth_avg = 0.0;
        inner.queue_depth_samples = 0;
        inner.peak_concurrency = 0;
        inner.recommended_concurrency = self.config.min_concurrency;
        inner.last_adjustment = Instant::now();
    }
}

fn push_capped<T>(buf: &mut VecDeque<T>, value: T, cap: usize) {
    if buf.len() == cap {
        buf.pop_front();
    }
    buf.push_back(value);
}

fn window_success_rate(outcomes: &VecDeque<bool>) -> f64 {
    if outcomes.is_empty() {
        return 1.0;
    }
    outcomes.iter().filter(|&&ok| ok).count() as f64 / outcomes.len() as f64
}

fn window_avg_response_time(times: &VecDeque<Duration>) -> Duration {
    if times.is_empty() {
        return Duration::ZERO;
    }
    times.iter().sum::<Duration>() / times.len() as u32
}

/// Point-in-time metrics snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct PerformanceMetrics {
    /// Lookups recorded since creation or the last reset.
    pub total_requests: u64,
    /// Successful lookups recorded.
    pub total_successes: u64,
    /// Failed lookups recorded.
    pub total_failures: u64,
    /// Rate-limited failures recorded.
    pub total_throttled: u64,
    /// Success rate over the sample window.
    pub window_success_rate: f64,
    /// Mean response time over the sample window.
    #[serde(with = "crate::serde_duration")]
    pub window_avg_response_time: Duration,
    /// Running average of in-flight depth samples.
    pub avg_queue_depth: f64,
    /// Highest in-flight depth observed.
    pub peak_concurrency: usize,
    /// Current recommendation.
    pub recommended_concurrency: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn eager_config() -> PerformanceMonitorConfig {
        PerformanceMonitorConfig::new()
            .with_adjustment_interval(Duration::from_millis(0))
            .with_min_samples(1)
    }

    #[test]
    fn test_starts_at_min_concurrency() {
        let monitor = PerformanceMonitor::default();
        assert_eq!(monitor.recommended_concurrency(), 3);
    }

    #[test]
    fn test_window_evicts_oldest() {
        let monitor = PerformanceMonitor::default();
        for _ in 0..20 {
            monitor.record_failure(None, false);
        }
        for _ in 0..20 {
            monitor.record_success(Duration::from_millis(100));
        }
        let metrics = monitor.metrics();
        // Window holds only the 20 successes; lifetime totals keep both.
        assert!((metrics.window_success_rate - 1.0).abs() < 1e-9);
        assert_eq!(metrics.total_requests, 40);
        assert_eq!(metrics.total_failures, 20);
    }

    #[tokio::test(start_paused = true)]
    async fn test_healthy_window_raises_recommendation() {
        let monitor = PerformanceMonitor::new(eager_config());
        for _ in 0..10 {
            monitor.record_success(Duration::from_millis(200));
        }
        tokio::time::advance(Duration::from_millis(1)).await;
        monitor.maybe_adjust();
        // 3 + ceil((8 - 3) * 0.3) = 5.
        assert_eq!(monitor.recommended_concurrency(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unhealthy_window_lowers_recommendation() {
        let monitor = PerformanceMonitor::new(eager_config());
        for _ in 0..10 {
            monitor.record_success(Duration::from_millis(200));
        }
        tokio::time::advance(Duration::from_millis(1)).await;
        monitor.maybe_adjust();
        assert_eq!(monitor.recommended_concurrency(), 5);

        for _ in 0..20 {
            monitor.record_failure(Some(Duration::from_secs(4)), false);
        }
        tokio::time::advance(Duration::from_millis(1)).await;
        monitor.maybe_adjust();
        // 5 - ceil((5 - 3) * 0.3) = 4.
        assert_eq!(monitor.recommended_concurrency(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_throttle_penalty_applies_and_clears() {
        let monitor = PerformanceMonitor::new(eager_config());
        for _ in 0..5 {
            monitor.record_success(Duration::from_millis(200));
        }
        for _ in 0..10 {
            monitor.record_failure(Some(Duration::from_millis(200)), true);
        }
        tokio::time::advance(Duration::from_millis(1)).await;
        monitor.maybe_adjust();
        // Penalty min(10/5, 2) = 2 pushes the recommendation to the floor.
        assert_eq!(monitor.recommended_concurrency(), 3);

        // Throttle counter resets after each adjustment; a healthy window
        // afterwards is free to climb.
        for _ in 0..20 {
            monitor.record_success(Duration::from_millis(200));
        }
        tokio::time::advance(Duration::from_millis(1)).await;
        monitor.maybe_adjust();
        assert_eq!(monitor.recommended_concurrency(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_adjustment_gated_on_cadence_and_samples() {
        let monitor = PerformanceMonitor::new(
            PerformanceMonitorConfig::new()
                .with_adjustment_interval(Duration::from_secs(5))
                .with_min_samples(10),
        );
        for _ in 0..10 {
            monitor.record_success(Duration::from_millis(100));
        }
        // Inside the cadence window: no change.
        monitor.maybe_adjust();
        assert_eq!(monitor.recommended_concurrency(), 3);

        tokio::time::advance(Duration::from_secs(5)).await;
        monitor.maybe_adjust();
        assert_eq!(monitor.recommended_concurrency(), 5);

        // Too few samples: no change even after the interval.
        monitor.reset();
        monitor.record_success(Duration::from_millis(100));
        tokio::time::advance(Duration::from_secs(5)).await;
        monitor.maybe_adjust();
        assert_eq!(monitor.recommended_concurrency(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_recommendation_ramps_monotonically_to_ceiling() {
        let monitor = PerformanceMonitor::default();
        let mut seen = vec![monitor.recommended_concurrency()];
        for _ in 0..8 {
            for _ in 0..20 {
                monitor.record_success(Duration::from_millis(200));
            }
            tokio::time::advance(Duration::from_secs(5)).await;
            monitor.maybe_adjust();
            seen.push(monitor.recommended_concurrency());
        }
        // A consistently healthy window only ever raises the
        // recommendation, and never past the configured maximum.
        assert!(seen.windows(2).all(|w| w[0] <= w[1]), "sequence {seen:?}");
        assert!(seen.iter().all(|&c| c <= 8), "sequence {seen:?}");
        assert_eq!(*seen.last().unwrap(), 8);
    }

    #[test]
    fn test_queue_depth_running_average_and_peak() {
        let monitor = PerformanceMonitor::default();
        monitor.update_queue_depth(2);
        monitor.update_queue_depth(4);
        monitor.update_queue_depth(6);
        let metrics = monitor.metrics();
        assert!((metrics.avg_queue_depth - 4.0).abs() < 1e-9);
        assert_eq!(metrics.peak_concurrency, 6);
    }

    #[test]
    fn test_reset_returns_to_initial_state() {
        let monitor = PerformanceMonitor::default();
        monitor.record_success(Duration::from_millis(100));
        monitor.record_failure(None, true);
        monitor.update_queue_depth(5);
        monitor.reset();
        let metrics = monitor.metrics();
        assert_eq!(metrics.total_requests, 0);
        assert_eq!(metrics.peak_concurrency, 0);
        assert_eq!(metrics.recommended_concurrency, 3);
    }
}
