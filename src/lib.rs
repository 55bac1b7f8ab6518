// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! fetchflow: adaptive concurrent lookup pipeline.
//!
//! Batch metadata enrichment against a rate-limited provider: hand the
//! pipeline a list of keys and an async [`Fetcher`], and it returns one
//! outcome per key while adapting its request rate and concurrency to the
//! provider's observed health.
//!
//! The moving parts:
//!
//! - [`AdaptiveRateLimiter`]: token bucket whose rate follows provider health
//! - [`CircuitBreaker`]: fails fast when the provider is down
//! - [`RetryQueue`]: exponential backoff with jitter for transient failures
//! - [`PerformanceMonitor`]: rolling-window telemetry driving concurrency
//! - [`LookupQueue`]: bounded worker pool with a live concurrency ceiling
//! - [`LookupPipeline`]: batch orchestration across full pass, retry rounds,
//!   and settlement
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use fetchflow::{
//!     FetchError, InMemoryLookupCache, LookupOutcome, LookupPipeline,
//! };
//!
//! # async fn run() -> fetchflow::Result<()> {
//! let fetcher = |key: String| async move {
//!     Ok::<_, FetchError>(format!("metadata for {key}"))
//! };
//! let pipeline = LookupPipeline::<String>::with_defaults(
//!     Arc::new(fetcher),
//!     Arc::new(InMemoryLookupCache::new()),
//! )?;
//!
//! let keys = vec!["alpha".to_string(), "beta".to_string()];
//! let outcomes = pipeline.process(keys, None).await?;
//! for outcome in &outcomes {
//!     if let LookupOutcome::Success { value, .. } = outcome {
//!         println!("{value}");
//!     }
//! }
//! # Ok(())
//! # }
//! ```

pub mod caches;
pub mod circuit_breaker;
pub mod classifier;
pub mod error;
pub mod fetcher;
pub mod lookup_queue;
pub mod performance;
pub mod pipeline;
pub mod rate_limiter;
pub mod retry_queue;

pub use caches::{CacheError, InMemoryLookupCache, LookupCache};
pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerStats, CircuitState,
};
pub use classifier::{classify, parse_retry_after, Classification};
pub use error::{FetchError, PipelineError, Result};
pub use fetcher::{Fetcher, LookupOutcome};
pub use lookup_queue::{
    CancelHandle, LookupQueue, LookupQueueConfig, ProgressCallback, QueueItem, QueueResult,
};
pub use performance::{PerformanceMetrics, PerformanceMonitor, PerformanceMonitorConfig};
pub use pipeline::{LookupPipeline, LookupStats, PipelineConfig};
pub use rate_limiter::{
    AdaptiveRateLimiter, RateLimiterConfig, RateLimiterConfigError, RateLimiterStatus,
};
pub use retry_queue::{RetryDecision, RetryQueue, RetryQueueConfig, RetryRequest, RetryStats};

/// Serializes `Duration` fields as fractional seconds.
pub(crate) mod serde_duration {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }
}
