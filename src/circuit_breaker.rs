// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Circuit breaker for the upstream metadata dependency.
//!
//! A single breaker guards the whole pipeline rather than one per key: the
//! dependency is one service, and when it is unhealthy every retry against it
//! is wasted work. The retry queue consults [`CircuitBreaker::can_execute`]
//! before releasing anything.
//!
//! # States
//!
//! - **Closed**: normal operation, failures are counted.
//! - **Open**: fail fast; after `recovery_timeout` the next `can_execute`
//!   call transitions to half-open.
//! - **HalfOpen**: trial traffic is allowed; `half_open_success_threshold`
//!   consecutive successes close the circuit, any failure reopens it.

use parking_lot::Mutex;
use serde::Serialize;
use std::time::Duration;
use tokio::time::Instant;

/// The current state of the circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CircuitState {
    /// Normal operation; calls pass through.
    Closed,
    /// Tripped; calls fail fast until the recovery timeout elapses.
    Open,
    /// Trial traffic allowed to probe recovery.
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half-open"),
        }
    }
}

/// Configuration for the circuit breaker.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct CircuitBreakerConfig {
    /// Consecutive failures required to open the circuit (default: 5).
    pub failure_threshold: u32,
    /// Wait before an open circuit allows a trial request (default: 30s).
    pub recovery_timeout: Duration,
    /// Consecutive half-open successes required to close (default: 3).
    pub half_open_success_threshold: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(30),
            half_open_success_threshold: 3,
        }
    }
}

impl CircuitBreakerConfig {
    /// Creates a configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the number of consecutive failures required to open the circuit.
    #[must_use]
    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold.max(1);
        self
    }

    /// Sets the wait before an open circuit allows a trial request.
    #[must_use]
    pub fn with_recovery_timeout(mut self, timeout: Duration) -> Self {
        self.recovery_timeout = timeout;
        self
    }

    /// Sets the consecutive half-open successes required to close.
    #[must_use]
    pub fn with_half_open_success_threshold(mut self, threshold: u32) -> Self {
        self.half_open_success_threshold = threshold.max(1);
        self
    }
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    last_failure_at: Option<Instant>,
}

/// Three-state guard that fails fast when the dependency is unhealthy.
///
/// State lives behind a single mutex rather than scattered atomics because
/// [`can_execute`](Self::can_execute) must perform the open-to-half-open
/// transition atomically with its check.
#[derive(Debug)]
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerInner>,
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}

impl CircuitBreaker {
    /// Creates a new breaker in the closed state.
    #[must_use]
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                failure_count: 0,
                success_count: 0,
                last_failure_at: None,
            }),
        }
    }

    /// Returns whether a call may proceed right now.
    ///
    /// An open circuit whose recovery timeout has elapsed transitions to
    /// half-open as part of this call and returns `true`.
    pub fn can_execute(&self) -> bool {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => {
                let recovered = inner
                    .last_failure_at
                    .is_some_and(|at| at.elapsed() >= self.config.recovery_timeout);
                if recovered {
                    inner.state = CircuitState::HalfOpen;
                    inner.success_count = 0;
                    tracing::info!("circuit breaker half-open, allowing trial requests");
                }
                recovered
            }
        }
    }

    /// Records a successful call.
    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => {
                inner.failure_count = 0;
            }
            CircuitState::HalfOpen => {
                inner.success_count += 1;
                if inner.success_count >= self.config.half_open_success_threshold {
                    inner.state = CircuitState::Closed;
                    inner.failure_count = 0;
                    inner.success_count = 0;
                    tracing::info!("circuit breaker closed after successful trials");
                }
            }
            CircuitState::Open => {
                // Success while open means a caller bypassed can_execute.
                tracing::warn!("success recorded while circuit open; resetting to closed");
                inner.state = CircuitState::Closed;
                inner.failure_count = 0;
                inner.success_count = 0;
            }
        }
    }

    /// Records a failed call.
    pub fn record_failure(&self) {
        let mut inner = self.inner.lock();
        inner.failure_count += 1;
        inner.last_failure_at = Some(Instant::now());
        match inner.state {
            CircuitState::Closed => {
                if inner.failure_count >= self.config.failure_threshold {
                    inner.state = CircuitState::Open;
                    tracing::warn!(
                        failures = inner.failure_count,
                        "circuit breaker opened"
                    );
                }
            }
            CircuitState::HalfOpen => {
                // A single failed trial reopens immediately.
                inner.state = CircuitState::Open;
                inner.success_count = 0;
                tracing::warn!("trial request failed; circuit breaker reopened");
            }
            CircuitState::Open => {}
        }
    }

    /// Returns the current state without side effects.
    #[must_use]
    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    /// Returns the current consecutive failure count.
    #[must_use]
    pub fn failure_count(&self) -> u32 {
        self.inner.lock().failure_count
    }

    /// Returns a snapshot of the breaker for diagnostics.
    #[must_use]
    pub fn stats(&self) -> CircuitBreakerStats {
        let inner = self.inner.lock();
        CircuitBreakerStats {
            state: inner.state,
            failure_count: inner.failure_count,
            success_count: inner.success_count,
            failure_threshold: self.config.failure_threshold,
            half_open_success_threshold: self.config.half_open_success_threshold,
            recovery_timeout: self.config.recovery_timeout,
        }
    }
}

/// Point-in-time snapshot of breaker state.
#[derive(Debug, Clone, Serialize)]
pub struct CircuitBreakerStats {
    /// Current state.
    pub state: CircuitState,
    /// Consecutive failures recorded.
    pub failure_count: u32,
    /// Consecutive half-open successes recorded.
    pub success_count: u32,
    /// Configured failure threshold.
    pub failure_threshold: u32,
    /// Configured half-open success threshold.
    pub half_open_success_threshold: u32,
    /// Configured recovery timeout.
    #[serde(with = "crate::serde_duration")]
    pub recovery_timeout: Duration,
}
