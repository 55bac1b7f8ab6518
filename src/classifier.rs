// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Failure classification.
//!
//! [`classify`] is a pure, deterministic mapping from a raw [`FetchError`] to
//! the remediation the pipeline should take. It has no side effects and no
//! state; everything that acts on a classification (retry queue, monitor,
//! circuit breaker) lives elsewhere.
//!
//! Unrecognized failures classify as retryable with a conservative base delay
//! rather than being dropped: an unknown error is more likely a transient
//! condition than a permanently broken request.

use std::time::Duration;

use crate::error::FetchError;

/// Fallback delay applied to HTTP 429 responses without a `Retry-After` header.
const DEFAULT_RATE_LIMIT_DELAY: Duration = Duration::from_secs(60);

/// What the pipeline should do about a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    /// Transient; retry with exponential backoff seeded from `base_delay`.
    Retryable {
        /// First-attempt backoff delay for this failure class.
        base_delay: Duration,
    },
    /// The request can never succeed as issued. Terminal.
    PermanentFailure,
    /// The provider asked us to slow down. Retry after `retry_after`.
    RateLimited {
        /// Provider-supplied wait, or `None` when the header was absent.
        retry_after: Option<Duration>,
    },
    /// System-level backpressure; not attributable to this request.
    CircuitBreakerOpen,
}

impl Classification {
    /// Whether the failure is worth re-queueing.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Classification::Retryable { .. }
                | Classification::RateLimited { .. }
                | Classification::CircuitBreakerOpen
        )
    }

    /// Stable human-readable label used in the failure-reason histogram.
    #[must_use]
    pub fn reason_label(&self) -> &'static str {
        match self {
            Classification::Retryable { .. } => "Transient Error",
            Classification::PermanentFailure => "Permanent Failure",
            Classification::RateLimited { .. } => "Rate Limited",
            Classification::CircuitBreakerOpen => "Circuit Breaker Open",
        }
    }

    /// The wait a rate-limited failure asks for, applying the 60s default
    /// when the provider sent none.
    #[must_use]
    pub fn rate_limit_delay(&self) -> Option<Duration> {
        match self {
            Classification::RateLimited { retry_after } => {
                Some(retry_after.unwrap_or(DEFAULT_RATE_LIMIT_DELAY))
            }
            _ => None,
        }
    }
}

/// Classify a raw fetch failure into its remediation class.
#[must_use]
pub fn classify(error: &FetchError) -> Classification {
    match error {
        FetchError::Timeout(_) => Classification::Retryable {
            base_delay: Duration::from_secs(2),
        },
        FetchError::Network(_) => Classification::Retryable {
            base_delay: Duration::from_secs(1),
        },
        FetchError::InvalidUrl(_)
        | FetchError::Decode(_)
        | FetchError::Authentication(_)
        | FetchError::NotFound
        | FetchError::Cancelled => Classification::PermanentFailure,
        FetchError::Http {
            status,
            retry_after,
            ..
        } => classify_status(*status, *retry_after),
        FetchError::CircuitOpen => Classification::CircuitBreakerOpen,
        FetchError::Other(_) => Classification::Retryable {
            base_delay: Duration::from_secs(3),
        },
    }
}

/// Status-code routing. Server-error ranges are checked before the generic
/// 4xx arm so 500-503/507-510 keep their shorter backoff.
fn classify_status(status: u16, retry_after: Option<Duration>) -> Classification {
    match status {
        429 => Classification::RateLimited { retry_after },
        500..=503 | 507..=510 => Classification::Retryable {
            base_delay: Duration::from_secs(2),
        },
        400..=499 => Classification::PermanentFailure,
        504..=599 => Classification::Retryable {
            base_delay: Duration::from_secs(5),
        },
        _ => Classification::Retryable {
            base_delay: Duration::from_secs(3),
        },
    }
}

/// Parse an HTTP `Retry-After` header value.
///
/// Only the delta-seconds form is supported; HTTP-date values return `None`
/// and callers fall back to the 60s default.
#[must_use]
pub fn parse_retry_after(value: &str) -> Option<Duration> {
    value.trim().parse::<u64>().ok().map(Duration::from_secs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_network_errors_are_retryable() {
        assert_eq!(
            classify(&FetchError::timeout("slow")),
            Classification::Retryable {
                base_delay: Duration::from_secs(2)
            }
        );
        assert_eq!(
            classify(&FetchError::network("connection refused")),
            Classification::Retryable {
                base_delay: Duration::from_secs(1)
            }
        );
    }

    #[test]
    fn test_malformed_and_auth_are_permanent() {
        assert_eq!(
            classify(&FetchError::invalid_url("bad scheme")),
            Classification::PermanentFailure
        );
        assert_eq!(
            classify(&FetchError::decode("truncated json")),
            Classification::PermanentFailure
        );
        assert_eq!(
            classify(&FetchError::authentication("key revoked")),
            Classification::PermanentFailure
        );
    }

    #[test]
    fn test_429_honors_retry_after() {
        let with_header = FetchError::http_with_retry_after(429, Duration::from_secs(7), "slow");
        let class = classify(&with_header);
        assert_eq!(
            class,
            Classification::RateLimited {
                retry_after: Some(Duration::from_secs(7))
            }
        );
        assert_eq!(class.rate_limit_delay(), Some(Duration::from_secs(7)));

        let without_header = FetchError::http(429, "slow");
        let class = classify(&without_header);
        assert_eq!(
            class,
            Classification::RateLimited { retry_after: None }
        );
        // Missing header falls back to the 60s default.
        assert_eq!(class.rate_limit_delay(), Some(Duration::from_secs(60)));
    }

    #[test]
    fn test_server_error_ranges() {
        for status in [500, 501, 502, 503, 507, 508, 509, 510] {
            assert_eq!(
                classify(&FetchError::http(status, "server")),
                Classification::Retryable {
                    base_delay: Duration::from_secs(2)
                },
                "status {status}"
            );
        }
        for status in [504, 505, 506, 511, 599] {
            assert_eq!(
                classify(&FetchError::http(status, "gateway")),
                Classification::Retryable {
                    base_delay: Duration::from_secs(5)
                },
                "status {status}"
            );
        }
    }

    #[test]
    fn test_other_4xx_is_permanent() {
        for status in [400, 401, 403, 410, 422, 451] {
            assert_eq!(
                classify(&FetchError::http(status, "client")),
                Classification::PermanentFailure,
                "status {status}"
            );
        }
    }

    #[test]
    fn test_unknown_errors_default_retryable() {
        assert_eq!(
            classify(&FetchError::other("mystery")),
            Classification::Retryable {
                base_delay: Duration::from_secs(3)
            }
        );
    }

    #[test]
    fn test_circuit_open_maps_to_its_own_class() {
        assert_eq!(
            classify(&FetchError::CircuitOpen),
            Classification::CircuitBreakerOpen
        );
    }

    #[test]
    fn test_classification_is_deterministic() {
        let err = FetchError::http(502, "bad gateway");
        assert_eq!(classify(&err), classify(&err));
    }

    #[test]
    fn test_reason_labels() {
        assert_eq!(
            Classification::PermanentFailure.reason_label(),
            "Permanent Failure"
        );
        assert_eq!(
            Classification::RateLimited { retry_after: None }.reason_label(),
            "Rate Limited"
        );
        assert_eq!(
            Classification::CircuitBreakerOpen.reason_label(),
            "Circuit Breaker Open"
        );
    }

    #[test]
    fn test_parse_retry_after() {
        assert_eq!(parse_retry_after("30"), Some(Duration::from_secs(30)));
        assert_eq!(parse_retry_after(" 5 "), Some(Duration::from_secs(5)));
        assert_eq!(parse_retry_after("Wed, 21 Oct 2026 07:28:00 GMT"), None);
        assert_eq!(parse_retry_after(""), None);
    }
}
