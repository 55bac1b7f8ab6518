// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Error types for fetchflow operations.
//!
//! Two error types live here with very different audiences:
//!
//! - [`FetchError`] is the raw failure produced by the injected
//!   [`Fetcher`](crate::fetcher::Fetcher). It carries enough structure (HTTP
//!   status, `Retry-After`) for the [`classifier`](crate::classifier) to route
//!   it to the right remediation. Individual key failures are data, not
//!   errors: they travel inside [`LookupOutcome`](crate::fetcher::LookupOutcome)
//!   and never abort a batch.
//! - [`PipelineError`] is fatal: it is returned from
//!   [`LookupPipeline::process`](crate::pipeline::LookupPipeline::process)
//!   only when the pipeline itself cannot run (unusable cache layer, invalid
//!   configuration).

use std::time::Duration;

use thiserror::Error;

/// Result type alias for pipeline-level operations.
pub type Result<T, E = PipelineError> = std::result::Result<T, E>;

/// A failure reported by the underlying metadata fetch.
///
/// Variants map onto the remediation taxonomy: transient network conditions,
/// malformed requests/responses, HTTP status failures, and the two synthetic
/// conditions the pipeline itself produces (`CircuitOpen`, `Cancelled`).
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    /// The request did not complete in time. Retryable.
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// Connection refused, DNS failure, reset, or another transient
    /// network condition. Retryable.
    #[error("Network error: {0}")]
    Network(String),

    /// The request URL could not be built. Not retryable.
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    /// The response body could not be decoded. Not retryable.
    #[error("Response decode error: {0}")]
    Decode(String),

    /// Credentials were rejected. Not retryable - fix the key, not the request.
    #[error("Authentication error: {0}")]
    Authentication(String),

    /// A non-success HTTP status. `retry_after` carries a parsed
    /// `Retry-After` header when the server sent one.
    #[error("HTTP {status}: {message}")]
    Http {
        /// HTTP status code.
        status: u16,
        /// Parsed `Retry-After` header, if present.
        retry_after: Option<Duration>,
        /// Response status line or body excerpt.
        message: String,
    },

    /// The key does not exist upstream. Terminal, never retried.
    #[error("not found")]
    NotFound,

    /// Synthesized when retries were abandoned because the circuit breaker
    /// stayed open. Not attributable to the individual request.
    #[error("circuit breaker is open")]
    CircuitOpen,

    /// Synthesized for keys that were never dispatched because the batch was
    /// cancelled.
    #[error("lookup cancelled")]
    Cancelled,

    /// Anything else. Classified conservatively as retryable.
    #[error("{0}")]
    Other(String),
}

impl FetchError {
    /// Create a timeout error.
    pub fn timeout<S: Into<String>>(msg: S) -> Self {
        Self::Timeout(msg.into())
    }

    /// Create a network error.
    pub fn network<S: Into<String>>(msg: S) -> Self {
        Self::Network(msg.into())
    }

    /// Create an invalid-URL error.
    pub fn invalid_url<S: Into<String>>(msg: S) -> Self {
        Self::InvalidUrl(msg.into())
    }

    /// Create a response-decode error.
    pub fn decode<S: Into<String>>(msg: S) -> Self {
        Self::Decode(msg.into())
    }

    /// Create an authentication error.
    pub fn authentication<S: Into<String>>(msg: S) -> Self {
        Self::Authentication(msg.into())
    }

    /// Create an HTTP status error without a `Retry-After` header.
    pub fn http<S: Into<String>>(status: u16, msg: S) -> Self {
        Self::Http {
            status,
            retry_after: None,
            message: msg.into(),
        }
    }

    /// Create an HTTP status error carrying a parsed `Retry-After` header.
    pub fn http_with_retry_after<S: Into<String>>(
        status: u16,
        retry_after: Duration,
        msg: S,
    ) -> Self {
        Self::Http {
            status,
            retry_after: Some(retry_after),
            message: msg.into(),
        }
    }

    /// Create a generic error.
    pub fn other<S: Into<String>>(msg: S) -> Self {
        Self::Other(msg.into())
    }

    /// The HTTP status code, if this failure carries one.
    #[must_use]
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Http { status, .. } => Some(*status),
            Self::NotFound => Some(404),
            _ => None,
        }
    }

    /// Whether this failure means "the key does not exist upstream".
    ///
    /// Covers both the explicit [`FetchError::NotFound`] variant and a plain
    /// HTTP 404, so fetchers may surface either.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound) || matches!(self, Self::Http { status: 404, .. })
    }
}

/// Fatal error for the pipeline itself.
///
/// Per-key failures never produce this; they are reported through
/// [`LookupOutcome::Failure`](crate::fetcher::LookupOutcome) and the batch
/// statistics instead.
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum PipelineError {
    /// The cache layer is unusable; the batch cannot run.
    #[error("Cache error: {0}")]
    Cache(String),

    /// A component was configured with nonsensical values.
    #[error("Configuration error: {0}")]
    Configuration(String),
}
