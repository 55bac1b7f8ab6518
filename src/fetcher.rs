// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! The injected fetch seam and per-key outcomes.
//!
//! The pipeline never talks to a provider directly; callers hand it a
//! [`Fetcher`] and the pipeline decides when and how often to call it. This
//! keeps the adaptive machinery independent of any HTTP client or provider
//! API.

use async_trait::async_trait;

use crate::error::FetchError;

/// A single metadata lookup against the upstream provider.
///
/// Implementations should surface "does not exist" as
/// [`FetchError::NotFound`] (or an HTTP 404) rather than inventing a sentinel
/// value; the pipeline maps it to [`LookupOutcome::NotFound`].
#[async_trait]
pub trait Fetcher<V>: Send + Sync
where
    V: Send,
{
    /// Fetches the value for `key`.
    async fn fetch(&self, key: &str) -> Result<V, FetchError>;
}

#[async_trait]
impl<V, F, Fut> Fetcher<V> for F
where
    V: Send,
    F: Fn(String) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = Result<V, FetchError>> + Send,
{
    async fn fetch(&self, key: &str) -> Result<V, FetchError> {
        (self)(key.to_string()).await
    }
}

/// Terminal result for one key in a batch.
#[derive(Debug, Clone, PartialEq)]
pub enum LookupOutcome<V> {
    /// The value was obtained.
    Success {
        /// The fetched (or cached) value.
        value: V,
        /// Whether the value came from the cache without a fetch.
        from_cache: bool,
    },
    /// The provider conclusively reported the key does not exist.
    NotFound,
    /// All attempts failed; the last error is attached.
    Failure(FetchError),
}

impl<V> LookupOutcome<V> {
    /// Whether this outcome carries a value.
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }

    /// The value, if this outcome carries one.
    #[must_use]
    pub fn value(&self) -> Option<&V> {
        match self {
            Self::Success { value, .. } => Some(value),
            _ => None,
        }
    }
}
