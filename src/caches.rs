// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Cache layer for lookup results.
//!
//! The pipeline consults the cache before every fetch and writes back every
//! success. The trait is async because real deployments back it with a
//! database or a network store; the bundled in-memory implementation serves
//! tests and single-process use.

use std::collections::HashMap;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::RwLock;

/// A failure inside the cache layer.
#[derive(Debug, Error)]
#[error("cache operation failed: {0}")]
pub struct CacheError(pub String);

impl CacheError {
    /// Create a cache error.
    pub fn new<S: Into<String>>(msg: S) -> Self {
        Self(msg.into())
    }
}

/// Async key-value cache for lookup results.
#[async_trait]
pub trait LookupCache<V>: Send + Sync
where
    V: Clone + Send + Sync,
{
    /// Returns the cached value for `key`, if present.
    async fn get(&self, key: &str) -> Result<Option<V>, CacheError>;

    /// Stores `value` under `key`, replacing any existing entry.
    async fn put(&self, key: &str, value: V) -> Result<(), CacheError>;

    /// Removes all entries.
    async fn clear(&self) -> Result<(), CacheError>;
}

/// In-memory [`LookupCache`] backed by a `HashMap`.
#[derive(Debug, Default)]
pub struct InMemoryLookupCache<V> {
    entries: RwLock<HashMap<String, V>>,
}

impl<V> InMemoryLookupCache<V> {
    /// Creates an empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Number of cached entries.
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    /// Whether the cache holds no entries.
    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

#[async_trait]
impl<V> LookupCache<V> for InMemoryLookupCache<V>
where
    V: Clone + Send + Sync,
{
    async fn get(&self, key: &str) -> Result<Option<V>, CacheError> {
        Ok(self.entries.read().await.get(key).cloned())
    }

    async fn put(&self, key: &str, value: V) -> Result<(), CacheError> {
        self.entries.write().await.insert(key.to_string(), value);
        Ok(())
    }

    async fn clear(&self) -> Result<(), CacheError> {
        self.entries.write().await.clear();
        Ok(())
    }
}
