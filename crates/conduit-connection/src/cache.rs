//! Result cache for adapter queries
//!
//! Entries are keyed by the JSON encoding of the query arguments together
//! with the TTL, so the same statement cached under two TTLs is two entries.
//! Only successful results are stored. Concurrent misses for the same key
//! are not coalesced; each one runs the query.

use conduit_core::Result;
use dashmap::DashMap;
use serde::Serialize;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

struct CacheEntry<V> {
    value: V,
    expires_at: Option<Instant>,
}

impl<V> CacheEntry<V> {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| now >= at)
    }
}

/// Hit and miss counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
}

/// Concurrent TTL cache of query results
pub struct QueryCache<V> {
    entries: DashMap<String, CacheEntry<V>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl<V: Clone> QueryCache<V> {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Cached value for `key` and `ttl`, or the result of `compute` on a miss.
    ///
    /// A `ttl` of `None` caches indefinitely. Errors from `compute` are
    /// returned and not cached.
    pub async fn get_or_try_insert_with<K, F, Fut>(&self, key: &K, ttl: Option<Duration>, compute: F) -> Result<V>
    where
        K: Serialize + ?Sized,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V>>,
    {
        let key = Self::cache_key(key, ttl)?;
        if let Some(value) = self.lookup(&key) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            tracing::trace!("query cache hit");
            return Ok(value);
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        let value = compute().await?;
        self.entries.insert(
            key,
            CacheEntry {
                value: value.clone(),
                expires_at: ttl.map(|ttl| Instant::now() + ttl),
            },
        );
        Ok(value)
    }

    fn lookup(&self, key: &str) -> Option<V> {
        let now = Instant::now();
        {
            let entry = self.entries.get(key)?;
            if !entry.is_expired(now) {
                return Some(entry.value.clone());
            }
        }
        self.entries.remove_if(key, |_, entry| entry.is_expired(now));
        None
    }

    fn cache_key<K: Serialize + ?Sized>(key: &K, ttl: Option<Duration>) -> Result<String> {
        let ttl_ms = ttl.map(|ttl| ttl.as_millis() as u64);
        Ok(serde_json::to_string(&(key, ttl_ms))?)
    }

    /// Drop every entry
    pub fn clear(&self) {
        self.entries.clear();
    }

    /// Number of stored entries, expired ones included until next lookup
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }
}

impl<V: Clone> Default for QueryCache<V> {
    fn default() -> Self {
        Self::new()
    }
}
