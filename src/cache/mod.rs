//! Bounded in-memory LRU cache with per-entry TTL.
//!
//! Backs the prompt-enhancement service with fast exact-match lookups.
//! Eviction is strict least-recently-used; expired entries are deleted on
//! access and counted as misses.

use async_trait::async_trait;
use lru::LruCache;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::future::Future;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, info};

/// Deterministic cache key for an enhancement request.
///
/// First 16 hex chars of the SHA-256 over the canonical JSON encoding of
/// `{client, model, prompt}`. `serde_json` maps are BTree-backed, so keys
/// serialize sorted and structurally equal inputs hash identically.
pub fn make_cache_key(prompt: &str, client: Option<&str>, model: Option<&str>) -> String {
    let payload = serde_json::json!({
        "prompt": prompt,
        "client": client.unwrap_or("default"),
        "model": model.unwrap_or("default"),
    });

    let digest = Sha256::digest(payload.to_string().as_bytes());
    format!("{:x}", digest)[..16].to_string()
}

/// Statistics for cache performance monitoring.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub size: usize,
    pub max_size: usize,
    pub evictions: u64,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total > 0 {
            self.hits as f64 / total as f64
        } else {
            0.0
        }
    }
}

/// Common interface for cache backends, so the enhancement service can be
/// handed any implementation.
#[async_trait]
pub trait Cache<V>: Send + Sync {
    /// Returns the value iff present and unexpired; promotes to MRU.
    async fn get(&self, key: &str) -> Option<V>;

    /// Inserts or updates; `None` TTL uses the cache default.
    async fn set(&self, key: &str, value: V, ttl: Option<Duration>);

    async fn delete(&self, key: &str) -> bool;

    async fn exists(&self, key: &str) -> bool;

    async fn clear(&self);

    async fn stats(&self) -> CacheStats;
}

struct CacheEntry<V> {
    value: V,
    created_at: Instant,
    ttl: Duration,
}

impl<V> CacheEntry<V> {
    fn is_expired(&self) -> bool {
        self.created_at.elapsed() > self.ttl
    }
}

struct CacheInner<V> {
    entries: LruCache<String, CacheEntry<V>>,
    hits: u64,
    misses: u64,
    evictions: u64,
}

/// In-memory LRU cache with TTL support.
///
/// All operations are serialized by a single mutex, which is never held
/// across an await point other than its own acquisition.
pub struct MemoryCache<V> {
    max_size: usize,
    default_ttl: Duration,
    inner: Mutex<CacheInner<V>>,
}

impl<V: Clone + Send> MemoryCache<V> {
    pub fn new(max_size: usize, default_ttl: Duration) -> Self {
        Self {
            max_size,
            default_ttl,
            // Unbounded so capacity evictions stay under our control and
            // can be counted exactly
            inner: Mutex::new(CacheInner {
                entries: LruCache::unbounded(),
                hits: 0,
                misses: 0,
                evictions: 0,
            }),
        }
    }

    async fn get_value(&self, key: &str) -> Option<V> {
        let mut inner = self.inner.lock().await;

        match inner.entries.peek(key).map(|entry| entry.is_expired()) {
            None => {
                inner.misses += 1;
                None
            },
            Some(true) => {
                inner.entries.pop(key);
                inner.misses += 1;
                None
            },
            Some(false) => {
                inner.hits += 1;
                // Promote to most recently used
                inner.entries.get(key).map(|entry| entry.value.clone())
            },
        }
    }

    async fn set_value(&self, key: &str, value: V, ttl: Option<Duration>) {
        let ttl = ttl.unwrap_or(self.default_ttl);
        let mut inner = self.inner.lock().await;

        let entry = CacheEntry {
            value,
            created_at: Instant::now(),
            ttl,
        };

        if inner.entries.contains(key) {
            inner.entries.put(key.to_string(), entry);
            return;
        }

        while inner.entries.len() >= self.max_size {
            if let Some((evicted, _)) = inner.entries.pop_lru() {
                inner.evictions += 1;
                debug!("Evicted cache entry: {}...", &evicted[..evicted.len().min(8)]);
            } else {
                break;
            }
        }

        inner.entries.put(key.to_string(), entry);
    }

    /// Get a cached value, or compute and cache it.
    pub async fn get_or_set<F, Fut>(&self, key: &str, factory: F, ttl: Option<Duration>) -> V
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = V>,
    {
        if let Some(value) = self.get_value(key).await {
            return value;
        }

        let value = factory().await;
        self.set_value(key, value.clone(), ttl).await;
        value
    }

    /// Remove all expired entries, returning how many were dropped.
    pub async fn cleanup_expired(&self) -> usize {
        let mut inner = self.inner.lock().await;

        let expired: Vec<String> = inner
            .entries
            .iter()
            .filter(|(_, entry)| entry.is_expired())
            .map(|(key, _)| key.clone())
            .collect();

        for key in &expired {
            inner.entries.pop(key);
        }

        if !expired.is_empty() {
            debug!("Cleaned up {} expired cache entries", expired.len());
        }
        expired.len()
    }
}

#[async_trait]
impl<V: Clone + Send + Sync> Cache<V> for MemoryCache<V> {
    async fn get(&self, key: &str) -> Option<V> {
        self.get_value(key).await
    }

    async fn set(&self, key: &str, value: V, ttl: Option<Duration>) {
        self.set_value(key, value, ttl).await;
    }

    async fn delete(&self, key: &str) -> bool {
        self.inner.lock().await.entries.pop(key).is_some()
    }

    async fn exists(&self, key: &str) -> bool {
        self.get_value(key).await.is_some()
    }

    async fn clear(&self) {
        let mut inner = self.inner.lock().await;
        inner.entries.clear();
        info!("Memory cache cleared");
    }

    async fn stats(&self) -> CacheStats {
        let inner = self.inner.lock().await;
        CacheStats {
            hits: inner.hits,
            misses: inner.misses,
            size: inner.entries.len(),
            max_size: self.max_size,
            evictions: inner.evictions,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::sleep;

    fn cache() -> MemoryCache<String> {
        MemoryCache::new(3, Duration::from_secs(3600))
    }

    #[test]
    fn cache_key_is_deterministic() {
        let a = make_cache_key("hello", Some("claude-desktop"), Some("llama3.2:3b"));
        let b = make_cache_key("hello", Some("claude-desktop"), Some("llama3.2:3b"));
        assert_eq!(a, b);
        assert_eq!(a.len(), 16);
    }

    #[test]
    fn cache_key_distinguishes_inputs() {
        let base = make_cache_key("hello", None, None);
        assert_ne!(base, make_cache_key("hello!", None, None));
        assert_ne!(base, make_cache_key("hello", Some("vscode"), None));
        assert_ne!(base, make_cache_key("hello", None, Some("mistral")));
        // Omitted fields collapse to the "default" sentinel
        assert_eq!(base, make_cache_key("hello", Some("default"), Some("default")));
    }

    #[tokio::test]
    async fn hit_miss_accounting() {
        let cache = cache();

        assert_eq!(cache.get("missing").await, None);
        cache.set("k", "v".to_string(), None).await;
        assert_eq!(cache.get("k").await, Some("v".to_string()));

        let stats = cache.stats().await;
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.size, 1);
        assert!((stats.hit_rate() - 0.5).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn expired_entry_is_a_miss_and_removed() {
        let cache = MemoryCache::new(10, Duration::from_secs(3600));
        cache
            .set("k", "v".to_string(), Some(Duration::from_millis(30)))
            .await;

        assert_eq!(cache.get("k").await, Some("v".to_string()));

        sleep(Duration::from_millis(60)).await;
        assert_eq!(cache.get("k").await, None);

        let stats = cache.stats().await;
        assert_eq!(stats.size, 0);
        assert_eq!(stats.misses, 1);
    }

    #[tokio::test]
    async fn lru_eviction_follows_access_order() {
        let cache = cache();

        cache.set("a", "1".to_string(), None).await;
        cache.set("b", "2".to_string(), None).await;
        cache.set("c", "3".to_string(), None).await;

        // Touch "a" so "b" becomes least recently used
        assert!(cache.get("a").await.is_some());

        cache.set("d", "4".to_string(), None).await;

        assert_eq!(cache.get("b").await, None);
        assert!(cache.get("a").await.is_some());
        assert!(cache.get("c").await.is_some());
        assert!(cache.get("d").await.is_some());

        let stats = cache.stats().await;
        assert_eq!(stats.evictions, 1);
        assert_eq!(stats.size, 3);
    }

    #[tokio::test]
    async fn size_never_exceeds_capacity() {
        let cache = cache();

        for i in 0..10 {
            cache.set(&format!("k{i}"), i.to_string(), None).await;
            assert!(cache.stats().await.size <= 3);
        }

        let stats = cache.stats().await;
        assert_eq!(stats.size, 3);
        assert_eq!(stats.evictions, 7);
    }

    #[tokio::test]
    async fn update_does_not_evict() {
        let cache = cache();

        cache.set("a", "1".to_string(), None).await;
        cache.set("b", "2".to_string(), None).await;
        cache.set("c", "3".to_string(), None).await;
        cache.set("a", "1b".to_string(), None).await;

        let stats = cache.stats().await;
        assert_eq!(stats.evictions, 0);
        assert_eq!(cache.get("a").await, Some("1b".to_string()));
    }

    #[tokio::test]
    async fn delete_and_clear() {
        let cache = cache();
        cache.set("a", "1".to_string(), None).await;

        assert!(cache.delete("a").await);
        assert!(!cache.delete("a").await);

        cache.set("b", "2".to_string(), None).await;
        cache.clear().await;
        assert_eq!(cache.stats().await.size, 0);
    }

    #[tokio::test]
    async fn get_or_set_computes_once() {
        let cache = cache();

        let first = cache.get_or_set("k", || async { "computed".to_string() }, None).await;
        let second = cache
            .get_or_set("k", || async { "recomputed".to_string() }, None)
            .await;

        assert_eq!(first, "computed");
        assert_eq!(second, "computed");
    }

    #[tokio::test]
    async fn cleanup_expired_drops_only_stale_entries() {
        let cache = MemoryCache::new(10, Duration::from_secs(3600));
        cache
            .set("stale", "v".to_string(), Some(Duration::from_millis(20)))
            .await;
        cache.set("fresh", "v".to_string(), None).await;

        sleep(Duration::from_millis(50)).await;

        assert_eq!(cache.cleanup_expired().await, 1);
        let stats = cache.stats().await;
        assert_eq!(stats.size, 1);
        assert!(cache.get("fresh").await.is_some());
    }
}
