//! Result cache for inference requests.
//!
//! Keyed by a digest of the raw image bytes followed by the raw query bytes,
//! with no normalization: byte-identical requests hit, anything else misses.
//! Bounded by `max_entries` with least-recently-used eviction; entries
//! older than the TTL are dropped on lookup.

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

use crate::config::CacheConfig;

/// 128-bit request digest: the first half of SHA-256(image || query).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CacheKey([u8; 16]);

impl CacheKey {
    pub fn derive(image: &[u8], query: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(image);
        hasher.update(query.as_bytes());
        let digest = hasher.finalize();
        let mut key = [0u8; 16];
        key.copy_from_slice(&digest[..16]);
        Self(key)
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

#[derive(Debug)]
struct CacheEntry {
    value: String,
    created_at: Instant,
    last_used: Instant,
}

#[derive(Debug, Default)]
struct CacheState {
    entries: HashMap<CacheKey, CacheEntry>,
    stats: CacheStats,
}

#[derive(Debug)]
pub struct InferenceCache {
    state: Mutex<CacheState>,
    max_entries: usize,
    ttl: Option<Duration>,
}

impl InferenceCache {
    /// `max_entries == 0` disables caching; `ttl == None` never expires.
    pub fn new(max_entries: usize, ttl: Option<Duration>) -> Self {
        Self {
            state: Mutex::new(CacheState::default()),
            max_entries,
            ttl,
        }
    }

    pub fn from_config(config: &CacheConfig) -> Self {
        let max_entries = if config.enabled { config.max_entries } else { 0 };
        let ttl = (config.ttl_secs > 0).then(|| Duration::from_secs(config.ttl_secs));
        Self::new(max_entries, ttl)
    }

    pub fn is_enabled(&self) -> bool {
        self.max_entries > 0
    }

    pub async fn get(&self, key: &CacheKey) -> Option<String> {
        if !self.is_enabled() {
            return None;
        }
        let mut state = self.state.lock().await;
        let now = Instant::now();
        let expired = match state.entries.get(key) {
            Some(entry) => self.ttl.is_some_and(|ttl| now.duration_since(entry.created_at) >= ttl),
            None => {
                state.stats.misses += 1;
                return None;
            }
        };
        if expired {
            state.entries.remove(key);
            state.stats.evictions += 1;
            state.stats.misses += 1;
            debug!(%key, "Cache entry expired");
            return None;
        }
        state.stats.hits += 1;
        let entry = state.entries.get_mut(key)?;
        entry.last_used = now;
        Some(entry.value.clone())
    }

    /// Insert or overwrite. Last writer wins.
    pub async fn put(&self, key: CacheKey, value: String) {
        if !self.is_enabled() {
            return;
        }
        let mut state = self.state.lock().await;
        if !state.entries.contains_key(&key) && state.entries.len() >= self.max_entries {
            if let Some(lru) = Self::find_lru_key(&state.entries) {
                state.entries.remove(&lru);
                state.stats.evictions += 1;
                debug!(key = %lru, "Evicted least-recently-used cache entry");
            }
        }
        let now = Instant::now();
        state.entries.insert(
            key,
            CacheEntry {
                value,
                created_at: now,
                last_used: now,
            },
        );
    }

    /// Drop every entry and reset the counters. Returns the number removed.
    pub async fn clear(&self) -> usize {
        let mut state = self.state.lock().await;
        let removed = state.entries.len();
        *state = CacheState::default();
        removed
    }

    pub async fn stats(&self) -> CacheStats {
        let state = self.state.lock().await;
        CacheStats {
            entries: state.entries.len(),
            ..state.stats
        }
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    fn find_lru_key(entries: &HashMap<CacheKey, CacheEntry>) -> Option<CacheKey> {
        entries
            .iter()
            .min_by_key(|(_, entry)| entry.last_used)
            .map(|(key, _)| *key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_is_deterministic() {
        let a = CacheKey::derive(b"\xff\xd8image", "Total amount?");
        let b = CacheKey::derive(b"\xff\xd8image", "Total amount?");
        assert_eq!(a, b);
        assert_eq!(a.to_hex().len(), 32);
    }

    #[test]
    fn test_key_distinguishes_image_and_query() {
        let base = CacheKey::derive(b"image-1", "Total amount?");
        assert_ne!(base, CacheKey::derive(b"image-2", "Total amount?"));
        assert_ne!(base, CacheKey::derive(b"image-1", "Total amount? "));
        assert_ne!(base, CacheKey::derive(b"image-1", "total amount?"));
    }

    #[tokio::test]
    async fn test_hit_and_miss_counters() {
        let cache = InferenceCache::new(8, None);
        let key = CacheKey::derive(b"img", "q");
        assert_eq!(cache.get(&key).await, None);
        cache.put(key, "Invoice total: 42".into()).await;
        assert_eq!(cache.get(&key).await.as_deref(), Some("Invoice total: 42"));

        let stats = cache.stats().await;
        assert_eq!(stats.entries, 1);
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_lru_eviction() {
        let cache = InferenceCache::new(2, None);
        let k1 = CacheKey::derive(b"1", "q");
        let k2 = CacheKey::derive(b"2", "q");
        let k3 = CacheKey::derive(b"3", "q");

        cache.put(k1, "one".into()).await;
        tokio::time::advance(Duration::from_millis(10)).await;
        cache.put(k2, "two".into()).await;
        tokio::time::advance(Duration::from_millis(10)).await;
        cache.get(&k1).await;
        tokio::time::advance(Duration::from_millis(10)).await;
        cache.put(k3, "three".into()).await;

        assert!(cache.get(&k2).await.is_none());
        assert!(cache.get(&k1).await.is_some());
        assert!(cache.get(&k3).await.is_some());
        assert_eq!(cache.stats().await.evictions, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ttl_expiry() {
        let cache = InferenceCache::new(8, Some(Duration::from_secs(60)));
        let key = CacheKey::derive(b"img", "q");
        cache.put(key, "value".into()).await;
        tokio::time::advance(Duration::from_secs(59)).await;
        assert!(cache.get(&key).await.is_some());
        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(cache.get(&key).await.is_none());
        assert!(cache.is_empty().await);
    }

    #[tokio::test]
    async fn test_clear_resets_everything() {
        let cache = InferenceCache::new(8, None);
        let key = CacheKey::derive(b"img", "q");
        cache.put(key, "value".into()).await;
        cache.get(&key).await;
        assert_eq!(cache.clear().await, 1);
        assert_eq!(cache.stats().await, CacheStats::default());
    }

    #[tokio::test]
    async fn test_disabled_cache_stores_nothing() {
        let cache = InferenceCache::from_config(&CacheConfig {
            enabled: false,
            ..CacheConfig::default()
        });
        let key = CacheKey::derive(b"img", "q");
        cache.put(key, "value".into()).await;
        assert!(cache.get(&key).await.is_none());
        assert!(cache.is_empty().await);
    }
}
