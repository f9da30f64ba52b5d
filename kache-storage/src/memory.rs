//! Bounded in-memory LRU backend.
//!
//! A single `RwLock` guards both the LRU structure and the TTL sidecar map.
//! `get` takes the write lock because an expired key triggers a lazy delete
//! on read; concurrent `set`s otherwise serialize on the same lock. An
//! epoch-based sweep allowing shared-read `get`s was considered and
//! rejected in favor of this simpler single-lock design.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use kache_types::{item_size, Result, StorageProvider};
use lru::LruCache;

use crate::wildcard_to_regex;

struct Inner {
    lru: LruCache<String, Vec<u8>>,
    expiry: HashMap<String, SystemTime>,
    current_size: usize,
}

/// In-memory bounded LRU implementing [`StorageProvider`].
///
/// `max_item_size_bytes` must not exceed `max_size_bytes`; the constructor
/// clamps it down and logs if it does.
pub struct InMemoryStore {
    inner: RwLock<Inner>,
    max_size_bytes: usize,
    max_item_size_bytes: usize,
    /// When `false` (config `default_ttl = "-1"`), TTL entries are ignored
    /// and expiry only happens via size eviction.
    ttl_eviction: bool,
}

impl InMemoryStore {
    pub fn new(max_size_bytes: usize, max_item_size_bytes: usize, ttl_eviction: bool) -> Self {
        let max_item_size_bytes = if max_item_size_bytes > max_size_bytes {
            tracing::warn!(
                max_item_size_bytes,
                max_size_bytes,
                "max_item_size_bytes exceeds max_size_bytes; clamping"
            );
            max_size_bytes
        } else {
            max_item_size_bytes
        };
        Self {
            // unbounded cap: size accounting is handled by byte-level bookkeeping below.
            inner: RwLock::new(Inner {
                lru: LruCache::unbounded(),
                expiry: HashMap::new(),
                current_size: 0,
            }),
            max_size_bytes,
            max_item_size_bytes,
            ttl_eviction,
        }
    }

    fn is_expired(inner: &Inner, key: &str, now: SystemTime, ttl_eviction: bool) -> bool {
        if !ttl_eviction {
            return false;
        }
        match inner.expiry.get(key) {
            Some(expiry) => now >= *expiry,
            None => false,
        }
    }
}

#[async_trait]
impl StorageProvider for InMemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let mut inner = self.inner.write().unwrap();
        let now = SystemTime::now();
        if Self::is_expired(&inner, key, now, self.ttl_eviction) {
            if let Some(v) = inner.lru.pop(key) {
                inner.current_size -= item_size(v.len());
            }
            inner.expiry.remove(key);
            return Ok(None);
        }
        Ok(inner.lru.get(key).cloned())
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<()> {
        let size = item_size(value.len());
        if size > self.max_item_size_bytes {
            tracing::debug!(key, size, "dropping item larger than max_item_size_bytes");
            return Ok(());
        }
        let mut inner = self.inner.write().unwrap();

        if let Some(old) = inner.lru.peek(key).cloned() {
            let old_size = item_size(old.len());
            if size <= old_size {
                inner.current_size = inner.current_size - old_size + size;
                inner.lru.put(key.to_string(), value);
                if self.ttl_eviction {
                    inner.expiry.insert(key.to_string(), SystemTime::now() + ttl);
                }
                return Ok(());
            }
            inner.lru.pop(key);
            inner.current_size -= old_size;
            inner.expiry.remove(key);
        }

        while inner.current_size + size > self.max_size_bytes {
            match inner.lru.pop_lru() {
                Some((evicted_key, evicted_value)) => {
                    inner.current_size -= item_size(evicted_value.len());
                    inner.expiry.remove(&evicted_key);
                }
                None => {
                    // Cache is empty but a single item still doesn't fit alongside
                    // bookkeeping drift; reset rather than loop forever.
                    inner.lru.clear();
                    inner.expiry.clear();
                    inner.current_size = 0;
                    break;
                }
            }
        }

        inner.lru.put(key.to_string(), value);
        inner.current_size += size;
        if self.ttl_eviction {
            inner.expiry.insert(key.to_string(), SystemTime::now() + ttl);
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let mut inner = self.inner.write().unwrap();
        inner.expiry.remove(key);
        match inner.lru.pop(key) {
            Some(v) => {
                inner.current_size -= item_size(v.len());
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn keys(&self, prefix: &str) -> Result<Vec<String>> {
        let inner = self.inner.read().unwrap();
        Ok(inner
            .lru
            .iter()
            .map(|(k, _)| k.clone())
            .filter(|k| k.starts_with(prefix))
            .collect())
    }

    async fn size(&self) -> usize {
        self.inner.read().unwrap().lru.len()
    }

    async fn purge(&self, pattern: &str) -> Result<()> {
        let re = wildcard_to_regex(pattern)?;
        let mut inner = self.inner.write().unwrap();
        let matching: Vec<String> =
            inner.lru.iter().map(|(k, _)| k.clone()).filter(|k| re.is_match(k)).collect();
        for k in matching {
            if let Some(v) = inner.lru.pop(&k) {
                inner.current_size -= item_size(v.len());
            }
            inner.expiry.remove(&k);
        }
        Ok(())
    }

    async fn flush(&self) -> Result<()> {
        let mut inner = self.inner.write().unwrap();
        inner.lru.clear();
        inner.expiry.clear();
        inner.current_size = 0;
        Ok(())
    }
}

impl std::fmt::Debug for InMemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryStore")
            .field("max_size_bytes", &self.max_size_bytes)
            .field("max_item_size_bytes", &self.max_item_size_bytes)
            .field("ttl_eviction", &self.ttl_eviction)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const OVERHEAD: usize = kache_types::ITEM_OVERHEAD_BYTES;

    #[tokio::test]
    async fn lru_evicts_oldest_when_over_budget() {
        // max_size = 2 * (24 + 40) = 128, max_item_size = 64
        let store = InMemoryStore::new(2 * (OVERHEAD + 40), 64, true);
        store.set("a", vec![0u8; 40], Duration::from_secs(60)).await.unwrap();
        store.set("b", vec![0u8; 40], Duration::from_secs(60)).await.unwrap();
        store.set("c", vec![0u8; 40], Duration::from_secs(60)).await.unwrap();

        assert!(store.get("a").await.unwrap().is_none());
        assert!(store.get("c").await.unwrap().is_some());
        assert_eq!(store.inner.read().unwrap().current_size, 2 * (OVERHEAD + 40));
    }

    #[tokio::test]
    async fn oversized_item_is_dropped_silently() {
        let store = InMemoryStore::new(1000, 64, true);
        store.set("big", vec![0u8; 200], Duration::from_secs(60)).await.unwrap();
        assert!(store.get("big").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn ttl_eviction_disabled_ignores_expiry() {
        let store = InMemoryStore::new(1000, 64, false);
        store.set("k", vec![1, 2, 3], Duration::from_millis(1)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(store.get("k").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn ttl_eviction_enabled_expires_on_read() {
        let store = InMemoryStore::new(1000, 64, true);
        store.set("k", vec![1, 2, 3], Duration::from_millis(1)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(store.get("k").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn replace_in_place_when_new_value_not_larger() {
        let store = InMemoryStore::new(1000, 64, true);
        store.set("k", vec![0u8; 10], Duration::from_secs(60)).await.unwrap();
        let size_before = store.inner.read().unwrap().current_size;
        store.set("k", vec![0u8; 5], Duration::from_secs(60)).await.unwrap();
        let size_after = store.inner.read().unwrap().current_size;
        assert!(size_after < size_before);
        assert_eq!(store.get("k").await.unwrap().unwrap(), vec![0u8; 5]);
    }

    #[tokio::test]
    async fn purge_wildcard_removes_matching_keys() {
        let store = InMemoryStore::new(10_000, 1000, true);
        store.set("users:1", vec![1], Duration::from_secs(60)).await.unwrap();
        store.set("users:2", vec![1], Duration::from_secs(60)).await.unwrap();
        store.set("posts:1", vec![1], Duration::from_secs(60)).await.unwrap();
        store.purge("users:*").await.unwrap();
        assert!(store.get("users:1").await.unwrap().is_none());
        assert!(store.get("users:2").await.unwrap().is_none());
        assert!(store.get("posts:1").await.unwrap().is_some());
    }
}
