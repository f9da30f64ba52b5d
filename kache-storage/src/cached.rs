//! Two-tier (`Cached`) composer: an in-memory tier-1 in front of a remote
//! tier-2.
//!
//! `get` is satisfied by tier-1 when present, otherwise by tier-2 with
//! write-through to tier-1. `set` writes tier-2 asynchronously and tier-1
//! synchronously. `keys` is served by tier-2 alone, which is authoritative.
//!
//! Invariant: after a successful `set`, tier-1 holds a subset of tier-2's
//! keys; tier-2's independent expiry may leave a tier-1 shadow that ages out
//! on its own TTL.

use std::time::Duration;

use async_trait::async_trait;
use kache_types::{Result, StorageProvider};

use crate::memory::InMemoryStore;
use crate::remote::{RemoteClient, RemoteStore};

pub struct CachedStore<C: RemoteClient> {
    tier1: InMemoryStore,
    tier2: RemoteStore<C>,
    layered_ttl: Duration,
}

impl<C: RemoteClient> CachedStore<C> {
    pub fn new(tier1: InMemoryStore, tier2: RemoteStore<C>, layered_ttl: Duration) -> Self {
        Self { tier1, tier2, layered_ttl }
    }
}

#[async_trait]
impl<C: RemoteClient> StorageProvider for CachedStore<C> {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        if let Some(v) = self.tier1.get(key).await? {
            return Ok(Some(v));
        }
        match self.tier2.get(key).await? {
            Some(v) => {
                self.tier1.set(key, v.clone(), self.layered_ttl).await?;
                Ok(Some(v))
            }
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<()> {
        if let Err(err) = self.tier2.set_async(key.to_string(), value.clone(), ttl) {
            tracing::warn!(key, error = %err, "tier-2 async store failed to enqueue");
        }
        self.tier1.set(key, value, ttl).await
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        self.tier1.delete(key).await?;
        self.tier2.delete(key).await
    }

    async fn keys(&self, prefix: &str) -> Result<Vec<String>> {
        self.tier2.keys(prefix).await
    }

    async fn size(&self) -> usize {
        self.tier2.size().await
    }

    async fn purge(&self, pattern: &str) -> Result<()> {
        self.tier1.purge(pattern).await?;
        self.tier2.purge(pattern).await
    }

    async fn flush(&self) -> Result<()> {
        self.tier1.flush().await?;
        self.tier2.flush().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::tests_support::FakeRemote;

    #[tokio::test]
    async fn get_populates_tier1_on_tier2_hit() {
        let tier2 = RemoteStore::new(FakeRemote::default(), 1000, 16, 2);
        tier2.set_sync("k", vec![9, 9], Duration::from_secs(60)).await.unwrap();
        let tier1 = InMemoryStore::new(10_000, 1000, true);
        let cached = CachedStore::new(tier1, tier2, Duration::from_secs(30));

        assert_eq!(cached.get("k").await.unwrap(), Some(vec![9, 9]));
        // Now it should be present in tier-1 without touching tier-2.
        assert_eq!(cached.tier1.get("k").await.unwrap(), Some(vec![9, 9]));
    }

    #[tokio::test]
    async fn set_writes_both_tiers() {
        let tier2 = RemoteStore::new(FakeRemote::default(), 1000, 16, 2);
        let tier1 = InMemoryStore::new(10_000, 1000, true);
        let cached = CachedStore::new(tier1, tier2, Duration::from_secs(30));

        cached.set("k", vec![1, 2, 3], Duration::from_secs(60)).await.unwrap();
        assert_eq!(cached.tier1.get("k").await.unwrap(), Some(vec![1, 2, 3]));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(cached.tier2.get("k").await.unwrap(), Some(vec![1, 2, 3]));
    }
}
