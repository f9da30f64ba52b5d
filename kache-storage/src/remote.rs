//! Remote (network) storage backend.
//!
//! Wraps any client implementing [`RemoteClient`] (e.g. a Redis client) and
//! adds a synchronous/asynchronous `Store` split:
//! `set` enforces `max_item_size` and waits for the round trip; `set_async`
//! dispatches onto a bounded [`JobQueue`] and returns immediately, failing
//! fast with [`CacheError::QueueFull`] when the queue is saturated.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use kache_types::{item_size, CacheError, Result, StorageProvider};

use crate::queue::JobQueue;
use crate::wildcard_to_regex;

/// The minimal contract a remote KV client must expose. A real
/// implementation (Redis, memcached, ...) lives outside this crate; the
/// collaborator boundary mirrors `StorageProvider`'s own
/// `Get/Set/Delete/Keys/Purge/Flush` surface.
#[async_trait]
pub trait RemoteClient: Send + Sync + 'static {
    /// `Ok(None)` is a miss; `Err` is a backend error. The two must stay
    /// distinguishable so the storage layer can degrade reads to a miss
    /// without masking a genuinely broken connection at the call site.
    async fn fetch(&self, key: &str) -> Result<Option<Vec<u8>>>;
    async fn store(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<()>;
    async fn remote_delete(&self, key: &str) -> Result<bool>;
    async fn remote_keys(&self, prefix: &str) -> Result<Vec<String>>;
    async fn remote_flush(&self) -> Result<()>;
}

/// [`StorageProvider`] backed by a [`RemoteClient`], with async writes
/// dispatched through a bounded [`JobQueue`].
pub struct RemoteStore<C: RemoteClient> {
    client: Arc<C>,
    queue: Arc<JobQueue>,
    max_item_size_bytes: usize,
}

impl<C: RemoteClient> RemoteStore<C> {
    pub fn new(
        client: C,
        max_item_size_bytes: usize,
        max_queue_buffer_size: usize,
        max_queue_concurrency: usize,
    ) -> Self {
        Self {
            client: Arc::new(client),
            queue: JobQueue::new(max_queue_buffer_size, max_queue_concurrency),
            max_item_size_bytes,
        }
    }

    /// Synchronous store: enforces `max_item_size` and waits for the remote
    /// round trip to complete before returning.
    pub async fn set_sync(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<()> {
        if item_size(value.len()) > self.max_item_size_bytes {
            return Err(CacheError::ItemTooLarge(self.max_item_size_bytes));
        }
        self.client.store(key, value, ttl).await
    }

    /// Fire-and-forget store: enqueues onto the job queue and returns
    /// immediately. A saturated queue yields [`CacheError::QueueFull`]; the
    /// caller logs and does not retry inline.
    pub fn set_async(&self, key: String, value: Vec<u8>, ttl: Duration) -> Result<()> {
        if item_size(value.len()) > self.max_item_size_bytes {
            return Err(CacheError::ItemTooLarge(self.max_item_size_bytes));
        }
        let client = Arc::clone(&self.client);
        self.queue.dispatch(move || async move {
            if let Err(err) = client.store(&key, value, ttl).await {
                tracing::error!(key, error = %err, "async store to remote tier failed");
            }
        })
    }

    pub async fn stop(&self) {
        self.queue.stop().await;
    }
}

#[async_trait]
impl<C: RemoteClient> StorageProvider for RemoteStore<C> {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.client.fetch(key).await
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<()> {
        self.set_sync(key, value, ttl).await
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        self.client.remote_delete(key).await
    }

    async fn keys(&self, prefix: &str) -> Result<Vec<String>> {
        self.client.remote_keys(prefix).await
    }

    async fn size(&self) -> usize {
        self.client.remote_keys("").await.map(|k| k.len()).unwrap_or(0)
    }

    async fn purge(&self, pattern: &str) -> Result<()> {
        let re = wildcard_to_regex(pattern)?;
        let keys = self.client.remote_keys("").await?;
        for key in keys.into_iter().filter(|k| re.is_match(k)) {
            self.client.remote_delete(&key).await?;
        }
        Ok(())
    }

    async fn flush(&self) -> Result<()> {
        self.client.remote_flush().await
    }
}

/// A minimal in-memory stand-in for a remote KV client, shared by this
/// crate's own tests and by `cached.rs`'s two-tier tests.
#[cfg(test)]
pub(crate) mod tests_support {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    #[derive(Default)]
    pub struct FakeRemote {
        data: Mutex<HashMap<String, Vec<u8>>>,
    }

    #[async_trait]
    impl RemoteClient for FakeRemote {
        async fn fetch(&self, key: &str) -> Result<Option<Vec<u8>>> {
            Ok(self.data.lock().unwrap().get(key).cloned())
        }
        async fn store(&self, key: &str, value: Vec<u8>, _ttl: Duration) -> Result<()> {
            self.data.lock().unwrap().insert(key.to_string(), value);
            Ok(())
        }
        async fn remote_delete(&self, key: &str) -> Result<bool> {
            Ok(self.data.lock().unwrap().remove(key).is_some())
        }
        async fn remote_keys(&self, prefix: &str) -> Result<Vec<String>> {
            Ok(self
                .data
                .lock()
                .unwrap()
                .keys()
                .filter(|k| k.starts_with(prefix))
                .cloned()
                .collect())
        }
        async fn remote_flush(&self) -> Result<()> {
            self.data.lock().unwrap().clear();
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tests_support::FakeRemote;

    #[tokio::test]
    async fn sync_store_rejects_oversized_item() {
        let store = RemoteStore::new(FakeRemote::default(), 8, 16, 2);
        let result = store.set_sync("k", vec![0u8; 100], Duration::from_secs(1)).await;
        assert!(matches!(result, Err(CacheError::ItemTooLarge(8))));
    }

    #[tokio::test]
    async fn async_store_round_trips() {
        let store = RemoteStore::new(FakeRemote::default(), 1000, 16, 2);
        store.set_async("k".to_string(), vec![1, 2, 3], Duration::from_secs(1)).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(store.get("k").await.unwrap(), Some(vec![1, 2, 3]));
    }

    #[tokio::test]
    async fn fetch_miss_is_distinguishable_from_error() {
        let store = RemoteStore::new(FakeRemote::default(), 1000, 16, 2);
        assert_eq!(store.get("missing").await.unwrap(), None);
    }
}
