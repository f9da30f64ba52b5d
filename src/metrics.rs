//! Cache effectiveness counters for a [`crate::CachingTransport`].

use std::sync::atomic::{AtomicU64, Ordering};

/// Hit/miss/store/skip counters. Cheap to update (relaxed atomics); meant to
/// be scraped by whatever metrics exporter the surrounding process already
/// runs, not exposed by this crate itself.
#[derive(Debug, Default)]
pub struct CacheMetrics {
    /// Served straight from cache, fresh.
    pub hits: AtomicU64,
    /// Forwarded upstream because no usable entry existed.
    pub misses: AtomicU64,
    /// Responses written to the storage provider.
    pub stores: AtomicU64,
    /// Cacheable-looking responses that were not stored (exclusion rule,
    /// `no-store`, HEAD, etc).
    pub skipped: AtomicU64,
}

impl CacheMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hits / (hits + misses), `0.0` with no traffic yet.
    pub fn hit_rate(&self) -> f64 {
        let hits = self.hits.load(Ordering::Relaxed);
        let total = hits + self.misses.load(Ordering::Relaxed);
        if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64
        }
    }

    pub fn reset(&self) {
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
        self.stores.store(0, Ordering::Relaxed);
        self.skipped.store(0, Ordering::Relaxed);
    }
}
