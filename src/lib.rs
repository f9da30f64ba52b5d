//! A reverse-proxy HTTP cache core: RFC 7234 semantics, request
//! coalescing, and tiered storage, assembled into one [`tower::Service`].
//!
//! `kache-types` defines the shared data model, `kache-engine` the
//! cacheability/freshness decisions, `kache-storage` the in-memory/remote/
//! two-tier backends, and `kache-coalesce` the singleflight upstream
//! round-trip. This crate wires them together behind [`CachingTransport`].

#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod body;
pub mod director;
pub mod error;
pub mod metrics;
pub mod transport;

pub use body::ResponseBody;
pub use director::Director;
pub use error::{Error, Result};
pub use metrics::CacheMetrics;
pub use transport::{CachingTransport, CachingTransportLayer};

pub use kache_coalesce::Coalescer;
pub use kache_engine::{
    age_header_value, current_age, freshness_lifetime, parse_http_date,
    CompiledConfig, Engine, ExcludeContentRule, ExcludeHeaderRule, KacheConfig, RawConfig,
    RequestInfo, TimeoutRule,
};
pub use kache_storage::{CachedStore, InMemoryStore, JobQueue, RemoteClient, RemoteStore};
pub use kache_types::{
    CacheError, CacheKey, Entry, EntryStatus, HttpResponse, HttpVersion, LookupRequest,
    LookupResult, StorageProvider,
};
