//! The HTTP cache semantic engine: request/response `Cache-Control` parsing,
//! cacheability and freshness decisions, hot-swappable configuration, and
//! the `Engine` type that ties all of it to a [`kache_types::StorageProvider`].

#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod cache_control;
pub mod config;
pub mod datetime;
pub mod engine;

pub use cache_control::{
    apply_pragma_fallback, freshness_lifetime, parse_request_cache_control,
    parse_response_cache_control,
};
pub use config::{CompiledConfig, ExcludeContentRule, ExcludeHeaderRule, KacheConfig, RawConfig, TimeoutRule};
pub use datetime::{age_header_value, current_age, parse_http_date};
pub use engine::{Engine, RequestInfo, CACHEABLE_STATUSES, MERGE_EXCLUDED_HEADERS};
