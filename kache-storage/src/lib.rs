//! Storage providers for the kache HTTP cache core: a bounded in-memory LRU,
//! a remote-backed store with an async write queue, and a two-tier composer
//! of the two. All three implement [`kache_types::StorageProvider`].

#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod cached;
pub mod memory;
pub mod queue;
pub mod remote;

pub use cached::CachedStore;
pub use kache_types::{CacheError, Result, StorageProvider};
pub use memory::InMemoryStore;
pub use queue::JobQueue;
pub use remote::{RemoteClient, RemoteStore};

use regex::Regex;

/// Translate a `*`-wildcard purge pattern into a regex anchored at both
/// ends.
pub(crate) fn wildcard_to_regex(pattern: &str) -> Result<Regex> {
    let escaped: Vec<String> = pattern.split('*').map(regex::escape).collect();
    let body = format!("^{}$", escaped.join(".*"));
    Regex::new(&body).map_err(|_| CacheError::BackendUnavailable("invalid purge pattern".into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wildcard_matches_prefix_and_suffix() {
        let re = wildcard_to_regex("users:*").unwrap();
        assert!(re.is_match("users:42"));
        assert!(!re.is_match("posts:42"));

        let re = wildcard_to_regex("*:done").unwrap();
        assert!(re.is_match("job:done"));
        assert!(!re.is_match("job:pending"));
    }

    #[test]
    fn wildcard_without_star_is_exact() {
        let re = wildcard_to_regex("exact").unwrap();
        assert!(re.is_match("exact"));
        assert!(!re.is_match("exactly"));
    }
}
