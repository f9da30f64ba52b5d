//! The HTTP cache engine: cacheability, key construction, freshness and
//! validation decisions, and the Fetch/Store/Delete/Purge/Flush contract
//! against a [`StorageProvider`].

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use kache_types::{
    canonical_query, vary_identifier, CacheKey, Entry, EntryStatus, HttpResponse, LookupRequest,
    LookupResult, RequestCacheControl, Result as CacheResult, StorageProvider,
};

use crate::cache_control::{
    apply_pragma_fallback, freshness_lifetime, parse_request_cache_control,
    parse_response_cache_control,
};
use crate::config::KacheConfig;
use crate::datetime::{current_age, parse_http_date};

/// Response status codes cacheable by default.
pub const CACHEABLE_STATUSES: &[u16] =
    &[200, 203, 204, 206, 300, 301, 308, 404, 405, 410, 414, 451, 501];

/// Request headers whose presence makes a request uncacheable.
const CONDITIONAL_HEADERS: &[&str] =
    &["if-match", "if-none-match", "if-modified-since", "if-unmodified-since", "if-range"];

/// Headers excluded from the 304 header merge: the stored original wins.
pub const MERGE_EXCLUDED_HEADERS: &[&str] = &["content-range", "content-length", "etag", "vary"];

/// Incoming request shape the engine needs; building one is the caller's
/// (transport's) job, which also resolves `scheme` from TLS presence when
/// the caller doesn't set it explicitly.
#[derive(Debug, Clone)]
pub struct RequestInfo {
    pub method: String,
    pub scheme: String,
    pub host: String,
    pub path: String,
    pub raw_query: String,
    pub headers: Vec<(String, String)>,
}

impl RequestInfo {
    fn header(&self, name: &str) -> Option<&str> {
        self.headers.iter().find(|(k, _)| k.eq_ignore_ascii_case(name)).map(|(_, v)| v.as_str())
    }

    fn header_values(&self, name: &str) -> Vec<&str> {
        self.headers
            .iter()
            .filter(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
            .collect()
    }

    fn as_http_response_shape(&self) -> HttpResponse {
        HttpResponse { status: 0, version: kache_types::HttpVersion::Http11, headers: self.headers.clone(), body: vec![] }
    }
}

pub struct Engine<S: StorageProvider> {
    storage: Arc<S>,
    config: Arc<KacheConfig>,
}

impl<S: StorageProvider> Engine<S> {
    pub fn new(storage: Arc<S>, config: Arc<KacheConfig>) -> Self {
        Self { storage, config }
    }

    /// True iff the request can be served from or populate the cache at
    /// all: non-empty host/path, GET/HEAD, no `Authorization`, no
    /// conditional headers.
    pub fn is_cacheable_request(&self, req: &RequestInfo) -> bool {
        if req.host.is_empty() || req.path.is_empty() {
            return false;
        }
        if req.method != "GET" && req.method != "HEAD" {
            return false;
        }
        if req.header("authorization").is_some() {
            return false;
        }
        if CONDITIONAL_HEADERS.iter().any(|h| req.header(h).is_some()) {
            return false;
        }
        true
    }

    /// True iff the request path or headers match any of the configured
    /// exclusion rules.
    pub fn is_excluded_request(&self, req: &RequestInfo) -> bool {
        let config = self.config.current();
        if config.exclude_paths.iter().any(|re| re.is_match(&req.path)) {
            return true;
        }
        config.exclude_headers.iter().any(|rule| req.header(&rule.name) == Some(rule.value.as_str()))
    }

    /// True iff the response's `Content-Type` matches an exclusion rule and
    /// either no size bound is configured or `Content-Length` exceeds it.
    pub fn is_excluded_response(&self, response: &HttpResponse) -> bool {
        let config = self.config.current();
        let content_type = response.header("content-type").unwrap_or_default();
        for rule in &config.exclude_content {
            if rule.content_type.is_match(content_type) {
                match rule.size {
                    None => return true,
                    Some(limit) => {
                        let len: Option<u64> = response.header("content-length").and_then(|v| v.parse().ok());
                        if len.map(|len| len > limit).unwrap_or(false) {
                            return true;
                        }
                    }
                }
            }
        }
        false
    }

    /// True iff the response itself is eligible for storage, independent of
    /// the exclusion rules checked separately by the caller.
    pub fn is_cacheable_response(&self, response: &HttpResponse) -> bool {
        if !CACHEABLE_STATUSES.contains(&response.status) {
            return false;
        }
        let cc = parse_response_cache_control(&joined(response, "cache-control"));
        if cc.no_store {
            return false;
        }
        let has_validation_data = cc.must_validate
            || cc.max_age >= 0
            || cc.s_maxage >= 0
            || (response.header("date").is_some() && response.header("expires").is_some());
        has_validation_data
    }

    /// Build the primary key for a request, applying the configured cluster
    /// label and canonicalizing the query string.
    pub fn primary_key(&self, req: &RequestInfo) -> CacheKey {
        let config = self.config.current();
        CacheKey::new(
            config.cluster_label.clone(),
            req.scheme.clone(),
            req.host.clone(),
            &req.path,
            canonical_query(&req.raw_query),
        )
    }

    pub fn build_lookup_request(&self, req: &RequestInfo, now: SystemTime) -> LookupRequest {
        let has_cache_control = req.header("cache-control").is_some();
        let mut cc = parse_request_cache_control(&joined(&req.as_http_response_shape(), "cache-control"));
        apply_pragma_fallback(&mut cc, has_cache_control, req.header("pragma"));
        LookupRequest {
            method: req.method.clone(),
            headers: req.as_http_response_shape(),
            request_cache_control: cc,
            primary_key: self.primary_key(req),
            now,
        }
    }

    /// `Fetch`: builds the [`LookupRequest`], reads the raw entry by primary
    /// key, decodes it, and derives an [`EntryStatus`] from freshness and
    /// validation rules.
    pub async fn fetch(&self, now: SystemTime, req: &RequestInfo) -> CacheResult<LookupResult> {
        let lookup = self.build_lookup_request(req, now);
        let key = lookup.primary_key.to_key_string();

        let raw = match self.storage.get(&key).await {
            Ok(Some(bytes)) => bytes,
            Ok(None) => return Ok(LookupResult { status: EntryStatus::Invalid, cached_response: None, stored_at: None }),
            Err(err) => {
                tracing::error!(key, error = %err, "storage read failed; treating as miss");
                return Ok(LookupResult { status: EntryStatus::Invalid, cached_response: None, stored_at: None });
            }
        };

        let entry = match Entry::decode(&raw) {
            Ok(entry) => entry,
            Err(err) => {
                tracing::error!(key, error = %err, "failed to decode cache entry; treating as miss");
                return Ok(LookupResult { status: EntryStatus::LookupError, cached_response: None, stored_at: None });
            }
        };

        if !self.vary_matches(&entry, req) {
            return Ok(LookupResult { status: EntryStatus::Invalid, cached_response: None, stored_at: None });
        }

        let stored_at = entry.stored_at();
        let status = self.requires_validation(&lookup.request_cache_control, &entry, now);
        Ok(LookupResult { status, cached_response: Some(entry.body), stored_at: Some(stored_at) })
    }

    /// Checks the stored response's `Vary` header (if any) against the
    /// allow-list and the current request's header values, comparing
    /// against the identifier captured at store time.
    fn vary_matches(&self, entry: &Entry, req: &RequestInfo) -> bool {
        let vary_names = vary_names_of(&entry.body);
        if vary_names.is_empty() {
            return true;
        }
        let config = self.config.current();
        let current_ident = vary_identifier(&vary_names, &req.as_http_response_shape(), &config.vary_allow_list);
        match (&entry.vary_key, current_ident) {
            (Some(stored), Some(current)) => *stored == current,
            _ => false,
        }
    }

    fn requires_validation(
        &self,
        request_cc: &RequestCacheControl,
        entry: &Entry,
        now: SystemTime,
    ) -> EntryStatus {
        let stored = &entry.body;
        let response_cc = parse_response_cache_control(&joined(stored, "cache-control"));
        let date = stored.header("date").map(parse_http_date);
        let age = current_age(date, stored.header("age"), entry.stored_at(), now);
        let age_secs = age.as_secs() as i64;

        if response_cc.must_validate || request_cc.no_cache {
            return EntryStatus::RequiresValidation;
        }
        if request_cc.max_age >= 0 && request_cc.max_age < age_secs {
            return EntryStatus::RequiresValidation;
        }

        let expires = stored.header("expires").map(parse_http_date);
        let freshness = match freshness_lifetime(&response_cc, date, expires) {
            Some(f) => f,
            None => return EntryStatus::RequiresValidation,
        };

        if age_secs > freshness {
            let stale_by = age_secs - freshness;
            let allowed = match request_cc.max_stale {
                Some(bound) if !response_cc.no_stale => bound < 0 || bound > stale_by,
                _ => false,
            };
            return if allowed { EntryStatus::Ok } else { EntryStatus::RequiresValidation };
        }

        if request_cc.min_fresh >= 0 && request_cc.min_fresh > freshness - age_secs {
            return EntryStatus::RequiresValidation;
        }

        EntryStatus::Ok
    }

    /// `Store`: serializes the response and writes it under the TTL derived
    /// from the request path. If the response carries `Vary`, the
    /// identifier is computed from the request that produced it and
    /// persisted alongside the entry.
    pub async fn store(&self, lookup: &LookupRequest, response: &HttpResponse) -> CacheResult<()> {
        let ttl = self.ttl_for_path(&lookup.primary_key.path);
        let vary_names = vary_names_of(response);
        let vary_key = if vary_names.is_empty() {
            None
        } else {
            let config = self.config.current();
            match vary_identifier(&vary_names, &lookup.headers, &config.vary_allow_list) {
                Some(id) => Some(id),
                // Refused by Vary policy (`Vary: *` or a disallowed name):
                // drop any stale entry and skip the write entirely.
                None => return self.delete(lookup).await.map(|_| ()),
            }
        };
        let entry = Entry::with_vary_key(response.clone(), lookup.now, vary_key);
        let bytes = entry.encode()?;
        self.storage.set(&lookup.primary_key.to_key_string(), bytes, ttl).await
    }

    fn ttl_for_path(&self, path: &str) -> Duration {
        self.config.current().resolve_ttl(path)
    }

    pub async fn delete(&self, lookup: &LookupRequest) -> CacheResult<bool> {
        self.storage.delete(&lookup.primary_key.to_key_string()).await
    }

    pub async fn delete_key(&self, key: &str) -> CacheResult<bool> {
        self.storage.delete(key).await
    }

    pub async fn purge(&self, pattern: &str) -> CacheResult<()> {
        self.storage.purge(pattern).await
    }

    pub async fn flush(&self) -> CacheResult<()> {
        self.storage.flush().await
    }

    pub async fn keys(&self, prefix: &str) -> CacheResult<Vec<String>> {
        self.storage.keys(prefix).await
    }

    pub fn config(&self) -> Arc<KacheConfig> {
        Arc::clone(&self.config)
    }
}

/// Joins every occurrence of `name` on a response with `,`, the way
/// multiple `Cache-Control` header instances are combined for parsing.
fn joined(response: &HttpResponse, name: &str) -> String {
    response.header_values(name).join(", ")
}

/// Extracts the varied header names from a response's `Vary` header, in
/// order, duplicates removed.
fn vary_names_of(response: &HttpResponse) -> Vec<String> {
    response
        .header_values("vary")
        .iter()
        .flat_map(|v| v.split(',').map(|s| s.trim().to_string()))
        .filter(|s| !s.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use kache_storage::InMemoryStore;
    use kache_types::HttpVersion;
    use std::time::Duration;

    fn engine() -> Engine<InMemoryStore> {
        let storage = Arc::new(InMemoryStore::new(1_000_000, 100_000, true));
        let config = Arc::new(KacheConfig::default());
        Engine::new(storage, config)
    }

    fn req(method: &str, headers: Vec<(&str, &str)>) -> RequestInfo {
        RequestInfo {
            method: method.to_string(),
            scheme: "https".to_string(),
            host: "example.com".to_string(),
            path: "/a".to_string(),
            raw_query: String::new(),
            headers: headers.into_iter().map(|(k, v)| (k.to_string(), v.to_string())).collect(),
        }
    }

    #[test]
    fn conditional_headers_make_request_uncacheable() {
        let e = engine();
        assert!(!e.is_cacheable_request(&req("GET", vec![("If-None-Match", "abc")])));
        assert!(e.is_cacheable_request(&req("GET", vec![])));
    }

    #[test]
    fn post_is_not_cacheable() {
        let e = engine();
        assert!(!e.is_cacheable_request(&req("POST", vec![])));
    }

    #[test]
    fn no_store_or_private_response_not_cacheable() {
        let e = engine();
        let resp = HttpResponse {
            status: 200,
            version: HttpVersion::Http11,
            headers: vec![("Cache-Control".into(), "no-store".into())],
            body: vec![],
        };
        assert!(!e.is_cacheable_response(&resp));

        let resp2 = HttpResponse {
            status: 200,
            version: HttpVersion::Http11,
            headers: vec![("Cache-Control".into(), "private".into())],
            body: vec![],
        };
        assert!(!e.is_cacheable_response(&resp2));
    }

    #[test]
    fn response_without_freshness_data_is_not_cacheable() {
        let e = engine();
        let resp = HttpResponse { status: 200, version: HttpVersion::Http11, headers: vec![], body: vec![] };
        assert!(!e.is_cacheable_response(&resp));
    }

    #[tokio::test]
    async fn miss_then_insert_then_hit_with_age() {
        let e = engine();
        let request = req("GET", vec![]);
        let t0 = SystemTime::UNIX_EPOCH + Duration::from_secs(1_000_000);

        let miss = e.fetch(t0, &request).await.unwrap();
        assert_eq!(miss.status, EntryStatus::Invalid);

        let resp = HttpResponse {
            status: 200,
            version: HttpVersion::Http11,
            headers: vec![
                ("Date".into(), httpdate::fmt_http_date(t0)),
                ("Cache-Control".into(), "public, max-age=3600".into()),
            ],
            body: b"42".to_vec(),
        };
        let lookup = e.build_lookup_request(&request, t0);
        e.store(&lookup, &resp).await.unwrap();

        let t10 = t0 + Duration::from_secs(10);
        let hit = e.fetch(t10, &request).await.unwrap();
        assert_eq!(hit.status, EntryStatus::Ok);
        assert_eq!(hit.cached_response.unwrap().body, b"42".to_vec());
    }

    #[tokio::test]
    async fn stale_response_requires_validation() {
        let e = engine();
        let request = req("GET", vec![]);
        let t0 = SystemTime::UNIX_EPOCH + Duration::from_secs(2_000_000);
        let resp = HttpResponse {
            status: 200,
            version: HttpVersion::Http11,
            headers: vec![
                ("Date".into(), httpdate::fmt_http_date(t0)),
                ("Cache-Control".into(), "max-age=10".into()),
                ("Etag".into(), "abc123".into()),
            ],
            body: b"a".to_vec(),
        };
        let lookup = e.build_lookup_request(&request, t0);
        e.store(&lookup, &resp).await.unwrap();

        let t11 = t0 + Duration::from_secs(11);
        let result = e.fetch(t11, &request).await.unwrap();
        assert_eq!(result.status, EntryStatus::RequiresValidation);
    }

    #[tokio::test]
    async fn pragma_no_cache_without_cache_control_requires_validation() {
        let e = engine();
        let request = req("GET", vec![("Pragma", "no-cache")]);
        let t0 = SystemTime::UNIX_EPOCH + Duration::from_secs(3_000_000);
        let resp = HttpResponse {
            status: 200,
            version: HttpVersion::Http11,
            headers: vec![
                ("Date".into(), httpdate::fmt_http_date(t0)),
                ("Cache-Control".into(), "max-age=3600".into()),
            ],
            body: b"x".to_vec(),
        };
        let lookup = e.build_lookup_request(&request, t0);
        e.store(&lookup, &resp).await.unwrap();

        let result = e.fetch(t0 + Duration::from_secs(5), &request).await.unwrap();
        assert_eq!(result.status, EntryStatus::RequiresValidation);
    }

    #[tokio::test]
    async fn pragma_ignored_when_cache_control_present() {
        let e = engine();
        let request = req("GET", vec![("Pragma", "no-cache"), ("Cache-Control", "max-age=10")]);
        let t0 = SystemTime::UNIX_EPOCH + Duration::from_secs(4_000_000);
        let resp = HttpResponse {
            status: 200,
            version: HttpVersion::Http11,
            headers: vec![
                ("Date".into(), httpdate::fmt_http_date(t0)),
                ("Cache-Control".into(), "max-age=3600".into()),
            ],
            body: b"x".to_vec(),
        };
        let lookup = e.build_lookup_request(&request, t0);
        e.store(&lookup, &resp).await.unwrap();

        let result = e.fetch(t0 + Duration::from_secs(5), &request).await.unwrap();
        assert_eq!(result.status, EntryStatus::Ok);
    }
}
