//! The caching transport: threads a request through coalescing and the
//! cache engine. Miss goes upstream; a stale-but-revalidatable entry goes
//! upstream conditionally; a 304 is merged back onto the cached body; the
//! served response drives the store/delete decision.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::task::{Context as TaskContext, Poll};
use std::time::SystemTime;

use bytes::Bytes;
use http::{HeaderValue, Request, Response};
use http_body::Body as HttpBody;
use http_body_util::{BodyExt, Full};
use kache_coalesce::Coalescer;
use kache_engine::engine::{Engine, RequestInfo, MERGE_EXCLUDED_HEADERS};
use kache_types::{CacheError, EntryStatus, HttpResponse, HttpVersion, StorageProvider};
use tower::Service;

use crate::body::ResponseBody;
use crate::error::Error;
use crate::metrics::CacheMetrics;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Tower [`Layer`](tower::Layer) producing a [`CachingTransport`] around an
/// inner upstream service.
#[derive(Clone)]
pub struct CachingTransportLayer<Store: StorageProvider> {
    engine: Arc<Engine<Store>>,
    coalescer: Arc<Coalescer>,
    metrics: Arc<CacheMetrics>,
    default_scheme: String,
}

impl<Store: StorageProvider> CachingTransportLayer<Store> {
    pub fn new(engine: Arc<Engine<Store>>) -> Self {
        Self {
            engine,
            coalescer: Arc::new(Coalescer::new()),
            metrics: Arc::new(CacheMetrics::new()),
            default_scheme: "http".to_string(),
        }
    }

    /// Scheme used for requests whose `http::Uri` has none (the common case
    /// for a server-side listener reconstructing an origin-form request).
    /// A TLS-terminating listener should set this to `"https"`.
    pub fn with_default_scheme(mut self, scheme: impl Into<String>) -> Self {
        self.default_scheme = scheme.into();
        self
    }

    pub fn metrics(&self) -> Arc<CacheMetrics> {
        Arc::clone(&self.metrics)
    }
}

impl<Svc, Store: StorageProvider> tower::Layer<Svc> for CachingTransportLayer<Store> {
    type Service = CachingTransport<Svc, Store>;

    fn layer(&self, inner: Svc) -> Self::Service {
        CachingTransport {
            inner,
            engine: Arc::clone(&self.engine),
            coalescer: Arc::clone(&self.coalescer),
            metrics: Arc::clone(&self.metrics),
            default_scheme: self.default_scheme.clone(),
        }
    }
}

/// A [`tower::Service`] that serves cached responses and otherwise forwards
/// to `inner`, the upstream round-tripper.
#[derive(Clone)]
pub struct CachingTransport<Svc, Store: StorageProvider> {
    inner: Svc,
    engine: Arc<Engine<Store>>,
    coalescer: Arc<Coalescer>,
    metrics: Arc<CacheMetrics>,
    default_scheme: String,
}

impl<Svc, Store: StorageProvider> CachingTransport<Svc, Store> {
    pub fn new(inner: Svc, engine: Arc<Engine<Store>>) -> Self {
        Self {
            inner,
            engine,
            coalescer: Arc::new(Coalescer::new()),
            metrics: Arc::new(CacheMetrics::new()),
            default_scheme: "http".to_string(),
        }
    }

    pub fn metrics(&self) -> Arc<CacheMetrics> {
        Arc::clone(&self.metrics)
    }
}

impl<Svc, ReqBody, ResBody, Store> Service<Request<ReqBody>> for CachingTransport<Svc, Store>
where
    Svc: Service<Request<Full<Bytes>>, Response = Response<ResBody>> + Clone + Send + 'static,
    Svc::Error: Into<BoxError>,
    Svc::Future: Send + 'static,
    Store: StorageProvider + 'static,
    ReqBody: HttpBody<Data = Bytes> + Send + 'static,
    ReqBody::Error: Into<BoxError>,
    ResBody: HttpBody<Data = Bytes> + Send + 'static,
    ResBody::Error: Into<BoxError>,
{
    type Response = Response<ResponseBody>;
    type Error = Error;
    type Future = Pin<Box<dyn Future<Output = std::result::Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut TaskContext<'_>) -> Poll<std::result::Result<(), Self::Error>> {
        self.inner.poll_ready(cx).map_err(|e| Error::Upstream(e.into()))
    }

    fn call(&mut self, req: Request<ReqBody>) -> Self::Future {
        let engine = Arc::clone(&self.engine);
        let coalescer = Arc::clone(&self.coalescer);
        let metrics = Arc::clone(&self.metrics);
        let default_scheme = self.default_scheme.clone();
        let inner = self.inner.clone();

        Box::pin(async move { run(engine, coalescer, metrics, default_scheme, inner, req).await })
    }
}

async fn run<Svc, ReqBody, ResBody, Store>(
    engine: Arc<Engine<Store>>,
    coalescer: Arc<Coalescer>,
    metrics: Arc<CacheMetrics>,
    default_scheme: String,
    mut inner: Svc,
    req: Request<ReqBody>,
) -> std::result::Result<Response<ResponseBody>, Error>
where
    Svc: Service<Request<Full<Bytes>>, Response = Response<ResBody>> + Clone + Send + 'static,
    Svc::Error: Into<BoxError>,
    Svc::Future: Send + 'static,
    Store: StorageProvider + 'static,
    ReqBody: HttpBody<Data = Bytes> + Send + 'static,
    ReqBody::Error: Into<BoxError>,
    ResBody: HttpBody<Data = Bytes> + Send + 'static,
    ResBody::Error: Into<BoxError>,
{
    let t_now = SystemTime::now();
    let (parts, body) = req.into_parts();
    let req_body = collect_body(body).await.map_err(|e| Error::Upstream(e.into()))?;
    let info = request_info(&parts, &default_scheme);

    if !engine.is_cacheable_request(&info) || engine.is_excluded_request(&info) {
        metrics.misses.fetch_add(1, Ordering::Relaxed);
        let upstream_req = Request::from_parts(parts, Full::new(req_body));
        let res = inner.call(upstream_req).await.map_err(|e| Error::Upstream(e.into()))?;
        return Ok(buffer_upstream(res).await.map_err(Error::Upstream)?.map(ResponseBody::Fetched));
    }

    let lookup = engine.fetch(t_now, &info).await?;
    let key = engine.primary_key(&info).to_key_string();
    let coalesce = info.method == "GET";

    match lookup.status {
        EntryStatus::Ok => {
            metrics.hits.fetch_add(1, Ordering::Relaxed);
            let mut served = lookup.cached_response.expect("Ok status always carries a cached response");
            let stored_at = lookup.stored_at.expect("Ok status always carries a stored_at");
            apply_hit_headers(&mut served, &engine, stored_at, t_now);
            Ok(to_response(served)?.map(ResponseBody::Hit))
        }
        EntryStatus::RequiresValidation => {
            metrics.hits.fetch_add(1, Ordering::Relaxed);
            let cached = lookup.cached_response.expect("RequiresValidation always carries a cached response");
            let conditional_parts = conditional_request_parts(&parts, &cached);
            let conditional_body = req_body.clone();

            let mut upstream = inner.clone();
            let upstream_result = coalescer
                .round_trip(&key, coalesce, move || {
                    let req = Request::from_parts(conditional_parts, Full::new(conditional_body));
                    async move {
                        let res = upstream.call(req).await.map_err(|e| CacheError::BackendUnavailable(e.into().to_string()))?;
                        http_response_from(res).await
                    }
                })
                .await?;

            let served = if upstream_result.status == 304 {
                let lookup_req = engine.build_lookup_request(&info, t_now);
                let mut merged = cached.clone();
                merged.merge_headers_except(&upstream_result, MERGE_EXCLUDED_HEADERS);
                merged.remove_header("age");

                if etag_mismatch(&cached, &upstream_result) {
                    tracing::debug!(key, "304 strong ETag disagrees with stored entry; discarding");
                    engine.delete(&lookup_req).await?;
                    metrics.skipped.fetch_add(1, Ordering::Relaxed);
                } else {
                    engine.store(&lookup_req, &merged).await?;
                    metrics.stores.fetch_add(1, Ordering::Relaxed);
                }

                // Just validated: no Age yet, it only reappears on the next fetch.
                mark_hit(&mut merged, &engine);
                merged.remove_header("age");
                merged
            } else {
                store_or_delete(&engine, &info, t_now, &upstream_result, &metrics).await?;
                upstream_result
            };

            Ok(to_response(served)?.map(ResponseBody::Fetched))
        }
        EntryStatus::Invalid | EntryStatus::LookupError => {
            metrics.misses.fetch_add(1, Ordering::Relaxed);
            let original_parts = clone_request_parts(&parts);
            let original_body = req_body.clone();
            let mut upstream = inner.clone();

            let upstream_result = coalescer
                .round_trip(&key, coalesce, move || {
                    let req = Request::from_parts(original_parts, Full::new(original_body));
                    async move {
                        let res = upstream.call(req).await.map_err(|e| CacheError::BackendUnavailable(e.into().to_string()))?;
                        http_response_from(res).await
                    }
                })
                .await?;

            store_or_delete(&engine, &info, t_now, &upstream_result, &metrics).await?;
            Ok(to_response(upstream_result)?.map(ResponseBody::Fetched))
        }
    }
}

/// Step 7: store the served response if it is cacheable and the request
/// wasn't excluded, otherwise drop any stale entry for this key.
async fn store_or_delete<Store: StorageProvider>(
    engine: &Engine<Store>,
    info: &RequestInfo,
    t_now: SystemTime,
    response: &HttpResponse,
    metrics: &CacheMetrics,
) -> kache_types::Result<()> {
    let lookup_req = engine.build_lookup_request(info, t_now);
    let cacheable = info.method != "HEAD"
        && engine.is_cacheable_response(response)
        && !engine.is_excluded_request(info)
        && !engine.is_excluded_response(response);

    if cacheable {
        engine.store(&lookup_req, response).await?;
        metrics.stores.fetch_add(1, Ordering::Relaxed);
    } else {
        metrics.skipped.fetch_add(1, Ordering::Relaxed);
        engine.delete(&lookup_req).await?;
    }
    Ok(())
}

fn request_info(parts: &http::request::Parts, default_scheme: &str) -> RequestInfo {
    let scheme = parts.uri.scheme_str().unwrap_or(default_scheme).to_string();
    let host = parts
        .uri
        .authority()
        .map(|a| a.host().to_string())
        .or_else(|| parts.headers.get(http::header::HOST).and_then(|v| v.to_str().ok()).map(str::to_string))
        .unwrap_or_default();
    let headers = parts
        .headers
        .iter()
        .filter_map(|(k, v)| v.to_str().ok().map(|v| (k.as_str().to_string(), v.to_string())))
        .collect();
    RequestInfo {
        method: parts.method.as_str().to_string(),
        scheme,
        host,
        path: parts.uri.path().to_string(),
        raw_query: parts.uri.query().unwrap_or_default().to_string(),
        headers,
    }
}

/// `http::request::Parts` has no `Clone` impl (its `Extensions` can't be
/// cloned), so rebuilding via the builder is how a second request gets made
/// from the same method/uri/headers/version; extensions don't survive an
/// upstream hop anyway.
fn clone_request_parts(parts: &http::request::Parts) -> http::request::Parts {
    let mut builder = Request::builder().method(parts.method.clone()).uri(parts.uri.clone()).version(parts.version);
    for (name, value) in parts.headers.iter() {
        builder = builder.header(name, value);
    }
    builder.body(()).expect("cloned parts are always valid").into_parts().0
}

fn conditional_request_parts(original: &http::request::Parts, cached: &HttpResponse) -> http::request::Parts {
    let mut parts = clone_request_parts(original);
    if let Some(etag) = cached.header("etag") {
        if let Ok(value) = HeaderValue::from_str(etag) {
            parts.headers.insert(http::header::IF_NONE_MATCH, value);
        }
    }
    let validator_date = cached.header("last-modified").or_else(|| cached.header("date"));
    if let Some(date) = validator_date {
        if let Ok(value) = HeaderValue::from_str(date) {
            parts.headers.insert(http::header::IF_MODIFIED_SINCE, value);
        }
    }
    parts
}

fn mark_hit<Store: StorageProvider>(response: &mut HttpResponse, engine: &Engine<Store>) {
    let config = engine.config().current();
    if config.x_header {
        response.set_header(&config.x_header_name, "HIT");
    }
}

/// Marks `X-Cache: HIT` and recomputes `Age` for a response served straight
/// from a fresh (non-revalidated) entry.
fn apply_hit_headers<Store: StorageProvider>(
    response: &mut HttpResponse,
    engine: &Engine<Store>,
    response_time: SystemTime,
    now: SystemTime,
) {
    mark_hit(response, engine);
    let date = response.header("date").map(kache_engine::parse_http_date);
    let age = kache_engine::current_age(date, response.header("age"), response_time, now);
    response.set_header("age", kache_engine::age_header_value(age).to_string());
}

/// True iff `upstream` carries a strong (non-weak) ETag that disagrees with
/// `cached`'s. A weak validator (`W/"..."`) never triggers a discard.
fn etag_mismatch(cached: &HttpResponse, upstream: &HttpResponse) -> bool {
    match upstream.header("etag") {
        Some(etag) if !etag.starts_with("W/") => {
            cached.header("etag").is_some_and(|stored| stored != etag)
        }
        _ => false,
    }
}

async fn collect_body<B>(body: B) -> std::result::Result<Bytes, B::Error>
where
    B: HttpBody<Data = Bytes>,
{
    Ok(body.collect().await?.to_bytes())
}

async fn buffer_upstream<B>(res: Response<B>) -> std::result::Result<Response<Bytes>, BoxError>
where
    B: HttpBody<Data = Bytes>,
    B::Error: Into<BoxError>,
{
    let (parts, body) = res.into_parts();
    let bytes = body.collect().await.map_err(Into::into)?.to_bytes();
    Ok(Response::from_parts(parts, bytes))
}

async fn http_response_from<B>(res: Response<B>) -> kache_types::Result<HttpResponse>
where
    B: HttpBody<Data = Bytes>,
    B::Error: Into<BoxError>,
{
    let (parts, body) = res.into_parts();
    let bytes = body
        .collect()
        .await
        .map_err(|e| CacheError::BackendUnavailable(e.into().to_string()))?
        .to_bytes();
    let headers = parts
        .headers
        .iter()
        .filter_map(|(k, v)| v.to_str().ok().map(|v| (k.as_str().to_string(), v.to_string())))
        .collect();
    Ok(HttpResponse {
        status: parts.status.as_u16(),
        version: HttpVersion::from(parts.version),
        headers,
        body: bytes.to_vec(),
    })
}

fn to_response(response: HttpResponse) -> std::result::Result<Response<Bytes>, CacheError> {
    let mut builder = Response::builder().status(http::StatusCode::from_u16(response.status)?).version(response.version.into());
    for (name, value) in &response.headers {
        builder = builder.header(name, value.as_str());
    }
    // `unwrap`: status/version were already validated above; header insertion
    // can only fail on the caller-controlled names/values we just validated.
    Ok(builder.body(Bytes::from(response.body)).expect("validated response parts"))
}
