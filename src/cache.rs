//! TTL response caches for content routes.
//!
//! Two caches back the content API: a long-lived one for static blocks and a
//! short-lived one for statistics. Only `GET` requests are cached and only
//! successful JSON responses are stored.
//!
//! # Keys
//!
//! `{METHOD}:{path}`, plus `:{base64(json(query))}` when the query string is
//! non-empty. Query parameters are serialized as a JSON object with sorted
//! keys, so `?a=1&b=2` and `?b=2&a=1` share an entry.
//!
//! # Response Headers
//!
//! - `X-Cache`: `HIT`, `MISS` or `DISABLED`
//! - `X-Cache-TTL`: seconds the served entry has left to live

use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use axum::body::{Body, Bytes};
use axum::http::{HeaderValue, Method, Request, Response, StatusCode, Uri, header};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use http_body_util::BodyExt;
use moka::sync::Cache;
use serde::Serialize;
use tower::{Layer, Service};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::metrics;

pub const CACHE_STATUS_HEADER: &str = "x-cache";
pub const CACHE_TTL_HEADER: &str = "x-cache-ttl";

/// Share of `max_keys` at which [`ResponseCache::monitor`] starts warning.
pub const KEY_USAGE_WARN_RATIO: f64 = 0.9;
/// Estimated total size at which [`ResponseCache::monitor`] starts warning.
pub const MEMORY_WARN_BYTES: u64 = 50 * 1024 * 1024;

/// One of the two caches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheKind {
    Static,
    Dynamic,
}

impl CacheKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Static => "static",
            Self::Dynamic => "dynamic",
        }
    }
}

/// Which caches an invalidation applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheTarget {
    Static,
    Dynamic,
    Both,
}

impl CacheTarget {
    fn includes(self, kind: CacheKind) -> bool {
        matches!(
            (self, kind),
            (Self::Both, _)
                | (Self::Static, CacheKind::Static)
                | (Self::Dynamic, CacheKind::Dynamic)
        )
    }
}

#[derive(Debug, Clone)]
pub struct CachedResponse {
    pub status: StatusCode,
    pub body: Bytes,
    pub content_type: HeaderValue,
    pub stored_at: Instant,
}

/// A single bounded cache with a fixed time-to-live.
pub struct TtlCache {
    kind: CacheKind,
    ttl: Duration,
    max_keys: u64,
    entries: Cache<String, CachedResponse>,
}

impl TtlCache {
    pub fn new(kind: CacheKind, ttl: Duration, max_keys: u64) -> Self {
        let entries = Cache::builder()
            .max_capacity(max_keys)
            .time_to_live(ttl)
            .build();
        Self {
            kind,
            ttl,
            max_keys,
            entries,
        }
    }

    pub fn kind(&self) -> CacheKind {
        self.kind
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Live entry for `key` and its remaining time-to-live.
    pub fn get(&self, key: &str) -> Option<(CachedResponse, Duration)> {
        let entry = self.entries.get(key)?;
        let remaining = self.ttl.checked_sub(entry.stored_at.elapsed())?;
        if remaining.is_zero() {
            self.entries.invalidate(key);
            return None;
        }
        Some((entry, remaining))
    }

    pub fn insert(
        &self,
        key: String,
        status: StatusCode,
        body: Bytes,
        content_type: HeaderValue,
    ) {
        self.entries.insert(
            key,
            CachedResponse {
                status,
                body,
                content_type,
                stored_at: Instant::now(),
            },
        );
    }

    /// Remove every key containing `pattern`. Returns how many were removed.
    pub fn invalidate_matching(&self, pattern: &str) -> usize {
        let keys: Vec<Arc<String>> = self
            .entries
            .iter()
            .filter(|(key, _)| key.contains(pattern))
            .map(|(key, _)| key)
            .collect();
        for key in &keys {
            self.entries.invalidate(key.as_str());
        }
        keys.len()
    }

    pub fn stats(&self) -> CacheStats {
        self.entries.run_pending_tasks();
        let memory_bytes = self
            .entries
            .iter()
            .map(|(key, entry)| (key.len() + entry.body.len() + entry.content_type.len()) as u64)
            .sum();
        CacheStats {
            keys: self.entries.entry_count(),
            max_keys: self.max_keys,
            ttl_secs: self.ttl.as_secs(),
            memory_bytes,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    pub keys: u64,
    pub max_keys: u64,
    pub ttl_secs: u64,
    pub memory_bytes: u64,
}

impl CacheStats {
    pub fn near_capacity(&self) -> bool {
        self.max_keys > 0 && self.keys as f64 >= self.max_keys as f64 * KEY_USAGE_WARN_RATIO
    }
}

#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheReport {
    pub enabled: bool,
    #[serde(rename = "static")]
    pub static_cache: CacheStats,
    #[serde(rename = "dynamic")]
    pub dynamic_cache: CacheStats,
    pub total_memory_bytes: u64,
}

/// Static and dynamic caches plus the global bypass switch.
pub struct ResponseCache {
    static_cache: Arc<TtlCache>,
    dynamic_cache: Arc<TtlCache>,
    disabled: bool,
}

impl ResponseCache {
    pub fn new(
        static_ttl: Duration,
        static_max_keys: u64,
        dynamic_ttl: Duration,
        dynamic_max_keys: u64,
        disabled: bool,
    ) -> Self {
        Self {
            static_cache: Arc::new(TtlCache::new(CacheKind::Static, static_ttl, static_max_keys)),
            dynamic_cache: Arc::new(TtlCache::new(
                CacheKind::Dynamic,
                dynamic_ttl,
                dynamic_max_keys,
            )),
            disabled,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        if config.disable_cache {
            info!("Response caching disabled (DISABLE_CACHE=true)");
        }
        Self::new(
            config.cache_ttl_static,
            config.cache_max_keys_static,
            config.cache_ttl_dynamic,
            config.cache_max_keys_dynamic,
            config.disable_cache,
        )
    }

    pub fn is_disabled(&self) -> bool {
        self.disabled
    }

    pub fn cache(&self, kind: CacheKind) -> &Arc<TtlCache> {
        match kind {
            CacheKind::Static => &self.static_cache,
            CacheKind::Dynamic => &self.dynamic_cache,
        }
    }

    /// Middleware caching responses in the `kind` cache.
    pub fn layer(&self, kind: CacheKind) -> CacheLayer {
        CacheLayer {
            cache: self.cache(kind).clone(),
            disabled: self.disabled,
        }
    }

    /// Remove keys containing `pattern` from the targeted caches.
    pub fn invalidate(&self, pattern: &str, target: CacheTarget) -> usize {
        let removed: usize = [&self.static_cache, &self.dynamic_cache]
            .into_iter()
            .filter(|cache| target.includes(cache.kind()))
            .map(|cache| cache.invalidate_matching(pattern))
            .sum();
        info!(pattern, ?target, removed, "Invalidated cache entries");
        removed
    }

    /// Current key counts and estimated memory, warning when a cache is close
    /// to capacity or the total estimate is large.
    pub fn monitor(&self) -> CacheReport {
        let static_cache = self.static_cache.stats();
        let dynamic_cache = self.dynamic_cache.stats();
        let total_memory_bytes = static_cache.memory_bytes + dynamic_cache.memory_bytes;

        for (kind, stats) in [
            (CacheKind::Static, static_cache),
            (CacheKind::Dynamic, dynamic_cache),
        ] {
            metrics::set_cache_keys(kind.as_str(), stats.keys);
            if stats.near_capacity() {
                warn!(
                    cache = kind.as_str(),
                    keys = stats.keys,
                    max_keys = stats.max_keys,
                    "Response cache is near its key capacity"
                );
            }
        }
        if total_memory_bytes > MEMORY_WARN_BYTES {
            warn!(
                total_memory_bytes,
                threshold = MEMORY_WARN_BYTES,
                "Response caches exceed memory threshold"
            );
        }

        CacheReport {
            enabled: !self.disabled,
            static_cache,
            dynamic_cache,
            total_memory_bytes,
        }
    }
}

/// Cache key for a request. Method and path always; the query as base64 JSON
/// only when present.
pub fn cache_key(method: &Method, uri: &Uri) -> String {
    let base = format!("{}:{}", method, uri.path());
    match uri.query().filter(|q| !q.is_empty()) {
        Some(query) => {
            let params: serde_json::Map<String, serde_json::Value> =
                url::form_urlencoded::parse(query.as_bytes())
                    .map(|(k, v)| (k.into_owned(), serde_json::Value::String(v.into_owned())))
                    .collect();
            let encoded = serde_json::to_vec(&params).unwrap_or_default();
            format!("{base}:{}", STANDARD.encode(encoded))
        }
        None => base,
    }
}

// =============================================================================
// Tower Layer
// =============================================================================

#[derive(Clone)]
pub struct CacheLayer {
    cache: Arc<TtlCache>,
    disabled: bool,
}

impl<S> Layer<S> for CacheLayer {
    type Service = CacheService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        CacheService {
            inner,
            cache: self.cache.clone(),
            disabled: self.disabled,
        }
    }
}

#[derive(Clone)]
pub struct CacheService<S> {
    inner: S,
    cache: Arc<TtlCache>,
    disabled: bool,
}

impl<S> Service<Request<Body>> for CacheService<S>
where
    S: Service<Request<Body>, Response = Response<Body>> + Clone + Send + 'static,
    S::Future: Send,
{
    type Response = Response<Body>;
    type Error = S::Error;
    type Future = std::pin::Pin<
        Box<dyn std::future::Future<Output = Result<Self::Response, Self::Error>> + Send>,
    >;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<Body>) -> Self::Future {
        let mut inner = self.inner.clone();
        let name = self.cache.kind().as_str();

        if req.method() != Method::GET {
            return Box::pin(async move { inner.call(req).await });
        }

        if self.disabled {
            metrics::record_cache_lookup(name, "disabled");
            return Box::pin(async move {
                let mut response = inner.call(req).await?;
                response
                    .headers_mut()
                    .insert(CACHE_STATUS_HEADER, HeaderValue::from_static("DISABLED"));
                Ok(response)
            });
        }

        let key = cache_key(req.method(), req.uri());

        if let Some((entry, remaining)) = self.cache.get(&key) {
            debug!(cache = name, key = %key, "Cache hit");
            metrics::record_cache_lookup(name, "hit");
            let mut response = Response::new(Body::from(entry.body));
            *response.status_mut() = entry.status;
            let headers = response.headers_mut();
            headers.insert(header::CONTENT_TYPE, entry.content_type);
            set_cache_headers(headers, "HIT", remaining);
            return Box::pin(async move { Ok(response) });
        }

        debug!(cache = name, key = %key, "Cache miss");
        metrics::record_cache_lookup(name, "miss");
        let cache = self.cache.clone();

        Box::pin(async move {
            let response = inner.call(req).await?;
            let mut response = store_if_cacheable(&cache, key, response).await;
            set_cache_headers(response.headers_mut(), "MISS", cache.ttl());
            Ok(response)
        })
    }
}

fn set_cache_headers(headers: &mut axum::http::HeaderMap, status: &'static str, ttl: Duration) {
    headers.insert(CACHE_STATUS_HEADER, HeaderValue::from_static(status));
    headers.insert(CACHE_TTL_HEADER, HeaderValue::from(ttl.as_secs()));
}

fn is_json(content_type: &HeaderValue) -> bool {
    content_type
        .to_str()
        .map(|v| v.to_ascii_lowercase().starts_with("application/json"))
        .unwrap_or(false)
}

/// Buffer and store a successful JSON response, returning an equivalent one.
async fn store_if_cacheable(
    cache: &TtlCache,
    key: String,
    response: Response<Body>,
) -> Response<Body> {
    let content_type = match response.headers().get(header::CONTENT_TYPE) {
        Some(ct) if response.status().is_success() && is_json(ct) => ct.clone(),
        _ => return response,
    };

    let (parts, body) = response.into_parts();
    match body.collect().await {
        Ok(collected) => {
            let bytes = collected.to_bytes();
            cache.insert(key, parts.status, bytes.clone(), content_type);
            Response::from_parts(parts, Body::from(bytes))
        }
        Err(e) => {
            warn!(error = %e, "Failed to buffer response for caching");
            let mut response = Response::from_parts(parts, Body::empty());
            *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
            response
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use axum::Router;
    use axum::routing::get;
    use serde_json::json;
    use tower::ServiceExt;

    use super::*;

    fn counting_app(cache: &ResponseCache, kind: CacheKind) -> (Router, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let app = Router::new()
            .route(
                "/api/home",
                get(move || {
                    let counter = counter.clone();
                    async move {
                        let n = counter.fetch_add(1, Ordering::SeqCst);
                        axum::Json(json!({ "call": n }))
                    }
                }),
            )
            .route_layer(cache.layer(kind));
        (app, calls)
    }

    async fn get_uri(app: &Router, uri: &str) -> Response<Body> {
        app.clone()
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap()
    }

    async fn body_bytes(response: Response<Body>) -> Bytes {
        axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap()
    }

    #[test]
    fn test_cache_key_format() {
        let uri: Uri = "/api/home".parse().unwrap();
        assert_eq!(cache_key(&Method::GET, &uri), "GET:/api/home");

        let a: Uri = "/api/home?b=2&a=1".parse().unwrap();
        let b: Uri = "/api/home?a=1&b=2".parse().unwrap();
        let key = cache_key(&Method::GET, &a);
        assert_eq!(key, cache_key(&Method::GET, &b));
        let encoded = key.strip_prefix("GET:/api/home:").unwrap();
        let decoded = STANDARD.decode(encoded).unwrap();
        assert_eq!(decoded, br#"{"a":"1","b":"2"}"#);
    }

    #[tokio::test]
    async fn test_miss_then_hit_with_equal_bodies() {
        let cache = ResponseCache::new(
            Duration::from_secs(300),
            100,
            Duration::from_secs(30),
            50,
            false,
        );
        let (app, calls) = counting_app(&cache, CacheKind::Static);

        let first = get_uri(&app, "/api/home").await;
        assert_eq!(first.headers()[CACHE_STATUS_HEADER], "MISS");
        assert_eq!(first.headers()[CACHE_TTL_HEADER], "300");
        let first_body = body_bytes(first).await;

        let second = get_uri(&app, "/api/home").await;
        assert_eq!(second.headers()[CACHE_STATUS_HEADER], "HIT");
        assert_eq!(
            second.headers()[header::CONTENT_TYPE],
            "application/json"
        );
        let ttl: u64 = second.headers()[CACHE_TTL_HEADER]
            .to_str()
            .unwrap()
            .parse()
            .unwrap();
        assert!(ttl <= 300);
        assert_eq!(body_bytes(second).await, first_body);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_hit_replays_stored_status() {
        let cache = ResponseCache::new(
            Duration::from_secs(300),
            100,
            Duration::from_secs(30),
            50,
            false,
        );
        let app = Router::new()
            .route(
                "/api/home",
                get(|| async { (StatusCode::ACCEPTED, axum::Json(json!({ "queued": true }))) }),
            )
            .route_layer(cache.layer(CacheKind::Static));

        let first = get_uri(&app, "/api/home").await;
        assert_eq!(first.status(), StatusCode::ACCEPTED);
        assert_eq!(first.headers()[CACHE_STATUS_HEADER], "MISS");

        let second = get_uri(&app, "/api/home").await;
        assert_eq!(second.headers()[CACHE_STATUS_HEADER], "HIT");
        assert_eq!(second.status(), StatusCode::ACCEPTED);
    }

    #[tokio::test]
    async fn test_entry_expires_after_ttl() {
        let cache = ResponseCache::new(
            Duration::from_millis(200),
            10,
            Duration::from_secs(30),
            50,
            false,
        );
        let (app, calls) = counting_app(&cache, CacheKind::Static);

        get_uri(&app, "/api/home").await;
        get_uri(&app, "/api/home").await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_millis(300)).await;
        let response = get_uri(&app, "/api/home").await;
        assert_eq!(response.headers()[CACHE_STATUS_HEADER], "MISS");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_disabled_passes_through() {
        let cache = ResponseCache::new(
            Duration::from_secs(300),
            100,
            Duration::from_secs(30),
            50,
            true,
        );
        let (app, calls) = counting_app(&cache, CacheKind::Dynamic);
        for _ in 0..2 {
            let response = get_uri(&app, "/api/home").await;
            assert_eq!(response.headers()[CACHE_STATUS_HEADER], "DISABLED");
        }
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_invalidate_by_substring_and_target() {
        let cache = ResponseCache::new(
            Duration::from_secs(300),
            100,
            Duration::from_secs(30),
            50,
            false,
        );
        let json = HeaderValue::from_static("application/json");
        let s = cache.cache(CacheKind::Static);
        let ok = StatusCode::OK;
        s.insert("GET:/api/home".into(), ok, Bytes::from_static(b"{}"), json.clone());
        s.insert("GET:/api/peopay".into(), ok, Bytes::from_static(b"{}"), json.clone());
        cache.cache(CacheKind::Dynamic).insert(
            "GET:/api/network-stats".into(),
            ok,
            Bytes::from_static(b"{}"),
            json,
        );

        assert_eq!(cache.invalidate("/api/home", CacheTarget::Dynamic), 0);
        assert_eq!(cache.invalidate("/api/home", CacheTarget::Static), 1);
        assert_eq!(cache.invalidate("GET:", CacheTarget::Both), 2);
        assert!(s.get("GET:/api/peopay").is_none());
    }

    #[test]
    fn test_monitor_reports_capacity() {
        let cache = ResponseCache::new(
            Duration::from_secs(300),
            10,
            Duration::from_secs(30),
            50,
            false,
        );
        let json = HeaderValue::from_static("application/json");
        for i in 0..9 {
            cache.cache(CacheKind::Static).insert(
                format!("GET:/page/{i}"),
                StatusCode::OK,
                Bytes::from_static(b"{\"ok\":true}"),
                json.clone(),
            );
        }
        let report = cache.monitor();
        assert!(report.enabled);
        assert_eq!(report.static_cache.keys, 9);
        assert!(report.static_cache.near_capacity());
        assert!(!report.dynamic_cache.near_capacity());
        assert!(report.total_memory_bytes > 0);
    }
}
