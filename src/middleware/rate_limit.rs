//! Fixed-window rate limiting middleware.
//!
//! # Algorithm
//!
//! Each client key owns a counter and a window-reset instant. The first
//! request of a window sets the counter to 1 and the reset instant to
//! `now + window`; later requests increment it. A request that pushes the
//! counter past the maximum is answered with 429 and a `Retry-After` equal
//! to the time left in the window. Counters are kept in a [`KeyedStore`]
//! whose `update` is atomic, so concurrent requests from one client are
//! counted exactly once each.
//!
//! # Keying
//!
//! Both limiters key by client IP as resolved by
//! [`crate::middleware::ip`]. Two limiters run in the pipeline:
//!
//! - **auth**: `/api/auth/*`, default 5 per 15 minutes, logout exempt
//! - **general**: `/api/*`, default 100 per 15 minutes
//!
//! Their stores are disjoint; an auth request counts against both.
//!
//! # Response Headers
//!
//! - `X-RateLimit-Limit`, `X-RateLimit-Remaining` on every limited-scope response
//! - `Retry-After` on 429

use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use axum::body::Body;
use axum::http::{HeaderValue, Method, Request, Response, header};
use axum::response::IntoResponse;
use tower::{Layer, Service};
use tracing::warn;

use super::ip::ClientIp;
use crate::error::AppError;
use crate::metrics;
use crate::storage::{KeyedStore, MemoryStore};

pub const RATE_LIMIT_LIMIT_HEADER: &str = "x-ratelimit-limit";
pub const RATE_LIMIT_REMAINING_HEADER: &str = "x-ratelimit-remaining";

/// Per-key counter state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowEntry {
    pub hits: u32,
    pub reset_at: Instant,
}

/// Outcome of counting one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateDecision {
    Allowed { remaining: u32, reset_in: Duration },
    Limited { retry_after: Duration },
}

/// Fixed-window counter over a [`KeyedStore`].
pub struct FixedWindowLimiter {
    name: &'static str,
    window: Duration,
    max: u32,
    store: Arc<dyn KeyedStore<WindowEntry>>,
}

impl std::fmt::Debug for FixedWindowLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FixedWindowLimiter")
            .field("name", &self.name)
            .field("window", &self.window)
            .field("max", &self.max)
            .field("keys", &self.store.len())
            .finish()
    }
}

impl FixedWindowLimiter {
    /// Limiter with a private in-memory store.
    pub fn new(name: &'static str, window: Duration, max: u32) -> Self {
        Self::with_store(name, window, max, Arc::new(MemoryStore::new()))
    }

    pub fn with_store(
        name: &'static str,
        window: Duration,
        max: u32,
        store: Arc<dyn KeyedStore<WindowEntry>>,
    ) -> Self {
        Self {
            name,
            window,
            max,
            store,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn max(&self) -> u32 {
        self.max
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Count one request for `key`.
    pub fn check(&self, key: &str) -> RateDecision {
        self.check_at(key, Instant::now())
    }

    /// Count one request for `key` as of `now`.
    pub fn check_at(&self, key: &str, now: Instant) -> RateDecision {
        let window = self.window;
        let entry = self.store.update(key, &mut |current| match current {
            Some(entry) if now < entry.reset_at => WindowEntry {
                hits: entry.hits.saturating_add(1),
                reset_at: entry.reset_at,
            },
            _ => WindowEntry {
                hits: 1,
                reset_at: now + window,
            },
        });

        let reset_in = entry.reset_at.saturating_duration_since(now);
        if entry.hits > self.max {
            RateDecision::Limited {
                retry_after: reset_in,
            }
        } else {
            RateDecision::Allowed {
                remaining: self.max - entry.hits,
                reset_in,
            }
        }
    }

    /// Drop counters whose window has ended.
    pub fn sweep(&self, now: Instant) -> usize {
        self.store.sweep(&|entry| entry.reset_at <= now)
    }

    pub fn tracked_keys(&self) -> usize {
        self.store.len()
    }
}

// =============================================================================
// Tower Layer
// =============================================================================

/// Which requests a limiter counts.
#[derive(Debug, Clone)]
pub struct RateLimitScope {
    prefix: &'static str,
    exempt: Vec<(Method, &'static str)>,
}

impl RateLimitScope {
    pub fn prefix(prefix: &'static str) -> Self {
        Self {
            prefix,
            exempt: Vec::new(),
        }
    }

    pub fn exempt(mut self, method: Method, path: &'static str) -> Self {
        self.exempt.push((method, path));
        self
    }

    pub fn applies_to(&self, method: &Method, path: &str) -> bool {
        path.starts_with(self.prefix)
            && !self
                .exempt
                .iter()
                .any(|(m, p)| m == method && *p == path)
    }
}

/// Rate limiting layer for Tower middleware stack.
///
/// # Example
///
/// ```rust,ignore
/// let limiter = Arc::new(FixedWindowLimiter::new("auth", Duration::from_secs(900), 5));
/// let scope = RateLimitScope::prefix("/api/auth/").exempt(Method::POST, "/api/auth/logout");
/// let app = Router::new().layer(RateLimitLayer::new(limiter, scope));
/// ```
#[derive(Clone)]
pub struct RateLimitLayer {
    limiter: Arc<FixedWindowLimiter>,
    scope: Arc<RateLimitScope>,
}

impl RateLimitLayer {
    pub fn new(limiter: Arc<FixedWindowLimiter>, scope: RateLimitScope) -> Self {
        Self {
            limiter,
            scope: Arc::new(scope),
        }
    }
}

impl<S> Layer<S> for RateLimitLayer {
    type Service = RateLimitService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RateLimitService {
            inner,
            limiter: self.limiter.clone(),
            scope: self.scope.clone(),
        }
    }
}

/// Rate limiting service wrapper.
#[derive(Clone)]
pub struct RateLimitService<S> {
    inner: S,
    limiter: Arc<FixedWindowLimiter>,
    scope: Arc<RateLimitScope>,
}

impl<S> Service<Request<Body>> for RateLimitService<S>
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

        if !self.scope.applies_to(req.method(), req.uri().path()) {
            return Box::pin(async move { inner.call(req).await });
        }

        let limit = self.limiter.max();
        let decision = self.limiter.check(ClientIp::of(&req));

        match decision {
            RateDecision::Allowed { remaining, .. } => Box::pin(async move {
                let mut response = inner.call(req).await?;
                set_limit_headers(&mut response, limit, remaining);
                Ok(response)
            }),
            RateDecision::Limited { retry_after } => {
                // The body is never logged.
                warn!(
                    limiter = self.limiter.name(),
                    client_ip = %ClientIp::of(&req),
                    user_agent = req
                        .headers()
                        .get(header::USER_AGENT)
                        .and_then(|v| v.to_str().ok())
                        .unwrap_or("-"),
                    method = %req.method(),
                    path = %req.uri().path(),
                    retry_after_secs = retry_after.as_secs(),
                    "Rate limit exceeded"
                );
                metrics::record_rate_limited(self.limiter.name());

                let mut response = AppError::RateLimited {
                    message: "Too many requests, please try again later.".to_string(),
                    retry_after,
                }
                .into_response();
                set_limit_headers(&mut response, limit, 0);

                Box::pin(async move { Ok(response) })
            }
        }
    }
}

fn set_limit_headers(response: &mut Response<Body>, limit: u32, remaining: u32) {
    let headers = response.headers_mut();
    headers.insert(RATE_LIMIT_LIMIT_HEADER, HeaderValue::from(limit));
    headers.insert(RATE_LIMIT_REMAINING_HEADER, HeaderValue::from(remaining));
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    const WINDOW: Duration = Duration::from_secs(900);

    #[test]
    fn test_allows_up_to_max_then_limits() {
        let limiter = FixedWindowLimiter::new("auth", WINDOW, 5);
        let start = Instant::now();

        for expected_remaining in (0..5).rev() {
            match limiter.check_at("1.2.3.4", start) {
                RateDecision::Allowed { remaining, .. } => {
                    assert_eq!(remaining, expected_remaining)
                }
                other => panic!("unexpected {other:?}"),
            }
        }

        let later = start + Duration::from_secs(60);
        match limiter.check_at("1.2.3.4", later) {
            RateDecision::Limited { retry_after } => {
                assert_eq!(retry_after, WINDOW - Duration::from_secs(60));
                assert!(retry_after <= WINDOW);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_window_reset_allows_again() {
        let limiter = FixedWindowLimiter::new("auth", WINDOW, 1);
        let start = Instant::now();

        assert!(matches!(
            limiter.check_at("k", start),
            RateDecision::Allowed { .. }
        ));
        assert!(matches!(
            limiter.check_at("k", start + Duration::from_secs(1)),
            RateDecision::Limited { .. }
        ));
        assert!(matches!(
            limiter.check_at("k", start + WINDOW),
            RateDecision::Allowed { remaining: 0, .. }
        ));
    }

    #[test]
    fn test_keys_are_independent() {
        let limiter = FixedWindowLimiter::new("general", WINDOW, 1);
        let now = Instant::now();
        assert!(matches!(limiter.check_at("a", now), RateDecision::Allowed { .. }));
        assert!(matches!(limiter.check_at("b", now), RateDecision::Allowed { .. }));
        assert!(matches!(limiter.check_at("a", now), RateDecision::Limited { .. }));
    }

    #[test]
    fn test_sweep_drops_expired_windows() {
        let limiter = FixedWindowLimiter::new("general", WINDOW, 10);
        let now = Instant::now();
        limiter.check_at("old", now);
        limiter.check_at("new", now + Duration::from_secs(600));

        assert_eq!(limiter.sweep(now + WINDOW), 1);
        assert_eq!(limiter.tracked_keys(), 1);
    }

    #[test]
    fn test_scope_prefix_and_exemption() {
        let scope =
            RateLimitScope::prefix("/api/auth/").exempt(Method::POST, "/api/auth/logout");

        assert!(scope.applies_to(&Method::POST, "/api/auth/login"));
        assert!(!scope.applies_to(&Method::POST, "/api/auth/logout"));
        assert!(scope.applies_to(&Method::GET, "/api/auth/logout"));
        assert!(!scope.applies_to(&Method::GET, "/api/home"));
        assert!(!scope.applies_to(&Method::GET, "/health"));
    }
}
