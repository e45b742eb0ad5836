//! Application routing configuration with middleware stack.
//!
//! # Middleware Stack (outermost first)
//!
//! ```text
//! Request
//!    │
//!    ▼
//! ┌──────────────────┐
//! │   Request ID     │ ← Adds X-Request-Id header
//! └────────┬─────────┘
//!          ▼
//! ┌──────────────────┐
//! │ Tracing, metrics │ ← HTTP request/response logging
//! └────────┬─────────┘
//!          ▼
//! ┌──────────────────┐
//! │      CORS        │ ← Cross-origin headers
//! └────────┬─────────┘
//!          ▼
//! ┌──────────────────┐
//! │  Error context   │ ← requestId/path in error envelopes
//! └────────┬─────────┘
//!          ▼
//! ┌──────────────────┐
//! │ Security headers │ ← CSP, HSTS, X-Frame-Options, ...
//! └────────┬─────────┘
//!          ▼
//! ┌──────────────────┐
//! │ Body limit, IP   │ ← Client IP resolved once per request
//! └────────┬─────────┘
//!          ▼
//! ┌──────────────────┐
//! │    Sanitizer     │ ← Strips script injection from query and body
//! └────────┬─────────┘
//!          ▼
//! ┌──────────────────┐
//! │   Brute force    │ ← 429 after repeated failed logins (/auth/ paths)
//! └────────┬─────────┘
//!          ▼
//! ┌──────────────────┐
//! │  Rate limiters   │ ← 429 if exceeded (auth, then general)
//! └────────┬─────────┘
//!          ▼
//!   Route-level layers: session + CSRF on /api/auth/*, caches on content
//! ```
//!
//! # Route Groups
//!
//! - `/health`, `/ready`, `/stats` - Health & monitoring
//! - `/api/auth/*` - Session-backed authentication
//! - `/api/home`, `/api/whitepaper`, ... - Static-cached content
//! - `/api/network-stats`, `/api/validator-stats` - Dynamic-cached statistics

use std::time::Instant;

use axum::Router;
use axum::extract::{DefaultBodyLimit, Request};
use axum::http::{HeaderName, HeaderValue, Method, header};
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::{get, post};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::cache::CacheKind;
use crate::handlers::{self, auth, content};
use crate::metrics;
use crate::middleware::{
    BruteForceLayer, CSRF_HEADER, ErrorContext, REQUEST_ID_HEADER, RateLimitLayer,
    RateLimitScope, RequestIdLayer, SanitizeLayer, csrf_protection, csrf_token_generator,
    error_context, resolve_client_ip, security_headers, session_layer,
};
use crate::state::AppState;

pub const AUTH_PREFIX: &str = "/api/auth/";
pub const API_PREFIX: &str = "/api/";
pub const LOGOUT_PATH: &str = "/api/auth/logout";

/// Build the application router with all routes and middleware configured.
pub fn build_router(state: AppState) -> Router {
    let config = state.config.clone();

    // =========================================================================
    // Content Routes
    // =========================================================================
    let static_routes = Router::new()
        .route("/api/home", get(content::home))
        .route("/api/whitepaper", get(content::whitepaper))
        .route("/api/peopay", get(content::peopay))
        .route("/api/technology", get(content::technology))
        .route("/api/validator-bonds", get(content::validator_bonds))
        .route_layer(state.cache.layer(CacheKind::Static));

    let dynamic_routes = Router::new()
        .route("/api/network-stats", get(content::network_stats))
        .route("/api/validator-stats", get(content::validator_stats))
        .route_layer(state.cache.layer(CacheKind::Dynamic));

    // =========================================================================
    // Auth Routes (route layers run last-added first)
    // =========================================================================
    let csrf_protected = Router::new()
        .route("/api/auth/register", post(auth::register))
        .route("/api/auth/login", post(auth::login))
        .route(LOGOUT_PATH, post(auth::logout))
        .route_layer(middleware::from_fn_with_state(
            config.max_request_body_size,
            csrf_protection,
        ));

    let auth_routes = Router::new()
        .route("/api/auth/csrf-token", get(auth::csrf_token))
        .route("/api/auth/me", get(auth::me))
        .merge(csrf_protected)
        .route_layer(middleware::from_fn(csrf_token_generator))
        .route_layer(middleware::from_fn_with_state(
            state.sessions.clone(),
            session_layer,
        ));

    let mut router = Router::new()
        .route("/health", get(handlers::health_check))
        .route("/ready", get(handlers::readiness_check))
        .route("/stats", get(handlers::stats))
        .merge(static_routes)
        .merge(dynamic_routes)
        .merge(auth_routes)
        .fallback(handlers::not_found)
        .with_state(state.clone());

    // =========================================================================
    // Apply Middleware Stack (order matters - applied innermost first)
    // =========================================================================

    // 1. Rate limiters: general counts every /api/ request, auth counts
    //    /api/auth/* except logout.
    info!(
        auth_max = config.auth_rate_max_attempts,
        auth_window_secs = config.auth_rate_window.as_secs(),
        general_max = config.general_rate_max_requests,
        general_window_secs = config.general_rate_window.as_secs(),
        "Rate limiting enabled"
    );
    router = router
        .layer(RateLimitLayer::new(
            state.general_limiter.clone(),
            RateLimitScope::prefix(API_PREFIX),
        ))
        .layer(RateLimitLayer::new(
            state.auth_limiter.clone(),
            RateLimitScope::prefix(AUTH_PREFIX).exempt(Method::POST, LOGOUT_PATH),
        ));

    // 2. Brute-force tracker
    router = router.layer(BruteForceLayer::new(state.brute_force.clone()));

    // 3. Sanitizer
    router = router.layer(SanitizeLayer::new(
        state.sanitizer.clone(),
        config.max_request_body_size,
    ));

    // 4. Client IP resolution (everything above reads it)
    if state.trusted_proxies.is_enabled() {
        info!(
            ranges = config.trusted_proxies.len(),
            "Forwarding headers honoured only from trusted proxies"
        );
    } else if state.trusted_proxies.trusts_any_peer() {
        warn!("TRUSTED_PROXIES not set, forwarding headers are trusted from any peer");
    } else {
        warn!("TRUSTED_PROXIES not set, forwarding headers are ignored and the socket peer is used");
    }
    router = router.layer(middleware::from_fn_with_state(
        state.trusted_proxies.clone(),
        resolve_client_ip,
    ));

    // 5. Request body size limit (prevents DoS via large payloads)
    info!(
        max_size_bytes = config.max_request_body_size,
        "Request body size limit configured"
    );
    router = router.layer(DefaultBodyLimit::max(config.max_request_body_size));

    // 6. Security headers
    router = router.layer(middleware::from_fn(security_headers));

    // 7. Error envelope enrichment
    router = router.layer(middleware::from_fn_with_state(
        ErrorContext::new(config.is_production()),
        error_context,
    ));

    // 8. CORS
    router = router.layer(build_cors_layer(&config.cors_allowed_origins));

    // 9. Metrics and tracing
    if config.metrics_enabled() {
        router = router.layer(middleware::from_fn(track_request_duration));
    }
    router = router.layer(TraceLayer::new_for_http());

    // 10. Request ID
    router.layer(RequestIdLayer::new())
}

async fn track_request_duration(req: Request, next: Next) -> Response {
    let method = req.method().clone();
    let start = Instant::now();
    let response = next.run(req).await;
    metrics::record_request_duration(
        method.as_str(),
        response.status().as_u16(),
        start.elapsed().as_secs_f64(),
    );
    response
}

/// Build CORS layer from configuration.
///
/// # Security Note
///
/// `*` allows any origin but never with credentials, so the session cookie
/// is not sent cross-origin. Explicit origins get credentials and an
/// explicit method/header list (wildcards are not allowed with credentials).
fn build_cors_layer(allowed_origins: &[String]) -> CorsLayer {
    let allow_any = allowed_origins.iter().any(|o| o == "*");

    if allow_any {
        return CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any);
    }

    let origins: Vec<HeaderValue> = allowed_origins
        .iter()
        .filter_map(|o| {
            let parsed = o.parse().ok();
            if parsed.is_none() {
                warn!(origin = %o, "Invalid CORS origin, skipping");
            }
            parsed
        })
        .collect();

    CorsLayer::new()
        .allow_origin(origins)
        .allow_credentials(true)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([
            header::CONTENT_TYPE,
            HeaderName::from_static(CSRF_HEADER),
            HeaderName::from_static(REQUEST_ID_HEADER),
        ])
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use axum::body::Body;
    use tower::ServiceExt;

    use super::*;
    use crate::Config;

    #[test]
    fn test_build_cors_layer_any() {
        let origins = vec!["*".to_string()];
        let _layer = build_cors_layer(&origins);
    }

    #[tokio::test]
    async fn test_explicit_origin_allows_credentials() {
        let origins = vec!["https://example.org".to_string(), "not a header\n".to_string()];
        let app = Router::new()
            .route("/api/home", get(|| async { "ok" }))
            .layer(build_cors_layer(&origins));

        let response = app
            .oneshot(
                axum::http::Request::builder()
                    .uri("/api/home")
                    .header(header::ORIGIN, "https://example.org")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(
            response.headers()[header::ACCESS_CONTROL_ALLOW_ORIGIN],
            "https://example.org"
        );
        assert_eq!(
            response.headers()[header::ACCESS_CONTROL_ALLOW_CREDENTIALS],
            "true"
        );
    }

    #[tokio::test]
    async fn test_unknown_route_is_json_404() {
        let state = AppState::in_memory(Config::default()).unwrap();
        let app = build_router(state);
        let response = app
            .oneshot(
                axum::http::Request::builder()
                    .uri("/nope")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), 404);
        assert!(response.headers().contains_key(REQUEST_ID_HEADER));
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["error"]["type"], "not_found_error");
        assert_eq!(body["path"], "/nope");
    }
}
