//! Prometheus metrics for application observability.
//!
//! Metrics are exposed on a dedicated listener when `METRICS_PORT` is set.
//!
//! # Available Metrics
//!
//! ## Counters
//! - `site_cache_lookups_total` - Response cache lookups (labels: cache, result)
//! - `site_rate_limited_total` - Requests rejected by a rate limiter (labels: limiter)
//! - `site_brute_force_blocks_total` - Auth requests blocked by the brute-force tracker
//! - `site_csrf_rejections_total` - Mutating requests rejected for a bad CSRF token
//! - `site_auth_attempts_total` - Login/registration outcomes (labels: action, outcome)
//! - `site_sanitized_requests_total` - Requests the sanitizer modified
//!
//! ## Histograms
//! - `site_request_duration_seconds` - Request duration (labels: method, status)
//!
//! ## Gauges
//! - `site_cache_keys` - Keys held per response cache (labels: cache)
//! - `site_db_pool_connections` - Open pool connections
//! - `site_db_pool_idle` - Idle pool connections
//!
//! # Usage
//!
//! ```rust,ignore
//! use chainsite::metrics::{init_metrics, record_cache_lookup};
//!
//! init_metrics(addr)?;
//! record_cache_lookup("static", "hit");
//! ```

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tracing::{error, info};

/// Metric names as constants for consistency.
pub mod names {
    pub const CACHE_LOOKUPS_TOTAL: &str = "site_cache_lookups_total";
    pub const RATE_LIMITED_TOTAL: &str = "site_rate_limited_total";
    pub const BRUTE_FORCE_BLOCKS_TOTAL: &str = "site_brute_force_blocks_total";
    pub const CSRF_REJECTIONS_TOTAL: &str = "site_csrf_rejections_total";
    pub const AUTH_ATTEMPTS_TOTAL: &str = "site_auth_attempts_total";
    pub const SANITIZED_REQUESTS_TOTAL: &str = "site_sanitized_requests_total";
    pub const REQUEST_DURATION_SECONDS: &str = "site_request_duration_seconds";
    pub const CACHE_KEYS: &str = "site_cache_keys";
    pub const DB_POOL_CONNECTIONS: &str = "site_db_pool_connections";
    pub const DB_POOL_IDLE: &str = "site_db_pool_idle";
}

/// Initialize the Prometheus metrics exporter.
///
/// # Errors
///
/// Returns a message if the exporter cannot be installed (e.g. port in use).
pub fn init_metrics(metrics_addr: SocketAddr) -> Result<(), String> {
    PrometheusBuilder::new()
        .with_http_listener(metrics_addr)
        .install()
        .map_err(|e| format!("Failed to install Prometheus exporter: {e}"))?;

    describe_counter!(
        names::CACHE_LOOKUPS_TOTAL,
        "Response cache lookups by cache and result"
    );
    describe_counter!(
        names::RATE_LIMITED_TOTAL,
        "Requests rejected with 429 by a rate limiter"
    );
    describe_counter!(
        names::BRUTE_FORCE_BLOCKS_TOTAL,
        "Auth requests blocked after repeated failures"
    );
    describe_counter!(
        names::CSRF_REJECTIONS_TOTAL,
        "Requests rejected for a missing or invalid CSRF token"
    );
    describe_counter!(
        names::AUTH_ATTEMPTS_TOTAL,
        "Login and registration outcomes"
    );
    describe_counter!(
        names::SANITIZED_REQUESTS_TOTAL,
        "Requests whose query or body was rewritten by the sanitizer"
    );

    describe_histogram!(
        names::REQUEST_DURATION_SECONDS,
        "HTTP request duration in seconds"
    );

    describe_gauge!(names::CACHE_KEYS, "Keys held by each response cache");
    describe_gauge!(names::DB_POOL_CONNECTIONS, "Open database connections");
    describe_gauge!(names::DB_POOL_IDLE, "Idle database connections");

    info!(addr = %metrics_addr, "Prometheus metrics endpoint started");
    Ok(())
}

/// Try to initialize metrics, logging any errors but not failing.
pub fn try_init_metrics(metrics_addr: SocketAddr) {
    if let Err(e) = init_metrics(metrics_addr) {
        error!(error = %e, "Failed to initialize metrics, continuing without metrics");
    }
}

// =============================================================================
// Counter Recording Functions
// =============================================================================

/// Record a cache lookup. `result` is `hit`, `miss` or `disabled`.
pub fn record_cache_lookup(cache: &'static str, result: &'static str) {
    counter!(names::CACHE_LOOKUPS_TOTAL, "cache" => cache, "result" => result).increment(1);
}

pub fn record_rate_limited(limiter: &'static str) {
    counter!(names::RATE_LIMITED_TOTAL, "limiter" => limiter).increment(1);
}

pub fn record_brute_force_block() {
    counter!(names::BRUTE_FORCE_BLOCKS_TOTAL).increment(1);
}

pub fn record_csrf_rejection() {
    counter!(names::CSRF_REJECTIONS_TOTAL).increment(1);
}

/// Record an authentication outcome. `action` is `login` or `register`.
pub fn record_auth_attempt(action: &'static str, success: bool) {
    let outcome = if success { "success" } else { "failure" };
    counter!(names::AUTH_ATTEMPTS_TOTAL, "action" => action, "outcome" => outcome).increment(1);
}

pub fn record_sanitized_request() {
    counter!(names::SANITIZED_REQUESTS_TOTAL).increment(1);
}

// =============================================================================
// Histogram Recording Functions
// =============================================================================

/// Record HTTP request duration.
pub fn record_request_duration(method: &str, status: u16, duration_secs: f64) {
    histogram!(names::REQUEST_DURATION_SECONDS, "method" => method.to_string(), "status" => status.to_string())
        .record(duration_secs);
}

// =============================================================================
// Gauge Recording Functions
// =============================================================================

pub fn set_cache_keys(cache: &'static str, keys: u64) {
    gauge!(names::CACHE_KEYS, "cache" => cache).set(keys as f64);
}

pub fn record_pool_state(size: u32, idle: u32) {
    gauge!(names::DB_POOL_CONNECTIONS).set(f64::from(size));
    gauge!(names::DB_POOL_IDLE).set(f64::from(idle));
}

#[cfg(test)]
mod tests {
    use super::*;

    // Recording without an installed exporter must be a no-op.

    #[test]
    fn test_record_counters_without_exporter() {
        record_cache_lookup("static", "hit");
        record_rate_limited("auth");
        record_brute_force_block();
        record_csrf_rejection();
        record_auth_attempt("login", false);
        record_sanitized_request();
    }

    #[test]
    fn test_record_gauges_and_histograms() {
        set_cache_keys("dynamic", 12);
        record_pool_state(5, 2);
        record_request_duration("GET", 200, 0.01);
    }
}
