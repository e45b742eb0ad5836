//! Health, readiness, and statistics endpoints.
//!
//! # Endpoints
//!
//! - `GET /health` - Health check with database status
//! - `GET /ready` - Readiness probe
//! - `GET /stats` - Cache, limiter and pool figures
//!
//! # Health vs Readiness
//!
//! - **Health** (`/health`): Returns 200 even if degraded, includes details
//! - **Readiness** (`/ready`): Returns 503 if the database is unreachable

use axum::Json;
use axum::extract::State;
use axum::http::StatusCode;
use axum::http::Uri;
use chrono::Utc;
use tracing::instrument;

use crate::error::AppError;
use crate::models::{HealthResponse, PoolStats, RateLimitStats, StatsResponse};
use crate::state::AppState;

/// Health check endpoint.
///
/// Always returns 200 OK with status details in the body.
///
/// # Response Body
///
/// ```json
/// {
///   "status": "healthy",
///   "database_connected": true,
///   "version": "0.1.0",
///   "timestamp": "2024-01-15T10:30:00Z"
/// }
/// ```
#[instrument(skip(state))]
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let database_connected = state.database_connected().await;

    Json(HealthResponse {
        status: if database_connected {
            "healthy"
        } else {
            "degraded"
        },
        database_connected,
        version: env!("CARGO_PKG_VERSION"),
        timestamp: Utc::now(),
    })
}

/// Readiness check endpoint.
///
/// Returns 200 OK if the service is ready to accept traffic,
/// 503 Service Unavailable otherwise.
#[instrument(skip(state))]
pub async fn readiness_check(State(state): State<AppState>) -> Result<StatusCode, StatusCode> {
    if state.database_connected().await {
        Ok(StatusCode::OK)
    } else {
        Err(StatusCode::SERVICE_UNAVAILABLE)
    }
}

#[instrument(skip(state))]
pub async fn stats(State(state): State<AppState>) -> Json<StatsResponse> {
    Json(StatsResponse {
        uptime_seconds: state.uptime_seconds(),
        cache: state.cache.monitor(),
        rate_limits: RateLimitStats {
            auth_tracked_keys: state.auth_limiter.tracked_keys(),
            general_tracked_keys: state.general_limiter.tracked_keys(),
        },
        brute_force_tracked_ips: state.brute_force.tracked_ips(),
        database: state.pool_snapshot().map(|s| PoolStats {
            size: s.size,
            idle: s.idle,
            max: s.max,
        }),
    })
}

/// JSON 404 for unmatched routes.
pub async fn not_found(uri: Uri) -> AppError {
    AppError::NotFound(format!("No route for {}", uri.path()))
}
