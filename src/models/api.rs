use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::cache::CacheReport;
use crate::storage::PublicUser;

/// Body of register and login requests.
///
/// Unknown fields (such as `_csrf`) are ignored.
#[derive(Debug, Deserialize)]
pub struct CredentialsRequest {
    pub username: String,
    pub password: String,
}

/// Successful register or login.
#[derive(Debug, Serialize, Deserialize)]
pub struct AuthResponse {
    pub success: bool,
    pub user: PublicUser,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct MessageResponse {
    pub success: bool,
    pub message: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct MeResponse {
    pub user: PublicUser,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CsrfTokenResponse {
    pub csrf_token: String,
    pub timestamp: DateTime<Utc>,
}

/// Health check response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    /// `healthy` or `degraded`
    pub status: &'static str,
    pub database_connected: bool,
    pub version: &'static str,
    pub timestamp: DateTime<Utc>,
}

/// Operational snapshot served by `/stats`.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsResponse {
    pub uptime_seconds: u64,
    pub cache: CacheReport,
    pub rate_limits: RateLimitStats,
    pub brute_force_tracked_ips: usize,
    pub database: Option<PoolStats>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitStats {
    pub auth_tracked_keys: usize,
    pub general_tracked_keys: usize,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolStats {
    pub size: u32,
    pub idle: u32,
    pub max: u32,
}
