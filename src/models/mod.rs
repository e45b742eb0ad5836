mod api;
mod content;

pub use api::{
    AuthResponse, CredentialsRequest, CsrfTokenResponse, HealthResponse, MeResponse,
    MessageResponse, PoolStats, RateLimitStats, StatsResponse,
};
pub use content::{NetworkStats, ValidatorBondsPage, ValidatorStats};
