//! # chainsite
//!
//! Content API for a blockchain project's website, behind a request-security
//! pipeline built on Axum:
//!
//! - **Rate limiting**: fixed-window limiters for auth and general API traffic
//! - **Brute-force protection**: per-IP lockout after failed logins
//! - **CSRF**: per-session tokens checked on state-changing requests
//! - **Sanitization**: script-injection patterns stripped from input
//! - **Caching**: static and dynamic TTL response caches
//! - **Sessions**: signed cookies with Postgres-backed storage
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Axum HTTP Server                       │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Middleware (Headers → Sanitize → Brute force → Limits)     │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Route layers (Session → CSRF | Response cache)             │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Handlers (auth, content, health)                           │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Services (AuthService, ContentService)                     │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Storage (users, sessions: Postgres or in-memory)           │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use chainsite::{AppState, Config, build_router};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::from_env()?;
//!     let pool = chainsite::storage::pool::connect(&config).await?;
//!
//!     let state = AppState::with_postgres(pool, config)?;
//!     let app = build_router(state);
//!
//!     // Start the server...
//!     Ok(())
//! }
//! ```

pub mod cache;
pub mod config;
pub mod error;
pub mod handlers;
pub mod metrics;
pub mod middleware;
pub mod models;
pub mod routes;
pub mod services;
pub mod state;
pub mod storage;
pub mod utils;
pub mod validation;

// Re-exports for convenience
pub use config::Config;
pub use error::{AppError, AppResult};
pub use routes::build_router;
pub use state::AppState;
