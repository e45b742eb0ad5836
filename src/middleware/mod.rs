//! HTTP middleware making up the request-security pipeline.
//!
//! - **Request ID**: generation and propagation for log correlation
//! - **Client IP**: resolution with trusted-proxy validation
//! - **Security headers**: CSP, HSTS, frame and sniffing protection
//! - **Sanitizer**: strips script-injection patterns from input
//! - **Brute force**: blocks IPs after repeated failed logins
//! - **Rate limiting**: fixed-window counters per client IP
//! - **Sessions**: signed cookie plus server-side store
//! - **CSRF**: per-session token issuance and verification
//! - **Error context**: request id and path in error envelopes
//!
//! # Architecture
//!
//! ```text
//! Request → Request ID → Trace → CORS → Error context → Security headers
//!         → Body limit → Client IP → Sanitizer → Brute force
//!         → Auth limiter → General limiter → Router
//!              ↓ /api/auth/*                  ↓ content routes
//!          Session → CSRF token → CSRF check   Cache
//! ```

pub mod brute_force;
pub mod csrf;
pub mod error_context;
pub mod ip;
pub mod rate_limit;
pub mod request_id;
pub mod sanitize;
pub mod security_headers;
pub mod session;

pub use brute_force::{AuthOutcome, BruteForceGuard, BruteForceLayer};
pub use csrf::{CSRF_FIELD, CSRF_HEADER, INVALID_CSRF_TOKEN, csrf_protection, csrf_token_generator};
pub use error_context::{ErrorContext, error_context};
pub use ip::{ClientIp, TrustedProxyConfig, UNKNOWN_IP, resolve_client_ip};
pub use rate_limit::{FixedWindowLimiter, RateLimitLayer, RateLimitScope};
pub use request_id::{REQUEST_ID_HEADER, RequestIdExt, RequestIdLayer};
pub use sanitize::{SanitizeLayer, Sanitizer};
pub use security_headers::security_headers;
pub use session::{SESSION_COOKIE, Session, SessionManager, session_layer};
