//! Brute-force protection for authentication routes.
//!
//! Failed authentication attempts are counted per client IP. Once an IP has
//! [`BRUTE_FORCE_MAX_ATTEMPTS`] failures within [`BRUTE_FORCE_WINDOW`]
//! (measured from the most recent failure), every request it makes to an
//! `/auth/` path is answered with 429 until the window passes, regardless
//! of the credentials supplied.
//!
//! Handlers report what happened by attaching an [`AuthOutcome`] to their
//! response (`(Extension(AuthOutcome::Failure), err)`); the layer consumes
//! it after the handler returns. A `Success` clears the IP's record.
//! Responses without an outcome leave the record untouched.
//!
//! Every `POST` to an auth path reserves an attempt slot in the same atomic
//! store update that checks the block, and holds it until the response is
//! back. Failures and in-flight attempts together never exceed the limit, so
//! a burst of concurrent logins cannot get more than
//! [`BRUTE_FORCE_MAX_ATTEMPTS`] tries through.

use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use axum::body::Body;
use axum::http::{Method, Request, Response};
use axum::response::IntoResponse;
use tower::{Layer, Service};
use tracing::{info, warn};

use super::ip::ClientIp;
use crate::error::AppError;
use crate::metrics;
use crate::storage::{KeyedStore, MemoryStore};

pub const BRUTE_FORCE_WINDOW: Duration = Duration::from_secs(15 * 60);
pub const BRUTE_FORCE_MAX_ATTEMPTS: u32 = 5;

/// `Retry-After` when an IP is only blocked by its own in-flight attempts.
pub const IN_FLIGHT_RETRY: Duration = Duration::from_secs(1);

/// Result of an authentication attempt, set by auth handlers as a response
/// extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthOutcome {
    Success,
    Failure,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttemptEntry {
    pub count: u32,
    /// Attempts reserved but not yet answered.
    pub pending: u32,
    pub last_attempt: Instant,
}

/// Per-IP failure tracker.
pub struct BruteForceGuard {
    window: Duration,
    max_attempts: u32,
    store: Arc<dyn KeyedStore<AttemptEntry>>,
}

impl Default for BruteForceGuard {
    fn default() -> Self {
        Self::new(BRUTE_FORCE_WINDOW, BRUTE_FORCE_MAX_ATTEMPTS)
    }
}

impl BruteForceGuard {
    pub fn new(window: Duration, max_attempts: u32) -> Self {
        Self::with_store(window, max_attempts, Arc::new(MemoryStore::new()))
    }

    pub fn with_store(
        window: Duration,
        max_attempts: u32,
        store: Arc<dyn KeyedStore<AttemptEntry>>,
    ) -> Self {
        Self {
            window,
            max_attempts,
            store,
        }
    }

    /// `Err(retry_after)` when `ip` is currently blocked.
    pub fn check(&self, ip: &str) -> Result<(), Duration> {
        self.check_at(ip, Instant::now())
    }

    pub fn check_at(&self, ip: &str, now: Instant) -> Result<(), Duration> {
        let Some(entry) = self.store.get(ip) else {
            return Ok(());
        };

        let elapsed = now.saturating_duration_since(entry.last_attempt);
        if elapsed >= self.window {
            if entry.pending == 0 {
                self.store.delete(ip);
            }
            return Ok(());
        }

        if entry.count >= self.max_attempts {
            Err(self.window - elapsed)
        } else {
            Ok(())
        }
    }

    /// Check `ip` and, if it is not blocked, count one more attempt as in
    /// flight. Pair every `Ok` with a [`release`](Self::release).
    pub fn try_reserve(&self, ip: &str) -> Result<(), Duration> {
        self.try_reserve_at(ip, Instant::now())
    }

    pub fn try_reserve_at(&self, ip: &str, now: Instant) -> Result<(), Duration> {
        let window = self.window;
        let max_attempts = self.max_attempts;
        let mut verdict = Ok(());
        self.store.update(ip, &mut |current| {
            let mut entry = match current {
                Some(e) if now.saturating_duration_since(e.last_attempt) < window => e,
                // Failures outside the window no longer count.
                Some(e) => AttemptEntry {
                    count: 0,
                    pending: e.pending,
                    last_attempt: now,
                },
                None => AttemptEntry {
                    count: 0,
                    pending: 0,
                    last_attempt: now,
                },
            };
            if entry.count >= max_attempts {
                let elapsed = now.saturating_duration_since(entry.last_attempt);
                verdict = Err(window.saturating_sub(elapsed));
            } else if entry.count.saturating_add(entry.pending) >= max_attempts {
                verdict = Err(IN_FLIGHT_RETRY);
            } else {
                entry.pending += 1;
            }
            entry
        });
        verdict
    }

    /// Finish a reserved attempt, recording its outcome if it has one.
    pub fn release(&self, ip: &str, outcome: Option<AuthOutcome>) {
        self.release_at(ip, outcome, Instant::now());
    }

    pub fn release_at(&self, ip: &str, outcome: Option<AuthOutcome>, now: Instant) {
        // Record before releasing so the attempt is never uncounted.
        if let Some(outcome) = outcome {
            self.record_at(ip, outcome, now);
        }
        let entry = self.store.update(ip, &mut |current| match current {
            Some(e) => AttemptEntry {
                pending: e.pending.saturating_sub(1),
                ..e
            },
            None => AttemptEntry {
                count: 0,
                pending: 0,
                last_attempt: now,
            },
        });
        if entry.count == 0 && entry.pending == 0 {
            self.store.delete(ip);
        }
    }

    pub fn record(&self, ip: &str, outcome: AuthOutcome) {
        self.record_at(ip, outcome, Instant::now());
    }

    pub fn record_at(&self, ip: &str, outcome: AuthOutcome, now: Instant) {
        match outcome {
            AuthOutcome::Success => {
                if self.store.delete(ip) {
                    info!(client_ip = %ip, "Cleared failed-attempt record after successful login");
                }
            }
            AuthOutcome::Failure => {
                let window = self.window;
                let entry = self.store.update(ip, &mut |current| match current {
                    Some(e) if now.saturating_duration_since(e.last_attempt) < window => {
                        AttemptEntry {
                            count: e.count.saturating_add(1),
                            pending: e.pending,
                            last_attempt: now,
                        }
                    }
                    Some(e) => AttemptEntry {
                        count: 1,
                        pending: e.pending,
                        last_attempt: now,
                    },
                    None => AttemptEntry {
                        count: 1,
                        pending: 0,
                        last_attempt: now,
                    },
                });
                if entry.count >= self.max_attempts {
                    warn!(
                        client_ip = %ip,
                        attempts = entry.count,
                        "Client reached failed-attempt limit, blocking auth requests"
                    );
                }
            }
        }
    }

    /// Drop records whose window has passed.
    pub fn sweep(&self, now: Instant) -> usize {
        let window = self.window;
        self.store.sweep(&|entry| {
            entry.pending == 0 && now.saturating_duration_since(entry.last_attempt) >= window
        })
    }

    pub fn tracked_ips(&self) -> usize {
        self.store.len()
    }
}

// =============================================================================
// Tower Layer
// =============================================================================

/// Applies [`BruteForceGuard`] to every path containing `/auth/`.
#[derive(Clone)]
pub struct BruteForceLayer {
    guard: Arc<BruteForceGuard>,
}

impl BruteForceLayer {
    pub fn new(guard: Arc<BruteForceGuard>) -> Self {
        Self { guard }
    }
}

impl<S> Layer<S> for BruteForceLayer {
    type Service = BruteForceService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        BruteForceService {
            inner,
            guard: self.guard.clone(),
        }
    }
}

/// An in-flight attempt; released when dropped, so a cancelled request
/// gives its slot back.
struct Reservation {
    guard: Arc<BruteForceGuard>,
    ip: String,
    outcome: Option<AuthOutcome>,
}

impl Reservation {
    fn finish(mut self, outcome: Option<AuthOutcome>) {
        self.outcome = outcome;
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        self.guard.release(&self.ip, self.outcome.take());
    }
}

#[derive(Clone)]
pub struct BruteForceService<S> {
    inner: S,
    guard: Arc<BruteForceGuard>,
}

impl<S> Service<Request<Body>> for BruteForceService<S>
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

        if !req.uri().path().contains("/auth/") {
            return Box::pin(async move { inner.call(req).await });
        }

        let ip = ClientIp::of(&req).to_string();
        let is_attempt = req.method() == Method::POST;
        let verdict = if is_attempt {
            self.guard.try_reserve(&ip)
        } else {
            self.guard.check(&ip)
        };
        if let Err(retry_after) = verdict {
            warn!(
                client_ip = %ip,
                path = %req.uri().path(),
                retry_after_secs = retry_after.as_secs(),
                "Blocked auth request from client with too many failed attempts"
            );
            metrics::record_brute_force_block();
            let response = AppError::RateLimited {
                message: "Too many failed attempts, please try again later.".to_string(),
                retry_after,
            }
            .into_response();
            return Box::pin(async move { Ok(response) });
        }

        let guard = self.guard.clone();
        let reservation = is_attempt.then(|| Reservation {
            guard: guard.clone(),
            ip: ip.clone(),
            outcome: None,
        });
        Box::pin(async move {
            let mut response = inner.call(req).await?;
            let outcome = response.extensions_mut().remove::<AuthOutcome>();
            match reservation {
                Some(reservation) => reservation.finish(outcome),
                None => {
                    if let Some(outcome) = outcome {
                        guard.record(&ip, outcome);
                    }
                }
            }
            Ok(response)
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use axum::http::StatusCode;
    use axum::routing::post;
    use axum::{Extension, Router};
    use tower::ServiceExt;

    use super::*;
    use crate::middleware::ip::UNKNOWN_IP;

    #[test]
    fn test_blocks_after_max_failures() {
        let guard = BruteForceGuard::default();
        let start = Instant::now();

        for i in 0..BRUTE_FORCE_MAX_ATTEMPTS {
            assert!(guard.check_at("9.9.9.9", start).is_ok(), "attempt {i}");
            guard.record_at("9.9.9.9", AuthOutcome::Failure, start);
        }

        let retry = guard.check_at("9.9.9.9", start + Duration::from_secs(60));
        assert_eq!(retry, Err(BRUTE_FORCE_WINDOW - Duration::from_secs(60)));
        assert!(guard.check_at("8.8.8.8", start).is_ok());
    }

    #[test]
    fn test_success_clears_record() {
        let guard = BruteForceGuard::default();
        let now = Instant::now();
        for _ in 0..4 {
            guard.record_at("ip", AuthOutcome::Failure, now);
        }
        guard.record_at("ip", AuthOutcome::Success, now);
        assert_eq!(guard.tracked_ips(), 0);
        assert!(guard.check_at("ip", now).is_ok());
    }

    #[test]
    fn test_window_elapsed_unblocks_and_deletes() {
        let guard = BruteForceGuard::default();
        let start = Instant::now();
        for _ in 0..BRUTE_FORCE_MAX_ATTEMPTS {
            guard.record_at("ip", AuthOutcome::Failure, start);
        }
        assert!(guard.check_at("ip", start).is_err());

        assert!(guard.check_at("ip", start + BRUTE_FORCE_WINDOW).is_ok());
        assert_eq!(guard.tracked_ips(), 0);
    }

    #[test]
    fn test_stale_failures_restart_count() {
        let guard = BruteForceGuard::default();
        let start = Instant::now();
        for _ in 0..4 {
            guard.record_at("ip", AuthOutcome::Failure, start);
        }
        let later = start + BRUTE_FORCE_WINDOW + Duration::from_secs(1);
        guard.record_at("ip", AuthOutcome::Failure, later);
        assert!(guard.check_at("ip", later).is_ok());
    }

    #[test]
    fn test_sweep() {
        let guard = BruteForceGuard::default();
        let start = Instant::now();
        guard.record_at("old", AuthOutcome::Failure, start);
        guard.record_at("new", AuthOutcome::Failure, start + Duration::from_secs(600));
        assert_eq!(guard.sweep(start + BRUTE_FORCE_WINDOW), 1);
        assert_eq!(guard.tracked_ips(), 1);
    }

    #[test]
    fn test_in_flight_attempts_count_toward_limit() {
        let guard = BruteForceGuard::default();
        let now = Instant::now();

        for i in 0..BRUTE_FORCE_MAX_ATTEMPTS {
            assert!(guard.try_reserve_at("ip", now).is_ok(), "attempt {i}");
        }
        assert_eq!(guard.try_reserve_at("ip", now), Err(IN_FLIGHT_RETRY));
        // Nothing has failed yet.
        assert!(guard.check_at("ip", now).is_ok());

        guard.release_at("ip", None, now);
        assert!(guard.try_reserve_at("ip", now).is_ok());

        for _ in 0..BRUTE_FORCE_MAX_ATTEMPTS {
            guard.release_at("ip", Some(AuthOutcome::Failure), now);
        }
        assert_eq!(guard.check_at("ip", now), Err(BRUTE_FORCE_WINDOW));
        assert_eq!(guard.try_reserve_at("ip", now), Err(BRUTE_FORCE_WINDOW));
    }

    #[test]
    fn test_release_without_outcome_leaves_no_record() {
        let guard = BruteForceGuard::default();
        let now = Instant::now();
        guard.try_reserve_at("ip", now).unwrap();
        assert_eq!(guard.tracked_ips(), 1);
        guard.release_at("ip", None, now);
        assert_eq!(guard.tracked_ips(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_failures_cannot_exceed_limit() {
        let guard = Arc::new(BruteForceGuard::default());
        let app = Router::new()
            .route(
                "/api/auth/login",
                post(|| async {
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    (Extension(AuthOutcome::Failure), StatusCode::UNAUTHORIZED)
                }),
            )
            .layer(BruteForceLayer::new(guard.clone()));

        let requests = (0..8).map(|_| {
            app.clone().oneshot(
                Request::post("/api/auth/login")
                    .body(Body::empty())
                    .unwrap(),
            )
        });
        let statuses: Vec<StatusCode> = futures::future::join_all(requests)
            .await
            .into_iter()
            .map(|response| response.unwrap().status())
            .collect();

        let handled = statuses
            .iter()
            .filter(|status| **status == StatusCode::UNAUTHORIZED)
            .count();
        assert_eq!(handled, BRUTE_FORCE_MAX_ATTEMPTS as usize);
        assert_eq!(statuses.len() - handled, 3);
        assert!(
            statuses
                .iter()
                .all(|s| *s == StatusCode::UNAUTHORIZED || *s == StatusCode::TOO_MANY_REQUESTS)
        );
        assert!(guard.check(UNKNOWN_IP).is_err());
    }
}
