//! Shared application state for Axum handlers and middleware.
//!
//! This module wires together everything that lives for the whole process:
//!
//! - **Services**: authentication and content
//! - **Security state**: rate limiters, brute-force guard, sanitizer, sessions
//! - **Caches**: static and dynamic response caches
//! - **Configuration**: runtime configuration access
//!
//! # Structured Concurrency
//!
//! Background tasks are managed using `tokio_util::task::TaskTracker` and
//! `CancellationToken` for proper lifecycle management. Call `shutdown()`
//! to gracefully stop all background tasks before application exit.
//!
//! - **Sweeper**: drops expired rate-limit windows, brute-force records and
//!   sessions
//! - **Cache monitor**: reports cache key counts and memory
//! - **Pool monitor**: reports database pool saturation (Postgres only)

use std::sync::Arc;
use std::time::{Duration, Instant};

use sqlx::PgPool;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, trace, warn};

use crate::cache::ResponseCache;
use crate::config::Config;
use crate::error::{AppError, AppResult};
use crate::middleware::{
    BruteForceGuard, FixedWindowLimiter, Sanitizer, SessionManager, TrustedProxyConfig,
};
use crate::services::{AuthService, ContentService};
use crate::storage::pool::{self, PoolSnapshot};
use crate::storage::{
    InMemoryUserRepository, MemorySessionStore, PgSessionStore, PgUserRepository, SessionStore,
    UserRepository,
};

/// Shared application state.
///
/// Cloned for each request; everything inside is `Arc`-backed.
///
/// # Lifecycle
///
/// Background tasks are spawned when the state is created. Call `shutdown()`
/// before dropping to ensure clean task termination:
///
/// ```rust,ignore
/// let state = AppState::with_postgres(pool, config)?;
/// // ... serve ...
/// state.shutdown().await;  // Wait for background tasks to complete
/// ```
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub auth: AuthService,
    pub content: ContentService,
    pub cache: Arc<ResponseCache>,
    pub auth_limiter: Arc<FixedWindowLimiter>,
    pub general_limiter: Arc<FixedWindowLimiter>,
    pub brute_force: Arc<BruteForceGuard>,
    pub sanitizer: Arc<Sanitizer>,
    pub sessions: SessionManager,
    pub trusted_proxies: Arc<TrustedProxyConfig>,
    /// `None` when running on in-memory stores
    pub pool: Option<PgPool>,
    /// Timestamp when the application started
    pub started_at: Instant,
    /// Tracks spawned background tasks for graceful shutdown
    task_tracker: TaskTracker,
    /// Cancellation token for signaling background tasks to stop
    cancellation_token: CancellationToken,
}

impl AppState {
    /// State backed by Postgres users and sessions.
    ///
    /// # Errors
    ///
    /// `Configuration` if the session secret or sanitizer cannot be set up.
    pub fn with_postgres(pool: PgPool, config: Config) -> AppResult<Self> {
        let users = Arc::new(PgUserRepository::new(pool.clone()));
        let sessions = Arc::new(PgSessionStore::new(pool.clone()));
        Self::build(config, users, sessions, Some(pool))
    }

    /// State backed entirely by in-memory stores. Used by tests and by
    /// development runs without a database.
    ///
    /// # Errors
    ///
    /// `Configuration` if the session secret or sanitizer cannot be set up.
    pub fn in_memory(config: Config) -> AppResult<Self> {
        Self::build(
            config,
            Arc::new(InMemoryUserRepository::new()),
            Arc::new(MemorySessionStore::new()),
            None,
        )
    }

    /// Assemble the state from explicit stores.
    ///
    /// # Errors
    ///
    /// `Configuration` if the session secret or sanitizer cannot be set up.
    pub fn build(
        config: Config,
        users: Arc<dyn UserRepository>,
        session_store: Arc<dyn SessionStore>,
        pool: Option<PgPool>,
    ) -> AppResult<Self> {
        let sessions = SessionManager::new(
            session_store,
            &config.session_secret,
            config.session_max_age,
            config.is_production(),
        )?;
        let sanitizer = Sanitizer::new(config.sanitize_max_depth)
            .map_err(|e| AppError::Configuration(format!("Invalid sanitizer pattern: {e}")))?;
        let mut trusted_proxies = TrustedProxyConfig::new(&config.trusted_proxies);
        if config.is_production() {
            trusted_proxies = trusted_proxies.strict();
        }

        let state = Self {
            auth: AuthService::new(users),
            content: ContentService::new(),
            cache: Arc::new(ResponseCache::from_config(&config)),
            auth_limiter: Arc::new(FixedWindowLimiter::new(
                "auth",
                config.auth_rate_window,
                config.auth_rate_max_attempts,
            )),
            general_limiter: Arc::new(FixedWindowLimiter::new(
                "general",
                config.general_rate_window,
                config.general_rate_max_requests,
            )),
            brute_force: Arc::new(BruteForceGuard::default()),
            sanitizer: Arc::new(sanitizer),
            sessions,
            trusted_proxies: Arc::new(trusted_proxies),
            pool,
            started_at: Instant::now(),
            config: Arc::new(config),
            task_tracker: TaskTracker::new(),
            cancellation_token: CancellationToken::new(),
        };

        // Spawn background tasks
        state.spawn_sweep_task();
        state.spawn_cache_monitor_task();
        state.spawn_pool_monitor_task();

        Ok(state)
    }

    /// Whether the user store answers.
    pub async fn database_connected(&self) -> bool {
        match self.auth.users().ping().await {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, "Database ping failed");
                false
            }
        }
    }

    pub fn pool_snapshot(&self) -> Option<PoolSnapshot> {
        self.pool
            .as_ref()
            .map(|pool| PoolSnapshot::of(pool, self.config.db_pool_max))
    }

    /// Periodically drop expired limiter windows, brute-force records and
    /// sessions so the in-memory maps stay bounded by active clients.
    fn spawn_sweep_task(&self) {
        let auth_limiter = self.auth_limiter.clone();
        let general_limiter = self.general_limiter.clone();
        let brute_force = self.brute_force.clone();
        let session_store = self.sessions.store().clone();
        let period = self.config.sweep_interval;
        let cancel = self.cancellation_token.clone();

        self.task_tracker.spawn(async move {
            let mut ticker = interval(period);
            ticker.tick().await; // Skip the first immediate tick

            loop {
                tokio::select! {
                    biased; // Check cancellation first

                    _ = cancel.cancelled() => {
                        debug!("Sweep task received cancellation signal");
                        break;
                    }
                    _ = ticker.tick() => {
                        let now = Instant::now();
                        let windows = auth_limiter.sweep(now) + general_limiter.sweep(now);
                        let attempts = brute_force.sweep(now);
                        let sessions = match session_store.sweep_expired().await {
                            Ok(n) => n,
                            Err(e) => {
                                warn!(error = %e, "Session sweep failed");
                                0
                            }
                        };
                        trace!(windows, attempts, sessions, "Swept expired entries");
                    }
                }
            }

            debug!("Sweep task shutting down");
        });
    }

    fn spawn_cache_monitor_task(&self) {
        let cache = self.cache.clone();
        let period = self.config.cache_monitor_interval;
        let cancel = self.cancellation_token.clone();

        self.task_tracker.spawn(async move {
            let mut ticker = interval(period);
            ticker.tick().await;

            loop {
                tokio::select! {
                    biased;

                    _ = cancel.cancelled() => {
                        debug!("Cache monitor received cancellation signal");
                        break;
                    }
                    _ = ticker.tick() => {
                        let report = cache.monitor();
                        debug!(
                            static_keys = report.static_cache.keys,
                            dynamic_keys = report.dynamic_cache.keys,
                            memory_bytes = report.total_memory_bytes,
                            "Cache report"
                        );
                    }
                }
            }

            debug!("Cache monitor shutting down");
        });
    }

    /// Saturation is observed, never acted on: callers simply queue at the
    /// pool until the acquire timeout.
    fn spawn_pool_monitor_task(&self) {
        let Some(pool) = self.pool.clone() else {
            return;
        };
        let max = self.config.db_pool_max;
        let period = self.config.cache_monitor_interval.min(Duration::from_secs(30));
        let cancel = self.cancellation_token.clone();

        self.task_tracker.spawn(async move {
            let mut ticker = interval(period);

            loop {
                tokio::select! {
                    biased;

                    _ = cancel.cancelled() => {
                        debug!("Pool monitor received cancellation signal");
                        break;
                    }
                    _ = ticker.tick() => {
                        pool::report(PoolSnapshot::of(&pool, max));
                    }
                }
            }

            debug!("Pool monitor shutting down");
        });
    }

    /// Gracefully shutdown all background tasks and close the pool.
    pub async fn shutdown(&self) {
        info!("Initiating graceful shutdown of background tasks");

        self.cancellation_token.cancel();
        self.task_tracker.close();
        self.task_tracker.wait().await;

        if let Some(pool) = &self.pool {
            pool.close().await;
            info!("Database pool closed");
        }

        info!("All background tasks have completed");
    }

    /// Get the application uptime in seconds.
    pub fn uptime_seconds(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }
}
