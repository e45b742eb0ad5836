//! Postgres connection pool construction and saturation reporting.

use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use tracing::{info, warn};

use super::DatabaseError;
use crate::config::Config;
use crate::metrics;

/// Point-in-time view of the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolSnapshot {
    pub size: u32,
    pub idle: u32,
    pub max: u32,
}

impl PoolSnapshot {
    pub fn of(pool: &PgPool, max: u32) -> Self {
        Self {
            size: pool.size(),
            idle: u32::try_from(pool.num_idle()).unwrap_or(u32::MAX),
            max,
        }
    }

    pub fn in_use(&self) -> u32 {
        self.size.saturating_sub(self.idle)
    }

    /// True when every connection is open and none is idle.
    pub fn is_saturated(&self) -> bool {
        self.size >= self.max && self.idle == 0
    }
}

/// Connect a bounded pool and run the bundled migrations.
///
/// # Errors
///
/// Returns [`DatabaseError::Connection`] when the server is unreachable and
/// [`DatabaseError::Migration`] when a migration fails.
pub async fn connect(config: &Config) -> Result<PgPool, DatabaseError> {
    info!(
        max = config.db_pool_max,
        min = config.db_pool_min,
        idle_timeout_ms = config.db_pool_idle_timeout.as_millis() as u64,
        acquire_timeout_ms = config.db_pool_connection_timeout.as_millis() as u64,
        max_uses = config.db_pool_max_uses,
        "Connecting database pool"
    );

    let pool = PgPoolOptions::new()
        .max_connections(config.db_pool_max)
        .min_connections(config.db_pool_min)
        .idle_timeout(config.db_pool_idle_timeout)
        .acquire_timeout(config.db_pool_connection_timeout)
        .max_lifetime(config.db_pool_max_lifetime)
        .test_before_acquire(true)
        .connect(&config.database_url)
        .await
        .map_err(|e| DatabaseError::Connection(e.to_string()))?;

    sqlx::migrate!("./migrations").run(&pool).await?;
    info!("Database migrations applied");

    Ok(pool)
}

/// Log and export the pool state. Called periodically by the pool monitor.
pub fn report(snapshot: PoolSnapshot) {
    metrics::record_pool_state(snapshot.size, snapshot.idle);

    if snapshot.is_saturated() {
        warn!(
            size = snapshot.size,
            max = snapshot.max,
            "Database pool saturated, requests are waiting for connections"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_saturation() {
        let busy = PoolSnapshot {
            size: 20,
            idle: 0,
            max: 20,
        };
        assert!(busy.is_saturated());
        assert_eq!(busy.in_use(), 20);

        let relaxed = PoolSnapshot {
            size: 20,
            idle: 3,
            max: 20,
        };
        assert!(!relaxed.is_saturated());
        assert_eq!(relaxed.in_use(), 17);
    }
}
