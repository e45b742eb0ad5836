//! Server-side session records.
//!
//! The cookie only carries a signed session id; everything else lives in a
//! [`SessionStore`]. Expired records are never returned by `load` and are
//! physically removed by the periodic sweep in [`crate::state`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use sqlx::types::Json;

use super::DatabaseError;
use super::memory::{KeyedStore, MemoryStore};

/// Data persisted for one session.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub csrf_token: Option<String>,
}

#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Load an unexpired session.
    async fn load(&self, sid: &str) -> Result<Option<SessionData>, DatabaseError>;

    /// Insert or replace a session.
    async fn save(
        &self,
        sid: &str,
        data: &SessionData,
        expires_at: DateTime<Utc>,
    ) -> Result<(), DatabaseError>;

    async fn destroy(&self, sid: &str) -> Result<(), DatabaseError>;

    /// Remove expired sessions, returning how many were deleted.
    async fn sweep_expired(&self) -> Result<u64, DatabaseError>;
}

// =============================================================================
// In-memory
// =============================================================================

#[derive(Debug, Clone)]
struct StoredSession {
    data: SessionData,
    expires_at: DateTime<Utc>,
}

/// Session store over [`MemoryStore`]. Sessions are lost on restart.
#[derive(Debug, Clone, Default)]
pub struct MemorySessionStore {
    sessions: MemoryStore<StoredSession>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn load(&self, sid: &str) -> Result<Option<SessionData>, DatabaseError> {
        Ok(self
            .sessions
            .get(sid)
            .filter(|stored| stored.expires_at > Utc::now())
            .map(|stored| stored.data))
    }

    async fn save(
        &self,
        sid: &str,
        data: &SessionData,
        expires_at: DateTime<Utc>,
    ) -> Result<(), DatabaseError> {
        self.sessions.set(
            sid,
            StoredSession {
                data: data.clone(),
                expires_at,
            },
        );
        Ok(())
    }

    async fn destroy(&self, sid: &str) -> Result<(), DatabaseError> {
        self.sessions.delete(sid);
        Ok(())
    }

    async fn sweep_expired(&self) -> Result<u64, DatabaseError> {
        let now = Utc::now();
        let removed = self.sessions.sweep(&|stored| stored.expires_at <= now);
        Ok(removed as u64)
    }
}

// =============================================================================
// PostgreSQL
// =============================================================================

/// Session store on the `sessions` table (`sid`, `sess` jsonb, `expire`).
#[derive(Debug, Clone)]
pub struct PgSessionStore {
    pool: PgPool,
}

impl PgSessionStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SessionStore for PgSessionStore {
    async fn load(&self, sid: &str) -> Result<Option<SessionData>, DatabaseError> {
        let row: Option<(Json<SessionData>,)> =
            sqlx::query_as("SELECT sess FROM sessions WHERE sid = $1 AND expire > now()")
                .bind(sid)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(|(Json(data),)| data))
    }

    async fn save(
        &self,
        sid: &str,
        data: &SessionData,
        expires_at: DateTime<Utc>,
    ) -> Result<(), DatabaseError> {
        sqlx::query(
            "INSERT INTO sessions (sid, sess, expire) VALUES ($1, $2, $3) \
             ON CONFLICT (sid) DO UPDATE SET sess = EXCLUDED.sess, expire = EXCLUDED.expire",
        )
        .bind(sid)
        .bind(Json(data.clone()))
        .bind(expires_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn destroy(&self, sid: &str) -> Result<(), DatabaseError> {
        sqlx::query("DELETE FROM sessions WHERE sid = $1")
            .bind(sid)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn sweep_expired(&self) -> Result<u64, DatabaseError> {
        let result = sqlx::query("DELETE FROM sessions WHERE expire <= now()")
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use chrono::Duration;

    use super::*;

    fn data(token: &str) -> SessionData {
        SessionData {
            csrf_token: Some(token.to_string()),
            ..SessionData::default()
        }
    }

    #[tokio::test]
    async fn test_memory_save_and_load() {
        let store = MemorySessionStore::new();
        store
            .save("sid-1", &data("tok"), Utc::now() + Duration::minutes(5))
            .await
            .unwrap();

        let loaded = store.load("sid-1").await.unwrap().unwrap();
        assert_eq!(loaded.csrf_token.as_deref(), Some("tok"));
        assert!(store.load("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_memory_expired_is_invisible_and_swept() {
        let store = MemorySessionStore::new();
        store
            .save("old", &data("a"), Utc::now() - Duration::seconds(1))
            .await
            .unwrap();
        store
            .save("new", &data("b"), Utc::now() + Duration::minutes(5))
            .await
            .unwrap();

        assert!(store.load("old").await.unwrap().is_none());
        assert_eq!(store.sweep_expired().await.unwrap(), 1);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_memory_destroy() {
        let store = MemorySessionStore::new();
        store
            .save("sid", &data("a"), Utc::now() + Duration::minutes(5))
            .await
            .unwrap();
        store.destroy("sid").await.unwrap();
        assert!(store.load("sid").await.unwrap().is_none());
    }

    #[test]
    fn test_session_data_serializes_camel_case() {
        let json = serde_json::to_value(SessionData {
            user_id: Some(4),
            username: Some("dave".into()),
            csrf_token: Some("t".into()),
        })
        .unwrap();
        assert_eq!(json["userId"], 4);
        assert_eq!(json["csrfToken"], "t");
    }
}
