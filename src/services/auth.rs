use std::sync::Arc;

use argon2::password_hash::{SaltString, rand_core::OsRng};
use argon2::{Argon2, PasswordHash, PasswordHasher, PasswordVerifier};
use tracing::{info, instrument, warn};

use crate::error::{AppError, AppResult};
use crate::storage::{DatabaseError, PublicUser, UserRepository};
use crate::validation::validate_credentials;

/// Message for both unknown users and wrong passwords.
pub const INVALID_CREDENTIALS: &str = "Invalid username or password";

/// Account registration and credential checks.
///
/// Hashing runs on the blocking pool: Argon2id takes tens of milliseconds
/// of CPU per call and must not stall the runtime's worker threads.
#[derive(Clone)]
pub struct AuthService {
    users: Arc<dyn UserRepository>,
}

impl AuthService {
    pub fn new(users: Arc<dyn UserRepository>) -> Self {
        Self { users }
    }

    pub fn users(&self) -> &Arc<dyn UserRepository> {
        &self.users
    }

    /// Create an account.
    ///
    /// # Errors
    ///
    /// `Validation` for malformed credentials or a taken username.
    #[instrument(skip(self, password))]
    pub async fn register(&self, username: &str, password: &str) -> AppResult<PublicUser> {
        validate_credentials(username, password)?;

        let hash = hash_password(password.to_string()).await?;
        let user = self
            .users
            .create(username, &hash)
            .await
            .map_err(|e| match e {
                DatabaseError::UniqueViolation { .. } => {
                    AppError::validation("Username already exists")
                }
                other => AppError::Database(other),
            })?;

        info!(user_id = user.id, "User registered");
        Ok(PublicUser::from(&user))
    }

    /// Check credentials.
    ///
    /// # Errors
    ///
    /// `Authentication` for an unknown user or a wrong password; the two are
    /// indistinguishable to the caller.
    #[instrument(skip(self, password))]
    pub async fn login(&self, username: &str, password: &str) -> AppResult<PublicUser> {
        validate_credentials(username, password)
            .map_err(|_| AppError::Authentication(INVALID_CREDENTIALS.to_string()))?;

        let Some(user) = self.users.find_by_username(username).await? else {
            warn!("Login attempt for unknown user");
            return Err(AppError::Authentication(INVALID_CREDENTIALS.to_string()));
        };

        if !verify_password(password.to_string(), user.password_hash.clone()).await? {
            warn!(user_id = user.id, "Login attempt with wrong password");
            return Err(AppError::Authentication(INVALID_CREDENTIALS.to_string()));
        }

        info!(user_id = user.id, "User logged in");
        Ok(PublicUser::from(&user))
    }

    /// Current state of a user referenced by a session.
    pub async fn find_user(&self, id: i64) -> AppResult<Option<PublicUser>> {
        Ok(self
            .users
            .find_by_id(id)
            .await?
            .map(|user| PublicUser::from(&user)))
    }
}

/// Argon2id hash in PHC string form with a random salt.
pub async fn hash_password(password: String) -> AppResult<String> {
    tokio::task::spawn_blocking(move || {
        let salt = SaltString::generate(&mut OsRng);
        Argon2::default()
            .hash_password(password.as_bytes(), &salt)
            .map(|hash| hash.to_string())
            .map_err(|e| AppError::Internal(format!("Failed to hash password: {e}")))
    })
    .await
    .map_err(|e| AppError::Internal(format!("Password hashing task failed: {e}")))?
}

pub async fn verify_password(password: String, hash: String) -> AppResult<bool> {
    tokio::task::spawn_blocking(move || {
        let parsed = PasswordHash::new(&hash)
            .map_err(|e| AppError::Internal(format!("Stored password hash is invalid: {e}")))?;
        match Argon2::default().verify_password(password.as_bytes(), &parsed) {
            Ok(()) => Ok(true),
            Err(argon2::password_hash::Error::Password) => Ok(false),
            Err(e) => Err(AppError::Internal(format!(
                "Password verification failed: {e}"
            ))),
        }
    })
    .await
    .map_err(|e| AppError::Internal(format!("Password verification task failed: {e}")))?
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::storage::InMemoryUserRepository;

    fn service() -> AuthService {
        AuthService::new(Arc::new(InMemoryUserRepository::new()))
    }

    #[tokio::test]
    async fn test_hash_and_verify() {
        let hash = hash_password("correct horse".to_string()).await.unwrap();
        assert!(hash.starts_with("$argon2id$"));
        assert!(verify_password("correct horse".into(), hash.clone()).await.unwrap());
        assert!(!verify_password("wrong horse".into(), hash).await.unwrap());
    }

    #[tokio::test]
    async fn test_register_then_login() {
        let auth = service();
        let user = auth.register("alice", "password123").await.unwrap();
        assert_eq!(user.username, "alice");

        let logged_in = auth.login("alice", "password123").await.unwrap();
        assert_eq!(logged_in, user);
        assert_eq!(auth.find_user(user.id).await.unwrap(), Some(user));
    }

    #[tokio::test]
    async fn test_duplicate_username_is_validation_error() {
        let auth = service();
        auth.register("alice", "password123").await.unwrap();
        let err = auth.register("alice", "different456").await.unwrap_err();
        assert_eq!(err.status(), 400);
        assert_eq!(err.to_envelope().error.message, "Username already exists");
    }

    #[tokio::test]
    async fn test_login_failures_are_indistinguishable() {
        let auth = service();
        auth.register("alice", "password123").await.unwrap();

        let wrong_password = auth.login("alice", "password999").await.unwrap_err();
        let unknown_user = auth.login("mallory", "password123").await.unwrap_err();
        for err in [wrong_password, unknown_user] {
            assert_eq!(err.status(), 401);
            assert_eq!(err.to_envelope().error.message, INVALID_CREDENTIALS);
        }
    }

    #[tokio::test]
    async fn test_register_validates_input() {
        let err = service().register("x", "short").await.unwrap_err();
        assert_eq!(err.status(), 400);
    }
}
