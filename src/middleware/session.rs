//! Cookie-backed server-side sessions.
//!
//! The cookie carries only `{sid}.{signature}`, where the signature is an
//! HMAC-SHA256 of the id under `SESSION_SECRET`, base64url encoded. Cookies
//! that fail verification (tampered, foreign or truncated) are ignored and a
//! fresh session is started.
//!
//! [`session_layer`] loads the session before the handler runs and exposes it
//! as a [`Session`] extractor. After the handler returns, the session is
//! persisted only if it was modified, or destroyed if the handler asked for
//! it. Login rotates the session id to defeat fixation while keeping the
//! CSRF token.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::{FromRequestParts, Request, State};
use axum::http::request::Parts;
use axum::http::{HeaderMap, HeaderValue, header};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::Utc;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use tokio::sync::Mutex;
use tracing::{debug, error, warn};

use crate::error::AppError;
use crate::storage::{PublicUser, SessionData, SessionStore};
use crate::utils::random_token;

type HmacSha256 = Hmac<Sha256>;

/// Name of the session cookie.
pub const SESSION_COOKIE: &str = "chainsite.sid";

// =============================================================================
// Manager
// =============================================================================

/// Signs cookies and moves sessions between requests and the store.
#[derive(Clone)]
pub struct SessionManager {
    store: Arc<dyn SessionStore>,
    mac: HmacSha256,
    max_age: Duration,
    secure_cookie: bool,
}

impl SessionManager {
    /// # Errors
    ///
    /// Returns `AppError::Configuration` if the secret cannot key the HMAC.
    pub fn new(
        store: Arc<dyn SessionStore>,
        secret: &str,
        max_age: Duration,
        secure_cookie: bool,
    ) -> Result<Self, AppError> {
        let mac = HmacSha256::new_from_slice(secret.as_bytes())
            .map_err(|e| AppError::Configuration(format!("Invalid SESSION_SECRET: {e}")))?;
        Ok(Self {
            store,
            mac,
            max_age,
            secure_cookie,
        })
    }

    pub fn store(&self) -> &Arc<dyn SessionStore> {
        &self.store
    }

    fn signature(&self, sid: &str) -> String {
        let mut mac = self.mac.clone();
        mac.update(sid.as_bytes());
        URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes())
    }

    /// Cookie value for `sid`.
    pub fn sign(&self, sid: &str) -> String {
        format!("{sid}.{}", self.signature(sid))
    }

    /// The session id inside a signed cookie value, if the signature holds.
    pub fn verify(&self, value: &str) -> Option<String> {
        let (sid, signature) = value.rsplit_once('.')?;
        let signature = URL_SAFE_NO_PAD.decode(signature).ok()?;

        let mut mac = self.mac.clone();
        mac.update(sid.as_bytes());
        // verify_slice compares in constant time
        mac.verify_slice(&signature).ok()?;
        Some(sid.to_string())
    }

    /// Resolve the session for a request, starting a new one when needed.
    pub async fn load(&self, headers: &HeaderMap) -> Session {
        if let Some(raw) = cookie_value(headers, SESSION_COOKIE) {
            match self.verify(raw) {
                Some(sid) => match self.store.load(&sid).await {
                    Ok(Some(data)) => return Session::existing(sid, data),
                    Ok(None) => debug!("Session cookie refers to an unknown or expired session"),
                    Err(e) => warn!(error = %e, "Failed to load session, starting a new one"),
                },
                None => warn!("Rejected session cookie with an invalid signature"),
            }
        }
        Session::fresh()
    }

    fn set_cookie(&self, sid: &str) -> Option<HeaderValue> {
        let mut cookie = format!(
            "{SESSION_COOKIE}={}; Path=/; HttpOnly; SameSite=Lax; Max-Age={}",
            self.sign(sid),
            self.max_age.as_secs()
        );
        if self.secure_cookie {
            cookie.push_str("; Secure");
        }
        HeaderValue::from_str(&cookie).ok()
    }

    fn clear_cookie(&self) -> HeaderValue {
        HeaderValue::from_static("chainsite.sid=; Path=/; HttpOnly; SameSite=Lax; Max-Age=0")
    }

    /// Persist or destroy `session` and set the matching cookie on `response`.
    async fn commit(&self, session: &Session, response: &mut Response) -> Result<(), AppError> {
        // Snapshot so the store round-trips run without the session lock.
        let state = {
            let guard = session.inner.lock().await;
            SessionState {
                id: guard.id.clone(),
                data: guard.data.clone(),
                is_new: guard.is_new,
                modified: guard.modified,
                destroyed: guard.destroyed,
                previous_id: guard.previous_id.clone(),
            }
        };

        if let Some(previous) = &state.previous_id {
            self.store.destroy(previous).await?;
        }

        if state.destroyed {
            if !state.is_new {
                self.store.destroy(&state.id).await?;
            }
            response
                .headers_mut()
                .append(header::SET_COOKIE, self.clear_cookie());
            return Ok(());
        }

        if state.modified {
            let max_age = chrono::Duration::from_std(self.max_age)
                .map_err(|e| AppError::Internal(format!("Session max age out of range: {e}")))?;
            self.store
                .save(&state.id, &state.data, Utc::now() + max_age)
                .await?;
            if let Some(cookie) = self.set_cookie(&state.id) {
                response.headers_mut().append(header::SET_COOKIE, cookie);
            }
        }
        Ok(())
    }
}

/// Find `name` in the request's `Cookie` headers.
fn cookie_value<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(';'))
        .find_map(|pair| {
            let (key, value) = pair.trim().split_once('=')?;
            (key == name).then_some(value)
        })
}

// =============================================================================
// Session Handle
// =============================================================================

#[derive(Debug)]
struct SessionState {
    id: String,
    data: SessionData,
    is_new: bool,
    modified: bool,
    destroyed: bool,
    /// Id replaced by [`Session::login`], deleted on commit.
    previous_id: Option<String>,
}

/// The current request's session. Cheap to clone; clones share state.
#[derive(Debug, Clone)]
pub struct Session {
    inner: Arc<Mutex<SessionState>>,
}

impl Session {
    fn fresh() -> Self {
        Self::with_state(random_token(), SessionData::default(), true)
    }

    fn existing(id: String, data: SessionData) -> Self {
        Self::with_state(id, data, false)
    }

    fn with_state(id: String, data: SessionData, is_new: bool) -> Self {
        Self {
            inner: Arc::new(Mutex::new(SessionState {
                id,
                data,
                is_new,
                modified: false,
                destroyed: false,
                previous_id: None,
            })),
        }
    }

    pub async fn csrf_token(&self) -> Option<String> {
        self.inner.lock().await.data.csrf_token.clone()
    }

    /// Return the session's CSRF token, generating one on first use.
    pub async fn ensure_csrf_token(&self) -> String {
        let mut state = self.inner.lock().await;
        if let Some(token) = &state.data.csrf_token {
            return token.clone();
        }
        let token = random_token();
        state.data.csrf_token = Some(token.clone());
        state.modified = true;
        token
    }

    /// The logged-in user, if any.
    pub async fn user(&self) -> Option<PublicUser> {
        let state = self.inner.lock().await;
        match (state.data.user_id, &state.data.username) {
            (Some(id), Some(username)) => Some(PublicUser {
                id,
                username: username.clone(),
            }),
            _ => None,
        }
    }

    /// Attach `user` to the session under a new id.
    pub async fn login(&self, user: &PublicUser) {
        let mut state = self.inner.lock().await;
        let new_id = random_token();
        let old_id = std::mem::replace(&mut state.id, new_id);
        if !state.is_new {
            state.previous_id = Some(old_id);
        }
        state.data.user_id = Some(user.id);
        state.data.username = Some(user.username.clone());
        state.modified = true;
    }

    /// Remove the session from the store and clear the cookie.
    pub async fn destroy(&self) {
        self.inner.lock().await.destroyed = true;
    }

    pub async fn id(&self) -> String {
        self.inner.lock().await.id.clone()
    }
}

impl<S> FromRequestParts<S> for Session
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<Session>()
            .cloned()
            .ok_or_else(|| AppError::Internal("Session layer is not installed".to_string()))
    }
}

/// Middleware attaching a [`Session`] to the request and committing it
/// after the handler.
pub async fn session_layer(
    State(manager): State<SessionManager>,
    mut req: Request,
    next: Next,
) -> Response {
    let session = manager.load(req.headers()).await;
    req.extensions_mut().insert(session.clone());

    let mut response = next.run(req).await;

    if let Err(e) = manager.commit(&session, &mut response).await {
        error!(error = %e, "Failed to persist session");
        return e.into_response();
    }
    response
}
