//! Authentication endpoints.
//!
//! # Endpoints
//!
//! - `GET /api/auth/csrf-token` - Current session's CSRF token
//! - `POST /api/auth/register` - Create an account and log in
//! - `POST /api/auth/login` - Log in
//! - `POST /api/auth/logout` - Destroy the session
//! - `GET /api/auth/me` - The logged-in user
//!
//! Register and login attach an [`AuthOutcome`] to their response so the
//! brute-force layer can count failures and clear the record on success.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::{Extension, Json};
use chrono::Utc;
use tracing::instrument;

use super::AppJson;
use crate::error::{AppError, AppResult};
use crate::metrics;
use crate::middleware::{AuthOutcome, Session};
use crate::models::{
    AuthResponse, CredentialsRequest, CsrfTokenResponse, MeResponse, MessageResponse,
};
use crate::state::AppState;

#[instrument(skip(session))]
pub async fn csrf_token(session: Session) -> Json<CsrfTokenResponse> {
    Json(CsrfTokenResponse {
        csrf_token: session.ensure_csrf_token().await,
        timestamp: Utc::now(),
    })
}

#[instrument(skip_all)]
pub async fn register(
    State(state): State<AppState>,
    session: Session,
    AppJson(payload): AppJson<CredentialsRequest>,
) -> AppResult<Response> {
    let result = state
        .auth
        .register(&payload.username, &payload.password)
        .await;
    metrics::record_auth_attempt("register", result.is_ok());
    let user = result?;

    session.login(&user).await;

    Ok((
        StatusCode::CREATED,
        Extension(AuthOutcome::Success),
        Json(AuthResponse {
            success: true,
            user,
        }),
    )
        .into_response())
}

#[instrument(skip_all)]
pub async fn login(
    State(state): State<AppState>,
    session: Session,
    AppJson(payload): AppJson<CredentialsRequest>,
) -> Response {
    match state.auth.login(&payload.username, &payload.password).await {
        Ok(user) => {
            metrics::record_auth_attempt("login", true);
            session.login(&user).await;
            (
                Extension(AuthOutcome::Success),
                Json(AuthResponse {
                    success: true,
                    user,
                }),
            )
                .into_response()
        }
        Err(e @ AppError::Authentication(_)) => {
            metrics::record_auth_attempt("login", false);
            (Extension(AuthOutcome::Failure), e).into_response()
        }
        // Infrastructure failures say nothing about the credentials.
        Err(e) => e.into_response(),
    }
}

#[instrument(skip(session))]
pub async fn logout(session: Session) -> Json<MessageResponse> {
    session.destroy().await;
    Json(MessageResponse {
        success: true,
        message: "Logged out successfully".to_string(),
    })
}

#[instrument(skip_all)]
pub async fn me(State(state): State<AppState>, session: Session) -> AppResult<Json<MeResponse>> {
    let not_logged_in = || AppError::Authentication("Not authenticated".to_string());

    let Some(user) = session.user().await else {
        return Err(not_logged_in());
    };

    // The account may have been removed since login.
    match state.auth.find_user(user.id).await? {
        Some(user) => Ok(Json(MeResponse { user })),
        None => {
            session.destroy().await;
            Err(not_logged_in())
        }
    }
}
