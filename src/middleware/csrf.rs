//! CSRF token issuance and verification.
//!
//! Each session owns one random token (32 bytes, hex). State-changing
//! requests must echo it back in one of, checked in order:
//!
//! 1. the `x-csrf-token` header
//! 2. a `_csrf` field in a JSON or form-urlencoded body
//! 3. a `_csrf` query parameter
//!
//! The comparison is constant-time. A missing or wrong token yields 403 with
//! `details.code = "INVALID_CSRF_TOKEN"`. Both middlewares expect
//! [`super::session::session_layer`] to run first.

use axum::body::{Body, Bytes};
use axum::extract::{Request, State};
use axum::http::{Method, header};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use subtle::ConstantTimeEq;
use tracing::warn;

use super::ip::ClientIp;
use super::session::Session;
use crate::error::AppError;
use crate::metrics;

pub const CSRF_HEADER: &str = "x-csrf-token";
pub const CSRF_FIELD: &str = "_csrf";
pub const INVALID_CSRF_TOKEN: &str = "INVALID_CSRF_TOKEN";

/// Constant-time string comparison.
pub fn constant_time_eq(a: &str, b: &str) -> bool {
    a.as_bytes().ct_eq(b.as_bytes()).into()
}

/// Make sure the session holds a CSRF token before the handler runs.
pub async fn csrf_token_generator(session: Session, req: Request, next: Next) -> Response {
    session.ensure_csrf_token().await;
    next.run(req).await
}

/// Reject unsafe requests whose token does not match the session's.
///
/// The state is the maximum body size buffered while looking for `_csrf`.
pub async fn csrf_protection(
    State(body_limit): State<usize>,
    session: Session,
    req: Request,
    next: Next,
) -> Response {
    if matches!(*req.method(), Method::GET | Method::HEAD | Method::OPTIONS) {
        return next.run(req).await;
    }

    let (req, supplied) = match supplied_token(req, body_limit).await {
        Ok(found) => found,
        Err(response) => return response,
    };

    let valid = match (session.csrf_token().await, supplied.as_deref()) {
        (Some(expected), Some(supplied)) => constant_time_eq(&expected, supplied),
        _ => false,
    };

    if !valid {
        warn!(
            client_ip = %ClientIp::of(&req),
            method = %req.method(),
            path = %req.uri().path(),
            token_supplied = supplied.is_some(),
            "CSRF validation failed"
        );
        metrics::record_csrf_rejection();
        return invalid_token().into_response();
    }

    next.run(req).await
}

pub fn invalid_token() -> AppError {
    AppError::Forbidden {
        code: INVALID_CSRF_TOKEN,
        message: "Invalid or missing CSRF token".to_string(),
    }
}

/// Locate the client's token, rebuilding the request if its body was read.
async fn supplied_token(
    req: Request,
    body_limit: usize,
) -> Result<(Request, Option<String>), Response> {
    if let Some(token) = req
        .headers()
        .get(CSRF_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
    {
        let token = token.to_string();
        return Ok((req, Some(token)));
    }

    let (req, from_body) = token_from_body(req, body_limit).await?;
    if from_body.is_some() {
        return Ok((req, from_body));
    }

    let from_query = req.uri().query().and_then(|q| {
        url::form_urlencoded::parse(q.as_bytes())
            .find(|(k, _)| k == CSRF_FIELD)
            .map(|(_, v)| v.into_owned())
    });
    Ok((req, from_query))
}

enum BodyKind {
    Json,
    Form,
}

fn body_kind(req: &Request) -> Option<BodyKind> {
    let content_type = req
        .headers()
        .get(header::CONTENT_TYPE)?
        .to_str()
        .ok()?
        .to_ascii_lowercase();
    if content_type.starts_with("application/json") {
        Some(BodyKind::Json)
    } else if content_type.starts_with("application/x-www-form-urlencoded") {
        Some(BodyKind::Form)
    } else {
        None
    }
}

async fn token_from_body(
    req: Request,
    body_limit: usize,
) -> Result<(Request, Option<String>), Response> {
    let Some(kind) = body_kind(&req) else {
        return Ok((req, None));
    };

    let (parts, body) = req.into_parts();
    let bytes: Bytes = axum::body::to_bytes(body, body_limit).await.map_err(|e| {
        AppError::validation(format!("Request body could not be read: {e}")).into_response()
    })?;

    let token = match kind {
        BodyKind::Json => serde_json::from_slice::<serde_json::Value>(&bytes)
            .ok()
            .and_then(|v| v.get(CSRF_FIELD)?.as_str().map(str::to_string)),
        BodyKind::Form => url::form_urlencoded::parse(&bytes)
            .find(|(k, _)| k == CSRF_FIELD)
            .map(|(_, v)| v.into_owned()),
    };

    Ok((Request::from_parts(parts, Body::from(bytes)), token))
}
