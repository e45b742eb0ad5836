//! Enrich error envelopes with request context.
//!
//! [`AppError`](crate::error::AppError) responses carry their
//! [`ErrorEnvelope`] as a response extension because the error itself never
//! sees the request. This middleware fills in `requestId` and `path` and,
//! outside production, copies the unsanitized [`InternalDetail`] of a 5xx
//! into `details.internal`. Responses without an envelope are untouched.

use axum::Json;
use axum::extract::{Request, State};
use axum::http::header;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use serde_json::{Value, json};

use super::request_id::RequestIdExt;
use crate::error::{ErrorEnvelope, InternalDetail};

#[derive(Debug, Clone, Copy)]
pub struct ErrorContext {
    pub expose_internal: bool,
}

impl ErrorContext {
    pub fn new(is_production: bool) -> Self {
        Self {
            expose_internal: !is_production,
        }
    }
}

pub async fn error_context(
    State(ctx): State<ErrorContext>,
    req: Request,
    next: Next,
) -> Response {
    let request_id = req.request_id();
    let path = req.uri().path().to_string();

    let mut response = next.run(req).await;
    let Some(mut envelope) = response.extensions_mut().remove::<ErrorEnvelope>() else {
        return response;
    };
    let internal = response.extensions_mut().remove::<InternalDetail>();

    envelope.request_id = request_id;
    envelope.path = Some(path);
    if ctx.expose_internal
        && let Some(InternalDetail(detail)) = internal
    {
        attach_internal(&mut envelope, detail);
    }

    let (mut parts, _) = response.into_parts();
    parts.headers.remove(header::CONTENT_LENGTH);
    let rebuilt = Json(envelope).into_response();
    let (rebuilt_parts, body) = rebuilt.into_parts();
    if let Some(content_type) = rebuilt_parts.headers.get(header::CONTENT_TYPE) {
        parts
            .headers
            .insert(header::CONTENT_TYPE, content_type.clone());
    }
    Response::from_parts(parts, body)
}

fn attach_internal(envelope: &mut ErrorEnvelope, detail: String) {
    match envelope.error.details.as_mut() {
        Some(Value::Object(map)) => {
            map.insert("internal".to_string(), Value::String(detail));
        }
        _ => envelope.error.details = Some(json!({ "internal": detail })),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use axum::Router;
    use axum::body::Body;
    use axum::middleware::from_fn_with_state;
    use axum::routing::get;
    use tower::ServiceExt;

    use super::*;
    use crate::error::AppError;
    use crate::middleware::request_id::REQUEST_ID_HEADER;

    fn app(is_production: bool) -> Router {
        Router::new()
            .route(
                "/boom",
                get(|| async { AppError::Internal("pool exhausted".to_string()) }),
            )
            .route(
                "/missing",
                get(|| async { AppError::NotFound("no such page".to_string()) }),
            )
            .route("/ok", get(|| async { "fine" }))
            .layer(from_fn_with_state(
                ErrorContext::new(is_production),
                error_context,
            ))
    }

    async fn body_json(response: Response) -> Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_request_id_and_path_added() {
        let response = app(true)
            .oneshot(
                Request::builder()
                    .uri("/missing")
                    .header(REQUEST_ID_HEADER, "req-1")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), 404);
        let body = body_json(response).await;
        assert_eq!(body["requestId"], "req-1");
        assert_eq!(body["path"], "/missing");
        assert_eq!(body["error"]["type"], "not_found_error");
    }

    #[tokio::test]
    async fn test_internal_detail_only_outside_production() {
        let dev = app(false)
            .oneshot(Request::builder().uri("/boom").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let body = body_json(dev).await;
        assert!(
            body["error"]["details"]["internal"]
                .as_str()
                .unwrap()
                .contains("pool exhausted")
        );

        let prod = app(true)
            .oneshot(Request::builder().uri("/boom").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let body = body_json(prod).await;
        assert!(body["error"].get("details").is_none());
        assert!(!body.to_string().contains("pool exhausted"));
    }

    #[tokio::test]
    async fn test_success_untouched() {
        let response = app(false)
            .oneshot(Request::builder().uri("/ok").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        assert_eq!(bytes, "fine");
    }
}
