//! Request sanitizer stripping script-injection patterns from input.
//!
//! Query parameters and JSON or form-urlencoded bodies are walked (nested
//! values up to a configurable depth) and every string has the following
//! removed:
//!
//! - `<script>...</script>` blocks and stray `<script>` / `</script>` tags
//! - `javascript:` and `vbscript:` URL schemes
//! - inline event handler attributes (`onclick=`, `onerror =`, ...)
//! - base64 `data:` URLs
//!
//! Input without matches passes through byte-for-byte: the request is only
//! rebuilt when something was stripped. The sanitizer never rejects a
//! request. Bodies are buffered up to the body limit whether or not their
//! length is known up front, so chunked uploads are inspected too. A body
//! declared larger than the limit is forwarded untouched for the body-limit
//! rejection downstream. A body that fails to read, or turns out to exceed
//! the limit while streaming, is dropped: the handler sees an empty body and
//! a warning is logged.
//!
//! This is a defence-in-depth filter, not an HTML sanitizer. Output encoding
//! on the client and the Content-Security-Policy header remain the real
//! protection.

use std::borrow::Cow;
use std::sync::Arc;
use std::task::{Context, Poll};

use axum::body::{Body, Bytes, HttpBody};
use axum::http::uri::PathAndQuery;
use axum::http::{HeaderValue, Request, Response, Uri, header};
use http_body_util::{BodyExt, Limited};
use regex::Regex;
use serde_json::Value;
use tower::{Layer, Service};
use tracing::{debug, warn};

use super::ip::ClientIp;
use crate::metrics;

/// Stripping can expose a new match (`<scr<script>ipt>`); passes are
/// repeated up to this many times.
const MAX_PASSES: usize = 4;

const PATTERNS: &[&str] = &[
    r"(?is)<\s*script\b[^>]*>.*?<\s*/\s*script\s*>",
    r"(?i)<\s*/?\s*script\b[^>]*>?",
    r"(?i)javascript\s*:",
    r"(?i)vbscript\s*:",
    r"(?i)\bon[a-z]+\s*=",
    r"(?i)data:[a-z0-9.+/-]*(?:;[a-z0-9=.+-]*)*;base64,[a-z0-9+/=\s]*",
];

/// Compiled pattern set plus the recursion bound.
#[derive(Debug, Clone)]
pub struct Sanitizer {
    patterns: Vec<Regex>,
    max_depth: usize,
}

impl Sanitizer {
    /// # Errors
    ///
    /// Returns the regex error if a built-in pattern fails to compile.
    pub fn new(max_depth: usize) -> Result<Self, regex::Error> {
        let patterns = PATTERNS
            .iter()
            .map(|p| Regex::new(p))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            patterns,
            max_depth,
        })
    }

    /// Strip every dangerous pattern from `input`.
    pub fn clean_str<'a>(&self, input: &'a str) -> Cow<'a, str> {
        let mut current = Cow::Borrowed(input);
        for _ in 0..MAX_PASSES {
            let mut changed = false;
            for pattern in &self.patterns {
                if let Cow::Owned(stripped) = pattern.replace_all(&current, "") {
                    current = Cow::Owned(stripped);
                    changed = true;
                }
            }
            if !changed {
                break;
            }
        }
        current
    }

    /// Clean strings (and object keys) inside `value` in place. Returns
    /// whether anything changed. Nesting deeper than `max_depth` is left alone.
    pub fn clean_value(&self, value: &mut Value) -> bool {
        self.clean_value_at(value, 0)
    }

    fn clean_value_at(&self, value: &mut Value, depth: usize) -> bool {
        if depth > self.max_depth {
            return false;
        }
        match value {
            Value::String(s) => match self.clean_str(s) {
                Cow::Owned(cleaned) => {
                    *s = cleaned;
                    true
                }
                Cow::Borrowed(_) => false,
            },
            Value::Array(items) => items.iter_mut().fold(false, |changed, item| {
                self.clean_value_at(item, depth + 1) | changed
            }),
            Value::Object(map) => {
                let mut changed = false;
                let entries = std::mem::take(map);
                for (key, mut item) in entries {
                    changed |= self.clean_value_at(&mut item, depth + 1);
                    let key = match self.clean_str(&key) {
                        Cow::Owned(cleaned) => {
                            changed = true;
                            cleaned
                        }
                        Cow::Borrowed(_) => key,
                    };
                    map.insert(key, item);
                }
                changed
            }
            Value::Null | Value::Bool(_) | Value::Number(_) => false,
        }
    }

    /// Clean a urlencoded string (query or form body). `None` when unchanged.
    pub fn clean_urlencoded(&self, input: &[u8]) -> Option<String> {
        let mut changed = false;
        let pairs: Vec<(String, String)> = url::form_urlencoded::parse(input)
            .map(|(k, v)| {
                let key = self.clean_str(&k);
                let value = self.clean_str(&v);
                if matches!(key, Cow::Owned(_)) || matches!(value, Cow::Owned(_)) {
                    changed = true;
                }
                (key.into_owned(), value.into_owned())
            })
            .collect();

        if !changed {
            return None;
        }
        Some(
            url::form_urlencoded::Serializer::new(String::new())
                .extend_pairs(pairs)
                .finish(),
        )
    }
}

// =============================================================================
// Tower Layer
// =============================================================================

#[derive(Clone)]
pub struct SanitizeLayer {
    sanitizer: Arc<Sanitizer>,
    body_limit: usize,
}

impl SanitizeLayer {
    /// `body_limit` bounds how much of a body is buffered for inspection;
    /// larger or unsized bodies pass through untouched.
    pub fn new(sanitizer: Arc<Sanitizer>, body_limit: usize) -> Self {
        Self {
            sanitizer,
            body_limit,
        }
    }
}

impl<S> Layer<S> for SanitizeLayer {
    type Service = SanitizeService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        SanitizeService {
            inner,
            sanitizer: self.sanitizer.clone(),
            body_limit: self.body_limit,
        }
    }
}

#[derive(Clone)]
pub struct SanitizeService<S> {
    inner: S,
    sanitizer: Arc<Sanitizer>,
    body_limit: usize,
}

impl<S> Service<Request<Body>> for SanitizeService<S>
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

    fn call(&mut self, mut req: Request<Body>) -> Self::Future {
        let sanitizer = self.sanitizer.clone();
        let body_limit = self.body_limit;
        let mut inner = self.inner.clone();

        let query_changed = sanitize_query(&sanitizer, &mut req);

        Box::pin(async move {
            let (req, body_changed) = sanitize_body(&sanitizer, req, body_limit).await;
            if query_changed || body_changed {
                debug!(
                    client_ip = %ClientIp::of(&req),
                    path = %req.uri().path(),
                    query_changed,
                    body_changed,
                    "Stripped dangerous input from request"
                );
                metrics::record_sanitized_request();
            }
            inner.call(req).await
        })
    }
}

fn sanitize_query(sanitizer: &Sanitizer, req: &mut Request<Body>) -> bool {
    let Some(query) = req.uri().query() else {
        return false;
    };
    let Some(cleaned) = sanitizer.clean_urlencoded(query.as_bytes()) else {
        return false;
    };

    let path_and_query = if cleaned.is_empty() {
        req.uri().path().to_string()
    } else {
        format!("{}?{}", req.uri().path(), cleaned)
    };

    let mut parts = req.uri().clone().into_parts();
    match PathAndQuery::try_from(path_and_query) {
        Ok(pq) => parts.path_and_query = Some(pq),
        Err(e) => {
            warn!(error = %e, "Failed to rebuild sanitized query, forwarding original");
            return false;
        }
    }
    match Uri::from_parts(parts) {
        Ok(uri) => {
            *req.uri_mut() = uri;
            true
        }
        Err(e) => {
            warn!(error = %e, "Failed to rebuild sanitized URI, forwarding original");
            false
        }
    }
}

#[derive(Clone, Copy)]
enum BodyKind {
    Json,
    Form,
}

fn inspectable_body(req: &Request<Body>, body_limit: usize) -> Option<BodyKind> {
    let content_type = req
        .headers()
        .get(header::CONTENT_TYPE)?
        .to_str()
        .ok()?
        .to_ascii_lowercase();
    let kind = if content_type.starts_with("application/json") {
        BodyKind::Json
    } else if content_type.starts_with("application/x-www-form-urlencoded") {
        BodyKind::Form
    } else {
        return None;
    };

    // Known to be oversized: leave it for the body-limit rejection.
    (req.body().size_hint().lower() <= body_limit as u64).then_some(kind)
}

async fn sanitize_body(
    sanitizer: &Sanitizer,
    req: Request<Body>,
    body_limit: usize,
) -> (Request<Body>, bool) {
    let Some(kind) = inspectable_body(&req, body_limit) else {
        return (req, false);
    };

    let (mut parts, body) = req.into_parts();
    let bytes: Bytes = match Limited::new(body, body_limit).collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            warn!(
                error = %e,
                path = %parts.uri.path(),
                limit = body_limit,
                "Request body could not be buffered for sanitizing, dropping it"
            );
            parts.headers.remove(header::CONTENT_LENGTH);
            return (Request::from_parts(parts, Body::empty()), false);
        }
    };

    let cleaned: Option<Vec<u8>> = match kind {
        BodyKind::Json => match serde_json::from_slice::<Value>(&bytes) {
            Ok(mut value) => {
                if sanitizer.clean_value(&mut value) {
                    serde_json::to_vec(&value).ok()
                } else {
                    None
                }
            }
            // Unparsable: the handler gets the original bytes.
            Err(_) => None,
        },
        BodyKind::Form => sanitizer.clean_urlencoded(&bytes).map(String::into_bytes),
    };

    match cleaned {
        Some(cleaned) => {
            if parts.headers.contains_key(header::CONTENT_LENGTH) {
                parts
                    .headers
                    .insert(header::CONTENT_LENGTH, HeaderValue::from(cleaned.len()));
            }
            (Request::from_parts(parts, Body::from(cleaned)), true)
        }
        None => (Request::from_parts(parts, Body::from(bytes)), false),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use serde_json::json;

    use super::*;

    fn sanitizer() -> Sanitizer {
        Sanitizer::new(10).unwrap()
    }

    #[test]
    fn test_script_block_removed() {
        let s = sanitizer();
        assert_eq!(s.clean_str("hi<script>alert(1)</script>there"), "hithere");
        assert_eq!(
            s.clean_str("<SCRIPT type=\"text/javascript\">\nx()\n</SCRIPT >"),
            ""
        );
    }

    #[test]
    fn test_stray_tags_and_schemes_removed() {
        let s = sanitizer();
        assert_eq!(s.clean_str("<script src=x>"), "");
        assert_eq!(s.clean_str("JavaScript:alert(1)"), "alert(1)");
        assert_eq!(s.clean_str("vbscript :msgbox"), "msgbox");
        assert_eq!(s.clean_str("<img src=x onerror=alert(1)>"), "<img src=x alert(1)>");
        assert_eq!(
            s.clean_str("see data:text/html;base64,PHNjcmlwdD4= now"),
            "see now"
        );
    }

    #[test]
    fn test_nested_reassembly_is_removed() {
        let s = sanitizer();
        let cleaned = s.clean_str("<scr<script>ipt>alert(1)</script>");
        assert!(!cleaned.to_ascii_lowercase().contains("<script"));
    }

    #[test]
    fn test_clean_input_is_borrowed() {
        let s = sanitizer();
        let input = "Validators earn 5% APY; contact: team@example.org";
        assert!(matches!(s.clean_str(input), Cow::Borrowed(_)));
    }

    #[test]
    fn test_clean_value_recurses() {
        let s = sanitizer();
        let mut value = json!({
            "name": "ok",
            "bio": "<script>steal()</script>hello",
            "links": ["javascript:void(0)", "https://example.org"],
            "count": 3
        });
        assert!(s.clean_value(&mut value));
        assert_eq!(value["bio"], "hello");
        assert_eq!(value["links"][0], "void(0)");
        assert_eq!(value["links"][1], "https://example.org");
        assert_eq!(value["count"], 3);
    }

    #[test]
    fn test_depth_limit() {
        let s = Sanitizer::new(2).unwrap();
        let mut value = json!({ "a": { "b": { "c": "<script>x</script>" } } });
        assert!(!s.clean_value(&mut value));
        assert_eq!(value["a"]["b"]["c"], "<script>x</script>");
    }

    #[test]
    fn test_clean_urlencoded() {
        let s = sanitizer();
        assert!(s.clean_urlencoded(b"page=2&sort=asc").is_none());
        let cleaned = s
            .clean_urlencoded(b"q=%3Cscript%3Ealert(1)%3C%2Fscript%3Ehi&page=2")
            .unwrap();
        assert_eq!(cleaned, "q=hi&page=2");
    }

    #[tokio::test]
    async fn test_body_rewritten_only_when_dirty() {
        let s = sanitizer();

        let clean = r#"{ "username" : "alice" }"#;
        let req = Request::builder()
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(clean))
            .unwrap();
        let (req, changed) = sanitize_body(&s, req, 1024).await;
        assert!(!changed);
        let bytes = axum::body::to_bytes(req.into_body(), 1024).await.unwrap();
        assert_eq!(bytes, clean.as_bytes());

        let req = Request::builder()
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(r#"{"username":"<script>alert(1)</script>bob"}"#))
            .unwrap();
        let (req, changed) = sanitize_body(&s, req, 1024).await;
        assert!(changed);
        let bytes = axum::body::to_bytes(req.into_body(), 1024).await.unwrap();
        let value: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(value["username"], "bob");
    }

    #[tokio::test]
    async fn test_oversized_body_passes_through() {
        let s = sanitizer();
        let body = r#"{"x":"<script>alert(1)</script>"}"#;
        let req = Request::builder()
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body))
            .unwrap();
        let (req, changed) = sanitize_body(&s, req, 4).await;
        assert!(!changed);
        let bytes = axum::body::to_bytes(req.into_body(), 1024).await.unwrap();
        assert_eq!(bytes, body.as_bytes());
    }

    #[tokio::test]
    async fn test_streamed_body_is_sanitized() {
        let s = sanitizer();
        let chunks: Vec<Result<&'static str, std::io::Error>> = vec![
            Ok(r#"{"username":"<script>alert(1)"#),
            Ok(r#"</script>bob"}"#),
        ];
        let req = Request::builder()
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from_stream(futures::stream::iter(chunks)))
            .unwrap();
        assert_eq!(req.body().size_hint().upper(), None);

        let (req, changed) = sanitize_body(&s, req, 1024).await;
        assert!(changed);
        let bytes = axum::body::to_bytes(req.into_body(), 1024).await.unwrap();
        let value: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(value["username"], "bob");
    }

    #[tokio::test]
    async fn test_stream_over_limit_is_dropped() {
        let s = sanitizer();
        let chunks: Vec<Result<&'static str, std::io::Error>> =
            vec![Ok(r#"{"x":"#), Ok(r#""<script>alert(1)</script>"}"#)];
        let req = Request::builder()
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from_stream(futures::stream::iter(chunks)))
            .unwrap();

        let (req, changed) = sanitize_body(&s, req, 8).await;
        assert!(!changed);
        let bytes = axum::body::to_bytes(req.into_body(), 1024).await.unwrap();
        assert!(bytes.is_empty());
    }

    #[tokio::test]
    async fn test_failed_read_drops_body() {
        let s = sanitizer();
        let chunks: Vec<Result<&'static str, std::io::Error>> = vec![
            Ok(r#"{"x":"#),
            Err(std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset")),
        ];
        let req = Request::builder()
            .header(header::CONTENT_TYPE, "application/json")
            .header(header::CONTENT_LENGTH, "12")
            .body(Body::from_stream(futures::stream::iter(chunks)))
            .unwrap();

        let (req, changed) = sanitize_body(&s, req, 1024).await;
        assert!(!changed);
        assert!(!req.headers().contains_key(header::CONTENT_LENGTH));
        let bytes = axum::body::to_bytes(req.into_body(), 1024).await.unwrap();
        assert!(bytes.is_empty());
    }

    #[test]
    fn test_query_rewrite() {
        let s = sanitizer();
        let mut req = Request::builder()
            .uri("/api/home?tab=%3Cscript%3Ex%3C%2Fscript%3Eabout")
            .body(Body::empty())
            .unwrap();
        assert!(sanitize_query(&s, &mut req));
        assert_eq!(req.uri().query(), Some("tab=about"));

        let mut req = Request::builder()
            .uri("/api/home?tab=about")
            .body(Body::empty())
            .unwrap();
        assert!(!sanitize_query(&s, &mut req));
        assert_eq!(req.uri().query(), Some("tab=about"));
    }
}
