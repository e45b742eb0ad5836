use std::time::Duration;

use axum::extract::rejection::JsonRejection;
use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::storage::DatabaseError;

/// Application-wide error types with appropriate HTTP status codes.
///
/// Every variant renders to the same JSON envelope (see [`ErrorEnvelope`]).
/// Messages of server-side variants are replaced with generic text before
/// they reach the client; the original is attached to the response as an
/// [`InternalDetail`] extension for the error-context middleware.
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Validation failed: {message}")]
    Validation {
        message: String,
        details: Option<Value>,
    },

    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("Forbidden ({code}): {message}")]
    Forbidden { code: &'static str, message: String },

    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Rate limit exceeded: {message}")]
    RateLimited {
        message: String,
        retry_after: Duration,
    },

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("External service error: {0}")]
    ExternalService(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal server error: {0}")]
    Internal(String),

    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl AppError {
    /// Validation error without per-field details.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
            details: None,
        }
    }

    /// The error category exposed to clients.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation { .. } | Self::Serialization(_) => ErrorKind::ValidationError,
            Self::Authentication(_) => ErrorKind::AuthenticationError,
            Self::Forbidden { .. } => ErrorKind::AuthorizationError,
            Self::NotFound(_) => ErrorKind::NotFoundError,
            Self::RateLimited { .. } => ErrorKind::RateLimitError,
            Self::Database(_) => ErrorKind::DatabaseError,
            Self::ExternalService(_) => ErrorKind::ExternalServiceError,
            Self::Internal(_) => ErrorKind::InternalError,
            Self::Configuration(_) => ErrorKind::ConfigurationError,
        }
    }

    pub fn status(&self) -> StatusCode {
        self.kind().status()
    }

    /// Build the client-facing envelope. Server-side messages are replaced.
    pub fn to_envelope(&self) -> ErrorEnvelope {
        let (message, details) = match self {
            Self::Validation { message, details } => (message.clone(), details.clone()),
            Self::Serialization(e) => (sanitize_serde_error(e), None),
            Self::Authentication(msg) | Self::NotFound(msg) => (msg.clone(), None),
            Self::Forbidden { code, message } => {
                (message.clone(), Some(serde_json::json!({ "code": code })))
            }
            Self::RateLimited {
                message,
                retry_after,
            } => (
                message.clone(),
                Some(serde_json::json!({ "retryAfter": retry_after_secs(*retry_after) })),
            ),
            Self::Database(_) => ("A database error occurred".to_string(), None),
            Self::ExternalService(_) => (
                "An upstream service is temporarily unavailable. Please try again later."
                    .to_string(),
                None,
            ),
            Self::Internal(_) => (
                "An internal error occurred. Please contact support if the issue persists."
                    .to_string(),
                None,
            ),
            Self::Configuration(_) => (
                "Service configuration error. Please contact support.".to_string(),
                None,
            ),
        };

        ErrorEnvelope::new(self.kind(), message, details)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();

        // Log the full error server-side, expose only the envelope
        if status.is_server_error() {
            tracing::error!(error = %self, kind = ?self.kind(), "Request failed");
        } else {
            tracing::debug!(error = %self, kind = ?self.kind(), "Request rejected");
        }

        let envelope = self.to_envelope();
        let mut response = (status, axum::Json(&envelope)).into_response();

        if let Self::RateLimited { retry_after, .. } = &self {
            response.headers_mut().insert(
                header::RETRY_AFTER,
                HeaderValue::from(retry_after_secs(*retry_after)),
            );
        }

        if status.is_server_error() {
            response
                .extensions_mut()
                .insert(InternalDetail(self.to_string()));
        }
        response.extensions_mut().insert(envelope);
        response
    }
}

/// Whole seconds a client should wait, never less than one.
pub fn retry_after_secs(retry_after: Duration) -> u64 {
    let secs = retry_after.as_secs();
    let rounded = if retry_after.subsec_nanos() > 0 {
        secs + 1
    } else {
        secs
    };
    rounded.max(1)
}

// =============================================================================
// Envelope
// =============================================================================

/// Error category, serialized as the envelope's `type` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    ValidationError,
    AuthenticationError,
    AuthorizationError,
    NotFoundError,
    RateLimitError,
    DatabaseError,
    ExternalServiceError,
    InternalError,
    ConfigurationError,
}

impl ErrorKind {
    pub fn status(self) -> StatusCode {
        match self {
            Self::ValidationError => StatusCode::BAD_REQUEST,
            Self::AuthenticationError => StatusCode::UNAUTHORIZED,
            Self::AuthorizationError => StatusCode::FORBIDDEN,
            Self::NotFoundError => StatusCode::NOT_FOUND,
            Self::RateLimitError => StatusCode::TOO_MANY_REQUESTS,
            Self::ExternalServiceError => StatusCode::SERVICE_UNAVAILABLE,
            Self::DatabaseError | Self::InternalError | Self::ConfigurationError => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

/// JSON body of every error response.
///
/// `request_id` and `path` are filled in by
/// [`crate::middleware::error_context`], which sees the request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorEnvelope {
    pub success: bool,
    pub error: ErrorBody,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    #[serde(rename = "type")]
    pub kind: ErrorKind,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl ErrorEnvelope {
    pub fn new(kind: ErrorKind, message: impl Into<String>, details: Option<Value>) -> Self {
        Self {
            success: false,
            error: ErrorBody {
                kind,
                message: message.into(),
                details,
            },
            timestamp: Utc::now(),
            request_id: None,
            path: None,
        }
    }
}

/// Unsanitized error text for 5xx responses. Never serialized by itself.
#[derive(Debug, Clone)]
pub struct InternalDetail(pub String);

/// Sanitize serde error messages to avoid leaking internal type information.
///
/// Serde errors can contain internal struct/field names which shouldn't be
/// exposed to external clients. This function extracts the useful parts.
pub(crate) fn sanitize_serde_error(e: &serde_json::Error) -> String {
    let msg = e.to_string();
    sanitize_body_message(&msg)
}

/// Same as [`sanitize_serde_error`] for messages that were already rendered,
/// e.g. by an extractor rejection.
pub(crate) fn sanitize_body_message(msg: &str) -> String {
    if let Some(field) = backticked(msg, "missing field") {
        return format!("Missing required field: {field}");
    }

    if let Some(field) = backticked(msg, "unknown field") {
        return format!("Unknown field: {field}");
    }

    if msg.contains("invalid type") {
        return "Invalid data type in request body".to_string();
    }

    if msg.contains("EOF while parsing") || msg.contains("expected") {
        return "Malformed JSON in request body".to_string();
    }

    "Invalid request format".to_string()
}

fn backticked<'a>(msg: &'a str, marker: &str) -> Option<&'a str> {
    let rest = msg.get(msg.find(marker)?..)?;
    let start = rest.find('`')? + 1;
    let end = rest.get(start..)?.find('`')?;
    rest.get(start..start + end)
}

impl From<JsonRejection> for AppError {
    fn from(rejection: JsonRejection) -> Self {
        let message = match &rejection {
            JsonRejection::JsonDataError(_) | JsonRejection::JsonSyntaxError(_) => {
                sanitize_body_message(&rejection.body_text())
            }
            JsonRejection::MissingJsonContentType(_) => {
                "Expected request with `Content-Type: application/json`".to_string()
            }
            _ => "Request body could not be read".to_string(),
        };
        Self::validation(message)
    }
}

/// Convenience type alias for Results with AppError.
pub type AppResult<T> = Result<T, AppError>;
