pub mod auth;
pub mod content;
mod health;

use axum::extract::FromRequest;

use crate::error::AppError;

pub use health::{health_check, not_found, readiness_check, stats};

/// `Json` extractor whose rejections render as the standard error envelope.
#[derive(Debug, FromRequest)]
#[from_request(via(axum::Json), rejection(AppError))]
pub struct AppJson<T>(pub T);
