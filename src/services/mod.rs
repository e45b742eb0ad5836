mod auth;
mod content;

pub use auth::{AuthService, INVALID_CREDENTIALS, hash_password, verify_password};
pub use content::ContentService;
