use serde::Serialize;
use serde_json::json;

use crate::error::{AppError, AppResult};

// =============================================================================
// Validation Constants
// =============================================================================

pub const MIN_USERNAME_LENGTH: usize = 3;
pub const MAX_USERNAME_LENGTH: usize = 32;

pub const MIN_PASSWORD_LENGTH: usize = 8;

/// Upper bound keeps Argon2 work per request predictable.
pub const MAX_PASSWORD_LENGTH: usize = 128;

/// One rejected field, reported under `details.fields`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldError {
    pub field: &'static str,
    pub message: String,
}

/// Check a username against the account rules.
///
/// Rules:
/// - Between 3 and 32 characters
/// - ASCII letters, digits, underscores and hyphens only
pub fn check_username(username: &str) -> Option<String> {
    let len = username.chars().count();
    if len < MIN_USERNAME_LENGTH || len > MAX_USERNAME_LENGTH {
        return Some(format!(
            "Username must be between {MIN_USERNAME_LENGTH} and {MAX_USERNAME_LENGTH} characters"
        ));
    }

    if let Some(c) = username
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || *c == '_' || *c == '-'))
    {
        return Some(format!(
            "Username contains invalid character '{}'. \
             Only letters, numbers, underscores, and hyphens are allowed",
            c.escape_default()
        ));
    }

    None
}

/// Check a password's length. Content is not restricted.
pub fn check_password(password: &str) -> Option<String> {
    let len = password.chars().count();
    if len < MIN_PASSWORD_LENGTH {
        return Some(format!(
            "Password must be at least {MIN_PASSWORD_LENGTH} characters"
        ));
    }
    if len > MAX_PASSWORD_LENGTH {
        return Some(format!(
            "Password cannot exceed {MAX_PASSWORD_LENGTH} characters"
        ));
    }
    None
}

/// Validate registration/login credentials, reporting every failing field.
pub fn validate_credentials(username: &str, password: &str) -> AppResult<()> {
    let errors: Vec<FieldError> = [
        ("username", check_username(username)),
        ("password", check_password(password)),
    ]
    .into_iter()
    .filter_map(|(field, message)| message.map(|message| FieldError { field, message }))
    .collect();

    if errors.is_empty() {
        return Ok(());
    }

    let message = errors
        .iter()
        .map(|e| e.message.as_str())
        .collect::<Vec<_>>()
        .join("; ");
    Err(AppError::Validation {
        message,
        details: Some(json!({ "fields": errors })),
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_usernames() {
        for name in ["bob", "alice_99", "node-operator", "A1_b2-C3"] {
            assert!(check_username(name).is_none(), "{name}");
        }
        assert!(check_username(&"a".repeat(MAX_USERNAME_LENGTH)).is_none());
    }

    #[test]
    fn test_invalid_usernames() {
        assert!(check_username("ab").is_some());
        assert!(check_username(&"a".repeat(MAX_USERNAME_LENGTH + 1)).is_some());
        assert!(check_username("has space").is_some());
        assert!(check_username("dot.name").is_some());
        assert!(check_username("<script>").is_some());
        assert!(check_username("ünïcode").is_some());
    }

    #[test]
    fn test_password_length_bounds() {
        assert!(check_password("1234567").is_some());
        assert!(check_password("12345678").is_none());
        assert!(check_password(&"p".repeat(MAX_PASSWORD_LENGTH)).is_none());
        assert!(check_password(&"p".repeat(MAX_PASSWORD_LENGTH + 1)).is_some());
    }

    #[test]
    fn test_all_failing_fields_reported() {
        let err = validate_credentials("x", "short").unwrap_err();
        let envelope = err.to_envelope();
        let fields = envelope.error.details.unwrap()["fields"].clone();
        let names: Vec<&str> = fields
            .as_array()
            .unwrap()
            .iter()
            .map(|f| f["field"].as_str().unwrap())
            .collect();
        assert_eq!(names, ["username", "password"]);
    }

    #[test]
    fn test_valid_credentials() {
        assert!(validate_credentials("validator_1", "correct horse battery").is_ok());
    }
}
