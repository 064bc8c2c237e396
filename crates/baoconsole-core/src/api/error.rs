use serde::Deserialize;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ApiError {
    #[error("Access denied: {0}")]
    AccessDenied(String),

    #[error("Unauthorized - token may be expired")]
    Unauthorized,

    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Rate limited - please wait before retrying")]
    RateLimited,

    #[error("Server error: {0}")]
    ServerError(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

/// Maximum length for error response bodies in error messages
const MAX_ERROR_BODY_LENGTH: usize = 500;

/// Error body shape returned by Vault-compatible servers.
#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    errors: Vec<String>,
}

impl ApiError {
    /// Truncate a response body to avoid logging excessive data
    fn truncate_body(body: &str) -> String {
        if body.len() <= MAX_ERROR_BODY_LENGTH {
            body.to_string()
        } else {
            let mut end = MAX_ERROR_BODY_LENGTH;
            while !body.is_char_boundary(end) {
                end -= 1;
            }
            format!("{}... (truncated, {} total bytes)", &body[..end], body.len())
        }
    }

    /// Prefer the server's `errors` list over the raw body when present.
    fn describe_body(body: &str) -> String {
        match serde_json::from_str::<ErrorBody>(body) {
            Ok(parsed) if !parsed.errors.is_empty() => Self::truncate_body(&parsed.errors.join("; ")),
            _ => Self::truncate_body(body),
        }
    }

    pub fn from_status(status: u16, body: &str) -> Self {
        let described = Self::describe_body(body);
        match status {
            401 => ApiError::Unauthorized,
            403 => ApiError::AccessDenied(described),
            404 => ApiError::NotFound(described),
            429 => ApiError::RateLimited,
            500..=599 => ApiError::ServerError(described),
            _ => ApiError::InvalidResponse(format!("Status {}: {}", status, described)),
        }
    }

    /// True for the 401/403 family: the token is missing, expired or revoked.
    pub fn is_auth_failure(&self) -> bool {
        matches!(self, ApiError::Unauthorized | ApiError::AccessDenied(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, ApiError::NotFound(_))
    }
}

impl From<reqwest::Error> for ApiError {
    fn from(err: reqwest::Error) -> Self {
        ApiError::Network(err.to_string())
    }
}

// ============================================================================
// Tests
// ============================================================================
