use thiserror::Error;

use crate::api::ApiError;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("Invalid credentials: {0}")]
    InvalidCredentials(String),

    #[error("Server unreachable: {0}")]
    ServerUnreachable(String),

    #[error("Missing required field: {0}")]
    MissingCredential(&'static str),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Unsupported auth method: {0}")]
    UnsupportedMethod(String),

    #[error("{0} login completes in the browser; adopt the resulting token instead")]
    ExternalMethod(String),

    #[error("Not authenticated")]
    NotAuthenticated,

    #[error("Token renewal failed: {0}")]
    RenewalFailed(String),

    #[error("Authentication failed: {0}")]
    Unknown(String),
}

/// Coarse classification shown to the person at the login form.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthErrorKind {
    InvalidCredentials,
    ServerUnreachable,
    Unknown,
}

impl AuthError {
    pub fn kind(&self) -> AuthErrorKind {
        match self {
            AuthError::InvalidCredentials(_) => AuthErrorKind::InvalidCredentials,
            AuthError::ServerUnreachable(_) => AuthErrorKind::ServerUnreachable,
            _ => AuthErrorKind::Unknown,
        }
    }

    /// Short message suitable for a login form or toast.
    pub fn user_message(&self) -> String {
        match self.kind() {
            AuthErrorKind::InvalidCredentials => "Invalid credentials".to_string(),
            AuthErrorKind::ServerUnreachable => "Unable to reach the server".to_string(),
            AuthErrorKind::Unknown => self.to_string(),
        }
    }
}

impl From<ApiError> for AuthError {
    fn from(err: ApiError) -> Self {
        match err {
            ApiError::Unauthorized => AuthError::InvalidCredentials("token rejected".to_string()),
            ApiError::AccessDenied(msg) => AuthError::InvalidCredentials(msg),
            ApiError::Network(msg) => AuthError::ServerUnreachable(msg),
            other => AuthError::Unknown(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        assert_eq!(AuthError::from(ApiError::Unauthorized).kind(), AuthErrorKind::InvalidCredentials);
        assert_eq!(
            AuthError::from(ApiError::AccessDenied("permission denied".into())).kind(),
            AuthErrorKind::InvalidCredentials
        );
        assert_eq!(
            AuthError::from(ApiError::Network("refused".into())).kind(),
            AuthErrorKind::ServerUnreachable
        );
        assert_eq!(AuthError::from(ApiError::NotFound("x".into())).kind(), AuthErrorKind::Unknown);
        assert_eq!(AuthError::from(ApiError::ServerError("x".into())).kind(), AuthErrorKind::Unknown);
    }

    #[test]
    fn test_user_message() {
        let err = AuthError::InvalidCredentials("permission denied".into());
        assert_eq!(err.user_message(), "Invalid credentials");
        let err = AuthError::MissingCredential("password");
        assert!(err.user_message().contains("password"));
    }
}
