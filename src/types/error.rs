//! Error types for Agora
//!
//! Request-time problems surface as typed errors that the HTTP layer maps to
//! status codes. Background failures never travel this way; they become
//! issues (see `crate::issues`).

use hyper::StatusCode;

/// Main error type for Agora operations
#[derive(Debug, Clone, thiserror::Error)]
pub enum AgoraError {
    #[error("Session error: {0}")]
    Session(String),

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Permission denied: {0}")]
    Permissions(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl AgoraError {
    /// Convert error to HTTP status code
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Session(_) => StatusCode::UNAUTHORIZED,
            Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Permissions(_) => StatusCode::FORBIDDEN,
            Self::Configuration(_) => StatusCode::CONFLICT,
            Self::Io(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Network(_) => StatusCode::BAD_GATEWAY,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Short machine-readable name, used in JSON error bodies
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Session(_) => "session",
            Self::Validation(_) => "validation",
            Self::NotFound(_) => "not-found",
            Self::Permissions(_) => "permissions",
            Self::Configuration(_) => "configuration",
            Self::Io(_) => "io",
            Self::Network(_) => "network",
            Self::Internal(_) => "internal",
        }
    }

    /// Convert to status code and body tuple for HTTP response
    pub fn into_status_code_and_body(self) -> (StatusCode, String) {
        let status = self.status_code();
        let body = serde_json::json!({ "error": self.to_string(), "kind": self.kind() });
        (status, body.to_string())
    }
}

// Implement From conversions for common error types

impl From<std::io::Error> for AgoraError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

impl From<serde_json::Error> for AgoraError {
    fn from(err: serde_json::Error) -> Self {
        Self::Validation(format!("JSON error: {}", err))
    }
}

impl From<hyper::Error> for AgoraError {
    fn from(err: hyper::Error) -> Self {
        Self::Internal(format!("HTTP error: {}", err))
    }
}

impl From<reqwest::Error> for AgoraError {
    fn from(err: reqwest::Error) -> Self {
        Self::Network(err.to_string())
    }
}

/// Result type alias for Agora operations
pub type Result<T> = std::result::Result<T, AgoraError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(
            AgoraError::Permissions("banned".into()).status_code(),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            AgoraError::Session("no caller".into()).status_code(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            AgoraError::NotFound("db".into()).status_code(),
            StatusCode::NOT_FOUND
        );
    }

    #[test]
    fn test_error_body_is_json() {
        let (status, body) = AgoraError::Validation("bad vote".into()).into_status_code_and_body();
        assert_eq!(status, StatusCode::BAD_REQUEST);
        let value: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(value["kind"], "validation");
    }
}
