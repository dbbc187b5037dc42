// Error handling module
// Defines authentication and API error kinds shared by the request pipeline

use serde_json::Value;
use thiserror::Error;

/// Authentication failures
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    /// Login rejected by the server (carries the server's detail message)
    #[error("Invalid credentials: {0}")]
    InvalidCredentials(String),

    /// Refresh requested while no refresh token is held
    #[error("No refresh token available")]
    NoRefreshToken,

    /// Refresh request rejected; the session has been cleared
    #[error("Token refresh failed: {0}")]
    RefreshFailed(String),

    /// A transparent refresh failed during a request
    #[error("Session expired, please log in again")]
    SessionExpired,
}

/// Errors returned by the request pipeline
///
/// `Clone` so that every waiter on a single-flight fetch receives the same
/// outcome.
#[derive(Error, Debug, Clone)]
pub enum ApiError {
    /// Authentication error
    #[error(transparent)]
    Auth(#[from] AuthError),

    /// Non-success HTTP status from the API
    #[error("HTTP {status}: {detail}")]
    HttpStatus { status: u16, detail: String },

    /// Transport-level failure (DNS, connect, timeout, ...)
    #[error("Network error: {0}")]
    Network(String),

    /// Response body could not be decoded
    #[error("Invalid response: {0}")]
    Decode(String),

    /// Token persistence failure
    #[error("Token storage error: {0}")]
    Storage(String),

    /// Request could not be built
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Internal error (e.g. a fetch task panicked)
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ApiError {
    /// HTTP status carried by the error, if any
    pub fn status(&self) -> Option<u16> {
        match self {
            ApiError::HttpStatus { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Whether the caller should send the user back to the login screen
    pub fn is_session_expired(&self) -> bool {
        matches!(self, ApiError::Auth(AuthError::SessionExpired))
    }

    /// Short label used for metrics and structured logs
    pub fn kind(&self) -> &'static str {
        match self {
            ApiError::Auth(AuthError::InvalidCredentials(_)) => "invalid_credentials",
            ApiError::Auth(AuthError::NoRefreshToken) => "no_refresh_token",
            ApiError::Auth(AuthError::RefreshFailed(_)) => "refresh_failed",
            ApiError::Auth(AuthError::SessionExpired) => "session_expired",
            ApiError::HttpStatus { .. } => "http_status",
            ApiError::Network(_) => "network",
            ApiError::Decode(_) => "decode",
            ApiError::Storage(_) => "storage",
            ApiError::InvalidRequest(_) => "invalid_request",
            ApiError::Internal(_) => "internal",
        }
    }

    /// Build an `HttpStatus` error from a raw response body
    pub fn from_status(status: u16, body: &str) -> Self {
        ApiError::HttpStatus {
            status,
            detail: error_detail(body).unwrap_or_else(|| generic_detail(status)),
        }
    }
}

impl From<reqwest::Error> for ApiError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            return ApiError::Decode(e.to_string());
        }
        if e.is_builder() {
            return ApiError::InvalidRequest(e.to_string());
        }

        // Categorize the error for better debugging
        let error_kind = if e.is_timeout() {
            "timeout"
        } else if e.is_connect() {
            "connection_failed"
        } else if e.is_request() {
            "request_error"
        } else if e.is_body() {
            "body_error"
        } else {
            "unknown"
        };

        ApiError::Network(format!("{} (kind: {})", e, error_kind))
    }
}

/// Extract the `detail` field from an error body
///
/// Accepts a plain string or a list of validation objects carrying `msg`.
pub fn error_detail(body: &str) -> Option<String> {
    let json: Value = serde_json::from_str(body).ok()?;

    match json.get("detail")? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Array(items) => {
            let messages: Vec<&str> = items
                .iter()
                .filter_map(|item| item.get("msg").and_then(|m| m.as_str()))
                .collect();
            if messages.is_empty() {
                None
            } else {
                Some(messages.join("; "))
            }
        }
        _ => None,
    }
}

fn generic_detail(status: u16) -> String {
    format!("Request failed with status {}", status)
}

/// Result type alias for API operations
pub type Result<T> = std::result::Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let err = ApiError::from(AuthError::InvalidCredentials("Incorrect password".to_string()));
        assert_eq!(err.to_string(), "Invalid credentials: Incorrect password");

        let err = ApiError::HttpStatus {
            status: 404,
            detail: "Product not found".to_string(),
        };
        assert_eq!(err.to_string(), "HTTP 404: Product not found");

        let err = ApiError::Network("connection refused".to_string());
        assert_eq!(err.to_string(), "Network error: connection refused");
    }

    #[test]
    fn test_session_expired_detection() {
        assert!(ApiError::from(AuthError::SessionExpired).is_session_expired());
        assert!(!ApiError::from(AuthError::NoRefreshToken).is_session_expired());
        assert!(!ApiError::Network("x".to_string()).is_session_expired());
    }

    #[test]
    fn test_status_accessor() {
        let err = ApiError::from_status(422, "{}");
        assert_eq!(err.status(), Some(422));
        assert_eq!(ApiError::Decode("bad".to_string()).status(), None);
    }

    #[test]
    fn test_error_detail_string() {
        let body = r#"{"detail": "Product not found"}"#;
        assert_eq!(error_detail(body), Some("Product not found".to_string()));
    }

    #[test]
    fn test_error_detail_validation_list() {
        let body = r#"{"detail": [
            {"loc": ["body", "title"], "msg": "field required", "type": "value_error.missing"},
            {"loc": ["body", "price"], "msg": "value is not a valid float", "type": "type_error.float"}
        ]}"#;
        assert_eq!(
            error_detail(body),
            Some("field required; value is not a valid float".to_string())
        );
    }

    #[test]
    fn test_error_detail_missing_falls_back() {
        let err = ApiError::from_status(500, "<html>Internal Server Error</html>");
        match err {
            ApiError::HttpStatus { status, detail } => {
                assert_eq!(status, 500);
                assert_eq!(detail, "Request failed with status 500");
            }
            other => panic!("unexpected error: {:?}", other),
        }

        assert_eq!(error_detail(r#"{"detail": ""}"#), None);
        assert_eq!(error_detail(r#"{"message": "nope"}"#), None);
    }

    #[test]
    fn test_error_kinds() {
        assert_eq!(ApiError::from(AuthError::SessionExpired).kind(), "session_expired");
        assert_eq!(ApiError::from_status(400, "").kind(), "http_status");
        assert_eq!(ApiError::Network("x".to_string()).kind(), "network");
    }
}
