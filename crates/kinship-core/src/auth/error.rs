//! Auth error taxonomy.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Backend error codes that mean the refresh credential is gone for good.
const SESSION_MISSING_CODES: &[&str] = &[
    "refresh_token_not_found",
    "refresh_token_already_used",
    "session_not_found",
    "session_expired",
];

/// PostgREST code for "single row requested, zero returned".
pub const ROW_NOT_FOUND_CODE: &str = "PGRST116";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthErrorKind {
    /// The backend rejected the request (bad credentials, duplicate account, ...).
    Api,
    /// No session, or the refresh credential was revoked.
    SessionMissing,
    /// A single-row lookup found nothing.
    NotFound,
    /// Connection failure, timeout or 5xx.
    Network,
    /// Response body could not be understood.
    Parse,
    /// Local key/value storage failed.
    Storage,
    /// Anything unexpected.
    Internal,
}

impl fmt::Display for AuthErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthErrorKind::Api => write!(f, "api"),
            AuthErrorKind::SessionMissing => write!(f, "session_missing"),
            AuthErrorKind::NotFound => write!(f, "not_found"),
            AuthErrorKind::Network => write!(f, "network"),
            AuthErrorKind::Parse => write!(f, "parse"),
            AuthErrorKind::Storage => write!(f, "storage"),
            AuthErrorKind::Internal => write!(f, "internal"),
        }
    }
}

/// Structured error from an auth or profile operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthError {
    pub kind: AuthErrorKind,
    /// One-line summary suitable for display
    pub message: String,
    /// HTTP status, when the error came from a response.
    pub status: Option<u16>,
    /// Backend error code (`error_code`, `error` or PostgREST `code`).
    pub code: Option<String>,
    pub details: Option<String>,
}

impl AuthError {
    pub fn new(kind: AuthErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            status: None,
            code: None,
            details: None,
        }
    }

    pub fn session_missing(message: impl Into<String>) -> Self {
        Self::new(AuthErrorKind::SessionMissing, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(AuthErrorKind::NotFound, message)
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(AuthErrorKind::Network, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(AuthErrorKind::Internal, message)
    }

    pub fn storage(err: &anyhow::Error) -> Self {
        Self::new(AuthErrorKind::Storage, format!("{err:#}"))
    }

    /// Classifies a non-success response from the auth or data backend.
    ///
    /// Understands the GoTrue shapes (`error_code`/`msg`, `error`/`error_description`)
    /// and the PostgREST shape (`code`/`message`).
    pub fn from_response(status: u16, body: &str) -> Self {
        let json: Option<Value> = serde_json::from_str(body).ok();
        let field = |name: &str| {
            json.as_ref()
                .and_then(|j| j.get(name))
                .and_then(Value::as_str)
                .map(ToString::to_string)
        };

        let code = field("error_code")
            .or_else(|| field("error"))
            .or_else(|| field("code"));
        let detail_message = field("msg")
            .or_else(|| field("error_description"))
            .or_else(|| field("message"));

        let kind = if code.as_deref() == Some(ROW_NOT_FOUND_CODE) {
            AuthErrorKind::NotFound
        } else if code
            .as_deref()
            .is_some_and(|c| SESSION_MISSING_CODES.contains(&c))
        {
            AuthErrorKind::SessionMissing
        } else if status >= 500 || status == 408 || status == 429 {
            AuthErrorKind::Network
        } else {
            AuthErrorKind::Api
        };

        let message = match &detail_message {
            Some(msg) => format!("HTTP {status}: {msg}"),
            None => format!("HTTP {status}"),
        };

        Self {
            kind,
            message,
            status: Some(status),
            code,
            details: if body.is_empty() {
                None
            } else {
                Some(body.to_string())
            },
        }
    }

    /// Wraps a transport failure.
    pub fn from_transport(err: &reqwest::Error) -> Self {
        if err.is_decode() {
            return Self::new(AuthErrorKind::Parse, format!("Invalid response: {err}"));
        }
        Self::network(format!("Request failed: {err}"))
    }

    pub fn is_session_missing(&self) -> bool {
        self.kind == AuthErrorKind::SessionMissing
    }

    pub fn is_not_found(&self) -> bool {
        self.kind == AuthErrorKind::NotFound
    }

    /// Whether retrying the same request could plausibly succeed.
    pub fn is_transient(&self) -> bool {
        match self.kind {
            AuthErrorKind::NotFound | AuthErrorKind::SessionMissing => false,
            AuthErrorKind::Api => self.status.is_none_or(|s| s >= 500),
            _ => true,
        }
    }
}

impl fmt::Display for AuthError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for AuthError {}

/// Result type for auth operations.
pub type AuthResult<T> = std::result::Result<T, AuthError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_postgrest_single_row_miss_is_not_found() {
        let body = r#"{"code":"PGRST116","details":"The result contains 0 rows","message":"JSON object requested, multiple (or no) rows returned"}"#;
        let err = AuthError::from_response(406, body);
        assert!(err.is_not_found());
        assert!(!err.is_transient());
        assert_eq!(err.code.as_deref(), Some(ROW_NOT_FOUND_CODE));
    }

    #[test]
    fn test_revoked_refresh_token_is_session_missing() {
        let body = r#"{"code":400,"error_code":"refresh_token_not_found","msg":"Invalid Refresh Token: Refresh Token Not Found"}"#;
        let err = AuthError::from_response(400, body);
        assert!(err.is_session_missing());
        assert_eq!(
            err.message,
            "HTTP 400: Invalid Refresh Token: Refresh Token Not Found"
        );
    }

    #[test]
    fn test_bad_credentials_is_api_and_not_transient() {
        let body = r#"{"error":"invalid_grant","error_description":"Invalid login credentials"}"#;
        let err = AuthError::from_response(400, body);
        assert_eq!(err.kind, AuthErrorKind::Api);
        assert_eq!(err.code.as_deref(), Some("invalid_grant"));
        assert!(!err.is_transient());
    }

    #[test]
    fn test_server_error_is_transient() {
        let err = AuthError::from_response(503, "");
        assert_eq!(err.kind, AuthErrorKind::Network);
        assert!(err.is_transient());
        assert_eq!(err.message, "HTTP 503");
        assert!(err.details.is_none());
    }
}
