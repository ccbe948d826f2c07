/// Unified error types for the Meridian PDS
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Main error type for the PDS
#[derive(Error, Debug)]
pub enum PdsError {
    /// Database errors
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Malformed or otherwise unacceptable request input
    #[error("{0}")]
    InvalidRequest(String),

    /// Handle failed syntax or policy checks
    #[error("Invalid handle: {0}")]
    InvalidHandle(String),

    /// Wrong password for an existing account
    #[error("Invalid password")]
    InvalidPassword,

    /// Unknown or exhausted invite code
    #[error("Invalid invite code")]
    InvalidInviteCode,

    /// Handle already registered
    #[error("Handle is not available")]
    HandleNotAvailable,

    /// Email already registered
    #[error("Email is not available")]
    EmailNotAvailable,

    /// Handle domain is not served by this PDS
    #[error("Unsupported handle domain: {0}")]
    UnsupportedDomain(String),

    /// No repo exists for the DID
    #[error("Repo not found: {0}")]
    RepoNotFound(String),

    /// Repo exists but is deactivated
    #[error("Repo has been deactivated")]
    RepoDeactivated,

    /// Account has been taken down by the operator
    #[error("Account has been taken down")]
    AccountTakedown,

    /// Record path did not resolve
    #[error("Record not found: {0}")]
    RecordNotFound(String),

    /// App password name already in use
    #[error("App password name is already in use")]
    DuplicateName,

    /// No app password with the given name
    #[error("App password not found")]
    AppPasswordNotFound,

    /// Token failed signature or lookup
    #[error("Invalid token")]
    InvalidToken,

    /// Token was valid but has expired
    #[error("Token has expired")]
    ExpiredToken,

    /// No usable credentials on the request
    #[error("Authentication required: {0}")]
    AuthRequired(String),

    /// DPoP proof is missing the currently required nonce
    #[error("use_dpop_nonce")]
    UseDpopNonce,

    /// OAuth protocol error, carried to the client verbatim
    #[error("{message}")]
    Oauth { code: &'static str, message: String },

    /// Not found errors outside the record path
    #[error("Not found: {0}")]
    NotFound(String),

    /// Repository/MST level failures
    #[error("Repo error: {0}")]
    Repo(String),

    /// Blob storage failures
    #[error("Blob error: {0}")]
    Blob(String),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal server errors
    #[error("Internal error: {0}")]
    Internal(String),
}

impl PdsError {
    /// Shorthand for OAuth protocol errors with the standard `invalid_request` code.
    pub fn oauth_invalid(message: impl Into<String>) -> Self {
        PdsError::Oauth {
            code: "invalid_request",
            message: message.into(),
        }
    }

    /// The `error` field of the XRPC response body.
    pub fn error_code(&self) -> &str {
        match self {
            PdsError::InvalidRequest(_) => "InvalidRequest",
            PdsError::InvalidHandle(_) => "InvalidHandle",
            PdsError::InvalidPassword => "InvalidPassword",
            PdsError::InvalidInviteCode => "InvalidInviteCode",
            PdsError::HandleNotAvailable => "HandleNotAvailable",
            PdsError::EmailNotAvailable => "EmailNotAvailable",
            PdsError::UnsupportedDomain(_) => "UnsupportedDomain",
            PdsError::RepoNotFound(_) => "RepoNotFound",
            PdsError::RepoDeactivated => "RepoDeactivated",
            PdsError::AccountTakedown => "AccountTakedown",
            PdsError::RecordNotFound(_) => "RecordNotFound",
            PdsError::DuplicateName => "DuplicateName",
            PdsError::AppPasswordNotFound => "AppPasswordNotFound",
            PdsError::InvalidToken => "InvalidToken",
            PdsError::ExpiredToken => "ExpiredToken",
            PdsError::AuthRequired(_) => "AuthRequired",
            PdsError::UseDpopNonce => "use_dpop_nonce",
            PdsError::Oauth { code, .. } => code,
            PdsError::NotFound(_) => "NotFound",
            PdsError::Database(_)
            | PdsError::Io(_)
            | PdsError::Internal(_)
            | PdsError::Repo(_)
            | PdsError::Blob(_) => "InternalServerError",
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            PdsError::AuthRequired(_) => StatusCode::UNAUTHORIZED,
            PdsError::AccountTakedown => StatusCode::FORBIDDEN,
            PdsError::RecordNotFound(_) | PdsError::NotFound(_) => StatusCode::NOT_FOUND,
            PdsError::Database(_)
            | PdsError::Io(_)
            | PdsError::Internal(_)
            | PdsError::Repo(_)
            | PdsError::Blob(_) => StatusCode::INTERNAL_SERVER_ERROR,
            _ => StatusCode::BAD_REQUEST,
        }
    }
}

impl From<serde_json::Error> for PdsError {
    fn from(e: serde_json::Error) -> Self {
        PdsError::Internal(format!("serialization error: {}", e))
    }
}

/// XRPC error response format
#[derive(Debug, Serialize, Deserialize)]
pub struct XrpcErrorResponse {
    pub error: String,
    pub message: String,
}

/// Convert PdsError to HTTP response
impl IntoResponse for PdsError {
    fn into_response(self) -> Response {
        let status = self.status();
        let error = self.error_code().to_string();

        let message = match &self {
            // See https://github.com/bluesky-social/atproto/discussions/3319
            PdsError::ExpiredToken => "*".to_string(),
            PdsError::Database(_)
            | PdsError::Io(_)
            | PdsError::Internal(_)
            | PdsError::Repo(_)
            | PdsError::Blob(_) => {
                tracing::error!(error = %self, "internal server error");
                "Internal server error".to_string() // Don't leak details
            }
            other => other.to_string(),
        };

        let body = Json(XrpcErrorResponse { error, message });

        (status, body).into_response()
    }
}

/// Result type alias for PDS operations
pub type PdsResult<T> = Result<T, PdsError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(
            PdsError::HandleNotAvailable.error_code(),
            "HandleNotAvailable"
        );
        assert_eq!(PdsError::UseDpopNonce.error_code(), "use_dpop_nonce");
        assert_eq!(
            PdsError::Internal("details".to_string()).error_code(),
            "InternalServerError"
        );
    }

    #[test]
    fn test_internal_errors_do_not_leak() {
        let resp = PdsError::Internal("secret connection string".to_string()).into_response();
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn test_expired_token_is_400_with_star_message() {
        let err = PdsError::ExpiredToken;
        assert_eq!(err.error_code(), "ExpiredToken");
        let resp = err.into_response();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }
}
