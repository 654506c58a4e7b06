use std::fmt;

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};

use super::flow::FlowError;

/// JSON error body: `{"error": {"type": "...", "message": "...", "param": ..., "code": ...}}`.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: ErrorInfo,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorInfo {
    /// Error type classification (e.g., "invalid_request_error", "authentication_error")
    #[serde(rename = "type")]
    pub error_type: String,
    /// Human-readable error message
    pub message: String,
    /// Parameter that caused the error (null if not applicable)
    pub param: Option<String>,
    /// Machine-readable error code (null if not applicable)
    pub code: Option<String>,
}

impl ErrorResponse {
    /// Create an error response with an explicit error type.
    ///
    /// Error types used by the broker:
    /// - "invalid_request_error" - invalid parameters
    /// - "authentication_error" - the login could not be completed
    /// - "not_found_error" - unknown connection
    /// - "server_error" - internal failure
    pub fn with_type(
        error_type: impl Into<String>,
        code: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            error: ErrorInfo {
                error_type: error_type.into(),
                message: message.into(),
                param: None,
                code: Some(code.into()),
            },
        }
    }

    pub fn with_param(mut self, param: impl Into<String>) -> Self {
        self.error.param = Some(param.into());
        self
    }
}

#[derive(Debug)]
pub enum AuthError {
    /// The SAML login failed. Deliberately opaque: the specific reason is
    /// logged, never returned.
    AuthenticationFailed,

    /// No enabled connection with this ID
    ConnectionNotFound(String),

    /// The return URL was rejected
    InvalidReturnUrl(String),

    /// A required request parameter is absent
    MissingParameter(&'static str),

    /// Internal error while handling the request
    Internal(String),
}

impl AuthError {
    /// Map a failure to start a login onto a client-facing error.
    pub fn from_initiate(error: &FlowError) -> Self {
        match error {
            FlowError::UnknownConnection(id) => AuthError::ConnectionNotFound(id.clone()),
            FlowError::InvalidReturnUrl(reason) => AuthError::InvalidReturnUrl(reason.clone()),
            other => AuthError::Internal(other.kind().to_string()),
        }
    }
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let (status, body) = match &self {
            AuthError::AuthenticationFailed => (
                StatusCode::UNAUTHORIZED,
                ErrorResponse::with_type(
                    "authentication_error",
                    "authentication_failed",
                    "Authentication failed",
                ),
            ),
            AuthError::ConnectionNotFound(id) => (
                StatusCode::NOT_FOUND,
                ErrorResponse::with_type(
                    "not_found_error",
                    "connection_not_found",
                    format!("SAML connection '{}' not found", id),
                ),
            ),
            AuthError::InvalidReturnUrl(reason) => (
                StatusCode::BAD_REQUEST,
                ErrorResponse::with_type(
                    "invalid_request_error",
                    "invalid_return_url",
                    format!("Invalid return URL: {}", reason),
                )
                .with_param("returnURL"),
            ),
            AuthError::MissingParameter(param) => (
                StatusCode::BAD_REQUEST,
                ErrorResponse::with_type(
                    "invalid_request_error",
                    "missing_parameter",
                    format!("Missing required parameter '{}'", param),
                )
                .with_param(*param),
            ),
            // Don't expose internals to clients
            AuthError::Internal(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                ErrorResponse::with_type("server_error", "internal_error", "Internal server error"),
            ),
        };

        (status, Json(body)).into_response()
    }
}

impl fmt::Display for AuthError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthError::AuthenticationFailed => write!(f, "Authentication failed"),
            AuthError::ConnectionNotFound(id) => write!(f, "SAML connection '{}' not found", id),
            AuthError::InvalidReturnUrl(reason) => write!(f, "Invalid return URL: {}", reason),
            AuthError::MissingParameter(param) => {
                write!(f, "Missing required parameter '{}'", param)
            }
            AuthError::Internal(msg) => write!(f, "Internal error: {}", msg),
        }
    }
}

impl std::error::Error for AuthError {}
