//! Unified error response handling for the gateway
//!
//! Every error the gateway itself produces (as opposed to provider errors,
//! which are relayed) uses the same JSON shape and echoes the request id.

use crate::proxy::headers::X_REQUEST_ID;
use crate::proxy::types::ProxyError;
use axum::{
    http::{HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};

/// Standard error response format
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Unique error code for programmatic handling
    pub code: String,
    /// Human-readable error message
    pub message: String,
    /// Request ID for correlation
    pub request_id: Option<String>,
}

impl ErrorResponse {
    /// Create a new error response
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            request_id: None,
        }
    }

    /// Add request ID for correlation
    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    /// Convert to HTTP response with proper headers
    pub fn into_response_with_status(self, status: StatusCode) -> Response {
        let request_id = self.request_id.clone();
        let mut response = (status, Json(self)).into_response();

        if let Some(id) = request_id {
            if let Ok(header_value) = HeaderValue::from_str(&id) {
                response.headers_mut().insert(X_REQUEST_ID, header_value);
            }
        }

        response
    }
}

/// Extension trait for consistent error formatting
pub trait ErrorResponseExt {
    /// Convert to standardized error response
    fn to_error_response(&self) -> ErrorResponse;

    /// Get the appropriate HTTP status code
    fn status_code(&self) -> StatusCode;
}

impl ErrorResponseExt for ProxyError {
    fn to_error_response(&self) -> ErrorResponse {
        use ProxyError::*;

        match self {
            RequestTooLarge { size, max_size } => ErrorResponse::new(
                "REQUEST_TOO_LARGE",
                format!("Request size {size} exceeds maximum {max_size}"),
            ),
            Unauthorized => ErrorResponse::new("UNAUTHORIZED", "Invalid gateway credentials"),
            InvalidBody(msg) => ErrorResponse::new("INVALID_REQUEST_BODY", msg.clone()),
            InvalidTargetUrl(msg) => {
                ErrorResponse::new("INVALID_TARGET_URL", format!("Invalid target URL: {msg}"))
            }
            UnknownProvider(name) => {
                ErrorResponse::new("UNKNOWN_PROVIDER", format!("Unknown provider: {name}"))
            }
            Mapping(e) => ErrorResponse::new("INVALID_REQUEST_OPTIONS", e.to_string()),
            Admission(e) => ErrorResponse::new("RATE_LIMIT_SEGMENT_ERROR", e.to_string()),
            Internal(msg) => ErrorResponse::new("INTERNAL_ERROR", msg.clone()),
        }
    }

    fn status_code(&self) -> StatusCode {
        use ProxyError::*;

        match self {
            RequestTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            Unauthorized => StatusCode::UNAUTHORIZED,
            InvalidBody(_) | InvalidTargetUrl(_) | UnknownProvider(_) => StatusCode::BAD_REQUEST,
            Mapping(_) | Admission(_) | Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        self.to_error_response()
            .into_response_with_status(self.status_code())
    }
}
