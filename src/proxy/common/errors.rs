// Unified Anthropic-compatible error formatting.
// Every client-visible failure is shaped as
// {"type": "error", "error": {"type": "<kind>", "message": "<msg>"}} —
// as plain JSON for unary requests, or a single SSE `event: error` frame
// mid-stream.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

/// Error kinds derived from upstream HTTP status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    AuthenticationError,
    PermissionError,
    RateLimitError,
    ServerError,
    TimeoutError,
    InvalidRequestError,
    NetworkError,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AuthenticationError => "authentication_error",
            Self::PermissionError => "permission_error",
            Self::RateLimitError => "rate_limit_error",
            Self::ServerError => "server_error",
            Self::TimeoutError => "timeout_error",
            Self::InvalidRequestError => "invalid_request_error",
            Self::NetworkError => "network_error",
        }
    }

    /// Classify an upstream HTTP status.
    pub fn from_status(status: u16) -> Self {
        match status {
            400 => Self::InvalidRequestError,
            401 => Self::AuthenticationError,
            403 => Self::PermissionError,
            429 => Self::RateLimitError,
            504 => Self::TimeoutError,
            500..=599 => Self::ServerError,
            _ => Self::ServerError,
        }
    }

    /// Whether a local retry (backoff or refresh) is worth attempting.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::RateLimitError
                | Self::ServerError
                | Self::TimeoutError
                | Self::NetworkError
                | Self::AuthenticationError
        )
    }

    /// Whether exhausting this error counts against the account's budget.
    /// Invalid requests are the caller's fault, not the account's.
    pub fn marks_unhealthy(&self) -> bool {
        !matches!(self, Self::InvalidRequestError)
    }

    /// HTTP status to surface to the gateway's own caller.
    pub fn http_status(&self) -> StatusCode {
        match self {
            Self::AuthenticationError => StatusCode::UNAUTHORIZED,
            Self::PermissionError => StatusCode::FORBIDDEN,
            Self::RateLimitError => StatusCode::TOO_MANY_REQUESTS,
            Self::ServerError => StatusCode::BAD_GATEWAY,
            Self::TimeoutError => StatusCode::GATEWAY_TIMEOUT,
            Self::InvalidRequestError => StatusCode::BAD_REQUEST,
            Self::NetworkError => StatusCode::BAD_GATEWAY,
        }
    }
}

/// Claude-shaped error payload.
pub fn error_body(kind: ErrorKind, message: &str) -> serde_json::Value {
    json!({
        "type": "error",
        "error": {
            "type": kind.as_str(),
            "message": message
        }
    })
}

/// Build a JSON error response for unary callers.
pub fn error_response(status: StatusCode, kind: ErrorKind, message: &str) -> Response {
    (status, Json(error_body(kind, message))).into_response()
}

/// Build a single SSE error frame. The stream must end right after it.
pub fn sse_error_frame(kind: ErrorKind, message: &str) -> String {
    format!(
        "event: error\ndata: {}\n\n",
        serde_json::to_string(&error_body(kind, message)).unwrap_or_default()
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_strings() {
        assert_eq!(ErrorKind::AuthenticationError.as_str(), "authentication_error");
        assert_eq!(ErrorKind::PermissionError.as_str(), "permission_error");
        assert_eq!(ErrorKind::RateLimitError.as_str(), "rate_limit_error");
        assert_eq!(ErrorKind::ServerError.as_str(), "server_error");
        assert_eq!(ErrorKind::TimeoutError.as_str(), "timeout_error");
        assert_eq!(ErrorKind::InvalidRequestError.as_str(), "invalid_request_error");
        assert_eq!(ErrorKind::NetworkError.as_str(), "network_error");
    }

    #[test]
    fn test_status_classification() {
        assert_eq!(ErrorKind::from_status(400), ErrorKind::InvalidRequestError);
        assert_eq!(ErrorKind::from_status(401), ErrorKind::AuthenticationError);
        assert_eq!(ErrorKind::from_status(403), ErrorKind::PermissionError);
        assert_eq!(ErrorKind::from_status(429), ErrorKind::RateLimitError);
        assert_eq!(ErrorKind::from_status(500), ErrorKind::ServerError);
        assert_eq!(ErrorKind::from_status(502), ErrorKind::ServerError);
        assert_eq!(ErrorKind::from_status(503), ErrorKind::ServerError);
        assert_eq!(ErrorKind::from_status(504), ErrorKind::TimeoutError);
    }

    #[test]
    fn test_invalid_request_neither_retries_nor_marks() {
        assert!(!ErrorKind::InvalidRequestError.is_retryable());
        assert!(!ErrorKind::InvalidRequestError.marks_unhealthy());
        assert!(ErrorKind::RateLimitError.is_retryable());
        assert!(ErrorKind::RateLimitError.marks_unhealthy());
        assert!(ErrorKind::PermissionError.marks_unhealthy());
        assert!(!ErrorKind::PermissionError.is_retryable());
    }

    #[test]
    fn test_sse_error_frame_shape() {
        let frame = sse_error_frame(ErrorKind::RateLimitError, "slow down");
        assert!(frame.starts_with("event: error\ndata: "));
        assert!(frame.ends_with("\n\n"));
        let data = frame
            .trim_start_matches("event: error\ndata: ")
            .trim_end();
        let parsed: serde_json::Value = serde_json::from_str(data).unwrap();
        assert_eq!(parsed["type"], "error");
        assert_eq!(parsed["error"]["type"], "rate_limit_error");
        assert_eq!(parsed["error"]["message"], "slow down");
    }

    use proptest::prelude::*;

    proptest! {
        /// Any status in 400..=599 maps to a kind whose surfaced status is
        /// also an error status.
        #[test]
        fn prop_every_error_status_maps(status in 400u16..600) {
            let kind = ErrorKind::from_status(status);
            prop_assert!(kind.http_status().as_u16() >= 400);
            prop_assert!(!kind.as_str().is_empty());
        }

        #[test]
        fn prop_error_body_shape(msg in "[a-zA-Z0-9 .,]{0,80}") {
            let body = error_body(ErrorKind::ServerError, &msg);
            prop_assert_eq!(body["type"].as_str().unwrap(), "error");
            prop_assert_eq!(body["error"]["type"].as_str().unwrap(), "server_error");
            prop_assert_eq!(body["error"]["message"].as_str().unwrap(), msg.as_str());
        }
    }
}
