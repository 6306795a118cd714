//! Shared-key auth gate. The gateway has exactly one caller credential,
//! accepted from any of the header/query carriers popular Claude clients
//! use.

use axum::{
    extract::{Request, State},
    http::StatusCode,
    middleware::Next,
    response::Response,
};

use crate::proxy::common::errors::{error_response, ErrorKind};
use crate::proxy::server::AppState;

fn presented_key(request: &Request) -> Option<String> {
    let headers = request.headers();

    if let Some(value) = headers.get(axum::http::header::AUTHORIZATION) {
        if let Ok(s) = value.to_str() {
            if let Some(token) = s.strip_prefix("Bearer ") {
                return Some(token.trim().to_string());
            }
        }
    }
    for header in ["x-api-key", "x-goog-api-key"] {
        if let Some(value) = headers.get(header) {
            if let Ok(s) = value.to_str() {
                if !s.trim().is_empty() {
                    return Some(s.trim().to_string());
                }
            }
        }
    }

    request.uri().query().and_then(|query| {
        query.split('&').find_map(|pair| {
            pair.strip_prefix("key=")
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        })
    })
}

pub async fn auth_middleware(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let required = &state.config.required_api_key;
    if required.is_empty() {
        return next.run(request).await;
    }

    match presented_key(&request) {
        Some(key) if key == *required => next.run(request).await,
        _ => error_response(
            StatusCode::UNAUTHORIZED,
            ErrorKind::AuthenticationError,
            "Invalid or missing API key",
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;

    fn request_with(header: Option<(&str, &str)>, uri: &str) -> Request {
        let mut builder = axum::http::Request::builder().uri(uri);
        if let Some((name, value)) = header {
            builder = builder.header(name, value);
        }
        builder.body(Body::empty()).unwrap()
    }

    #[test]
    fn test_bearer_header() {
        let req = request_with(Some(("authorization", "Bearer sk-test")), "/v1/messages");
        assert_eq!(presented_key(&req).as_deref(), Some("sk-test"));
    }

    #[test]
    fn test_x_api_key_header() {
        let req = request_with(Some(("x-api-key", "sk-test")), "/v1/messages");
        assert_eq!(presented_key(&req).as_deref(), Some("sk-test"));
    }

    #[test]
    fn test_goog_header() {
        let req = request_with(Some(("x-goog-api-key", "sk-g")), "/v1/messages");
        assert_eq!(presented_key(&req).as_deref(), Some("sk-g"));
    }

    #[test]
    fn test_query_key() {
        let req = request_with(None, "/v1/messages?key=sk-q&x=1");
        assert_eq!(presented_key(&req).as_deref(), Some("sk-q"));
    }

    #[test]
    fn test_no_key() {
        let req = request_with(None, "/v1/messages");
        assert_eq!(presented_key(&req), None);
    }
}
