//! Middleware for the gateway router

use crate::proxy::headers::X_REQUEST_ID;
use axum::{
    extract::Request,
    http::{HeaderValue, StatusCode},
    middleware::Next,
    response::Response,
};
use std::time::Instant;
use tracing::{info, warn};
use uuid::Uuid;

fn fresh_request_id() -> HeaderValue {
    HeaderValue::try_from(Uuid::now_v7().to_string())
        .unwrap_or_else(|_| HeaderValue::from_static("unknown"))
}

/// Ensures every request carries a UUID `x-request-id`, echoed on the
/// response. The pipeline adopts it as the request id.
pub async fn request_id_middleware(mut request: Request, next: Next) -> Response {
    let request_id = request
        .headers()
        .get(X_REQUEST_ID)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| Uuid::parse_str(value).ok())
        .and_then(|uuid| HeaderValue::try_from(uuid.to_string()).ok())
        .unwrap_or_else(fresh_request_id);

    request
        .headers_mut()
        .insert(X_REQUEST_ID, request_id.clone());

    let mut response = next.run(request).await;
    response.headers_mut().insert(X_REQUEST_ID, request_id);
    response
}

/// Logs request and response with timing
pub async fn logging_middleware(request: Request, next: Next) -> Response {
    let start = Instant::now();
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let request_id = request
        .headers()
        .get(X_REQUEST_ID)
        .and_then(|value| value.to_str().ok())
        .unwrap_or("unknown")
        .to_string();

    info!(request_id, method = %method, path, "Incoming request");

    let response = next.run(request).await;
    let status = response.status();
    let duration_ms = start.elapsed().as_millis() as u64;

    if status.is_server_error() || status == StatusCode::PAYLOAD_TOO_LARGE {
        warn!(
            request_id,
            method = %method,
            path,
            status = status.as_u16(),
            duration_ms,
            "Request failed"
        );
    } else {
        info!(
            request_id,
            method = %method,
            path,
            status = status.as_u16(),
            duration_ms,
            "Request completed"
        );
    }
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::middleware::from_fn;
    use axum::Router;
    use tower::ServiceExt;

    async fn echo(request: Request) -> Response {
        let seen = request
            .headers()
            .get(X_REQUEST_ID)
            .cloned()
            .unwrap_or_else(|| HeaderValue::from_static("missing"));
        Response::builder()
            .header("x-seen-request-id", seen)
            .body(Body::empty())
            .unwrap()
    }

    fn echo_service() -> Router {
        Router::new()
            .fallback(echo)
            .layer(from_fn(logging_middleware))
            .layer(from_fn(request_id_middleware))
    }

    #[tokio::test]
    async fn generates_v7_request_id() {
        let request = Request::builder()
            .uri("/openai/v1/models")
            .body(Body::empty())
            .unwrap();
        let response = echo_service().oneshot(request).await.unwrap();

        let id = response.headers()[X_REQUEST_ID].to_str().unwrap();
        assert_eq!(Uuid::parse_str(id).unwrap().get_version_num(), 7);
        assert_eq!(response.headers()["x-seen-request-id"], id);
    }

    #[tokio::test]
    async fn keeps_valid_client_request_id() {
        let id = "0191f1b2-6a0e-7c3d-8a4b-2f1e0d9c8b7a";
        let request = Request::builder()
            .uri("/openai/v1/models")
            .header(X_REQUEST_ID, id)
            .body(Body::empty())
            .unwrap();
        let response = echo_service().oneshot(request).await.unwrap();
        assert_eq!(response.headers()[X_REQUEST_ID], id);
    }

    #[tokio::test]
    async fn replaces_malformed_request_id() {
        let request = Request::builder()
            .uri("/openai/v1/models")
            .header(X_REQUEST_ID, "not-a-uuid")
            .body(Body::empty())
            .unwrap();
        let response = echo_service().oneshot(request).await.unwrap();
        let id = response.headers()[X_REQUEST_ID].to_str().unwrap();
        assert!(Uuid::parse_str(id).is_ok());
    }
}
