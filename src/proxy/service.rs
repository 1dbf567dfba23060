//! HTTP surface of the gateway
//!
//! Every path other than `/health` is a proxied call of the form
//! `/<provider>/<provider path>?<query>`, handed to the
//! [`RequestOrchestrator`] after mapping.
//!
//! ```rust,ignore
//! let service = ProxyService::new(orchestrator, ProxyConfig::default());
//! let listener = tokio::net::TcpListener::bind("0.0.0.0:8787").await?;
//! axum::serve(listener, service.into_router()).await?;
//! ```

use crate::proxy::headers::{paths, CONTENT_LENGTH};
use crate::proxy::mapper::RequestMapper;
use crate::proxy::middleware::{logging_middleware, request_id_middleware};
use crate::proxy::orchestrator::RequestOrchestrator;
use crate::proxy::types::{ProxyConfig, ProxyError};
use axum::{
    body::{to_bytes, Body},
    extract::{Request, State},
    middleware::from_fn,
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use http_body_util::LengthLimitError;
use std::error::Error as StdError;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

pub struct ProxyService {
    orchestrator: RequestOrchestrator,
    config: ProxyConfig,
}

impl ProxyService {
    pub fn new(orchestrator: RequestOrchestrator, config: ProxyConfig) -> Self {
        Self {
            orchestrator,
            config,
        }
    }

    pub fn orchestrator(&self) -> &RequestOrchestrator {
        &self.orchestrator
    }

    /// Router with the health check, the proxy fallback and the middleware
    /// stack (request id outermost, then tracing and request logging)
    pub fn into_router(self) -> Router {
        Router::new()
            .route(paths::HEALTH, get(health_handler))
            .fallback(proxy_handler)
            .with_state(Arc::new(self))
            .layer(from_fn(logging_middleware))
            .layer(TraceLayer::new_for_http())
            .layer(from_fn(request_id_middleware))
    }
}

fn declared_length(request: &Request) -> Option<usize> {
    request
        .headers()
        .get(CONTENT_LENGTH)?
        .to_str()
        .ok()?
        .parse()
        .ok()
}

async fn proxy_handler(
    State(service): State<Arc<ProxyService>>,
    request: Request<Body>,
) -> Result<Response, ProxyError> {
    let max_size = service.config.max_request_size;
    if let Some(size) = declared_length(&request).filter(|size| *size > max_size) {
        return Err(ProxyError::RequestTooLarge { size, max_size });
    }

    let (parts, body) = request.into_parts();
    let body = to_bytes(body, max_size).await.map_err(|e| {
        if exceeds_length_limit(&e) {
            ProxyError::RequestTooLarge {
                size: max_size + 1,
                max_size,
            }
        } else {
            ProxyError::InvalidBody(e.to_string())
        }
    })?;

    let proxy_request = RequestMapper::map(parts.method, &parts.uri, parts.headers, body)?;
    Ok(service.orchestrator.handle(proxy_request).await)
}

/// Whether a body read failed on the size limit rather than on the
/// connection or framing
fn exceeds_length_limit(error: &axum::Error) -> bool {
    let mut source: Option<&(dyn StdError + 'static)> = Some(error);
    while let Some(cause) = source {
        if cause.is::<LengthLimitError>() {
            return true;
        }
        source = cause.source();
    }
    false
}

async fn health_handler() -> impl IntoResponse {
    "OK"
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use futures_util::stream;
    use std::io;

    #[tokio::test]
    async fn oversized_body_is_a_length_limit_failure() {
        let error = to_bytes(Body::from("x".repeat(64)), 16).await.unwrap_err();
        assert!(exceeds_length_limit(&error));
    }

    #[tokio::test]
    async fn broken_body_is_not_a_length_limit_failure() {
        let chunks: Vec<Result<Bytes, io::Error>> = vec![
            Ok(Bytes::from_static(b"{\"model\":")),
            Err(io::Error::new(io::ErrorKind::ConnectionReset, "client went away")),
        ];
        let error = to_bytes(Body::from_stream(stream::iter(chunks)), 1024)
            .await
            .unwrap_err();
        assert!(!exceeds_length_limit(&error));
    }
}
