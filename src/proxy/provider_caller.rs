//! Outbound calls to LLM providers
//!
//! A call never fails because of the network: transport errors are turned
//! into synthetic 500 responses so retry, fallback and logging only ever see
//! responses.

use crate::collaborators::{ProviderEndpoint, ProviderRegistry};
use crate::domain::{ProviderTarget, ProxyRequest};
use crate::proxy::headers::{
    content_types, ACCEPT_ENCODING, CONNECTION, CONTENT_LENGTH, CONTENT_TYPE, HELICONE_PREFIX,
    HOST, TRANSFER_ENCODING, X_HELICONE_ERROR_TYPE,
};
use crate::proxy::types::*;
use crate::proxy::url_resolver::UrlResolver;
use crate::retry::RetryPolicy;
use bytes::Bytes;
use futures_util::TryStreamExt;
use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, warn};

/// Why an outbound call produced no provider response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    Timeout,
    ConnectionRefused,
    DnsError,
    NetworkError,
    InternalError,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Timeout => "timeout",
            Self::ConnectionRefused => "connection_refused",
            Self::DnsError => "dns_error",
            Self::NetworkError => "network_error",
            Self::InternalError => "internal_error",
        }
    }

    fn user_message(&self) -> &'static str {
        match self {
            Self::Timeout => "The request to the provider timed out. Please retry your request.",
            Self::ConnectionRefused => {
                "Connection to the provider was refused or reset. The provider may be temporarily unavailable."
            }
            Self::DnsError => "Unable to resolve provider address. Please check the provider URL.",
            Self::NetworkError => "Unable to connect to the provider. Please retry your request.",
            Self::InternalError => "An unexpected error occurred while processing your request",
        }
    }

    /// Classifies a transport error by its kind and its source chain
    pub fn classify(err: &reqwest::Error) -> Self {
        if err.is_timeout() {
            return Self::Timeout;
        }

        let mut chain = err.to_string().to_lowercase();
        let mut source = std::error::Error::source(err);
        while let Some(cause) = source {
            chain.push(' ');
            chain.push_str(&cause.to_string().to_lowercase());
            source = cause.source();
        }

        if chain.contains("timed out") || chain.contains("deadline") {
            Self::Timeout
        } else if chain.contains("dns")
            || chain.contains("failed to lookup address")
            || chain.contains("name resolution")
        {
            Self::DnsError
        } else if chain.contains("connection refused") || chain.contains("connection reset") {
            Self::ConnectionRefused
        } else if err.is_connect() || err.is_request() || err.is_body() {
            Self::NetworkError
        } else {
            Self::InternalError
        }
    }
}

/// Provider answer, real or synthesized by the gateway
pub struct ProviderResponse {
    pub status: u16,
    pub headers: HeaderMap,
    pub body: BodyStream,
    /// Target that produced this response
    pub served_by: Option<ProviderTarget>,
}

impl std::fmt::Debug for ProviderResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderResponse")
            .field("status", &self.status)
            .field("headers", &self.headers)
            .field("served_by", &self.served_by)
            .finish_non_exhaustive()
    }
}

impl ProviderResponse {
    /// Response with a fixed body
    pub fn synthetic(status: StatusCode, headers: HeaderMap, body: impl Into<Bytes>) -> Self {
        let body: Bytes = body.into();
        Self {
            status: status.as_u16(),
            headers,
            body: Box::pin(futures_util::stream::once(async move {
                Ok::<_, BoxError>(body)
            })),
            served_by: None,
        }
    }

    /// JSON body with a matching content type
    pub fn json(status: StatusCode, body: &serde_json::Value) -> Self {
        let mut headers = HeaderMap::new();
        headers.insert(
            CONTENT_TYPE,
            HeaderValue::from_static(content_types::APPLICATION_JSON),
        );
        Self::synthetic(status, headers, body.to_string())
    }

    fn network_failure(kind: FailureKind, provider_url: &str) -> Self {
        let body = json!({
            "error": kind.as_str(),
            "code": kind.as_str(),
            "message": kind.user_message(),
            "helicone-message": kind.user_message(),
            "helicone-error-type": kind.as_str(),
            "provider-url": provider_url,
        });
        let mut response = Self::json(StatusCode::INTERNAL_SERVER_ERROR, &body);
        response.headers.insert(
            X_HELICONE_ERROR_TYPE,
            HeaderValue::from_static(kind.as_str()),
        );
        response
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn is_retryable(&self) -> bool {
        RETRYABLE_STATUSES.contains(&self.status)
    }

    pub async fn text(self) -> Result<String, BoxError> {
        let chunks: Vec<Bytes> = self.body.try_collect().await?;
        Ok(String::from_utf8_lossy(&chunks.concat()).into_owned())
    }
}

fn is_internal_header(name: &HeaderName) -> bool {
    name.as_str().starts_with(HELICONE_PREFIX)
        || name == HOST
        || name == CONTENT_LENGTH
        || name == CONNECTION
        || name == ACCEPT_ENCODING
        || name == TRANSFER_ENCODING
}

/// Inbound headers minus gateway controls and hop-by-hop headers, with the
/// provider's own headers layered on top
pub fn outbound_headers(inbound: &HeaderMap, extra: &HeaderMap) -> HeaderMap {
    let mut headers = HeaderMap::with_capacity(inbound.len() + extra.len());
    for (name, value) in inbound {
        if !is_internal_header(name) {
            headers.append(name.clone(), value.clone());
        }
    }
    for name in extra.keys() {
        headers.remove(name);
    }
    for (name, value) in extra {
        headers.append(name.clone(), value.clone());
    }
    headers
}

/// Executes provider calls on behalf of the orchestrator
#[derive(Clone)]
pub struct ProviderCaller {
    client: reqwest::Client,
    patient_client: reqwest::Client,
    registry: Arc<dyn ProviderRegistry>,
    config: ProxyConfig,
}

/// Client whose timeout bounds each read, so a stream that keeps producing
/// chunks is never cut off
fn build_client(read_timeout: Duration) -> ProxyResult<reqwest::Client> {
    reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(30))
        .read_timeout(read_timeout)
        .build()
        .map_err(|e| ProxyError::Internal(format!("Failed to build HTTP client: {e}")))
}

impl ProviderCaller {
    pub fn new(registry: Arc<dyn ProviderRegistry>, config: ProxyConfig) -> ProxyResult<Self> {
        Ok(Self {
            client: build_client(config.request_timeout)?,
            patient_client: build_client(config.increased_timeout)?,
            registry,
            config,
        })
    }

    async fn endpoint(&self, target: &ProviderTarget) -> ProxyResult<ProviderEndpoint> {
        self.registry
            .resolve(&target.provider)
            .await
            .map_err(|e| ProxyError::UnknownProvider(format!("{}: {e}", target.provider)))
    }

    fn client_for(&self, request: &ProxyRequest) -> &reqwest::Client {
        if request.flags.increase_timeout {
            &self.patient_client
        } else {
            &self.client
        }
    }

    /// One outbound attempt against `target`
    pub async fn call(
        &self,
        request: &ProxyRequest,
        target: &ProviderTarget,
    ) -> ProxyResult<ProviderResponse> {
        let endpoint = self.endpoint(target).await?;
        let uri = UrlResolver::resolve(&endpoint, target)?;
        let url = uri.to_string();

        let mut builder = self
            .client_for(request)
            .request(request.method.clone(), &url)
            .headers(outbound_headers(&request.headers, &endpoint.extra_headers));
        if request.method != Method::GET {
            builder = builder.body(request.body.clone());
        }

        debug!(
            request_id = %request.request_id,
            provider = %target.provider,
            method = %request.method,
            "Calling provider"
        );

        let mut response = match builder.send().await {
            Ok(response) => {
                let status = response.status().as_u16();
                let headers = response.headers().clone();
                let body: BodyStream = Box::pin(
                    response
                        .bytes_stream()
                        .map_err(|e| Box::new(e) as BoxError),
                );
                ProviderResponse {
                    status,
                    headers,
                    body,
                    served_by: None,
                }
            }
            Err(e) => {
                let kind = FailureKind::classify(&e);
                error!(
                    request_id = %request.request_id,
                    provider = %target.provider,
                    error_type = kind.as_str(),
                    error = %e,
                    "Provider call failed"
                );
                ProviderResponse::network_failure(kind, &endpoint.base_url)
            }
        };
        response.served_by = Some(target.clone());
        Ok(response)
    }

    /// Retries retryable statuses; the last response is returned either way
    pub async fn call_with_retry(
        &self,
        request: &ProxyRequest,
        target: &ProviderTarget,
        policy: &RetryPolicy,
    ) -> ProxyResult<ProviderResponse> {
        let mut attempt = 0;
        loop {
            let response = self.call(request, target).await?;
            if !response.is_retryable() || attempt >= policy.retries {
                return Ok(response);
            }

            let delay = policy.backoff.delay_for_attempt(attempt);
            warn!(
                request_id = %request.request_id,
                provider = %target.provider,
                status = response.status,
                attempt = attempt + 1,
                max_retries = policy.retries,
                delay_ms = delay.as_millis() as u64,
                "Retryable provider status"
            );
            drop(response);
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }

    async fn attempt(
        &self,
        request: &ProxyRequest,
        target: &ProviderTarget,
    ) -> ProxyResult<ProviderResponse> {
        match &request.retry {
            Some(policy) => self.call_with_retry(request, target, policy).await,
            None => self.call(request, target).await,
        }
    }

    /// Tries the primary target, then each fallback while responses stay
    /// retryable
    pub async fn call_with_fallback(&self, request: &ProxyRequest) -> ProxyResult<ProviderResponse> {
        let mut response = self.attempt(request, &request.target).await?;
        for fallback in &request.fallbacks {
            if !response.is_retryable() {
                break;
            }
            warn!(
                request_id = %request.request_id,
                status = response.status,
                fallback = %fallback,
                "Falling back to next provider"
            );
            response = self.attempt(request, fallback).await?;
        }
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ProviderName;
    use crate::infrastructure::StaticProviderRegistry;
    use crate::proxy::headers::{AUTHORIZATION, HELICONE_AUTH};
    use crate::retry::Backoff;
    use axum::{extract::State, Router};
    use mockito::Matcher;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn endpoint(name: &str, base_url: &str) -> ProviderEndpoint {
        ProviderEndpoint {
            name: ProviderName::try_new(name).unwrap(),
            base_url: base_url.to_string(),
            extra_headers: HeaderMap::new(),
        }
    }

    fn caller(endpoints: Vec<ProviderEndpoint>) -> ProviderCaller {
        let registry = Arc::new(StaticProviderRegistry::from_endpoints(endpoints));
        ProviderCaller::new(registry, ProxyConfig::default()).unwrap()
    }

    fn target(provider: &str, path: &str) -> ProviderTarget {
        ProviderTarget {
            provider: ProviderName::try_new(provider).unwrap(),
            path_and_query: path.to_string(),
        }
    }

    fn request(method: Method, provider: &str, path: &str, body: &str) -> ProxyRequest {
        let mut headers = HeaderMap::new();
        headers.insert(HELICONE_AUTH, HeaderValue::from_static("Bearer sk-helicone"));
        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer sk-provider"));
        ProxyRequest::new(
            method,
            target(provider, path),
            headers,
            Bytes::from(body.to_string()),
        )
    }

    fn fast_retry(retries: u32) -> RetryPolicy {
        RetryPolicy {
            retries,
            backoff: Backoff {
                min_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(5),
                factor: 2.0,
                jitter: 0.0,
            },
        }
    }

    /// Upstream that answers with `statuses` in order, then 200
    async fn scripted_upstream(statuses: Vec<u16>) -> (String, Arc<AtomicUsize>) {
        let hits = Arc::new(AtomicUsize::new(0));
        let script = Arc::new(statuses);
        let app = Router::new()
            .fallback(
                |State((hits, script)): State<(Arc<AtomicUsize>, Arc<Vec<u16>>)>| async move {
                    let n = hits.fetch_add(1, Ordering::SeqCst);
                    let status = script.get(n).copied().unwrap_or(200);
                    (
                        StatusCode::from_u16(status).unwrap(),
                        format!("{{\"attempt\":{}}}", n + 1),
                    )
                },
            )
            .with_state((hits.clone(), script));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{addr}"), hits)
    }

    #[test]
    fn outbound_headers_strip_gateway_controls() {
        let mut inbound = HeaderMap::new();
        inbound.insert(HELICONE_AUTH, HeaderValue::from_static("Bearer sk-helicone"));
        inbound.insert("helicone-cache-enabled", HeaderValue::from_static("true"));
        inbound.insert(HOST, HeaderValue::from_static("gateway.local"));
        inbound.insert(CONTENT_LENGTH, HeaderValue::from_static("12"));
        inbound.insert(AUTHORIZATION, HeaderValue::from_static("Bearer client"));
        inbound.insert("openai-organization", HeaderValue::from_static("org-1"));

        let mut extra = HeaderMap::new();
        extra.insert(AUTHORIZATION, HeaderValue::from_static("Bearer platform"));

        let headers = outbound_headers(&inbound, &extra);
        assert_eq!(headers.len(), 2);
        assert_eq!(headers[AUTHORIZATION], "Bearer platform");
        assert_eq!(headers["openai-organization"], "org-1");
    }

    #[tokio::test]
    async fn get_requests_carry_no_body_and_no_gateway_headers() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/v1/models")
            .match_query(Matcher::UrlEncoded("limit".into(), "2".into()))
            .match_header(HELICONE_AUTH, Matcher::Missing)
            .match_header("authorization", "Bearer sk-provider")
            .match_body(Matcher::Exact(String::new()))
            .with_status(200)
            .with_body(r#"{"data":[]}"#)
            .create_async()
            .await;

        let caller = caller(vec![endpoint("openai", &server.url())]);
        let req = request(Method::GET, "openai", "/v1/models?limit=2", "ignored");
        let response = caller.call(&req, &req.target).await.unwrap();

        assert_eq!(response.status, 200);
        assert_eq!(response.served_by, Some(req.target.clone()));
        assert_eq!(response.text().await.unwrap(), r#"{"data":[]}"#);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn post_forwards_body_and_extra_headers() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/v1/chat/completions")
            .match_header("x-provider-key", "secret")
            .match_body(Matcher::JsonString(r#"{"model":"gpt-4o"}"#.into()))
            .with_status(200)
            .with_body("{}")
            .create_async()
            .await;

        let mut openai = endpoint("openai", &server.url());
        openai
            .extra_headers
            .insert("x-provider-key", HeaderValue::from_static("secret"));
        let caller = caller(vec![openai]);
        let req = request(
            Method::POST,
            "openai",
            "/v1/chat/completions",
            r#"{"model":"gpt-4o"}"#,
        );

        let response = caller.call(&req, &req.target).await.unwrap();
        assert_eq!(response.status, 200);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn network_failures_become_synthetic_500() {
        let caller = caller(vec![endpoint("openai", "http://127.0.0.1:1")]);
        let req = request(Method::POST, "openai", "/v1/chat/completions", "{}");

        let response = caller.call(&req, &req.target).await.unwrap();
        assert_eq!(response.status, 500);
        assert!(response.is_retryable());

        let error_type = response.headers[X_HELICONE_ERROR_TYPE]
            .to_str()
            .unwrap()
            .to_string();
        let body: serde_json::Value =
            serde_json::from_str(&response.text().await.unwrap()).unwrap();
        assert_eq!(body["helicone-error-type"], error_type.as_str());
        assert_eq!(body["provider-url"], "http://127.0.0.1:1");
    }

    #[tokio::test]
    async fn unknown_provider_is_an_error() {
        let caller = caller(vec![]);
        let req = request(Method::POST, "nobody", "/v1/chat/completions", "{}");
        let err = caller.call(&req, &req.target).await.unwrap_err();
        assert!(matches!(err, ProxyError::UnknownProvider(_)));
    }

    #[tokio::test]
    async fn retry_returns_first_non_retryable_response() {
        let (url, hits) = scripted_upstream(vec![429, 429]).await;
        let caller = caller(vec![endpoint("openai", &url)]);
        let req = request(Method::POST, "openai", "/v1/chat/completions", "{}");

        let response = caller
            .call_with_retry(&req, &req.target, &fast_retry(3))
            .await
            .unwrap();

        assert_eq!(response.status, 200);
        assert_eq!(hits.load(Ordering::SeqCst), 3);
        assert_eq!(response.text().await.unwrap(), r#"{"attempt":3}"#);
    }

    #[tokio::test]
    async fn exhausted_retries_return_last_response() {
        let (url, hits) = scripted_upstream(vec![522, 500, 429, 429]).await;
        let caller = caller(vec![endpoint("openai", &url)]);
        let req = request(Method::POST, "openai", "/v1/chat/completions", "{}");

        let response = caller
            .call_with_retry(&req, &req.target, &fast_retry(2))
            .await
            .unwrap();

        assert_eq!(response.status, 429);
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn client_errors_are_not_retried() {
        let (url, hits) = scripted_upstream(vec![400]).await;
        let caller = caller(vec![endpoint("openai", &url)]);
        let req = request(Method::POST, "openai", "/v1/chat/completions", "{}");

        let response = caller
            .call_with_retry(&req, &req.target, &fast_retry(3))
            .await
            .unwrap();

        assert_eq!(response.status, 400);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn fallback_moves_on_after_retryable_status() {
        let (primary_url, primary_hits) = scripted_upstream(vec![500]).await;
        let (backup_url, backup_hits) = scripted_upstream(vec![]).await;
        let caller = caller(vec![
            endpoint("openai", &primary_url),
            endpoint("anthropic", &backup_url),
        ]);

        let mut req = request(Method::POST, "openai", "/v1/chat/completions", "{}");
        req.fallbacks = vec![target("anthropic", "/v1/messages")];

        let response = caller.call_with_fallback(&req).await.unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(response.served_by, Some(target("anthropic", "/v1/messages")));
        assert_eq!(primary_hits.load(Ordering::SeqCst), 1);
        assert_eq!(backup_hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn fallback_not_used_when_primary_succeeds() {
        let (primary_url, _) = scripted_upstream(vec![]).await;
        let (backup_url, backup_hits) = scripted_upstream(vec![]).await;
        let caller = caller(vec![
            endpoint("openai", &primary_url),
            endpoint("anthropic", &backup_url),
        ]);

        let mut req = request(Method::POST, "openai", "/v1/chat/completions", "{}");
        req.fallbacks = vec![target("anthropic", "/v1/messages")];

        let response = caller.call_with_fallback(&req).await.unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(backup_hits.load(Ordering::SeqCst), 0);
    }

    /// Upstream that waits `before_headers`, then sends `chunks` chunks
    /// `gap` apart
    async fn slow_upstream(before_headers: Duration, chunks: usize, gap: Duration) -> String {
        let app = Router::new().fallback(move || async move {
            tokio::time::sleep(before_headers).await;
            let body = futures_util::stream::unfold(0, move |sent| async move {
                if sent == chunks {
                    return None;
                }
                tokio::time::sleep(gap).await;
                Some((
                    Ok::<_, std::convert::Infallible>(Bytes::from(format!("chunk-{sent};"))),
                    sent + 1,
                ))
            });
            axum::body::Body::from_stream(body)
        });

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    fn caller_with_timeouts(base_url: &str, request_timeout: Duration) -> ProviderCaller {
        let registry = Arc::new(StaticProviderRegistry::from_endpoints(vec![endpoint(
            "openai", base_url,
        )]));
        let config = ProxyConfig {
            request_timeout,
            increased_timeout: request_timeout * 10,
            ..ProxyConfig::default()
        };
        ProviderCaller::new(registry, config).unwrap()
    }

    #[tokio::test]
    async fn long_stream_outlives_the_request_timeout() {
        let url = slow_upstream(Duration::ZERO, 6, Duration::from_millis(60)).await;
        let caller = caller_with_timeouts(&url, Duration::from_millis(200));
        let req = request(Method::POST, "openai", "/v1/completions", "{}");

        let response = caller.call(&req, &req.target).await.unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(
            response.text().await.unwrap(),
            "chunk-0;chunk-1;chunk-2;chunk-3;chunk-4;chunk-5;"
        );
    }

    #[tokio::test]
    async fn silent_provider_times_out() {
        let url = slow_upstream(Duration::from_millis(500), 1, Duration::ZERO).await;
        let caller = caller_with_timeouts(&url, Duration::from_millis(50));
        let req = request(Method::POST, "openai", "/v1/chat/completions", "{}");

        let response = caller.call(&req, &req.target).await.unwrap();
        assert_eq!(response.status, 500);
        assert_eq!(response.headers[X_HELICONE_ERROR_TYPE], "timeout");
    }

    #[tokio::test]
    async fn increase_timeout_flag_waits_longer() {
        let url = slow_upstream(Duration::from_millis(150), 1, Duration::ZERO).await;
        let caller = caller_with_timeouts(&url, Duration::from_millis(50));
        let mut req = request(Method::POST, "openai", "/v1/chat/completions", "{}");
        req.flags.increase_timeout = true;

        let response = caller.call(&req, &req.target).await.unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(response.text().await.unwrap(), "chunk-0;");
    }
}
