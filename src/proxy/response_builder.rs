//! Client response assembly
//!
//! Headers arrive from several places (provider response, cache hit markers,
//! rate-limit state, gateway annotations). The builder collects the gateway
//! side and lays it over the upstream headers when the response is built.

use crate::proxy::headers::{CONNECTION, CONTENT_LENGTH, TRANSFER_ENCODING, X_HELICONE_ERROR};
use crate::proxy::provider_caller::ProviderResponse;
use crate::rate_limit::{rate_limit_headers, Decision, RateLimitPolicy};
use axum::body::Body;
use axum::response::Response;
use http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use serde_json::json;
use tracing::error;

/// Message of the synthetic 429
pub const RATE_LIMITED_MESSAGE: &str = "Rate limit reached. Please wait before making more requests.";

/// Maps out-of-range upstream statuses to 500
pub fn clamp_status(status: u16) -> StatusCode {
    if !(200..600).contains(&status) {
        error!(status, "Invalid upstream status code");
        return StatusCode::INTERNAL_SERVER_ERROR;
    }
    StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
}

fn strip_hop_by_hop(headers: &mut HeaderMap) {
    for name in [CONTENT_LENGTH, TRANSFER_ENCODING, CONNECTION] {
        headers.remove(name);
    }
}

#[derive(Debug, Default, Clone)]
pub struct ResponseBuilder {
    headers: HeaderMap,
}

impl ResponseBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets a gateway header; invalid names or values are dropped
    pub fn set_header(&mut self, name: &str, value: &str) -> &mut Self {
        match (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            (Ok(name), Ok(value)) => {
                self.headers.insert(name, value);
            }
            _ => error!(header = name, "Dropping invalid response header"),
        }
        self
    }

    /// Merges `headers`; values already set for a name are replaced
    pub fn merge(&mut self, headers: &HeaderMap) -> &mut Self {
        for name in headers.keys() {
            self.headers.remove(name);
        }
        for (name, value) in headers {
            self.headers.append(name.clone(), value.clone());
        }
        self
    }

    pub fn add_rate_limit_headers(
        &mut self,
        policy: &RateLimitPolicy,
        decision: &Decision,
    ) -> &mut Self {
        self.merge(&rate_limit_headers(policy, decision))
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Final client response: upstream headers with the gateway's on top
    pub fn build(&self, status: u16, upstream: &HeaderMap, body: Body) -> Response {
        let mut headers = upstream.clone();
        strip_hop_by_hop(&mut headers);
        for name in self.headers.keys() {
            headers.remove(name);
        }
        for (name, value) in &self.headers {
            headers.append(name.clone(), value.clone());
        }

        let mut response = Response::new(body);
        *response.status_mut() = clamp_status(status);
        *response.headers_mut() = headers;
        response
    }

    /// Synthetic response standing in for a provider call that was not made
    pub fn build_rate_limited_response(&self) -> ProviderResponse {
        let mut response = ProviderResponse::json(
            StatusCode::TOO_MANY_REQUESTS,
            &json!({ "message": RATE_LIMITED_MESSAGE }),
        );
        response
            .headers
            .insert(X_HELICONE_ERROR, HeaderValue::from_static("rate_limited"));
        response
    }

    /// Response for a request screening blocked
    pub fn build_threat_response(&self) -> ProviderResponse {
        ProviderResponse::json(
            StatusCode::BAD_REQUEST,
            &json!({
                "success": false,
                "error": {
                    "code": "PROMPT_THREAT_DETECTED",
                    "message": "Prompt threat detected. Your request cannot be processed.",
                    "details": "See your Helicone request page for more info."
                }
            }),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::headers::{
        CONTENT_TYPE, HELICONE_CACHE, HELICONE_RATE_LIMIT_LIMIT, HELICONE_STATUS,
    };
    use crate::rate_limit::{DecisionStatus, RateLimitUnit, Segment};
    use rstest::rstest;

    #[rstest]
    #[case(200, 200)]
    #[case(204, 204)]
    #[case(429, 429)]
    #[case(599, 599)]
    #[case(100, 500)]
    #[case(199, 500)]
    #[case(600, 500)]
    #[case(0, 500)]
    fn status_is_clamped(#[case] upstream: u16, #[case] expected: u16) {
        assert_eq!(clamp_status(upstream).as_u16(), expected);
    }

    #[test]
    fn gateway_headers_override_upstream() {
        let mut upstream = HeaderMap::new();
        upstream.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        upstream.insert(CONTENT_LENGTH, HeaderValue::from_static("42"));
        upstream.insert(HELICONE_CACHE, HeaderValue::from_static("stale"));

        let mut builder = ResponseBuilder::new();
        builder
            .set_header(HELICONE_STATUS, "success")
            .set_header(HELICONE_CACHE, "MISS")
            .set_header("bad header", "x");

        let response = builder.build(200, &upstream, Body::empty());
        let headers = response.headers();
        assert_eq!(headers[HELICONE_CACHE], "MISS");
        assert_eq!(headers[HELICONE_STATUS], "success");
        assert_eq!(headers[CONTENT_TYPE], "application/json");
        assert!(headers.get(CONTENT_LENGTH).is_none());
        assert_eq!(headers.get_all(HELICONE_CACHE).iter().count(), 1);
    }

    #[test]
    fn rate_limit_headers_are_added() {
        let policy = RateLimitPolicy::new(10.0, 60, RateLimitUnit::Request, Segment::Global);
        let decision = Decision {
            status: DecisionStatus::Ok,
            limit: 10.0,
            remaining: 4.0,
            reset_secs: Some(12),
            current_usage: 6.0,
        };

        let mut builder = ResponseBuilder::new();
        builder.add_rate_limit_headers(&policy, &decision);
        assert_eq!(builder.headers()[HELICONE_RATE_LIMIT_LIMIT], "10");
    }

    #[tokio::test]
    async fn rate_limited_response_shape() {
        let response = ResponseBuilder::new().build_rate_limited_response();
        assert_eq!(response.status, 429);
        assert_eq!(response.headers[X_HELICONE_ERROR], "rate_limited");

        let body: serde_json::Value =
            serde_json::from_str(&response.text().await.unwrap()).unwrap();
        assert_eq!(body["message"], RATE_LIMITED_MESSAGE);
    }

    #[tokio::test]
    async fn threat_response_shape() {
        let response = ResponseBuilder::new().build_threat_response();
        assert_eq!(response.status, 400);
        let body: serde_json::Value =
            serde_json::from_str(&response.text().await.unwrap()).unwrap();
        assert_eq!(body["success"], false);
        assert_eq!(body["error"]["code"], "PROMPT_THREAT_DETECTED");
    }
}
