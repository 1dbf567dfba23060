//! Deferred log work for a finished call
//!
//! A `Loggable` is created when the response is handed to the client. The
//! finalizer later resolves it into a `LogRecord` once the body stream has
//! reached a terminal state.

use crate::collaborators::OrgContext;
use crate::domain::{ProviderTarget, ProxyRequest, TokenLimitHandler};
use crate::proxy::interceptor::{CompletedStream, CompletionReason, StreamInterceptor};
use chrono::{DateTime, Utc};
use http::HeaderMap;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

/// Status recorded when the client went away mid-stream
pub const STATUS_CANCELLED: i32 = -3;
/// Status recorded when the stream never finished
pub const STATUS_TIMEOUT: i32 = -2;
/// Status recorded when screening blocked the request
pub const STATUS_THREAT: i32 = -4;

/// Status written to the log for a completed body
pub fn loggable_status(reason: CompletionReason, http_status: u16, threat: bool) -> i32 {
    if threat {
        return STATUS_THREAT;
    }
    match reason {
        CompletionReason::Done => i32::from(http_status),
        CompletionReason::Cancel => STATUS_CANCELLED,
        CompletionReason::Timeout => STATUS_TIMEOUT,
    }
}

/// How the response was produced
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseOrigin {
    Provider,
    Cache,
    RateLimited,
    Blocked,
    /// The gateway answered with its own error
    GatewayError,
}

/// Everything the finalizer needs after the response left
#[derive(Debug, Clone)]
pub struct Loggable {
    pub request: Arc<ProxyRequest>,
    pub organization: Option<OrgContext>,
    pub origin: ResponseOrigin,
    pub status: u16,
    pub headers: HeaderMap,
    pub served_by: Option<ProviderTarget>,
    pub response_start: DateTime<Utc>,
    interceptor: StreamInterceptor,
}

impl Loggable {
    pub fn new(
        request: Arc<ProxyRequest>,
        organization: Option<OrgContext>,
        origin: ResponseOrigin,
        status: u16,
        headers: HeaderMap,
        interceptor: StreamInterceptor,
    ) -> Self {
        Self {
            request,
            organization,
            origin,
            status,
            headers,
            served_by: None,
            response_start: Utc::now(),
            interceptor,
        }
    }

    #[must_use]
    pub fn served_by(mut self, target: Option<ProviderTarget>) -> Self {
        self.served_by = target;
        self
    }

    pub fn interceptor(&self) -> &StreamInterceptor {
        &self.interceptor
    }

    /// Waits for the body and builds the record
    pub async fn read_and_log_response(&self, timeout: Duration) -> LogRecord {
        let completed = self.interceptor.wait_for_stream_within(timeout).await;
        self.to_record(&completed)
    }

    pub fn to_record(&self, completed: &CompletedStream) -> LogRecord {
        let request = &self.request;
        let threat = request.threat().unwrap_or(false);
        let target = self.served_by.as_ref().unwrap_or(&request.target);

        let response_headers = self
            .headers
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();

        LogRecord {
            request_id: request.request_id.to_string(),
            organization_id: self
                .organization
                .as_ref()
                .map(|org| org.organization_id.to_string()),
            provider: target.provider.to_string(),
            target: target.to_string(),
            method: request.method.to_string(),
            model: request.model().map(str::to_string),
            user_id: request.user_id.clone(),
            properties: request.properties.clone(),
            request_body: request.body_text(),
            request_created_at: request.start_time,
            is_stream: request.is_stream,
            token_limit_handler: request.token_limit_handler,
            escrow_id: request.escrow.as_ref().map(|hold| hold.escrow_id.clone()),
            origin: self.origin,
            threat: request.threat(),
            status: loggable_status(completed.reason, self.status, threat),
            completion: completed.reason.as_str(),
            response_headers,
            response_body: completed.body_text(),
            response_created_at: self.response_start,
            response_finished_at: completed.end_time,
            time_to_first_chunk_ms: completed
                .first_chunk_time
                .map(|first| (first - request.start_time).num_milliseconds()),
            total_latency_ms: (completed.end_time - request.start_time).num_milliseconds(),
        }
    }
}

/// Finalized record handed to the log sink
#[derive(Debug, Clone, Serialize)]
pub struct LogRecord {
    pub request_id: String,
    pub organization_id: Option<String>,
    pub provider: String,
    pub target: String,
    pub method: String,
    pub model: Option<String>,
    pub user_id: Option<String>,
    pub properties: BTreeMap<String, String>,
    pub request_body: String,
    pub request_created_at: DateTime<Utc>,
    pub is_stream: bool,
    pub token_limit_handler: Option<TokenLimitHandler>,
    pub escrow_id: Option<String>,
    pub origin: ResponseOrigin,
    pub threat: Option<bool>,
    pub status: i32,
    pub completion: &'static str,
    pub response_headers: BTreeMap<String, String>,
    pub response_body: String,
    pub response_created_at: DateTime<Utc>,
    pub response_finished_at: DateTime<Utc>,
    pub time_to_first_chunk_ms: Option<i64>,
    pub total_latency_ms: i64,
}
