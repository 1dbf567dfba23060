//! The inbound request pipeline
//!
//! Stages run in a fixed order: authenticate, cache read, rate limit,
//! screening, provider call. A cache hit ends the pipeline early. A
//! rate-limit rejection is only substituted where the provider call would
//! have been made, so screening still sees the request. Post-response work
//! is handed to the [`Finalizer`] and never delays the client.

use crate::cache::{CacheEngine, CacheHit, CacheIdentity};
use crate::collaborators::{
    CollaboratorError, ContentScreener, OrgContext, OrgDirectory, PolicyStore, ScreeningKind,
};
use crate::domain::ProxyRequest;
use crate::infrastructure::BackgroundTasks;
use crate::proxy::error_response::ErrorResponseExt;
use crate::proxy::finalizer::{Finalizer, PendingUsage};
use crate::proxy::headers::{HELICONE_CACHE, HELICONE_ID, HELICONE_STATUS};
use crate::proxy::interceptor::{ForceFormat, StreamInterceptor};
use crate::proxy::loggable::{Loggable, ResponseOrigin};
use crate::proxy::provider_caller::{ProviderCaller, ProviderResponse};
use crate::proxy::response_builder::ResponseBuilder;
use crate::proxy::types::{BodyStream, ProxyError, ProxyResult};
use crate::rate_limit::{
    check_or_admit, segment_key, select_policy, Decision, RateLimitPolicy, RateLimitRequest,
    RateLimiter,
};
use axum::body::Body;
use axum::response::{IntoResponse, Response};
use futures_util::stream;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// Collaborators and stores the pipeline runs against
pub struct PipelineDeps {
    pub org_directory: Arc<dyn OrgDirectory>,
    pub policy_store: Arc<dyn PolicyStore>,
    pub screener: Arc<dyn ContentScreener>,
    pub limiter: Arc<dyn RateLimiter>,
    pub cache: Arc<CacheEngine>,
    pub caller: ProviderCaller,
    pub finalizer: Arc<Finalizer>,
    pub tasks: BackgroundTasks,
}

/// Outcome of the rate-limit stage
struct Admission {
    policy: RateLimitPolicy,
    decision: Decision,
    pending_usage: Option<PendingUsage>,
}

pub struct RequestOrchestrator {
    deps: PipelineDeps,
}

impl RequestOrchestrator {
    pub fn new(deps: PipelineDeps) -> Self {
        Self { deps }
    }

    pub fn tasks(&self) -> &BackgroundTasks {
        &self.deps.tasks
    }

    /// Runs one request through the pipeline
    #[instrument(
        skip_all,
        fields(
            request_id = %request.request_id,
            provider = %request.target.provider,
            path = request.target.path(),
        )
    )]
    pub async fn handle(&self, request: ProxyRequest) -> Response {
        let organization = match self.deps.org_directory.authenticate(&request.headers).await {
            Ok(org) => Some(org),
            Err(CollaboratorError::Unauthorized) => {
                warn!("Rejected request with invalid gateway credentials");
                return ProxyError::Unauthorized
                    .to_error_response()
                    .with_request_id(request.request_id.to_string())
                    .into_response_with_status(ProxyError::Unauthorized.status_code());
            }
            Err(e) => {
                warn!(error = %e, "Organization lookup failed, proxying without an organization");
                None
            }
        };

        let mut builder = ResponseBuilder::new();
        builder.set_header(HELICONE_ID, &request.request_id.to_string());

        if let Some(org) = &organization {
            if request.cache.read && org.cache_enabled {
                if let Some(hit) = self.read_cache(org, &request).await {
                    return self.respond_from_cache(request, organization, builder, hit);
                }
                builder.set_header(HELICONE_CACHE, "MISS");
            }
        }

        let admission = match self.admit(organization.as_ref(), &request).await {
            Ok(admission) => admission,
            Err(e) => {
                warn!(error = %e, "Rate limit admission failed");
                return self.respond_with_error(request, organization, builder, e);
            }
        };
        if let Some(admission) = &admission {
            builder.add_rate_limit_headers(&admission.policy, &admission.decision);
        }
        let rate_limited = admission
            .as_ref()
            .is_some_and(|admission| admission.decision.is_rate_limited());

        let verdict = self.screen(&request).await;
        if let Some(threat) = verdict {
            request.record_threat(threat);
        }
        let blocked = verdict == Some(true);

        let (response, origin) = if blocked {
            info!("Request blocked by content screening");
            (builder.build_threat_response(), ResponseOrigin::Blocked)
        } else if rate_limited {
            debug!("Rate limit reached, substituting 429");
            (builder.build_rate_limited_response(), ResponseOrigin::RateLimited)
        } else {
            match self.deps.caller.call_with_fallback(&request).await {
                Ok(response) => (response, ResponseOrigin::Provider),
                Err(e) => {
                    warn!(error = %e, "Provider call could not be made");
                    return self.respond_with_error(request, organization, builder, e);
                }
            }
        };

        let pending_usage = admission.and_then(|admission| admission.pending_usage);
        self.respond(request, organization, builder, response, origin, pending_usage)
    }

    async fn read_cache(&self, org: &OrgContext, request: &ProxyRequest) -> Option<CacheHit> {
        let url = request.target.to_string();
        let identity = CacheIdentity::for_request(request, &url);
        self.deps
            .cache
            .read(&org.organization_id, &identity, request.cache.bucket_size)
            .await
    }

    /// Header policy first, then the organization's configured policies
    async fn resolve_policy(
        &self,
        org: &OrgContext,
        request: &ProxyRequest,
    ) -> Option<RateLimitPolicy> {
        if let Some(policy) = &request.rate_limit_policy {
            return Some(policy.clone());
        }
        let policies = match self.deps.policy_store.policies(&org.organization_id).await {
            Ok(policies) => policies,
            Err(e) => {
                warn!(error = %e, "Policy lookup failed, skipping rate limit");
                return None;
            }
        };
        select_policy(&policies, request.user_id.as_deref(), &request.properties).cloned()
    }

    async fn admit(
        &self,
        organization: Option<&OrgContext>,
        request: &ProxyRequest,
    ) -> ProxyResult<Option<Admission>> {
        let Some(org) = organization else {
            return Ok(None);
        };
        let Some(policy) = self.resolve_policy(org, request).await else {
            return Ok(None);
        };

        let key = segment_key(
            &org.organization_id,
            &policy,
            request.user_id.as_deref(),
            &request.properties,
        )?;
        let decision = check_or_admit(
            self.deps.limiter.as_ref(),
            &RateLimitRequest::admission(key.clone(), &policy),
        )
        .await;
        debug!(
            segment = %key,
            limited = decision.is_rate_limited(),
            remaining = decision.remaining,
            "Rate limit checked"
        );

        let pending_usage = (policy.unit.is_cost_based() && !decision.is_rate_limited()).then(|| {
            PendingUsage {
                segment_key: key,
                policy: policy.clone(),
            }
        });
        Ok(Some(Admission {
            policy,
            decision,
            pending_usage,
        }))
    }

    /// Screening verdict for the last user message; `None` when nothing
    /// was screened
    async fn screen(&self, request: &ProxyRequest) -> Option<bool> {
        let flags = request.flags;
        if !(flags.prompt_security || flags.moderations) || !request.is_chat_completion() {
            return None;
        }
        let message = request.last_user_message()?;

        let mut checks = Vec::with_capacity(2);
        if flags.prompt_security {
            checks.push(ScreeningKind::PromptSecurity {
                advanced: flags.prompt_security_advanced,
            });
        }
        if flags.moderations {
            checks.push(ScreeningKind::Moderation);
        }

        for kind in checks {
            match self
                .deps
                .screener
                .is_flagged(kind, request.request_id, message)
                .await
            {
                Ok(true) => return Some(true),
                Ok(false) => {}
                Err(e) => warn!(kind = ?kind, error = %e, "Screening failed, allowing request"),
            }
        }
        Some(false)
    }

    fn respond_from_cache(
        &self,
        request: ProxyRequest,
        organization: Option<OrgContext>,
        builder: ResponseBuilder,
        hit: CacheHit,
    ) -> Response {
        debug!(bucket_index = hit.bucket_index, "Serving cached response");
        let chunks: Vec<_> = hit.body_chunks().into_iter().map(Ok).collect();
        let response = ProviderResponse {
            status: 200,
            headers: hit.response_headers(),
            body: Box::pin(stream::iter(chunks)),
            served_by: None,
        };
        self.respond(request, organization, builder, response, ResponseOrigin::Cache, None)
    }

    fn respond_with_error(
        &self,
        request: ProxyRequest,
        organization: Option<OrgContext>,
        builder: ResponseBuilder,
        error: ProxyError,
    ) -> Response {
        let body = error
            .to_error_response()
            .with_request_id(request.request_id.to_string());
        let response = match serde_json::to_value(&body) {
            Ok(body) => ProviderResponse::json(error.status_code(), &body),
            Err(e) => return ProxyError::Internal(e.to_string()).into_response(),
        };
        self.respond(
            request,
            organization,
            builder,
            response,
            ResponseOrigin::GatewayError,
            None,
        )
    }

    /// Streams `response` to the client and schedules finalization
    fn respond(
        &self,
        request: ProxyRequest,
        organization: Option<OrgContext>,
        mut builder: ResponseBuilder,
        response: ProviderResponse,
        origin: ResponseOrigin,
        pending_usage: Option<PendingUsage>,
    ) -> Response {
        let status = if response.is_success() {
            "success"
        } else {
            "failed"
        };
        builder.set_header(HELICONE_STATUS, status);

        let ProviderResponse {
            status,
            headers,
            body,
            served_by,
        } = response;
        let body: BodyStream = if request.flags.stream_force_format {
            Box::pin(ForceFormat::new(body))
        } else {
            body
        };
        let (interceptor, body) = StreamInterceptor::wrap(body, request.is_stream);
        let client_response = builder.build(status, &headers, Body::from_stream(body));

        let loggable = Loggable::new(
            Arc::new(request),
            organization,
            origin,
            status,
            headers,
            interceptor,
        )
        .served_by(served_by);
        self.deps
            .finalizer
            .schedule(&self.deps.tasks, loggable, pending_usage);

        client_response
    }
}
