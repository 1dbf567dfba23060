//! In-process collaborators driven by `Settings`
//!
//! A single-tenant deployment needs no external org directory, policy
//! service or provider catalog; these adapters answer from configuration.

use crate::collaborators::{
    CollaboratorError, ContentScreener, EscrowLedger, LogReceipt, LogSink, OrgContext,
    OrgDirectory, PolicyStore, ProviderEndpoint, ProviderRegistry, ScreeningKind,
};
use crate::config::{OrganizationSettings, PolicySettings, ProviderSettings};
use crate::domain::types::{OrganizationId, ProviderName, RequestId};
use crate::error::Error;
use crate::proxy::headers::{text, BEARER_PREFIX, HELICONE_AUTH};
use crate::proxy::loggable::LogRecord;
use crate::rate_limit::RateLimitPolicy;
use async_trait::async_trait;
use http::{HeaderMap, HeaderName, HeaderValue};
use std::collections::HashMap;
use subtle::{Choice, ConstantTimeEq};
use tracing::{debug, info, warn};

/// One organization, authenticated by its configured gateway keys
#[derive(Debug, Clone)]
pub struct StaticOrgDirectory {
    context: OrgContext,
    api_keys: Vec<String>,
}

impl StaticOrgDirectory {
    pub fn from_settings(settings: &OrganizationSettings) -> crate::Result<Self> {
        let organization_id = OrganizationId::try_new(settings.id.clone())
            .map_err(|e| Error::invalid_input(format!("organization.id: {e}")))?;
        Ok(Self {
            context: OrgContext {
                organization_id,
                cache_enabled: settings.cache_enabled,
            },
            api_keys: settings.api_keys.clone(),
        })
    }
}

#[async_trait]
impl OrgDirectory for StaticOrgDirectory {
    async fn authenticate(&self, headers: &HeaderMap) -> Result<OrgContext, CollaboratorError> {
        // Without configured keys every caller belongs to the organization
        if self.api_keys.is_empty() {
            return Ok(self.context.clone());
        }

        let presented = text(headers, HELICONE_AUTH)
            .map(|value| value.strip_prefix(BEARER_PREFIX).unwrap_or(value).trim())
            .ok_or(CollaboratorError::Unauthorized)?;

        // Constant time across every configured key, no short-circuit
        let matched = self
            .api_keys
            .iter()
            .fold(Choice::from(0), |found, key| {
                found | key.as_bytes().ct_eq(presented.as_bytes())
            });
        if bool::from(matched) {
            Ok(self.context.clone())
        } else {
            Err(CollaboratorError::Unauthorized)
        }
    }
}

/// Account-level policies from the `policies` table
#[derive(Debug, Clone, Default)]
pub struct StaticPolicyStore {
    policies: Vec<RateLimitPolicy>,
}

impl StaticPolicyStore {
    pub fn new(policies: Vec<RateLimitPolicy>) -> Self {
        Self { policies }
    }

    /// Validates each entry with the same rules as the policy header
    pub fn from_settings(settings: &[PolicySettings]) -> crate::Result<Self> {
        let policies = settings
            .iter()
            .enumerate()
            .map(|(index, entry)| {
                let mut policy = format!("{};w={}", entry.quota, entry.window_seconds);
                if let Some(unit) = &entry.unit {
                    policy.push_str(&format!(";u={unit}"));
                }
                if let Some(segment) = &entry.segment {
                    policy.push_str(&format!(";s={segment}"));
                }
                policy
                    .parse::<RateLimitPolicy>()
                    .map_err(|e| Error::invalid_input(format!("policies[{index}]: {e}")))
            })
            .collect::<crate::Result<Vec<_>>>()?;
        Ok(Self { policies })
    }
}

#[async_trait]
impl PolicyStore for StaticPolicyStore {
    async fn policies(
        &self,
        _organization_id: &OrganizationId,
    ) -> Result<Vec<RateLimitPolicy>, CollaboratorError> {
        Ok(self.policies.clone())
    }
}

/// Provider catalog keyed by provider name
#[derive(Debug, Clone, Default)]
pub struct StaticProviderRegistry {
    endpoints: HashMap<ProviderName, ProviderEndpoint>,
}

impl StaticProviderRegistry {
    pub fn from_endpoints(endpoints: impl IntoIterator<Item = ProviderEndpoint>) -> Self {
        Self {
            endpoints: endpoints
                .into_iter()
                .map(|endpoint| (endpoint.name.clone(), endpoint))
                .collect(),
        }
    }

    pub fn from_settings(settings: &HashMap<String, ProviderSettings>) -> crate::Result<Self> {
        let mut endpoints = Vec::with_capacity(settings.len());
        for (name, provider) in settings {
            let name = ProviderName::try_new(name.clone())
                .map_err(|e| Error::invalid_input(format!("providers.{name}: {e}")))?;
            let mut extra_headers = HeaderMap::new();
            let platform_key = match (&provider.auth_header, &provider.auth_value) {
                (Some(header), Some(value)) => Some((header, value)),
                _ => None,
            };
            for (header, value) in provider.extra_headers.iter().chain(platform_key) {
                let header_name = HeaderName::from_bytes(header.as_bytes())
                    .map_err(|_| Error::invalid_input(format!("providers.{name}.{header}")))?;
                let header_value = HeaderValue::from_str(value)
                    .map_err(|_| Error::invalid_input(format!("providers.{name}.{header}")))?;
                extra_headers.insert(header_name, header_value);
            }
            endpoints.push(ProviderEndpoint {
                name,
                base_url: provider.base_url.clone(),
                extra_headers,
            });
        }
        Ok(Self::from_endpoints(endpoints))
    }

    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }
}

#[async_trait]
impl ProviderRegistry for StaticProviderRegistry {
    async fn resolve(&self, provider: &ProviderName) -> Result<ProviderEndpoint, CollaboratorError> {
        self.endpoints
            .get(provider)
            .cloned()
            .ok_or_else(|| CollaboratorError::NotFound(provider.to_string()))
    }
}

/// Screener used when no screening service is configured
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAllScreener;

#[async_trait]
impl ContentScreener for AllowAllScreener {
    async fn is_flagged(
        &self,
        kind: ScreeningKind,
        request_id: RequestId,
        _text: &str,
    ) -> Result<bool, CollaboratorError> {
        debug!(request_id = %request_id, kind = ?kind, "No screener configured, allowing");
        Ok(false)
    }
}

/// Writes finalized records to the log stream
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingLogSink;

#[async_trait]
impl LogSink for TracingLogSink {
    async fn persist(&self, record: &LogRecord) -> Result<LogReceipt, CollaboratorError> {
        info!(
            request_id = %record.request_id,
            org_id = record.organization_id.as_deref().unwrap_or("-"),
            provider = %record.provider,
            status = record.status,
            completion = record.completion,
            origin = ?record.origin,
            latency_ms = record.total_latency_ms,
            "Request logged"
        );
        Ok(LogReceipt::default())
    }
}

/// Ledger for deployments without platform billing
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingEscrowLedger;

#[async_trait]
impl EscrowLedger for LoggingEscrowLedger {
    async fn finalize_escrow(
        &self,
        organization_id: &OrganizationId,
        escrow_id: &str,
        cost_cents: f64,
    ) -> Result<(), CollaboratorError> {
        info!(org_id = %organization_id, escrow_id, cost_cents, "Escrow finalized");
        Ok(())
    }

    async fn cancel_escrow(
        &self,
        organization_id: &OrganizationId,
        escrow_id: &str,
    ) -> Result<(), CollaboratorError> {
        info!(org_id = %organization_id, escrow_id, "Escrow cancelled");
        Ok(())
    }

    async fn add_to_disallow_list(
        &self,
        request_id: RequestId,
        provider: &ProviderName,
        model: &str,
    ) -> Result<(), CollaboratorError> {
        warn!(request_id = %request_id, provider = %provider, model, "Model added to disallow list");
        Ok(())
    }
}
