//! Narrow interfaces to the services around the pipeline
//!
//! Organization lookup, account policies, the provider registry, content
//! screening, the escrow ledger and log persistence all live outside this
//! crate. The pipeline only sees these traits.

use crate::domain::types::{OrganizationId, ProviderName, RequestId};
use crate::proxy::loggable::LogRecord;
use crate::rate_limit::RateLimitPolicy;
use async_trait::async_trait;
use http::HeaderMap;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CollaboratorError {
    #[error("Unauthorized")]
    Unauthorized,

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Service unavailable: {0}")]
    Unavailable(String),

    #[error("Rejected: {0}")]
    Rejected(String),
}

/// Authenticated tenant and what it is entitled to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrgContext {
    pub organization_id: OrganizationId,
    pub cache_enabled: bool,
}

#[async_trait]
pub trait OrgDirectory: Send + Sync {
    /// Resolves the caller from its gateway credentials
    async fn authenticate(&self, headers: &HeaderMap) -> Result<OrgContext, CollaboratorError>;
}

#[async_trait]
pub trait PolicyStore: Send + Sync {
    /// Account-level rate-limit policies, in configured order
    async fn policies(
        &self,
        organization_id: &OrganizationId,
    ) -> Result<Vec<RateLimitPolicy>, CollaboratorError>;
}

/// Where and how to reach one provider
#[derive(Debug, Clone)]
pub struct ProviderEndpoint {
    pub name: ProviderName,
    pub base_url: String,
    /// Provider-specific headers merged into every outbound request,
    /// including platform-held credentials
    pub extra_headers: HeaderMap,
}

#[async_trait]
pub trait ProviderRegistry: Send + Sync {
    async fn resolve(&self, provider: &ProviderName)
        -> Result<ProviderEndpoint, CollaboratorError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScreeningKind {
    PromptSecurity { advanced: bool },
    Moderation,
}

#[async_trait]
pub trait ContentScreener: Send + Sync {
    /// `true` when the text must not reach the provider
    async fn is_flagged(
        &self,
        kind: ScreeningKind,
        request_id: RequestId,
        text: &str,
    ) -> Result<bool, CollaboratorError>;
}

#[async_trait]
pub trait EscrowLedger: Send + Sync {
    async fn finalize_escrow(
        &self,
        organization_id: &OrganizationId,
        escrow_id: &str,
        cost_cents: f64,
    ) -> Result<(), CollaboratorError>;

    async fn cancel_escrow(
        &self,
        organization_id: &OrganizationId,
        escrow_id: &str,
    ) -> Result<(), CollaboratorError>;

    /// Blocks a provider/model pair whose cost could not be determined
    async fn add_to_disallow_list(
        &self,
        request_id: RequestId,
        provider: &ProviderName,
        model: &str,
    ) -> Result<(), CollaboratorError>;
}

/// Outcome of persisting a log record
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct LogReceipt {
    /// Cost of the call when the sink could price it
    pub cost_cents: Option<f64>,
    pub total_tokens: Option<u64>,
}

#[async_trait]
pub trait LogSink: Send + Sync {
    async fn persist(&self, record: &LogRecord) -> Result<LogReceipt, CollaboratorError>;
}
