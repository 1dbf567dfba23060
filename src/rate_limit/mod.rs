//! Sliding-window rate limiting
//!
//! Two backends share the [`RateLimiter`] interface and the pure decision in
//! [`logic::evaluate`]:
//! - [`CounterRateLimiter`] keeps a timestamp list in the KV store. Fast,
//!   approximate and fail-open.
//! - [`AuthoritativeRateLimiter`] routes every call for a segment to one actor
//!   that owns an embedded SQL log, so the window is exact.

pub mod authoritative;
pub mod clock;
pub mod counter;
pub mod logic;
pub mod policy;
pub mod segment;

pub use authoritative::AuthoritativeRateLimiter;
pub use clock::{Clock, ManualClock, SystemClock};
pub use counter::CounterRateLimiter;
pub use logic::{evaluate, Decision, DecisionInput, DecisionStatus};
pub use policy::{select_policy, PolicyParseError, RateLimitPolicy, RateLimitUnit, Segment};
pub use segment::segment_key;

use crate::config::{RateLimitSettings, RateLimitStrategy};
use crate::proxy::headers::{
    HELICONE_RATE_LIMIT_LIMIT, HELICONE_RATE_LIMIT_POLICY, HELICONE_RATE_LIMIT_REMAINING,
    HELICONE_RATE_LIMIT_RESET,
};
use crate::storage::{KvError, KvStore};
use async_trait::async_trait;
use http::{HeaderMap, HeaderValue};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

#[derive(Error, Debug)]
pub enum RateLimitError {
    #[error("Rate limit segment requires a user id")]
    MissingUserId,

    #[error("Missing header for rate limit property '{property}'")]
    MissingHeader { property: String },

    #[error("Rate limit store error: {0}")]
    Storage(#[from] sqlx::Error),

    #[error("Rate limit window encoding error: {0}")]
    Encoding(#[from] serde_json::Error),

    #[error("Rate limit KV error: {0}")]
    Kv(#[from] KvError),

    #[error("Rate limit actor unavailable: {0}")]
    ActorUnavailable(String),
}

/// One call against one segment
#[derive(Debug, Clone, PartialEq)]
pub struct RateLimitRequest {
    pub segment_key: String,
    pub quota: f64,
    pub window_ms: i64,
    pub unit: RateLimitUnit,
    /// Units this call consumes
    pub cost: f64,
    pub check_only: bool,
}

impl RateLimitRequest {
    /// Pre-request admission for `policy`.
    ///
    /// Request-counted policies consume one unit on admission. Cost-based
    /// policies only check here; their cost is committed after the response.
    pub fn admission(segment_key: String, policy: &RateLimitPolicy) -> Self {
        let cost_based = policy.unit.is_cost_based();
        Self {
            segment_key,
            quota: policy.quota,
            window_ms: policy.window_ms(),
            unit: policy.unit,
            cost: if cost_based { 0.0 } else { 1.0 },
            check_only: cost_based,
        }
    }

    /// Post-response usage record for a cost-based policy
    pub fn usage(segment_key: String, policy: &RateLimitPolicy, cost: f64) -> Self {
        Self {
            segment_key,
            quota: policy.quota,
            window_ms: policy.window_ms(),
            unit: policy.unit,
            cost,
            check_only: false,
        }
    }
}

#[async_trait]
pub trait RateLimiter: Send + Sync + 'static {
    /// Evaluates the call and, when admitted and not check-only, records it
    async fn check(&self, request: &RateLimitRequest) -> Result<Decision, RateLimitError>;

    /// Records `request.cost` units unconditionally
    async fn commit(&self, request: &RateLimitRequest) -> Result<(), RateLimitError>;
}

/// Runs `check`, admitting the call when the backend fails
pub async fn check_or_admit(limiter: &dyn RateLimiter, request: &RateLimitRequest) -> Decision {
    match limiter.check(request).await {
        Ok(decision) => decision,
        Err(error) => {
            warn!(
                segment = %request.segment_key,
                error = %error,
                "Rate limit check failed, admitting request"
            );
            Decision::fail_open(request.quota)
        }
    }
}

pub fn build_limiter(
    settings: &RateLimitSettings,
    kv: Arc<dyn KvStore>,
    clock: Arc<dyn Clock>,
) -> Arc<dyn RateLimiter> {
    match settings.strategy {
        RateLimitStrategy::Authoritative => Arc::new(AuthoritativeRateLimiter::with_idle_timeout(
            clock,
            Duration::from_secs(settings.actor_idle_secs),
        )),
        RateLimitStrategy::Counter => Arc::new(CounterRateLimiter::new(
            kv,
            clock,
            settings.kv_write_attempts,
        )),
    }
}

fn format_amount(value: f64) -> String {
    if value.fract() == 0.0 {
        format!("{}", value as i64)
    } else {
        format!("{value}")
    }
}

/// `Helicone-RateLimit-*` response headers for a decision
pub fn rate_limit_headers(policy: &RateLimitPolicy, decision: &Decision) -> HeaderMap {
    let mut headers = HeaderMap::new();
    let mut insert = |name: &'static str, value: String| {
        if let Ok(value) = HeaderValue::from_str(&value) {
            headers.insert(name, value);
        }
    };
    insert(HELICONE_RATE_LIMIT_LIMIT, format_amount(decision.limit));
    insert(HELICONE_RATE_LIMIT_REMAINING, format_amount(decision.remaining));
    insert(HELICONE_RATE_LIMIT_POLICY, policy.to_policy_string());
    if let Some(reset) = decision.reset_secs {
        insert(HELICONE_RATE_LIMIT_RESET, reset.to_string());
    }
    headers
}
