//! Post-response work: cache writes, log persistence, usage and billing
//!
//! Nothing here can affect the client response. Failures are logged and
//! dropped.

use crate::cache::{CacheEngine, CacheIdentity, CacheSlot};
use crate::collaborators::{EscrowLedger, LogReceipt, LogSink};
use crate::infrastructure::BackgroundTasks;
use crate::proxy::headers::HELICONE_PREFIX;
use crate::proxy::interceptor::{CompletedStream, CompletionReason};
use crate::proxy::loggable::{LogRecord, Loggable, ResponseOrigin};
use crate::rate_limit::{RateLimitPolicy, RateLimitRequest, RateLimitUnit, RateLimiter};
use http::HeaderMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, instrument, warn};

/// Cost-based policy whose usage is recorded once the cost is known
#[derive(Debug, Clone, PartialEq)]
pub struct PendingUsage {
    pub segment_key: String,
    pub policy: RateLimitPolicy,
}

impl PendingUsage {
    fn cost(&self, receipt: &LogReceipt) -> Option<f64> {
        match self.policy.unit {
            RateLimitUnit::Cents => receipt.cost_cents,
            RateLimitUnit::Token => receipt.total_tokens.map(|tokens| tokens as f64),
            RateLimitUnit::Request => None,
        }
    }
}

pub struct Finalizer {
    cache: Arc<CacheEngine>,
    limiter: Arc<dyn RateLimiter>,
    log_sink: Arc<dyn LogSink>,
    escrow: Arc<dyn EscrowLedger>,
    stream_timeout: Duration,
}

impl Finalizer {
    pub fn new(
        cache: Arc<CacheEngine>,
        limiter: Arc<dyn RateLimiter>,
        log_sink: Arc<dyn LogSink>,
        escrow: Arc<dyn EscrowLedger>,
        stream_timeout: Duration,
    ) -> Self {
        Self {
            cache,
            limiter,
            log_sink,
            escrow,
            stream_timeout,
        }
    }

    /// Hands the post-response work to the background tracker
    pub fn schedule(
        self: &Arc<Self>,
        tasks: &BackgroundTasks,
        loggable: Loggable,
        usage: Option<PendingUsage>,
    ) {
        if Self::should_cache(&loggable) {
            let finalizer = self.clone();
            let loggable = loggable.clone();
            tasks.spawn("cache_write", async move {
                finalizer.write_cache(&loggable).await;
            });
        }

        let finalizer = self.clone();
        tasks.spawn("finalize", async move {
            finalizer.finalize(&loggable, usage).await;
        });
    }

    fn should_cache(loggable: &Loggable) -> bool {
        loggable.origin == ResponseOrigin::Provider
            && loggable.status == 200
            && loggable.request.cache.save
            && loggable
                .organization
                .as_ref()
                .is_some_and(|org| org.cache_enabled)
    }

    /// Stores a fully received 200 response in the request's cache bucket.
    ///
    /// Returns whether a slot was written.
    pub async fn write_cache(&self, loggable: &Loggable) -> bool {
        let Some(organization) = &loggable.organization else {
            return false;
        };

        let completed = loggable
            .interceptor()
            .wait_for_stream_within(self.stream_timeout)
            .await;
        if completed.reason != CompletionReason::Done {
            debug!(
                request_id = %loggable.request.request_id,
                reason = completed.reason.as_str(),
                "Skipping cache write for incomplete response"
            );
            return false;
        }

        let request = &loggable.request;
        let url = request.target.to_string();
        let identity = CacheIdentity::for_request(request, &url);
        let slot = CacheSlot::from_response(
            &cacheable_headers(&loggable.headers),
            latency_ms(loggable, &completed),
            completed.body,
        );

        match self
            .cache
            .write(
                &organization.organization_id,
                &identity,
                request.cache.bucket_size,
                request.cache.cache_control.as_deref(),
                &slot,
            )
            .await
        {
            Ok(written) => written,
            Err(e) => {
                error!(request_id = %request.request_id, error = %e, "Cache write failed");
                false
            }
        }
    }

    /// Persists the log record, records cost usage and settles the escrow
    #[instrument(skip_all, fields(request_id = %loggable.request.request_id))]
    pub async fn finalize(&self, loggable: &Loggable, usage: Option<PendingUsage>) -> LogRecord {
        let record = loggable.read_and_log_response(self.stream_timeout).await;

        let receipt = match self.log_sink.persist(&record).await {
            Ok(receipt) => receipt,
            Err(e) => {
                error!(error = %e, "Failed to persist log record");
                LogReceipt::default()
            }
        };

        if let Some(usage) = usage {
            self.record_usage(loggable, &usage, &receipt).await;
        }
        self.settle_escrow(loggable, &receipt).await;

        record
    }

    async fn record_usage(&self, loggable: &Loggable, usage: &PendingUsage, receipt: &LogReceipt) {
        if loggable.origin != ResponseOrigin::Provider {
            return;
        }
        let Some(cost) = usage.cost(receipt).filter(|cost| *cost > 0.0) else {
            debug!(segment = %usage.segment_key, "No cost to record");
            return;
        };

        let request = RateLimitRequest::usage(usage.segment_key.clone(), &usage.policy, cost);
        if let Err(e) = self.limiter.commit(&request).await {
            error!(segment = %usage.segment_key, cost, error = %e, "Failed to record usage");
        }
    }

    async fn settle_escrow(&self, loggable: &Loggable, receipt: &LogReceipt) {
        let (Some(hold), Some(organization)) = (&loggable.request.escrow, &loggable.organization)
        else {
            return;
        };
        let org_id = &organization.organization_id;
        let request = &loggable.request;

        let result = match (loggable.origin, receipt.cost_cents) {
            (ResponseOrigin::Provider, Some(cost)) => {
                self.escrow
                    .finalize_escrow(org_id, &hold.escrow_id, cost)
                    .await
            }
            (ResponseOrigin::Provider, None) => {
                let target = loggable.served_by.as_ref().unwrap_or(&request.target);
                let model = request.model().unwrap_or("unknown");
                warn!(
                    provider = %target.provider,
                    model,
                    "Cost unknown for escrowed request"
                );
                if let Err(e) = self
                    .escrow
                    .add_to_disallow_list(request.request_id, &target.provider, model)
                    .await
                {
                    error!(error = %e, "Failed to add model to disallow list");
                }
                self.escrow.cancel_escrow(org_id, &hold.escrow_id).await
            }
            // Nothing was spent upstream
            _ => self.escrow.cancel_escrow(org_id, &hold.escrow_id).await,
        };

        if let Err(e) = result {
            error!(escrow_id = %hold.escrow_id, error = %e, "Escrow settlement failed");
        }
    }
}

fn cacheable_headers(headers: &HeaderMap) -> HeaderMap {
    let mut kept = headers.clone();
    let gateway: Vec<_> = kept
        .keys()
        .filter(|name| name.as_str().starts_with(HELICONE_PREFIX))
        .cloned()
        .collect();
    for name in gateway {
        kept.remove(name);
    }
    kept
}

fn latency_ms(loggable: &Loggable, completed: &CompletedStream) -> u64 {
    let elapsed = completed.end_time - loggable.request.start_time;
    u64::try_from(elapsed.num_milliseconds()).unwrap_or(0)
}
