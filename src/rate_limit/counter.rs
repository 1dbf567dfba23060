//! Approximate sliding window over a KV-stored timestamp list
//!
//! The whole window is read, modified and rewritten on every update. Two
//! racing requests can both read the same state, so usage may be
//! undercounted. Any storage problem admits the request.

use super::clock::Clock;
use super::logic::{evaluate, Decision, DecisionInput};
use super::{RateLimitError, RateLimitRequest, RateLimiter};
use crate::retry::{retry_with_backoff, Backoff};
use crate::storage::KvStore;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, warn};

const KEY_PREFIX: &str = "rl:";

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WindowEntry {
    pub timestamp: i64,
    pub unit: f64,
}

/// Parses a stored window; anything unreadable is an empty window
pub fn parse_window(raw: Option<&str>) -> Vec<WindowEntry> {
    let mut entries: Vec<WindowEntry> = raw
        .and_then(|text| serde_json::from_str(text).ok())
        .unwrap_or_default();
    entries.sort_by_key(|entry| entry.timestamp);
    entries
}

/// Index of the first entry newer than `window_start`, or `None` when every
/// entry has expired. `entries` must be sorted by timestamp.
pub fn first_relevant_index(entries: &[WindowEntry], window_start: i64) -> Option<usize> {
    let index = entries.partition_point(|entry| entry.timestamp <= window_start);
    (index < entries.len()).then_some(index)
}

fn live_entries(entries: &[WindowEntry], window_start: i64) -> &[WindowEntry] {
    match first_relevant_index(entries, window_start) {
        Some(index) => &entries[index..],
        None => &[],
    }
}

pub struct CounterRateLimiter {
    kv: Arc<dyn KvStore>,
    clock: Arc<dyn Clock>,
    write_attempts: u32,
    backoff: Backoff,
}

impl CounterRateLimiter {
    pub fn new(kv: Arc<dyn KvStore>, clock: Arc<dyn Clock>, write_attempts: u32) -> Self {
        Self {
            kv,
            clock,
            write_attempts,
            backoff: Backoff::storage(),
        }
    }

    #[must_use]
    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    fn storage_key(segment_key: &str) -> String {
        format!("{KEY_PREFIX}{segment_key}")
    }

    async fn load(&self, segment_key: &str) -> Result<Vec<WindowEntry>, RateLimitError> {
        let raw = self.kv.get(&Self::storage_key(segment_key)).await?;
        Ok(parse_window(raw.as_deref()))
    }

    async fn evaluate_window(&self, request: &RateLimitRequest) -> Result<Decision, RateLimitError> {
        let now_ms = self.clock.now_ms();
        let entries = self.load(&request.segment_key).await?;
        let live = live_entries(&entries, now_ms - request.window_ms);

        Ok(evaluate(&DecisionInput {
            current_usage: live.iter().map(|entry| entry.unit).sum(),
            unit_count: request.cost,
            quota: request.quota,
            oldest_timestamp_ms: live.first().map(|entry| entry.timestamp),
            window_ms: request.window_ms,
            now_ms,
            check_only: request.check_only,
        }))
    }

    async fn append(&self, request: &RateLimitRequest) -> Result<(), RateLimitError> {
        let now_ms = self.clock.now_ms();
        let entries = self.load(&request.segment_key).await?;
        let mut window = live_entries(&entries, now_ms - request.window_ms).to_vec();
        window.push(WindowEntry {
            timestamp: now_ms,
            unit: request.cost,
        });

        let payload = serde_json::to_string(&window)?;
        let ttl_secs = u64::try_from(request.window_ms.max(1)).unwrap_or(1).div_ceil(1000);
        let ttl = Duration::from_secs(ttl_secs.max(1));
        let key = Self::storage_key(&request.segment_key);

        retry_with_backoff(self.write_attempts, &self.backoff, |_| {
            self.kv.put(&key, payload.clone(), ttl)
        })
        .await?;
        Ok(())
    }
}

#[async_trait]
impl RateLimiter for CounterRateLimiter {
    async fn check(&self, request: &RateLimitRequest) -> Result<Decision, RateLimitError> {
        let decision = match self.evaluate_window(request).await {
            Ok(decision) => decision,
            Err(e) => {
                warn!(
                    segment = %request.segment_key,
                    error = %e,
                    "Counter rate limit read failed, admitting request"
                );
                return Ok(Decision::fail_open(request.quota));
            }
        };

        if !request.check_only && !decision.is_rate_limited() {
            self.commit(request).await?;
        }
        Ok(decision)
    }

    async fn commit(&self, request: &RateLimitRequest) -> Result<(), RateLimitError> {
        if let Err(e) = self.append(request).await {
            error!(
                segment = %request.segment_key,
                error = %e,
                "Failed to persist rate limit window"
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rate_limit::clock::ManualClock;
    use crate::rate_limit::policy::RateLimitUnit;
    use crate::rate_limit::DecisionStatus;
    use crate::storage::{InMemoryKv, KvError};
    use proptest::prelude::*;

    const NOW: i64 = 1_700_000_000_000;

    struct FailingKv;

    #[async_trait]
    impl KvStore for FailingKv {
        async fn get(&self, _key: &str) -> Result<Option<String>, KvError> {
            Err(KvError::Unavailable("down".to_string()))
        }

        async fn put(&self, _key: &str, _value: String, _ttl: Duration) -> Result<(), KvError> {
            Err(KvError::Unavailable("down".to_string()))
        }
    }

    fn request(quota: f64, cost: f64, check_only: bool) -> RateLimitRequest {
        RateLimitRequest {
            segment_key: "org-1:request:global".to_string(),
            quota,
            window_ms: 60_000,
            unit: RateLimitUnit::Request,
            cost,
            check_only,
        }
    }

    fn limiter(kv: Arc<dyn KvStore>, clock: Arc<ManualClock>) -> CounterRateLimiter {
        CounterRateLimiter::new(kv, clock, 3).with_backoff(Backoff {
            min_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
            factor: 2.0,
            jitter: 0.0,
        })
    }

    fn window(entries: &[(i64, f64)]) -> String {
        let entries: Vec<WindowEntry> = entries
            .iter()
            .map(|(timestamp, unit)| WindowEntry {
                timestamp: *timestamp,
                unit: *unit,
            })
            .collect();
        serde_json::to_string(&entries).unwrap()
    }

    #[test]
    fn unreadable_payloads_are_empty_windows() {
        assert!(parse_window(None).is_empty());
        assert!(parse_window(Some("not json")).is_empty());
        assert!(parse_window(Some("{\"timestamp\":1}")).is_empty());
        assert!(parse_window(Some("[{\"nope\":true}]")).is_empty());
    }

    #[test]
    fn unsorted_windows_are_sorted() {
        let entries = parse_window(Some(&window(&[(30, 1.0), (10, 1.0), (20, 1.0)])));
        let timestamps: Vec<i64> = entries.iter().map(|e| e.timestamp).collect();
        assert_eq!(timestamps, vec![10, 20, 30]);
    }

    #[test]
    fn all_expired_has_no_relevant_index() {
        let entries = parse_window(Some(&window(&[(10, 1.0), (20, 1.0)])));
        assert_eq!(first_relevant_index(&entries, 20), None);
        assert_eq!(first_relevant_index(&entries, 15), Some(1));
        assert_eq!(first_relevant_index(&[], 0), None);
    }

    proptest! {
        #[test]
        fn binary_search_matches_linear_scan(
            mut timestamps in prop::collection::vec(0i64..10_000, 0..64),
            window_start in -10i64..10_010,
        ) {
            timestamps.sort_unstable();
            let entries: Vec<WindowEntry> = timestamps
                .iter()
                .map(|t| WindowEntry { timestamp: *t, unit: 1.0 })
                .collect();
            let linear = entries.iter().position(|e| e.timestamp > window_start);
            prop_assert_eq!(first_relevant_index(&entries, window_start), linear);
        }
    }

    #[tokio::test]
    async fn tenth_request_of_ten_is_rejected() {
        let kv = Arc::new(InMemoryKv::new());
        let entries: Vec<(i64, f64)> = (0..9).map(|i| (NOW - 30_000 + i, 1.0)).collect();
        kv.put("rl:org-1:request:global", window(&entries), Duration::from_secs(60))
            .await
            .unwrap();
        let clock = Arc::new(ManualClock::new(NOW));
        let limiter = limiter(kv.clone(), clock);

        let decision = limiter.check(&request(10.0, 1.0, false)).await.unwrap();
        assert_eq!(decision.status, DecisionStatus::RateLimited);
        assert_eq!(decision.remaining, 1.0);
        assert_eq!(decision.current_usage, 9.0);
        assert_eq!(decision.reset_secs, Some(30));

        let stored = parse_window(kv.get("rl:org-1:request:global").await.unwrap().as_deref());
        assert_eq!(stored.len(), 9);
    }

    #[tokio::test]
    async fn admitted_requests_are_recorded_with_window_ttl() {
        let kv = Arc::new(InMemoryKv::new());
        let clock = Arc::new(ManualClock::new(NOW));
        let limiter = limiter(kv.clone(), clock.clone());

        for _ in 0..3 {
            let decision = limiter.check(&request(4.0, 1.0, false)).await.unwrap();
            assert_eq!(decision.status, DecisionStatus::Ok);
            clock.advance_ms(10);
        }
        let stored = parse_window(kv.get("rl:org-1:request:global").await.unwrap().as_deref());
        assert_eq!(stored.len(), 3);
        assert!(kv.expires_in("rl:org-1:request:global").await.unwrap() <= Duration::from_secs(60));

        let decision = limiter.check(&request(4.0, 1.0, false)).await.unwrap();
        assert!(decision.is_rate_limited());
    }

    #[tokio::test]
    async fn check_only_does_not_record() {
        let kv = Arc::new(InMemoryKv::new());
        let limiter = limiter(kv.clone(), Arc::new(ManualClock::new(NOW)));

        for _ in 0..5 {
            let decision = limiter.check(&request(10.0, 1.0, true)).await.unwrap();
            assert_eq!(decision.current_usage, 0.0);
        }
        assert!(kv.is_empty().await);
    }

    #[tokio::test]
    async fn expired_entries_do_not_count() {
        let kv = Arc::new(InMemoryKv::new());
        kv.put(
            "rl:org-1:request:global",
            window(&[(NOW - 120_000, 5.0), (NOW - 60_000, 5.0), (NOW - 1_000, 1.0)]),
            Duration::from_secs(60),
        )
        .await
        .unwrap();
        let limiter = limiter(kv, Arc::new(ManualClock::new(NOW)));

        let decision = limiter.check(&request(10.0, 1.0, true)).await.unwrap();
        assert_eq!(decision.current_usage, 1.0);
        assert_eq!(decision.reset_secs, Some(59));
    }

    #[tokio::test]
    async fn storage_failure_admits_with_zero_remaining() {
        let limiter = limiter(Arc::new(FailingKv), Arc::new(ManualClock::new(NOW)));
        let decision = limiter.check(&request(1.0, 1.0, false)).await.unwrap();
        assert_eq!(decision.status, DecisionStatus::Ok);
        assert_eq!(decision.remaining, 0.0);
        assert!(limiter.commit(&request(1.0, 1.0, false)).await.is_ok());
    }
}
