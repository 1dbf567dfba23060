//! Exact sliding window backed by one single-writer actor per segment
//!
//! Every call for a segment key is routed to the same actor task, which owns
//! an embedded SQLite log. The actor handles one command at a time and each
//! command runs in a single transaction, so two callers can never both be
//! admitted past the quota.

use super::clock::Clock;
use super::logic::{evaluate, Decision, DecisionInput};
use super::{RateLimitError, RateLimitRequest, RateLimiter};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, instrument};

const MAILBOX_CAPACITY: usize = 1024;

/// How long a segment actor waits for traffic before checking whether it
/// can stop
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(300);

type Reply<T> = oneshot::Sender<Result<T, RateLimitError>>;

/// Snapshot of one segment's window
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SegmentState {
    pub current_usage: f64,
    pub entry_count: i64,
    pub oldest_timestamp_ms: Option<i64>,
}

enum SegmentCommand {
    Process {
        request: RateLimitRequest,
        now_ms: i64,
        reply: Reply<Decision>,
    },
    Record {
        request: RateLimitRequest,
        now_ms: i64,
        reply: Reply<()>,
    },
    State {
        window_ms: i64,
        now_ms: i64,
        reply: Reply<SegmentState>,
    },
    Cleanup {
        older_than_ms: i64,
        reply: Reply<u64>,
    },
}

impl fmt::Debug for SegmentCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Process { request, .. } => f
                .debug_struct("Process")
                .field("cost", &request.cost)
                .field("check_only", &request.check_only)
                .finish(),
            Self::Record { request, .. } => {
                f.debug_struct("Record").field("cost", &request.cost).finish()
            }
            Self::State { window_ms, .. } => {
                f.debug_struct("State").field("window_ms", window_ms).finish()
            }
            Self::Cleanup { older_than_ms, .. } => f
                .debug_struct("Cleanup")
                .field("older_than_ms", older_than_ms)
                .finish(),
        }
    }
}

/// Embedded usage log owned by one actor
struct SegmentStore {
    pool: SqlitePool,
    segment_key: String,
}

impl SegmentStore {
    async fn open(segment_key: &str) -> Result<Self, sqlx::Error> {
        // A single connection that never idles out keeps the in-memory database alive
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS rate_limit_entries (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                segment_key TEXT NOT NULL,
                timestamp INTEGER NOT NULL,
                unit_count REAL NOT NULL,
                created_at INTEGER NOT NULL
            )",
        )
        .execute(&pool)
        .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_rate_limit_segment_time
                ON rate_limit_entries (segment_key, timestamp)",
        )
        .execute(&pool)
        .await?;

        Ok(Self {
            pool,
            segment_key: segment_key.to_string(),
        })
    }

    #[instrument(skip(self, request), fields(segment = %self.segment_key, cost = request.cost))]
    async fn process(&self, request: &RateLimitRequest, now_ms: i64) -> Result<Decision, sqlx::Error> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM rate_limit_entries WHERE segment_key = ? AND timestamp <= ?")
            .bind(&self.segment_key)
            .bind(now_ms - request.window_ms)
            .execute(&mut *tx)
            .await?;

        let (current_usage, oldest_timestamp_ms): (f64, Option<i64>) = sqlx::query_as(
            "SELECT CAST(COALESCE(SUM(unit_count), 0) AS REAL), MIN(timestamp)
                FROM rate_limit_entries WHERE segment_key = ?",
        )
        .bind(&self.segment_key)
        .fetch_one(&mut *tx)
        .await?;

        let input = DecisionInput {
            current_usage,
            unit_count: request.cost,
            quota: request.quota,
            oldest_timestamp_ms,
            window_ms: request.window_ms,
            now_ms,
            check_only: request.check_only,
        };
        let decision = evaluate(&input);

        if decision.records_usage(&input) {
            Self::insert(&mut tx, &self.segment_key, now_ms, request.cost).await?;
        }

        tx.commit().await?;
        debug!(status = ?decision.status, usage = decision.current_usage, "Processed rate limit");
        Ok(decision)
    }

    async fn record(&self, request: &RateLimitRequest, now_ms: i64) -> Result<(), sqlx::Error> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM rate_limit_entries WHERE segment_key = ? AND timestamp <= ?")
            .bind(&self.segment_key)
            .bind(now_ms - request.window_ms)
            .execute(&mut *tx)
            .await?;
        Self::insert(&mut tx, &self.segment_key, now_ms, request.cost).await?;
        tx.commit().await
    }

    async fn insert(
        tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
        segment_key: &str,
        now_ms: i64,
        cost: f64,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            "INSERT INTO rate_limit_entries (segment_key, timestamp, unit_count, created_at)
                VALUES (?, ?, ?, ?)",
        )
        .bind(segment_key)
        .bind(now_ms)
        .bind(cost)
        .bind(now_ms)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    async fn state(&self, window_ms: i64, now_ms: i64) -> Result<SegmentState, sqlx::Error> {
        let (current_usage, entry_count, oldest_timestamp_ms): (f64, i64, Option<i64>) =
            sqlx::query_as(
                "SELECT CAST(COALESCE(SUM(unit_count), 0) AS REAL), COUNT(*), MIN(timestamp)
                    FROM rate_limit_entries WHERE segment_key = ? AND timestamp > ?",
            )
            .bind(&self.segment_key)
            .bind(now_ms - window_ms)
            .fetch_one(&self.pool)
            .await?;

        Ok(SegmentState {
            current_usage,
            entry_count,
            oldest_timestamp_ms,
        })
    }

    /// Entries removed and entries left
    async fn cleanup(&self, older_than_ms: i64) -> Result<(u64, i64), sqlx::Error> {
        let result = sqlx::query("DELETE FROM rate_limit_entries WHERE timestamp < ?")
            .bind(older_than_ms)
            .execute(&self.pool)
            .await?;
        let (remaining,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM rate_limit_entries")
            .fetch_one(&self.pool)
            .await?;
        Ok((result.rows_affected(), remaining))
    }
}

async fn open_store<'a>(
    slot: &'a mut Option<SegmentStore>,
    segment_key: &str,
) -> Result<&'a SegmentStore, RateLimitError> {
    if slot.is_none() {
        *slot = Some(SegmentStore::open(segment_key).await?);
    }
    slot.as_ref()
        .ok_or_else(|| RateLimitError::ActorUnavailable(segment_key.to_string()))
}

struct ActorHandle {
    generation: u64,
    sender: mpsc::Sender<SegmentCommand>,
}

/// Live segment actors by key
#[derive(Default)]
struct ActorRegistry {
    actors: Mutex<HashMap<String, ActorHandle>>,
    next_generation: AtomicU64,
}

impl ActorRegistry {
    /// Removes the actor's entry when nobody can still reach it. Holding
    /// the map lock keeps `actor_for` from handing out a new sender
    /// meanwhile.
    fn release(
        &self,
        segment_key: &str,
        generation: u64,
        inbox: &mpsc::Receiver<SegmentCommand>,
    ) -> bool {
        let mut actors = self.actors.lock();
        let Some(handle) = actors.get(segment_key) else {
            return true;
        };
        if handle.generation != generation {
            return true;
        }
        if handle.sender.strong_count() > 1 || !inbox.is_empty() {
            return false;
        }
        actors.remove(segment_key);
        true
    }
}

struct SegmentActor {
    segment_key: String,
    generation: u64,
    clock: Arc<dyn Clock>,
    idle_timeout: Duration,
    registry: Weak<ActorRegistry>,
}

impl SegmentActor {
    /// Serves commands until the limiter is dropped or the segment has sat
    /// idle with nothing left inside any window it has seen
    async fn run(self, mut inbox: mpsc::Receiver<SegmentCommand>) {
        let segment_key = self.segment_key.as_str();
        let mut store = None;
        let mut live_until_ms = 0_i64;
        debug!(segment = %segment_key, generation = self.generation, "Rate limit actor started");

        loop {
            let command = match tokio::time::timeout(self.idle_timeout, inbox.recv()).await {
                Ok(Some(command)) => command,
                Ok(None) => break,
                Err(_) => {
                    if self.clock.now_ms() < live_until_ms {
                        continue;
                    }
                    let Some(registry) = self.registry.upgrade() else {
                        break;
                    };
                    if registry.release(segment_key, self.generation, &inbox) {
                        break;
                    }
                    continue;
                }
            };

            match command {
                SegmentCommand::Process {
                    request,
                    now_ms,
                    reply,
                } => {
                    live_until_ms = live_until_ms.max(now_ms + request.window_ms);
                    let result = match open_store(&mut store, segment_key).await {
                        Ok(store) => store.process(&request, now_ms).await.map_err(Into::into),
                        Err(e) => Err(e),
                    };
                    let _ = reply.send(result);
                }
                SegmentCommand::Record {
                    request,
                    now_ms,
                    reply,
                } => {
                    live_until_ms = live_until_ms.max(now_ms + request.window_ms);
                    let result = match open_store(&mut store, segment_key).await {
                        Ok(store) => store.record(&request, now_ms).await.map_err(Into::into),
                        Err(e) => Err(e),
                    };
                    let _ = reply.send(result);
                }
                SegmentCommand::State {
                    window_ms,
                    now_ms,
                    reply,
                } => {
                    let result = match open_store(&mut store, segment_key).await {
                        Ok(store) => store.state(window_ms, now_ms).await.map_err(Into::into),
                        Err(e) => Err(e),
                    };
                    let _ = reply.send(result);
                }
                SegmentCommand::Cleanup {
                    older_than_ms,
                    reply,
                } => {
                    let result = match open_store(&mut store, segment_key).await {
                        Ok(store) => store.cleanup(older_than_ms).await.map_err(Into::into),
                        Err(e) => Err(e),
                    };
                    if let Ok((_, 0)) = result {
                        live_until_ms = 0;
                    }
                    let _ = reply.send(result.map(|(removed, _)| removed));
                }
            }
        }

        debug!(segment = %segment_key, generation = self.generation, "Rate limit actor stopped");
    }
}

pub struct AuthoritativeRateLimiter {
    clock: Arc<dyn Clock>,
    idle_timeout: Duration,
    registry: Arc<ActorRegistry>,
}

impl AuthoritativeRateLimiter {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self::with_idle_timeout(clock, DEFAULT_IDLE_TIMEOUT)
    }

    /// Segment actors with no traffic for `idle_timeout` stop once their
    /// windows have drained
    pub fn with_idle_timeout(clock: Arc<dyn Clock>, idle_timeout: Duration) -> Self {
        Self {
            clock,
            idle_timeout,
            registry: Arc::new(ActorRegistry::default()),
        }
    }

    /// Address of the actor owning `segment_key`, spawning it on first use
    fn actor_for(&self, segment_key: &str) -> mpsc::Sender<SegmentCommand> {
        let mut actors = self.registry.actors.lock();
        if let Some(handle) = actors.get(segment_key) {
            if !handle.sender.is_closed() {
                return handle.sender.clone();
            }
        }
        let generation = self.registry.next_generation.fetch_add(1, Ordering::Relaxed);
        let (sender, inbox) = mpsc::channel(MAILBOX_CAPACITY);
        let actor = SegmentActor {
            segment_key: segment_key.to_string(),
            generation,
            clock: self.clock.clone(),
            idle_timeout: self.idle_timeout,
            registry: Arc::downgrade(&self.registry),
        };
        tokio::spawn(actor.run(inbox));
        actors.insert(
            segment_key.to_string(),
            ActorHandle {
                generation,
                sender: sender.clone(),
            },
        );
        sender
    }

    async fn call<T>(
        &self,
        segment_key: &str,
        command: impl FnOnce(Reply<T>) -> SegmentCommand,
    ) -> Result<T, RateLimitError> {
        let (reply, response) = oneshot::channel();
        self.actor_for(segment_key)
            .send(command(reply))
            .await
            .map_err(|_| RateLimitError::ActorUnavailable(segment_key.to_string()))?;
        response
            .await
            .map_err(|_| RateLimitError::ActorUnavailable(segment_key.to_string()))?
    }

    /// Current window for `segment_key` without recording anything
    pub async fn state(
        &self,
        segment_key: &str,
        window_ms: i64,
    ) -> Result<SegmentState, RateLimitError> {
        let now_ms = self.clock.now_ms();
        self.call(segment_key, |reply| SegmentCommand::State {
            window_ms,
            now_ms,
            reply,
        })
        .await
    }

    /// Drops every entry of `segment_key` older than `older_than_ms`
    pub async fn cleanup(&self, segment_key: &str, older_than_ms: i64) -> Result<u64, RateLimitError> {
        self.call(segment_key, |reply| SegmentCommand::Cleanup {
            older_than_ms,
            reply,
        })
        .await
    }

    pub fn active_segments(&self) -> usize {
        self.registry.actors.lock().len()
    }
}

#[async_trait]
impl RateLimiter for AuthoritativeRateLimiter {
    async fn check(&self, request: &RateLimitRequest) -> Result<Decision, RateLimitError> {
        let now_ms = self.clock.now_ms();
        let request = request.clone();
        let segment_key = request.segment_key.clone();
        self.call(&segment_key, |reply| SegmentCommand::Process {
            request,
            now_ms,
            reply,
        })
        .await
    }

    async fn commit(&self, request: &RateLimitRequest) -> Result<(), RateLimitError> {
        let now_ms = self.clock.now_ms();
        let request = request.clone();
        let segment_key = request.segment_key.clone();
        self.call(&segment_key, |reply| SegmentCommand::Record {
            request,
            now_ms,
            reply,
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rate_limit::clock::ManualClock;
    use crate::rate_limit::policy::RateLimitUnit;
    use crate::rate_limit::DecisionStatus;

    const NOW: i64 = 1_700_000_000_000;
    const THIRTY_DAYS_MS: i64 = 30 * 24 * 60 * 60 * 1000;

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

    #[tokio::test]
    async fn hundredth_request_is_rejected() {
        let clock = Arc::new(ManualClock::new(NOW));
        let limiter = AuthoritativeRateLimiter::new(clock.clone());

        for _ in 0..99 {
            let decision = limiter.check(&request(100.0, 1.0, false)).await.unwrap();
            assert_eq!(decision.status, DecisionStatus::Ok);
            clock.advance_ms(1);
        }

        let decision = limiter.check(&request(100.0, 1.0, false)).await.unwrap();
        assert_eq!(decision.status, DecisionStatus::RateLimited);
        assert_eq!(decision.current_usage, 99.0);
        assert_eq!(decision.remaining, 1.0);
    }

    #[tokio::test]
    async fn usage_resets_after_window_elapses() {
        let clock = Arc::new(ManualClock::new(NOW));
        let limiter = AuthoritativeRateLimiter::new(clock.clone());

        assert!(!limiter.check(&request(2.0, 1.0, false)).await.unwrap().is_rate_limited());
        assert!(limiter.check(&request(2.0, 1.0, false)).await.unwrap().is_rate_limited());

        clock.advance_ms(60_000);
        let decision = limiter.check(&request(2.0, 1.0, true)).await.unwrap();
        assert_eq!(decision.current_usage, 0.0);
        assert_eq!(decision.reset_secs, None);
    }

    #[tokio::test]
    async fn check_only_is_idempotent() {
        let limiter = AuthoritativeRateLimiter::new(Arc::new(ManualClock::new(NOW)));
        limiter.check(&request(10.0, 1.0, false)).await.unwrap();

        let first = limiter.check(&request(10.0, 1.0, true)).await.unwrap();
        let second = limiter.check(&request(10.0, 1.0, true)).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(first.current_usage, 1.0);
    }

    #[tokio::test]
    async fn cents_quota_boundary() {
        let clock = Arc::new(ManualClock::new(NOW));
        let limiter = AuthoritativeRateLimiter::new(clock.clone());
        let cents = |cost: f64, check_only: bool| RateLimitRequest {
            segment_key: "org-1:cents:global".to_string(),
            quota: 8500.0,
            window_ms: THIRTY_DAYS_MS,
            unit: RateLimitUnit::Cents,
            cost,
            check_only,
        };

        for _ in 0..85 {
            limiter.commit(&cents(99.0, false)).await.unwrap();
            clock.advance_ms(1_000);
        }

        let rejected = limiter.check(&cents(99.0, true)).await.unwrap();
        assert_eq!(rejected.status, DecisionStatus::RateLimited);
        assert_eq!(rejected.current_usage, 8415.0);

        let admitted = limiter.check(&cents(84.0, true)).await.unwrap();
        assert_eq!(admitted.status, DecisionStatus::Ok);

        let state = limiter.state("org-1:cents:global", THIRTY_DAYS_MS).await.unwrap();
        assert_eq!(state.entry_count, 85);
        assert_eq!(state.current_usage, 8415.0);
        assert_eq!(state.oldest_timestamp_ms, Some(NOW));
    }

    #[tokio::test]
    async fn concurrent_callers_never_pass_the_quota() {
        let limiter = Arc::new(AuthoritativeRateLimiter::new(Arc::new(ManualClock::new(NOW))));

        let handles: Vec<_> = (0..50)
            .map(|_| {
                let limiter = limiter.clone();
                tokio::spawn(async move { limiter.check(&request(10.0, 1.0, false)).await })
            })
            .collect();

        let mut admitted = 0;
        for handle in handles {
            if !handle.await.unwrap().unwrap().is_rate_limited() {
                admitted += 1;
            }
        }
        assert_eq!(admitted, 9);
        assert_eq!(limiter.active_segments(), 1);
    }

    #[tokio::test]
    async fn segments_are_isolated() {
        let limiter = AuthoritativeRateLimiter::new(Arc::new(ManualClock::new(NOW)));
        limiter.check(&request(2.0, 1.0, false)).await.unwrap();

        let mut other = request(2.0, 1.0, false);
        other.segment_key = "org-2:request:global".to_string();
        let decision = limiter.check(&other).await.unwrap();
        assert_eq!(decision.current_usage, 1.0);
        assert_eq!(limiter.active_segments(), 2);
    }

    #[tokio::test]
    async fn cleanup_removes_old_entries() {
        let clock = Arc::new(ManualClock::new(NOW));
        let limiter = AuthoritativeRateLimiter::new(clock.clone());
        limiter.commit(&request(10.0, 1.0, false)).await.unwrap();
        clock.advance_ms(10);
        limiter.commit(&request(10.0, 1.0, false)).await.unwrap();

        let removed = limiter.cleanup("org-1:request:global", NOW + 5).await.unwrap();
        assert_eq!(removed, 1);
        let state = limiter.state("org-1:request:global", 60_000).await.unwrap();
        assert_eq!(state.entry_count, 1);
    }

    #[tokio::test]
    async fn idle_segments_are_reaped_once_their_window_drains() {
        let clock = Arc::new(ManualClock::new(NOW));
        let limiter =
            AuthoritativeRateLimiter::with_idle_timeout(clock.clone(), Duration::from_millis(10));

        for i in 0..200 {
            let mut per_user = request(10.0, 1.0, false);
            per_user.segment_key = format!("org-1:request:user=u{i}");
            limiter.check(&per_user).await.unwrap();
        }
        assert_eq!(limiter.active_segments(), 200);

        clock.advance_ms(24 * 60 * 60 * 1000);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(limiter.active_segments(), 0);
    }

    #[tokio::test]
    async fn idle_segment_inside_its_window_is_kept() {
        let clock = Arc::new(ManualClock::new(NOW));
        let limiter =
            AuthoritativeRateLimiter::with_idle_timeout(clock.clone(), Duration::from_millis(10));
        limiter.check(&request(2.0, 1.0, false)).await.unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(limiter.active_segments(), 1);

        let decision = limiter.check(&request(2.0, 1.0, true)).await.unwrap();
        assert_eq!(decision.current_usage, 1.0);
    }

    #[tokio::test]
    async fn emptied_segment_is_reaped_and_restarts_clean() {
        let clock = Arc::new(ManualClock::new(NOW));
        let limiter =
            AuthoritativeRateLimiter::with_idle_timeout(clock.clone(), Duration::from_millis(10));
        limiter.commit(&request(10.0, 1.0, false)).await.unwrap();

        let removed = limiter.cleanup("org-1:request:global", NOW + 1).await.unwrap();
        assert_eq!(removed, 1);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(limiter.active_segments(), 0);

        let decision = limiter.check(&request(10.0, 1.0, false)).await.unwrap();
        assert_eq!(decision.current_usage, 0.0);
        assert_eq!(limiter.active_segments(), 1);
    }
}
