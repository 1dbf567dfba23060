use super::{KvError, KvStore};
use async_trait::async_trait;
use moka::future::Cache;
use moka::Expiry;
use std::time::{Duration, Instant};

/// Entry count the store holds before evicting least-recently-used keys
pub const DEFAULT_MAX_ENTRIES: u64 = 100_000;

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    ttl: Duration,
    expires_at: Instant,
}

/// Each entry lives for the TTL it was written with
struct PerEntryTtl;

impl Expiry<String, Entry> for PerEntryTtl {
    fn expire_after_create(
        &self,
        _key: &String,
        entry: &Entry,
        _created_at: Instant,
    ) -> Option<Duration> {
        Some(entry.ttl)
    }

    fn expire_after_update(
        &self,
        _key: &String,
        entry: &Entry,
        _updated_at: Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        Some(entry.ttl)
    }
}

/// Process-local, size-bounded TTL store
pub struct InMemoryKv {
    entries: Cache<String, Entry>,
}

impl Default for InMemoryKv {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_MAX_ENTRIES)
    }
}

impl InMemoryKv {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(max_entries: u64) -> Self {
        Self {
            entries: Cache::builder()
                .max_capacity(max_entries)
                .expire_after(PerEntryTtl)
                .build(),
        }
    }

    /// Time left before `key` expires, if it is present
    pub async fn expires_in(&self, key: &str) -> Option<Duration> {
        self.entries
            .get(key)
            .await
            .and_then(|entry| entry.expires_at.checked_duration_since(Instant::now()))
    }

    /// Live entries, after expired and evicted ones are reclaimed
    pub async fn len(&self) -> u64 {
        self.entries.run_pending_tasks().await;
        self.entries.entry_count()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl KvStore for InMemoryKv {
    async fn get(&self, key: &str) -> Result<Option<String>, KvError> {
        Ok(self.entries.get(key).await.map(|entry| entry.value))
    }

    async fn put(&self, key: &str, value: String, ttl: Duration) -> Result<(), KvError> {
        if ttl.is_zero() {
            return Err(KvError::InvalidTtl(ttl));
        }
        let expires_at = Instant::now()
            .checked_add(ttl)
            .ok_or(KvError::InvalidTtl(ttl))?;
        self.entries
            .insert(
                key.to_string(),
                Entry {
                    value,
                    ttl,
                    expires_at,
                },
            )
            .await;
        Ok(())
    }
}
