//! Key-value storage consumed by the approximate rate limiter and the cache
//!
//! Values are opaque strings with a time-to-live. Implementations are free
//! to be eventually consistent; callers tolerate stale reads.

pub mod kv;

pub use kv::InMemoryKv;

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum KvError {
    #[error("KV store unavailable: {0}")]
    Unavailable(String),

    #[error("KV operation timed out")]
    Timeout,

    #[error("Invalid TTL: {0:?}")]
    InvalidTtl(Duration),
}

#[async_trait]
pub trait KvStore: Send + Sync + 'static {
    async fn get(&self, key: &str) -> Result<Option<String>, KvError>;

    async fn put(&self, key: &str, value: String, ttl: Duration) -> Result<(), KvError>;
}
