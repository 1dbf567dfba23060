//! Bucketed response cache
//!
//! Each request identity owns up to [`MAX_BUCKET_SIZE`] slots. A read only
//! hits once every slot is filled, then serves one at random; until then the
//! request goes upstream so its response can fill the next free slot.
//!
//! [`MAX_BUCKET_SIZE`]: crate::domain::types::MAX_BUCKET_SIZE

pub mod control;
pub mod key;

pub use control::ttl_from_cache_control;
pub use key::{cache_headers, cache_key, normalize_body, storage_key, CacheIdentity};

use crate::config::CacheSettings;
use crate::domain::types::{BucketSize, OrganizationId};
use crate::proxy::headers::{HELICONE_CACHE, HELICONE_CACHE_BUCKET_IDX, HELICONE_CACHE_LATENCY};
use crate::retry::{retry_with_backoff, Backoff};
use crate::storage::{KvError, KvStore};
use bytes::Bytes;
use futures_util::future::join_all;
use http::{HeaderMap, HeaderName, HeaderValue};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, instrument, warn};

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("Cache store error: {0}")]
    Kv(#[from] KvError),

    #[error("Corrupt cache entry: {0}")]
    Corrupt(#[from] serde_json::Error),

    #[error("Cache read timed out after {0:?}")]
    Timeout(Duration),
}

/// One stored response
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheSlot {
    pub headers: BTreeMap<String, String>,
    /// Upstream latency of the original call in milliseconds
    pub latency: u64,
    pub body: Vec<String>,
}

impl CacheSlot {
    pub fn from_response(headers: &HeaderMap, latency: u64, body: Vec<String>) -> Self {
        let headers = headers
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|value| (name.as_str().to_string(), value.to_string()))
            })
            .collect();
        Self {
            headers,
            latency,
            body,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheHit {
    pub bucket_index: usize,
    pub slot: CacheSlot,
}

impl CacheHit {
    /// Stored headers plus the `Helicone-Cache*` hit markers
    pub fn response_headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        for (name, value) in &self.slot.headers {
            if let (Ok(name), Ok(value)) = (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(value),
            ) {
                headers.insert(name, value);
            }
        }
        headers.insert(HELICONE_CACHE, HeaderValue::from_static("HIT"));
        headers.insert(HELICONE_CACHE_BUCKET_IDX, HeaderValue::from(self.bucket_index));
        headers.insert(HELICONE_CACHE_LATENCY, HeaderValue::from(self.slot.latency));
        headers
    }

    pub fn body_chunks(&self) -> Vec<Bytes> {
        self.slot
            .body
            .iter()
            .map(|chunk| Bytes::from(chunk.clone()))
            .collect()
    }
}

#[derive(Debug, Clone)]
pub struct CacheEngineConfig {
    pub read_timeout: Duration,
    pub write_attempts: u32,
    pub default_ttl: Duration,
    pub max_ttl: Duration,
    pub backoff: Backoff,
}

impl From<&CacheSettings> for CacheEngineConfig {
    fn from(settings: &CacheSettings) -> Self {
        Self {
            read_timeout: Duration::from_millis(settings.read_timeout_ms),
            write_attempts: settings.write_attempts,
            default_ttl: Duration::from_secs(settings.default_ttl_secs),
            max_ttl: Duration::from_secs(settings.max_ttl_secs),
            backoff: Backoff::storage(),
        }
    }
}

pub struct CacheEngine {
    kv: Arc<dyn KvStore>,
    config: CacheEngineConfig,
}

impl CacheEngine {
    pub fn new(kv: Arc<dyn KvStore>, config: CacheEngineConfig) -> Self {
        Self { kv, config }
    }

    fn slot_keys(
        organization_id: &OrganizationId,
        identity: &CacheIdentity<'_>,
        bucket_size: BucketSize,
    ) -> Vec<String> {
        (0..bucket_size.slots())
            .map(|slot| storage_key(organization_id, &cache_key(identity, slot)))
            .collect()
    }

    async fn fetch_slots(&self, keys: &[String]) -> Result<Vec<Option<String>>, CacheError> {
        let reads = join_all(keys.iter().map(|key| self.kv.get(key)));
        let results = tokio::time::timeout(self.config.read_timeout, reads)
            .await
            .map_err(|_| CacheError::Timeout(self.config.read_timeout))?;
        results
            .into_iter()
            .map(|result| result.map_err(CacheError::from))
            .collect()
    }

    async fn try_read(
        &self,
        organization_id: &OrganizationId,
        identity: &CacheIdentity<'_>,
        bucket_size: BucketSize,
    ) -> Result<Option<CacheHit>, CacheError> {
        let keys = Self::slot_keys(organization_id, identity, bucket_size);
        let mut slots = Vec::with_capacity(keys.len());
        for raw in self.fetch_slots(&keys).await? {
            match raw {
                Some(raw) => slots.push(serde_json::from_str::<CacheSlot>(&raw)?),
                None => return Ok(None),
            }
        }
        if slots.is_empty() {
            return Ok(None);
        }

        let bucket_index = rand::thread_rng().gen_range(0..slots.len());
        Ok(Some(CacheHit {
            bucket_index,
            slot: slots.swap_remove(bucket_index),
        }))
    }

    /// Serves a cached response only when every slot of the bucket is filled.
    ///
    /// Store errors, corrupt entries and timeouts are misses.
    #[instrument(
        skip(self, organization_id, identity),
        fields(org_id = %organization_id, url = identity.url)
    )]
    pub async fn read(
        &self,
        organization_id: &OrganizationId,
        identity: &CacheIdentity<'_>,
        bucket_size: BucketSize,
    ) -> Option<CacheHit> {
        match self.try_read(organization_id, identity, bucket_size).await {
            Ok(hit) => {
                debug!(hit = hit.is_some(), "Cache lookup finished");
                hit
            }
            Err(e) => {
                warn!(error = %e, "Cache read failed, treating as miss");
                None
            }
        }
    }

    /// Stores `slot` in the first free slot of the bucket.
    ///
    /// Returns `false` when the bucket is already full.
    #[instrument(
        skip(self, organization_id, identity, slot),
        fields(org_id = %organization_id, url = identity.url)
    )]
    pub async fn write(
        &self,
        organization_id: &OrganizationId,
        identity: &CacheIdentity<'_>,
        bucket_size: BucketSize,
        cache_control: Option<&str>,
        slot: &CacheSlot,
    ) -> Result<bool, CacheError> {
        let ttl = ttl_from_cache_control(cache_control, self.config.default_ttl, self.config.max_ttl);
        if ttl.is_zero() {
            debug!("Response is not cacheable for any time, skipping write");
            return Ok(false);
        }

        let keys = Self::slot_keys(organization_id, identity, bucket_size);
        let existing = self.fetch_slots(&keys).await?;
        let Some(free) = existing.iter().position(Option::is_none) else {
            debug!("Cache bucket full, skipping write");
            return Ok(false);
        };

        let payload = serde_json::to_string(slot)?;
        let key = &keys[free];

        retry_with_backoff(self.config.write_attempts, &self.config.backoff, |_| {
            self.kv.put(key, payload.clone(), ttl)
        })
        .await?;

        debug!(bucket_index = free, ttl_secs = ttl.as_secs(), "Cached response");
        Ok(true)
    }
}
