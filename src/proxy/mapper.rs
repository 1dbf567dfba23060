//! Inbound request mapping
//!
//! Turns the raw HTTP request into a [`ProxyRequest`]. Routes look like
//! `/{provider}/{provider path}`; gateway behaviour is controlled by
//! `Helicone-*` headers.

use crate::domain::types::{BucketSize, EscrowHold, ProviderName, RequestId};
use crate::domain::{CacheDirectives, ProviderTarget, ProxyRequest, RequestFlags};
use crate::proxy::headers::{
    flag, text, CACHE_CONTROL, HELICONE_CACHE_BUCKET_MAX_SIZE, HELICONE_CACHE_ENABLED,
    HELICONE_CACHE_IGNORE_KEYS, HELICONE_CACHE_READ, HELICONE_CACHE_SAVE, HELICONE_CACHE_SEED,
    HELICONE_ESCROW_ID, HELICONE_FALLBACKS, HELICONE_INCREASE_TIMEOUT,
    HELICONE_LLM_SECURITY_ADVANCED, HELICONE_LLM_SECURITY_ENABLED, HELICONE_MODERATIONS_ENABLED,
    HELICONE_PROPERTY_PREFIX, HELICONE_RATE_LIMIT_POLICY, HELICONE_RETRY_ENABLED,
    HELICONE_RETRY_FACTOR, HELICONE_RETRY_MAX_TIMEOUT, HELICONE_RETRY_MIN_TIMEOUT,
    HELICONE_RETRY_NUM, HELICONE_STREAM_FORCE_FORMAT, HELICONE_TOKEN_LIMIT_EXCEPTION_HANDLER,
    HELICONE_USER_ID, X_REQUEST_ID,
};
use crate::proxy::types::MappingError;
use crate::rate_limit::RateLimitPolicy;
use crate::retry::{Backoff, RetryPolicy};
use bytes::Bytes;
use http::{HeaderMap, Method, Uri};
use std::collections::BTreeMap;
use std::str::FromStr;
use std::time::Duration;
use uuid::Uuid;

pub struct RequestMapper;

impl RequestMapper {
    /// Splits `provider/path?query` into a target
    pub fn parse_target(route: &str) -> Result<ProviderTarget, MappingError> {
        let route = route.trim().trim_start_matches('/');
        let (provider, rest) = match route.find(['/', '?']) {
            Some(index) => route.split_at(index),
            None => (route, ""),
        };

        let provider = ProviderName::try_new(provider)
            .map_err(|e| MappingError::InvalidPath(format!("{route}: {e}")))?;
        let path_and_query = if rest.starts_with('?') {
            format!("/{rest}")
        } else {
            rest.to_string()
        };

        Ok(ProviderTarget {
            provider,
            path_and_query,
        })
    }

    pub fn map(
        method: Method,
        uri: &Uri,
        headers: HeaderMap,
        body: Bytes,
    ) -> Result<ProxyRequest, MappingError> {
        let route = uri.path_and_query().map_or(uri.path(), |pq| pq.as_str());
        let target = Self::parse_target(route)?;

        let mut request = ProxyRequest::new(method, target, HeaderMap::new(), body);
        if let Some(id) = text(&headers, X_REQUEST_ID).and_then(|id| Uuid::parse_str(id).ok()) {
            request.request_id = RequestId::new(id);
        }
        request.fallbacks = Self::fallbacks(&headers)?;
        request.rate_limit_policy = Self::rate_limit_policy(&headers)?;
        request.cache = Self::cache_directives(&headers)?;
        request.retry = Self::retry_policy(&headers)?;
        request.user_id = text(&headers, HELICONE_USER_ID).map(str::to_string);
        request.properties = Self::properties(&headers);
        request.flags = RequestFlags {
            stream_force_format: flag(&headers, HELICONE_STREAM_FORCE_FORMAT),
            increase_timeout: flag(&headers, HELICONE_INCREASE_TIMEOUT),
            prompt_security: flag(&headers, HELICONE_LLM_SECURITY_ENABLED),
            prompt_security_advanced: flag(&headers, HELICONE_LLM_SECURITY_ADVANCED),
            moderations: flag(&headers, HELICONE_MODERATIONS_ENABLED),
        };
        request.token_limit_handler = text(&headers, HELICONE_TOKEN_LIMIT_EXCEPTION_HANDLER)
            .map(|value| value.parse().map_err(MappingError::InvalidTokenLimitHandler))
            .transpose()?;
        request.escrow = text(&headers, HELICONE_ESCROW_ID).map(|id| EscrowHold {
            escrow_id: id.to_string(),
        });
        request.is_stream = request
            .body_json()
            .and_then(|body| body.get("stream"))
            .and_then(serde_json::Value::as_bool)
            .unwrap_or(false);
        request.headers = headers;

        Ok(request)
    }

    fn fallbacks(headers: &HeaderMap) -> Result<Vec<ProviderTarget>, MappingError> {
        let Some(raw) = text(headers, HELICONE_FALLBACKS) else {
            return Ok(Vec::new());
        };
        raw.split(',')
            .map(str::trim)
            .filter(|route| !route.is_empty())
            .map(|route| {
                Self::parse_target(route).map_err(|e| MappingError::InvalidFallbacks(e.to_string()))
            })
            .collect()
    }

    fn rate_limit_policy(headers: &HeaderMap) -> Result<Option<RateLimitPolicy>, MappingError> {
        text(headers, HELICONE_RATE_LIMIT_POLICY)
            .map(|raw| raw.parse::<RateLimitPolicy>().map_err(MappingError::from))
            .transpose()
    }

    fn cache_directives(headers: &HeaderMap) -> Result<CacheDirectives, MappingError> {
        let enabled = flag(headers, HELICONE_CACHE_ENABLED);

        let bucket_size = match text(headers, HELICONE_CACHE_BUCKET_MAX_SIZE) {
            Some(raw) => raw
                .parse::<u8>()
                .ok()
                .and_then(|size| BucketSize::try_new(size).ok())
                .ok_or_else(|| MappingError::InvalidBucketSize(raw.to_string()))?,
            None => BucketSize::default(),
        };

        let ignore_keys = text(headers, HELICONE_CACHE_IGNORE_KEYS)
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|key| !key.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        Ok(CacheDirectives {
            read: enabled || flag(headers, HELICONE_CACHE_READ),
            save: enabled || flag(headers, HELICONE_CACHE_SAVE),
            bucket_size,
            seed: text(headers, HELICONE_CACHE_SEED).map(str::to_string),
            ignore_keys,
            cache_control: text(headers, CACHE_CONTROL.as_str()).map(str::to_string),
        })
    }

    fn retry_policy(headers: &HeaderMap) -> Result<Option<RetryPolicy>, MappingError> {
        if !flag(headers, HELICONE_RETRY_ENABLED) {
            return Ok(None);
        }

        let defaults = RetryPolicy::default();
        let retries = numeric(headers, HELICONE_RETRY_NUM, "retries")?.unwrap_or(defaults.retries);
        let factor = numeric(headers, HELICONE_RETRY_FACTOR, "factor")?
            .unwrap_or(defaults.backoff.factor);
        let min_delay = numeric(headers, HELICONE_RETRY_MIN_TIMEOUT, "min_timeout")?
            .map_or(defaults.backoff.min_delay, Duration::from_millis);
        let max_delay = numeric(headers, HELICONE_RETRY_MAX_TIMEOUT, "max_timeout")?
            .map_or(defaults.backoff.max_delay, Duration::from_millis);

        if !factor.is_finite() || factor < 1.0 {
            return Err(MappingError::InvalidRetry {
                field: "factor",
                value: factor.to_string(),
            });
        }

        Ok(Some(RetryPolicy {
            retries,
            backoff: Backoff {
                min_delay,
                max_delay: max_delay.max(min_delay),
                factor,
                jitter: defaults.backoff.jitter,
            },
        }))
    }

    fn properties(headers: &HeaderMap) -> BTreeMap<String, String> {
        headers
            .iter()
            .filter_map(|(name, value)| {
                let property = name.as_str().strip_prefix(HELICONE_PROPERTY_PREFIX)?;
                let value = value.to_str().ok()?;
                Some((property.to_string(), value.to_string()))
            })
            .collect()
    }
}

fn numeric<T: FromStr>(
    headers: &HeaderMap,
    name: &str,
    field: &'static str,
) -> Result<Option<T>, MappingError> {
    text(headers, name)
        .map(|raw| {
            raw.parse::<T>().map_err(|_| MappingError::InvalidRetry {
                field,
                value: raw.to_string(),
            })
        })
        .transpose()
}
