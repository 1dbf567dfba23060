//! Content-addressed cache identity
//!
//! Two requests share a cache entry when their seed, URL, normalized body and
//! allow-listed headers match.

use crate::domain::types::OrganizationId;
use crate::domain::ProxyRequest;
use http::header::AUTHORIZATION;
use http::HeaderMap;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

const GOOGLE_OAUTH_PREFIX: &str = "bearer ya29.";

/// Request fields that decide which cache entry serves a request
#[derive(Debug, Clone, Copy)]
pub struct CacheIdentity<'a> {
    pub seed: Option<&'a str>,
    pub url: &'a str,
    pub body: &'a [u8],
    pub headers: &'a HeaderMap,
    pub ignore_keys: &'a [String],
}

impl<'a> CacheIdentity<'a> {
    /// Identity of `request`; `url` is its rendered target
    pub fn for_request(request: &'a ProxyRequest, url: &'a str) -> Self {
        Self {
            seed: request.cache.seed.as_deref(),
            url,
            body: &request.body,
            headers: &request.headers,
            ignore_keys: &request.cache.ignore_keys,
        }
    }
}

/// Body text with the ignored top-level JSON keys removed.
///
/// Non-JSON bodies (and JSON that is not an object) are used verbatim.
pub fn normalize_body(body: &[u8], ignore_keys: &[String]) -> String {
    match serde_json::from_slice::<Value>(body) {
        Ok(Value::Object(object)) => {
            let kept: BTreeMap<String, Value> = object
                .into_iter()
                .filter(|(key, _)| !ignore_keys.contains(key))
                .collect();
            serde_json::to_string(&kept).unwrap_or_default()
        }
        _ => String::from_utf8_lossy(body).into_owned(),
    }
}

fn is_google_oauth(value: &str) -> bool {
    value
        .get(..GOOGLE_OAUTH_PREFIX.len())
        .is_some_and(|prefix| prefix.eq_ignore_ascii_case(GOOGLE_OAUTH_PREFIX))
}

/// Serialized allow-listed headers: cache control headers plus the
/// credential, unless it is a short-lived Google OAuth token.
pub fn cache_headers(headers: &HeaderMap) -> String {
    let mut selected = BTreeMap::new();
    for (name, value) in headers {
        let Ok(value) = value.to_str() else {
            continue;
        };
        let name = name.as_str();
        let allowed = name.starts_with("helicone-cache")
            || (name == AUTHORIZATION.as_str() && !is_google_oauth(value));
        if allowed {
            selected.insert(name.to_string(), value.to_string());
        }
    }
    serde_json::to_string(&selected).unwrap_or_default()
}

/// Hex digest for one bucket slot of `identity`
pub fn cache_key(identity: &CacheIdentity<'_>, slot: usize) -> String {
    let mut hasher = Sha256::new();
    if let Some(seed) = identity.seed {
        hasher.update(seed.as_bytes());
    }
    hasher.update(identity.url.as_bytes());
    hasher.update(normalize_body(identity.body, identity.ignore_keys).as_bytes());
    hasher.update(cache_headers(identity.headers).as_bytes());
    if slot >= 1 {
        hasher.update(slot.to_string().as_bytes());
    }
    hex::encode(hasher.finalize())
}

/// KV key of one slot, namespaced by organization
pub fn storage_key(organization_id: &OrganizationId, hash: &str) -> String {
    format!("cache:{}:{hash}", organization_id.as_ref())
}
