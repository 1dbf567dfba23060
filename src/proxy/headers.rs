//! HTTP header constants for the gateway
//!
//! Header names are lowercase so they can be used directly as
//! `HeaderName`s; HTTP header matching is case-insensitive.

use ::http::header;

/// Header name for request ID used for tracing and correlation
pub const X_REQUEST_ID: &str = "x-request-id";

/// Prefix of every gateway control header; stripped before forwarding
pub const HELICONE_PREFIX: &str = "helicone-";

/// Gateway credential presented by the client
pub const HELICONE_AUTH: &str = "helicone-auth";

// Cache control
pub const HELICONE_CACHE_ENABLED: &str = "helicone-cache-enabled";
pub const HELICONE_CACHE_SAVE: &str = "helicone-cache-save";
pub const HELICONE_CACHE_READ: &str = "helicone-cache-read";
pub const HELICONE_CACHE_BUCKET_MAX_SIZE: &str = "helicone-cache-bucket-max-size";
pub const HELICONE_CACHE_SEED: &str = "helicone-cache-seed";
pub const HELICONE_CACHE_IGNORE_KEYS: &str = "helicone-cache-ignore-keys";

// Cache response markers
pub const HELICONE_CACHE: &str = "helicone-cache";
pub const HELICONE_CACHE_BUCKET_IDX: &str = "helicone-cache-bucket-idx";
pub const HELICONE_CACHE_LATENCY: &str = "helicone-cache-latency";

// Rate limiting
pub const HELICONE_RATE_LIMIT_POLICY: &str = "helicone-ratelimit-policy";
pub const HELICONE_RATE_LIMIT_LIMIT: &str = "helicone-ratelimit-limit";
pub const HELICONE_RATE_LIMIT_REMAINING: &str = "helicone-ratelimit-remaining";
pub const HELICONE_RATE_LIMIT_RESET: &str = "helicone-ratelimit-reset";

// Retries
pub const HELICONE_RETRY_ENABLED: &str = "helicone-retry-enabled";
pub const HELICONE_RETRY_NUM: &str = "helicone-retry-num";
pub const HELICONE_RETRY_FACTOR: &str = "helicone-retry-factor";
pub const HELICONE_RETRY_MIN_TIMEOUT: &str = "helicone-retry-min-timeout";
pub const HELICONE_RETRY_MAX_TIMEOUT: &str = "helicone-retry-max-timeout";

// Request options
pub const HELICONE_USER_ID: &str = "helicone-user-id";
pub const HELICONE_PROPERTY_PREFIX: &str = "helicone-property-";
pub const HELICONE_FALLBACKS: &str = "helicone-fallbacks";
pub const HELICONE_STREAM_FORCE_FORMAT: &str = "helicone-stream-force-format";
pub const HELICONE_INCREASE_TIMEOUT: &str = "helicone-increase-timeout";
pub const HELICONE_LLM_SECURITY_ENABLED: &str = "helicone-llm-security-enabled";
pub const HELICONE_LLM_SECURITY_ADVANCED: &str = "helicone-llm-security-advanced";
pub const HELICONE_MODERATIONS_ENABLED: &str = "helicone-moderations-enabled";
pub const HELICONE_TOKEN_LIMIT_EXCEPTION_HANDLER: &str = "helicone-token-limit-exception-handler";
pub const HELICONE_ESCROW_ID: &str = "helicone-escrow-id";

// Response annotations
pub const HELICONE_STATUS: &str = "helicone-status";
pub const HELICONE_ID: &str = "helicone-id";
pub const X_HELICONE_ERROR: &str = "x-helicone-error";
pub const X_HELICONE_ERROR_TYPE: &str = "x-helicone-error-type";

/// Authorization header prefix for bearer tokens
pub const BEARER_PREFIX: &str = "Bearer ";

/// Standard header re-exports for convenience
pub use header::{
    ACCEPT_ENCODING, AUTHORIZATION, CACHE_CONTROL, CONNECTION, CONTENT_LENGTH, CONTENT_TYPE,
    HOST, TRANSFER_ENCODING,
};

/// Well-known paths
pub mod paths {
    /// Health check endpoint path
    pub const HEALTH: &str = "/health";
}

/// Common content types
pub mod content_types {
    pub const APPLICATION_JSON: &str = "application/json";
    pub const TEXT_EVENT_STREAM: &str = "text/event-stream";
}

/// Header value parsed as a boolean flag (`"true"`, any case)
pub fn flag(headers: &::http::HeaderMap, name: &str) -> bool {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.trim().eq_ignore_ascii_case("true"))
}

/// Header value as trimmed text, if present and valid
pub fn text<'a>(headers: &'a ::http::HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
}
