//! Type definitions for the proxy module

use crate::rate_limit::{PolicyParseError, RateLimitError};
use bytes::Bytes;
use futures_util::stream::BoxStream;
use nutype::nutype;
#[allow(unused_imports)] // These are used by nutype derive macros
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Error type carried through response body streams
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Response body as a stream of chunks
pub type BodyStream = BoxStream<'static, Result<Bytes, BoxError>>;

/// Absolute provider base URL
#[nutype(
    sanitize(trim),
    validate(predicate = |s: &str| s.starts_with("http://") || s.starts_with("https://")),
    derive(Clone, Debug, Display, Deserialize, Serialize, TryFrom, AsRef, PartialEq, Eq),
)]
pub struct TargetUrl(String);

// ========== Constants ==========

/// Default path when none is specified
pub const DEFAULT_PATH: &str = "/";

/// Chunks shorter than this are merged forward when force-formatting streams
pub const FORCE_FORMAT_MIN_CHUNK: usize = 50;

/// Statuses worth another attempt
pub const RETRYABLE_STATUSES: [u16; 3] = [429, 500, 522];

/// Proxy configuration
#[derive(Clone, Debug)]
pub struct ProxyConfig {
    /// Maximum request size in bytes
    pub max_request_size: usize,
    /// Longest a provider may go without sending data
    pub request_timeout: Duration,
    /// Same, when the client asks for a longer timeout
    pub increased_timeout: Duration,
    /// How long finalization waits for a response stream to end
    pub stream_timeout: Duration,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            max_request_size: 10 * 1024 * 1024,
            request_timeout: Duration::from_secs(600),
            increased_timeout: Duration::from_secs(30 * 60),
            stream_timeout: Duration::from_secs(30 * 60),
        }
    }
}

impl From<&crate::config::ProxySettings> for ProxyConfig {
    fn from(settings: &crate::config::ProxySettings) -> Self {
        Self {
            max_request_size: settings.max_request_size,
            request_timeout: settings.request_timeout(),
            increased_timeout: settings.increased_timeout(),
            stream_timeout: settings.stream_timeout(),
        }
    }
}

/// Inbound request could not be turned into a pipeline request
#[derive(Error, Debug)]
pub enum MappingError {
    #[error("Invalid rate limit policy: {0}")]
    InvalidPolicy(#[from] PolicyParseError),

    #[error("Invalid cache bucket size: {0}")]
    InvalidBucketSize(String),

    #[error("Invalid retry setting {field}: {value}")]
    InvalidRetry { field: &'static str, value: String },

    #[error("Invalid token limit exception handler: {0}")]
    InvalidTokenLimitHandler(String),

    #[error("Invalid provider path: {0}")]
    InvalidPath(String),

    #[error("Invalid fallback list: {0}")]
    InvalidFallbacks(String),
}

/// Errors that can occur in the proxy
#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("Request too large: {size} bytes (max: {max_size} bytes)")]
    RequestTooLarge { size: usize, max_size: usize },

    #[error("Unauthorized")]
    Unauthorized,

    #[error("Could not read request body: {0}")]
    InvalidBody(String),

    #[error("Invalid target URL: {0}")]
    InvalidTargetUrl(String),

    #[error("Unknown provider: {0}")]
    UnknownProvider(String),

    #[error("Request mapping failed: {0}")]
    Mapping(#[from] MappingError),

    #[error("Rate limit admission failed: {0}")]
    Admission(#[from] RateLimitError),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type for proxy operations
pub type ProxyResult<T> = Result<T, ProxyError>;
