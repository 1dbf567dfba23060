//! Snapshot of one inbound call as seen by the pipeline

use super::types::{BucketSize, EscrowHold, ProviderName, RequestId};
use crate::rate_limit::RateLimitPolicy;
use crate::retry::RetryPolicy;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use http::{HeaderMap, Method};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

/// Provider plus path and query the call is forwarded to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderTarget {
    pub provider: ProviderName,
    /// Path and query relative to the provider base URL, starting with `/`
    pub path_and_query: String,
}

impl ProviderTarget {
    pub fn path(&self) -> &str {
        self.path_and_query
            .split_once('?')
            .map_or(self.path_and_query.as_str(), |(path, _)| path)
    }
}

impl fmt::Display for ProviderTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.provider, self.path_and_query)
    }
}

/// Client cache directives
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CacheDirectives {
    pub read: bool,
    pub save: bool,
    pub bucket_size: BucketSize,
    pub seed: Option<String>,
    pub ignore_keys: Vec<String>,
    pub cache_control: Option<String>,
}

/// Optional per-request behaviours switched on by control headers
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RequestFlags {
    pub stream_force_format: bool,
    pub increase_timeout: bool,
    pub prompt_security: bool,
    pub prompt_security_advanced: bool,
    pub moderations: bool,
}

/// How the client wants context-window overflows handled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TokenLimitHandler {
    Truncate,
    MiddleOut,
    Fallback,
}

impl FromStr for TokenLimitHandler {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "truncate" => Ok(Self::Truncate),
            "middle-out" => Ok(Self::MiddleOut),
            "fallback" => Ok(Self::Fallback),
            other => Err(other.to_string()),
        }
    }
}

/// Immutable view of an inbound call.
///
/// Built once by the inbound mapper. The only value set afterwards is the
/// screening verdict, which the log record needs.
#[derive(Debug, Clone)]
pub struct ProxyRequest {
    pub request_id: RequestId,
    pub method: Method,
    pub target: ProviderTarget,
    /// Tried in order when the primary target keeps failing
    pub fallbacks: Vec<ProviderTarget>,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub rate_limit_policy: Option<RateLimitPolicy>,
    pub cache: CacheDirectives,
    pub retry: Option<RetryPolicy>,
    pub is_stream: bool,
    pub start_time: DateTime<Utc>,
    pub user_id: Option<String>,
    /// Custom properties, keyed by lowercase name
    pub properties: BTreeMap<String, String>,
    pub flags: RequestFlags,
    pub token_limit_handler: Option<TokenLimitHandler>,
    pub escrow: Option<EscrowHold>,
    parsed_body: OnceLock<Option<Value>>,
    threat: OnceLock<bool>,
}

impl ProxyRequest {
    pub fn new(method: Method, target: ProviderTarget, headers: HeaderMap, body: Bytes) -> Self {
        Self {
            request_id: RequestId::generate(),
            method,
            target,
            fallbacks: Vec::new(),
            headers,
            body,
            rate_limit_policy: None,
            cache: CacheDirectives::default(),
            retry: None,
            is_stream: false,
            start_time: Utc::now(),
            user_id: None,
            properties: BTreeMap::new(),
            flags: RequestFlags::default(),
            token_limit_handler: None,
            escrow: None,
            parsed_body: OnceLock::new(),
            threat: OnceLock::new(),
        }
    }

    /// Body as JSON, parsed on first use
    pub fn body_json(&self) -> Option<&Value> {
        self.parsed_body
            .get_or_init(|| serde_json::from_slice(&self.body).ok())
            .as_ref()
    }

    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn model(&self) -> Option<&str> {
        self.body_json()?.get("model")?.as_str()
    }

    /// Stores the screening verdict; later calls are ignored
    pub fn record_threat(&self, threat: bool) {
        let _ = self.threat.set(threat);
    }

    pub fn threat(&self) -> Option<bool> {
        self.threat.get().copied()
    }

    pub fn is_chat_completion(&self) -> bool {
        self.target.path().ends_with("/chat/completions")
    }

    /// Content of the last message when it is a user message with plain text
    pub fn last_user_message(&self) -> Option<&str> {
        let last = self.body_json()?.get("messages")?.as_array()?.last()?;
        if last.get("role")?.as_str()? != "user" {
            return None;
        }
        last.get("content")?.as_str()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(path: &str, body: &str) -> ProxyRequest {
        ProxyRequest::new(
            Method::POST,
            ProviderTarget {
                provider: ProviderName::try_new("openai").unwrap(),
                path_and_query: path.to_string(),
            },
            HeaderMap::new(),
            Bytes::from(body.to_string()),
        )
    }

    #[test]
    fn reads_model_and_last_user_message() {
        let req = request(
            "/v1/chat/completions",
            r#"{"model":"gpt-4o","messages":[{"role":"system","content":"s"},{"role":"user","content":"hi"}]}"#,
        );
        assert_eq!(req.model(), Some("gpt-4o"));
        assert_eq!(req.last_user_message(), Some("hi"));
        assert!(req.is_chat_completion());
    }

    #[test]
    fn assistant_or_structured_last_message_is_not_screened() {
        let req = request(
            "/v1/chat/completions",
            r#"{"messages":[{"role":"user","content":"hi"},{"role":"assistant","content":"yo"}]}"#,
        );
        assert_eq!(req.last_user_message(), None);

        let req = request(
            "/v1/chat/completions",
            r#"{"messages":[{"role":"user","content":[{"type":"text","text":"hi"}]}]}"#,
        );
        assert_eq!(req.last_user_message(), None);
    }

    #[test]
    fn non_json_body_has_no_model() {
        let req = request("/v1/completions?x=1", "plain");
        assert_eq!(req.model(), None);
        assert_eq!(req.body_text(), "plain");
        assert_eq!(req.target.path(), "/v1/completions");
        assert!(!req.is_chat_completion());
    }

    #[test]
    fn threat_verdict_is_set_once() {
        let req = request("/v1/chat/completions", "{}");
        assert_eq!(req.threat(), None);
        req.record_threat(true);
        req.record_threat(false);
        assert_eq!(req.threat(), Some(true));
    }

    #[test]
    fn token_limit_handler_parses() {
        assert_eq!(
            "middle-out".parse::<TokenLimitHandler>(),
            Ok(TokenLimitHandler::MiddleOut)
        );
        assert_eq!(
            "Truncate".parse::<TokenLimitHandler>(),
            Ok(TokenLimitHandler::Truncate)
        );
        assert!("drop".parse::<TokenLimitHandler>().is_err());
    }
}
