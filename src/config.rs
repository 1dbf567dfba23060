use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::collections::HashMap;
use std::env;
use std::time::Duration;

#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    pub application: ApplicationSettings,
    pub proxy: ProxySettings,
    pub cache: CacheSettings,
    pub storage: StorageSettings,
    pub rate_limit: RateLimitSettings,
    pub organization: OrganizationSettings,
    #[serde(default)]
    pub providers: HashMap<String, ProviderSettings>,
    #[serde(default)]
    pub policies: Vec<PolicySettings>,
    pub logging: LoggingSettings,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ApplicationSettings {
    pub host: String,
    pub port: u16,
    pub environment: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ProxySettings {
    pub max_request_size: usize,
    pub request_timeout_secs: u64,
    pub increased_timeout_secs: u64,
    pub stream_timeout_secs: u64,
}

impl ProxySettings {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn increased_timeout(&self) -> Duration {
        Duration::from_secs(self.increased_timeout_secs)
    }

    pub fn stream_timeout(&self) -> Duration {
        Duration::from_secs(self.stream_timeout_secs)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct CacheSettings {
    pub read_timeout_ms: u64,
    pub write_attempts: u32,
    pub default_ttl_secs: u64,
    pub max_ttl_secs: u64,
}

/// Process-local KV store shared by the cache and the counter limiter
#[derive(Debug, Deserialize, Clone)]
pub struct StorageSettings {
    pub max_entries: u64,
}

/// Which sliding-window backend enforces rate-limit policies
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RateLimitStrategy {
    /// Exact, one single-writer actor per segment
    Authoritative,
    /// Approximate, KV-backed and fail-open
    Counter,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RateLimitSettings {
    pub strategy: RateLimitStrategy,
    pub kv_write_attempts: u32,
    pub actor_idle_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct OrganizationSettings {
    pub id: String,
    #[serde(default)]
    pub api_keys: Vec<String>,
    pub cache_enabled: bool,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ProviderSettings {
    pub base_url: String,
    /// Header carrying a platform-held provider key, e.g. `authorization`
    pub auth_header: Option<String>,
    pub auth_value: Option<String>,
    #[serde(default)]
    pub extra_headers: HashMap<String, String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct PolicySettings {
    pub quota: f64,
    pub window_seconds: u64,
    pub unit: Option<String>,
    pub segment: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingSettings {
    pub level: String,
    pub format: String,
}

impl Settings {
    pub fn new() -> Result<Self, ConfigError> {
        let environment = env::var("ENVIRONMENT").unwrap_or_else(|_| "development".to_string());

        let config = Config::builder()
            // Start with default values
            .set_default("application.host", "0.0.0.0")?
            .set_default("application.port", 8787)?
            .set_default("application.environment", environment.clone())?
            .set_default("proxy.max_request_size", 10 * 1024 * 1024)?
            .set_default("proxy.request_timeout_secs", 600)?
            .set_default("proxy.increased_timeout_secs", 1800)?
            .set_default("proxy.stream_timeout_secs", 1800)?
            .set_default("cache.read_timeout_ms", 2000)?
            .set_default("cache.write_attempts", 5)?
            .set_default("cache.default_ttl_secs", 7 * 24 * 60 * 60)?
            .set_default("cache.max_ttl_secs", 365 * 24 * 60 * 60)?
            .set_default("storage.max_entries", 100_000)?
            .set_default("rate_limit.strategy", "authoritative")?
            .set_default("rate_limit.kv_write_attempts", 3)?
            .set_default("rate_limit.actor_idle_secs", 300)?
            .set_default("organization.id", "default-org")?
            .set_default("organization.cache_enabled", true)?
            .set_default("logging.level", "info")?
            .set_default("logging.format", "json")?
            // Add configuration file if it exists
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name(&format!("config/{environment}")).required(false))
            .add_source(File::with_name("config/local").required(false))
            // Add environment variables with prefix
            .add_source(Environment::with_prefix("LLM_RELAY").separator("__"))
            .build()?;

        config.try_deserialize()
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.application.host, self.application.port)
    }
}
