use clap::Parser;
use envconfig::Envconfig;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use validator::Validate;

use crate::endpoints::EndpointCatalog;
use crate::error::GatewayError;
use crate::rate_limiter::RateLimiterConfig;
use crate::upstream::RetryPolicy;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read environment: {0}")]
    Env(#[from] envconfig::Error),

    #[error("invalid configuration: {0}")]
    Invalid(#[from] validator::ValidationErrors),

    #[error("failed to initialize: {0}")]
    Init(#[from] GatewayError),
}

/// Command-line overrides applied on top of the environment.
#[derive(Debug, Default, Parser)]
#[command(name = "matchgate", version, about = "Rate-limited caching gateway")]
pub struct Cli {
    /// Address to listen on
    #[arg(long)]
    pub bind: Option<SocketAddr>,

    /// Upstream API base URL
    #[arg(long)]
    pub upstream: Option<String>,

    /// JSON endpoint catalog replacing the built-in one
    #[arg(long)]
    pub catalog: Option<PathBuf>,
}

#[derive(Debug, Envconfig, Validate, Clone)]
pub struct Config {
    /// Server bind address
    #[envconfig(from = "BIND_ADDR", default = "127.0.0.1:3000")]
    pub bind_addr: SocketAddr,

    #[envconfig(from = "UPSTREAM_BASE_URL", default = "https://api.gotinder.com")]
    #[validate(url)]
    pub upstream_base_url: String,

    #[envconfig(from = "UPSTREAM_TIMEOUT_MS", default = "10000")]
    #[validate(range(min = 1, max = 300000))]
    pub upstream_timeout_ms: u64,

    #[envconfig(from = "UPSTREAM_MAX_RETRIES", default = "3")]
    #[validate(range(max = 10))]
    pub upstream_max_retries: u32,

    #[envconfig(from = "UPSTREAM_RETRY_BASE_DELAY_MS", default = "100")]
    #[validate(range(min = 1, max = 60000))]
    pub upstream_retry_base_delay_ms: u64,

    /// Requests admitted per global window
    #[envconfig(from = "GLOBAL_RATE_LIMIT", default = "100")]
    #[validate(range(min = 1))]
    pub global_rate_limit: u64,

    #[envconfig(from = "GLOBAL_RATE_WINDOW_MS", default = "60000")]
    #[validate(range(min = 1))]
    pub global_rate_window_ms: u64,

    #[envconfig(from = "CACHE_TTL_SECS", default = "300")]
    #[validate(range(min = 1))]
    pub cache_ttl_secs: u64,

    #[envconfig(from = "CACHE_SWEEP_INTERVAL_SECS", default = "60")]
    #[validate(range(min = 1))]
    pub cache_sweep_interval_secs: u64,

    #[envconfig(from = "TOKEN_TTL_SECS", default = "86400")]
    #[validate(range(min = 1))]
    pub token_ttl_secs: u64,

    #[envconfig(from = "MAX_BODY_BYTES", default = "1048576")]
    #[validate(range(min = 1))]
    pub max_body_bytes: usize,

    #[envconfig(from = "FAILURES_PER_MINUTE", default = "10")]
    pub failures_per_minute: u32,

    #[envconfig(from = "FAILURES_PER_HOUR", default = "50")]
    pub failures_per_hour: u32,

    /// Client identification sent with every upstream request
    #[envconfig(from = "CLIENT_APP_VERSION", default = "1020345")]
    #[validate(length(min = 1))]
    pub client_app_version: String,

    #[envconfig(from = "CLIENT_PLATFORM", default = "web")]
    #[validate(length(min = 1))]
    pub client_platform: String,

    #[envconfig(
        from = "CLIENT_USER_AGENT",
        default = "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0 Safari/537.36"
    )]
    pub client_user_agent: String,

    /// Optional JSON endpoint catalog
    #[envconfig(from = "ENDPOINT_CATALOG_PATH")]
    pub endpoint_catalog_path: Option<PathBuf>,

    #[envconfig(from = "LOG_LEVEL", default = "info")]
    pub log_level: String,
}

impl Config {
    /// Environment first, then command-line overrides, then validation.
    pub fn load(cli: &Cli) -> Result<Self, ConfigError> {
        let mut config = Config::init_from_env()?;
        config.apply(cli);
        config.validate()?;
        Ok(config)
    }

    pub fn apply(&mut self, cli: &Cli) {
        if let Some(bind) = cli.bind {
            self.bind_addr = bind;
        }
        if let Some(upstream) = &cli.upstream {
            self.upstream_base_url = upstream.clone();
        }
        if let Some(catalog) = &cli.catalog {
            self.endpoint_catalog_path = Some(catalog.clone());
        }
    }

    pub fn upstream_timeout(&self) -> Duration {
        Duration::from_millis(self.upstream_timeout_ms)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.upstream_max_retries,
            base_delay: Duration::from_millis(self.upstream_retry_base_delay_ms),
        }
    }

    pub fn rate_limiter(&self) -> RateLimiterConfig {
        RateLimiterConfig {
            global_limit: self.global_rate_limit,
            global_window: Duration::from_millis(self.global_rate_window_ms),
            failures_per_minute: self.failures_per_minute,
            failures_per_hour: self.failures_per_hour,
            ..RateLimiterConfig::default()
        }
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    pub fn cache_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.cache_sweep_interval_secs)
    }

    pub fn token_ttl(&self) -> Duration {
        Duration::from_secs(self.token_ttl_secs)
    }

    /// Fixed outbound headers identifying the client to upstream.
    pub fn client_headers(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            ("app-version".to_string(), self.client_app_version.clone()),
            ("platform".to_string(), self.client_platform.clone()),
            ("user-agent".to_string(), self.client_user_agent.clone()),
        ])
    }

    /// The catalog file when one is configured, the built-in catalog otherwise.
    pub fn catalog(&self) -> Result<EndpointCatalog, ConfigError> {
        match &self.endpoint_catalog_path {
            Some(path) => Ok(EndpointCatalog::from_file(path)?),
            None => Ok(EndpointCatalog::default()),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 3000)),
            upstream_base_url: "https://api.gotinder.com".to_string(),
            upstream_timeout_ms: 10_000,
            upstream_max_retries: 3,
            upstream_retry_base_delay_ms: 100,
            global_rate_limit: 100,
            global_rate_window_ms: 60_000,
            cache_ttl_secs: 300,
            cache_sweep_interval_secs: 60,
            token_ttl_secs: 86_400,
            max_body_bytes: 1024 * 1024,
            failures_per_minute: 10,
            failures_per_hour: 50,
            client_app_version: "1020345".to_string(),
            client_platform: "web".to_string(),
            client_user_agent: "matchgate".to_string(),
            endpoint_catalog_path: None,
            log_level: "info".to_string(),
        }
    }
}
