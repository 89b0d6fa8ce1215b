//! Composition root: one instance of every service, wired from [`Config`].

use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinHandle;

use crate::auth::AuthManager;
use crate::cache::CacheStore;
use crate::clock::{Clock, SystemClock};
use crate::config::{Config, ConfigError};
use crate::health::{HealthStatus, StoreStats};
use crate::pipeline::RequestPipeline;
use crate::rate_limiter::RateLimiter;
use crate::token_store::TokenStore;
use crate::upstream::{ReqwestTransport, Transport, UpstreamClient};

pub struct Gateway {
    config: Config,
    clock: Arc<dyn Clock>,
    tokens: Arc<TokenStore>,
    cache: Arc<CacheStore>,
    rate_limiter: Arc<RateLimiter>,
    auth: Arc<AuthManager>,
    pipeline: RequestPipeline,
    started_at: Instant,
}

impl Gateway {
    /// Builds the gateway against the real upstream over HTTP.
    pub fn new(config: Config) -> Result<Self, ConfigError> {
        let transport = ReqwestTransport::new(&config.upstream_base_url, config.upstream_timeout())?;
        Self::with_transport(config, Arc::new(transport), Arc::new(SystemClock))
    }

    pub fn with_transport(
        config: Config,
        transport: Arc<dyn Transport>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, ConfigError> {
        let catalog = Arc::new(config.catalog()?);

        let upstream = Arc::new(UpstreamClient::new(
            transport,
            config.retry_policy(),
            config.client_headers(),
        ));
        let tokens = Arc::new(TokenStore::with_ttl(clock.clone(), config.token_ttl()));
        let cache = Arc::new(CacheStore::with_ttl(clock.clone(), config.cache_ttl()));
        let rate_limiter = Arc::new(RateLimiter::new(config.rate_limiter(), clock.clone()));
        let auth = Arc::new(AuthManager::new(tokens.clone(), upstream.clone()));

        let pipeline = RequestPipeline::new(
            rate_limiter.clone(),
            auth.clone(),
            cache.clone(),
            upstream,
            catalog,
            clock.clone(),
        )
        .with_max_body_bytes(config.max_body_bytes);

        tracing::info!(
            upstream = %config.upstream_base_url,
            global_limit = config.global_rate_limit,
            cache_ttl_secs = config.cache_ttl_secs,
            "gateway initialized"
        );

        Ok(Self {
            config,
            clock,
            tokens,
            cache,
            rate_limiter,
            auth,
            pipeline,
            started_at: Instant::now(),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn pipeline(&self) -> &RequestPipeline {
        &self.pipeline
    }

    pub fn auth(&self) -> &AuthManager {
        &self.auth
    }

    pub fn rate_limiter(&self) -> &RateLimiter {
        &self.rate_limiter
    }

    pub fn cache(&self) -> &Arc<CacheStore> {
        &self.cache
    }

    pub fn tokens(&self) -> &TokenStore {
        &self.tokens
    }

    pub fn spawn_cache_sweeper(&self) -> JoinHandle<()> {
        self.cache.spawn_sweeper(self.config.cache_sweep_interval())
    }

    pub fn stats(&self) -> StoreStats {
        StoreStats {
            sessions: self.tokens.len(),
            cached_responses: self.cache.len(),
            rate_limited_users: self.rate_limiter.tracked_users(),
        }
    }

    pub fn health(&self) -> HealthStatus {
        HealthStatus::healthy(
            self.clock.now_millis() / 1000,
            self.started_at.elapsed().as_secs(),
            self.stats(),
            self.rate_limiter.global_status(),
        )
    }
}
