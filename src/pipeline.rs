//! The request pipeline: every gateway call passes through [`RequestPipeline::process`].
//!
//! Order of operations, each step able to end the request early:
//!
//! 1. structural validation (method, endpoint, user id)
//! 2. payload size guard
//! 3. sanitization of body and query values
//! 4. endpoint schema validation
//! 5. global and per-user rate limits
//! 6. upstream token for authenticated endpoints
//! 7. fixed client-identification headers
//! 8. response cache for eligible GETs
//! 9. upstream dispatch with retry
//! 10. local quota decrement, reconciliation, cache population
//! 11. mapping of upstream failures onto the error taxonomy
//!
//! Validation failures also feed the per-caller failure tracker, which is
//! consulted before anything else.

use serde_json::Value;
use std::sync::Arc;

use crate::auth::AuthManager;
use crate::cache::CacheStore;
use crate::clock::Clock;
use crate::endpoints::EndpointCatalog;
use crate::error::{GatewayError, Result};
use crate::key_generator::{KeyGenerator, ANONYMOUS};
use crate::rate_limiter::{quota, RateLimiter};
use crate::request::{Method, NormalizedRequest, QueryValue, AUTH_TOKEN_HEADER};
use crate::upstream::{OutboundRequest, UpstreamClient, UpstreamResponse};
use crate::validation::{DefaultSanitizer, PayloadValidator, Sanitizer, SchemaRegistry};

pub const DEFAULT_MAX_BODY_BYTES: usize = 1024 * 1024;

/// Fallback wait when upstream answers 429 without saying for how long.
const UPSTREAM_RETRY_AFTER_MS: u64 = 60_000;

pub struct RequestPipeline {
    rate_limiter: Arc<RateLimiter>,
    auth: Arc<AuthManager>,
    cache: Arc<CacheStore>,
    upstream: Arc<UpstreamClient>,
    catalog: Arc<EndpointCatalog>,
    clock: Arc<dyn Clock>,
    validator: Arc<dyn PayloadValidator>,
    sanitizer: Arc<dyn Sanitizer>,
    keys: KeyGenerator,
    max_body_bytes: usize,
}

impl RequestPipeline {
    pub fn new(
        rate_limiter: Arc<RateLimiter>,
        auth: Arc<AuthManager>,
        cache: Arc<CacheStore>,
        upstream: Arc<UpstreamClient>,
        catalog: Arc<EndpointCatalog>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            rate_limiter,
            auth,
            cache,
            upstream,
            catalog,
            clock,
            validator: Arc::new(SchemaRegistry::with_builtin_schemas()),
            sanitizer: Arc::new(DefaultSanitizer::default()),
            keys: KeyGenerator::new(),
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
        }
    }

    pub fn with_validator(mut self, validator: Arc<dyn PayloadValidator>) -> Self {
        self.validator = validator;
        self
    }

    pub fn with_sanitizer(mut self, sanitizer: Arc<dyn Sanitizer>) -> Self {
        self.sanitizer = sanitizer;
        self
    }

    pub fn with_max_body_bytes(mut self, max_body_bytes: usize) -> Self {
        self.max_body_bytes = max_body_bytes;
        self
    }

    pub async fn process(&self, request: NormalizedRequest) -> Result<Value> {
        self.process_from(request, None).await
    }

    /// Like [`process`](Self::process); `client` identifies anonymous callers
    /// (typically their IP) for validation-failure throttling.
    pub async fn process_from(
        &self,
        mut request: NormalizedRequest,
        client: Option<&str>,
    ) -> Result<Value> {
        let identifier = request
            .user_id
            .clone()
            .or_else(|| client.map(str::to_string))
            .unwrap_or_else(|| ANONYMOUS.to_string());

        if let Err(err) = self.rate_limiter.check_failures(&identifier, &request.endpoint) {
            tracing::warn!(
                identifier = %identifier,
                endpoint = %request.endpoint,
                "rejected caller with repeated validation failures"
            );
            return Err(err);
        }

        self.validate(&mut request)
            .map_err(|err| self.record_validation_failure(&identifier, &request.endpoint, err))?;

        self.rate_limiter
            .check(request.user_id.as_deref(), &request.endpoint)?;

        request.normalize_headers();
        if let Some(user_id) = request.user_id.as_deref() {
            if self.catalog.requires_auth(&request.endpoint) {
                let token = self.auth.get_valid_token(user_id).await?;
                request.headers.insert(AUTH_TOKEN_HEADER.to_string(), token);
            }
        }
        self.upstream.attach_default_headers(&mut request.headers);

        let cache_rule = match request.method {
            Method::Get => self.catalog.cache_rule(&request.endpoint),
            _ => None,
        };
        let cache_key = cache_rule.map(|_| self.keys.cache_key(&request));
        if let Some(key) = &cache_key {
            if let Some(cached) = self.cache.get(key) {
                tracing::debug!(endpoint = %request.endpoint, "served from cache");
                return Ok(cached);
            }
        }

        let outbound = OutboundRequest {
            method: request.method,
            path: request.endpoint.clone(),
            query: request
                .query
                .iter()
                .map(|(key, value)| (key.clone(), value.to_string()))
                .collect(),
            headers: request.headers.clone(),
            body: request.body.clone(),
        };
        let response = self.upstream.send(&outbound).await?;

        if !response.is_success() {
            self.rate_limiter.update_rate_limits(
                &request.endpoint,
                &response.body,
                request.user_id.as_deref(),
            );
            return Err(self.map_failure(&request, &response));
        }

        if let Some(user_id) = request.user_id.as_deref() {
            if request.method != Method::Get && self.rate_limiter.classify(&request.endpoint).is_some() {
                self.rate_limiter.decrement(user_id, &request.endpoint);
            }
            if self.catalog.is_public(&request.endpoint) {
                self.auth.capture_session(user_id, &response.body);
            }
        }
        self.rate_limiter.update_rate_limits(
            &request.endpoint,
            &response.body,
            request.user_id.as_deref(),
        );

        if let (Some(key), Some(ttl)) = (cache_key, cache_rule) {
            self.cache.set(&key, response.body.clone(), ttl);
        }

        Ok(response.body)
    }

    /// Steps 1-4: shape, size, sanitization, schema.
    fn validate(&self, request: &mut NormalizedRequest) -> Result<()> {
        request.validate_shape()?;

        let size = request.body_size();
        if size > self.max_body_bytes {
            return Err(GatewayError::payload_too_large(size, self.max_body_bytes));
        }

        if let Some(body) = request.body.take() {
            request.body = Some(self.sanitizer.sanitize(body));
        }
        for value in request.query.values_mut() {
            if let QueryValue::Str(s) = value {
                if let Value::String(clean) = self.sanitizer.sanitize(Value::String(std::mem::take(s))) {
                    *s = clean;
                }
            }
        }

        if let Some(schema) = self.catalog.schema_for(request.method, &request.endpoint) {
            let payload = request.body.clone().unwrap_or(Value::Null);
            match self.validator.validate(schema, &payload) {
                Ok(accepted) => {
                    if !accepted.is_null() {
                        request.body = Some(accepted);
                    }
                }
                Err(details) => {
                    return Err(GatewayError::validation(
                        format!("Payload does not match schema '{}'", schema),
                        details,
                    ));
                }
            }
        }

        Ok(())
    }

    fn record_validation_failure(
        &self,
        identifier: &str,
        endpoint: &str,
        err: GatewayError,
    ) -> GatewayError {
        let blocked = self.rate_limiter.track_failure(identifier, endpoint);
        if !blocked {
            tracing::warn!(
                identifier = %identifier,
                endpoint = %endpoint,
                error = %err,
                "request failed validation"
            );
        }
        err
    }

    fn map_failure(&self, request: &NormalizedRequest, response: &UpstreamResponse) -> GatewayError {
        let message = response.error_message();
        let err = match response.status {
            401 => {
                if let Some(user_id) = request.user_id.as_deref() {
                    self.auth.store().remove(user_id);
                }
                GatewayError::AuthenticationFailed(message)
            }
            429 => GatewayError::rate_limited(
                "Upstream rate limit exceeded",
                self.upstream_reset_at(response),
            ),
            400 => GatewayError::validation(message, Vec::new()),
            status => GatewayError::Api { status, message },
        };

        // Exhausted 5xx responses are already logged by the upstream client.
        if !response.is_server_error() {
            tracing::warn!(
                endpoint = %request.endpoint,
                user_id = request.user_id.as_deref().unwrap_or(ANONYMOUS),
                status = response.status,
                code = err.code().as_str(),
                "upstream request failed"
            );
        }
        err
    }

    fn upstream_reset_at(&self, response: &UpstreamResponse) -> u64 {
        let now = self.clock.now_millis();
        if let Some(secs) = response
            .headers
            .get("retry-after")
            .and_then(|value| value.trim().parse::<u64>().ok())
        {
            return now.saturating_add(secs.saturating_mul(1000));
        }
        response
            .body
            .get("rate_limited_until")
            .and_then(Value::as_u64)
            .map(quota::to_millis)
            .filter(|until| *until > now)
            .unwrap_or(now + UPSTREAM_RETRY_AFTER_MS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::error::ErrorCode;
    use crate::rate_limiter::RateLimiterConfig;
    use crate::token_store::{TokenRecord, TokenStore};
    use crate::upstream::testing::ScriptedTransport;
    use crate::upstream::{RetryPolicy, TransportError};
    use crate::validation::{FieldKind, FieldRule, Schema};
    use serde_json::json;
    use std::collections::BTreeMap;
    use std::time::Duration;

    const NOW: u64 = 1_700_000_000_000;
    const ALICE: &str = "6f1c2d3e-0000-4000-8000-000000000001";
    const BOB: &str = "6f1c2d3e-0000-4000-8000-000000000002";

    struct Harness {
        pipeline: RequestPipeline,
        transport: Arc<ScriptedTransport>,
        clock: Arc<ManualClock>,
        tokens: Arc<TokenStore>,
    }

    impl Harness {
        fn new(transport: ScriptedTransport) -> Self {
            Self::with_limits(transport, RateLimiterConfig::default())
        }

        fn with_limits(transport: ScriptedTransport, limits: RateLimiterConfig) -> Self {
            let clock = Arc::new(ManualClock::new(NOW));
            let transport = Arc::new(transport);
            let headers = BTreeMap::from([
                ("app-version".to_string(), "1020345".to_string()),
                ("platform".to_string(), "web".to_string()),
            ]);
            let upstream = Arc::new(UpstreamClient::new(
                transport.clone(),
                RetryPolicy {
                    max_retries: 3,
                    base_delay: Duration::from_millis(1),
                },
                headers,
            ));
            let tokens = Arc::new(TokenStore::new(clock.clone()));
            let auth = Arc::new(AuthManager::new(tokens.clone(), upstream.clone()));
            let pipeline = RequestPipeline::new(
                Arc::new(RateLimiter::new(limits, clock.clone())),
                auth,
                Arc::new(CacheStore::new(clock.clone())),
                upstream,
                Arc::new(EndpointCatalog::default()),
                clock.clone(),
            );
            Self {
                pipeline,
                transport,
                clock,
                tokens,
            }
        }

        fn login(&self, user_id: &str, access: &str) {
            self.tokens.put(
                user_id,
                TokenRecord {
                    access_token: access.to_string(),
                    refresh_token: format!("refresh-{}", access),
                    expires_at: NOW + 3_600_000,
                },
            );
        }
    }

    #[tokio::test]
    async fn test_cacheable_get_served_from_cache() {
        let h = Harness::new(ScriptedTransport::new().respond(200, json!({ "name": "Alice" })));
        h.login(ALICE, "tok-a");

        let first = h
            .pipeline
            .process(NormalizedRequest::new(Method::Get, "/v2/profile").with_user(ALICE))
            .await
            .unwrap();
        let second = h
            .pipeline
            .process(NormalizedRequest::new(Method::Get, "/v2/profile").with_user(ALICE))
            .await
            .unwrap();

        assert_eq!(first, json!({ "name": "Alice" }));
        assert_eq!(first, second);
        assert_eq!(h.transport.calls(), 1);
    }

    #[tokio::test]
    async fn test_cache_entries_are_per_user() {
        let h = Harness::new(
            ScriptedTransport::new()
                .respond(200, json!({ "name": "Alice" }))
                .respond(200, json!({ "name": "Bob" })),
        );
        h.login(ALICE, "tok-a");
        h.login(BOB, "tok-b");

        let alice = h
            .pipeline
            .process(NormalizedRequest::new(Method::Get, "/v2/profile").with_user(ALICE))
            .await
            .unwrap();
        let bob = h
            .pipeline
            .process(NormalizedRequest::new(Method::Get, "/v2/profile").with_user(BOB))
            .await
            .unwrap();

        assert_eq!(alice["name"], "Alice");
        assert_eq!(bob["name"], "Bob");
        assert_eq!(h.transport.calls(), 2);
    }

    #[tokio::test]
    async fn test_cache_entry_expires() {
        let h = Harness::new(
            ScriptedTransport::new()
                .respond(200, json!({ "v": 1 }))
                .respond(200, json!({ "v": 2 })),
        );
        h.login(ALICE, "tok-a");
        let request = || NormalizedRequest::new(Method::Get, "/v2/meta").with_user(ALICE);

        h.pipeline.process(request()).await.unwrap();
        h.clock.advance(61_000);
        let refreshed = h.pipeline.process(request()).await.unwrap();

        assert_eq!(refreshed["v"], 2);
        assert_eq!(h.transport.calls(), 2);
    }

    #[tokio::test]
    async fn test_server_error_retried_then_succeeds() {
        let h = Harness::new(
            ScriptedTransport::new()
                .respond(503, json!({ "message": "busy" }))
                .respond(200, json!({ "results": [] })),
        );
        h.login(ALICE, "tok-a");

        let body = h
            .pipeline
            .process(NormalizedRequest::new(Method::Get, "/v2/recs/core").with_user(ALICE))
            .await
            .unwrap();

        assert_eq!(body, json!({ "results": [] }));
        assert_eq!(h.transport.calls(), 2);
    }

    #[tokio::test]
    async fn test_bad_request_not_retried() {
        let h = Harness::new(ScriptedTransport::new().respond(400, json!({ "message": "bad input" })));
        h.login(ALICE, "tok-a");

        let err = h
            .pipeline
            .process(NormalizedRequest::new(Method::Get, "/v2/recs/core").with_user(ALICE))
            .await
            .unwrap_err();

        assert_eq!(err.code(), ErrorCode::ValidationError);
        assert_eq!(err.to_string(), "Validation error: bad input");
        assert_eq!(h.transport.calls(), 1);
    }

    #[tokio::test]
    async fn test_other_client_errors_map_to_api_error() {
        let h = Harness::new(ScriptedTransport::new().respond(404, json!({ "error": "not found" })));
        h.login(ALICE, "tok-a");

        let err = h
            .pipeline
            .process(NormalizedRequest::new(Method::Get, "/user/abc").with_user(ALICE))
            .await
            .unwrap_err();

        assert_eq!(err.code(), ErrorCode::ApiError);
        assert_eq!(err.http_status(), 404);
    }

    #[tokio::test]
    async fn test_network_failure_after_retries() {
        let h = Harness::new(
            ScriptedTransport::new()
                .fail(TransportError::Timeout)
                .fail(TransportError::Timeout)
                .fail(TransportError::Timeout)
                .fail(TransportError::Timeout),
        );
        h.login(ALICE, "tok-a");

        let err = h
            .pipeline
            .process(NormalizedRequest::new(Method::Get, "/v2/recs/core").with_user(ALICE))
            .await
            .unwrap_err();

        assert_eq!(err.code(), ErrorCode::NetworkError);
        assert_eq!(h.transport.calls(), 4);
    }

    #[tokio::test]
    async fn test_exhausted_like_quota_blocks_next_like() {
        let h = Harness::new(ScriptedTransport::new().respond(
            200,
            json!({ "match": false, "likes_remaining": 0, "rate_limited_until": NOW + 3_600_000 }),
        ));
        h.login(ALICE, "tok-a");

        h.pipeline
            .process(NormalizedRequest::new(Method::Post, "/like/abc").with_user(ALICE))
            .await
            .unwrap();
        let err = h
            .pipeline
            .process(NormalizedRequest::new(Method::Post, "/like/def").with_user(ALICE))
            .await
            .unwrap_err();

        assert_eq!(err.code(), ErrorCode::RateLimitExceeded);
        assert_eq!(err.to_string(), "Like rate limit exceeded");
        assert_eq!(err.reset_at(), Some(NOW + 3_600_000));
        assert_eq!(h.transport.calls(), 1);
    }

    #[tokio::test]
    async fn test_like_quota_allows_again_after_reset() {
        let h = Harness::new(
            ScriptedTransport::new()
                .respond(200, json!({ "likes_remaining": 0, "rate_limited_until": NOW + 1_000 }))
                .respond(200, json!({ "likes_remaining": 99 })),
        );
        h.login(ALICE, "tok-a");

        h.pipeline
            .process(NormalizedRequest::new(Method::Post, "/like/abc").with_user(ALICE))
            .await
            .unwrap();
        h.clock.advance(2_000);
        h.pipeline
            .process(NormalizedRequest::new(Method::Post, "/like/def").with_user(ALICE))
            .await
            .unwrap();

        let snapshot = h.pipeline.rate_limiter.snapshot(ALICE);
        assert_eq!(snapshot["like"].remaining, 99);
    }

    #[tokio::test]
    async fn test_expired_token_refreshed_before_dispatch() {
        let h = Harness::new(
            ScriptedTransport::new()
                .respond(200, json!({ "data": { "api_token": "fresh", "refresh_token": "r2" } }))
                .respond(200, json!({ "ok": true })),
        );
        h.tokens.put(
            ALICE,
            TokenRecord {
                access_token: "stale".into(),
                refresh_token: "r1".into(),
                expires_at: NOW - 1,
            },
        );

        h.pipeline
            .process(NormalizedRequest::new(Method::Get, "/v2/recs/core").with_user(ALICE))
            .await
            .unwrap();

        let sent = h.transport.sent.lock().unwrap().clone();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].path, "/v2/auth/login/refresh");
        assert_eq!(sent[1].headers[AUTH_TOKEN_HEADER], "fresh");
        assert_eq!(h.tokens.get(ALICE).unwrap().refresh_token, "r2");
    }

    #[tokio::test]
    async fn test_missing_token_fails_without_upstream_call() {
        let h = Harness::new(ScriptedTransport::new());

        let err = h
            .pipeline
            .process(NormalizedRequest::new(Method::Get, "/v2/recs/core").with_user(ALICE))
            .await
            .unwrap_err();

        assert_eq!(err.code(), ErrorCode::AuthenticationFailed);
        assert_eq!(h.transport.calls(), 0);
    }

    #[tokio::test]
    async fn test_unauthorized_response_removes_token() {
        let h = Harness::new(ScriptedTransport::new().respond(401, json!({ "message": "expired" })));
        h.login(ALICE, "tok-a");

        let err = h
            .pipeline
            .process(NormalizedRequest::new(Method::Get, "/v2/recs/core").with_user(ALICE))
            .await
            .unwrap_err();

        assert_eq!(err.code(), ErrorCode::AuthenticationFailed);
        assert!(h.tokens.get(ALICE).is_none());
    }

    #[tokio::test]
    async fn test_upstream_429_uses_retry_after() {
        let transport = ScriptedTransport::new();
        let mut response = UpstreamResponse::new(429, json!({ "message": "slow down" }));
        response.headers.insert("retry-after".into(), "30".into());
        transport.push(Ok(response));
        let h = Harness::new(transport);
        h.login(ALICE, "tok-a");

        let err = h
            .pipeline
            .process(NormalizedRequest::new(Method::Get, "/v2/recs/core").with_user(ALICE))
            .await
            .unwrap_err();

        assert_eq!(err.code(), ErrorCode::RateLimitExceeded);
        assert_eq!(err.reset_at(), Some(NOW + 30_000));
    }

    #[tokio::test]
    async fn test_upstream_429_without_hint_defaults_to_a_minute() {
        let h = Harness::new(ScriptedTransport::new().respond(429, Value::Null));
        h.login(ALICE, "tok-a");

        let err = h
            .pipeline
            .process(NormalizedRequest::new(Method::Get, "/v2/recs/core").with_user(ALICE))
            .await
            .unwrap_err();

        assert_eq!(err.reset_at(), Some(NOW + 60_000));
    }

    #[tokio::test]
    async fn test_headers_normalized_and_token_attached() {
        let h = Harness::new(ScriptedTransport::new().respond(200, json!({})));
        h.login(ALICE, "tok-a");

        h.pipeline
            .process(
                NormalizedRequest::new(Method::Get, "/v2/recs/core")
                    .with_user(ALICE)
                    .with_header("X-Auth-Token", "spoofed")
                    .with_header("Platform", "ios")
                    .with_header("Accept-Language", "en"),
            )
            .await
            .unwrap();

        let sent = h.transport.last_sent().unwrap();
        assert_eq!(sent.headers[AUTH_TOKEN_HEADER], "tok-a");
        assert_eq!(sent.headers["platform"], "web");
        assert_eq!(sent.headers["app-version"], "1020345");
        assert_eq!(sent.headers["accept-language"], "en");
    }

    #[tokio::test]
    async fn test_oversized_body_rejected_before_dispatch() {
        let h = Harness::new(ScriptedTransport::new());
        h.login(ALICE, "tok-a");
        let transport = h.transport.clone();
        let pipeline = h.pipeline.with_max_body_bytes(64);

        let err = pipeline
            .process(
                NormalizedRequest::new(Method::Post, "/user/matches/abc")
                    .with_user(ALICE)
                    .with_body(json!({ "message": "x".repeat(200) })),
            )
            .await
            .unwrap_err();

        assert_eq!(err.code(), ErrorCode::ValidationError);
        assert_eq!(err.http_status(), 413);
        assert_eq!(transport.calls(), 0);
    }

    #[tokio::test]
    async fn test_body_sanitized_before_dispatch() {
        let h = Harness::new(ScriptedTransport::new().respond(200, json!({ "sent": true })));
        h.login(ALICE, "tok-a");

        h.pipeline
            .process(
                NormalizedRequest::new(Method::Post, "/user/matches/abc")
                    .with_user(ALICE)
                    .with_body(json!({ "message": "hi<script>alert(1)</script>", "$where": "1" })),
            )
            .await
            .unwrap();

        let sent = h.transport.last_sent().unwrap();
        assert_eq!(sent.body, Some(json!({ "message": "hi" })));
    }

    #[tokio::test]
    async fn test_schema_violation_rejected_with_details() {
        let h = Harness::new(ScriptedTransport::new());

        let err = h
            .pipeline
            .process(
                NormalizedRequest::new(Method::Post, "/v2/auth/sms/send")
                    .with_body(json!({ "phone_number": "call me" })),
            )
            .await
            .unwrap_err();

        assert_eq!(err.code(), ErrorCode::ValidationError);
        let details = err.to_response().details.unwrap();
        assert_eq!(details[0]["field"], "phone_number");
        assert_eq!(h.transport.calls(), 0);
    }

    #[tokio::test]
    async fn test_repeated_validation_failures_block_caller() {
        let limits = RateLimiterConfig {
            failures_per_minute: 2,
            ..RateLimiterConfig::default()
        };
        let h = Harness::with_limits(ScriptedTransport::new(), limits);
        let bad = || {
            NormalizedRequest::new(Method::Post, "/v2/auth/sms/send")
                .with_body(json!({ "phone_number": "nope" }))
        };

        for _ in 0..3 {
            let err = h.pipeline.process_from(bad(), Some("10.0.0.1")).await.unwrap_err();
            assert_eq!(err.code(), ErrorCode::ValidationError);
        }
        let err = h.pipeline.process_from(bad(), Some("10.0.0.1")).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::RateLimitExceeded);
        assert_eq!(err.to_string(), "Too many invalid requests");

        // A different caller is unaffected.
        let err = h.pipeline.process_from(bad(), Some("10.0.0.2")).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::ValidationError);
        assert_eq!(h.transport.calls(), 0);
    }

    #[tokio::test]
    async fn test_invalid_endpoint_rejected() {
        let h = Harness::new(ScriptedTransport::new());

        let err = h
            .pipeline
            .process(NormalizedRequest::new(Method::Get, "v2/../admin"))
            .await
            .unwrap_err();

        assert_eq!(err.code(), ErrorCode::ValidationError);
        assert_eq!(h.transport.calls(), 0);
    }

    #[tokio::test]
    async fn test_public_login_response_captures_session() {
        let h = Harness::new(ScriptedTransport::new().respond(
            200,
            json!({ "data": { "api_token": "t1", "refresh_token": "r1", "expires_in": 3600 } }),
        ));

        h.pipeline
            .process(
                NormalizedRequest::new(Method::Post, "/v2/auth/login/sms")
                    .with_user(ALICE)
                    .with_body(json!({ "refresh_token": "otp-exchange" })),
            )
            .await
            .unwrap();

        let record = h.tokens.get(ALICE).unwrap();
        assert_eq!(record.access_token, "t1");
        assert_eq!(record.expires_at, NOW + 3_600_000);
        let sent = h.transport.last_sent().unwrap();
        assert!(!sent.headers.contains_key(AUTH_TOKEN_HEADER));
    }

    #[tokio::test]
    async fn test_global_limit_counts_failed_requests() {
        let limits = RateLimiterConfig {
            global_limit: 1,
            ..RateLimiterConfig::default()
        };
        let h = Harness::with_limits(
            ScriptedTransport::new().respond(400, json!({ "message": "nope" })),
            limits,
        );
        h.login(ALICE, "tok-a");
        let request = || NormalizedRequest::new(Method::Get, "/v2/recs/core").with_user(ALICE);

        assert!(h.pipeline.process(request()).await.is_err());
        let err = h.pipeline.process(request()).await.unwrap_err();

        assert_eq!(err.to_string(), "Global rate limit exceeded");
        assert_eq!(h.transport.calls(), 1);
    }

    #[tokio::test]
    async fn test_upstream_429_with_huge_retry_after_saturates() {
        let transport = ScriptedTransport::new();
        let mut response = UpstreamResponse::new(429, Value::Null);
        response
            .headers
            .insert("retry-after".into(), u64::MAX.to_string());
        transport.push(Ok(response));
        let h = Harness::new(transport);
        h.login(ALICE, "tok-a");

        let err = h
            .pipeline
            .process(NormalizedRequest::new(Method::Get, "/v2/recs/core").with_user(ALICE))
            .await
            .unwrap_err();

        assert_eq!(err.code(), ErrorCode::RateLimitExceeded);
        assert_eq!(err.reset_at(), Some(u64::MAX));
    }

    #[tokio::test]
    async fn test_post_to_cacheable_path_bypasses_cache() {
        let h = Harness::new(
            ScriptedTransport::new()
                .respond(200, json!({ "bio": "hi" }))
                .respond(200, json!({ "bio": "hello" })),
        );
        h.login(ALICE, "tok-a");
        let update = |bio: &str| {
            NormalizedRequest::new(Method::Post, "/v2/profile")
                .with_user(ALICE)
                .with_body(json!({ "bio": bio }))
        };

        let first = h.pipeline.process(update("hi")).await.unwrap();
        let second = h.pipeline.process(update("hello")).await.unwrap();

        assert_eq!(first["bio"], "hi");
        assert_eq!(second["bio"], "hello");
        assert_eq!(h.transport.calls(), 2);
        assert_eq!(h.pipeline.cache.len(), 0);
    }

    #[tokio::test]
    async fn test_custom_validator_replaces_builtin_schemas() {
        let h = Harness::new(ScriptedTransport::new().respond(200, json!({ "ok": true })));
        h.login(ALICE, "tok-a");
        let transport = h.transport.clone();
        let mut registry = SchemaRegistry::new();
        registry.register(
            "message.send",
            Schema::new(vec![FieldRule::new("message", FieldKind::String).max_len(4)]),
        );
        let pipeline = h.pipeline.with_validator(Arc::new(registry));
        let send = |message: &str| {
            NormalizedRequest::new(Method::Post, "/user/matches/abc")
                .with_user(ALICE)
                .with_body(json!({ "message": message }))
        };

        let err = pipeline.process(send("too long")).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::ValidationError);
        assert_eq!(transport.calls(), 0);

        pipeline.process(send("hey")).await.unwrap();
        assert_eq!(transport.calls(), 1);
    }

    #[tokio::test]
    async fn test_custom_sanitizer_can_keep_markup() {
        let h = Harness::new(ScriptedTransport::new().respond(200, json!({ "sent": true })));
        h.login(ALICE, "tok-a");
        let transport = h.transport.clone();
        let pipeline = h
            .pipeline
            .with_sanitizer(Arc::new(DefaultSanitizer::new(false)));

        pipeline
            .process(
                NormalizedRequest::new(Method::Post, "/user/matches/abc")
                    .with_user(ALICE)
                    .with_body(json!({ "message": "<b>hi</b>", "$where": "1" })),
            )
            .await
            .unwrap();

        let sent = transport.last_sent().unwrap();
        assert_eq!(sent.body, Some(json!({ "message": "<b>hi</b>" })));
    }
}
