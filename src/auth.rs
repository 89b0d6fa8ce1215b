use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

use crate::error::{GatewayError, Result};
use crate::request::Method;
use crate::token_store::{TokenRecord, TokenStore};
use crate::upstream::{OutboundRequest, UpstreamClient};

pub const DEFAULT_REFRESH_ENDPOINT: &str = "/v2/auth/login/refresh";

/// Token pair as returned by the refresh endpoint, optionally under `data`.
#[derive(Debug, Deserialize)]
struct RefreshPayload {
    #[serde(alias = "access_token", alias = "token")]
    api_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<u64>,
}

/// Hands out currently valid upstream tokens, refreshing expired ones.
///
/// Any failure removes the user's stored credentials and surfaces
/// `AuthenticationFailed`; callers must treat that as "re-login required".
pub struct AuthManager {
    store: Arc<TokenStore>,
    upstream: Arc<UpstreamClient>,
    refresh_endpoint: String,
}

impl AuthManager {
    pub fn new(store: Arc<TokenStore>, upstream: Arc<UpstreamClient>) -> Self {
        Self {
            store,
            upstream,
            refresh_endpoint: DEFAULT_REFRESH_ENDPOINT.to_string(),
        }
    }

    pub fn with_refresh_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.refresh_endpoint = endpoint.into();
        self
    }

    pub fn store(&self) -> &Arc<TokenStore> {
        &self.store
    }

    pub async fn get_valid_token(&self, user_id: &str) -> Result<String> {
        match self.store.get(user_id) {
            Some(record) if !self.store.is_record_expired(&record) => Ok(record.access_token),
            Some(_) => {
                tracing::debug!(user_id = %user_id, "stored token expired, refreshing");
                self.refresh(user_id).await
            }
            None => Err(self.fail(user_id, "no stored credentials, re-login required")),
        }
    }

    /// Exchanges the stored refresh token for a new token pair.
    pub async fn refresh(&self, user_id: &str) -> Result<String> {
        let Some(current) = self.store.get(user_id) else {
            return Err(self.fail(user_id, "no stored credentials, re-login required"));
        };

        match self.exchange(&current.refresh_token).await {
            Ok(record) => {
                let access_token = record.access_token.clone();
                self.store.put(user_id, record);
                tracing::info!(user_id = %user_id, "upstream token refreshed");
                Ok(access_token)
            }
            Err(reason) => Err(self.fail(user_id, &reason)),
        }
    }

    /// Establishes a session for `user_id` from a refresh token.
    pub async fn login(&self, user_id: &str, refresh_token: &str) -> Result<TokenRecord> {
        match self.exchange(refresh_token).await {
            Ok(record) => {
                self.store.put(user_id, record.clone());
                tracing::info!(user_id = %user_id, "upstream session established");
                Ok(record)
            }
            Err(reason) => Err(self.fail(user_id, &reason)),
        }
    }

    pub fn logout(&self, user_id: &str) -> bool {
        let removed = self.store.remove(user_id);
        tracing::info!(user_id = %user_id, removed, "upstream session removed");
        removed
    }

    async fn exchange(&self, refresh_token: &str) -> std::result::Result<TokenRecord, String> {
        let mut request = OutboundRequest::new(Method::Post, self.refresh_endpoint.clone());
        self.upstream.attach_default_headers(&mut request.headers);
        request.body = Some(json!({ "refresh_token": refresh_token }));

        let response = self
            .upstream
            .send(&request)
            .await
            .map_err(|e| format!("refresh call failed: {}", e))?;

        if !response.is_success() {
            return Err(format!("refresh rejected with status {}", response.status));
        }

        self.record_from_body(&response.body, refresh_token)
            .ok_or_else(|| "refresh response did not contain a token".to_string())
    }

    /// Stores the token pair carried by a successful login response.
    ///
    /// Returns false when the body carries no usable token pair.
    pub fn capture_session(&self, user_id: &str, body: &Value) -> bool {
        let payload = body.get("data").unwrap_or(body);
        let Some(refresh_token) = payload.get("refresh_token").and_then(Value::as_str) else {
            return false;
        };
        match self.record_from_body(body, refresh_token) {
            Some(record) => {
                self.store.put(user_id, record);
                tracing::info!(user_id = %user_id, "upstream session captured from login response");
                true
            }
            None => false,
        }
    }

    fn record_from_body(&self, body: &Value, fallback_refresh: &str) -> Option<TokenRecord> {
        let payload = body.get("data").unwrap_or(body);
        let parsed: RefreshPayload = serde_json::from_value(payload.clone()).ok()?;

        let ttl = parsed
            .expires_in
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs);
        let expires_at = match ttl {
            Some(ttl) => self.store.compute_expiry_with(ttl),
            None => self.store.compute_expiry(),
        };

        Some(TokenRecord {
            access_token: parsed.api_token,
            refresh_token: parsed
                .refresh_token
                .filter(|token| !token.is_empty())
                .unwrap_or_else(|| fallback_refresh.to_string()),
            expires_at,
        })
    }

    fn fail(&self, user_id: &str, reason: &str) -> GatewayError {
        self.store.remove(user_id);
        tracing::warn!(user_id = %user_id, reason = %reason, "authentication failed");
        GatewayError::AuthenticationFailed(reason.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::upstream::testing::ScriptedTransport;
    use crate::upstream::RetryPolicy;
    use std::collections::BTreeMap;

    const NOW: u64 = 1_700_000_000_000;

    fn manager(transport: Arc<ScriptedTransport>) -> (AuthManager, Arc<TokenStore>) {
        let clock = Arc::new(ManualClock::new(NOW));
        let store = Arc::new(TokenStore::new(clock));
        let upstream = Arc::new(UpstreamClient::new(
            transport,
            RetryPolicy {
                max_retries: 1,
                base_delay: Duration::from_millis(1),
            },
            BTreeMap::new(),
        ));
        (AuthManager::new(store.clone(), upstream), store)
    }

    fn stored(access: &str, expires_at: u64) -> TokenRecord {
        TokenRecord {
            access_token: access.to_string(),
            refresh_token: "R".to_string(),
            expires_at,
        }
    }

    #[tokio::test]
    async fn test_fresh_token_returned_without_upstream_call() {
        let transport = Arc::new(ScriptedTransport::new());
        let (auth, store) = manager(transport.clone());
        store.put("u1", stored("A", NOW + 1_000));

        assert_eq!(auth.get_valid_token("u1").await.unwrap(), "A");
        assert_eq!(transport.calls(), 0);
    }

    #[tokio::test]
    async fn test_expired_token_is_refreshed() {
        let transport = Arc::new(ScriptedTransport::new().respond(
            200,
            json!({ "data": { "api_token": "B", "refresh_token": "R2" } }),
        ));
        let (auth, store) = manager(transport.clone());
        store.put("u1", stored("A", NOW - 1_000));

        let token = auth.get_valid_token("u1").await.unwrap();
        assert_eq!(token, "B");

        let record = store.get("u1").unwrap();
        assert_eq!(record.refresh_token, "R2");
        assert!(record.expires_at > NOW);

        let sent = transport.last_sent().unwrap();
        assert_eq!(sent.path, DEFAULT_REFRESH_ENDPOINT);
        assert_eq!(sent.body.unwrap()["refresh_token"], "R");
    }

    #[tokio::test]
    async fn test_refresh_posts_to_configured_endpoint() {
        let transport = Arc::new(
            ScriptedTransport::new().respond(200, json!({ "access_token": "B" })),
        );
        let (auth, store) = manager(transport.clone());
        let auth = auth.with_refresh_endpoint("/v3/session/renew");
        store.put("u1", stored("A", NOW - 1));

        assert_eq!(auth.get_valid_token("u1").await.unwrap(), "B");
        assert_eq!(transport.last_sent().unwrap().path, "/v3/session/renew");
    }

    #[tokio::test]
    async fn test_missing_record_fails_authentication() {
        let (auth, _) = manager(Arc::new(ScriptedTransport::new()));
        let err = auth.get_valid_token("ghost").await.unwrap_err();
        assert!(matches!(err, GatewayError::AuthenticationFailed(_)));
    }

    #[tokio::test]
    async fn test_failed_refresh_removes_token() {
        let transport = Arc::new(ScriptedTransport::new().respond(401, json!({"error": "nope"})));
        let (auth, store) = manager(transport);
        store.put("u1", stored("A", NOW - 1));

        let err = auth.get_valid_token("u1").await.unwrap_err();
        assert!(matches!(err, GatewayError::AuthenticationFailed(_)));
        assert!(store.get("u1").is_none());
    }

    #[tokio::test]
    async fn test_login_keeps_refresh_token_and_honours_expires_in() {
        let transport = Arc::new(
            ScriptedTransport::new().respond(200, json!({ "access_token": "C", "expires_in": 60 })),
        );
        let (auth, store) = manager(transport);

        let record = auth.login("u1", "R0").await.unwrap();
        assert_eq!(record.access_token, "C");
        assert_eq!(record.refresh_token, "R0");
        assert_eq!(record.expires_at, NOW + 60_000);
        assert_eq!(store.get("u1").unwrap(), record);
        assert!(auth.logout("u1"));
    }

    #[test]
    fn test_capture_session_from_login_body() {
        let (auth, store) = manager(Arc::new(ScriptedTransport::new()));

        assert!(auth.capture_session(
            "u1",
            &json!({"data": {"api_token": "T", "refresh_token": "RT"}})
        ));
        assert_eq!(store.get("u1").unwrap().access_token, "T");

        assert!(!auth.capture_session("u2", &json!({"data": {"api_token": "T"}})));
        assert!(store.get("u2").is_none());
    }
}
