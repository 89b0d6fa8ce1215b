use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use crate::clock::Clock;

/// Default lifetime of an upstream session token.
pub const DEFAULT_TOKEN_TTL: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenRecord {
    pub access_token: String,
    pub refresh_token: String,
    /// Epoch milliseconds.
    pub expires_at: u64,
}

// Tokens must never reach the logs.
impl fmt::Debug for TokenRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenRecord")
            .field("access_token", &"<redacted>")
            .field("refresh_token", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// In-memory per-user store of upstream credentials.
///
/// Lock failures are logged and reported as a miss, so callers always get a
/// definite answer and fall back to re-authenticating.
pub struct TokenStore {
    tokens: RwLock<HashMap<String, TokenRecord>>,
    clock: Arc<dyn Clock>,
    ttl: Duration,
}

impl TokenStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self::with_ttl(clock, DEFAULT_TOKEN_TTL)
    }

    pub fn with_ttl(clock: Arc<dyn Clock>, ttl: Duration) -> Self {
        Self {
            tokens: RwLock::new(HashMap::new()),
            clock,
            ttl,
        }
    }

    pub fn get(&self, user_id: &str) -> Option<TokenRecord> {
        match self.tokens.read() {
            Ok(tokens) => tokens.get(user_id).cloned(),
            Err(_) => {
                tracing::warn!(user_id = %user_id, "token store lock poisoned, treating as miss");
                None
            }
        }
    }

    pub fn put(&self, user_id: &str, record: TokenRecord) {
        match self.tokens.write() {
            Ok(mut tokens) => {
                tokens.insert(user_id.to_string(), record);
            }
            Err(_) => {
                tracing::warn!(user_id = %user_id, "token store lock poisoned, token not stored");
            }
        }
    }

    pub fn remove(&self, user_id: &str) -> bool {
        match self.tokens.write() {
            Ok(mut tokens) => tokens.remove(user_id).is_some(),
            Err(_) => {
                tracing::warn!(user_id = %user_id, "token store lock poisoned, token not removed");
                false
            }
        }
    }

    /// True when no record exists or `now >= expires_at`.
    pub fn is_expired(&self, user_id: &str) -> bool {
        match self.get(user_id) {
            Some(record) => self.is_record_expired(&record),
            None => true,
        }
    }

    pub fn is_record_expired(&self, record: &TokenRecord) -> bool {
        self.clock.now_millis() >= record.expires_at
    }

    /// Absolute expiry for a token issued now with the store's default TTL.
    pub fn compute_expiry(&self) -> u64 {
        self.compute_expiry_with(self.ttl)
    }

    pub fn compute_expiry_with(&self, ttl: Duration) -> u64 {
        self.clock.now_millis().saturating_add(ttl.as_millis() as u64)
    }

    pub fn len(&self) -> usize {
        self.tokens.read().map(|tokens| tokens.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
