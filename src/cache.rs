use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, RwLock, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;

use crate::clock::Clock;

pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(300);

#[derive(Debug, Clone)]
struct CacheEntry {
    value: Value,
    /// Epoch milliseconds.
    expires_at: u64,
}

/// TTL cache of idempotent upstream responses.
///
/// Expiry is checked on every read, so correctness never depends on when
/// (or whether) the background sweeper runs.
pub struct CacheStore {
    entries: RwLock<HashMap<String, CacheEntry>>,
    clock: Arc<dyn Clock>,
    default_ttl: Duration,
}

impl CacheStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self::with_ttl(clock, DEFAULT_CACHE_TTL)
    }

    pub fn with_ttl(clock: Arc<dyn Clock>, default_ttl: Duration) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            clock,
            default_ttl,
        }
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        let now = self.clock.now_millis();
        {
            let entries = self.entries.read().ok()?;
            match entries.get(key) {
                Some(entry) if now < entry.expires_at => return Some(entry.value.clone()),
                Some(_) => {}
                None => return None,
            }
        }

        // Expired: drop it unless a concurrent writer already replaced it.
        if let Ok(mut entries) = self.entries.write() {
            if entries.get(key).is_some_and(|entry| now >= entry.expires_at) {
                entries.remove(key);
            }
        }
        None
    }

    /// Stores `value` under `key`; `None` uses the default TTL.
    pub fn set(&self, key: &str, value: Value, ttl: Option<Duration>) {
        let ttl = ttl.unwrap_or(self.default_ttl);
        let expires_at = self
            .clock
            .now_millis()
            .saturating_add(ttl.as_millis() as u64);

        match self.entries.write() {
            Ok(mut entries) => {
                entries.insert(key.to_string(), CacheEntry { value, expires_at });
            }
            Err(_) => tracing::warn!(key = %key, "cache lock poisoned, entry not stored"),
        }
    }

    pub fn delete(&self, key: &str) -> bool {
        self.entries
            .write()
            .map(|mut entries| entries.remove(key).is_some())
            .unwrap_or(false)
    }

    pub fn clear(&self) {
        if let Ok(mut entries) = self.entries.write() {
            entries.clear();
        }
    }

    /// Keys of entries that have not yet expired.
    pub fn keys(&self) -> Vec<String> {
        let now = self.clock.now_millis();
        self.entries
            .read()
            .map(|entries| {
                entries
                    .iter()
                    .filter(|(_, entry)| now < entry.expires_at)
                    .map(|(key, _)| key.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.entries.read().map(|entries| entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Removes expired entries and returns how many were dropped.
    pub fn sweep_expired(&self) -> usize {
        let now = self.clock.now_millis();
        match self.entries.write() {
            Ok(mut entries) => {
                let before = entries.len();
                entries.retain(|_, entry| now < entry.expires_at);
                before - entries.len()
            }
            Err(_) => 0,
        }
    }

    /// Spawns a periodic sweep that stops once the store is dropped.
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let store: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(live) = store.upgrade() else {
                    break;
                };
                let removed = live.sweep_expired();
                if removed > 0 {
                    tracing::debug!(removed, remaining = live.len(), "swept expired cache entries");
                }
            }
        })
    }
}
