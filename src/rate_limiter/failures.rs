//! Throttling of callers that keep sending invalid requests.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::error::GatewayError;

const MINUTE_MS: u64 = 60_000;
const HOUR_MS: u64 = 60 * MINUTE_MS;
const MAX_TRACKED: usize = 10_000;

#[derive(Debug, Clone, Copy)]
struct FailureRecord {
    count: u32,
    last_failure_at: u64,
}

#[derive(Debug)]
pub struct FailureTracker {
    records: Mutex<HashMap<String, FailureRecord>>,
    per_minute: u32,
    per_hour: u32,
    max_tracked: usize,
}

impl FailureTracker {
    pub fn new(per_minute: u32, per_hour: u32) -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
            per_minute,
            per_hour,
            max_tracked: MAX_TRACKED,
        }
    }

    pub fn with_max_tracked(mut self, max_tracked: usize) -> Self {
        self.max_tracked = max_tracked.max(1);
        self
    }

    fn key(identifier: &str, endpoint: &str) -> String {
        format!("{}:{}", identifier, endpoint)
    }

    /// Records a failure and reports whether the caller is now blocked.
    pub fn track_failure(&self, identifier: &str, endpoint: &str, now: u64) -> bool {
        let Ok(mut records) = self.records.lock() else {
            return false;
        };

        let key = Self::key(identifier, endpoint);
        if !records.contains_key(&key) && records.len() >= self.max_tracked {
            records.retain(|_, record| now.saturating_sub(record.last_failure_at) <= HOUR_MS);
            while records.len() >= self.max_tracked {
                let Some(oldest) = records
                    .iter()
                    .min_by_key(|(_, record)| record.last_failure_at)
                    .map(|(key, _)| key.clone())
                else {
                    break;
                };
                records.remove(&oldest);
            }
        }

        let record = records
            .entry(key)
            .or_insert(FailureRecord {
                count: 0,
                last_failure_at: now,
            });

        if now.saturating_sub(record.last_failure_at) > HOUR_MS {
            record.count = 0;
        }
        record.count += 1;
        record.last_failure_at = now;

        let blocked = self.blocked_until(record, now).is_some();
        if blocked {
            tracing::warn!(
                identifier = %identifier,
                endpoint = %endpoint,
                failures = record.count,
                "caller blocked after repeated validation failures"
            );
        }
        blocked
    }

    pub fn is_blocked(&self, identifier: &str, endpoint: &str, now: u64) -> bool {
        self.blocked_until_for(identifier, endpoint, now).is_some()
    }

    /// Rejects blocked callers with the time their block lifts.
    pub fn check(&self, identifier: &str, endpoint: &str, now: u64) -> Result<(), GatewayError> {
        match self.blocked_until_for(identifier, endpoint, now) {
            Some(reset_at) => Err(GatewayError::rate_limited(
                "Too many invalid requests",
                reset_at,
            )),
            None => Ok(()),
        }
    }

    fn blocked_until_for(&self, identifier: &str, endpoint: &str, now: u64) -> Option<u64> {
        let records = self.records.lock().ok()?;
        let record = records.get(&Self::key(identifier, endpoint))?;
        self.blocked_until(record, now)
    }

    fn blocked_until(&self, record: &FailureRecord, now: u64) -> Option<u64> {
        let since_last = now.saturating_sub(record.last_failure_at);
        if record.count > self.per_hour && since_last <= HOUR_MS {
            Some(record.last_failure_at + HOUR_MS)
        } else if record.count > self.per_minute && since_last < MINUTE_MS {
            Some(record.last_failure_at + MINUTE_MS)
        } else {
            None
        }
    }
}
