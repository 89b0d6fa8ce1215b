//! Rate limiting for the gateway.
//!
//! Three independent mechanisms live here:
//!
//! - a global fixed window over all requests ([`global`])
//! - per-user capability quotas learned from upstream responses
//!   ([`capability`], [`quota`])
//! - throttling of callers that keep failing validation ([`failures`])
//!
//! A request flows `check_global -> check_user -> (upstream) -> decrement +
//! update_rate_limits`.

pub mod capability;
pub mod failures;
pub mod global;
pub mod quota;

use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use crate::clock::Clock;
use crate::error::{GatewayError, Result};

pub use capability::{Capability, CapabilityClassifier};
pub use failures::FailureTracker;
pub use global::{GlobalStatus, GlobalWindow};
pub use quota::QuotaReport;

#[derive(Debug, Clone)]
pub struct RateLimiterConfig {
    pub global_limit: u64,
    pub global_window: Duration,
    pub failures_per_minute: u32,
    pub failures_per_hour: u32,
    /// Applied when upstream reports a quota without a reset time.
    pub quota_reset_fallback: Duration,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            global_limit: 100,
            global_window: Duration::from_secs(60),
            failures_per_minute: 10,
            failures_per_hour: 50,
            quota_reset_fallback: Duration::from_secs(12 * 60 * 60),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CapabilityQuota {
    pub remaining: i64,
    /// Epoch milliseconds.
    pub reset_at: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UserRateLimitState {
    pub counters: HashMap<Capability, CapabilityQuota>,
}

pub struct RateLimiter {
    clock: Arc<dyn Clock>,
    global: GlobalWindow,
    classifier: CapabilityClassifier,
    users: RwLock<HashMap<String, UserRateLimitState>>,
    failures: FailureTracker,
    quota_reset_fallback_ms: u64,
}

impl RateLimiter {
    pub fn new(config: RateLimiterConfig, clock: Arc<dyn Clock>) -> Self {
        Self::with_classifier(config, clock, CapabilityClassifier::default())
    }

    pub fn with_classifier(
        config: RateLimiterConfig,
        clock: Arc<dyn Clock>,
        classifier: CapabilityClassifier,
    ) -> Self {
        let now = clock.now_millis();
        Self {
            global: GlobalWindow::new(
                config.global_limit,
                config.global_window.as_millis() as u64,
                now,
            ),
            classifier,
            users: RwLock::new(HashMap::new()),
            failures: FailureTracker::new(config.failures_per_minute, config.failures_per_hour),
            quota_reset_fallback_ms: config.quota_reset_fallback.as_millis() as u64,
            clock,
        }
    }

    /// Global gate, then the per-user capability gate.
    pub fn check(&self, user_id: Option<&str>, endpoint: &str) -> Result<()> {
        self.check_global()?;
        if let Some(user_id) = user_id {
            self.check_user(user_id, endpoint)?;
        }
        Ok(())
    }

    pub fn check_global(&self) -> Result<GlobalStatus> {
        self.global.check(self.clock.now_millis())
    }

    /// Rejects only once upstream has reported an exhausted quota that has not reset yet.
    pub fn check_user(&self, user_id: &str, endpoint: &str) -> Result<()> {
        let Some(capability) = self.classifier.classify(endpoint) else {
            return Ok(());
        };

        let quota = {
            let users = self
                .users
                .read()
                .map_err(|_| GatewayError::Unknown("user rate limit state poisoned".into()))?;
            users
                .get(user_id)
                .and_then(|state| state.counters.get(&capability).copied())
        };

        match quota {
            Some(quota) if quota.remaining <= 0 && self.clock.now_millis() < quota.reset_at => {
                tracing::warn!(
                    user_id = %user_id,
                    capability = %capability,
                    reset_at = quota.reset_at,
                    "user capability rate limit exceeded"
                );
                Err(GatewayError::rate_limited(
                    capability.exceeded_message(),
                    quota.reset_at,
                ))
            }
            _ => Ok(()),
        }
    }

    /// Locally consumes one unit after a successful capability action.
    pub fn decrement(&self, user_id: &str, endpoint: &str) {
        let Some(capability) = self.classifier.classify(endpoint) else {
            return;
        };
        let Ok(mut users) = self.users.write() else {
            return;
        };
        if let Some(quota) = users
            .get_mut(user_id)
            .and_then(|state| state.counters.get_mut(&capability))
        {
            quota.remaining = quota.remaining.saturating_sub(1).max(0);
            tracing::debug!(
                user_id = %user_id,
                capability = %capability,
                remaining = quota.remaining,
                "decremented local quota"
            );
        }
    }

    /// Overwrites quota state from an upstream response body.
    ///
    /// Last write wins; applying the same body twice is a no-op the second
    /// time. Returns the number of capability records written.
    pub fn update_rate_limits(&self, endpoint: &str, body: &Value, user_id: Option<&str>) -> usize {
        let reports = quota::parse_reports(body);
        if reports.is_empty() {
            return 0;
        }

        let user_id = match user_id {
            Some(id) => id.to_string(),
            None => match quota::user_id_from_body(body) {
                Some(id) => id,
                None => {
                    tracing::debug!(endpoint = %endpoint, "quota report without a user id, ignored");
                    return 0;
                }
            },
        };

        let now = self.clock.now_millis();
        let Ok(mut users) = self.users.write() else {
            return 0;
        };
        let state = users.entry(user_id.clone()).or_default();
        for report in &reports {
            let capability = report.capability();
            // A report without a reset time belongs to the window already open.
            let reset_at = report.reset_at().unwrap_or_else(|| {
                state
                    .counters
                    .get(&capability)
                    .map(|current| current.reset_at)
                    .filter(|reset_at| *reset_at > now)
                    .unwrap_or_else(|| now.saturating_add(self.quota_reset_fallback_ms))
            });
            let quota = CapabilityQuota {
                remaining: report.remaining(),
                reset_at,
            };
            tracing::debug!(
                user_id = %user_id,
                endpoint = %endpoint,
                capability = %capability,
                remaining = quota.remaining,
                reset_at = quota.reset_at,
                "reconciled quota from upstream"
            );
            state.counters.insert(capability, quota);
        }
        reports.len()
    }

    pub fn user_state(&self, user_id: &str) -> Option<UserRateLimitState> {
        self.users.read().ok()?.get(user_id).cloned()
    }

    /// Per-capability quotas keyed by capability name.
    pub fn snapshot(&self, user_id: &str) -> BTreeMap<String, CapabilityQuota> {
        self.user_state(user_id)
            .map(|state| {
                state
                    .counters
                    .into_iter()
                    .map(|(capability, quota)| (capability.name().to_string(), quota))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn global_status(&self) -> GlobalStatus {
        self.global.status(self.clock.now_millis())
    }

    pub fn classify(&self, endpoint: &str) -> Option<Capability> {
        self.classifier.classify(endpoint)
    }

    pub fn tracked_users(&self) -> usize {
        self.users.read().map(|users| users.len()).unwrap_or(0)
    }

    pub fn track_failure(&self, identifier: &str, endpoint: &str) -> bool {
        self.failures
            .track_failure(identifier, endpoint, self.clock.now_millis())
    }

    pub fn is_blocked(&self, identifier: &str, endpoint: &str) -> bool {
        self.failures
            .is_blocked(identifier, endpoint, self.clock.now_millis())
    }

    pub fn check_failures(&self, identifier: &str, endpoint: &str) -> Result<()> {
        self.failures
            .check(identifier, endpoint, self.clock.now_millis())
    }
}
