use serde::Serialize;
use std::collections::BTreeMap;

use crate::rate_limiter::{CapabilityQuota, GlobalStatus};

#[derive(Debug, Serialize)]
pub struct LoginResponse {
    pub user_id: String,
    /// Epoch milliseconds.
    pub expires_at: u64,
}

#[derive(Debug, Serialize)]
pub struct LogoutResponse {
    pub user_id: String,
    pub removed: bool,
}

/// Per-capability quotas for one user plus the global window.
#[derive(Debug, Serialize)]
pub struct RateLimitsResponse {
    pub user_id: String,
    pub capabilities: BTreeMap<String, CapabilityQuota>,
    pub global: GlobalStatus,
}

#[derive(Debug, Serialize)]
pub struct ReadyResponse {
    pub status: String,
    pub upstream: String,
}

impl ReadyResponse {
    pub fn ready(upstream: &str) -> Self {
        Self {
            status: "ready".to_string(),
            upstream: upstream.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rate_limits_response_shape() {
        let response = RateLimitsResponse {
            user_id: "u".to_string(),
            capabilities: BTreeMap::from([(
                "like".to_string(),
                CapabilityQuota {
                    remaining: 0,
                    reset_at: 5_000,
                },
            )]),
            global: GlobalStatus {
                window_start: 0,
                count: 1,
                limit: 100,
                reset_at: 60_000,
            },
        };

        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["capabilities"]["like"]["remaining"], 0);
        assert_eq!(json["capabilities"]["like"]["resetAt"], 5_000);
        assert_eq!(json["global"]["limit"], 100);
    }
}
