use serde::{Deserialize, Serialize};

use crate::rate_limiter::GlobalStatus;

#[derive(Debug, Serialize)]
pub struct HealthStatus {
    pub status: String,
    pub timestamp: u64,
    pub version: String,
    pub uptime_seconds: u64,
    pub stores: StoreStats,
    pub global_rate_limit: GlobalStatus,
}

/// Sizes of the in-memory stores.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreStats {
    pub sessions: usize,
    pub cached_responses: usize,
    pub rate_limited_users: usize,
}

impl HealthStatus {
    pub fn healthy(
        timestamp: u64,
        uptime_seconds: u64,
        stores: StoreStats,
        global_rate_limit: GlobalStatus,
    ) -> Self {
        // A saturated global window still serves cached reads and health checks.
        let status = if global_rate_limit.count >= global_rate_limit.limit {
            "degraded"
        } else {
            "healthy"
        };

        Self {
            status: status.to_string(),
            timestamp,
            version: env!("CARGO_PKG_VERSION").to_string(),
            uptime_seconds,
            stores,
            global_rate_limit,
        }
    }
}
