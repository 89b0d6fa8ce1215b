//! Process-wide fixed-window request counter.

use serde::Serialize;
use std::sync::Mutex;

use crate::error::GatewayError;

#[derive(Debug)]
struct WindowState {
    window_start: u64,
    count: u64,
}

/// Snapshot of the global window after a check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GlobalStatus {
    pub window_start: u64,
    pub count: u64,
    pub limit: u64,
    pub reset_at: u64,
}

/// Counts attempts, not successes: an admitted request is never un-counted.
///
/// The window reset and the increment happen in one critical section, so
/// concurrent callers crossing a boundary observe exactly one reset.
#[derive(Debug)]
pub struct GlobalWindow {
    state: Mutex<WindowState>,
    limit: u64,
    window_ms: u64,
}

impl GlobalWindow {
    pub fn new(limit: u64, window_ms: u64, now: u64) -> Self {
        Self {
            state: Mutex::new(WindowState {
                window_start: now,
                count: 0,
            }),
            limit,
            window_ms,
        }
    }

    pub fn check(&self, now: u64) -> Result<GlobalStatus, GatewayError> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| GatewayError::Unknown("global rate limit state poisoned".to_string()))?;

        if now.saturating_sub(state.window_start) > self.window_ms {
            state.window_start = now;
            state.count = 0;
        }

        let reset_at = state.window_start + self.window_ms;
        if state.count >= self.limit {
            tracing::warn!(
                count = state.count,
                limit = self.limit,
                reset_at,
                "global rate limit exceeded"
            );
            return Err(GatewayError::rate_limited(
                "Global rate limit exceeded",
                reset_at,
            ));
        }

        state.count += 1;
        Ok(GlobalStatus {
            window_start: state.window_start,
            count: state.count,
            limit: self.limit,
            reset_at,
        })
    }

    /// Read-only view; an elapsed window reports a zero count.
    pub fn status(&self, now: u64) -> GlobalStatus {
        let (window_start, count) = match self.state.lock() {
            Ok(state) if now.saturating_sub(state.window_start) > self.window_ms => (now, 0),
            Ok(state) => (state.window_start, state.count),
            Err(_) => (now, 0),
        };
        GlobalStatus {
            window_start,
            count,
            limit: self.limit,
            reset_at: window_start + self.window_ms,
        }
    }
}
