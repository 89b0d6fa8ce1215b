//! Parsers for the quota information upstream embeds in its responses.
//!
//! Each capability reports its quota under a different shape:
//!
//! * like: `likes_remaining` / `rate_limited_until`, either at the top level
//!   or nested under `likes`
//! * super like: `super_likes.remaining` / `super_likes.resets_at`
//! * boost: `boost.remaining` / `boost.resets_at`
//!
//! Any of these may also sit under a `data` envelope. A field that is present
//! but does not match its expected shape is ignored rather than guessed at.

use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;

use super::capability::Capability;

/// Timestamps below this are taken to be in seconds rather than milliseconds.
const MILLIS_THRESHOLD: u64 = 100_000_000_000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QuotaReport {
    Like { remaining: i64, reset_at: Option<u64> },
    Superlike { remaining: i64, reset_at: Option<u64> },
    Boost { remaining: i64, reset_at: Option<u64> },
}

impl QuotaReport {
    pub fn capability(&self) -> Capability {
        match self {
            QuotaReport::Like { .. } => Capability::Like,
            QuotaReport::Superlike { .. } => Capability::Superlike,
            QuotaReport::Boost { .. } => Capability::Boost,
        }
    }

    pub fn remaining(&self) -> i64 {
        match self {
            QuotaReport::Like { remaining, .. }
            | QuotaReport::Superlike { remaining, .. }
            | QuotaReport::Boost { remaining, .. } => *remaining,
        }
    }

    /// Reset time in epoch milliseconds, when upstream supplied one.
    pub fn reset_at(&self) -> Option<u64> {
        match self {
            QuotaReport::Like { reset_at, .. }
            | QuotaReport::Superlike { reset_at, .. }
            | QuotaReport::Boost { reset_at, .. } => *reset_at,
        }
    }
}

#[derive(Debug, Deserialize)]
struct LikeShape {
    likes_remaining: i64,
    #[serde(default)]
    rate_limited_until: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct CounterShape {
    remaining: i64,
    #[serde(default)]
    resets_at: Option<u64>,
}

/// Extracts every recognizable quota report from a response body.
pub fn parse_reports(body: &Value) -> Vec<QuotaReport> {
    let mut reports = Vec::new();
    let mut nodes = vec![body];
    if let Some(data) = body.get("data") {
        nodes.push(data);
    }

    for node in nodes {
        if let Some(report) = parse_like(node) {
            reports.push(report);
        }
        if let Some(shape) = parse_field::<CounterShape>(node, "super_likes") {
            reports.push(QuotaReport::Superlike {
                remaining: shape.remaining,
                reset_at: shape.resets_at.map(to_millis),
            });
        }
        if let Some(shape) = parse_field::<CounterShape>(node, "boost") {
            reports.push(QuotaReport::Boost {
                remaining: shape.remaining,
                reset_at: shape.resets_at.map(to_millis),
            });
        }
    }

    reports
}

fn parse_like(node: &Value) -> Option<QuotaReport> {
    let shape = if node.get("likes_remaining").is_some() {
        parse_value::<LikeShape>(node, "likes_remaining")
    } else {
        parse_field::<LikeShape>(node, "likes")
    }?;

    Some(QuotaReport::Like {
        remaining: shape.likes_remaining,
        reset_at: shape.rate_limited_until.map(to_millis),
    })
}

fn parse_field<T: DeserializeOwned>(node: &Value, field: &str) -> Option<T> {
    let value = node.get(field)?;
    if value.is_null() {
        return None;
    }
    parse_value(value, field)
}

fn parse_value<T: DeserializeOwned>(value: &Value, field: &str) -> Option<T> {
    match serde_json::from_value(value.clone()) {
        Ok(parsed) => Some(parsed),
        Err(e) => {
            tracing::debug!(field = %field, error = %e, "ignoring unrecognized quota shape");
            None
        }
    }
}

pub(crate) fn to_millis(timestamp: u64) -> u64 {
    if timestamp < MILLIS_THRESHOLD {
        timestamp.saturating_mul(1000)
    } else {
        timestamp
    }
}

/// Finds the upstream user id in a response body.
pub fn user_id_from_body(body: &Value) -> Option<String> {
    const POINTERS: &[&str] = &["/user_id", "/data/user/_id", "/user/_id", "/data/_id"];
    POINTERS
        .iter()
        .filter_map(|pointer| body.pointer(pointer))
        .find_map(|value| value.as_str().map(str::to_string))
}
