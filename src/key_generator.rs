//! Key generation utilities for the response cache.

use crate::request::{NormalizedRequest, QueryValue};
use std::collections::BTreeMap;

/// Sentinel used in place of a user id for unauthenticated callers.
pub const ANONYMOUS: &str = "anonymous";

/// Derives cache keys from request context.
///
/// Keys have the shape `cache:{endpoint}?{k=v&..}#{user}`. Query parameters
/// are emitted in sorted order so equal requests always share a key, and the
/// user segment keeps two users from ever reading each other's entries.
#[derive(Debug, Clone, Default)]
pub struct KeyGenerator;

impl KeyGenerator {
    pub fn new() -> Self {
        Self
    }

    pub fn cache_key(&self, request: &NormalizedRequest) -> String {
        Self::compose(&request.endpoint, &request.query, request.user_id.as_deref())
    }

    pub fn compose(
        endpoint: &str,
        query: &BTreeMap<String, QueryValue>,
        user_id: Option<&str>,
    ) -> String {
        let query_string = query
            .iter()
            .map(|(key, value)| {
                format!(
                    "{}={}",
                    Self::sanitize_component(key),
                    Self::sanitize_component(&value.to_string())
                )
            })
            .collect::<Vec<_>>()
            .join("&");

        let user = user_id.unwrap_or(ANONYMOUS);
        format!("cache:{}?{}#{}", endpoint, query_string, Self::sanitize_component(user))
    }

    /// Escapes the separator characters used by [`compose`](Self::compose).
    pub fn sanitize_component(component: &str) -> String {
        let mut out = String::with_capacity(component.len());
        for c in component.chars() {
            match c {
                '%' => out.push_str("%25"),
                '&' => out.push_str("%26"),
                '=' => out.push_str("%3D"),
                '#' => out.push_str("%23"),
                '?' => out.push_str("%3F"),
                _ => out.push(c),
            }
        }
        out
    }
}
