//! Endpoint catalog: which upstream paths are cacheable, public, or schema-checked.
//!
//! Paths are described with templates such as `/like/{id}/super`; a `{name}`
//! segment matches exactly one non-empty path segment.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::GatewayError;
use crate::request::Method;

/// Compiled path template.
#[derive(Debug, Clone)]
pub struct PathPattern {
    regex: Regex,
}

impl PathPattern {
    pub fn new(template: &str) -> Result<Self, GatewayError> {
        let mut source = String::from("^");
        for segment in template.trim_end_matches('/').split('/').skip(1) {
            source.push('/');
            if segment.starts_with('{') && segment.ends_with('}') {
                source.push_str("[^/]+");
            } else {
                source.push_str(&regex::escape(segment));
            }
        }
        if source == "^" {
            source.push('/');
        }
        source.push_str("/?$");

        let regex = Regex::new(&source).map_err(|e| {
            GatewayError::Unknown(format!("invalid path template '{}': {}", template, e))
        })?;

        Ok(Self { regex })
    }

    /// Matches the path portion of `endpoint`, ignoring any query string.
    pub fn matches(&self, endpoint: &str) -> bool {
        let path = endpoint.split('?').next().unwrap_or(endpoint);
        self.regex.is_match(path)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheRule {
    pub path: String,
    #[serde(default, with = "humantime_serde")]
    pub ttl: Option<Duration>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchemaBinding {
    pub method: Method,
    pub path: String,
    pub schema: String,
}

/// Serializable form of the catalog.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogSpec {
    #[serde(default)]
    pub cacheable: Vec<CacheRule>,
    #[serde(default)]
    pub public: Vec<String>,
    #[serde(default)]
    pub schemas: Vec<SchemaBinding>,
}

impl Default for CatalogSpec {
    fn default() -> Self {
        let cache = |path: &str, ttl: Option<u64>| CacheRule {
            path: path.to_string(),
            ttl: ttl.map(Duration::from_secs),
        };
        let schema = |method, path: &str, schema: &str| SchemaBinding {
            method,
            path: path.to_string(),
            schema: schema.to_string(),
        };

        Self {
            cacheable: vec![
                cache("/v2/profile", None),
                cache("/profile", None),
                cache("/user/{id}", Some(600)),
                cache("/v2/meta", Some(60)),
                cache("/v2/fast-match/teasers", Some(60)),
            ],
            public: vec![
                "/v2/auth/sms/send".to_string(),
                "/v2/auth/sms/validate".to_string(),
                "/v2/auth/login/sms".to_string(),
                "/v2/auth/login/refresh".to_string(),
            ],
            schemas: vec![
                schema(Method::Post, "/v2/auth/sms/send", "auth.sms_send"),
                schema(Method::Post, "/v2/auth/sms/validate", "auth.sms_validate"),
                schema(Method::Post, "/user/matches/{id}", "message.send"),
                schema(Method::Post, "/v2/profile", "profile.update"),
                schema(Method::Post, "/passport/user/travel", "location.update"),
            ],
        }
    }
}

#[derive(Debug, Clone)]
struct CompiledCacheRule {
    pattern: PathPattern,
    ttl: Option<Duration>,
}

#[derive(Debug, Clone)]
struct CompiledSchemaBinding {
    method: Method,
    pattern: PathPattern,
    schema: String,
}

/// Compiled catalog consulted by the pipeline.
#[derive(Debug, Clone)]
pub struct EndpointCatalog {
    cacheable: Vec<CompiledCacheRule>,
    public: Vec<PathPattern>,
    schemas: Vec<CompiledSchemaBinding>,
}

impl EndpointCatalog {
    pub fn from_spec(spec: &CatalogSpec) -> Result<Self, GatewayError> {
        let cacheable = spec
            .cacheable
            .iter()
            .map(|rule| {
                Ok(CompiledCacheRule {
                    pattern: PathPattern::new(&rule.path)?,
                    ttl: rule.ttl,
                })
            })
            .collect::<Result<Vec<_>, GatewayError>>()?;

        let public = spec
            .public
            .iter()
            .map(|path| PathPattern::new(path))
            .collect::<Result<Vec<_>, _>>()?;

        let schemas = spec
            .schemas
            .iter()
            .map(|binding| {
                Ok(CompiledSchemaBinding {
                    method: binding.method,
                    pattern: PathPattern::new(&binding.path)?,
                    schema: binding.schema.clone(),
                })
            })
            .collect::<Result<Vec<_>, GatewayError>>()?;

        Ok(Self {
            cacheable,
            public,
            schemas,
        })
    }

    /// Loads a catalog from a JSON file.
    pub fn from_file(path: &Path) -> Result<Self, GatewayError> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            GatewayError::Unknown(format!("failed to read catalog {}: {}", path.display(), e))
        })?;
        let spec: CatalogSpec = serde_json::from_str(&raw).map_err(|e| {
            GatewayError::Unknown(format!("failed to parse catalog {}: {}", path.display(), e))
        })?;
        Self::from_spec(&spec)
    }

    /// Returns `Some(ttl override)` when the endpoint is cache-eligible.
    pub fn cache_rule(&self, endpoint: &str) -> Option<Option<Duration>> {
        self.cacheable
            .iter()
            .find(|rule| rule.pattern.matches(endpoint))
            .map(|rule| rule.ttl)
    }

    pub fn is_cacheable(&self, endpoint: &str) -> bool {
        self.cache_rule(endpoint).is_some()
    }

    pub fn is_public(&self, endpoint: &str) -> bool {
        self.public.iter().any(|pattern| pattern.matches(endpoint))
    }

    pub fn requires_auth(&self, endpoint: &str) -> bool {
        !self.is_public(endpoint)
    }

    pub fn schema_for(&self, method: Method, endpoint: &str) -> Option<&str> {
        self.schemas
            .iter()
            .find(|binding| binding.method == method && binding.pattern.matches(endpoint))
            .map(|binding| binding.schema.as_str())
    }
}

impl Default for EndpointCatalog {
    fn default() -> Self {
        // The built-in templates are static and always compile.
        Self::from_spec(&CatalogSpec::default()).unwrap_or(Self {
            cacheable: Vec::new(),
            public: Vec::new(),
            schemas: Vec::new(),
        })
    }
}
