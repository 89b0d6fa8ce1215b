//! Normalized inbound request handed to the pipeline.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use validator::{Validate, ValidationError, ValidationErrors};

use crate::error::{FieldError, GatewayError};

/// Header carrying the upstream session token.
pub const AUTH_TOKEN_HEADER: &str = "x-auth-token";

/// Headers dropped from the client side before dispatch.
const STRIPPED_HEADERS: &[&str] = &[
    "accept-encoding",
    "connection",
    "content-length",
    "host",
    "keep-alive",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
    "x-user-id",
    AUTH_TOKEN_HEADER,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
    Get,
    Post,
    Put,
    Delete,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Delete => "DELETE",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Method {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "GET" => Ok(Method::Get),
            "POST" => Ok(Method::Post),
            "PUT" => Ok(Method::Put),
            "DELETE" => Ok(Method::Delete),
            other => Err(GatewayError::validation(
                format!("Unsupported method '{}'", other),
                vec![FieldError::new("method", "must be one of GET, POST, PUT, DELETE")],
            )),
        }
    }
}

impl From<Method> for reqwest::Method {
    fn from(method: Method) -> Self {
        match method {
            Method::Get => reqwest::Method::GET,
            Method::Post => reqwest::Method::POST,
            Method::Put => reqwest::Method::PUT,
            Method::Delete => reqwest::Method::DELETE,
        }
    }
}

/// Scalar query-string value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum QueryValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

impl fmt::Display for QueryValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueryValue::Bool(b) => write!(f, "{}", b),
            QueryValue::Int(i) => write!(f, "{}", i),
            QueryValue::Float(x) => write!(f, "{}", x),
            QueryValue::Str(s) => f.write_str(s),
        }
    }
}

impl From<&str> for QueryValue {
    fn from(value: &str) -> Self {
        QueryValue::Str(value.to_string())
    }
}

impl From<i64> for QueryValue {
    fn from(value: i64) -> Self {
        QueryValue::Int(value)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct NormalizedRequest {
    pub method: Method,

    #[validate(
        length(min = 1, max = 2048, message = "endpoint must not be empty"),
        custom(function = "validate_endpoint")
    )]
    pub endpoint: String,

    #[serde(default)]
    pub headers: BTreeMap<String, String>,

    #[serde(default)]
    pub body: Option<Value>,

    #[serde(default)]
    pub query: BTreeMap<String, QueryValue>,

    #[validate(custom(function = "validate_user_id"))]
    #[serde(default)]
    pub user_id: Option<String>,
}

impl NormalizedRequest {
    pub fn new(method: Method, endpoint: impl Into<String>) -> Self {
        Self {
            method,
            endpoint: endpoint.into(),
            headers: BTreeMap::new(),
            body: None,
            query: BTreeMap::new(),
            user_id: None,
        }
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn with_body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    pub fn with_query(mut self, key: impl Into<String>, value: impl Into<QueryValue>) -> Self {
        self.query.insert(key.into(), value.into());
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Structural checks on method, endpoint and user id.
    pub fn validate_shape(&self) -> Result<(), GatewayError> {
        self.validate()
            .map_err(|errors| GatewayError::validation("Invalid request", field_errors(&errors)))
    }

    /// Lowercases header names and drops hop-by-hop and client-supplied auth headers.
    pub fn normalize_headers(&mut self) {
        let headers = std::mem::take(&mut self.headers);
        self.headers = headers
            .into_iter()
            .map(|(name, value)| (name.trim().to_ascii_lowercase(), value))
            .filter(|(name, _)| !name.is_empty() && !STRIPPED_HEADERS.contains(&name.as_str()))
            .collect();
    }

    pub fn body_size(&self) -> usize {
        self.body
            .as_ref()
            .and_then(|body| serde_json::to_vec(body).ok())
            .map(|bytes| bytes.len())
            .unwrap_or(0)
    }
}

fn validate_endpoint(endpoint: &str) -> Result<(), ValidationError> {
    if !endpoint.starts_with('/') {
        return Err(ValidationError::new("endpoint_format")
            .with_message("endpoint must start with '/'".into()));
    }
    if endpoint.contains("..") || endpoint.contains("://") {
        return Err(ValidationError::new("endpoint_format")
            .with_message("endpoint must be a relative path".into()));
    }
    Ok(())
}

pub fn validate_user_id(user_id: &str) -> Result<(), ValidationError> {
    uuid::Uuid::parse_str(user_id).map(|_| ()).map_err(|_| {
        ValidationError::new("user_id_format").with_message("user_id must be a UUID".into())
    })
}

/// Flattens `validator` errors into field/reason pairs, sorted by field.
pub fn field_errors(errors: &ValidationErrors) -> Vec<FieldError> {
    let mut out: Vec<FieldError> = errors
        .field_errors()
        .into_iter()
        .flat_map(|(field, errs)| {
            errs.iter().map(move |err| {
                let reason = err
                    .message
                    .as_ref()
                    .map(|m| m.to_string())
                    .unwrap_or_else(|| err.code.to_string());
                FieldError::new(field.to_string(), reason)
            })
        })
        .collect();
    out.sort_by(|a, b| a.field.cmp(&b.field));
    out
}
