use regex::Regex;
use serde_json::{Map, Value};
use std::collections::HashMap;

use crate::error::FieldError;

/// Checks a payload against a named schema.
pub trait PayloadValidator: Send + Sync {
    /// Returns the accepted payload, or every field that was rejected.
    fn validate(&self, schema_id: &str, payload: &Value) -> Result<Value, Vec<FieldError>>;
}

/// Cleans untrusted values before they are forwarded upstream.
pub trait Sanitizer: Send + Sync {
    fn sanitize(&self, value: Value) -> Value;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    String,
    Number,
    Bool,
    Object,
    Array,
}

impl FieldKind {
    fn matches(&self, value: &Value) -> bool {
        match self {
            FieldKind::String => value.is_string(),
            FieldKind::Number => value.is_number(),
            FieldKind::Bool => value.is_boolean(),
            FieldKind::Object => value.is_object(),
            FieldKind::Array => value.is_array(),
        }
    }

    fn name(&self) -> &'static str {
        match self {
            FieldKind::String => "a string",
            FieldKind::Number => "a number",
            FieldKind::Bool => "a boolean",
            FieldKind::Object => "an object",
            FieldKind::Array => "an array",
        }
    }
}

#[derive(Debug, Clone)]
pub struct FieldRule {
    pub name: String,
    pub kind: FieldKind,
    pub required: bool,
    pub max_len: Option<usize>,
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub pattern: Option<Regex>,
}

impl FieldRule {
    pub fn new(name: &str, kind: FieldKind) -> Self {
        Self {
            name: name.to_string(),
            kind,
            required: false,
            max_len: None,
            min: None,
            max: None,
            pattern: None,
        }
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn max_len(mut self, max_len: usize) -> Self {
        self.max_len = Some(max_len);
        self
    }

    pub fn range(mut self, min: f64, max: f64) -> Self {
        self.min = Some(min);
        self.max = Some(max);
        self
    }

    pub fn pattern(mut self, pattern: &str) -> Self {
        self.pattern = Regex::new(pattern).ok();
        self
    }

    fn check(&self, value: &Value, errors: &mut Vec<FieldError>) {
        if !self.kind.matches(value) {
            errors.push(FieldError::new(&self.name, format!("must be {}", self.kind.name())));
            return;
        }

        let len = match value {
            Value::String(s) => Some(s.chars().count()),
            Value::Array(items) => Some(items.len()),
            _ => None,
        };
        if let (Some(len), Some(max_len)) = (len, self.max_len) {
            if len > max_len {
                errors.push(FieldError::new(
                    &self.name,
                    format!("must be at most {} long", max_len),
                ));
            }
        }

        if let Some(n) = value.as_f64() {
            if self.min.is_some_and(|min| n < min) || self.max.is_some_and(|max| n > max) {
                errors.push(FieldError::new(
                    &self.name,
                    format!(
                        "must be between {} and {}",
                        self.min.unwrap_or(f64::MIN),
                        self.max.unwrap_or(f64::MAX)
                    ),
                ));
            }
        }

        if let (Some(pattern), Some(s)) = (&self.pattern, value.as_str()) {
            if !pattern.is_match(s) {
                errors.push(FieldError::new(&self.name, "has an invalid format"));
            }
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Schema {
    pub fields: Vec<FieldRule>,
    /// Reject fields not listed in `fields`.
    pub strict: bool,
}

impl Schema {
    pub fn new(fields: Vec<FieldRule>) -> Self {
        Self {
            fields,
            strict: false,
        }
    }

    pub fn strict(mut self) -> Self {
        self.strict = true;
        self
    }

    fn check(&self, payload: &Value) -> Vec<FieldError> {
        let Some(object) = payload.as_object() else {
            return vec![FieldError::new("body", "must be an object")];
        };

        let mut errors = Vec::new();
        for rule in &self.fields {
            match object.get(&rule.name) {
                Some(Value::Null) | None if rule.required => {
                    errors.push(FieldError::new(&rule.name, "is required"));
                }
                Some(Value::Null) | None => {}
                Some(value) => rule.check(value, &mut errors),
            }
        }

        if self.strict {
            for key in object.keys() {
                if !self.fields.iter().any(|rule| &rule.name == key) {
                    errors.push(FieldError::new(key, "is not allowed"));
                }
            }
        }
        errors
    }
}

/// In-process [`PayloadValidator`] keyed by schema id.
///
/// Unknown schema ids accept the payload unchanged.
#[derive(Debug, Clone, Default)]
pub struct SchemaRegistry {
    schemas: HashMap<String, Schema>,
}

impl SchemaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, schema_id: &str, schema: Schema) {
        self.schemas.insert(schema_id.to_string(), schema);
    }

    /// Registry preloaded with the schemas bound in the default endpoint catalog.
    pub fn with_builtin_schemas() -> Self {
        use FieldKind::*;

        let phone = || {
            FieldRule::new("phone_number", String)
                .required()
                .pattern(r"^\+?[0-9]{6,15}$")
        };

        let mut registry = Self::new();
        registry.register("auth.sms_send", Schema::new(vec![phone()]).strict());
        registry.register(
            "auth.sms_validate",
            Schema::new(vec![
                phone(),
                FieldRule::new("otp_code", String)
                    .required()
                    .pattern(r"^[0-9]{4,8}$"),
            ])
            .strict(),
        );
        registry.register(
            "message.send",
            Schema::new(vec![
                FieldRule::new("message", String).required().max_len(5000),
                FieldRule::new("tempId", String).max_len(64),
            ]),
        );
        registry.register(
            "profile.update",
            Schema::new(vec![
                FieldRule::new("bio", String).max_len(500),
                FieldRule::new("age_filter_min", Number).range(18.0, 100.0),
                FieldRule::new("age_filter_max", Number).range(18.0, 100.0),
                FieldRule::new("distance_filter", Number).range(1.0, 161.0),
                FieldRule::new("gender_filter", Number).range(-1.0, 1.0),
                FieldRule::new("discoverable", Bool),
            ])
            .strict(),
        );
        registry.register(
            "location.update",
            Schema::new(vec![
                FieldRule::new("lat", Number).required().range(-90.0, 90.0),
                FieldRule::new("lon", Number).required().range(-180.0, 180.0),
            ])
            .strict(),
        );
        registry
    }
}

impl PayloadValidator for SchemaRegistry {
    fn validate(&self, schema_id: &str, payload: &Value) -> Result<Value, Vec<FieldError>> {
        let Some(schema) = self.schemas.get(schema_id) else {
            tracing::warn!(schema = %schema_id, "no schema registered, payload accepted as-is");
            return Ok(payload.clone());
        };

        let errors = schema.check(payload);
        if errors.is_empty() {
            Ok(payload.clone())
        } else {
            Err(errors)
        }
    }
}

const BLOCKED_KEYS: &[&str] = &["__proto__", "constructor", "prototype"];

/// Default [`Sanitizer`]: drops prototype-pollution and operator keys,
/// truncates oversized strings and arrays, caps nesting depth, and
/// optionally strips markup from strings.
#[derive(Debug, Clone)]
pub struct DefaultSanitizer {
    pub max_string_len: usize,
    pub max_array_len: usize,
    pub max_depth: usize,
    script: Option<Regex>,
    tags: Option<Regex>,
}

impl DefaultSanitizer {
    pub fn new(strip_html: bool) -> Self {
        let (script, tags) = if strip_html {
            (
                Regex::new(r"(?is)<script\b[^>]*>.*?</script\s*>").ok(),
                Regex::new(r"(?s)<[^>]*>").ok(),
            )
        } else {
            (None, None)
        };

        Self {
            max_string_len: 10_000,
            max_array_len: 1_000,
            max_depth: 16,
            script,
            tags,
        }
    }

    fn clean_string(&self, s: String) -> String {
        let mut s = s;
        if let Some(script) = &self.script {
            s = script.replace_all(&s, "").into_owned();
        }
        if let Some(tags) = &self.tags {
            s = tags.replace_all(&s, "").into_owned();
        }
        if s.chars().count() > self.max_string_len {
            s = s.chars().take(self.max_string_len).collect();
        }
        s
    }

    fn clean(&self, value: Value, depth: usize) -> Value {
        if depth > self.max_depth {
            return Value::Null;
        }
        match value {
            Value::String(s) => Value::String(self.clean_string(s)),
            Value::Array(items) => Value::Array(
                items
                    .into_iter()
                    .take(self.max_array_len)
                    .map(|item| self.clean(item, depth + 1))
                    .collect(),
            ),
            Value::Object(map) => {
                let cleaned: Map<String, Value> = map
                    .into_iter()
                    .filter(|(key, _)| !BLOCKED_KEYS.contains(&key.as_str()) && !key.starts_with('$'))
                    .map(|(key, value)| (key, self.clean(value, depth + 1)))
                    .collect();
                Value::Object(cleaned)
            }
            other => other,
        }
    }
}

impl Default for DefaultSanitizer {
    fn default() -> Self {
        Self::new(true)
    }
}

impl Sanitizer for DefaultSanitizer {
    fn sanitize(&self, value: Value) -> Value {
        self.clean(value, 0)
    }
}
