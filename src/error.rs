use axum::{
    http::{HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

/// Error taxonomy exposed to gateway callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    AuthenticationFailed,
    RateLimitExceeded,
    ValidationError,
    ApiError,
    NetworkError,
    UnknownError,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AuthenticationFailed => "AUTHENTICATION_FAILED",
            Self::RateLimitExceeded => "RATE_LIMIT_EXCEEDED",
            Self::ValidationError => "VALIDATION_ERROR",
            Self::ApiError => "API_ERROR",
            Self::NetworkError => "NETWORK_ERROR",
            Self::UnknownError => "UNKNOWN_ERROR",
        }
    }
}

/// A single rejected field and why.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldError {
    pub field: String,
    pub reason: String,
}

impl FieldError {
    pub fn new(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Clone, Error)]
pub enum GatewayError {
    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("{message}")]
    RateLimitExceeded { message: String, reset_at: u64 },

    #[error("Validation error: {message}")]
    Validation {
        message: String,
        details: Vec<FieldError>,
        status: u16,
    },

    #[error("Upstream API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("Network error: {0}")]
    Network(String),

    #[error("Unknown error: {0}")]
    Unknown(String),
}

pub type Result<T> = std::result::Result<T, GatewayError>;

impl GatewayError {
    pub fn validation(message: impl Into<String>, details: Vec<FieldError>) -> Self {
        Self::Validation {
            message: message.into(),
            details,
            status: 400,
        }
    }

    pub fn payload_too_large(size: usize, limit: usize) -> Self {
        Self::Validation {
            message: format!("Request body of {} bytes exceeds the {} byte limit", size, limit),
            details: vec![FieldError::new("body", "payload too large")],
            status: 413,
        }
    }

    pub fn rate_limited(message: impl Into<String>, reset_at: u64) -> Self {
        Self::RateLimitExceeded {
            message: message.into(),
            reset_at,
        }
    }

    pub fn code(&self) -> ErrorCode {
        match self {
            Self::AuthenticationFailed(_) => ErrorCode::AuthenticationFailed,
            Self::RateLimitExceeded { .. } => ErrorCode::RateLimitExceeded,
            Self::Validation { .. } => ErrorCode::ValidationError,
            Self::Api { .. } => ErrorCode::ApiError,
            Self::Network(_) => ErrorCode::NetworkError,
            Self::Unknown(_) => ErrorCode::UnknownError,
        }
    }

    pub fn http_status(&self) -> u16 {
        match self {
            Self::AuthenticationFailed(_) => 401,
            Self::RateLimitExceeded { .. } => 429,
            Self::Validation { status, .. } => *status,
            Self::Api { status, .. } => *status,
            Self::Network(_) => 503,
            Self::Unknown(_) => 500,
        }
    }

    pub fn reset_at(&self) -> Option<u64> {
        match self {
            Self::RateLimitExceeded { reset_at, .. } => Some(*reset_at),
            _ => None,
        }
    }

    pub fn to_response(&self) -> ErrorResponse {
        let details = match self {
            Self::RateLimitExceeded { reset_at, .. } => {
                Some(serde_json::json!({ "resetAt": reset_at }))
            }
            Self::Validation { details, .. } if !details.is_empty() => {
                serde_json::to_value(details).ok()
            }
            _ => None,
        };

        ErrorResponse {
            code: self.code(),
            message: self.to_string(),
            details,
            http_status: Some(self.http_status()),
        }
    }
}

/// Structured error body returned to callers.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorResponse {
    pub code: ErrorCode,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub http_status: Option<u16>,
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let body = self.to_response();
        let mut response = (status, Json(body)).into_response();

        if let Some(reset_at) = self.reset_at() {
            let now = crate::clock::Clock::now_millis(&crate::clock::SystemClock);
            let retry_after_secs = reset_at.saturating_sub(now).div_ceil(1000);
            if let Ok(value) = HeaderValue::from_str(&retry_after_secs.to_string()) {
                response.headers_mut().insert("retry-after", value);
            }
        }

        response
    }
}
