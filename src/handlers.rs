use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::{HeaderMap, Method as HttpMethod},
    response::IntoResponse,
    Extension, Json,
};
use serde::Deserialize;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use validator::Validate;

use crate::error::{FieldError, GatewayError, Result};
use crate::gateway::Gateway;
use crate::health::HealthStatus;
use crate::middleware::ClientIp;
use crate::request::{field_errors, validate_user_id, Method, NormalizedRequest, QueryValue};
use crate::response::{LoginResponse, LogoutResponse, RateLimitsResponse, ReadyResponse};

/// Shared application state
pub type SharedState = Arc<Gateway>;

/// Header carrying the caller's user id on proxied requests.
pub const USER_ID_HEADER: &str = "x-user-id";

#[derive(Debug, Deserialize, Validate)]
pub struct LoginRequest {
    #[validate(custom(function = "validate_user_id"))]
    pub user_id: String,
    #[validate(length(min = 1, message = "refresh_token must not be empty"))]
    pub refresh_token: String,
}

/// Exchange a refresh token for an upstream session
pub async fn login(
    State(gateway): State<SharedState>,
    Json(payload): Json<LoginRequest>,
) -> Result<Json<LoginResponse>> {
    payload
        .validate()
        .map_err(|e| GatewayError::validation("Invalid login request", field_errors(&e)))?;

    let record = gateway
        .auth()
        .login(&payload.user_id, &payload.refresh_token)
        .await?;

    Ok(Json(LoginResponse {
        user_id: payload.user_id,
        expires_at: record.expires_at,
    }))
}

/// Drop a user's stored session
pub async fn logout(
    State(gateway): State<SharedState>,
    Path(user_id): Path<String>,
) -> Json<LogoutResponse> {
    let removed = gateway.auth().logout(&user_id);
    Json(LogoutResponse { user_id, removed })
}

/// Current quota snapshot for a user
pub async fn get_rate_limits(
    State(gateway): State<SharedState>,
    Path(user_id): Path<String>,
) -> Json<RateLimitsResponse> {
    let limiter = gateway.rate_limiter();
    Json(RateLimitsResponse {
        capabilities: limiter.snapshot(&user_id),
        global: limiter.global_status(),
        user_id,
    })
}

/// Forward a call to upstream through the request pipeline
pub async fn proxy(
    State(gateway): State<SharedState>,
    client_ip: Option<Extension<ClientIp>>,
    method: HttpMethod,
    Path(path): Path<String>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>> {
    let request = normalized_request(&method, &path, query, &headers, &body)?;
    let client = client_ip.map(|Extension(ClientIp(ip))| ip);

    let value = gateway
        .pipeline()
        .process_from(request, client.as_deref())
        .await?;
    Ok(Json(value))
}

/// Builds the pipeline input from the raw HTTP pieces.
fn normalized_request(
    method: &HttpMethod,
    path: &str,
    query: HashMap<String, String>,
    headers: &HeaderMap,
    body: &[u8],
) -> Result<NormalizedRequest> {
    let method: Method = method.as_str().parse()?;

    let body = if body.is_empty() {
        None
    } else {
        Some(serde_json::from_slice::<Value>(body).map_err(|e| {
            GatewayError::validation(
                "Request body must be JSON",
                vec![FieldError::new("body", e.to_string())],
            )
        })?)
    };

    let mut header_map = BTreeMap::new();
    for (name, value) in headers {
        if let Ok(value) = value.to_str() {
            header_map.insert(name.as_str().to_string(), value.to_string());
        }
    }

    Ok(NormalizedRequest {
        method,
        endpoint: format!("/{}", path.trim_start_matches('/')),
        user_id: header_map.get(USER_ID_HEADER).cloned(),
        headers: header_map,
        body,
        query: query
            .into_iter()
            .map(|(key, value)| (key, QueryValue::Str(value)))
            .collect(),
    })
}

/// Health check endpoint
pub async fn health_check(State(gateway): State<SharedState>) -> Json<HealthStatus> {
    Json(gateway.health())
}

/// Readiness check endpoint
pub async fn readiness_check(State(gateway): State<SharedState>) -> impl IntoResponse {
    Json(ReadyResponse::ready(&gateway.config().upstream_base_url))
}
