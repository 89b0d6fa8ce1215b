//! Outbound HTTP to the upstream API.
//!
//! [`Transport`] performs exactly one attempt; [`UpstreamClient`] layers the
//! retry policy and fixed client-identification headers on top of it.

use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::error::GatewayError;
use crate::request::Method;

const MAX_ERROR_MESSAGE_LEN: usize = 256;

#[derive(Debug, Clone)]
pub struct OutboundRequest {
    pub method: Method,
    pub path: String,
    pub query: Vec<(String, String)>,
    pub headers: BTreeMap<String, String>,
    pub body: Option<Value>,
}

impl OutboundRequest {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            query: Vec::new(),
            headers: BTreeMap::new(),
            body: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct UpstreamResponse {
    pub status: u16,
    pub headers: BTreeMap<String, String>,
    /// Parsed JSON, the raw text as a string when not JSON, or `Null` when empty.
    pub body: Value,
}

impl UpstreamResponse {
    pub fn new(status: u16, body: Value) -> Self {
        Self {
            status,
            headers: BTreeMap::new(),
            body,
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn is_server_error(&self) -> bool {
        self.status >= 500
    }

    /// Short, sanitized description of an error body.
    pub fn error_message(&self) -> String {
        let message = match &self.body {
            Value::Object(map) => map
                .get("message")
                .or_else(|| map.get("error"))
                .and_then(|v| v.as_str().map(str::to_string))
                .unwrap_or_else(|| "upstream request failed".to_string()),
            Value::String(text) if !text.is_empty() => text.clone(),
            _ => "upstream request failed".to_string(),
        };

        if message.chars().count() > MAX_ERROR_MESSAGE_LEN {
            let truncated: String = message.chars().take(MAX_ERROR_MESSAGE_LEN).collect();
            format!("{}... (truncated)", truncated)
        } else {
            message
        }
    }
}

#[derive(Debug, Clone, Error)]
pub enum TransportError {
    #[error("connection timed out")]
    Timeout,
    #[error("{0}")]
    Connection(String),
    #[error("invalid outbound request: {0}")]
    InvalidRequest(String),
}

impl TransportError {
    pub fn is_retryable(&self) -> bool {
        !matches!(self, TransportError::InvalidRequest(_))
    }
}

/// A single attempt at an upstream call.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, request: &OutboundRequest) -> Result<UpstreamResponse, TransportError>;
}

/// `reqwest`-backed transport bound to one base URL.
pub struct ReqwestTransport {
    client: Client,
    base_url: String,
}

impl ReqwestTransport {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, GatewayError> {
        let client = Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout.min(Duration::from_secs(5)))
            .pool_idle_timeout(Duration::from_secs(30))
            .redirect(reqwest::redirect::Policy::none())
            .tcp_nodelay(true)
            .build()
            .map_err(|e| {
                tracing::error!(error = %e, "failed to build http client");
                GatewayError::Unknown(format!("HTTP client build failed: {}", e))
            })?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn sanitize_network_error(error: &reqwest::Error) -> TransportError {
        if error.is_timeout() {
            TransportError::Timeout
        } else if error.is_connect() {
            TransportError::Connection("connection refused or unreachable".to_string())
        } else if error.is_body() || error.is_decode() {
            TransportError::Connection("response body error".to_string())
        } else if error.is_builder() {
            TransportError::InvalidRequest("request could not be built".to_string())
        } else {
            TransportError::Connection("network error".to_string())
        }
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn send(&self, request: &OutboundRequest) -> Result<UpstreamResponse, TransportError> {
        let url = format!("{}{}", self.base_url, request.path);
        let mut builder = self.client.request(request.method.into(), &url);

        if !request.query.is_empty() {
            builder = builder.query(&request.query);
        }
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| Self::sanitize_network_error(&e))?;

        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();

        let text = response
            .text()
            .await
            .map_err(|e| Self::sanitize_network_error(&e))?;
        let body = if text.trim().is_empty() {
            Value::Null
        } else {
            serde_json::from_str(&text).unwrap_or(Value::String(text))
        };

        Ok(UpstreamResponse {
            status,
            headers,
            body,
        })
    }
}

/// Exponential backoff: the wait after failed attempt `n` (0-based) is `2^n * base_delay`.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(100),
        }
    }
}

impl RetryPolicy {
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay * (1u32 << attempt.min(16))
    }
}

pub struct UpstreamClient {
    transport: Arc<dyn Transport>,
    retry: RetryPolicy,
    default_headers: BTreeMap<String, String>,
}

impl UpstreamClient {
    pub fn new(
        transport: Arc<dyn Transport>,
        retry: RetryPolicy,
        default_headers: BTreeMap<String, String>,
    ) -> Self {
        Self {
            transport,
            retry,
            default_headers,
        }
    }

    /// Adds the fixed client-identification headers, overriding caller values.
    pub fn attach_default_headers(&self, headers: &mut BTreeMap<String, String>) {
        for (name, value) in &self.default_headers {
            headers.insert(name.clone(), value.clone());
        }
    }

    /// Sends `request`, retrying network failures and 5xx responses.
    ///
    /// 4xx responses are returned on the first attempt. When retries run out
    /// the last 5xx response is returned as-is, while a network failure
    /// becomes [`GatewayError::Network`].
    pub async fn send(&self, request: &OutboundRequest) -> Result<UpstreamResponse, GatewayError> {
        let mut attempt = 0u32;
        loop {
            match self.transport.send(request).await {
                Ok(response) if !response.is_server_error() => return Ok(response),
                Ok(response) if attempt >= self.retry.max_retries => {
                    tracing::error!(
                        endpoint = %request.path,
                        status = response.status,
                        attempts = attempt + 1,
                        "upstream returned 5xx after all retries"
                    );
                    return Ok(response);
                }
                Ok(response) => {
                    let delay = self.retry.delay_for(attempt);
                    tracing::debug!(
                        endpoint = %request.path,
                        status = response.status,
                        attempt = attempt + 1,
                        max_retries = self.retry.max_retries,
                        delay_ms = delay.as_millis() as u64,
                        "upstream returned 5xx, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) if !e.is_retryable() => {
                    tracing::error!(endpoint = %request.path, error = %e, "upstream request rejected");
                    return Err(GatewayError::Unknown(e.to_string()));
                }
                Err(e) if attempt >= self.retry.max_retries => {
                    tracing::error!(
                        endpoint = %request.path,
                        error = %e,
                        attempts = attempt + 1,
                        "upstream request failed after all retries"
                    );
                    return Err(GatewayError::Network(e.to_string()));
                }
                Err(e) => {
                    let delay = self.retry.delay_for(attempt);
                    tracing::debug!(
                        endpoint = %request.path,
                        error = %e,
                        attempt = attempt + 1,
                        max_retries = self.retry.max_retries,
                        delay_ms = delay.as_millis() as u64,
                        "upstream request failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
            attempt += 1;
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Transport double that replays a script and records what it was sent.
    #[derive(Default)]
    pub struct ScriptedTransport {
        script: Mutex<VecDeque<Result<UpstreamResponse, TransportError>>>,
        pub sent: Mutex<Vec<OutboundRequest>>,
    }

    impl ScriptedTransport {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn respond(self, status: u16, body: Value) -> Self {
            self.push(Ok(UpstreamResponse::new(status, body)));
            self
        }

        pub fn fail(self, error: TransportError) -> Self {
            self.push(Err(error));
            self
        }

        pub fn push(&self, outcome: Result<UpstreamResponse, TransportError>) {
            self.script.lock().unwrap().push_back(outcome);
        }

        pub fn calls(&self) -> usize {
            self.sent.lock().unwrap().len()
        }

        pub fn last_sent(&self) -> Option<OutboundRequest> {
            self.sent.lock().unwrap().last().cloned()
        }
    }

    #[async_trait]
    impl Transport for ScriptedTransport {
        async fn send(&self, request: &OutboundRequest) -> Result<UpstreamResponse, TransportError> {
            self.sent.lock().unwrap().push(request.clone());
            self.script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(TransportError::Connection("script exhausted".into())))
        }
    }
}
