//! HTTP transport boundary.
//!
//! The rest of the crate talks to the server through the narrow [`Transport`]
//! trait: three verbs, decoded JSON in, decoded JSON out. Non-2xx statuses
//! come back as values so the classifier can make the retry decision;
//! only connection failures, deadline overruns, and undecodable success
//! bodies are transport errors. Implementations never retry internally.

use crate::config::{ClientConfig, ConfigError};
use crate::error::RawFailure;
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, AUTHORIZATION, RETRY_AFTER};
use serde_json::Value;
use std::time::Duration;

/// A decoded HTTP exchange. `status` may be any code; bodies that are not
/// JSON on a non-2xx response decode to `Value::Null` rather than failing.
#[derive(Debug, Clone)]
pub struct TransportResponse {
    pub status: u16,
    pub body: Value,
    /// Parsed `Retry-After` header, when present and in seconds form.
    pub retry_after: Option<Duration>,
}

impl TransportResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// The body of a 2xx response, or the classifier-ready failure for
    /// anything else. Non-2xx bodies contribute their `message` field when
    /// they have one.
    pub fn into_success_body(self) -> Result<Value, RawFailure> {
        if self.is_success() {
            return Ok(self.body);
        }
        let message = self
            .body
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| format!("HTTP {}", self.status));
        Err(RawFailure::Http { status: self.status, retry_after: self.retry_after, message })
    }
}

impl From<TransportError> for RawFailure {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Connect(message) => RawFailure::Connect(message),
            TransportError::Timeout { limit } => RawFailure::Timeout { limit },
            TransportError::Decode(message) => RawFailure::Parse(message),
        }
    }
}

/// Failures below the HTTP layer.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    #[error("connection failed: {0}")]
    Connect(String),
    #[error("request deadline of {limit:?} exceeded")]
    Timeout { limit: Duration },
    #[error("2xx response body is not valid JSON: {0}")]
    Decode(String),
}

/// The capability the client engine needs from HTTP.
///
/// Implementations must be safe for concurrent use and must honor the
/// per-call timeout they were constructed with.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn get(&self, path: &str) -> Result<TransportResponse, TransportError>;
    async fn post(&self, path: &str, body: &Value) -> Result<TransportResponse, TransportError>;
    async fn delete(&self, path: &str) -> Result<TransportResponse, TransportError>;
}

/// Production transport backed by a pooled reqwest client.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    http: reqwest::Client,
    base_url: String,
    timeout: Duration,
}

impl HttpTransport {
    /// Build from configuration: bearer auth and extra headers become
    /// default headers, the per-call timeout is enforced on every request.
    pub fn new(config: &ClientConfig) -> Result<Self, ConfigError> {
        let mut headers = HeaderMap::new();
        if let Some(key) = &config.api_key {
            let value = HeaderValue::from_str(&format!("Bearer {key}"))
                .map_err(|_| ConfigError::InvalidHeader(AUTHORIZATION.to_string()))?;
            headers.insert(AUTHORIZATION, value);
        }
        for (name, value) in &config.extra_headers {
            let header_name = name
                .parse::<HeaderName>()
                .map_err(|_| ConfigError::InvalidHeader(name.clone()))?;
            let header_value = HeaderValue::from_str(value)
                .map_err(|_| ConfigError::InvalidHeader(name.clone()))?;
            headers.insert(header_name, header_value);
        }

        let http = reqwest::Client::builder()
            .default_headers(headers)
            .build()
            .map_err(|e| ConfigError::InvalidHeader(e.to_string()))?;

        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            timeout: config.timeout_per_call,
        })
    }

    fn url(&self, path: &str) -> String {
        join_url(&self.base_url, path)
    }

    async fn execute(
        &self,
        request: reqwest::RequestBuilder,
    ) -> Result<TransportResponse, TransportError> {
        let response = request.timeout(self.timeout).send().await.map_err(|e| {
            if e.is_timeout() {
                TransportError::Timeout { limit: self.timeout }
            } else {
                TransportError::Connect(e.to_string())
            }
        })?;

        let status = response.status().as_u16();
        let retry_after = parse_retry_after(response.headers());
        let bytes = response
            .bytes()
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;

        let body = if bytes.is_empty() {
            Value::Null
        } else {
            match serde_json::from_slice(&bytes) {
                Ok(value) => value,
                // Error pages are often HTML; the status code is what matters.
                Err(e) if !(200..300).contains(&status) => {
                    tracing::debug!(status, "non-JSON error body: {e}");
                    Value::Null
                }
                Err(e) => return Err(TransportError::Decode(e.to_string())),
            }
        };

        Ok(TransportResponse { status, body, retry_after })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn get(&self, path: &str) -> Result<TransportResponse, TransportError> {
        self.execute(self.http.get(self.url(path))).await
    }

    async fn post(&self, path: &str, body: &Value) -> Result<TransportResponse, TransportError> {
        self.execute(self.http.post(self.url(path)).json(body)).await
    }

    async fn delete(&self, path: &str) -> Result<TransportResponse, TransportError> {
        self.execute(self.http.delete(self.url(path))).await
    }
}

fn join_url(base: &str, path: &str) -> String {
    format!("{}/{}", base.trim_end_matches('/'), path.trim_start_matches('/'))
}

fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    let seconds = headers.get(RETRY_AFTER)?.to_str().ok()?.trim().parse::<u64>().ok()?;
    Some(Duration::from_secs(seconds))
}
