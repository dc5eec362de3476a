//! Outbound HTTP to payment providers.
//!
//! Adapters build provider requests and hand them to an [`HttpTransport`].
//! [`RetryingTransport`] wraps any transport with the retry policy and maps
//! HTTP failures onto the crate's error taxonomy.

use crate::config::HttpSettings;
use crate::error::{PaymentError, Result};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RequestBody {
    Empty,
    Json(Value),
    Form(Vec<(String, String)>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct HttpRequest {
    /// Provider name, used for error reporting.
    pub gateway: String,
    pub method: Method,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub basic_auth: Option<(String, String)>,
    pub body: RequestBody,
}

impl HttpRequest {
    pub fn new(gateway: &str, method: Method, url: impl Into<String>) -> Self {
        Self {
            gateway: gateway.to_string(),
            method,
            url: url.into(),
            headers: Vec::new(),
            basic_auth: None,
            body: RequestBody::Empty,
        }
    }

    pub fn header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.push((name.to_string(), value.into()));
        self
    }

    pub fn bearer(self, token: &str) -> Self {
        self.header("Authorization", format!("Bearer {token}"))
    }

    pub fn basic_auth(mut self, user: &str, password: &str) -> Self {
        self.basic_auth = Some((user.to_string(), password.to_string()));
        self
    }

    pub fn json(mut self, body: Value) -> Self {
        self.body = RequestBody::Json(body);
        self
    }

    pub fn form(mut self, fields: Vec<(String, String)>) -> Self {
        self.body = RequestBody::Form(fields);
        self
    }

    pub fn header_value(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct HttpResponse {
    pub status: u16,
    pub body: Value,
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Best-effort provider error message for logs and error values.
    pub fn error_message(&self) -> String {
        let body = &self.body;
        body.pointer("/error/message")
            .or_else(|| body.pointer("/message"))
            .or_else(|| body.pointer("/error_description"))
            .or_else(|| body.pointer("/error"))
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| format!("HTTP {}", self.status))
    }
}

/// Sends one request. Implementations return `Ok` for any HTTP response and
/// `GatewayUnavailable` only when no response was received.
#[async_trait]
pub trait HttpTransport: Send + Sync {
    async fn send(&self, request: &HttpRequest) -> Result<HttpResponse>;
}

pub type HttpTransportBox = Arc<dyn HttpTransport>;

/// `reqwest` transport with a bounded per-request timeout.
#[derive(Clone)]
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .use_rustls_tls()
            .timeout(timeout)
            .build()
            .map_err(|e| PaymentError::InternalError(Box::new(e)))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn send(&self, request: &HttpRequest) -> Result<HttpResponse> {
        let mut builder = match request.method {
            Method::Get => self.client.get(&request.url),
            Method::Post => self.client.post(&request.url),
        };
        for (name, value) in &request.headers {
            builder = builder.header(name, value);
        }
        if let Some((user, password)) = &request.basic_auth {
            builder = builder.basic_auth(user, Some(password));
        }
        builder = match &request.body {
            RequestBody::Empty => builder,
            RequestBody::Json(value) => builder.json(value),
            RequestBody::Form(fields) => builder.form(fields),
        };

        let response = builder
            .send()
            .await
            .map_err(|e| PaymentError::GatewayUnavailable {
                gateway: request.gateway.clone(),
                message: e.to_string(),
            })?;
        let status = response.status().as_u16();
        let bytes = response
            .bytes()
            .await
            .map_err(|e| PaymentError::GatewayUnavailable {
                gateway: request.gateway.clone(),
                message: e.to_string(),
            })?;
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes)
                .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&bytes).into_owned()))
        };
        Ok(HttpResponse { status, body })
    }
}

/// Upstream statuses worth retrying. Everything else is final.
pub fn is_transient_status(status: u16) -> bool {
    matches!(status, 502 | 503 | 504 | 522)
}

/// Maps a non-success response onto the error taxonomy.
pub fn classify_response(request: &HttpRequest, response: HttpResponse) -> Result<HttpResponse> {
    if response.is_success() {
        return Ok(response);
    }
    let gateway = request.gateway.clone();
    let message = response.error_message();
    Err(match response.status {
        401 | 403 => PaymentError::GatewayAuthError { gateway, message },
        s if is_transient_status(s) || s >= 500 || s == 429 => {
            PaymentError::GatewayUnavailable { gateway, message }
        }
        _ => PaymentError::GatewayRejected { gateway, message },
    })
}

/// Sends `request` and returns the body of a successful response.
pub async fn send_json(transport: &HttpTransportBox, request: &HttpRequest) -> Result<Value> {
    let response = transport.send(request).await?;
    classify_response(request, response).map(|r| r.body)
}

/// Retries transient failures with exponential backoff and converts
/// non-success responses into typed errors.
///
/// The wrapped request is resent unchanged, so its idempotency header keeps
/// the provider from creating a second charge.
pub struct RetryingTransport {
    inner: HttpTransportBox,
    max_attempts: u32,
    backoff_base: Duration,
}

impl RetryingTransport {
    pub fn new(inner: HttpTransportBox, max_attempts: u32, backoff_base: Duration) -> Self {
        Self {
            inner,
            max_attempts: max_attempts.max(1),
            backoff_base,
        }
    }

    pub fn from_settings(inner: HttpTransportBox, settings: &HttpSettings) -> Self {
        Self::new(inner, settings.max_attempts, settings.backoff_base())
    }

    fn backoff(&self, attempt: u32) -> Duration {
        self.backoff_base * 2u32.saturating_pow(attempt.saturating_sub(1))
    }
}

#[async_trait]
impl HttpTransport for RetryingTransport {
    async fn send(&self, request: &HttpRequest) -> Result<HttpResponse> {
        let mut attempt = 1;
        loop {
            let retryable = match self.inner.send(request).await {
                Ok(response) if is_transient_status(response.status) => {
                    classify_response(request, response)
                }
                Ok(response) => return classify_response(request, response),
                Err(e @ PaymentError::GatewayUnavailable { .. }) => Err(e),
                Err(e) => return Err(e),
            };
            if attempt >= self.max_attempts {
                return retryable;
            }
            let delay = self.backoff(attempt);
            warn!(
                gateway = %request.gateway,
                url = %request.url,
                attempt,
                delay_ms = delay.as_millis() as u64,
                "transient provider failure, retrying"
            );
            tokio::time::sleep(delay).await;
            attempt += 1;
            debug!(gateway = %request.gateway, attempt, "resending request");
        }
    }
}
