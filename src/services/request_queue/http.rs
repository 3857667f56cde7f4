use async_trait::async_trait;
use failsafe::futures::CircuitBreaker as FuturesCircuitBreaker;
use failsafe::{backoff, failure_policy, Config, Error as FailsafeError, StateMachine};
use reqwest::{Client, Method};
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;

use super::registry::{RequestFailure, RequestFunction};
use super::QueueItem;

pub const DEX_HTTP_REQUEST_ID: &str = "dex.http";

#[derive(Error, Debug)]
pub enum DexError {
    #[error("HTTP request failed: {0}")]
    RequestError(#[from] reqwest::Error),
    #[error("DEX API returned HTTP {status}: {body}")]
    HttpStatus { status: u16, body: String },
    #[error("DEX API returned code {code:?}: {message}")]
    UnexpectedCode { code: Option<i64>, message: String },
    #[error("Invalid response from DEX API: {0}")]
    InvalidResponse(String),
    #[error("Circuit breaker open: {0}")]
    CircuitBreakerOpen(String),
}

impl DexError {
    /// Transport and 5xx failures trip the breaker; business rejections do not.
    fn is_upstream_failure(&self) -> bool {
        match self {
            DexError::RequestError(_) => true,
            DexError::HttpStatus { status, .. } => *status >= 500,
            _ => false,
        }
    }
}

impl From<DexError> for RequestFailure {
    fn from(err: DexError) -> Self {
        let failure = RequestFailure::new(err.to_string());
        match err {
            DexError::HttpStatus { status, .. } => failure.with_status(status),
            _ => failure,
        }
    }
}

/// HTTP client for the third-party DEX/market-data API, registered in the
/// queue as [`DEX_HTTP_REQUEST_ID`].
#[derive(Clone)]
pub struct DexHttpClient {
    client: Client,
    base_url: String,
    api_key: Option<String>,
    success_code: i64,
    circuit_breaker: StateMachine<failure_policy::ConsecutiveFailures<backoff::EqualJittered>, ()>,
}

impl DexHttpClient {
    pub fn new(base_url: String, api_key: Option<String>, success_code: i64, timeout: Duration) -> Self {
        let client = Client::builder().timeout(timeout).build().unwrap_or_default();

        let backoff = backoff::equal_jittered(Duration::from_secs(30), Duration::from_secs(60));
        let policy = failure_policy::consecutive_failures(5, backoff);
        let circuit_breaker = Config::new().failure_policy(policy).build();

        DexHttpClient {
            client,
            base_url,
            api_key,
            success_code,
            circuit_breaker,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Returns the current state of the circuit breaker
    pub fn circuit_state(&self) -> String {
        if self.circuit_breaker.is_call_permitted() {
            "closed".to_string()
        } else {
            "open".to_string()
        }
    }

    /// Reachability check for health reporting; any HTTP answer counts.
    pub async fn probe(&self) -> Result<u16, DexError> {
        if !self.circuit_breaker.is_call_permitted() {
            return Err(DexError::CircuitBreakerOpen(
                "DEX API circuit breaker is open".to_string(),
            ));
        }
        let response = self.client.get(&self.base_url).send().await?;
        Ok(response.status().as_u16())
    }

    fn resolve(&self, url: &str) -> String {
        if url.starts_with("http://") || url.starts_with("https://") {
            url.to_string()
        } else {
            format!(
                "{}/{}",
                self.base_url.trim_end_matches('/'),
                url.trim_start_matches('/')
            )
        }
    }

    pub async fn send(&self, item: &QueueItem) -> Result<Value, DexError> {
        let method = Method::from_bytes(item.method.as_bytes())
            .map_err(|_| DexError::InvalidResponse(format!("unsupported method {}", item.method)))?;

        let mut request = self
            .client
            .request(method, self.resolve(&item.url))
            .query(&item.query_params);
        for (name, value) in &item.headers {
            request = request.header(name.as_str(), value.as_str());
        }
        if let Some(api_key) = &self.api_key {
            request = request.header("x-api-key", api_key.as_str());
        }
        if let Some(body) = &item.body {
            request = request.json(body);
        }
        let success_code = self.success_code;

        let result = self
            .circuit_breaker
            .call_with(DexError::is_upstream_failure, async move {
                let response = request.send().await?;
                let status = response.status();
                if !status.is_success() {
                    let body = response.text().await.unwrap_or_default();
                    return Err(DexError::HttpStatus {
                        status: status.as_u16(),
                        body,
                    });
                }

                let payload = response.json::<Value>().await?;
                check_code(&payload, success_code)?;
                Ok(payload)
            })
            .await;

        match result {
            Ok(payload) => Ok(payload),
            Err(FailsafeError::Rejected) => Err(DexError::CircuitBreakerOpen(
                "DEX API circuit breaker is open".to_string(),
            )),
            Err(FailsafeError::Inner(e)) => Err(e),
        }
    }
}

fn check_code(payload: &Value, success_code: i64) -> Result<(), DexError> {
    let code = match payload.get("code") {
        Some(Value::Number(n)) => n.as_i64(),
        Some(Value::String(s)) => s.trim().parse().ok(),
        _ => None,
    };
    if code == Some(success_code) {
        return Ok(());
    }

    let message = payload
        .get("msg")
        .or_else(|| payload.get("message"))
        .and_then(Value::as_str)
        .unwrap_or("missing or unexpected status code")
        .to_string();
    Err(DexError::UnexpectedCode { code, message })
}

#[async_trait]
impl RequestFunction for DexHttpClient {
    async fn call(&self, item: &QueueItem) -> Result<Value, RequestFailure> {
        self.send(item).await.map_err(RequestFailure::from)
    }
}
