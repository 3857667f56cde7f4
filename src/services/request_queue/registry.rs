use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

use super::{EnqueueRequest, QueueItem, RequestQueue};

pub const LOG_CALLBACK_ID: &str = "log";
pub const RETRY_CALLBACK_ID: &str = "retry";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RequestFailure {
    pub message: String,
    /// Upstream HTTP status, when one was received.
    pub status: Option<u16>,
}

impl RequestFailure {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            status: None,
        }
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }
}

/// Performs the outbound call for a queue entry.
#[async_trait]
pub trait RequestFunction: Send + Sync {
    async fn call(&self, item: &QueueItem) -> Result<Value, RequestFailure>;
}

/// Receives every completed call, successful or not. Owns the retry decision.
#[async_trait]
pub trait CallbackFunction: Send + Sync {
    async fn on_complete(&self, item: &QueueItem, result: &Result<Value, RequestFailure>, queue: &RequestQueue);
}

/// Handler tables, filled once at startup and shared read-only afterwards.
#[derive(Default)]
pub struct HandlerRegistry {
    requests: HashMap<String, Arc<dyn RequestFunction>>,
    callbacks: HashMap<String, Arc<dyn CallbackFunction>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_request_function(&mut self, id: impl Into<String>, handler: Arc<dyn RequestFunction>) {
        let id = id.into();
        if self.requests.insert(id.clone(), handler).is_some() {
            tracing::warn!(id = %id, "request function registered twice, keeping the latest");
        }
    }

    pub fn register_callback_function(&mut self, id: impl Into<String>, handler: Arc<dyn CallbackFunction>) {
        let id = id.into();
        if self.callbacks.insert(id.clone(), handler).is_some() {
            tracing::warn!(id = %id, "callback function registered twice, keeping the latest");
        }
    }

    pub fn request(&self, id: &str) -> Option<Arc<dyn RequestFunction>> {
        self.requests.get(id).cloned()
    }

    pub fn callback(&self, id: &str) -> Option<Arc<dyn CallbackFunction>> {
        self.callbacks.get(id).cloned()
    }
}

/// Logs the outcome and does nothing else.
pub struct LogCallback;

#[async_trait]
impl CallbackFunction for LogCallback {
    async fn on_complete(&self, item: &QueueItem, result: &Result<Value, RequestFailure>, _queue: &RequestQueue) {
        match result {
            Ok(_) => tracing::info!(
                queue_id = %item.id,
                api_path_key = %item.api_path_key,
                attempt = item.attempt,
                "queued request succeeded"
            ),
            Err(failure) => tracing::warn!(
                queue_id = %item.id,
                api_path_key = %item.api_path_key,
                attempt = item.attempt,
                status = ?failure.status,
                "queued request failed: {}",
                failure.message
            ),
        }
    }
}

/// Re-enqueues failed calls until `max_attempts` have been made, then hands
/// the final result to `inner`.
pub struct RetryingCallback {
    inner: Arc<dyn CallbackFunction>,
    max_attempts: u32,
}

impl RetryingCallback {
    pub fn new(inner: Arc<dyn CallbackFunction>, max_attempts: u32) -> Self {
        Self {
            inner,
            max_attempts: max_attempts.max(1),
        }
    }
}

#[async_trait]
impl CallbackFunction for RetryingCallback {
    async fn on_complete(&self, item: &QueueItem, result: &Result<Value, RequestFailure>, queue: &RequestQueue) {
        if result.is_err() && item.attempt + 1 < self.max_attempts {
            match queue.enqueue(EnqueueRequest::retry_of(item)).await {
                Ok(outcome) => {
                    tracing::info!(
                        queue_id = %outcome.id(),
                        api_path_key = %item.api_path_key,
                        attempt = item.attempt + 1,
                        "failed request re-enqueued"
                    );
                    return;
                }
                Err(e) => {
                    tracing::error!(api_path_key = %item.api_path_key, error = %e, "failed to re-enqueue request");
                }
            }
        }
        self.inner.on_complete(item, result, queue).await;
    }
}

/// Registry with the built-in callbacks (`log`, and `retry` wrapping `log`).
pub fn with_builtin_callbacks(max_attempts: u32) -> HandlerRegistry {
    let mut registry = HandlerRegistry::new();
    let log: Arc<dyn CallbackFunction> = Arc::new(LogCallback);
    registry.register_callback_function(LOG_CALLBACK_ID, log.clone());
    registry.register_callback_function(RETRY_CALLBACK_ID, Arc::new(RetryingCallback::new(log, max_attempts)));
    registry
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Noop;

    #[async_trait]
    impl RequestFunction for Noop {
        async fn call(&self, _item: &QueueItem) -> Result<Value, RequestFailure> {
            Ok(Value::Null)
        }
    }

    #[test]
    fn test_lookup_by_id() {
        let mut registry = with_builtin_callbacks(3);
        registry.register_request_function("noop", Arc::new(Noop));

        assert!(registry.request("noop").is_some());
        assert!(registry.request("log").is_none());
        assert!(registry.callback(LOG_CALLBACK_ID).is_some());
        assert!(registry.callback(RETRY_CALLBACK_ID).is_some());
    }
}
