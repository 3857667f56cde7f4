//! Deduplicating, priority-ordered queue for outbound calls to a
//! rate-limited third-party API.
//!
//! Entries are keyed by `api_path_key`: while one entry for a key is pending
//! or in flight, further enqueues return that entry's id. A single
//! dispatcher task per process pops entries highest priority first (FIFO
//! within a priority), runs the registered request function and hands the
//! result to the registered callback. The queue never retries on its own.

pub mod dispatcher;
pub mod http;
pub mod registry;
pub mod store;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Notify;
use uuid::Uuid;

use crate::validation;
use registry::HandlerRegistry;
use store::QueueStore;

pub use dispatcher::{run_dispatcher, DispatcherSettings};
pub use registry::{CallbackFunction, RequestFailure, RequestFunction};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum QueueError {
    #[error("no {kind} function registered under '{id}'")]
    UnknownHandler { kind: &'static str, id: String },

    #[error("invalid queue request: {0}")]
    Invalid(String),

    #[error("queue store error: {0}")]
    Store(String),
}

impl QueueError {
    pub fn code(&self) -> &'static str {
        match self {
            QueueError::UnknownHandler { .. } => "UNKNOWN_HANDLER",
            QueueError::Invalid(_) => "INVALID_QUEUE_REQUEST",
            QueueError::Store(_) => "QUEUE_STORE_ERROR",
        }
    }
}

impl From<redis::RedisError> for QueueError {
    fn from(err: redis::RedisError) -> Self {
        QueueError::Store(err.to_string())
    }
}

impl From<serde_json::Error> for QueueError {
    fn from(err: serde_json::Error) -> Self {
        QueueError::Store(format!("corrupt queue item: {}", err))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemStatus {
    Pending,
    Processing,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueItem {
    pub id: Uuid,
    pub api_path_key: String,
    pub method: String,
    pub url: String,
    pub request_function_id: String,
    pub callback_function_id: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub body: Option<Value>,
    #[serde(default)]
    pub query_params: BTreeMap<String, String>,
    pub priority: i32,
    pub attempt: u32,
    pub status: ItemStatus,
    pub enqueued_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EnqueueRequest {
    pub api_path_key: String,
    pub method: String,
    pub url: String,
    pub request_function_id: String,
    pub callback_function_id: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub body: Option<Value>,
    #[serde(default)]
    pub query_params: BTreeMap<String, String>,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub attempt: u32,
}

impl EnqueueRequest {
    /// Same call again, one attempt later.
    pub fn retry_of(item: &QueueItem) -> Self {
        Self {
            api_path_key: item.api_path_key.clone(),
            method: item.method.clone(),
            url: item.url.clone(),
            request_function_id: item.request_function_id.clone(),
            callback_function_id: item.callback_function_id.clone(),
            headers: item.headers.clone(),
            body: item.body.clone(),
            query_params: item.query_params.clone(),
            priority: item.priority,
            attempt: item.attempt + 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "result", content = "id", rename_all = "snake_case")]
pub enum EnqueueOutcome {
    Enqueued(Uuid),
    /// An entry with the same `api_path_key` was already pending or in flight.
    Deduplicated(Uuid),
}

impl EnqueueOutcome {
    pub fn id(&self) -> Uuid {
        match self {
            EnqueueOutcome::Enqueued(id) | EnqueueOutcome::Deduplicated(id) => *id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueueStatus {
    pub pending: usize,
    pub processing: usize,
    pub dispatcher_running: bool,
}

#[derive(Clone)]
pub struct RequestQueue {
    store: Arc<dyn QueueStore>,
    registry: Arc<HandlerRegistry>,
    wakeup: Arc<Notify>,
    running: Arc<AtomicBool>,
}

impl RequestQueue {
    pub fn new(store: Arc<dyn QueueStore>, registry: Arc<HandlerRegistry>) -> Self {
        Self {
            store,
            registry,
            wakeup: Arc::new(Notify::new()),
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn registry(&self) -> &HandlerRegistry {
        &self.registry
    }

    pub(crate) fn store(&self) -> &dyn QueueStore {
        self.store.as_ref()
    }

    pub(crate) fn wakeup(&self) -> &Notify {
        &self.wakeup
    }

    pub(crate) fn set_running(&self, running: bool) {
        self.running.store(running, Ordering::SeqCst);
    }

    pub async fn enqueue(&self, request: EnqueueRequest) -> Result<EnqueueOutcome, QueueError> {
        validate(&request)?;
        if self.registry.request(&request.request_function_id).is_none() {
            return Err(QueueError::UnknownHandler {
                kind: "request",
                id: request.request_function_id,
            });
        }
        if self.registry.callback(&request.callback_function_id).is_none() {
            return Err(QueueError::UnknownHandler {
                kind: "callback",
                id: request.callback_function_id,
            });
        }

        let item = QueueItem {
            id: Uuid::new_v4(),
            api_path_key: request.api_path_key,
            method: request.method.to_ascii_uppercase(),
            url: request.url,
            request_function_id: request.request_function_id,
            callback_function_id: request.callback_function_id,
            headers: request.headers,
            body: request.body,
            query_params: request.query_params,
            priority: request.priority,
            attempt: request.attempt,
            status: ItemStatus::Pending,
            enqueued_at: Utc::now(),
            started_at: None,
        };
        let api_path_key = item.api_path_key.clone();

        let outcome = self.store.enqueue(item).await?;
        match outcome {
            EnqueueOutcome::Enqueued(id) => {
                tracing::debug!(queue_id = %id, api_path_key = %api_path_key, "request enqueued");
                self.wakeup.notify_one();
            }
            EnqueueOutcome::Deduplicated(id) => {
                tracing::debug!(queue_id = %id, api_path_key = %api_path_key, "request deduplicated");
            }
        }
        Ok(outcome)
    }

    pub async fn status(&self) -> Result<QueueStatus, QueueError> {
        let items = self.store.items().await?;
        let processing = items
            .iter()
            .filter(|item| item.status == ItemStatus::Processing)
            .count();
        Ok(QueueStatus {
            pending: items.len() - processing,
            processing,
            dispatcher_running: self.running.load(Ordering::SeqCst),
        })
    }

    /// In-flight entries first, then pending entries in dispatch order.
    pub async fn items(&self) -> Result<Vec<QueueItem>, QueueError> {
        let mut items = self.store.items().await?;
        items.sort_by(|a, b| {
            (b.status == ItemStatus::Processing)
                .cmp(&(a.status == ItemStatus::Processing))
                .then(b.priority.cmp(&a.priority))
                .then(a.enqueued_at.cmp(&b.enqueued_at))
        });
        Ok(items)
    }

    /// Re-queues entries that have been in flight longer than `older_than`,
    /// as left behind by a worker that died between pop and completion.
    pub async fn reclaim_stale(&self, older_than: Duration) -> Result<usize, QueueError> {
        let age = chrono::Duration::from_std(older_than).map_err(|e| QueueError::Invalid(e.to_string()))?;
        let reclaimed = self.store.reclaim_stale(Utc::now() - age).await?;
        if reclaimed > 0 {
            tracing::warn!(reclaimed, "re-queued stale in-flight requests");
            self.wakeup.notify_one();
        }
        Ok(reclaimed)
    }

    /// Drops pending entries; in-flight calls finish normally.
    pub async fn clear(&self) -> Result<usize, QueueError> {
        let dropped = self.store.clear_pending().await?;
        tracing::info!(dropped, "request queue cleared");
        Ok(dropped)
    }
}

fn validate(request: &EnqueueRequest) -> Result<(), QueueError> {
    let invalid = |e: validation::ValidationError| QueueError::Invalid(e.to_string());
    validation::validate_api_path_key(&request.api_path_key).map_err(invalid)?;
    validation::validate_http_method(&request.method.to_ascii_uppercase()).map_err(invalid)?;
    validation::validate_required("url", &request.url).map_err(invalid)?;
    Ok(())
}
