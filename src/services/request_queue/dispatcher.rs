use governor::{Quota, RateLimiter};
use std::num::NonZeroU32;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::{debug, error, info};

use super::registry::RequestFailure;
use super::{QueueError, QueueItem, RequestQueue};

/// Slack on top of the request timeout before an in-flight entry is
/// considered orphaned.
const RECLAIM_MARGIN: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct DispatcherSettings {
    pub requests_per_second: u32,
    pub request_timeout: Duration,
    pub poll_interval: Duration,
}

impl DispatcherSettings {
    /// Age after which an in-flight entry can no longer belong to a live worker.
    pub fn stale_after(&self) -> Duration {
        self.request_timeout + RECLAIM_MARGIN
    }
}

/// The single consumer loop for this process. Sleeps until an enqueue wakes
/// it or the poll interval elapses, whichever comes first.
pub async fn run_dispatcher(queue: RequestQueue, settings: DispatcherSettings) {
    let rate = NonZeroU32::new(settings.requests_per_second).unwrap_or(NonZeroU32::MIN);
    let limiter = RateLimiter::direct(Quota::per_second(rate));

    queue.set_running(true);
    info!(requests_per_second = rate.get(), "request queue dispatcher started");

    let stale_after = settings.stale_after();
    reclaim(&queue, stale_after).await;
    let mut last_reclaim = Instant::now();

    loop {
        if last_reclaim.elapsed() >= stale_after {
            reclaim(&queue, stale_after).await;
            last_reclaim = Instant::now();
        }

        limiter.until_ready().await;

        match dispatch_next(&queue, settings.request_timeout).await {
            Ok(true) => continue,
            Ok(false) => {
                tokio::select! {
                    _ = queue.wakeup().notified() => {}
                    _ = sleep(settings.poll_interval) => {}
                }
            }
            Err(e) => {
                error!(error = %e, "dispatcher error");
                sleep(settings.poll_interval).await;
            }
        }
    }
}

async fn reclaim(queue: &RequestQueue, stale_after: Duration) {
    if let Err(e) = queue.reclaim_stale(stale_after).await {
        error!(error = %e, "failed to reclaim stale queue entries");
    }
}

/// Runs one entry if any is pending. Returns whether an entry was processed.
pub async fn dispatch_next(queue: &RequestQueue, timeout: Duration) -> Result<bool, QueueError> {
    let Some(item) = queue.store().pop_next().await? else {
        return Ok(false);
    };
    execute(queue, item, timeout).await;
    Ok(true)
}

async fn execute(queue: &RequestQueue, item: QueueItem, timeout: Duration) {
    debug!(queue_id = %item.id, api_path_key = %item.api_path_key, attempt = item.attempt, "dispatching request");

    let result = match queue.registry().request(&item.request_function_id) {
        Some(handler) => match tokio::time::timeout(timeout, handler.call(&item)).await {
            Ok(result) => result,
            Err(_) => Err(RequestFailure::new(format!(
                "request timed out after {}ms",
                timeout.as_millis()
            ))),
        },
        None => Err(RequestFailure::new(format!(
            "no request function registered under '{}'",
            item.request_function_id
        ))),
    };

    // free the dedup key first so the callback may enqueue the same key again
    if let Err(e) = queue.store().complete(&item).await {
        error!(queue_id = %item.id, error = %e, "failed to complete queue entry");
    }

    match queue.registry().callback(&item.callback_function_id) {
        Some(callback) => callback.on_complete(&item, &result, queue).await,
        None => error!(
            queue_id = %item.id,
            callback = %item.callback_function_id,
            "no callback registered, dropping result"
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::request_queue::registry::{
        with_builtin_callbacks, CallbackFunction, HandlerRegistry, RequestFunction, RETRY_CALLBACK_ID,
    };
    use crate::services::request_queue::store::MemoryQueueStore;
    use crate::services::request_queue::EnqueueRequest;
    use async_trait::async_trait;
    use serde_json::Value;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::{Arc, Mutex};

    struct AlwaysFails(Arc<AtomicU32>);

    #[async_trait]
    impl RequestFunction for AlwaysFails {
        async fn call(&self, _item: &QueueItem) -> Result<Value, RequestFailure> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Err(RequestFailure::new("upstream down").with_status(502))
        }
    }

    struct Slow;

    #[async_trait]
    impl RequestFunction for Slow {
        async fn call(&self, _item: &QueueItem) -> Result<Value, RequestFailure> {
            sleep(Duration::from_secs(5)).await;
            Ok(Value::Null)
        }
    }

    #[derive(Default)]
    struct Recorder(Mutex<Vec<Result<Value, RequestFailure>>>);

    #[async_trait]
    impl CallbackFunction for Recorder {
        async fn on_complete(&self, _item: &QueueItem, result: &Result<Value, RequestFailure>, _queue: &RequestQueue) {
            self.0.lock().unwrap().push(result.clone());
        }
    }

    fn request(request_fn: &str, callback_fn: &str) -> EnqueueRequest {
        EnqueueRequest {
            api_path_key: "GET:/v1/quote".to_string(),
            method: "GET".to_string(),
            url: "/v1/quote".to_string(),
            request_function_id: request_fn.to_string(),
            callback_function_id: callback_fn.to_string(),
            headers: BTreeMap::new(),
            body: None,
            query_params: BTreeMap::new(),
            priority: 0,
            attempt: 0,
        }
    }

    #[tokio::test]
    async fn test_failure_is_not_retried_by_the_queue() {
        let calls = Arc::new(AtomicU32::new(0));
        let recorder = Arc::new(Recorder::default());
        let mut registry = HandlerRegistry::new();
        registry.register_request_function("fail", Arc::new(AlwaysFails(calls.clone())));
        registry.register_callback_function("record", recorder.clone());
        let queue = RequestQueue::new(Arc::new(MemoryQueueStore::new()), Arc::new(registry));

        queue.enqueue(request("fail", "record")).await.unwrap();
        assert!(dispatch_next(&queue, Duration::from_secs(1)).await.unwrap());
        assert!(!dispatch_next(&queue, Duration::from_secs(1)).await.unwrap());

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let results = recorder.0.lock().unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].as_ref().unwrap_err().status, Some(502));
    }

    #[tokio::test]
    async fn test_retrying_callback_re_enqueues_up_to_max_attempts() {
        let calls = Arc::new(AtomicU32::new(0));
        let mut registry = with_builtin_callbacks(3);
        registry.register_request_function("fail", Arc::new(AlwaysFails(calls.clone())));
        let queue = RequestQueue::new(Arc::new(MemoryQueueStore::new()), Arc::new(registry));

        queue.enqueue(request("fail", RETRY_CALLBACK_ID)).await.unwrap();
        while dispatch_next(&queue, Duration::from_secs(1)).await.unwrap() {}

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(queue.status().await.unwrap().pending, 0);
    }

    #[tokio::test]
    async fn test_timeout_is_reported_to_callback() {
        let recorder = Arc::new(Recorder::default());
        let mut registry = HandlerRegistry::new();
        registry.register_request_function("slow", Arc::new(Slow));
        registry.register_callback_function("record", recorder.clone());
        let queue = RequestQueue::new(Arc::new(MemoryQueueStore::new()), Arc::new(registry));

        queue.enqueue(request("slow", "record")).await.unwrap();
        dispatch_next(&queue, Duration::from_millis(20)).await.unwrap();

        let results = recorder.0.lock().unwrap();
        assert!(results[0].as_ref().unwrap_err().message.contains("timed out"));
    }
}
