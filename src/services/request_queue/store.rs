use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::cmp::Reverse;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};
use uuid::Uuid;

use super::{EnqueueOutcome, ItemStatus, QueueError, QueueItem};

/// Backing store for queue entries. `enqueue` must perform the dedup check
/// and the insert as one atomic step.
#[async_trait]
pub trait QueueStore: Send + Sync {
    async fn enqueue(&self, item: QueueItem) -> Result<EnqueueOutcome, QueueError>;

    /// Moves the best pending entry to `processing` and returns it.
    async fn pop_next(&self) -> Result<Option<QueueItem>, QueueError>;

    /// Forgets an in-flight entry and frees its `api_path_key`.
    async fn complete(&self, item: &QueueItem) -> Result<(), QueueError>;

    async fn items(&self) -> Result<Vec<QueueItem>, QueueError>;

    /// Drops all pending entries and returns how many were removed.
    async fn clear_pending(&self) -> Result<usize, QueueError>;

    /// Puts in-flight entries started before `started_before` back into the
    /// pending order. Their worker is presumed dead; the dedup key stays with
    /// the entry.
    async fn reclaim_stale(&self, started_before: DateTime<Utc>) -> Result<usize, QueueError>;
}

#[derive(Default)]
struct MemoryState {
    seq: u64,
    order: BTreeMap<(Reverse<i32>, u64), Uuid>,
    items: HashMap<Uuid, QueueItem>,
    by_key: HashMap<String, Uuid>,
}

/// Single-process store; one mutex covers dedup and insert.
#[derive(Default)]
pub struct MemoryQueueStore {
    state: Mutex<MemoryState>,
}

impl MemoryQueueStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl QueueStore for MemoryQueueStore {
    async fn enqueue(&self, item: QueueItem) -> Result<EnqueueOutcome, QueueError> {
        let mut state = self.state();
        if let Some(existing) = state.by_key.get(&item.api_path_key) {
            return Ok(EnqueueOutcome::Deduplicated(*existing));
        }

        state.seq += 1;
        let slot = (Reverse(item.priority), state.seq);
        let id = item.id;
        state.order.insert(slot, id);
        state.by_key.insert(item.api_path_key.clone(), id);
        state.items.insert(id, item);
        Ok(EnqueueOutcome::Enqueued(id))
    }

    async fn pop_next(&self) -> Result<Option<QueueItem>, QueueError> {
        let mut state = self.state();
        let Some((_, id)) = state.order.pop_first() else {
            return Ok(None);
        };
        let popped = state.items.get_mut(&id).map(|item| {
            item.status = ItemStatus::Processing;
            item.started_at = Some(Utc::now());
            item.clone()
        });
        Ok(popped)
    }

    async fn complete(&self, item: &QueueItem) -> Result<(), QueueError> {
        let mut state = self.state();
        state.items.remove(&item.id);
        if state.by_key.get(&item.api_path_key) == Some(&item.id) {
            state.by_key.remove(&item.api_path_key);
        }
        Ok(())
    }

    async fn items(&self) -> Result<Vec<QueueItem>, QueueError> {
        Ok(self.state().items.values().cloned().collect())
    }

    async fn clear_pending(&self) -> Result<usize, QueueError> {
        let mut state = self.state();
        let pending: Vec<Uuid> = std::mem::take(&mut state.order).into_values().collect();
        for id in &pending {
            if let Some(item) = state.items.remove(id) {
                state.by_key.remove(&item.api_path_key);
            }
        }
        Ok(pending.len())
    }

    async fn reclaim_stale(&self, started_before: DateTime<Utc>) -> Result<usize, QueueError> {
        let mut state = self.state();
        let stale: Vec<(i32, Uuid)> = state
            .items
            .values()
            .filter(|item| item.status == ItemStatus::Processing)
            .filter(|item| item.started_at.is_some_and(|at| at < started_before))
            .map(|item| (item.priority, item.id))
            .collect();

        for (priority, id) in &stale {
            if let Some(item) = state.items.get_mut(id) {
                item.status = ItemStatus::Pending;
                item.started_at = None;
            }
            state.seq += 1;
            let slot = (Reverse(*priority), state.seq);
            state.order.insert(slot, *id);
        }
        Ok(stale.len())
    }
}

const KEY_PREFIX: &str = "request_queue:";

/// Dedup check plus insert. Members are `<20-digit seq>:<id>` so entries with
/// equal score (negated priority) pop in insertion order.
const ENQUEUE_SCRIPT: &str = r#"
local existing = redis.call("HGET", KEYS[3], ARGV[1])
if existing then
    return {0, existing}
end
local seq = redis.call("INCR", KEYS[4])
redis.call("HSET", KEYS[2], ARGV[2], ARGV[3])
redis.call("HSET", KEYS[3], ARGV[1], ARGV[2])
redis.call("ZADD", KEYS[1], ARGV[4], string.format("%020d:%s", seq, ARGV[2]))
return {1, ARGV[2]}
"#;

const POP_SCRIPT: &str = r#"
while true do
    local head = redis.call("ZRANGE", KEYS[1], 0, 0)
    if #head == 0 then
        return false
    end
    redis.call("ZREM", KEYS[1], head[1])
    local id = string.sub(head[1], 22)
    local raw = redis.call("HGET", KEYS[2], id)
    if raw then
        redis.call("ZADD", KEYS[3], ARGV[1], id)
        return raw
    end
end
"#;

const COMPLETE_SCRIPT: &str = r#"
redis.call("HDEL", KEYS[1], ARGV[1])
redis.call("ZREM", KEYS[3], ARGV[1])
if redis.call("HGET", KEYS[2], ARGV[2]) == ARGV[1] then
    redis.call("HDEL", KEYS[2], ARGV[2])
end
return 1
"#;

const CLEAR_SCRIPT: &str = r#"
local members = redis.call("ZRANGE", KEYS[1], 0, -1)
for _, member in ipairs(members) do
    local id = string.sub(member, 22)
    local raw = redis.call("HGET", KEYS[2], id)
    if raw then
        local item = cjson.decode(raw)
        if redis.call("HGET", KEYS[3], item["api_path_key"]) == id then
            redis.call("HDEL", KEYS[3], item["api_path_key"])
        end
        redis.call("HDEL", KEYS[2], id)
    end
end
redis.call("DEL", KEYS[1])
return #members
"#;

/// Moves one stale in-flight entry back to pending, unless its worker
/// completed it since the scan. ARGV: id, reset item, score, cutoff millis.
const REQUEUE_SCRIPT: &str = r#"
local started = redis.call("ZSCORE", KEYS[3], ARGV[1])
if not started or tonumber(started) >= tonumber(ARGV[4]) then
    return 0
end
redis.call("ZREM", KEYS[3], ARGV[1])
if redis.call("HEXISTS", KEYS[2], ARGV[1]) == 0 then
    return 0
end
local seq = redis.call("INCR", KEYS[4])
redis.call("HSET", KEYS[2], ARGV[1], ARGV[2])
redis.call("ZADD", KEYS[1], ARGV[3], string.format("%020d:%s", seq, ARGV[1]))
return 1
"#;

/// Store shared by every process instance.
#[derive(Clone)]
pub struct RedisQueueStore {
    client: redis::Client,
    pending_key: String,
    items_key: String,
    keys_key: String,
    seq_key: String,
    processing_key: String,
}

impl RedisQueueStore {
    pub fn new(redis_url: &str) -> anyhow::Result<Self> {
        let client = redis::Client::open(redis_url)?;
        Ok(Self {
            client,
            pending_key: format!("{}pending", KEY_PREFIX),
            items_key: format!("{}items", KEY_PREFIX),
            keys_key: format!("{}keys", KEY_PREFIX),
            seq_key: format!("{}seq", KEY_PREFIX),
            // in-flight ids scored by start time in millis
            processing_key: format!("{}inflight", KEY_PREFIX),
        })
    }

    async fn connection(&self) -> Result<redis::aio::MultiplexedConnection, QueueError> {
        Ok(self.client.get_multiplexed_async_connection().await?)
    }
}

#[async_trait]
impl QueueStore for RedisQueueStore {
    async fn enqueue(&self, item: QueueItem) -> Result<EnqueueOutcome, QueueError> {
        let mut conn = self.connection().await?;
        let raw = serde_json::to_string(&item)?;

        let (inserted, id): (i64, String) = redis::Script::new(ENQUEUE_SCRIPT)
            .key(&self.pending_key)
            .key(&self.items_key)
            .key(&self.keys_key)
            .key(&self.seq_key)
            .arg(&item.api_path_key)
            .arg(item.id.to_string())
            .arg(raw)
            .arg(-i64::from(item.priority))
            .invoke_async(&mut conn)
            .await?;

        let id = Uuid::parse_str(&id).map_err(|e| QueueError::Store(e.to_string()))?;
        Ok(if inserted == 1 {
            EnqueueOutcome::Enqueued(id)
        } else {
            EnqueueOutcome::Deduplicated(id)
        })
    }

    async fn pop_next(&self) -> Result<Option<QueueItem>, QueueError> {
        let mut conn = self.connection().await?;
        let now = Utc::now();
        let raw: Option<String> = redis::Script::new(POP_SCRIPT)
            .key(&self.pending_key)
            .key(&self.items_key)
            .key(&self.processing_key)
            .arg(now.timestamp_millis())
            .invoke_async(&mut conn)
            .await?;

        let Some(raw) = raw else {
            return Ok(None);
        };
        let mut item: QueueItem = serde_json::from_str(&raw)?;
        item.status = ItemStatus::Processing;
        item.started_at = Some(now);

        // only the popping worker touches this entry from here on
        redis::cmd("HSET")
            .arg(&self.items_key)
            .arg(item.id.to_string())
            .arg(serde_json::to_string(&item)?)
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(Some(item))
    }

    async fn complete(&self, item: &QueueItem) -> Result<(), QueueError> {
        let mut conn = self.connection().await?;
        redis::Script::new(COMPLETE_SCRIPT)
            .key(&self.items_key)
            .key(&self.keys_key)
            .key(&self.processing_key)
            .arg(item.id.to_string())
            .arg(&item.api_path_key)
            .invoke_async::<_, i64>(&mut conn)
            .await?;
        Ok(())
    }

    async fn items(&self) -> Result<Vec<QueueItem>, QueueError> {
        let mut conn = self.connection().await?;
        let raw: HashMap<String, String> = redis::cmd("HGETALL")
            .arg(&self.items_key)
            .query_async(&mut conn)
            .await?;
        raw.values()
            .map(|value| serde_json::from_str(value).map_err(QueueError::from))
            .collect()
    }

    async fn clear_pending(&self) -> Result<usize, QueueError> {
        let mut conn = self.connection().await?;
        let dropped: i64 = redis::Script::new(CLEAR_SCRIPT)
            .key(&self.pending_key)
            .key(&self.items_key)
            .key(&self.keys_key)
            .invoke_async(&mut conn)
            .await?;
        Ok(usize::try_from(dropped).unwrap_or(0))
    }

    async fn reclaim_stale(&self, started_before: DateTime<Utc>) -> Result<usize, QueueError> {
        let mut conn = self.connection().await?;
        let cutoff = started_before.timestamp_millis();
        let stale: Vec<String> = redis::cmd("ZRANGEBYSCORE")
            .arg(&self.processing_key)
            .arg("-inf")
            .arg(format!("({}", cutoff))
            .query_async(&mut conn)
            .await?;

        let mut reclaimed = 0;
        for id in stale {
            let raw: Option<String> = redis::cmd("HGET")
                .arg(&self.items_key)
                .arg(&id)
                .query_async(&mut conn)
                .await?;
            let Some(raw) = raw else {
                redis::cmd("ZREM")
                    .arg(&self.processing_key)
                    .arg(&id)
                    .query_async::<_, i64>(&mut conn)
                    .await?;
                continue;
            };

            let mut item: QueueItem = serde_json::from_str(&raw)?;
            item.status = ItemStatus::Pending;
            item.started_at = None;

            let moved: i64 = redis::Script::new(REQUEUE_SCRIPT)
                .key(&self.pending_key)
                .key(&self.items_key)
                .key(&self.processing_key)
                .key(&self.seq_key)
                .arg(&id)
                .arg(serde_json::to_string(&item)?)
                .arg(-i64::from(item.priority))
                .arg(cutoff)
                .invoke_async(&mut conn)
                .await?;
            reclaimed += usize::from(moved == 1);
        }
        Ok(reclaimed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn item(key: &str, priority: i32) -> QueueItem {
        QueueItem {
            id: Uuid::new_v4(),
            api_path_key: key.to_string(),
            method: "GET".to_string(),
            url: "/quote".to_string(),
            request_function_id: "dex.http".to_string(),
            callback_function_id: "log".to_string(),
            headers: BTreeMap::new(),
            body: None,
            query_params: BTreeMap::new(),
            priority,
            attempt: 0,
            status: ItemStatus::Pending,
            enqueued_at: Utc::now(),
            started_at: None,
        }
    }

    #[tokio::test]
    async fn test_pops_by_priority_then_fifo() {
        let store = MemoryQueueStore::new();
        for (key, priority) in [("low-1", 0), ("high", 10), ("low-2", 0), ("mid", 5)] {
            store.enqueue(item(key, priority)).await.unwrap();
        }

        let mut order = Vec::new();
        while let Some(next) = store.pop_next().await.unwrap() {
            assert_eq!(next.status, ItemStatus::Processing);
            order.push(next.api_path_key);
        }
        assert_eq!(order, vec!["high", "mid", "low-1", "low-2"]);
    }

    #[tokio::test]
    async fn test_in_flight_entry_still_deduplicates_until_completed() {
        let store = MemoryQueueStore::new();
        let first = item("pairs", 0);
        let first_id = first.id;
        store.enqueue(first).await.unwrap();

        let popped = store.pop_next().await.unwrap().unwrap();
        assert_eq!(
            store.enqueue(item("pairs", 0)).await.unwrap(),
            EnqueueOutcome::Deduplicated(first_id)
        );

        store.complete(&popped).await.unwrap();
        assert!(matches!(
            store.enqueue(item("pairs", 0)).await.unwrap(),
            EnqueueOutcome::Enqueued(_)
        ));
    }

    #[tokio::test]
    async fn test_stale_in_flight_entry_returns_to_pending() {
        let store = MemoryQueueStore::new();
        store.enqueue(item("orphan", 3)).await.unwrap();
        let popped = store.pop_next().await.unwrap().unwrap();

        // started after the cutoff, so still owned by its worker
        let earlier = popped.started_at.unwrap() - chrono::Duration::seconds(1);
        assert_eq!(store.reclaim_stale(earlier).await.unwrap(), 0);
        assert!(store.pop_next().await.unwrap().is_none());

        let later = Utc::now() + chrono::Duration::seconds(1);
        assert_eq!(store.reclaim_stale(later).await.unwrap(), 1);
        let items = store.items().await.unwrap();
        assert_eq!(items[0].status, ItemStatus::Pending);
        assert!(items[0].started_at.is_none());

        let again = store.pop_next().await.unwrap().unwrap();
        assert_eq!(again.id, popped.id);
        assert_eq!(again.priority, 3);
    }

    #[tokio::test]
    async fn test_clear_keeps_in_flight_entries() {
        let store = MemoryQueueStore::new();
        store.enqueue(item("a", 0)).await.unwrap();
        store.enqueue(item("b", 0)).await.unwrap();
        let in_flight = store.pop_next().await.unwrap().unwrap();

        assert_eq!(store.clear_pending().await.unwrap(), 1);
        let remaining = store.items().await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].id, in_flight.id);
    }
}
