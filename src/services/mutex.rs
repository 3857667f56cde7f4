//! Lease-based mutual exclusion across process instances.
//!
//! A lease expires after its TTL so a crashed holder cannot block a key
//! forever. Release only deletes the key if the caller still owns it.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};
use thiserror::Error;
use uuid::Uuid;

const KEY_PREFIX: &str = "mutex:";

/// Deletes the key only when it still carries our token.
const RELEASE_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
else
    return 0
end
"#;

#[derive(Error, Debug)]
pub enum MutexError {
    #[error("mutex store unavailable: {0}")]
    Unavailable(String),
}

impl From<redis::RedisError> for MutexError {
    fn from(err: redis::RedisError) -> Self {
        MutexError::Unavailable(err.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub key: String,
    token: String,
}

#[async_trait]
pub trait DistributedMutex: Send + Sync {
    /// Returns `None` when another holder owns an unexpired lease on `key`.
    async fn try_acquire(&self, key: &str, ttl: Duration) -> Result<Option<Lease>, MutexError>;

    async fn release(&self, lease: &Lease) -> Result<(), MutexError>;
}

#[derive(Clone)]
pub struct RedisMutex {
    client: redis::Client,
}

impl RedisMutex {
    pub fn new(redis_url: &str) -> anyhow::Result<Self> {
        let client = redis::Client::open(redis_url)?;
        Ok(Self { client })
    }
}

#[async_trait]
impl DistributedMutex for RedisMutex {
    async fn try_acquire(&self, key: &str, ttl: Duration) -> Result<Option<Lease>, MutexError> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let full_key = format!("{}{}", KEY_PREFIX, key);
        let token = Uuid::new_v4().to_string();

        let acquired: Option<String> = redis::cmd("SET")
            .arg(&full_key)
            .arg(&token)
            .arg("NX")
            .arg("PX")
            .arg(ttl.as_millis() as u64)
            .query_async(&mut conn)
            .await?;

        Ok(acquired.map(|_| Lease { key: full_key, token }))
    }

    async fn release(&self, lease: &Lease) -> Result<(), MutexError> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let _: i64 = redis::Script::new(RELEASE_SCRIPT)
            .key(&lease.key)
            .arg(&lease.token)
            .invoke_async(&mut conn)
            .await?;
        Ok(())
    }
}

/// Single-process lease table, used when no Redis is configured and in tests.
#[derive(Default)]
pub struct LocalMutex {
    leases: Mutex<HashMap<String, (String, Instant)>>,
}

impl LocalMutex {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DistributedMutex for LocalMutex {
    async fn try_acquire(&self, key: &str, ttl: Duration) -> Result<Option<Lease>, MutexError> {
        let mut leases = self.leases.lock().unwrap_or_else(PoisonError::into_inner);
        let now = Instant::now();

        if let Some((_, expires_at)) = leases.get(key) {
            if *expires_at > now {
                return Ok(None);
            }
        }

        let token = Uuid::new_v4().to_string();
        leases.insert(key.to_string(), (token.clone(), now + ttl));
        Ok(Some(Lease {
            key: key.to_string(),
            token,
        }))
    }

    async fn release(&self, lease: &Lease) -> Result<(), MutexError> {
        let mut leases = self.leases.lock().unwrap_or_else(PoisonError::into_inner);
        if leases.get(&lease.key).is_some_and(|(token, _)| *token == lease.token) {
            leases.remove(&lease.key);
        }
        Ok(())
    }
}
