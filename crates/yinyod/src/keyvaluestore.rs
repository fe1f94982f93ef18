//! Key-value store adapter for per-run metadata.
//!
//! Keys are namespaced `<run-id>/<subkey>`; deleting a run removes every
//! key under its prefix. Only `increment` needs atomicity (it backs the
//! API network counters); everything else is last-write-wins.

use async_trait::async_trait;
use std::collections::HashMap;
use thiserror::Error;
use tokio::sync::Mutex;

#[derive(Debug, Error)]
pub enum KeyValueStoreError {
    #[error("key does not exist")]
    KeyNotExist,
    #[error("key value store error: {0}")]
    Backend(String),
}

impl From<redis::RedisError> for KeyValueStoreError {
    fn from(err: redis::RedisError) -> Self {
        Self::Backend(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, KeyValueStoreError>;

/// Capability interface over the metadata store.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<String>;
    async fn set(&self, key: &str, value: &str) -> Result<()>;
    /// Deleting a missing key is not an error.
    async fn delete(&self, key: &str) -> Result<()>;
    /// Remove every key starting with `prefix`.
    async fn delete_prefix(&self, prefix: &str) -> Result<()>;
    /// Atomically add `delta` to an integer value, creating it at 0 first
    /// if absent. Returns the new value.
    async fn increment(&self, key: &str, delta: i64) -> Result<i64>;
}

/// Redis-backed store used in the cluster deployment.
#[derive(Clone)]
pub struct RedisKeyValueStore {
    conn: redis::aio::ConnectionManager,
}

impl std::fmt::Debug for RedisKeyValueStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisKeyValueStore").finish_non_exhaustive()
    }
}

impl RedisKeyValueStore {
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url)?;
        let conn = client.get_connection_manager().await?;
        Ok(Self { conn })
    }

    pub fn new(conn: redis::aio::ConnectionManager) -> Self {
        Self { conn }
    }
}

#[async_trait]
impl KeyValueStore for RedisKeyValueStore {
    async fn get(&self, key: &str) -> Result<String> {
        let mut conn = self.conn.clone();
        let value: Option<String> = redis::cmd("GET")
            .arg(key)
            .query_async(&mut conn)
            .await?;
        value.ok_or(KeyValueStoreError::KeyNotExist)
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        redis::cmd("SET")
            .arg(key)
            .arg(value)
            .query_async::<()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        redis::cmd("DEL")
            .arg(key)
            .query_async::<()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let keys: Vec<String> = redis::cmd("KEYS")
            .arg(format!("{prefix}*"))
            .query_async(&mut conn)
            .await?;
        if keys.is_empty() {
            return Ok(());
        }
        let mut del = redis::cmd("DEL");
        for key in &keys {
            del.arg(key);
        }
        del.query_async::<()>(&mut conn).await?;
        Ok(())
    }

    async fn increment(&self, key: &str, delta: i64) -> Result<i64> {
        let mut conn = self.conn.clone();
        let value: i64 = redis::cmd("INCRBY")
            .arg(key)
            .arg(delta)
            .query_async(&mut conn)
            .await?;
        Ok(value)
    }
}

/// In-memory store used by tests and local runs.
#[derive(Debug, Default)]
pub struct MemoryKeyValueStore {
    data: Mutex<HashMap<String, String>>,
}

impl MemoryKeyValueStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KeyValueStore for MemoryKeyValueStore {
    async fn get(&self, key: &str) -> Result<String> {
        self.data
            .lock()
            .await
            .get(key)
            .cloned()
            .ok_or(KeyValueStoreError::KeyNotExist)
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        self.data
            .lock()
            .await
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.data.lock().await.remove(key);
        Ok(())
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<()> {
        self.data
            .lock()
            .await
            .retain(|key, _| !key.starts_with(prefix));
        Ok(())
    }

    async fn increment(&self, key: &str, delta: i64) -> Result<i64> {
        let mut data = self.data.lock().await;
        let current = match data.get(key) {
            Some(value) => value
                .parse::<i64>()
                .map_err(|e| KeyValueStoreError::Backend(format!("non-integer value: {e}")))?,
            None => 0,
        };
        let next = current + delta;
        data.insert(key.to_string(), next.to_string());
        Ok(next)
    }
}
