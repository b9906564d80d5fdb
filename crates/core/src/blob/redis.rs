//! Redis-backed blob store.
//!
//! Uses a [`ConnectionManager`] so transient connection loss is retried
//! internally; commands surface errors as [`StoreError::Blob`].

use std::collections::HashMap;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;

use crate::blob::BlobStore;
use crate::error::StoreError;

/// Blob store over a redis hash per shard.
#[derive(Clone)]
pub struct RedisBlobStore {
    conn: ConnectionManager,
}

impl RedisBlobStore {
    /// Connects to redis at `addr` (`host:port`).
    pub async fn connect(addr: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(format!("redis://{addr}"))
            .map_err(|e| StoreError::Blob(e.to_string()))?;
        let conn = client
            .get_connection_manager()
            .await
            .map_err(|e| StoreError::Blob(e.to_string()))?;
        Ok(Self { conn })
    }
}

#[async_trait]
impl BlobStore for RedisBlobStore {
    async fn hget(&self, key: &str, field: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let mut conn = self.conn.clone();
        conn.hget(key, field)
            .await
            .map_err(|e| StoreError::Blob(e.to_string()))
    }

    async fn hset(&self, key: &str, field: &str, value: &[u8]) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        conn.hset::<_, _, _, ()>(key, field, value)
            .await
            .map_err(|e| StoreError::Blob(e.to_string()))
    }

    async fn hdel(&self, key: &str, field: &str) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        conn.hdel::<_, _, ()>(key, field)
            .await
            .map_err(|e| StoreError::Blob(e.to_string()))
    }

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, Vec<u8>>, StoreError> {
        let mut conn = self.conn.clone();
        conn.hgetall(key)
            .await
            .map_err(|e| StoreError::Blob(e.to_string()))
    }
}
