//! Blob store adapter: cold persistence for shard vectors.
//!
//! Each shard persists its vectors as fields of a single hash keyed
//! `shard:<id>`; field names are 16-digit lower-hex xids and values are
//! bincode-encoded [`VectorRecord`](crate::record::VectorRecord)s. The trait
//! mirrors the four hash operations the engine needs. Production uses
//! [`RedisBlobStore`](redis::RedisBlobStore); tests use [`MemoryBlobStore`].

pub mod redis;

use std::collections::HashMap;

use async_trait::async_trait;

use crate::error::StoreError;

/// Hash key for a shard's blob map.
pub fn shard_key(db_id: i64) -> String {
    format!("shard:{db_id}")
}

/// Hash-field operations against the external blob store.
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn hget(&self, key: &str, field: &str) -> Result<Option<Vec<u8>>, StoreError>;
    async fn hset(&self, key: &str, field: &str, value: &[u8]) -> Result<(), StoreError>;
    async fn hdel(&self, key: &str, field: &str) -> Result<(), StoreError>;
    async fn hgetall(&self, key: &str) -> Result<HashMap<String, Vec<u8>>, StoreError>;
}

/// In-process blob store used by unit and cluster tests.
#[derive(Default)]
pub struct MemoryBlobStore {
    maps: parking_lot::Mutex<HashMap<String, HashMap<String, Vec<u8>>>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn hget(&self, key: &str, field: &str) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self
            .maps
            .lock()
            .get(key)
            .and_then(|m| m.get(field))
            .cloned())
    }

    async fn hset(&self, key: &str, field: &str, value: &[u8]) -> Result<(), StoreError> {
        self.maps
            .lock()
            .entry(key.to_string())
            .or_default()
            .insert(field.to_string(), value.to_vec());
        Ok(())
    }

    async fn hdel(&self, key: &str, field: &str) -> Result<(), StoreError> {
        if let Some(m) = self.maps.lock().get_mut(key) {
            m.remove(field);
        }
        Ok(())
    }

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, Vec<u8>>, StoreError> {
        Ok(self.maps.lock().get(key).cloned().unwrap_or_default())
    }
}
