//! Vector records and xid helpers.
//!
//! A [`VectorRecord`] is the unit persisted per vector in the blob store:
//! the raw f32 components plus an expiry timestamp. Records are serialized
//! with bincode (length-prefixed vec, little-endian scalars) under field
//! key `{xid:016x}` of hash `shard:<id>`.

use std::hash::Hasher;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use twox_hash::XxHash64;

use crate::error::StoreError;

/// Sentinel xid meaning "no match" in search responses and "generate one
/// for me" in add requests.
pub const XID_NONE: u64 = u64::MAX;

/// A stored vector with its expiry timestamp (epoch seconds).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VectorRecord {
    pub vec: Vec<f32>,
    pub expire_at: i64,
}

impl VectorRecord {
    /// Builds a record expiring `valid_seconds` from now.
    pub fn new(vec: Vec<f32>, valid_seconds: i64) -> Self {
        Self {
            vec,
            expire_at: unix_now() + valid_seconds,
        }
    }

    /// Serializes the record for blob storage.
    pub fn encode(&self) -> Result<Vec<u8>, StoreError> {
        bincode::serialize(self).map_err(|e| StoreError::Corrupt(e.to_string()))
    }

    /// Deserializes a record read back from blob storage.
    pub fn decode(bytes: &[u8]) -> Result<Self, StoreError> {
        bincode::deserialize(bytes).map_err(|e| StoreError::Corrupt(e.to_string()))
    }
}

/// Current time as epoch seconds.
pub fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Derives an xid from a vector: XXH64 over the little-endian byte
/// representation of its components.
///
/// Deterministic, so identical vectors always map to identical xids.
pub fn allocate_xid(vec: &[f32]) -> u64 {
    let mut bytes = Vec::with_capacity(vec.len() * 4);
    for v in vec {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    let mut h = XxHash64::with_seed(0);
    h.write(&bytes);
    h.finish()
}

/// Formats an xid as the 16-digit lower-hex blob field key.
pub fn xid_key(xid: u64) -> String {
    format!("{xid:016x}")
}

/// Parses a blob field key back into an xid.
pub fn parse_xid_key(key: &str) -> Result<u64, StoreError> {
    u64::from_str_radix(key, 16)
        .map_err(|e| StoreError::Corrupt(format!("bad xid key {key:?}: {e}")))
}
