//! Ownership directory: shard-id → owning node, authoritative in the KV.
//!
//! Acquire is a single create-if-absent transaction, so for every shard at
//! most one ownership record can exist at any revision. Only the leader
//! acquires on behalf of requesters; followers reach it over the acquire
//! RPC. Release deletes the key unconditionally.

use std::collections::HashMap;
use std::sync::Arc;

use crate::cluster::kv::{CreateOutcome, KvError, KvStore};

/// Per-node shard lists derived from an ownership snapshot.
pub type LoadMap = HashMap<String, Vec<i64>>;

pub struct OwnershipDirectory {
    kv: Arc<dyn KvStore>,
    prefix: String,
}

impl OwnershipDirectory {
    pub fn new(kv: Arc<dyn KvStore>, app: &str) -> Self {
        Self {
            kv,
            prefix: format!("{app}/vectodblite"),
        }
    }

    fn key(&self, db_id: i64) -> String {
        format!("{}/{}", self.prefix, db_id)
    }

    /// Associates `db_id` with `requester` if unowned; returns the
    /// authoritative owner either way.
    pub async fn acquire(&self, db_id: i64, requester: &str) -> Result<String, KvError> {
        match self
            .kv
            .create_if_absent(&self.key(db_id), requester, None)
            .await?
        {
            CreateOutcome::Created => {
                tracing::info!(shard = db_id, owner = requester, "ownership acquired");
                Ok(requester.to_string())
            }
            CreateOutcome::Exists(owner) => Ok(owner),
        }
    }

    /// Deletes the ownership record unconditionally.
    pub async fn release(&self, db_id: i64) -> Result<(), KvError> {
        self.kv.delete(&self.key(db_id)).await
    }

    /// Reads all ownership records into a per-node load map, along with the
    /// revision the snapshot was taken at.
    pub async fn snapshot(&self) -> Result<(LoadMap, i64), KvError> {
        let snap = self.kv.get_prefix(&format!("{}/", self.prefix)).await?;
        let mut load = LoadMap::new();
        for (key, owner) in snap.entries {
            let Some(id) = key.rsplit('/').next() else {
                continue;
            };
            match id.parse::<i64>() {
                Ok(db_id) => load.entry(owner).or_default().push(db_id),
                Err(_) => tracing::warn!(key = %key, "skipping malformed ownership key"),
            }
        }
        Ok((load, snap.revision))
    }
}
