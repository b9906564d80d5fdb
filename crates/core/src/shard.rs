//! Per-shard store: FlatIndex + LRU + blob persistence, kept in sync.
//!
//! The three stores are synchronous peers: every successful add appears in
//! all three, and every eviction removes the entry from the blob store
//! immediately and from the FlatIndex at the next reconciliation pass.
//! All mutation goes through one async mutex, giving the single-writer
//! discipline the index requires.

use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use lru::LruCache;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::blob::{shard_key, BlobStore};
use crate::config::{RECONCILE_INTERVAL_SECS, VALID_SECONDS};
use crate::error::StoreError;
use crate::index::FlatIndex;
use crate::record::{allocate_xid, parse_xid_key, unix_now, xid_key, VectorRecord, XID_NONE};

struct ShardState {
    index: FlatIndex,
    lru: LruCache<String, VectorRecord>,
}

/// One shard's in-memory state plus its handle on the blob store.
pub struct ShardStore {
    db_id: i64,
    dim: usize,
    blob_key: String,
    blob: Arc<dyn BlobStore>,
    state: Mutex<ShardState>,
    evictions: AtomicU32,
    cancel: CancellationToken,
}

impl ShardStore {
    /// Loads the shard from the blob store and starts its reconcile task.
    ///
    /// Entries whose `expire_at` has passed are deleted from the blob store
    /// instead of being loaded. A `size_limit` of zero is rejected by CLI
    /// validation before this is reached.
    pub async fn open(
        db_id: i64,
        dim: usize,
        dist_threshold: f32,
        size_limit: usize,
        blob: Arc<dyn BlobStore>,
    ) -> Result<Arc<Self>, StoreError> {
        let blob_key = shard_key(db_id);
        tracing::info!(shard = db_id, "shard opening");

        let cap = NonZeroUsize::new(size_limit.max(1)).unwrap_or(NonZeroUsize::MIN);
        let store = Arc::new(Self {
            db_id,
            dim,
            blob_key,
            blob,
            state: Mutex::new(ShardState {
                index: FlatIndex::new(dim, dist_threshold),
                lru: LruCache::new(cap),
            }),
            evictions: AtomicU32::new(0),
            cancel: CancellationToken::new(),
        });

        store.load().await?;
        spawn_reconcile(Arc::downgrade(&store), store.cancel.clone());
        Ok(store)
    }

    pub fn db_id(&self) -> i64 {
        self.db_id
    }

    /// Number of live entries.
    pub async fn len(&self) -> usize {
        self.state.lock().await.lru.len()
    }

    /// Adds a vector under a generated xid (XXH64 of its bytes).
    pub async fn add(&self, xb: Vec<f32>) -> Result<u64, StoreError> {
        let xid = allocate_xid(&xb);
        self.add_with_xid(xb, xid).await?;
        Ok(xid)
    }

    /// Adds a vector under the caller-supplied xid.
    ///
    /// Writes the blob field, inserts into the LRU (possibly evicting the
    /// oldest entry, which is deleted from the blob store), then appends to
    /// the FlatIndex.
    pub async fn add_with_xid(&self, xb: Vec<f32>, xid: u64) -> Result<(), StoreError> {
        if xb.len() != self.dim {
            return Err(StoreError::Dimension {
                want: self.dim,
                have: xb.len(),
            });
        }
        let key = xid_key(xid);
        let rec = VectorRecord::new(xb, VALID_SECONDS);
        let bytes = rec.encode()?;
        self.blob.hset(&self.blob_key, &key, &bytes).await?;

        let mut state = self.state.lock().await;
        if let Some((old_key, _)) = state.lru.push(key.clone(), rec.clone()) {
            if old_key != key {
                self.blob.hdel(&self.blob_key, &old_key).await?;
                self.evictions.fetch_add(1, Ordering::Relaxed);
            }
        }
        state.index.add(&rec.vec, xid)
    }

    /// Searches the shard; a hit refreshes the entry's recency and expiry.
    ///
    /// If the index reports an xid the LRU no longer holds (evicted but not
    /// yet reconciled), the result downgrades to `(XID_NONE, score)`.
    pub async fn search(&self, xq: &[f32]) -> Result<(u64, f32), StoreError> {
        if xq.len() != self.dim {
            return Err(StoreError::Dimension {
                want: self.dim,
                have: xq.len(),
            });
        }
        let mut state = self.state.lock().await;
        let (xid, score) = state.index.search(xq)?;
        if xid == XID_NONE {
            return Ok((xid, score));
        }
        let key = xid_key(xid);
        let bytes = match state.lru.get_mut(&key) {
            None => {
                tracing::info!(shard = self.db_id, xid = %key, "index hit absent in LRU");
                return Ok((XID_NONE, score));
            }
            Some(rec) => {
                rec.expire_at = unix_now() + VALID_SECONDS;
                rec.encode()?
            }
        };
        self.blob.hset(&self.blob_key, &key, &bytes).await?;
        Ok((xid, score))
    }

    /// Drops the in-memory state. Blob data is retained so a future
    /// `open` on any node reloads the shard.
    pub async fn destroy(&self) {
        tracing::info!(shard = self.db_id, "shard destroying");
        self.cancel.cancel();
        let mut state = self.state.lock().await;
        state.index.clear();
        state.lru.clear();
    }

    /// Rebuilds the FlatIndex from the LRU's current key set if evictions
    /// have occurred since the last pass.
    pub async fn reconcile(&self) -> Result<(), StoreError> {
        if self.evictions.swap(0, Ordering::Relaxed) == 0 {
            return Ok(());
        }
        let mut state = self.state.lock().await;
        let entries: Vec<(u64, Vec<f32>)> = state
            .lru
            .iter()
            .map(|(k, rec)| Ok((parse_xid_key(k)?, rec.vec.clone())))
            .collect::<Result<_, StoreError>>()?;
        state.index.clear();
        for (xid, vec) in entries {
            state.index.add(&vec, xid)?;
        }
        tracing::debug!(shard = self.db_id, len = state.index.len(), "index rebuilt");
        Ok(())
    }

    async fn load(&self) -> Result<(), StoreError> {
        let fields = self.blob.hgetall(&self.blob_key).await?;
        let now = unix_now();
        let mut expired = Vec::new();
        let mut state = self.state.lock().await;
        for (key, bytes) in fields {
            let rec = VectorRecord::decode(&bytes)?;
            if rec.expire_at < now {
                expired.push(key);
                continue;
            }
            let xid = parse_xid_key(&key)?;
            if let Some((old_key, _)) = state.lru.push(key, rec.clone()) {
                // More persisted entries than capacity; drop the overflow.
                state.index.remove(parse_xid_key(&old_key)?);
                expired.push(old_key);
            }
            state.index.add(&rec.vec, xid)?;
        }
        drop(state);
        if !expired.is_empty() {
            tracing::info!(shard = self.db_id, purged = expired.len(), "purging expired entries");
            for key in expired {
                self.blob.hdel(&self.blob_key, &key).await?;
            }
        }
        Ok(())
    }
}

fn spawn_reconcile(store: Weak<ShardStore>, cancel: CancellationToken) {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(Duration::from_secs(RECONCILE_INTERVAL_SECS));
        tick.tick().await;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tick.tick() => {
                    let Some(store) = store.upgrade() else { break };
                    if let Err(e) = store.reconcile().await {
                        tracing::error!(shard = store.db_id, error = %e, "reconcile failed");
                    }
                }
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob::MemoryBlobStore;

    fn unit(i: usize, dim: usize) -> Vec<f32> {
        // Deterministic distinct unit vectors.
        let mut v: Vec<f32> = (0..dim)
            .map(|d| {
                let seed = (i * 31 + d * 17) as f32;
                (seed * 0.618_034).fract() * 2.0 - 1.0
            })
            .collect();
        let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        for x in &mut v {
            *x /= norm;
        }
        v
    }

    async fn open_test_shard(
        blob: Arc<dyn BlobStore>,
        size_limit: usize,
    ) -> Arc<ShardStore> {
        ShardStore::open(1, 8, 0.9, size_limit, blob).await.unwrap()
    }

    #[tokio::test]
    async fn test_add_then_search_hits() {
        let blob: Arc<dyn BlobStore> = Arc::new(MemoryBlobStore::new());
        let shard = open_test_shard(blob, 10).await;
        let v = unit(3, 8);
        let xid = shard.add(v.clone()).await.unwrap();
        let (found, score) = shard.search(&v).await.unwrap();
        assert_eq!(found, xid);
        assert!(score >= 0.9, "score {score}");
    }

    #[tokio::test]
    async fn test_explicit_xid_is_kept() {
        let blob: Arc<dyn BlobStore> = Arc::new(MemoryBlobStore::new());
        let shard = open_test_shard(blob, 10).await;
        let v = unit(1, 8);
        shard.add_with_xid(v.clone(), 777).await.unwrap();
        let (found, _) = shard.search(&v).await.unwrap();
        assert_eq!(found, 777);
    }

    #[tokio::test]
    async fn test_generated_xid_matches_hash() {
        let blob: Arc<dyn BlobStore> = Arc::new(MemoryBlobStore::new());
        let shard = open_test_shard(blob, 10).await;
        let v = unit(2, 8);
        let xid = shard.add(v.clone()).await.unwrap();
        assert_eq!(xid, allocate_xid(&v));
    }

    #[tokio::test]
    async fn test_eviction_removes_oldest_from_blob() {
        let blob = Arc::new(MemoryBlobStore::new());
        let shard = open_test_shard(blob.clone(), 3).await;
        let mut xids = Vec::new();
        for i in 0..5 {
            xids.push(shard.add(unit(i, 8)).await.unwrap());
        }
        assert_eq!(shard.len().await, 3);
        let fields = blob.hgetall(&shard_key(1)).await.unwrap();
        assert_eq!(fields.len(), 3);
        for xid in &xids[..2] {
            assert!(!fields.contains_key(&xid_key(*xid)), "oldest should be gone");
        }
        for xid in &xids[2..] {
            assert!(fields.contains_key(&xid_key(*xid)));
        }
    }

    #[tokio::test]
    async fn test_search_evicted_downgrades_before_reconcile() {
        let blob: Arc<dyn BlobStore> = Arc::new(MemoryBlobStore::new());
        let shard = open_test_shard(blob, 3).await;
        for i in 0..5 {
            shard.add(unit(i, 8)).await.unwrap();
        }
        // Vectors 0 and 1 were evicted; the index still holds them until the
        // next reconcile pass, so the LRU miss downgrades the hit.
        let (found, _) = shard.search(&unit(0, 8)).await.unwrap();
        assert_eq!(found, XID_NONE);
    }

    #[tokio::test]
    async fn test_reconcile_shrinks_index_to_lru() {
        let blob: Arc<dyn BlobStore> = Arc::new(MemoryBlobStore::new());
        let shard = open_test_shard(blob, 3).await;
        for i in 0..5 {
            shard.add(unit(i, 8)).await.unwrap();
        }
        shard.reconcile().await.unwrap();
        {
            let state = shard.state.lock().await;
            assert_eq!(state.index.len(), state.lru.len());
            assert_eq!(state.index.len(), 3);
        }
        // Survivors still searchable after the rebuild.
        let xid4 = allocate_xid(&unit(4, 8));
        let (found, _) = shard.search(&unit(4, 8)).await.unwrap();
        assert_eq!(found, xid4);
    }

    #[tokio::test]
    async fn test_destroy_retains_blob_for_reload() {
        let blob = Arc::new(MemoryBlobStore::new());
        let shard = open_test_shard(blob.clone(), 10).await;
        let v = unit(6, 8);
        let xid = shard.add(v.clone()).await.unwrap();
        shard.destroy().await;

        let reopened = open_test_shard(blob, 10).await;
        let (found, score) = reopened.search(&v).await.unwrap();
        assert_eq!(found, xid);
        assert!(score >= 0.9);
    }

    #[tokio::test]
    async fn test_load_purges_expired_entries() {
        let blob = Arc::new(MemoryBlobStore::new());
        let live = VectorRecord::new(unit(1, 8), VALID_SECONDS);
        let dead = VectorRecord {
            vec: unit(2, 8),
            expire_at: unix_now() - 10,
        };
        let live_key = xid_key(allocate_xid(&live.vec));
        let dead_key = xid_key(allocate_xid(&dead.vec));
        blob.hset(&shard_key(1), &live_key, &live.encode().unwrap())
            .await
            .unwrap();
        blob.hset(&shard_key(1), &dead_key, &dead.encode().unwrap())
            .await
            .unwrap();

        let shard = open_test_shard(blob.clone(), 10).await;
        assert_eq!(shard.len().await, 1);
        let fields = blob.hgetall(&shard_key(1)).await.unwrap();
        assert!(fields.contains_key(&live_key));
        assert!(!fields.contains_key(&dead_key));
    }

    #[tokio::test]
    async fn test_search_refreshes_expiry_in_blob() {
        let blob = Arc::new(MemoryBlobStore::new());
        // Seed an entry expiring soon (but not yet).
        let vec = unit(3, 8);
        let key = xid_key(allocate_xid(&vec));
        let rec = VectorRecord {
            vec: vec.clone(),
            expire_at: unix_now() + 60,
        };
        blob.hset(&shard_key(1), &key, &rec.encode().unwrap())
            .await
            .unwrap();

        let shard = open_test_shard(blob.clone(), 10).await;
        let (found, _) = shard.search(&vec).await.unwrap();
        assert_eq!(found, allocate_xid(&vec));

        let bytes = blob.hget(&shard_key(1), &key).await.unwrap().unwrap();
        let refreshed = VectorRecord::decode(&bytes).unwrap();
        assert!(refreshed.expire_at > rec.expire_at + VALID_SECONDS / 2);
    }

    #[tokio::test]
    async fn test_dimension_mismatch_rejected() {
        let blob: Arc<dyn BlobStore> = Arc::new(MemoryBlobStore::new());
        let shard = open_test_shard(blob, 10).await;
        assert!(shard.add(vec![1.0, 0.0]).await.is_err());
        assert!(shard.search(&[1.0, 0.0]).await.is_err());
    }
}
