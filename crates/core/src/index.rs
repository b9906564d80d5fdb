//! Exact nearest-neighbor index over unit-norm vectors.
//!
//! A linear inner-product scan over at most a few thousand fixed-dimension
//! vectors. Vectors are assumed pre-normalized, so the inner product is the
//! similarity score directly. Not safe for concurrent mutation; the owning
//! [`ShardStore`](crate::shard::ShardStore) serializes writes.

use crate::error::StoreError;
use crate::record::XID_NONE;

/// Flat (brute-force) index storing `(xid, vector)` pairs contiguously.
///
/// `search` returns the stored pair with the highest inner product against
/// the query, provided the score clears the distance threshold; otherwise
/// `(XID_NONE, best_score)`. Duplicate xids are permitted: the max wins in
/// search, and `remove` drops every instance.
pub struct FlatIndex {
    dim: usize,
    dist_threshold: f32,
    xids: Vec<u64>,
    data: Vec<f32>,
}

impl FlatIndex {
    pub fn new(dim: usize, dist_threshold: f32) -> Self {
        Self {
            dim,
            dist_threshold,
            xids: Vec::new(),
            data: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.xids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.xids.is_empty()
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    /// Appends a vector. Duplicate xids are allowed.
    pub fn add(&mut self, vec: &[f32], xid: u64) -> Result<(), StoreError> {
        if vec.len() != self.dim {
            return Err(StoreError::Dimension {
                want: self.dim,
                have: vec.len(),
            });
        }
        self.xids.push(xid);
        self.data.extend_from_slice(vec);
        Ok(())
    }

    /// Removes every entry carrying `xid`. Returns the number removed.
    pub fn remove(&mut self, xid: u64) -> usize {
        let mut removed = 0;
        let mut i = 0;
        while i < self.xids.len() {
            if self.xids[i] == xid {
                let last = self.xids.len() - 1;
                self.xids.swap(i, last);
                self.xids.pop();
                // Mirror the swap-remove on the flat data block.
                let (src, dst) = (last * self.dim, i * self.dim);
                for k in 0..self.dim {
                    self.data[dst + k] = self.data[src + k];
                }
                self.data.truncate(last * self.dim);
                removed += 1;
            } else {
                i += 1;
            }
        }
        removed
    }

    pub fn clear(&mut self) {
        self.xids.clear();
        self.data.clear();
    }

    /// Scans all stored vectors and returns `(xid, score)` of the best match.
    ///
    /// On an empty index returns `(XID_NONE, 0.0)`. A best score below the
    /// threshold downgrades the xid to `XID_NONE` while still reporting the
    /// score. Ties keep the first-inserted entry.
    pub fn search(&self, query: &[f32]) -> Result<(u64, f32), StoreError> {
        if query.len() != self.dim {
            return Err(StoreError::Dimension {
                want: self.dim,
                have: query.len(),
            });
        }
        if self.xids.is_empty() {
            return Ok((XID_NONE, 0.0));
        }
        let mut best_xid = XID_NONE;
        let mut best_score = f32::NEG_INFINITY;
        for (i, chunk) in self.data.chunks_exact(self.dim).enumerate() {
            let score: f32 = chunk.iter().zip(query).map(|(a, b)| a * b).sum();
            if score > best_score {
                best_score = score;
                best_xid = self.xids[i];
            }
        }
        if best_score < self.dist_threshold {
            best_xid = XID_NONE;
        }
        Ok((best_xid, best_score))
    }
}
