//! # litevec-core
//!
//! Per-shard engine for the litevec cluster: an exact inner-product index
//! over unit-norm vectors, a bounded LRU keyed by xid, and the blob-store
//! adapter that gives shards cold persistence. The cluster control plane
//! lives in `litevec-server`; this crate has no HTTP or etcd dependency.

/// Blob store adapter: hash-field persistence, memory and redis backends.
pub mod blob;
/// Global configuration constants: limits, defaults, and tuning parameters.
pub mod config;
/// Error type shared by the shard engine.
pub mod error;
/// Exact nearest-neighbor index (linear inner-product scan).
pub mod index;
/// Vector records, xid generation, and blob field keys.
pub mod record;
/// Per-shard composition of index + LRU + blob store.
pub mod shard;

pub use blob::{shard_key, BlobStore, MemoryBlobStore};
pub use error::StoreError;
pub use index::FlatIndex;
pub use record::{allocate_xid, xid_key, VectorRecord, XID_NONE};
pub use shard::ShardStore;
