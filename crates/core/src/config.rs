//! Global configuration constants for litevec.
//!
//! Tuning parameters, validation limits, and cluster defaults live here.
//! These are compile-time constants; runtime configuration is handled via
//! CLI arguments in the server's `main.rs`.

/// Seconds a stored vector stays valid without being searched (1 year).
///
/// Every successful search hit refreshes the entry's `expire_at` to
/// `now + VALID_SECONDS` in both the LRU and the blob store.
pub const VALID_SECONDS: i64 = 365 * 24 * 60 * 60;

/// Interval between shard reconciliation passes.
///
/// When evictions have occurred since the last pass, the FlatIndex is rebuilt
/// from the LRU's surviving key set, bounding index/LRU divergence to one
/// period.
pub const RECONCILE_INTERVAL_SECS: u64 = 10;

/// Default vector dimensionality.
pub const DEFAULT_DIM: usize = 512;

/// Maximum accepted vector dimensionality.
pub const MAX_DIMENSION: usize = 4096;

/// Default minimum inner-product score for a search hit.
pub const DEFAULT_DIST_THRESHOLD: f32 = 0.9;

/// Default per-shard capacity. The (N+1)-th insertion evicts the oldest entry.
pub const DEFAULT_SIZE_LIMIT: usize = 10_000;

/// Default seconds between leader rebalance passes.
pub const DEFAULT_BALANCE_INTERVAL_SECS: u64 = 60;

/// Allowed slack in per-node shard count before the balancer sheds shards.
pub const MAX_LOAD_DELTA: usize = 2;

/// TTL of the lease backing a node's liveness key.
pub const NODE_LEASE_TTL_SECS: i64 = 60;

/// TTL of the election session. Leader loss is detected within this window.
pub const LEADER_LEASE_TTL_SECS: i64 = 10;

/// Upper bound on a single acquire RPC to the leader.
pub const ACQUIRE_TIMEOUT_SECS: u64 = 5;

/// Seconds between registry heartbeats.
pub const REGISTRY_HEARTBEAT_SECS: u64 = 30;

/// Default HTTP listen address (also the node's cluster identity).
pub const DEFAULT_LISTEN_ADDR: &str = "127.0.0.1:8080";

/// Default etcd endpoint.
pub const DEFAULT_KV_ADDR: &str = "127.0.0.1:2379";

/// Default redis endpoint.
pub const DEFAULT_BLOB_ADDR: &str = "127.0.0.1:6379";

/// Default service registry endpoint.
pub const DEFAULT_REGISTRY_ADDR: &str = "http://127.0.0.1:8761/eureka";

/// Default application name, used as KV prefix and registry app id.
pub const DEFAULT_APP_NAME: &str = "litevec-cluster";
