//! Cluster control plane over the external KV store.
//!
//! - **kv**: typed façade over the KV primitives, with the etcd backend.
//! - **mem**: in-process KV backend used by the test suite.
//! - **membership**: node liveness keys and leader election.
//! - **directory**: shard ownership records (leader-written).
//! - **balancer**: leader-only periodic rebalancing and dead-node purge.
//! - **registry**: service-discovery registration and heartbeats.

/// Leader-only load balancing of shards across live nodes.
pub mod balancer;
/// Ownership directory: shard-id → owning node.
pub mod directory;
/// Typed façade over the external KV store, etcd-backed.
pub mod kv;
/// In-process KV backend for tests.
pub mod mem;
/// Node membership and leader election.
pub mod membership;
/// Service registry agent.
pub mod registry;

pub use directory::OwnershipDirectory;
pub use kv::{EtcdKv, KvError, KvStore};
pub use membership::{LeaderChange, Membership};
