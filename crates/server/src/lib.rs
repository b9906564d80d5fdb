//! litevec-server — cluster node for litevec.
//!
//! Provides the HTTP routing plane, the KV-backed control plane
//! (membership, election, ownership, balancing), and the redirect-learning
//! client. The per-shard engine lives in `litevec-core`.

/// HTTP API layer: Axum router, handlers, models, errors, metrics.
pub mod api;
/// Client-side router with redirect learning.
pub mod client;
/// Cluster control plane over the external KV store.
pub mod cluster;
/// The per-node controller aggregate.
pub mod controller;
