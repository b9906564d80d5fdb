//! Request and response data transfer objects for the HTTP API.
//!
//! All types derive `Serialize`/`Deserialize` for JSON marshalling via Axum.
//! Field names follow the wire protocol (`dbID`, `nodeAddr`, ...); operation
//! failures travel as a populated `err` inside a 200 response, while parse
//! and validation failures get a 400.

use serde::{Deserialize, Serialize};

/// Request body for `POST /api/v1/add`.
///
/// An `xid` of `0` or `u64::MAX` (or an omitted one) asks the cluster to
/// generate the xid from the vector's bytes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReqAdd {
    #[serde(rename = "dbID")]
    pub db_id: i64,
    pub xb: Vec<f32>,
    #[serde(default)]
    pub xid: u64,
}

/// Response body for `POST /api/v1/add`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RspAdd {
    pub xid: u64,
    #[serde(default)]
    pub err: String,
}

/// Request body for `POST /api/v1/search`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReqSearch {
    #[serde(rename = "dbID")]
    pub db_id: i64,
    pub xq: Vec<f32>,
}

/// Response body for `POST /api/v1/search`. An `xid` of `u64::MAX` means no
/// stored vector cleared the distance threshold.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RspSearch {
    pub xid: u64,
    pub distance: f32,
    #[serde(default)]
    pub err: String,
}

/// Request body for `POST /mgmt/v1/acquire`. Served only by the leader.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReqAcquire {
    #[serde(rename = "dbID")]
    pub db_id: i64,
    #[serde(rename = "nodeAddr")]
    pub node_addr: String,
}

/// Response body for `POST /mgmt/v1/acquire`; `node_addr` is the
/// authoritative owner.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RspAcquire {
    #[serde(rename = "dbID")]
    pub db_id: i64,
    #[serde(rename = "nodeAddr")]
    pub node_addr: String,
    #[serde(default)]
    pub err: String,
}

/// Request body for `POST /mgmt/v1/release`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReqRelease {
    #[serde(rename = "dbID")]
    pub db_id: i64,
}

/// Response body for `POST /mgmt/v1/release`. Releasing a shard this node
/// does not own is a no-op, not an error.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RspRelease {
    #[serde(rename = "dbID")]
    pub db_id: i64,
    #[serde(default)]
    pub err: String,
}

/// Response body for `GET /status`.
#[derive(Debug, Serialize, Deserialize)]
pub struct StatusResponse {
    pub status: String,
}

/// Response body for `GET /health`.
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub description: String,
    pub status: String,
}
