//! HTTP request handlers.
//!
//! Every data-plane handler resolves the target shard through the
//! controller: served locally when owned here, otherwise answered with a
//! redirect carrying the owner in `Location`. Operation failures on an
//! owned shard are reported as `err` inside a 200 body; only parse and
//! validation failures produce a 400.

use std::sync::Arc;

use axum::extract::State;
use axum::Json;

use litevec_core::record::XID_NONE;

use crate::api::errors::{ApiError, ApiJson};
use crate::api::metrics;
use crate::api::models::*;
use crate::controller::{Controller, RouteError};

fn validate_db_id(db_id: i64) -> Result<(), ApiError> {
    if db_id <= 0 {
        return Err(ApiError::BadRequest(format!(
            "dbID must be positive, have {db_id}"
        )));
    }
    Ok(())
}

fn validate_vector(ctl: &Controller, vec: &[f32], name: &str) -> Result<(), ApiError> {
    if vec.len() != ctl.cfg.dim {
        return Err(ApiError::BadRequest(format!(
            "invalid length of {name}, want {}, have {}",
            ctl.cfg.dim,
            vec.len()
        )));
    }
    if vec.iter().any(|v| v.is_nan() || v.is_infinite()) {
        return Err(ApiError::BadRequest(format!(
            "{name} contains NaN or Inf"
        )));
    }
    Ok(())
}

/// Maps a routing failure either to an HTTP error (redirect, 400) or to a
/// message to embed as `err` in a 200 body.
fn route_failure(err: RouteError, path: &str, data_plane: bool) -> Result<String, ApiError> {
    match err {
        RouteError::NotLocal { owner } => {
            metrics::record_redirect(if data_plane { "data" } else { "mgmt" });
            let location = format!("http://{owner}{path}");
            if data_plane {
                Err(ApiError::MovedPermanently(location))
            } else {
                Err(ApiError::PermanentRedirect(location))
            }
        }
        RouteError::LeaderUnknown => Err(ApiError::BadRequest("leader unknown".into())),
        RouteError::Unavailable(msg) => Ok(msg),
    }
}

/// `POST /api/v1/add`
pub async fn add(
    State(ctl): State<Arc<Controller>>,
    ApiJson(req): ApiJson<ReqAdd>,
) -> Result<Json<RspAdd>, ApiError> {
    validate_db_id(req.db_id)?;
    validate_vector(&ctl, &req.xb, "xb")?;
    metrics::record_data_op("add");

    let shard = match ctl.local_shard(req.db_id).await {
        Ok(shard) => shard,
        Err(e) => {
            let msg = route_failure(e, "/api/v1/add", true)?;
            tracing::error!(shard = req.db_id, error = %msg, "add could not reach shard");
            return Ok(Json(RspAdd { xid: 0, err: msg }));
        }
    };

    let mut rsp = RspAdd::default();
    let outcome = if req.xid == 0 || req.xid == XID_NONE {
        shard.add(req.xb).await
    } else {
        shard.add_with_xid(req.xb, req.xid).await.map(|_| req.xid)
    };
    match outcome {
        Ok(xid) => rsp.xid = xid,
        Err(e) => {
            tracing::error!(shard = req.db_id, error = %e, "add failed");
            rsp.err = e.to_string();
        }
    }
    Ok(Json(rsp))
}

/// `POST /api/v1/search`
pub async fn search(
    State(ctl): State<Arc<Controller>>,
    ApiJson(req): ApiJson<ReqSearch>,
) -> Result<Json<RspSearch>, ApiError> {
    validate_db_id(req.db_id)?;
    validate_vector(&ctl, &req.xq, "xq")?;
    metrics::record_data_op("search");

    let shard = match ctl.local_shard(req.db_id).await {
        Ok(shard) => shard,
        Err(e) => {
            let msg = route_failure(e, "/api/v1/search", true)?;
            tracing::error!(shard = req.db_id, error = %msg, "search could not reach shard");
            return Ok(Json(RspSearch {
                xid: XID_NONE,
                distance: 0.0,
                err: msg,
            }));
        }
    };

    let mut rsp = RspSearch::default();
    match shard.search(&req.xq).await {
        Ok((xid, distance)) => {
            rsp.xid = xid;
            rsp.distance = distance;
        }
        Err(e) => {
            tracing::error!(shard = req.db_id, error = %e, "search failed");
            rsp.xid = XID_NONE;
            rsp.err = e.to_string();
        }
    }
    Ok(Json(rsp))
}

/// `POST /mgmt/v1/acquire`
///
/// Leader-only: a follower that knows the leader replies 308 to it; one
/// that does not replies 400 `"leader unknown"`.
pub async fn acquire(
    State(ctl): State<Arc<Controller>>,
    ApiJson(req): ApiJson<ReqAcquire>,
) -> Result<Json<RspAcquire>, ApiError> {
    validate_db_id(req.db_id)?;
    if req.node_addr.is_empty() {
        return Err(ApiError::BadRequest("nodeAddr must not be empty".into()));
    }

    let leader = ctl.leader_state();
    if !leader.is_leader {
        return match leader.cur_leader.filter(|l| !l.is_empty()) {
            Some(cur) => {
                metrics::record_redirect("mgmt");
                Err(ApiError::PermanentRedirect(format!(
                    "http://{cur}/mgmt/v1/acquire"
                )))
            }
            None => Err(ApiError::BadRequest("leader unknown".into())),
        };
    }

    metrics::record_acquire();
    let mut rsp = RspAcquire {
        db_id: req.db_id,
        ..Default::default()
    };
    match ctl.directory.acquire(req.db_id, &req.node_addr).await {
        Ok(owner) => rsp.node_addr = owner,
        Err(e) => {
            tracing::error!(shard = req.db_id, error = %e, "acquire failed");
            rsp.err = e.to_string();
        }
    }
    Ok(Json(rsp))
}

/// `POST /mgmt/v1/release`
pub async fn release(
    State(ctl): State<Arc<Controller>>,
    ApiJson(req): ApiJson<ReqRelease>,
) -> Result<Json<RspRelease>, ApiError> {
    validate_db_id(req.db_id)?;
    ctl.release_local(req.db_id).await;
    Ok(Json(RspRelease {
        db_id: req.db_id,
        err: String::new(),
    }))
}

/// `GET /status`
pub async fn status() -> Json<StatusResponse> {
    Json(StatusResponse {
        status: "UP".into(),
    })
}

/// `GET /health`
pub async fn health(State(ctl): State<Arc<Controller>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        description: format!(
            "{} node {} holding {} shards, uptime {}s",
            ctl.cfg.app_name,
            ctl.cfg.listen_addr,
            ctl.shard_count(),
            ctl.start_time.elapsed().as_secs()
        ),
        status: "UP".into(),
    })
}

/// `GET /metrics`
pub async fn metrics_endpoint(State(ctl): State<Arc<Controller>>) -> String {
    ctl.prometheus.render()
}
