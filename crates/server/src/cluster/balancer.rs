//! Leader-only load balancing of shards across live nodes.
//!
//! On promotion the leader snapshots ownership and liveness at one
//! revision, purges ownership held by dead nodes, then concurrently
//! watches the node prefix and runs a periodic balance pass. Overloaded
//! nodes shed shards down to `avg + MAX_LOAD_DELTA`: the victim node gets
//! a release RPC first, then the ownership key is deleted, so an
//! in-flight acquire can never observe ownership gone while local state
//! remains. Released shards are re-acquired lazily by the next client
//! request.
//!
//! Any KV error here is fatal to the leadership tenure; the caller resigns
//! and a new election runs.

use std::collections::HashSet;
use std::sync::Arc;

use rand::Rng;
use tokio_util::sync::CancellationToken;

use litevec_core::config::MAX_LOAD_DELTA;

use crate::api::metrics;
use crate::api::models::{ReqRelease, RspRelease};
use crate::cluster::directory::LoadMap;
use crate::cluster::kv::{KvError, KvEventKind};
use crate::cluster::membership::node_prefix;
use crate::controller::Controller;

pub async fn run(ctl: Arc<Controller>, cancel: CancellationToken) -> Result<(), KvError> {
    let (mut load, _) = ctl.directory.snapshot().await?;

    let prefix = node_prefix(&ctl.cfg.app_name);
    let nodes = ctl.kv.get_prefix(&prefix).await?;
    let mut alive: HashSet<String> = nodes
        .entries
        .iter()
        .filter_map(|(k, _)| k.rsplit('/').next().map(str::to_string))
        .collect();

    purge_dead_nodes(&ctl, &mut load, &alive).await?;

    let mut events = ctl.kv.watch_prefix(&prefix, nodes.revision + 1).await?;
    let mut tick = tokio::time::interval(ctl.cfg.balance_interval);
    tick.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::info!("balancer exiting, no longer leader");
                return Ok(());
            }
            event = events.recv() => {
                let Some(event) = event else { return Err(KvError::StreamClosed) };
                let Some(node) = event.key.rsplit('/').next() else { continue };
                match event.kind {
                    KvEventKind::Put => {
                        alive.insert(node.to_string());
                    }
                    KvEventKind::Delete => {
                        tracing::info!(node, "node lost");
                        alive.remove(node);
                        purge_dead_nodes(&ctl, &mut load, &alive).await?;
                    }
                }
            }
            _ = tick.tick() => {
                let (fresh, _) = ctl.directory.snapshot().await?;
                load = fresh;
                purge_dead_nodes(&ctl, &mut load, &alive).await?;
                balance(&ctl, &mut load).await?;
            }
        }
    }
}

/// Deletes every ownership record pointing at a node absent from `alive`.
/// Dead nodes hold no local state, so no release RPC is needed.
async fn purge_dead_nodes(
    ctl: &Controller,
    load: &mut LoadMap,
    alive: &HashSet<String>,
) -> Result<(), KvError> {
    let dead: Vec<String> = load
        .keys()
        .filter(|node| !alive.contains(*node))
        .cloned()
        .collect();
    for node in dead {
        let Some(dbs) = load.remove(&node) else { continue };
        tracing::info!(node = %node, shards = dbs.len(), "purging ownership of dead node");
        for db_id in dbs {
            ctl.directory.release(db_id).await?;
        }
    }
    Ok(())
}

/// Sheds shards from nodes carrying more than `avg + MAX_LOAD_DELTA`.
async fn balance(ctl: &Controller, load: &mut LoadMap) -> Result<(), KvError> {
    if load.len() < 2 {
        tracing::debug!(nodes = load.len(), "skipping balance, fewer than 2 loaded nodes");
        return Ok(());
    }
    let total: usize = load.values().map(Vec::len).sum();
    let avg = total / load.len();

    let nodes: Vec<String> = load.keys().cloned().collect();
    for node in nodes {
        loop {
            let db_id = {
                let Some(list) = load.get_mut(&node) else { break };
                if list.len() <= avg + MAX_LOAD_DELTA {
                    break;
                }
                let idx = rand::thread_rng().gen_range(0..list.len());
                list.swap_remove(idx)
            };
            // Release RPC first, ownership delete second: a concurrent
            // acquire never sees the key gone while the node still holds
            // local state.
            if let Err(e) = release_shard(ctl, &node, db_id).await {
                tracing::error!(node = %node, shard = db_id, error = %e, "release failed, skipping move");
                if let Some(list) = load.get_mut(&node) {
                    list.push(db_id);
                }
                break;
            }
            ctl.directory.release(db_id).await?;
            metrics::record_balance_move();
            tracing::info!(node = %node, shard = db_id, "shard shed for balance");
        }
    }
    Ok(())
}

async fn release_shard(ctl: &Controller, node: &str, db_id: i64) -> Result<(), String> {
    if node == ctl.cfg.listen_addr {
        ctl.release_local(db_id).await;
        return Ok(());
    }
    let url = format!("http://{node}/mgmt/v1/release");
    let rsp: RspRelease = ctl
        .http
        .post(&url)
        .json(&ReqRelease { db_id })
        .send()
        .await
        .map_err(|e| e.to_string())?
        .json()
        .await
        .map_err(|e| e.to_string())?;
    if rsp.err.is_empty() {
        Ok(())
    } else {
        Err(rsp.err)
    }
}
