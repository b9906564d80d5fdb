//! The per-node controller: shard map, leader state machine, and routing.
//!
//! All process-wide collaborators (KV client, blob store, HTTP client) are
//! explicit dependencies constructed once in `main` and threaded through
//! here; background tasks receive the controller via `Arc`.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use metrics_exporter_prometheus::PrometheusHandle;
use parking_lot::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;

use litevec_core::blob::BlobStore;
use litevec_core::shard::ShardStore;

use crate::api::metrics;
use crate::api::models::{ReqAcquire, RspAcquire};
use crate::cluster::balancer;
use crate::cluster::directory::OwnershipDirectory;
use crate::cluster::kv::KvStore;
use crate::cluster::membership::{LeaderChange, Membership};

/// Runtime configuration, resolved from CLI flags.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// HTTP listen address; doubles as this node's cluster identity.
    pub listen_addr: String,
    pub dim: usize,
    pub dist_threshold: f32,
    pub size_limit: usize,
    pub balance_interval: Duration,
    /// KV prefix and registry application id.
    pub app_name: String,
}

/// Current view of the election, readable by every handler.
#[derive(Debug, Clone, Default)]
pub struct LeaderState {
    pub is_leader: bool,
    pub cur_leader: Option<String>,
}

/// Why a shard could not be served locally.
#[derive(Debug)]
pub enum RouteError {
    /// The shard is owned by another node; redirect the client there.
    NotLocal { owner: String },
    /// No leader is known to resolve ownership against.
    LeaderUnknown,
    /// Transient failure acquiring ownership or loading the shard.
    Unavailable(String),
}

impl fmt::Display for RouteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RouteError::NotLocal { owner } => write!(f, "shard owned by {owner}"),
            RouteError::LeaderUnknown => write!(f, "leader unknown"),
            RouteError::Unavailable(msg) => write!(f, "{msg}"),
        }
    }
}

pub struct Controller {
    pub cfg: ServerConfig,
    pub kv: Arc<dyn KvStore>,
    pub blob: Arc<dyn BlobStore>,
    pub directory: OwnershipDirectory,
    pub membership: Arc<Membership>,
    pub http: reqwest::Client,
    pub prometheus: PrometheusHandle,
    pub start_time: Instant,
    shards: RwLock<HashMap<i64, Arc<ShardStore>>>,
    leader: RwLock<LeaderState>,
    leader_scope: Mutex<Option<CancellationToken>>,
    root: CancellationToken,
}

impl Controller {
    pub fn new(
        cfg: ServerConfig,
        kv: Arc<dyn KvStore>,
        blob: Arc<dyn BlobStore>,
        http: reqwest::Client,
        prometheus: PrometheusHandle,
        root: CancellationToken,
    ) -> Arc<Self> {
        let directory = OwnershipDirectory::new(kv.clone(), &cfg.app_name);
        let membership = Arc::new(Membership::new(
            kv.clone(),
            cfg.app_name.clone(),
            cfg.listen_addr.clone(),
        ));
        Arc::new(Self {
            cfg,
            kv,
            blob,
            directory,
            membership,
            http,
            prometheus,
            start_time: Instant::now(),
            shards: RwLock::new(HashMap::new()),
            leader: RwLock::new(LeaderState::default()),
            leader_scope: Mutex::new(None),
            root,
        })
    }

    /// Publishes this node and enters the election. Leader-change events
    /// drive the promote/demote state machine until process shutdown.
    pub async fn start(self: &Arc<Self>) -> Result<(), crate::cluster::kv::KvError> {
        self.membership.publish(self.root.child_token()).await?;
        let mut changes = self.membership.start_election(self.root.child_token());
        let ctl = self.clone();
        tokio::spawn(async move {
            while let Some(change) = changes.recv().await {
                ctl.apply_leader_change(change);
            }
        });
        Ok(())
    }

    pub fn leader_state(&self) -> LeaderState {
        self.leader.read().clone()
    }

    pub fn shard_count(&self) -> usize {
        self.shards.read().len()
    }

    /// Transitions the leader state machine on an observed election change.
    ///
    /// Promotion starts the balancer in a scope derived from the root;
    /// demotion cancels that scope and leaves shard state untouched.
    pub fn apply_leader_change(self: &Arc<Self>, change: LeaderChange) {
        let promoted;
        {
            let mut state = self.leader.write();
            state.cur_leader = Some(change.cur.clone());
            let leading_now = change.cur == self.cfg.listen_addr;
            promoted = match (state.is_leader, leading_now) {
                (false, true) => true,
                (true, false) => false,
                _ => {
                    state.is_leader = leading_now;
                    return;
                }
            };
            state.is_leader = leading_now;
        }
        if promoted {
            tracing::info!("promoted to leader");
            let scope = self.root.child_token();
            *self.leader_scope.lock() = Some(scope.clone());
            let ctl = self.clone();
            tokio::spawn(async move {
                if let Err(e) = balancer::run(ctl.clone(), scope).await {
                    tracing::error!(error = %e, "leader work failed, resigning tenure");
                    ctl.membership.resign();
                }
            });
        } else {
            tracing::info!(leader = %change.cur, "demoted to follower");
            if let Some(scope) = self.leader_scope.lock().take() {
                scope.cancel();
            }
        }
    }

    /// Returns the local store for `db_id`, acquiring ownership on a miss.
    ///
    /// On a miss the owner is resolved through the directory (locally if
    /// leader, else via the acquire RPC); if it is another node the caller
    /// redirects. A shard that fails to load rolls back its ownership claim
    /// so another node can acquire it.
    pub async fn local_shard(self: &Arc<Self>, db_id: i64) -> Result<Arc<ShardStore>, RouteError> {
        if let Some(shard) = self.shards.read().get(&db_id) {
            return Ok(shard.clone());
        }

        let owner = self.resolve_owner(db_id).await?;
        if owner != self.cfg.listen_addr {
            return Err(RouteError::NotLocal { owner });
        }

        let store = match ShardStore::open(
            db_id,
            self.cfg.dim,
            self.cfg.dist_threshold,
            self.cfg.size_limit,
            self.blob.clone(),
        )
        .await
        {
            Ok(store) => store,
            Err(e) => {
                if let Err(re) = self.directory.release(db_id).await {
                    tracing::error!(shard = db_id, error = %re, "ownership rollback failed");
                }
                return Err(RouteError::Unavailable(e.to_string()));
            }
        };

        let mut map = self.shards.write();
        if let Some(existing) = map.get(&db_id) {
            // Lost the insert race; keep the incumbent.
            let existing = existing.clone();
            drop(map);
            tokio::spawn(async move { store.destroy().await });
            return Ok(existing);
        }
        map.insert(db_id, store.clone());
        metrics::update_shard_gauge(map.len());
        Ok(store)
    }

    async fn resolve_owner(&self, db_id: i64) -> Result<String, RouteError> {
        let leader = self.leader_state();
        if leader.is_leader {
            metrics::record_acquire();
            return self
                .directory
                .acquire(db_id, &self.cfg.listen_addr)
                .await
                .map_err(|e| RouteError::Unavailable(e.to_string()));
        }
        let Some(cur) = leader.cur_leader.filter(|l| !l.is_empty()) else {
            return Err(RouteError::LeaderUnknown);
        };
        let url = format!("http://{cur}/mgmt/v1/acquire");
        let req = ReqAcquire {
            db_id,
            node_addr: self.cfg.listen_addr.clone(),
        };
        let rsp: RspAcquire = self
            .http
            .post(&url)
            .json(&req)
            .send()
            .await
            .map_err(|e| RouteError::Unavailable(e.to_string()))?
            .json()
            .await
            .map_err(|e| RouteError::Unavailable(e.to_string()))?;
        if !rsp.err.is_empty() {
            return Err(RouteError::Unavailable(rsp.err));
        }
        Ok(rsp.node_addr)
    }

    /// Drops local state for `db_id`; the blob data survives for the next
    /// acquire. Idempotent: releasing a shard not held here is a no-op.
    pub async fn release_local(&self, db_id: i64) -> bool {
        let removed = {
            let mut map = self.shards.write();
            let removed = map.remove(&db_id);
            metrics::update_shard_gauge(map.len());
            removed
        };
        match removed {
            Some(shard) => {
                shard.destroy().await;
                metrics::record_release();
                tracing::info!(shard = db_id, "shard released");
                true
            }
            None => {
                tracing::info!(shard = db_id, "skipped releasing shard not held locally");
                false
            }
        }
    }
}
