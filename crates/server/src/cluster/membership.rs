//! Node membership and leader election.
//!
//! Each node publishes `<app>/node/<addr> := "alive"` under a kept-alive
//! lease, and campaigns under `<app>/election` with its listen address as
//! the proposal. Observed leader changes are deduplicated and emitted on a
//! channel; the controller drives its leader/follower state machine from
//! those events.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use litevec_core::config::{LEADER_LEASE_TTL_SECS, NODE_LEASE_TTL_SECS};

use crate::cluster::kv::{KvError, KvStore};

/// A deduplicated leader transition observed on the election stream.
#[derive(Debug, Clone)]
pub struct LeaderChange {
    pub prev: Option<String>,
    pub cur: String,
}

/// Prefix under which liveness keys are published.
pub fn node_prefix(app: &str) -> String {
    format!("{app}/node/")
}

/// This node's handle on membership and the election.
pub struct Membership {
    kv: Arc<dyn KvStore>,
    app: String,
    addr: String,
    tenure: Mutex<Option<CancellationToken>>,
}

impl Membership {
    pub fn new(kv: Arc<dyn KvStore>, app: String, addr: String) -> Self {
        Self {
            kv,
            app,
            addr,
            tenure: Mutex::new(None),
        }
    }

    fn node_key(&self) -> String {
        format!("{}{}", node_prefix(&self.app), self.addr)
    }

    fn election_prefix(&self) -> String {
        format!("{}/election", self.app)
    }

    /// Publishes the liveness key under a fresh lease and spawns its
    /// keep-alive task.
    pub async fn publish(&self, cancel: CancellationToken) -> Result<(), KvError> {
        let lease = self.kv.grant_lease(NODE_LEASE_TTL_SECS).await?;
        self.kv
            .create_if_absent(&self.node_key(), "alive", Some(lease))
            .await?;
        tracing::info!(key = %self.node_key(), lease, "node published");
        let kv = self.kv.clone();
        tokio::spawn(async move {
            if let Err(e) = kv.keep_alive(lease, NODE_LEASE_TTL_SECS, cancel).await {
                tracing::error!(error = %e, "node lease keep-alive ended");
            }
        });
        Ok(())
    }

    /// Starts the observe and campaign tasks. Leader changes arrive on the
    /// returned channel exactly once per distinct proposal.
    pub fn start_election(self: &Arc<Self>, cancel: CancellationToken) -> mpsc::Receiver<LeaderChange> {
        let (tx, rx) = mpsc::channel(16);

        let me = self.clone();
        let observe_cancel = cancel.clone();
        tokio::spawn(async move {
            me.observe_loop(tx, observe_cancel).await;
        });

        let me = self.clone();
        tokio::spawn(async move {
            me.campaign_loop(cancel).await;
        });

        rx
    }

    /// Cancels the current tenure (if leading), dropping the election
    /// session so a new election is triggered. The campaign loop then
    /// re-enters the race.
    pub fn resign(&self) {
        if let Some(tenure) = self.tenure.lock().take() {
            tracing::warn!("resigning leadership");
            tenure.cancel();
        }
    }

    async fn observe_loop(&self, tx: mpsc::Sender<LeaderChange>, cancel: CancellationToken) {
        let prefix = self.election_prefix();
        let mut prev: Option<String> = None;
        loop {
            if cancel.is_cancelled() {
                return;
            }
            let mut stream = match self.kv.observe(&prefix).await {
                Ok(s) => s,
                Err(e) => {
                    tracing::error!(error = %e, "observe failed, retrying");
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        _ = tokio::time::sleep(Duration::from_secs(1)) => continue,
                    }
                }
            };
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    msg = stream.recv() => match msg {
                        Some(cur) => {
                            if prev.as_deref() == Some(cur.as_str()) {
                                continue;
                            }
                            tracing::info!(leader = %cur, "observed leader");
                            let change = LeaderChange { prev: prev.clone(), cur: cur.clone() };
                            prev = Some(cur);
                            if tx.send(change).await.is_err() {
                                return;
                            }
                        }
                        None => break,
                    }
                }
            }
        }
    }

    async fn campaign_loop(&self, cancel: CancellationToken) {
        let prefix = self.election_prefix();
        loop {
            if cancel.is_cancelled() {
                return;
            }
            let tenure = cancel.child_token();
            *self.tenure.lock() = Some(tenure.clone());
            if let Err(e) = self
                .kv
                .campaign(&prefix, &self.addr, LEADER_LEASE_TTL_SECS, tenure)
                .await
            {
                tracing::error!(error = %e, "campaign ended with error");
            }
            self.tenure.lock().take();
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(Duration::from_secs(1)) => {}
            }
        }
    }
}
