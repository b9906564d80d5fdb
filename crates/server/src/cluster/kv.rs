//! Typed façade over the external strongly-consistent KV store.
//!
//! The cluster only needs a handful of primitives: create-if-absent
//! transactions, prefix reads with a revision, prefix watches, leases, and
//! an election. [`KvStore`] captures exactly those; [`EtcdKv`] implements
//! them over etcd, and the in-memory [`MemKv`](crate::cluster::mem::MemKv)
//! backs the test suite.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use etcd_client::{
    Client, Compare, CompareOp, EventType, GetOptions, PutOptions, Txn, TxnOp, TxnOpResponse,
    WatchOptions,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Failures from the KV backend. Inside the leader loop any such error is
/// fatal to the current leadership tenure.
#[derive(Debug)]
pub enum KvError {
    Backend(String),
    /// A watch or election stream ended unexpectedly.
    StreamClosed,
}

impl fmt::Display for KvError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KvError::Backend(msg) => write!(f, "kv backend error: {msg}"),
            KvError::StreamClosed => write!(f, "kv stream closed"),
        }
    }
}

impl std::error::Error for KvError {}

impl From<etcd_client::Error> for KvError {
    fn from(e: etcd_client::Error) -> Self {
        KvError::Backend(e.to_string())
    }
}

/// Outcome of a create-if-absent transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CreateOutcome {
    /// The key was absent and now holds the caller's value.
    Created,
    /// The key already existed; carries the incumbent value.
    Exists(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KvEventKind {
    Put,
    Delete,
}

/// One change observed on a watched prefix.
#[derive(Debug, Clone)]
pub struct KvEvent {
    pub kind: KvEventKind,
    pub key: String,
    pub value: String,
}

/// A prefix read plus the revision it was taken at, so a watch can resume
/// from exactly the next change.
#[derive(Debug, Clone, Default)]
pub struct PrefixSnapshot {
    pub entries: Vec<(String, String)>,
    pub revision: i64,
}

/// The KV primitives the cluster depends on.
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Atomically creates `key := value` if it has `CreateRevision == 0`,
    /// else returns the existing value.
    async fn create_if_absent(
        &self,
        key: &str,
        value: &str,
        lease: Option<i64>,
    ) -> Result<CreateOutcome, KvError>;

    async fn get(&self, key: &str) -> Result<Option<String>, KvError>;

    async fn get_prefix(&self, prefix: &str) -> Result<PrefixSnapshot, KvError>;

    async fn delete(&self, key: &str) -> Result<(), KvError>;

    /// Watches `prefix` starting at `from_revision`; events arrive on the
    /// returned channel until the watch fails or the receiver is dropped.
    async fn watch_prefix(
        &self,
        prefix: &str,
        from_revision: i64,
    ) -> Result<mpsc::Receiver<KvEvent>, KvError>;

    async fn grant_lease(&self, ttl_secs: i64) -> Result<i64, KvError>;

    /// Keeps `lease` refreshed until `cancel` fires. Resolves early only on
    /// backend failure.
    async fn keep_alive(
        &self,
        lease: i64,
        ttl_secs: i64,
        cancel: CancellationToken,
    ) -> Result<(), KvError>;

    /// Campaigns for leadership under `prefix` with `proposal` on a session
    /// of `ttl_secs`. Resolves when the tenure ends: `resign` fired, or the
    /// session lost. Waiting candidates block here until elected.
    async fn campaign(
        &self,
        prefix: &str,
        proposal: &str,
        ttl_secs: i64,
        resign: CancellationToken,
    ) -> Result<(), KvError>;

    /// Streams every observed leader proposal under `prefix`, current one
    /// first.
    async fn observe(&self, prefix: &str) -> Result<mpsc::Receiver<String>, KvError>;
}

/// [`KvStore`] over etcd. The client is cheap to clone; every call works on
/// its own clone since etcd-client methods take `&mut self`.
#[derive(Clone)]
pub struct EtcdKv {
    client: Client,
}

impl EtcdKv {
    /// Connects to etcd at `addr` (`host:port`).
    pub async fn connect(addr: &str) -> Result<Self, KvError> {
        let client = Client::connect([addr], None).await?;
        Ok(Self { client })
    }
}

#[async_trait]
impl KvStore for EtcdKv {
    async fn create_if_absent(
        &self,
        key: &str,
        value: &str,
        lease: Option<i64>,
    ) -> Result<CreateOutcome, KvError> {
        let mut client = self.client.clone();
        let put = TxnOp::put(
            key,
            value,
            lease.map(|id| PutOptions::new().with_lease(id)),
        );
        let txn = Txn::new()
            .when(vec![Compare::create_revision(key, CompareOp::Equal, 0)])
            .and_then(vec![put])
            .or_else(vec![TxnOp::get(key, None)]);
        let resp = client.txn(txn).await?;
        if resp.succeeded() {
            return Ok(CreateOutcome::Created);
        }
        for op in resp.op_responses() {
            if let TxnOpResponse::Get(get) = op {
                if let Some(kv) = get.kvs().first() {
                    return Ok(CreateOutcome::Exists(
                        String::from_utf8_lossy(kv.value()).into_owned(),
                    ));
                }
            }
        }
        Err(KvError::Backend(
            "create-if-absent: key reported present but unreadable".into(),
        ))
    }

    async fn get(&self, key: &str) -> Result<Option<String>, KvError> {
        let mut client = self.client.clone();
        let resp = client.get(key, None).await?;
        Ok(resp
            .kvs()
            .first()
            .map(|kv| String::from_utf8_lossy(kv.value()).into_owned()))
    }

    async fn get_prefix(&self, prefix: &str) -> Result<PrefixSnapshot, KvError> {
        let mut client = self.client.clone();
        let resp = client
            .get(prefix, Some(GetOptions::new().with_prefix()))
            .await?;
        let revision = resp.header().map(|h| h.revision()).unwrap_or(0);
        let entries = resp
            .kvs()
            .iter()
            .map(|kv| {
                (
                    String::from_utf8_lossy(kv.key()).into_owned(),
                    String::from_utf8_lossy(kv.value()).into_owned(),
                )
            })
            .collect();
        Ok(PrefixSnapshot { entries, revision })
    }

    async fn delete(&self, key: &str) -> Result<(), KvError> {
        let mut client = self.client.clone();
        client.delete(key, None).await?;
        Ok(())
    }

    async fn watch_prefix(
        &self,
        prefix: &str,
        from_revision: i64,
    ) -> Result<mpsc::Receiver<KvEvent>, KvError> {
        let mut client = self.client.clone();
        let opts = WatchOptions::new()
            .with_prefix()
            .with_start_revision(from_revision);
        let (watcher, mut stream) = client.watch(prefix, Some(opts)).await?;
        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(async move {
            let _watcher = watcher;
            while let Ok(Some(resp)) = stream.message().await {
                for event in resp.events() {
                    let Some(kv) = event.kv() else { continue };
                    let kind = match event.event_type() {
                        EventType::Delete => KvEventKind::Delete,
                        EventType::Put => KvEventKind::Put,
                    };
                    let ev = KvEvent {
                        kind,
                        key: String::from_utf8_lossy(kv.key()).into_owned(),
                        value: String::from_utf8_lossy(kv.value()).into_owned(),
                    };
                    if tx.send(ev).await.is_err() {
                        return;
                    }
                }
            }
        });
        Ok(rx)
    }

    async fn grant_lease(&self, ttl_secs: i64) -> Result<i64, KvError> {
        let mut client = self.client.clone();
        Ok(client.lease_grant(ttl_secs, None).await?.id())
    }

    async fn keep_alive(
        &self,
        lease: i64,
        ttl_secs: i64,
        cancel: CancellationToken,
    ) -> Result<(), KvError> {
        let mut client = self.client.clone();
        let (mut keeper, mut responses) = client.lease_keep_alive(lease).await?;
        let period = Duration::from_secs((ttl_secs as u64 / 3).max(1));
        let mut tick = tokio::time::interval(period);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                _ = tick.tick() => {
                    keeper.keep_alive().await?;
                    if responses.message().await?.is_none() {
                        return Err(KvError::StreamClosed);
                    }
                }
            }
        }
    }

    async fn campaign(
        &self,
        prefix: &str,
        proposal: &str,
        ttl_secs: i64,
        resign: CancellationToken,
    ) -> Result<(), KvError> {
        let mut client = self.client.clone();
        let lease = client.lease_grant(ttl_secs, None).await?.id();

        // The session lease must stay alive while we wait in line and for
        // the whole tenure.
        let session = resign.child_token();
        let keeper = {
            let kv = self.clone();
            let session = session.clone();
            tokio::spawn(async move { kv.keep_alive(lease, ttl_secs, session).await })
        };

        tokio::select! {
            res = client.campaign(prefix, proposal, lease) => {
                if let Err(e) = res {
                    session.cancel();
                    let _ = self.client.clone().lease_revoke(lease).await;
                    return Err(e.into());
                }
            }
            _ = resign.cancelled() => {
                let _ = self.client.clone().lease_revoke(lease).await;
                return Ok(());
            }
        }
        tracing::info!(proposal, "elected as leader");

        // Hold leadership until resigned or the session drops.
        let result = tokio::select! {
            _ = resign.cancelled() => Ok(()),
            res = keeper => match res {
                Ok(inner) => inner.and(Err(KvError::StreamClosed)),
                Err(e) => Err(KvError::Backend(e.to_string())),
            },
        };
        session.cancel();
        let _ = self.client.clone().lease_revoke(lease).await;
        result
    }

    async fn observe(&self, prefix: &str) -> Result<mpsc::Receiver<String>, KvError> {
        let mut client = self.client.clone();
        let mut stream = client.observe(prefix).await?;
        let (tx, rx) = mpsc::channel(16);
        tokio::spawn(async move {
            while let Ok(Some(resp)) = stream.message().await {
                // kv can be empty while no leader holds the election key.
                let Some(kv) = resp.kv() else { continue };
                let proposal = String::from_utf8_lossy(kv.value()).into_owned();
                if tx.send(proposal).await.is_err() {
                    return;
                }
            }
        });
        Ok(rx)
    }
}
