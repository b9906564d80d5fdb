//! In-process [`KvStore`] used by the test suite.
//!
//! Implements the same primitives as etcd over a shared map: linearizable
//! create-if-absent, prefix reads with a monotonic revision, prefix watches,
//! and a FIFO election. Leases are granted but never expire on their own;
//! tests simulate node death by deleting the liveness key directly.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::cluster::kv::{
    CreateOutcome, KvError, KvEvent, KvEventKind, KvStore, PrefixSnapshot,
};

#[derive(Default)]
struct Inner {
    data: BTreeMap<String, String>,
    revision: i64,
    next_lease: i64,
    watchers: Vec<Watcher>,
    elections: HashMap<String, Election>,
}

struct Watcher {
    prefix: String,
    tx: mpsc::Sender<KvEvent>,
}

#[derive(Default)]
struct Election {
    holder: Option<String>,
    queue: VecDeque<(String, oneshot::Sender<()>)>,
    observers: Vec<mpsc::Sender<String>>,
}

/// Shared in-memory KV; clones see the same state.
#[derive(Clone, Default)]
pub struct MemKv {
    inner: Arc<Mutex<Inner>>,
}

impl MemKv {
    pub fn new() -> Self {
        Self::default()
    }

    fn notify(inner: &mut Inner, kind: KvEventKind, key: &str, value: &str) {
        inner.revision += 1;
        inner.watchers.retain(|w| {
            if !key.starts_with(&w.prefix) {
                return true;
            }
            let ev = KvEvent {
                kind,
                key: key.to_string(),
                value: value.to_string(),
            };
            w.tx.try_send(ev).is_ok()
        });
    }

    fn withdraw(&self, prefix: &str, proposal: &str) {
        let mut inner = self.inner.lock();
        let Some(el) = inner.elections.get_mut(prefix) else {
            return;
        };
        if el.holder.as_deref() == Some(proposal) {
            el.holder = None;
            // Hand leadership to the next candidate in line.
            while let Some((next, elected)) = el.queue.pop_front() {
                if elected.send(()).is_ok() {
                    el.holder = Some(next.clone());
                    el.observers.retain(|tx| tx.try_send(next.clone()).is_ok());
                    break;
                }
            }
        } else {
            el.queue.retain(|(p, _)| p != proposal);
        }
    }
}

#[async_trait]
impl KvStore for MemKv {
    async fn create_if_absent(
        &self,
        key: &str,
        value: &str,
        _lease: Option<i64>,
    ) -> Result<CreateOutcome, KvError> {
        let mut inner = self.inner.lock();
        if let Some(existing) = inner.data.get(key) {
            return Ok(CreateOutcome::Exists(existing.clone()));
        }
        inner.data.insert(key.to_string(), value.to_string());
        Self::notify(&mut inner, KvEventKind::Put, key, value);
        Ok(CreateOutcome::Created)
    }

    async fn get(&self, key: &str) -> Result<Option<String>, KvError> {
        Ok(self.inner.lock().data.get(key).cloned())
    }

    async fn get_prefix(&self, prefix: &str) -> Result<PrefixSnapshot, KvError> {
        let inner = self.inner.lock();
        let entries = inner
            .data
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        Ok(PrefixSnapshot {
            entries,
            revision: inner.revision,
        })
    }

    async fn delete(&self, key: &str) -> Result<(), KvError> {
        let mut inner = self.inner.lock();
        if inner.data.remove(key).is_some() {
            Self::notify(&mut inner, KvEventKind::Delete, key, "");
        }
        Ok(())
    }

    async fn watch_prefix(
        &self,
        prefix: &str,
        _from_revision: i64,
    ) -> Result<mpsc::Receiver<KvEvent>, KvError> {
        // Only changes after registration are delivered, which matches how
        // the balancer uses it (snapshot first, then watch from R+1).
        let (tx, rx) = mpsc::channel(256);
        self.inner.lock().watchers.push(Watcher {
            prefix: prefix.to_string(),
            tx,
        });
        Ok(rx)
    }

    async fn grant_lease(&self, _ttl_secs: i64) -> Result<i64, KvError> {
        let mut inner = self.inner.lock();
        inner.next_lease += 1;
        Ok(inner.next_lease)
    }

    async fn keep_alive(
        &self,
        _lease: i64,
        _ttl_secs: i64,
        cancel: CancellationToken,
    ) -> Result<(), KvError> {
        cancel.cancelled().await;
        Ok(())
    }

    async fn campaign(
        &self,
        prefix: &str,
        proposal: &str,
        _ttl_secs: i64,
        resign: CancellationToken,
    ) -> Result<(), KvError> {
        let elected_rx = {
            let mut inner = self.inner.lock();
            let el = inner.elections.entry(prefix.to_string()).or_default();
            if el.holder.is_none() {
                el.holder = Some(proposal.to_string());
                let value = proposal.to_string();
                el.observers.retain(|tx| tx.try_send(value.clone()).is_ok());
                None
            } else {
                let (tx, rx) = oneshot::channel();
                el.queue.push_back((proposal.to_string(), tx));
                Some(rx)
            }
        };

        if let Some(rx) = elected_rx {
            tokio::select! {
                _ = resign.cancelled() => {
                    self.withdraw(prefix, proposal);
                    return Ok(());
                }
                res = rx => {
                    if res.is_err() {
                        return Err(KvError::StreamClosed);
                    }
                }
            }
        }

        resign.cancelled().await;
        self.withdraw(prefix, proposal);
        Ok(())
    }

    async fn observe(&self, prefix: &str) -> Result<mpsc::Receiver<String>, KvError> {
        let (tx, rx) = mpsc::channel(16);
        let mut inner = self.inner.lock();
        let el = inner.elections.entry(prefix.to_string()).or_default();
        if let Some(holder) = &el.holder {
            let _ = tx.try_send(holder.clone());
        }
        el.observers.push(tx);
        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_create_if_absent_first_wins() {
        let kv = MemKv::new();
        assert_eq!(
            kv.create_if_absent("k", "a", None).await.unwrap(),
            CreateOutcome::Created
        );
        assert_eq!(
            kv.create_if_absent("k", "b", None).await.unwrap(),
            CreateOutcome::Exists("a".into())
        );
        assert_eq!(kv.get("k").await.unwrap(), Some("a".into()));
    }

    #[tokio::test]
    async fn test_prefix_snapshot_and_revision() {
        let kv = MemKv::new();
        kv.create_if_absent("app/node/a", "alive", None).await.unwrap();
        kv.create_if_absent("app/node/b", "alive", None).await.unwrap();
        kv.create_if_absent("app/other", "x", None).await.unwrap();
        let snap = kv.get_prefix("app/node/").await.unwrap();
        assert_eq!(snap.entries.len(), 2);
        assert!(snap.revision >= 3);
    }

    #[tokio::test]
    async fn test_watch_sees_later_delete() {
        let kv = MemKv::new();
        kv.create_if_absent("app/node/a", "alive", None).await.unwrap();
        let mut rx = kv.watch_prefix("app/node/", 0).await.unwrap();
        kv.delete("app/node/a").await.unwrap();
        let ev = rx.recv().await.unwrap();
        assert_eq!(ev.kind, KvEventKind::Delete);
        assert_eq!(ev.key, "app/node/a");
    }

    #[tokio::test]
    async fn test_election_fifo_handover() {
        let kv = MemKv::new();
        let resign_a = CancellationToken::new();
        let resign_b = CancellationToken::new();

        let kv_a = kv.clone();
        let token_a = resign_a.clone();
        let a = tokio::spawn(async move { kv_a.campaign("el", "a", 10, token_a).await });
        // Give A time to take the slot before B queues up.
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        let kv_b = kv.clone();
        let token_b = resign_b.clone();
        let b = tokio::spawn(async move { kv_b.campaign("el", "b", 10, token_b).await });

        let mut observed = kv.observe("el").await.unwrap();
        assert_eq!(observed.recv().await.unwrap(), "a");

        resign_a.cancel();
        a.await.unwrap().unwrap();
        assert_eq!(observed.recv().await.unwrap(), "b");

        resign_b.cancel();
        b.await.unwrap().unwrap();
    }
}
