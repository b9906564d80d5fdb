//! Client-side router: shard-id → node-addr cache with redirect learning.
//!
//! A request for an unknown shard goes to a uniformly random node; the
//! cluster answers with a 3xx pointing at the owner, the cache is
//! overwritten from `Location`, and the request is replayed there with the
//! same body. Automatic redirects are disabled on the underlying client so
//! POST bodies are never dropped by a downgrade-to-GET.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::RwLock;
use rand::Rng;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::api::models::{ReqAdd, ReqSearch, RspAdd, RspSearch};

/// One hop suffices in steady state; two can occur across a rebalance
/// window. Anything deeper indicates a routing loop.
const MAX_REDIRECT_HOPS: usize = 3;

#[derive(Debug)]
pub enum ClientError {
    Http(String),
    /// No node addresses were configured.
    NoNodes,
    /// A 3xx arrived without a parseable `Location`.
    BadLocation(String),
    TooManyRedirects(i64),
}

impl fmt::Display for ClientError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClientError::Http(msg) => write!(f, "http error: {msg}"),
            ClientError::NoNodes => write!(f, "no node addresses configured"),
            ClientError::BadLocation(loc) => write!(f, "unusable redirect location {loc:?}"),
            ClientError::TooManyRedirects(db_id) => {
                write!(f, "too many redirects routing shard {db_id}")
            }
        }
    }
}

impl std::error::Error for ClientError {}

impl From<reqwest::Error> for ClientError {
    fn from(e: reqwest::Error) -> Self {
        ClientError::Http(e.to_string())
    }
}

/// Redirect-learning HTTP client for the cluster's data and mgmt planes.
pub struct RouteClient {
    http: reqwest::Client,
    nodes: RwLock<Vec<String>>,
    route: RwLock<HashMap<i64, String>>,
    num_random: AtomicU64,
    num_redirect: AtomicU64,
}

impl RouteClient {
    /// `nodes` is the full list of cluster addresses; it must not be empty
    /// by the time requests are issued.
    pub fn new(nodes: Vec<String>) -> Result<Self, ClientError> {
        let http = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .timeout(Duration::from_secs(5))
            .build()?;
        Ok(Self {
            http,
            nodes: RwLock::new(nodes),
            route: RwLock::new(HashMap::new()),
            num_random: AtomicU64::new(0),
            num_redirect: AtomicU64::new(0),
        })
    }

    /// Replaces the node list and forgets every learned route.
    pub fn set_nodes(&self, nodes: Vec<String>) {
        *self.nodes.write() = nodes;
        self.route.write().clear();
    }

    /// Routes picked at random (cache misses).
    pub fn num_random(&self) -> u64 {
        self.num_random.load(Ordering::Relaxed)
    }

    /// Routes learned from redirect responses.
    pub fn num_redirect(&self) -> u64 {
        self.num_redirect.load(Ordering::Relaxed)
    }

    /// The cached route for `db_id`, or a random node inserted on a miss.
    pub fn pick(&self, db_id: i64) -> Result<String, ClientError> {
        if let Some(addr) = self.route.read().get(&db_id) {
            return Ok(addr.clone());
        }
        let mut route = self.route.write();
        if let Some(addr) = route.get(&db_id) {
            return Ok(addr.clone());
        }
        let nodes = self.nodes.read();
        if nodes.is_empty() {
            return Err(ClientError::NoNodes);
        }
        let addr = nodes[rand::thread_rng().gen_range(0..nodes.len())].clone();
        route.insert(db_id, addr.clone());
        self.num_random.fetch_add(1, Ordering::Relaxed);
        Ok(addr)
    }

    /// Inserts a vector into shard `db_id`. Passing `xid: None` (or `0` /
    /// `u64::MAX`) lets the cluster derive the xid from the vector.
    pub async fn add(
        &self,
        db_id: i64,
        xb: Vec<f32>,
        xid: Option<u64>,
    ) -> Result<RspAdd, ClientError> {
        let req = ReqAdd {
            db_id,
            xb,
            xid: xid.unwrap_or(0),
        };
        self.post_routed(db_id, "/api/v1/add", &req).await
    }

    /// Nearest-neighbor query against shard `db_id`.
    pub async fn search(&self, db_id: i64, xq: Vec<f32>) -> Result<RspSearch, ClientError> {
        let req = ReqSearch { db_id, xq };
        self.post_routed(db_id, "/api/v1/search", &req).await
    }

    /// Per-node shard counts implied by the learned routes.
    pub fn route_distribution(&self) -> HashMap<String, usize> {
        let mut counts = HashMap::new();
        for addr in self.route.read().values() {
            *counts.entry(addr.clone()).or_insert(0) += 1;
        }
        counts
    }

    async fn post_routed<Req, Rsp>(
        &self,
        db_id: i64,
        path: &str,
        req: &Req,
    ) -> Result<Rsp, ClientError>
    where
        Req: Serialize,
        Rsp: DeserializeOwned,
    {
        let mut addr = self.pick(db_id)?;
        for _ in 0..MAX_REDIRECT_HOPS {
            let resp = self
                .http
                .post(format!("http://{addr}{path}"))
                .json(req)
                .send()
                .await?;
            if !resp.status().is_redirection() {
                return Ok(resp.error_for_status()?.json().await?);
            }
            let location = resp
                .headers()
                .get(reqwest::header::LOCATION)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
                .ok_or_else(|| ClientError::BadLocation(String::new()))?;
            let owner = host_of(&location)?;
            tracing::debug!(shard = db_id, owner = %owner, "route learned from redirect");
            self.route.write().insert(db_id, owner.clone());
            self.num_redirect.fetch_add(1, Ordering::Relaxed);
            addr = owner;
        }
        Err(ClientError::TooManyRedirects(db_id))
    }
}

fn host_of(location: &str) -> Result<String, ClientError> {
    let url = reqwest::Url::parse(location)
        .map_err(|_| ClientError::BadLocation(location.to_string()))?;
    let host = url
        .host_str()
        .ok_or_else(|| ClientError::BadLocation(location.to_string()))?;
    Ok(match url.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pick_caches_random_choice() {
        let client = RouteClient::new(vec!["a:1".into(), "b:2".into()]).unwrap();
        let first = client.pick(9).unwrap();
        for _ in 0..10 {
            assert_eq!(client.pick(9).unwrap(), first);
        }
        assert_eq!(client.num_random(), 1);
    }

    #[test]
    fn test_pick_without_nodes_errors() {
        let client = RouteClient::new(Vec::new()).unwrap();
        assert!(matches!(client.pick(1), Err(ClientError::NoNodes)));
    }

    #[test]
    fn test_set_nodes_clears_routes() {
        let client = RouteClient::new(vec!["a:1".into()]).unwrap();
        client.pick(3).unwrap();
        client.set_nodes(vec!["b:2".into()]);
        assert_eq!(client.pick(3).unwrap(), "b:2");
    }

    #[test]
    fn test_host_of_parses_location() {
        assert_eq!(
            host_of("http://10.0.0.5:6731/api/v1/add").unwrap(),
            "10.0.0.5:6731"
        );
        assert!(host_of("not a url").is_err());
    }
}
