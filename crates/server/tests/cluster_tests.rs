//! Multi-node cluster tests over the in-memory KV and blob backends.
//!
//! Each test spins real Axum servers on ephemeral ports, sharing one MemKv
//! (membership, election, ownership) and one MemoryBlobStore, then drives
//! them through the HTTP surface exactly as external clients would.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use litevec_core::blob::{shard_key, BlobStore, MemoryBlobStore};
use litevec_core::record::{allocate_xid, XID_NONE};
use litevec_server::api::create_router;
use litevec_server::client::RouteClient;
use litevec_server::cluster::kv::KvStore;
use litevec_server::cluster::mem::MemKv;
use litevec_server::cluster::membership::node_prefix;
use litevec_server::controller::{Controller, ServerConfig};

const DIM: usize = 8;
const APP: &str = "litevec-test";

fn prometheus_handle() -> metrics_exporter_prometheus::PrometheusHandle {
    match metrics_exporter_prometheus::PrometheusBuilder::new().install_recorder() {
        Ok(handle) => handle,
        Err(_) => metrics_exporter_prometheus::PrometheusBuilder::new()
            .build_recorder()
            .handle(),
    }
}

async fn spawn_node_with(
    kv: &MemKv,
    blob: &Arc<MemoryBlobStore>,
    balance_secs: u64,
    size_limit: usize,
) -> (String, Arc<Controller>) {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind");
    let addr = listener.local_addr().unwrap().to_string();

    let cfg = ServerConfig {
        listen_addr: addr.clone(),
        dim: DIM,
        dist_threshold: 0.9,
        size_limit,
        balance_interval: Duration::from_secs(balance_secs),
        app_name: APP.into(),
    };
    let http = reqwest::Client::builder()
        .timeout(Duration::from_secs(5))
        .build()
        .unwrap();
    let kv: Arc<dyn KvStore> = Arc::new(kv.clone());
    let blob: Arc<dyn BlobStore> = blob.clone();
    let ctl = Controller::new(
        cfg,
        kv,
        blob,
        http,
        prometheus_handle(),
        CancellationToken::new(),
    );
    ctl.start().await.unwrap();

    let app = create_router(ctl.clone());
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (addr, ctl)
}

async fn spawn_node(kv: &MemKv, blob: &Arc<MemoryBlobStore>) -> (String, Arc<Controller>) {
    spawn_node_with(kv, blob, 3600, 100).await
}

/// Waits until every node has observed some leader.
async fn wait_for_leader(ctls: &[&Arc<Controller>]) -> String {
    for _ in 0..250 {
        let views: Vec<Option<String>> =
            ctls.iter().map(|c| c.leader_state().cur_leader.clone()).collect();
        if views.iter().all(|v| v.is_some()) {
            return views[0].clone().unwrap();
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("no leader observed within timeout");
}

fn unit(i: usize) -> Vec<f32> {
    let mut v: Vec<f32> = (0..DIM)
        .map(|d| {
            let seed = (i * 31 + d * 17) as f32;
            (seed * 0.618_034).fract() * 2.0 - 1.0
        })
        .collect();
    let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    for x in &mut v {
        *x /= norm;
    }
    v
}

fn basis(axis: usize) -> Vec<f32> {
    let mut v = vec![0.0; DIM];
    v[axis] = 1.0;
    v
}

fn plain_client() -> reqwest::Client {
    reqwest::Client::new()
}

fn no_redirect_client() -> reqwest::Client {
    reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .build()
        .unwrap()
}

async fn add_direct(addr: &str, db_id: i64, xb: &[f32]) -> serde_json::Value {
    plain_client()
        .post(format!("http://{addr}/api/v1/add"))
        .json(&serde_json::json!({ "dbID": db_id, "xb": xb }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap()
}

async fn search_direct(addr: &str, db_id: i64, xq: &[f32]) -> serde_json::Value {
    plain_client()
        .post(format!("http://{addr}/api/v1/search"))
        .json(&serde_json::json!({ "dbID": db_id, "xq": xq }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap()
}

// ── Single node ─────────────────────────────────────────────────────────

#[tokio::test]
async fn status_and_health_report_up() {
    let kv = MemKv::new();
    let blob = Arc::new(MemoryBlobStore::new());
    let (addr, ctl) = spawn_node(&kv, &blob).await;
    wait_for_leader(&[&ctl]).await;

    let status: serde_json::Value = plain_client()
        .get(format!("http://{addr}/status"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(status["status"], "UP");

    let health: serde_json::Value = plain_client()
        .get(format!("http://{addr}/health"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(health["status"], "UP");
    assert!(health["description"].as_str().unwrap().contains(APP));
}

#[tokio::test]
async fn add_then_search_returns_same_xid() {
    let kv = MemKv::new();
    let blob = Arc::new(MemoryBlobStore::new());
    let (addr, ctl) = spawn_node(&kv, &blob).await;
    wait_for_leader(&[&ctl]).await;

    let v = unit(1);
    let added = add_direct(&addr, 1, &v).await;
    assert_eq!(added["err"], "");
    let xid = added["xid"].as_u64().unwrap();
    assert_ne!(xid, 0);

    let found = search_direct(&addr, 1, &v).await;
    assert_eq!(found["err"], "");
    assert_eq!(found["xid"].as_u64().unwrap(), xid);
    assert!(found["distance"].as_f64().unwrap() >= 0.9);
}

#[tokio::test]
async fn add_with_explicit_xid_stores_it() {
    let kv = MemKv::new();
    let blob = Arc::new(MemoryBlobStore::new());
    let (addr, ctl) = spawn_node(&kv, &blob).await;
    wait_for_leader(&[&ctl]).await;

    let v = basis(0);
    let added: serde_json::Value = plain_client()
        .post(format!("http://{addr}/api/v1/add"))
        .json(&serde_json::json!({ "dbID": 2, "xb": v, "xid": 12345u64 }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(added["xid"].as_u64().unwrap(), 12345);

    let found = search_direct(&addr, 2, &v).await;
    assert_eq!(found["xid"].as_u64().unwrap(), 12345);
}

#[tokio::test]
async fn sentinel_xid_triggers_generation() {
    let kv = MemKv::new();
    let blob = Arc::new(MemoryBlobStore::new());
    let (addr, ctl) = spawn_node(&kv, &blob).await;
    wait_for_leader(&[&ctl]).await;

    let v = unit(9);
    let added: serde_json::Value = plain_client()
        .post(format!("http://{addr}/api/v1/add"))
        .json(&serde_json::json!({ "dbID": 3, "xb": v, "xid": u64::MAX }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(added["xid"].as_u64().unwrap(), allocate_xid(&v));
}

#[tokio::test]
async fn search_below_threshold_returns_sentinel() {
    let kv = MemKv::new();
    let blob = Arc::new(MemoryBlobStore::new());
    let (addr, ctl) = spawn_node(&kv, &blob).await;
    wait_for_leader(&[&ctl]).await;

    add_direct(&addr, 4, &basis(0)).await;
    let found = search_direct(&addr, 4, &basis(1)).await;
    assert_eq!(found["err"], "");
    assert_eq!(found["xid"].as_u64().unwrap(), XID_NONE);
}

#[tokio::test]
async fn search_on_empty_shard_does_not_error() {
    let kv = MemKv::new();
    let blob = Arc::new(MemoryBlobStore::new());
    let (addr, ctl) = spawn_node(&kv, &blob).await;
    wait_for_leader(&[&ctl]).await;

    let found = search_direct(&addr, 5, &basis(0)).await;
    assert_eq!(found["err"], "");
    assert_eq!(found["xid"].as_u64().unwrap(), XID_NONE);
}

#[tokio::test]
async fn wrong_dimension_is_rejected_with_400() {
    let kv = MemKv::new();
    let blob = Arc::new(MemoryBlobStore::new());
    let (addr, ctl) = spawn_node(&kv, &blob).await;
    wait_for_leader(&[&ctl]).await;

    let resp = plain_client()
        .post(format!("http://{addr}/api/v1/add"))
        .json(&serde_json::json!({ "dbID": 1, "xb": [1.0, 0.0] }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
}

#[tokio::test]
async fn nonpositive_db_id_is_rejected_with_400() {
    let kv = MemKv::new();
    let blob = Arc::new(MemoryBlobStore::new());
    let (addr, ctl) = spawn_node(&kv, &blob).await;
    wait_for_leader(&[&ctl]).await;

    let resp = plain_client()
        .post(format!("http://{addr}/api/v1/search"))
        .json(&serde_json::json!({ "dbID": 0, "xq": basis(0) }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
}

#[tokio::test]
async fn release_of_unheld_shard_is_idempotent() {
    let kv = MemKv::new();
    let blob = Arc::new(MemoryBlobStore::new());
    let (addr, ctl) = spawn_node(&kv, &blob).await;
    wait_for_leader(&[&ctl]).await;

    let released: serde_json::Value = plain_client()
        .post(format!("http://{addr}/mgmt/v1/release"))
        .json(&serde_json::json!({ "dbID": 999 }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(released["err"], "");
    assert_eq!(released["dbID"].as_i64().unwrap(), 999);
}

#[tokio::test]
async fn oldest_entries_evict_beyond_capacity() {
    let kv = MemKv::new();
    let blob = Arc::new(MemoryBlobStore::new());
    let (addr, ctl) = spawn_node_with(&kv, &blob, 3600, 5).await;
    wait_for_leader(&[&ctl]).await;

    let mut xids = Vec::new();
    for i in 0..8 {
        let added = add_direct(&addr, 1, &unit(i)).await;
        assert_eq!(added["err"], "");
        xids.push(added["xid"].as_u64().unwrap());
    }
    // The 3 oldest were evicted and must no longer be searchable.
    for i in 0..3 {
        let found = search_direct(&addr, 1, &unit(i)).await;
        assert_eq!(
            found["xid"].as_u64().unwrap(),
            XID_NONE,
            "vector {i} should be evicted"
        );
    }
    // The newest 5 survive with their original xids.
    for i in 3..8 {
        let found = search_direct(&addr, 1, &unit(i)).await;
        assert_eq!(found["xid"].as_u64().unwrap(), xids[i]);
        assert!(found["distance"].as_f64().unwrap() >= 0.9);
    }
    // Blob store holds exactly the survivors.
    let fields = blob.hgetall(&shard_key(1)).await.unwrap();
    assert_eq!(fields.len(), 5);
}

// ── Multi-node routing ──────────────────────────────────────────────────

#[tokio::test]
async fn follower_serves_after_acquiring_via_leader() {
    let kv = MemKv::new();
    let blob = Arc::new(MemoryBlobStore::new());
    let (_addr_a, ctl_a) = spawn_node(&kv, &blob).await;
    wait_for_leader(&[&ctl_a]).await;
    let (addr_b, ctl_b) = spawn_node(&kv, &blob).await;
    wait_for_leader(&[&ctl_a, &ctl_b]).await;
    assert!(!ctl_b.leader_state().is_leader);

    let v = unit(1);
    let added = add_direct(&addr_b, 7, &v).await;
    assert_eq!(added["err"], "");
    assert_eq!(ctl_b.shard_count(), 1, "follower should own the shard");
    assert_eq!(ctl_a.shard_count(), 0);
}

#[tokio::test]
async fn acquire_on_follower_redirects_308_to_leader() {
    let kv = MemKv::new();
    let blob = Arc::new(MemoryBlobStore::new());
    let (addr_a, ctl_a) = spawn_node(&kv, &blob).await;
    wait_for_leader(&[&ctl_a]).await;
    let (addr_b, ctl_b) = spawn_node(&kv, &blob).await;
    wait_for_leader(&[&ctl_a, &ctl_b]).await;

    let resp = no_redirect_client()
        .post(format!("http://{addr_b}/mgmt/v1/acquire"))
        .json(&serde_json::json!({ "dbID": 11, "nodeAddr": addr_b }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 308);
    let location = resp.headers()["location"].to_str().unwrap();
    assert!(location.contains(&addr_a), "location {location} should point at leader");
}

#[tokio::test]
async fn add_for_foreign_shard_redirects_301_to_owner() {
    let kv = MemKv::new();
    let blob = Arc::new(MemoryBlobStore::new());
    let (addr_a, ctl_a) = spawn_node(&kv, &blob).await;
    wait_for_leader(&[&ctl_a]).await;
    let (addr_b, ctl_b) = spawn_node(&kv, &blob).await;
    wait_for_leader(&[&ctl_a, &ctl_b]).await;

    // Node A becomes the owner of shard 13.
    add_direct(&addr_a, 13, &unit(1)).await;

    let resp = no_redirect_client()
        .post(format!("http://{addr_b}/api/v1/add"))
        .json(&serde_json::json!({ "dbID": 13, "xb": unit(2) }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 301);
    let location = resp.headers()["location"].to_str().unwrap();
    assert!(location.contains(&addr_a));
    assert!(location.ends_with("/api/v1/add"));
}

#[tokio::test]
async fn route_client_learns_owners_and_replays_bodies() {
    let kv = MemKv::new();
    let blob = Arc::new(MemoryBlobStore::new());
    let (addr_a, ctl_a) = spawn_node(&kv, &blob).await;
    wait_for_leader(&[&ctl_a]).await;
    let (addr_b, ctl_b) = spawn_node(&kv, &blob).await;
    let (addr_c, ctl_c) = spawn_node(&kv, &blob).await;
    wait_for_leader(&[&ctl_a, &ctl_b, &ctl_c]).await;

    let nodes = vec![addr_a.clone(), addr_b.clone(), addr_c.clone()];
    let shards: Vec<i64> = (21..=30).collect();

    // Fill: the first pick per shard acquires ownership, so no redirects.
    let writer = RouteClient::new(nodes.clone()).unwrap();
    let mut expected = Vec::new();
    for (n, &db_id) in shards.iter().enumerate() {
        for j in 0..3 {
            let v = unit(n * 10 + j);
            let rsp = writer.add(db_id, v.clone(), None).await.unwrap();
            assert_eq!(rsp.err, "");
            assert_eq!(rsp.xid, allocate_xid(&v));
            expected.push((db_id, v, rsp.xid));
        }
    }
    assert_eq!(writer.num_random() as usize, shards.len());

    // A fresh client has an empty cache: random picks hit non-owners and
    // learn the routes from 301s while replaying the body intact.
    let reader = RouteClient::new(nodes.clone()).unwrap();
    for (db_id, v, xid) in &expected {
        let rsp = reader.search(*db_id, v.clone()).await.unwrap();
        assert_eq!(rsp.err, "");
        assert_eq!(rsp.xid, *xid);
        assert!(rsp.distance >= 0.9);
    }
    assert_eq!(reader.num_random() as usize, shards.len());

    // Once learned, routes are stable: no further redirects.
    let redirects_after_first_pass = reader.num_redirect();
    for (db_id, v, xid) in &expected {
        let rsp = reader.search(*db_id, v.clone()).await.unwrap();
        assert_eq!(rsp.xid, *xid);
    }
    assert_eq!(reader.num_redirect(), redirects_after_first_pass);
}

// ── Balancing ───────────────────────────────────────────────────────────

#[tokio::test]
async fn balancer_sheds_overloaded_leader() {
    let kv = MemKv::new();
    let blob = Arc::new(MemoryBlobStore::new());
    let (addr_a, ctl_a) = spawn_node_with(&kv, &blob, 1, 100).await;
    wait_for_leader(&[&ctl_a]).await;
    let (addr_b, ctl_b) = spawn_node_with(&kv, &blob, 1, 100).await;
    let (_addr_c, ctl_c) = spawn_node_with(&kv, &blob, 1, 100).await;
    wait_for_leader(&[&ctl_a, &ctl_b, &ctl_c]).await;

    // Pile 12 shards on the leader and one on a follower.
    for db_id in 101..=112 {
        let added = add_direct(&addr_a, db_id, &unit(db_id as usize)).await;
        assert_eq!(added["err"], "");
    }
    add_direct(&addr_b, 200, &unit(7)).await;
    assert_eq!(ctl_a.shard_count(), 12);

    // avg = 13/2 = 6, slack 2: the leader must drop to at most 8.
    let mut sheds_done = false;
    for _ in 0..100 {
        if ctl_a.shard_count() <= 8 {
            sheds_done = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    assert!(sheds_done, "leader still holds {} shards", ctl_a.shard_count());

    // Ownership keys of shed shards are gone; survivors keep theirs.
    let (load, _) = ctl_a.directory.snapshot().await.unwrap();
    let a_owned = load.get(&addr_a).map(Vec::len).unwrap_or(0);
    assert!(a_owned <= 8, "leader still owns {a_owned} shards in the directory");
    let total: usize = load.values().map(Vec::len).sum();
    assert!(total < 13, "some ownership keys should have been deleted");
}

#[tokio::test]
async fn released_shards_are_reacquired_on_next_request() {
    let kv = MemKv::new();
    let blob = Arc::new(MemoryBlobStore::new());
    let (addr_a, ctl_a) = spawn_node(&kv, &blob).await;
    wait_for_leader(&[&ctl_a]).await;

    let v = unit(3);
    let added = add_direct(&addr_a, 55, &v).await;
    let xid = added["xid"].as_u64().unwrap();

    // Simulate a balancer move: release RPC, then ownership delete.
    let released: serde_json::Value = plain_client()
        .post(format!("http://{addr_a}/mgmt/v1/release"))
        .json(&serde_json::json!({ "dbID": 55 }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(released["err"], "");
    ctl_a.directory.release(55).await.unwrap();
    assert_eq!(ctl_a.shard_count(), 0);

    // The next search re-acquires and reloads the shard from the blob store.
    let found = search_direct(&addr_a, 55, &v).await;
    assert_eq!(found["err"], "");
    assert_eq!(found["xid"].as_u64().unwrap(), xid);
    assert_eq!(ctl_a.shard_count(), 1);
}

#[tokio::test]
async fn leadership_fails_over_to_next_candidate() {
    let kv = MemKv::new();
    let blob = Arc::new(MemoryBlobStore::new());
    let (addr_a, ctl_a) = spawn_node(&kv, &blob).await;
    wait_for_leader(&[&ctl_a]).await;
    let (addr_b, ctl_b) = spawn_node(&kv, &blob).await;
    wait_for_leader(&[&ctl_a, &ctl_b]).await;
    assert!(ctl_a.leader_state().is_leader);

    ctl_a.membership.resign();

    // The queued candidate takes over and both nodes converge on it.
    let mut b_leads = false;
    for _ in 0..250 {
        if ctl_b.leader_state().is_leader
            && ctl_a.leader_state().cur_leader.as_deref() == Some(addr_b.as_str())
        {
            b_leads = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(b_leads, "leadership did not fail over");

    // Acquires succeed under the new leader.
    let added = add_direct(&addr_a, 77, &unit(1)).await;
    assert_eq!(added["err"], "");
    assert_eq!(ctl_a.shard_count(), 1);
}

#[tokio::test]
async fn dead_node_ownership_is_purged() {
    let kv = MemKv::new();
    let blob = Arc::new(MemoryBlobStore::new());
    let (_addr_a, ctl_a) = spawn_node_with(&kv, &blob, 3600, 100).await;
    wait_for_leader(&[&ctl_a]).await;
    let (addr_b, ctl_b) = spawn_node_with(&kv, &blob, 3600, 100).await;
    wait_for_leader(&[&ctl_a, &ctl_b]).await;

    add_direct(&addr_b, 301, &unit(1)).await;
    add_direct(&addr_b, 302, &unit(2)).await;
    let (load, _) = ctl_a.directory.snapshot().await.unwrap();
    assert_eq!(load.get(&addr_b).map(Vec::len), Some(2));

    // Simulate lease expiry: the liveness key disappears, the leader's
    // watch fires, and the dead node's ownership is purged without RPCs.
    kv.delete(&format!("{}{}", node_prefix(APP), addr_b))
        .await
        .unwrap();

    let mut purged = false;
    for _ in 0..100 {
        let (load, _) = ctl_a.directory.snapshot().await.unwrap();
        if !load.contains_key(&addr_b) {
            purged = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert!(purged, "dead node's ownership records were not purged");
}
