//! Integration test: spin up real nodes on loopback TCP, gossip them
//! together, then drive client traffic through the wire protocol.

use keyspace_common::{now_ms, NodeInfo};
use keyspace_kv::{Coordinator, QuorumConfig};
use keyspace_membership::{MembershipConfig, MembershipManager};
use keyspace_net::{serve, KvClient, TcpPeerClient};
use keyspace_ring::HashRing;
use keyspace_storage::StorageEngine;
use std::net::SocketAddr;
use std::sync::Arc;
use tempfile::TempDir;
use tokio::net::TcpListener;
use tokio::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

struct TestNode {
    node_id: String,
    addr: SocketAddr,
    storage: Arc<StorageEngine>,
    ring: Arc<HashRing>,
    membership: Arc<MembershipManager>,
    shutdown: CancellationToken,
    _dir: TempDir,
}

impl TestNode {
    fn client(&self) -> KvClient {
        KvClient::connect(&self.addr.to_string(), Duration::from_secs(5)).unwrap()
    }
}

/// Wire up a full node the way the binary does, on an OS-assigned port.
async fn spawn_node(node_id: &str, seeds: Vec<(String, u16)>, quorum: QuorumConfig) -> TestNode {
    let dir = TempDir::new().unwrap();
    let storage = Arc::new(StorageEngine::open(dir.path()).unwrap());
    storage.recover().unwrap();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let ring = Arc::new(HashRing::default());
    ring.add_node(node_id);

    let peer_client = Arc::new(TcpPeerClient::new(Duration::from_secs(5)));
    let membership = Arc::new(MembershipManager::new(
        NodeInfo::new(node_id, "127.0.0.1", addr.port()),
        seeds,
        peer_client.clone(),
        MembershipConfig {
            interval: Duration::from_millis(100),
            failure_timeout_ms: 5000,
            fanout: 2,
        },
    ));
    {
        let ring_join = ring.clone();
        membership.set_on_join(move |node| ring_join.add_node(&node.node_id));
        let ring_leave = ring.clone();
        membership.set_on_leave(move |node_id| ring_leave.remove_node(node_id));
    }

    let coordinator = Arc::new(Coordinator::new(
        node_id,
        storage.clone(),
        ring.clone(),
        membership.clone(),
        peer_client,
        quorum,
    ));

    let shutdown = CancellationToken::new();
    tokio::spawn(serve(listener, coordinator, shutdown.clone()));
    membership.start();

    TestNode {
        node_id: node_id.to_string(),
        addr,
        storage,
        ring,
        membership,
        shutdown,
        _dir: dir,
    }
}

async fn shutdown_node(node: &TestNode) {
    node.membership.stop().await;
    node.shutdown.cancel();
}

/// Poll until `cond` holds or the deadline passes.
async fn wait_for(what: &str, mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_single_node_put_get_delete() {
    let node = spawn_node("solo", Vec::new(), QuorumConfig { n: 1, r: 1, w: 1 }).await;
    let mut client = node.client();

    client.put("user:1001", b"{\"name\":\"N\"}").unwrap();
    let vv = client.get("user:1001").unwrap().unwrap();
    assert_eq!(vv.value, b"{\"name\":\"N\"}");
    assert_eq!(vv.origin, "solo");

    client.delete("user:1001").unwrap();
    assert!(client.get("user:1001").unwrap().is_none());

    shutdown_node(&node).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_pipelined_requests_on_one_connection() {
    let node = spawn_node("solo", Vec::new(), QuorumConfig { n: 1, r: 1, w: 1 }).await;
    let mut client = node.client();

    for i in 0..20 {
        client.put(&format!("key_{i}"), format!("value_{i}").as_bytes()).unwrap();
    }
    for i in 0..20 {
        let vv = client.get(&format!("key_{i}")).unwrap().unwrap();
        assert_eq!(vv.value, format!("value_{i}").as_bytes());
    }

    shutdown_node(&node).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_three_node_cluster_replicates() {
    let a = spawn_node("node-a", Vec::new(), QuorumConfig::default()).await;
    let seed = vec![("127.0.0.1".to_string(), a.addr.port())];
    let b = spawn_node("node-b", seed.clone(), QuorumConfig::default()).await;
    let c = spawn_node("node-c", seed, QuorumConfig::default()).await;

    // Gossip converges transitively: everyone learns everyone.
    for node in [&a, &b, &c] {
        let membership = node.membership.clone();
        let ring = node.ring.clone();
        wait_for(&format!("{} to see the full cluster", node.node_id), move || {
            membership.alive_members().len() == 3 && ring.node_count() == 3
        })
        .await;
    }

    let mut client = a.client();
    client.put("shared-key", b"replicated").unwrap();

    // N=3: the write lands on every node's local store.
    for node in [&a, &b, &c] {
        let storage = node.storage.clone();
        wait_for(&format!("replica on {}", node.node_id), move || {
            storage.get("shared-key").is_some()
        })
        .await;
    }

    // And any node serves the read.
    let mut client_b = b.client();
    let vv = client_b.get("shared-key").unwrap().unwrap();
    assert_eq!(vv.value, b"replicated");
    assert_eq!(vv.origin, "node-a");

    for node in [&a, &b, &c] {
        shutdown_node(node).await;
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_quorum_failure_surfaces_counts() {
    // A cluster of three where both peers have been marked dead: the
    // write can only reach the local replica, 1 ack < W=2.
    let a = spawn_node("node-a", Vec::new(), QuorumConfig::default()).await;

    a.membership.handle_gossip(vec![
        NodeInfo {
            node_id: "node-b".into(),
            host: "127.0.0.1".into(),
            port: 1,
            is_alive: true,
            last_heartbeat: now_ms(),
        },
        NodeInfo {
            node_id: "node-c".into(),
            host: "127.0.0.1".into(),
            port: 1,
            is_alive: true,
            last_heartbeat: now_ms(),
        },
    ]);
    a.membership.mark_dead("node-b");
    a.membership.mark_dead("node-c");

    let mut client = a.client();
    let err = client.put("doomed", b"v").unwrap_err();
    assert!(
        err.to_string().contains("1/2"),
        "quorum error should carry the counts, got: {err}"
    );

    shutdown_node(&a).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_read_repair_heals_stale_replica() {
    let a = spawn_node("node-a", Vec::new(), QuorumConfig::default()).await;
    let seed = vec![("127.0.0.1".to_string(), a.addr.port())];
    let b = spawn_node("node-b", seed.clone(), QuorumConfig::default()).await;
    let c = spawn_node("node-c", seed, QuorumConfig::default()).await;

    for node in [&a, &b, &c] {
        let membership = node.membership.clone();
        wait_for("cluster convergence", move || membership.alive_members().len() == 3).await;
    }

    // Seed divergent replicas behind the coordinator's back.
    let ts = now_ms();
    a.storage.put("k", b"stale", ts, "node-a").unwrap();
    b.storage.put("k", b"fresh", ts + 100, "node-b").unwrap();

    let mut client = a.client();
    let vv = client.get("k").unwrap().unwrap();
    assert_eq!(vv.value, b"fresh");

    // Repair propagates the winner to the laggards.
    for node in [&a, &c] {
        let storage = node.storage.clone();
        wait_for(&format!("repair on {}", node.node_id), move || {
            storage.get("k").is_some_and(|vv| vv.value == b"fresh")
        })
        .await;
    }

    for node in [&a, &b, &c] {
        shutdown_node(node).await;
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_cluster_info_over_wire() {
    let node = spawn_node("solo", Vec::new(), QuorumConfig { n: 1, r: 1, w: 1 }).await;
    let mut client = node.client();
    client.put("k", b"v").unwrap();

    let (members, local_size) = client.cluster_info().unwrap();
    assert_eq!(members.len(), 1);
    assert_eq!(members[0].node_id, "solo");
    assert!(members[0].is_alive);
    assert_eq!(local_size, 1);

    shutdown_node(&node).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_gossip_exchange_over_wire() {
    let node = spawn_node("solo", Vec::new(), QuorumConfig { n: 1, r: 1, w: 1 }).await;

    let sender = TcpPeerClient::new(Duration::from_secs(5));
    let view = vec![NodeInfo {
        node_id: "visitor".into(),
        host: "127.0.0.1".into(),
        port: 9,
        is_alive: true,
        last_heartbeat: now_ms(),
    }];

    use keyspace_membership::GossipSender;
    let reply = sender
        .send_gossip("127.0.0.1", node.addr.port(), view)
        .await
        .unwrap();

    // The reply is the node's merged view: itself plus the visitor.
    assert_eq!(reply.len(), 2);
    assert!(reply.iter().any(|e| e.node_id == "solo"));
    assert!(reply.iter().any(|e| e.node_id == "visitor"));
    assert!(node.membership.member("visitor").is_some());

    shutdown_node(&node).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_data_survives_node_restart() {
    let dir = TempDir::new().unwrap();
    {
        let storage = Arc::new(StorageEngine::open(dir.path()).unwrap());
        storage.put("persistent", b"v", 100, "solo").unwrap();
    }

    // A fresh engine over the same directory recovers the key.
    let storage = Arc::new(StorageEngine::open(dir.path()).unwrap());
    storage.recover().unwrap();
    assert_eq!(storage.get("persistent").unwrap().value, b"v");
}
