//! Quorum replication: fans one client operation out to N replicas and
//! succeeds once W (writes) or R (reads) of them acknowledge.
//!
//! Replica calls run in parallel, one task per replica, and the engine
//! waits for every issued call to settle before judging the quorum.
//! Peers the failure detector has marked dead short-circuit to a failed
//! ack without a network attempt. Reads pick the max-timestamp value
//! among the responses and asynchronously repair stale replicas.

use crate::peer_client::PeerClient;
use futures::stream::FuturesUnordered;
use futures::StreamExt;
use keyspace_common::{now_ms, NodeInfo, Timestamp, VersionedValue};
use keyspace_membership::MembershipManager;
use keyspace_ring::{HashRing, RingError};
use keyspace_storage::{StorageEngine, StorageError};
use std::sync::Arc;

/// Replication and quorum parameters. Strong consistency needs R + W > N.
#[derive(Debug, Clone)]
pub struct QuorumConfig {
    /// Replication factor (N).
    pub n: usize,
    /// Read quorum (R).
    pub r: usize,
    /// Write quorum (W).
    pub w: usize,
}

impl Default for QuorumConfig {
    fn default() -> Self {
        Self { n: 3, r: 2, w: 2 }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum KvError {
    #[error("No nodes available")]
    NoNodesAvailable,
    #[error("Quorum not reached: {acks}/{needed} acks")]
    QuorumNotReached { acks: usize, needed: usize },
    #[error("Read quorum not reached: {responses}/{needed}")]
    ReadQuorumNotReached { responses: usize, needed: usize },
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}

impl From<RingError> for KvError {
    fn from(_: RingError) -> Self {
        KvError::NoNodesAvailable
    }
}

enum WriteOp {
    Put { value: Vec<u8> },
    Delete,
}

/// Coordinates one client operation across the replica set.
pub struct ReplicationEngine<C: PeerClient> {
    self_id: String,
    storage: Arc<StorageEngine>,
    ring: Arc<HashRing>,
    membership: Arc<MembershipManager>,
    client: Arc<C>,
    config: QuorumConfig,
}

impl<C: PeerClient> std::fmt::Debug for ReplicationEngine<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplicationEngine")
            .field("self_id", &self.self_id)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl<C: PeerClient> ReplicationEngine<C> {
    pub fn new(
        self_id: impl Into<String>,
        storage: Arc<StorageEngine>,
        ring: Arc<HashRing>,
        membership: Arc<MembershipManager>,
        client: Arc<C>,
        config: QuorumConfig,
    ) -> Self {
        Self {
            self_id: self_id.into(),
            storage,
            ring,
            membership,
            client,
            config,
        }
    }

    pub fn config(&self) -> &QuorumConfig {
        &self.config
    }

    // -----------------------------------------------------------------------
    // Writes
    // -----------------------------------------------------------------------

    /// Quorum PUT. The coordinator stamps the write with its own clock;
    /// last writer wins across the cluster.
    pub async fn replicated_put(&self, key: &str, value: &[u8]) -> Result<(), KvError> {
        let ts = now_ms();
        self.fan_out_write(key, WriteOp::Put { value: value.to_vec() }, ts)
            .await
    }

    /// Quorum DELETE, stamped with the coordinator's clock like a PUT.
    pub async fn replicated_delete(&self, key: &str) -> Result<(), KvError> {
        let ts = now_ms();
        self.fan_out_write(key, WriteOp::Delete, ts).await
    }

    async fn fan_out_write(&self, key: &str, op: WriteOp, ts: Timestamp) -> Result<(), KvError> {
        let replicas = self.ring.nodes_for(key, self.config.n)?;
        if replicas.is_empty() {
            return Err(KvError::NoNodesAvailable);
        }

        let mut calls = FuturesUnordered::new();
        for node_id in &replicas {
            if *node_id == self.self_id {
                let storage = self.storage.clone();
                let key = key.to_string();
                let origin = self.self_id.clone();
                let is_put = matches!(op, WriteOp::Put { .. });
                let value = match &op {
                    WriteOp::Put { value } => value.clone(),
                    WriteOp::Delete => Vec::new(),
                };
                calls.push(tokio::spawn(async move {
                    let result = if is_put {
                        storage.put(&key, &value, ts, &origin)
                    } else {
                        storage.delete(&key, ts)
                    };
                    result.unwrap_or_else(|e| {
                        tracing::error!(error = %e, "local replica write failed");
                        false
                    })
                }));
            } else {
                let Some(target) = self.reachable_member(node_id) else {
                    calls.push(tokio::spawn(async { false }));
                    continue;
                };
                let client = self.client.clone();
                let key = key.to_string();
                let origin = self.self_id.clone();
                let is_put = matches!(op, WriteOp::Put { .. });
                let value = match &op {
                    WriteOp::Put { value } => value.clone(),
                    WriteOp::Delete => Vec::new(),
                };
                calls.push(tokio::spawn(async move {
                    let result = if is_put {
                        client.internal_put(&target, &key, &value, ts, &origin).await
                    } else {
                        client.internal_delete(&target, &key, ts).await
                    };
                    match result {
                        Ok(acked) => acked,
                        Err(e) => {
                            tracing::debug!(peer = %target.node_id, error = %e, "replica write failed");
                            false
                        }
                    }
                }));
            }
        }

        // All calls settle before the quorum is judged.
        let mut acks = 0usize;
        while let Some(result) = calls.next().await {
            if matches!(result, Ok(true)) {
                acks += 1;
            }
        }

        if acks >= self.config.w {
            Ok(())
        } else {
            let err = KvError::QuorumNotReached {
                acks,
                needed: self.config.w,
            };
            tracing::warn!(key, %err, "write quorum failed");
            Err(err)
        }
    }

    // -----------------------------------------------------------------------
    // Reads
    // -----------------------------------------------------------------------

    /// Quorum GET. `Ok(None)` means the quorum agreed the key is absent.
    pub async fn replicated_get(&self, key: &str) -> Result<Option<VersionedValue>, KvError> {
        let replicas = self.ring.nodes_for(key, self.config.n)?;
        if replicas.is_empty() {
            return Err(KvError::NoNodesAvailable);
        }

        let mut calls = FuturesUnordered::new();
        for node_id in &replicas {
            if *node_id == self.self_id {
                let storage = self.storage.clone();
                let key = key.to_string();
                let node_id = node_id.clone();
                calls.push(tokio::spawn(async move {
                    (node_id, true, storage.get(&key))
                }));
            } else {
                let node_id = node_id.clone();
                let Some(target) = self.reachable_member(&node_id) else {
                    calls.push(tokio::spawn(async move { (node_id, false, None) }));
                    continue;
                };
                let client = self.client.clone();
                let key = key.to_string();
                calls.push(tokio::spawn(async move {
                    match client.internal_get(&target, &key).await {
                        Ok(value) => (node_id, true, value),
                        Err(e) => {
                            tracing::debug!(peer = %node_id, error = %e, "replica read failed");
                            (node_id, false, None)
                        }
                    }
                }));
            }
        }

        let mut responses: Vec<(String, Option<VersionedValue>)> = Vec::new();
        while let Some(result) = calls.next().await {
            if let Ok((node_id, ok, value)) = result {
                if ok {
                    responses.push((node_id, value));
                }
            }
        }

        if responses.len() < self.config.r {
            let err = KvError::ReadQuorumNotReached {
                responses: responses.len(),
                needed: self.config.r,
            };
            tracing::warn!(key, %err, "read quorum failed");
            return Err(err);
        }

        let latest = responses
            .iter()
            .filter_map(|(_, v)| v.as_ref())
            .max_by_key(|vv| vv.timestamp)
            .cloned();

        if let Some(ref latest) = latest {
            self.spawn_read_repair(key.to_string(), latest.clone(), responses);
        }

        Ok(latest)
    }

    /// Push the winning version to every responder that was missing it
    /// or held a strictly older one. Fire-and-forget: failures only log.
    fn spawn_read_repair(
        &self,
        key: String,
        latest: VersionedValue,
        responses: Vec<(String, Option<VersionedValue>)>,
    ) {
        let stale: Vec<String> = responses
            .into_iter()
            .filter(|(_, v)| {
                v.as_ref().map_or(true, |vv| vv.timestamp < latest.timestamp)
            })
            .map(|(node_id, _)| node_id)
            .collect();
        if stale.is_empty() {
            return;
        }

        let storage = self.storage.clone();
        let membership = self.membership.clone();
        let client = self.client.clone();
        let self_id = self.self_id.clone();

        tokio::spawn(async move {
            keyspace_metrics::metrics().read_repairs.inc();
            for node_id in stale {
                if node_id == self_id {
                    if let Err(e) = storage.conditional_put(&key, &latest) {
                        tracing::warn!(key, error = %e, "local read repair failed");
                    }
                    continue;
                }
                let Some(target) = membership.member(&node_id).filter(|m| m.is_alive) else {
                    continue;
                };
                if let Err(e) = client
                    .internal_put(&target, &key, &latest.value, latest.timestamp, &latest.origin)
                    .await
                {
                    tracing::debug!(peer = %node_id, key, error = %e, "read repair failed");
                }
            }
        });
    }

    /// Resolve a replica id to an address, refusing peers marked dead.
    fn reachable_member(&self, node_id: &str) -> Option<NodeInfo> {
        self.membership.member(node_id).filter(|m| m.is_alive)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer_client::{PeerClient, ReplicaError};
    use keyspace_membership::{GossipError, GossipSender, MembershipConfig};
    use std::collections::HashMap;
    use std::sync::Mutex;
    use tempfile::TempDir;
    use tokio::time::Duration;

    struct NullSender;

    #[async_trait::async_trait]
    impl GossipSender for NullSender {
        async fn send_gossip(
            &self,
            _host: &str,
            _port: u16,
            _view: Vec<NodeInfo>,
        ) -> Result<Vec<NodeInfo>, GossipError> {
            Ok(Vec::new())
        }
    }

    /// Scriptable peer: per-node stored values, per-node failure flags,
    /// and a record of every internal_put it receives.
    #[derive(Default)]
    struct MockPeer {
        values: Mutex<HashMap<String, VersionedValue>>,
        down: Mutex<Vec<String>>,
        puts: Mutex<Vec<(String, String, Timestamp)>>,
        gets: Mutex<Vec<String>>,
    }

    impl MockPeer {
        fn set_value(&self, node_id: &str, vv: VersionedValue) {
            self.values.lock().unwrap().insert(node_id.to_string(), vv);
        }

        fn take_down(&self, node_id: &str) {
            self.down.lock().unwrap().push(node_id.to_string());
        }

        fn recorded_puts(&self) -> Vec<(String, String, Timestamp)> {
            self.puts.lock().unwrap().clone()
        }

        fn recorded_gets(&self) -> Vec<String> {
            self.gets.lock().unwrap().clone()
        }

        fn is_down(&self, node_id: &str) -> bool {
            self.down.lock().unwrap().iter().any(|n| n == node_id)
        }
    }

    #[async_trait::async_trait]
    impl PeerClient for MockPeer {
        async fn internal_put(
            &self,
            target: &NodeInfo,
            key: &str,
            _value: &[u8],
            timestamp: Timestamp,
            _origin: &str,
        ) -> Result<bool, ReplicaError> {
            if self.is_down(&target.node_id) {
                return Err(ReplicaError::RpcFailed("connection refused".into()));
            }
            self.puts
                .lock()
                .unwrap()
                .push((target.node_id.clone(), key.to_string(), timestamp));
            Ok(true)
        }

        async fn internal_get(
            &self,
            target: &NodeInfo,
            _key: &str,
        ) -> Result<Option<VersionedValue>, ReplicaError> {
            if self.is_down(&target.node_id) {
                return Err(ReplicaError::RpcFailed("connection refused".into()));
            }
            self.gets.lock().unwrap().push(target.node_id.clone());
            Ok(self.values.lock().unwrap().get(&target.node_id).cloned())
        }

        async fn internal_delete(
            &self,
            target: &NodeInfo,
            _key: &str,
            _timestamp: Timestamp,
        ) -> Result<bool, ReplicaError> {
            if self.is_down(&target.node_id) {
                return Err(ReplicaError::RpcFailed("connection refused".into()));
            }
            Ok(true)
        }
    }

    struct Harness {
        engine: ReplicationEngine<MockPeer>,
        peer: Arc<MockPeer>,
        storage: Arc<StorageEngine>,
        membership: Arc<MembershipManager>,
        _dir: TempDir,
    }

    /// Three-node cluster view ("a" is local) with N=3, R=W=2.
    fn harness() -> Harness {
        let dir = TempDir::new().unwrap();
        let storage = Arc::new(StorageEngine::open(dir.path()).unwrap());

        let ring = Arc::new(HashRing::default());
        for n in ["a", "b", "c"] {
            ring.add_node(n);
        }

        let membership = Arc::new(MembershipManager::new(
            NodeInfo::new("a", "127.0.0.1", 7000),
            Vec::new(),
            Arc::new(NullSender),
            MembershipConfig::default(),
        ));
        membership.handle_gossip(vec![
            NodeInfo {
                node_id: "b".into(),
                host: "127.0.0.1".into(),
                port: 7001,
                is_alive: true,
                last_heartbeat: 1,
            },
            NodeInfo {
                node_id: "c".into(),
                host: "127.0.0.1".into(),
                port: 7002,
                is_alive: true,
                last_heartbeat: 1,
            },
        ]);

        let peer = Arc::new(MockPeer::default());
        let engine = ReplicationEngine::new(
            "a",
            storage.clone(),
            ring,
            membership.clone(),
            peer.clone(),
            QuorumConfig::default(),
        );

        Harness {
            engine,
            peer,
            storage,
            membership,
            _dir: dir,
        }
    }

    #[tokio::test]
    async fn test_put_reaches_all_replicas() {
        let h = harness();
        h.engine.replicated_put("k", b"v").await.unwrap();

        // Local copy is durable and both remotes saw the same write.
        assert_eq!(h.storage.get("k").unwrap().value, b"v");
        let puts = h.peer.recorded_puts();
        assert_eq!(puts.len(), 2);
        assert_eq!(puts[0].2, puts[1].2, "both replicas get the same timestamp");
    }

    #[tokio::test]
    async fn test_put_survives_one_dead_replica() {
        let h = harness();
        h.peer.take_down("b");
        h.engine.replicated_put("k", b"v").await.unwrap();
    }

    #[tokio::test]
    async fn test_put_quorum_failure_reports_counts() {
        let h = harness();
        h.peer.take_down("b");
        h.peer.take_down("c");

        let err = h.engine.replicated_put("k", b"v").await.unwrap_err();
        assert_eq!(err.to_string(), "Quorum not reached: 1/2 acks");
    }

    #[tokio::test]
    async fn test_dead_marked_peers_get_no_network_call() {
        let h = harness();
        h.membership.mark_dead("b");
        h.membership.mark_dead("c");

        let err = h.engine.replicated_put("k", b"v").await.unwrap_err();
        assert!(err.to_string().contains("1/2"));
        assert!(h.peer.recorded_puts().is_empty(), "no RPC to dead peers");
    }

    #[tokio::test]
    async fn test_get_returns_latest_version() {
        let h = harness();
        h.storage.put("k", b"local", 100, "a").unwrap();
        h.peer.set_value("b", VersionedValue::new("newer", 300, "b"));
        h.peer.set_value("c", VersionedValue::new("middle", 200, "c"));

        let vv = h.engine.replicated_get("k").await.unwrap().unwrap();
        assert_eq!(vv.value, b"newer");
        assert_eq!(vv.timestamp, 300);
    }

    #[tokio::test]
    async fn test_get_missing_key_is_none() {
        let h = harness();
        assert!(h.engine.replicated_get("ghost").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_get_quorum_failure_reports_counts() {
        let h = harness();
        h.peer.take_down("b");
        h.peer.take_down("c");

        let err = h.engine.replicated_get("k").await.unwrap_err();
        assert_eq!(err.to_string(), "Read quorum not reached: 1/2");
    }

    #[tokio::test]
    async fn test_read_repair_updates_stale_replicas() {
        let h = harness();
        // Local is stale, "b" holds the winner, "c" has nothing.
        h.storage.put("k", b"old", 100, "a").unwrap();
        h.peer.set_value("b", VersionedValue::new("new", 300, "b"));

        let vv = h.engine.replicated_get("k").await.unwrap().unwrap();
        assert_eq!(vv.timestamp, 300);

        // Repair is async; give the spawned task a beat.
        tokio::time::sleep(Duration::from_millis(50)).await;

        let local = h.storage.get("k").unwrap();
        assert_eq!(local.value, b"new");
        assert_eq!(local.timestamp, 300);

        let puts = h.peer.recorded_puts();
        assert_eq!(puts.len(), 1, "only the empty replica is repaired remotely");
        assert_eq!(puts[0].0, "c");
        assert_eq!(puts[0].2, 300);
    }

    #[tokio::test]
    async fn test_no_repair_when_replicas_agree() {
        let h = harness();
        h.storage.put("k", b"v", 100, "a").unwrap();
        h.peer.set_value("b", VersionedValue::new("v", 100, "a"));
        h.peer.set_value("c", VersionedValue::new("v", 100, "a"));

        h.engine.replicated_get("k").await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(h.peer.recorded_puts().is_empty());
    }

    #[tokio::test]
    async fn test_delete_fans_out() {
        let h = harness();
        h.storage.put("k", b"v", 100, "a").unwrap();
        h.engine.replicated_delete("k").await.unwrap();
        assert!(h.storage.get("k").is_none());
    }

    #[tokio::test]
    async fn test_empty_ring_fails_cleanly() {
        let dir = TempDir::new().unwrap();
        let storage = Arc::new(StorageEngine::open(dir.path()).unwrap());
        let membership = Arc::new(MembershipManager::new(
            NodeInfo::new("a", "127.0.0.1", 7000),
            Vec::new(),
            Arc::new(NullSender),
            MembershipConfig::default(),
        ));
        let engine = ReplicationEngine::new(
            "a",
            storage,
            Arc::new(HashRing::default()),
            membership,
            Arc::new(MockPeer::default()),
            QuorumConfig::default(),
        );

        let err = engine.replicated_put("k", b"v").await.unwrap_err();
        assert_eq!(err.to_string(), "No nodes available");
    }

    #[tokio::test]
    async fn test_reads_see_quorum_writes() {
        // R + W > N: any read quorum overlaps the last write quorum.
        let h = harness();
        h.peer.take_down("c");
        h.engine.replicated_put("k", b"v1").await.unwrap();

        let vv = h.engine.replicated_get("k").await.unwrap().unwrap();
        assert_eq!(vv.value, b"v1");
        assert!(h.peer.recorded_gets().contains(&"b".to_string()));
    }
}
