//! keyspace-membership: push-gossip membership and failure detection.
//!
//! Every node keeps a map of [`NodeInfo`] entries and pushes its full
//! view to a couple of random live peers each second. Incoming views
//! merge by the max-heartbeat rule. A peer silent for longer than the
//! failure timeout is marked dead (never removed; gossip can resurrect
//! it). Join/leave transitions fire callbacks, which the node binary
//! wires to the hash ring.
//!
//! The network side is behind the [`GossipSender`] trait, same pattern
//! as the replication layer's peer client: the real one-shot TCP
//! implementation lives in `keyspace-net`, tests plug in mocks.

use keyspace_common::{now_ms, NodeInfo, Timestamp};
use rand::seq::SliceRandom;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;

#[derive(Debug, thiserror::Error)]
pub enum GossipError {
    #[error("gossip send failed: {0}")]
    SendFailed(String),
}

/// Transport for one-shot gossip pushes.
///
/// Returns the peer's own view when it completes the request/response
/// cycle. The periodic loop discards it; bootstrap merges it.
#[async_trait::async_trait]
pub trait GossipSender: Send + Sync + 'static {
    async fn send_gossip(
        &self,
        host: &str,
        port: u16,
        view: Vec<NodeInfo>,
    ) -> Result<Vec<NodeInfo>, GossipError>;
}

/// Tunables for the two background loops.
#[derive(Debug, Clone)]
pub struct MembershipConfig {
    /// Gossip round period.
    pub interval: Duration,
    /// Silence after which a peer is marked dead.
    pub failure_timeout_ms: u64,
    /// Live peers contacted per round.
    pub fanout: usize,
}

impl Default for MembershipConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(1000),
            failure_timeout_ms: 5000,
            fanout: 2,
        }
    }
}

type JoinCallback = Box<dyn Fn(&NodeInfo) + Send + Sync>;
type LeaveCallback = Box<dyn Fn(&str) + Send + Sync>;

/// The cluster's view of itself, as seen from one node.
pub struct MembershipManager {
    self_id: String,
    members: RwLock<HashMap<String, NodeInfo>>,
    seeds: Vec<(String, u16)>,
    sender: Arc<dyn GossipSender>,
    config: MembershipConfig,
    on_join: RwLock<Option<JoinCallback>>,
    on_leave: RwLock<Option<LeaveCallback>>,
    shutdown: CancellationToken,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for MembershipManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MembershipManager")
            .field("self_id", &self.self_id)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl MembershipManager {
    pub fn new(
        mut self_info: NodeInfo,
        seeds: Vec<(String, u16)>,
        sender: Arc<dyn GossipSender>,
        config: MembershipConfig,
    ) -> Self {
        self_info.is_alive = true;
        self_info.last_heartbeat = now_ms();
        let self_id = self_info.node_id.clone();

        let mut members = HashMap::new();
        members.insert(self_id.clone(), self_info);

        Self {
            self_id,
            members: RwLock::new(members),
            seeds,
            sender,
            config,
            on_join: RwLock::new(None),
            on_leave: RwLock::new(None),
            shutdown: CancellationToken::new(),
            workers: Mutex::new(Vec::new()),
        }
    }

    pub fn self_id(&self) -> &str {
        &self.self_id
    }

    /// Called whenever a previously unknown (or dead) node becomes live.
    pub fn set_on_join(&self, cb: impl Fn(&NodeInfo) + Send + Sync + 'static) {
        *self.on_join.write().expect("membership callback lock") = Some(Box::new(cb));
    }

    /// Called whenever the failure detector marks a node dead.
    pub fn set_on_leave(&self, cb: impl Fn(&str) + Send + Sync + 'static) {
        *self.on_leave.write().expect("membership callback lock") = Some(Box::new(cb));
    }

    // -----------------------------------------------------------------------
    // View accessors
    // -----------------------------------------------------------------------

    /// Every member ever observed, dead ones included.
    pub fn all_members(&self) -> Vec<NodeInfo> {
        let members = self.members.read().expect("membership lock");
        let mut view: Vec<NodeInfo> = members.values().cloned().collect();
        view.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        view
    }

    pub fn alive_members(&self) -> Vec<NodeInfo> {
        self.all_members().into_iter().filter(|m| m.is_alive).collect()
    }

    pub fn member(&self, node_id: &str) -> Option<NodeInfo> {
        self.members
            .read()
            .expect("membership lock")
            .get(node_id)
            .cloned()
    }

    pub fn member_count(&self) -> usize {
        self.members.read().expect("membership lock").len()
    }

    // -----------------------------------------------------------------------
    // Merging
    // -----------------------------------------------------------------------

    /// Merge one incoming view into the local map.
    pub fn handle_gossip(&self, entries: Vec<NodeInfo>) {
        for entry in entries {
            if entry.node_id == self.self_id {
                continue;
            }
            self.merge_entry(entry);
        }
    }

    /// Merge a single entry by the max-heartbeat rule.
    fn merge_entry(&self, entry: NodeInfo) {
        let joined = {
            let mut members = self.members.write().expect("membership lock");
            match members.get_mut(&entry.node_id) {
                None => {
                    tracing::info!(node_id = %entry.node_id, addr = %entry.address(), "membership: node joined");
                    members.insert(entry.node_id.clone(), entry.clone());
                    Some(entry)
                }
                Some(local) => {
                    if entry.last_heartbeat <= local.last_heartbeat {
                        None
                    } else {
                        // The fresher entry also carries the truth about
                        // where the node lives.
                        local.last_heartbeat = entry.last_heartbeat;
                        local.host = entry.host.clone();
                        local.port = entry.port;
                        if !local.is_alive && entry.is_alive {
                            local.is_alive = true;
                            tracing::info!(node_id = %entry.node_id, "membership: node resurrected");
                            Some(local.clone())
                        } else {
                            None
                        }
                    }
                }
            }
        };

        if let Some(node) = joined {
            if let Some(cb) = self.on_join.read().expect("membership callback lock").as_ref() {
                cb(&node);
            }
        }
    }

    /// Mark a node dead and fire `on_leave`. Dead entries stay in the
    /// map so a later gossip with a fresher heartbeat can revive them.
    pub fn mark_dead(&self, node_id: &str) {
        if node_id == self.self_id {
            return;
        }
        {
            let mut members = self.members.write().expect("membership lock");
            match members.get_mut(node_id) {
                Some(info) if info.is_alive => info.is_alive = false,
                _ => return,
            }
        }
        tracing::warn!(node_id, "membership: node marked dead");
        if let Some(cb) = self.on_leave.read().expect("membership callback lock").as_ref() {
            cb(node_id);
        }
    }

    /// One failure-detector pass: mark every live non-self member whose
    /// heartbeat is older than the timeout. Returns how many died.
    pub fn expire_dead(&self, now: Timestamp) -> usize {
        let timeout = self.config.failure_timeout_ms;
        let expired: Vec<String> = {
            let members = self.members.read().expect("membership lock");
            members
                .values()
                .filter(|m| {
                    m.node_id != self.self_id
                        && m.is_alive
                        && now.saturating_sub(m.last_heartbeat) > timeout
                })
                .map(|m| m.node_id.clone())
                .collect()
        };
        for node_id in &expired {
            self.mark_dead(node_id);
        }
        expired.len()
    }

    /// Refresh our own heartbeat so peers keep seeing us live.
    pub fn heartbeat_self(&self, now: Timestamp) {
        let mut members = self.members.write().expect("membership lock");
        if let Some(me) = members.get_mut(&self.self_id) {
            me.last_heartbeat = now;
        }
    }

    // -----------------------------------------------------------------------
    // Background loops
    // -----------------------------------------------------------------------

    /// Spawn the gossip and failure-detection loops. Seeds are contacted
    /// once before the first gossip round.
    pub fn start(self: &Arc<Self>) {
        tracing::info!(self_id = %self.self_id, "membership: starting gossip and failure detection");

        let gossip = {
            let mgr = self.clone();
            tokio::spawn(async move {
                mgr.bootstrap().await;
                let mut tick = tokio::time::interval(mgr.config.interval);
                loop {
                    tokio::select! {
                        _ = mgr.shutdown.cancelled() => break,
                        _ = tick.tick() => mgr.gossip_round().await,
                    }
                }
            })
        };

        let failure = {
            let mgr = self.clone();
            tokio::spawn(async move {
                let mut tick = tokio::time::interval(mgr.config.interval);
                loop {
                    tokio::select! {
                        _ = mgr.shutdown.cancelled() => break,
                        _ = tick.tick() => {
                            mgr.expire_dead(now_ms());
                        }
                    }
                }
            })
        };

        let mut workers = self.workers.lock().expect("membership worker lock");
        workers.push(gossip);
        workers.push(failure);
    }

    /// Cooperative shutdown: cancel and join both loops.
    pub async fn stop(&self) {
        self.shutdown.cancel();
        let workers: Vec<JoinHandle<()>> = {
            let mut guard = self.workers.lock().expect("membership worker lock");
            guard.drain(..).collect()
        };
        for w in workers {
            let _ = w.await;
        }
        tracing::info!(self_id = %self.self_id, "membership: stopped");
    }

    /// Push our view to every seed and merge whatever comes back.
    async fn bootstrap(&self) {
        for (host, port) in &self.seeds {
            let view = self.all_members();
            match self.sender.send_gossip(host, *port, view).await {
                Ok(entries) => {
                    tracing::info!(seed = %format!("{host}:{port}"), "membership: contacted seed");
                    self.handle_gossip(entries);
                }
                Err(e) => {
                    tracing::warn!(seed = %format!("{host}:{port}"), error = %e, "membership: seed unreachable");
                }
            }
        }
    }

    /// One gossip round: refresh our heartbeat, then push the full view
    /// to up to `fanout` random live peers. Responses are discarded.
    async fn gossip_round(&self) {
        self.heartbeat_self(now_ms());

        let m = keyspace_metrics::metrics();
        m.gossip_rounds.inc();
        m.peers_alive.set(self.alive_members().len() as i64);

        let peers: Vec<NodeInfo> = {
            let mut candidates: Vec<NodeInfo> = self
                .alive_members()
                .into_iter()
                .filter(|m| m.node_id != self.self_id)
                .collect();
            let mut rng = rand::thread_rng();
            candidates.shuffle(&mut rng);
            candidates.truncate(self.config.fanout);
            candidates
        };

        if peers.is_empty() {
            return;
        }

        let view = self.all_members();
        for peer in peers {
            if let Err(e) = self
                .sender
                .send_gossip(&peer.host, peer.port, view.clone())
                .await
            {
                tracing::debug!(peer = %peer.node_id, error = %e, "gossip send failed");
            }
        }
    }
}
