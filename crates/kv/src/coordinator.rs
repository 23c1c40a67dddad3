//! The coordinator: single entry point for every incoming frame.
//!
//! A pure dispatcher over the closed [`Request`] enum. Client ops go
//! through the replication engine; internal ops hit local storage
//! directly; gossip merges into membership and answers with our own
//! view. Nothing here propagates an error to the network reader; every
//! failure becomes an ERROR response.

use crate::peer_client::PeerClient;
use crate::replication::{KvError, QuorumConfig, ReplicationEngine};
use bytes::Bytes;
use keyspace_common::VersionedValue;
use keyspace_membership::MembershipManager;
use keyspace_proto::{MemberStatus, Request, Response, WireError};
use keyspace_ring::HashRing;
use keyspace_storage::StorageEngine;
use std::sync::Arc;

/// Owns the replication engine; holds shared handles to everything else.
pub struct Coordinator<C: PeerClient> {
    storage: Arc<StorageEngine>,
    membership: Arc<MembershipManager>,
    replication: ReplicationEngine<C>,
}

impl<C: PeerClient> std::fmt::Debug for Coordinator<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Coordinator").finish_non_exhaustive()
    }
}

impl<C: PeerClient> Coordinator<C> {
    pub fn new(
        self_id: impl Into<String>,
        storage: Arc<StorageEngine>,
        ring: Arc<HashRing>,
        membership: Arc<MembershipManager>,
        client: Arc<C>,
        config: QuorumConfig,
    ) -> Self {
        let replication = ReplicationEngine::new(
            self_id,
            storage.clone(),
            ring,
            membership.clone(),
            client,
            config,
        );
        Self {
            storage,
            membership,
            replication,
        }
    }

    pub fn replication(&self) -> &ReplicationEngine<C> {
        &self.replication
    }

    /// Decode, dispatch, encode. Always yields a response frame.
    pub async fn handle_frame(&self, payload: Bytes) -> Bytes {
        let response = match Request::decode(payload) {
            Ok(request) => self.dispatch(request).await,
            Err(WireError::UnknownOp(op)) => {
                tracing::debug!(op, "rejected frame with unknown opcode");
                Response::Error("Unknown operation".into())
            }
            Err(e) => Response::Error(format!("Internal error: {e}")),
        };
        response.encode()
    }

    async fn dispatch(&self, request: Request) -> Response {
        let m = keyspace_metrics::metrics();
        match request {
            // Client-facing: quorum orchestration.
            Request::Put { key, value } => {
                m.kv_puts.inc();
                tracing::debug!(key, value_size = value.len(), "PUT");
                match self.replication.replicated_put(&key, &value).await {
                    Ok(()) => Response::Ok,
                    Err(e) => self.quorum_error(e),
                }
            }
            Request::Get { key } => {
                m.kv_gets.inc();
                tracing::debug!(key, "GET");
                match self.replication.replicated_get(&key).await {
                    Ok(Some(vv)) => Response::Value(vv),
                    Ok(None) => Response::NotFound,
                    Err(e) => self.quorum_error(e),
                }
            }
            Request::Delete { key } => {
                m.kv_deletes.inc();
                tracing::debug!(key, "DELETE");
                match self.replication.replicated_delete(&key).await {
                    Ok(()) => Response::Ok,
                    Err(e) => self.quorum_error(e),
                }
            }

            // Internal: direct local storage, no quorum. A stale write is
            // subsumed by a newer version, so the peer still sees OK.
            Request::InternalPut { key, value, timestamp, origin } => {
                m.rpcs_received.inc();
                let vv = VersionedValue::new(value, timestamp, origin);
                match self.storage.conditional_put(&key, &vv) {
                    Ok(_) => Response::Ok,
                    Err(e) => Response::Error(format!("Internal error: {e}")),
                }
            }
            Request::InternalGet { key } => {
                m.rpcs_received.inc();
                match self.storage.get(&key) {
                    Some(vv) => Response::Value(vv),
                    None => Response::NotFound,
                }
            }
            Request::InternalDelete { key, timestamp } => {
                m.rpcs_received.inc();
                match self.storage.delete(&key, timestamp) {
                    Ok(_) => Response::Ok,
                    Err(e) => Response::Error(format!("Internal error: {e}")),
                }
            }

            // Cluster introspection.
            Request::ClusterInfo => {
                let members = self
                    .membership
                    .all_members()
                    .into_iter()
                    .map(|n| MemberStatus {
                        node_id: n.node_id,
                        host: n.host,
                        port: n.port,
                        is_alive: n.is_alive,
                    })
                    .collect();
                Response::ClusterInfo {
                    members,
                    local_size: self.storage.len() as u64,
                }
            }

            // Gossip: merge, then answer with our own view.
            Request::Gossip { entries } => {
                self.membership.handle_gossip(entries);
                Response::Gossip {
                    entries: self.membership.all_members(),
                }
            }
        }
    }

    fn quorum_error(&self, e: KvError) -> Response {
        if matches!(
            e,
            KvError::QuorumNotReached { .. } | KvError::ReadQuorumNotReached { .. }
        ) {
            keyspace_metrics::metrics().quorum_failures.inc();
        }
        match e {
            KvError::Storage(inner) => Response::Error(format!("Internal error: {inner}")),
            other => Response::Error(other.to_string()),
        }
    }
}
