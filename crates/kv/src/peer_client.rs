//! Abstraction over node-to-node replication RPCs.
//!
//! The concrete one-shot TCP implementation lives in `keyspace-net`.

use keyspace_common::{NodeInfo, Timestamp, VersionedValue};

#[derive(Debug, thiserror::Error)]
pub enum ReplicaError {
    #[error("RPC failed: {0}")]
    RpcFailed(String),
    #[error("connect timeout")]
    Timeout,
}

/// Transport for the INTERNAL_PUT / INTERNAL_GET / INTERNAL_DELETE ops.
///
/// Each call opens its own short-lived connection; a `bool` result is
/// whether the peer answered with status OK.
#[async_trait::async_trait]
pub trait PeerClient: Send + Sync + 'static {
    async fn internal_put(
        &self,
        target: &NodeInfo,
        key: &str,
        value: &[u8],
        timestamp: Timestamp,
        origin: &str,
    ) -> Result<bool, ReplicaError>;

    async fn internal_get(
        &self,
        target: &NodeInfo,
        key: &str,
    ) -> Result<Option<VersionedValue>, ReplicaError>;

    async fn internal_delete(
        &self,
        target: &NodeInfo,
        key: &str,
        timestamp: Timestamp,
    ) -> Result<bool, ReplicaError>;
}
