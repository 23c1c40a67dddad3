//! One-shot TCP implementations of [`PeerClient`] and [`GossipSender`].
//!
//! Every call opens a fresh connection with a bounded connect timeout,
//! sends a single frame, reads a single response, and drops the socket.
//! Peer churn is common enough in this protocol that connection reuse
//! is not worth the bookkeeping.

use keyspace_common::{NodeInfo, Timestamp, VersionedValue};
use keyspace_kv::{PeerClient, ReplicaError};
use keyspace_membership::{GossipError, GossipSender};
use keyspace_proto::{read_frame, write_frame, Request, Response, ResponseKind};
use tokio::net::TcpStream;
use tokio::time::Duration;

/// Peer transport over short-lived TCP connections.
#[derive(Debug, Clone)]
pub struct TcpPeerClient {
    connect_timeout: Duration,
}

impl TcpPeerClient {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }

    async fn call(
        &self,
        host: &str,
        port: u16,
        request: Request,
        kind: ResponseKind,
    ) -> Result<Response, ReplicaError> {
        let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect((host, port)))
            .await
            .map_err(|_| ReplicaError::Timeout)?
            .map_err(|e| ReplicaError::RpcFailed(format!("connect to {host}:{port} failed: {e}")))?;

        let (mut reader, mut writer) = stream.into_split();
        write_frame(&mut writer, &request.encode())
            .await
            .map_err(|e| ReplicaError::RpcFailed(format!("send failed: {e}")))?;

        let payload = read_frame(&mut reader)
            .await
            .map_err(|e| ReplicaError::RpcFailed(format!("recv failed: {e}")))?
            .ok_or_else(|| ReplicaError::RpcFailed("peer closed before responding".into()))?;

        Response::decode(payload, kind)
            .map_err(|e| ReplicaError::RpcFailed(format!("bad response: {e}")))
    }
}

impl Default for TcpPeerClient {
    fn default() -> Self {
        Self::new(Duration::from_secs(5))
    }
}

#[async_trait::async_trait]
impl PeerClient for TcpPeerClient {
    async fn internal_put(
        &self,
        target: &NodeInfo,
        key: &str,
        value: &[u8],
        timestamp: Timestamp,
        origin: &str,
    ) -> Result<bool, ReplicaError> {
        keyspace_metrics::metrics()
            .rpcs_sent
            .with_label_values(&["internal_put"])
            .inc();
        let request = Request::InternalPut {
            key: key.to_string(),
            value: value.to_vec(),
            timestamp,
            origin: origin.to_string(),
        };
        let response = self
            .call(&target.host, target.port, request, ResponseKind::Status)
            .await?;
        Ok(matches!(response, Response::Ok))
    }

    async fn internal_get(
        &self,
        target: &NodeInfo,
        key: &str,
    ) -> Result<Option<VersionedValue>, ReplicaError> {
        keyspace_metrics::metrics()
            .rpcs_sent
            .with_label_values(&["internal_get"])
            .inc();
        let request = Request::InternalGet { key: key.to_string() };
        match self
            .call(&target.host, target.port, request, ResponseKind::Value)
            .await?
        {
            Response::Value(vv) => Ok(Some(vv)),
            Response::NotFound => Ok(None),
            Response::Error(msg) => Err(ReplicaError::RpcFailed(msg)),
            other => Err(ReplicaError::RpcFailed(format!(
                "unexpected response: {other:?}"
            ))),
        }
    }

    async fn internal_delete(
        &self,
        target: &NodeInfo,
        key: &str,
        timestamp: Timestamp,
    ) -> Result<bool, ReplicaError> {
        keyspace_metrics::metrics()
            .rpcs_sent
            .with_label_values(&["internal_delete"])
            .inc();
        let request = Request::InternalDelete {
            key: key.to_string(),
            timestamp,
        };
        let response = self
            .call(&target.host, target.port, request, ResponseKind::Status)
            .await?;
        Ok(matches!(response, Response::Ok))
    }
}

#[async_trait::async_trait]
impl GossipSender for TcpPeerClient {
    async fn send_gossip(
        &self,
        host: &str,
        port: u16,
        view: Vec<NodeInfo>,
    ) -> Result<Vec<NodeInfo>, GossipError> {
        keyspace_metrics::metrics()
            .rpcs_sent
            .with_label_values(&["gossip"])
            .inc();
        let request = Request::Gossip { entries: view };
        match self
            .call(host, port, request, ResponseKind::Gossip)
            .await
            .map_err(|e| GossipError::SendFailed(e.to_string()))?
        {
            Response::Gossip { entries } => Ok(entries),
            other => Err(GossipError::SendFailed(format!(
                "unexpected response: {other:?}"
            ))),
        }
    }
}
