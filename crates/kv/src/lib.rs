//! keyspace-kv: the quorum replication engine and the coordinator that
//! dispatches every incoming frame.
//!
//! The network side of peer RPCs is behind the [`PeerClient`] trait:
//! real deployments use the TCP client from `keyspace-net`; unit tests
//! use mocks.

pub mod coordinator;
pub mod peer_client;
pub mod replication;

pub use coordinator::Coordinator;
pub use peer_client::{PeerClient, ReplicaError};
pub use replication::{KvError, QuorumConfig, ReplicationEngine};
