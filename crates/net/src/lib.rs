//! keyspace-net: TCP plumbing for the wire protocol.
//!
//! Provides:
//! - [`serve`]: the accept loop, one task per connection, FIFO within it
//! - [`TcpPeerClient`]: one-shot-connection `PeerClient` + `GossipSender`
//! - [`KvClient`]: a small blocking client for tools and tests

pub mod client;
pub mod peer_client;
pub mod server;

pub use client::{ClientError, KvClient};
pub use peer_client::TcpPeerClient;
pub use server::serve;
