//! keyspace-common: shared types for the keyspace project.
//!
//! Provides the wall-clock [`Timestamp`], the [`NodeInfo`] membership
//! descriptor, the [`VersionedValue`] stored for every key, and the
//! MurmurHash3 function both the ring and the tests hash with.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// Milliseconds since the Unix epoch. The sole basis for version ordering.
pub type Timestamp = u64;

/// Current wall-clock time as a [`Timestamp`].
pub fn now_ms() -> Timestamp {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as Timestamp
}

// ---------------------------------------------------------------------------
// NodeInfo
// ---------------------------------------------------------------------------

/// Descriptor for a cluster member, as carried in gossip messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeInfo {
    /// Unique identifier, e.g. `"node1"`.
    pub node_id: String,
    /// Hostname or IP the node listens on.
    pub host: String,
    /// Listening port.
    pub port: u16,
    /// Whether the failure detector currently considers the node alive.
    pub is_alive: bool,
    /// Last heartbeat observed for this node.
    pub last_heartbeat: Timestamp,
}

impl NodeInfo {
    pub fn new(node_id: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            node_id: node_id.into(),
            host: host.into(),
            port,
            is_alive: true,
            last_heartbeat: 0,
        }
    }

    /// `host:port`, the form seeds are written in.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl fmt::Display for NodeInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}:{}", self.node_id, self.host, self.port)
    }
}

// ---------------------------------------------------------------------------
// VersionedValue
// ---------------------------------------------------------------------------

/// A stored value tagged with its version.
///
/// The timestamp is captured by the coordinator that first accepted the
/// client write; conflict resolution is last-writer-wins on it. The origin
/// node id is informational.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionedValue {
    pub value: Vec<u8>,
    pub timestamp: Timestamp,
    pub origin: String,
}

impl VersionedValue {
    pub fn new(value: impl Into<Vec<u8>>, timestamp: Timestamp, origin: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            timestamp,
            origin: origin.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// Hashing
// ---------------------------------------------------------------------------

/// MurmurHash3 x86 32-bit, seed 0, over raw bytes.
///
/// Used for both key hashes and virtual-node positions so that routing is
/// a pure function of the byte string.
pub fn hash32(data: &[u8]) -> u32 {
    // Reading from an in-memory cursor cannot fail.
    murmur3::murmur3_32(&mut std::io::Cursor::new(data), 0).expect("in-memory hash read")
}
