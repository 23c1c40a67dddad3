//! keyspace-ring: consistent hashing with virtual nodes.
//!
//! Each physical node owns `virtual_nodes` positions on a 32-bit ring at
//! `murmur3(node_id + "#" + index)`. A key routes to the owner of the
//! first position strictly after its hash, wrapping at the top. For a
//! fixed node set, routing is a pure function of the key; adding or
//! removing one node out of k moves roughly 1/k of the keys.

use keyspace_common::hash32;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::RwLock;
use thiserror::Error;

/// Virtual positions per physical node.
pub const DEFAULT_VIRTUAL_NODES: usize = 150;

#[derive(Debug, Error)]
pub enum RingError {
    #[error("No nodes available")]
    Empty,
}

#[derive(Debug, Default)]
struct RingState {
    /// position -> owning physical node. Position collisions resolve
    /// last-writer-wins; at 32 bits they move a vanishing share of keys.
    positions: BTreeMap<u32, String>,
    nodes: BTreeSet<String>,
}

/// A shared, internally locked hash ring.
#[derive(Debug)]
pub struct HashRing {
    state: RwLock<RingState>,
    virtual_nodes: usize,
}

impl HashRing {
    pub fn new(virtual_nodes: usize) -> Self {
        Self {
            state: RwLock::new(RingState::default()),
            virtual_nodes,
        }
    }

    fn vnode_position(node_id: &str, index: usize) -> u32 {
        hash32(format!("{node_id}#{index}").as_bytes())
    }

    /// Insert a node's virtual positions. No-op if already present.
    pub fn add_node(&self, node_id: &str) {
        let mut state = self.state.write().expect("ring lock");
        if !state.nodes.insert(node_id.to_string()) {
            return;
        }
        for i in 0..self.virtual_nodes {
            state
                .positions
                .insert(Self::vnode_position(node_id, i), node_id.to_string());
        }
        tracing::info!(
            node_id,
            vnodes = self.virtual_nodes,
            ring_size = state.positions.len(),
            "ring: node added"
        );
    }

    /// Remove a node's virtual positions. No-op if absent.
    pub fn remove_node(&self, node_id: &str) {
        let mut state = self.state.write().expect("ring lock");
        if !state.nodes.remove(node_id) {
            return;
        }
        for i in 0..self.virtual_nodes {
            let pos = Self::vnode_position(node_id, i);
            // A collision may have handed this position to another node.
            if state.positions.get(&pos).is_some_and(|owner| owner.as_str() == node_id) {
                state.positions.remove(&pos);
            }
        }
        tracing::info!(node_id, ring_size = state.positions.len(), "ring: node removed");
    }

    pub fn contains(&self, node_id: &str) -> bool {
        self.state.read().expect("ring lock").nodes.contains(node_id)
    }

    /// The node owning `key`'s position.
    pub fn primary_node(&self, key: &str) -> Result<String, RingError> {
        let state = self.state.read().expect("ring lock");
        if state.positions.is_empty() {
            return Err(RingError::Empty);
        }
        let hash = hash32(key.as_bytes());
        let owner = state
            .positions
            .range((std::ops::Bound::Excluded(hash), std::ops::Bound::Unbounded))
            .next()
            .or_else(|| state.positions.iter().next())
            .map(|(_, node)| node.clone())
            .expect("non-empty ring has a successor");
        Ok(owner)
    }

    /// The preference list for `key`: up to `count` distinct physical
    /// nodes, clockwise from the primary position.
    pub fn nodes_for(&self, key: &str, count: usize) -> Result<Vec<String>, RingError> {
        let state = self.state.read().expect("ring lock");
        if state.positions.is_empty() {
            return Err(RingError::Empty);
        }
        let want = count.min(state.nodes.len());
        let hash = hash32(key.as_bytes());

        let mut result = Vec::with_capacity(want);
        let walk = state
            .positions
            .range((std::ops::Bound::Excluded(hash), std::ops::Bound::Unbounded))
            .chain(state.positions.range(..=hash));
        for (_, node) in walk {
            if result.len() >= want {
                break;
            }
            if !result.iter().any(|n| n == node) {
                result.push(node.clone());
            }
        }
        Ok(result)
    }

    pub fn node_count(&self) -> usize {
        self.state.read().expect("ring lock").nodes.len()
    }

    pub fn ring_size(&self) -> usize {
        self.state.read().expect("ring lock").positions.len()
    }

    pub fn all_nodes(&self) -> Vec<String> {
        self.state
            .read()
            .expect("ring lock")
            .nodes
            .iter()
            .cloned()
            .collect()
    }
}

impl Default for HashRing {
    fn default() -> Self {
        Self::new(DEFAULT_VIRTUAL_NODES)
    }
}
