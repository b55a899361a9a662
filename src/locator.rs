//! Key-to-node placement.
//!
//! Two strategies: a plain modulo mapping, and a consistent hash ring with
//! virtual nodes (ketama-style). The ring hashes vnode labels derived from
//! the node's address so placement survives process restarts and does not
//! depend on the order members were listed.

use crate::types::NodeId;
use std::collections::BTreeMap;
use std::hash::{Hash, Hasher};
use std::net::SocketAddr;
use twox_hash::XxHash64;

/// Maps a key to the node that owns it.
///
/// Locators are immutable snapshots of the member list; health is the
/// cluster's concern, not the locator's.
pub trait NodeLocator: Send + Sync {
    /// The owning node for `key`, or `None` if there are no members.
    fn locate(&self, key: &[u8]) -> Option<NodeId>;

    /// All member node IDs, in configuration order.
    fn nodes(&self) -> &[NodeId];
}

fn hash_key(key: &[u8]) -> u64 {
    let mut hasher = XxHash64::with_seed(0);
    key.hash(&mut hasher);
    hasher.finish()
}

/// `hash(key) % node_count`. Simple, but remaps nearly every key when
/// the member list changes size.
#[derive(Debug)]
pub struct ModuloLocator {
    nodes: Vec<NodeId>,
}

impl ModuloLocator {
    pub fn new(members: &[(NodeId, SocketAddr)]) -> Self {
        Self {
            nodes: members.iter().map(|&(id, _)| id).collect(),
        }
    }
}

impl NodeLocator for ModuloLocator {
    fn locate(&self, key: &[u8]) -> Option<NodeId> {
        if self.nodes.is_empty() {
            return None;
        }
        let idx = (hash_key(key) % self.nodes.len() as u64) as usize;
        Some(self.nodes[idx])
    }

    fn nodes(&self) -> &[NodeId] {
        &self.nodes
    }
}

/// Consistent hash ring with virtual nodes.
///
/// Each member contributes `vnodes_per_node` positions on a `u64` ring;
/// a key belongs to the first vnode at or clockwise of its hash. Adding
/// or removing one member only remaps the keys adjacent to its vnodes.
#[derive(Debug)]
pub struct KetamaLocator {
    ring: BTreeMap<u64, NodeId>,
    nodes: Vec<NodeId>,
}

impl KetamaLocator {
    pub fn new(members: &[(NodeId, SocketAddr)], vnodes_per_node: usize) -> Self {
        let mut ring = BTreeMap::new();
        for &(id, addr) in members {
            for i in 0..vnodes_per_node {
                let label = format!("{}:{}", addr, i);
                ring.insert(hash_key(label.as_bytes()), id);
            }
        }
        Self {
            ring,
            nodes: members.iter().map(|&(id, _)| id).collect(),
        }
    }
}

impl NodeLocator for KetamaLocator {
    fn locate(&self, key: &[u8]) -> Option<NodeId> {
        if self.ring.is_empty() {
            return None;
        }
        let hash = hash_key(key);
        self.ring
            .range(hash..)
            .next()
            .or_else(|| self.ring.iter().next())
            .map(|(_, &id)| id)
    }

    fn nodes(&self) -> &[NodeId] {
        &self.nodes
    }
}
