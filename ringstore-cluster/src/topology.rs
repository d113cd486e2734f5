//! Ring topology
//!
//! Every node owns a key range `[start, +length)` on a modular ring. A key
//! lives on every node whose range contains its ring position
//! (`routing_hash % ring_size`). Candidates are ordered by how far the
//! position lies past the start of their range, so the node whose range
//! begins closest before the key is the primary.

use std::collections::HashSet;
use std::fmt;

use ringstore_core::error::{Result, RingStoreError};
use ringstore_core::key::{EntryKey, KeyCodec};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Identity of a cluster node
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for NodeId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Contiguous, possibly wrapping, range of ring positions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct KeyRange {
    start: u32,
    length: u32,
    ring_size: u32,
}

impl KeyRange {
    pub fn new(start: u32, length: u32, ring_size: u32) -> Result<Self> {
        if ring_size == 0 {
            return Err(RingStoreError::Configuration(
                "ring size must be positive".to_string(),
            ));
        }
        if start >= ring_size {
            return Err(RingStoreError::Configuration(format!(
                "range start {} outside ring of size {}",
                start, ring_size
            )));
        }
        if length == 0 || length > ring_size {
            return Err(RingStoreError::Configuration(format!(
                "range length {} must be within 1..={}",
                length, ring_size
            )));
        }
        Ok(Self {
            start,
            length,
            ring_size,
        })
    }

    /// The whole ring
    pub fn full(ring_size: u32) -> Result<Self> {
        Self::new(0, ring_size, ring_size)
    }

    pub fn start(&self) -> u32 {
        self.start
    }

    pub fn length(&self) -> u32 {
        self.length
    }

    pub fn ring_size(&self) -> u32 {
        self.ring_size
    }

    pub fn is_full(&self) -> bool {
        self.length == self.ring_size
    }

    /// Steps from range start to `position`, going clockwise
    pub fn offset_of(&self, position: u32) -> u32 {
        let ring = u64::from(self.ring_size);
        let pos = u64::from(position) % ring;
        ((pos + ring - u64::from(self.start)) % ring) as u32
    }

    pub fn contains(&self, position: u32) -> bool {
        self.offset_of(position) < self.length
    }

    /// Whether a key with this routing hash falls in the range
    pub fn contains_hash(&self, routing_hash: u32) -> bool {
        self.contains(routing_hash % self.ring_size)
    }

    /// Non-wrapping `[from, to)` pieces
    fn segments(&self) -> Vec<(u64, u64)> {
        let start = u64::from(self.start);
        let end = start + u64::from(self.length);
        let ring = u64::from(self.ring_size);
        if end <= ring {
            vec![(start, end)]
        } else {
            vec![(start, ring), (0, end - ring)]
        }
    }

    /// Intersection with another range on the same ring
    pub fn overlap(&self, other: &KeyRange) -> Vec<KeyRange> {
        if self.ring_size != other.ring_size {
            return Vec::new();
        }
        let ring = u64::from(self.ring_size);

        let mut pieces: Vec<(u64, u64)> = Vec::new();
        for (a_from, a_to) in self.segments() {
            for (b_from, b_to) in other.segments() {
                let from = a_from.max(b_from);
                let to = a_to.min(b_to);
                if from < to {
                    pieces.push((from, to));
                }
            }
        }
        pieces.sort_unstable();

        let mut merged: Vec<(u64, u64)> = Vec::with_capacity(pieces.len());
        for (from, to) in pieces {
            match merged.last_mut() {
                Some(last) if last.1 >= from => last.1 = last.1.max(to),
                _ => merged.push((from, to)),
            }
        }

        // Join a piece ending at the ring end with one starting at zero
        if merged.len() > 1 {
            let first = merged[0];
            let last = merged[merged.len() - 1];
            if first.0 == 0 && last.1 == ring {
                merged.remove(0);
                if let Some(tail) = merged.last_mut() {
                    tail.1 = ring + first.1;
                }
            }
        }

        merged
            .into_iter()
            .map(|(from, to)| KeyRange {
                start: from as u32,
                length: (to - from) as u32,
                ring_size: self.ring_size,
            })
            .collect()
    }

    pub fn overlaps(&self, other: &KeyRange) -> bool {
        !self.overlap(other).is_empty()
    }
}

impl fmt::Display for KeyRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{},+{}]", self.start, self.length)
    }
}

/// A node and the range it owns
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterNode {
    pub id: NodeId,
    pub address: String,
    pub range: KeyRange,
}

impl ClusterNode {
    pub fn new(id: impl Into<NodeId>, address: impl Into<String>, range: KeyRange) -> Self {
        Self {
            id: id.into(),
            address: address.into(),
            range,
        }
    }
}

/// Static assignment of key ranges to nodes
#[derive(Debug, Clone)]
pub struct RingTopology {
    ring_size: u32,
    nodes: Vec<ClusterNode>,
}

impl RingTopology {
    /// Validate and build a topology; ranges must cover the whole ring
    pub fn new(ring_size: u32, mut nodes: Vec<ClusterNode>) -> Result<Self> {
        if ring_size == 0 {
            return Err(RingStoreError::Configuration(
                "ring size must be positive".to_string(),
            ));
        }
        if nodes.is_empty() {
            return Err(RingStoreError::Configuration(
                "topology needs at least one node".to_string(),
            ));
        }

        let mut seen = HashSet::new();
        for node in &nodes {
            if !seen.insert(node.id.clone()) {
                return Err(RingStoreError::Configuration(format!(
                    "duplicate node id {}",
                    node.id
                )));
            }
            if node.range.ring_size() != ring_size {
                return Err(RingStoreError::Configuration(format!(
                    "node {} range {} is for ring size {}, expected {}",
                    node.id,
                    node.range,
                    node.range.ring_size(),
                    ring_size
                )));
            }
        }

        let mut segments: Vec<(u64, u64)> =
            nodes.iter().flat_map(|n| n.range.segments()).collect();
        segments.sort_unstable();
        let mut covered = 0u64;
        for (from, to) in segments {
            if from > covered {
                break;
            }
            covered = covered.max(to);
        }
        if covered < u64::from(ring_size) {
            return Err(RingStoreError::Configuration(format!(
                "ring position {} is not covered by any node",
                covered
            )));
        }

        nodes.sort_by(|a, b| {
            a.range
                .start()
                .cmp(&b.range.start())
                .then_with(|| a.id.cmp(&b.id))
        });
        debug!(ring_size, nodes = nodes.len(), "Built ring topology");

        Ok(Self { ring_size, nodes })
    }

    pub fn ring_size(&self) -> u32 {
        self.ring_size
    }

    pub fn nodes(&self) -> &[ClusterNode] {
        &self.nodes
    }

    pub fn node(&self, id: &NodeId) -> Option<&ClusterNode> {
        self.nodes.iter().find(|n| &n.id == id)
    }

    /// Ring position of a routing hash
    pub fn position(&self, routing_hash: u32) -> u32 {
        routing_hash % self.ring_size
    }

    /// Nodes holding keys with this routing hash, primary first
    pub fn nodes_for_hash(&self, routing_hash: u32) -> Vec<ClusterNode> {
        let position = self.position(routing_hash);
        let mut owners: Vec<&ClusterNode> = self
            .nodes
            .iter()
            .filter(|n| n.range.contains(position))
            .collect();
        owners.sort_by(|a, b| {
            a.range
                .offset_of(position)
                .cmp(&b.range.offset_of(position))
                .then_with(|| a.id.cmp(&b.id))
        });
        owners.into_iter().cloned().collect()
    }

    /// Nodes holding `key`, primary first
    pub fn nodes_for_key(&self, codec: &dyn KeyCodec, key: &EntryKey) -> Vec<ClusterNode> {
        self.nodes_for_hash(codec.routing_hash(key))
    }

    /// Other nodes whose range overlaps the range of `id`
    pub fn peers_of(&self, id: &NodeId) -> Vec<&ClusterNode> {
        let Some(local) = self.node(id) else {
            return Vec::new();
        };
        self.nodes
            .iter()
            .filter(|n| n.id != local.id && n.range.overlaps(&local.range))
            .collect()
    }
}
