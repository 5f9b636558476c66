//! Per-node and cluster-wide partition map snapshots.
//!
//! A [`PartitionMap`] is one node's advertised view of its own partitions.
//! A [`FullPartitionMap`] is the cluster-wide snapshot assembled by the
//! oldest live node and propagated during exchange. Staleness between full
//! maps is decided by [`FullPartitionMap::dominance`], a pure comparison over
//! the map metadata.

use crate::topology::partition::PartitionState;
use crate::types::{NodeId, PartitionId};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;

/// One node's partition -> state snapshot, versioned by a per-node update
/// sequence that only ever increases.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionMap {
    node_id: NodeId,
    update_seq: u64,
    parts: BTreeMap<PartitionId, PartitionState>,
}

impl PartitionMap {
    /// Create an empty map for a node.
    pub fn new(node_id: NodeId, update_seq: u64) -> Self {
        Self {
            node_id,
            update_seq,
            parts: BTreeMap::new(),
        }
    }

    /// Create a map from explicit partition states.
    pub fn with_parts(
        node_id: NodeId,
        update_seq: u64,
        parts: BTreeMap<PartitionId, PartitionState>,
    ) -> Self {
        Self {
            node_id,
            update_seq,
            parts,
        }
    }

    /// Copy keeping only active partitions.
    pub fn only_active(&self) -> Self {
        Self {
            node_id: self.node_id,
            update_seq: self.update_seq,
            parts: self
                .parts
                .iter()
                .filter(|(_, s)| s.is_active())
                .map(|(&p, &s)| (p, s))
                .collect(),
        }
    }

    /// Owning node.
    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    /// Per-node update sequence.
    pub fn update_seq(&self) -> u64 {
        self.update_seq
    }

    /// Advance the update sequence. Returns the previous value.
    pub fn set_update_seq(&mut self, update_seq: u64) -> u64 {
        assert!(
            update_seq >= self.update_seq,
            "update sequence must not decrease [cur={}, new={}, node={}]",
            self.update_seq,
            update_seq,
            self.node_id
        );

        std::mem::replace(&mut self.update_seq, update_seq)
    }

    /// State of a partition, if present.
    pub fn get(&self, partition: PartitionId) -> Option<PartitionState> {
        self.parts.get(&partition).copied()
    }

    /// Record the state of a partition.
    pub fn set(&mut self, partition: PartitionId, state: PartitionState) {
        self.parts.insert(partition, state);
    }

    /// Whether the map has an entry for a partition.
    pub fn contains(&self, partition: PartitionId) -> bool {
        self.parts.contains_key(&partition)
    }

    /// Partition IDs present in the map.
    pub fn partitions(&self) -> impl Iterator<Item = PartitionId> + '_ {
        self.parts.keys().copied()
    }

    /// Iterate (partition, state) pairs.
    pub fn iter(&self) -> impl Iterator<Item = (PartitionId, PartitionState)> + '_ {
        self.parts.iter().map(|(&p, &s)| (p, s))
    }

    /// Number of partitions in the map.
    pub fn len(&self) -> usize {
        self.parts.len()
    }

    /// Whether the map is empty.
    pub fn is_empty(&self) -> bool {
        self.parts.is_empty()
    }
}

/// Identity of the node that produced a full map snapshot, normally the
/// numerically-oldest live node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MapOwner {
    /// Producing node.
    pub node_id: NodeId,
    /// Join order of the producing node.
    pub node_order: u64,
}

/// Cluster-wide snapshot: node -> [`PartitionMap`].
///
/// A map without an owner is "invalid" (not yet initialized) and is dominated
/// by every owned map.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FullPartitionMap {
    owner: Option<MapOwner>,
    update_seq: u64,
    maps: BTreeMap<NodeId, PartitionMap>,
}

impl FullPartitionMap {
    /// Create an empty, not-yet-initialized map.
    pub fn invalid() -> Self {
        Self {
            owner: None,
            update_seq: 0,
            maps: BTreeMap::new(),
        }
    }

    /// Create an empty map owned by a node.
    pub fn new(node_id: NodeId, node_order: u64, update_seq: u64) -> Self {
        assert!(node_order > 0, "node order must be positive");

        Self {
            owner: Some(MapOwner {
                node_id,
                node_order,
            }),
            update_seq,
            maps: BTreeMap::new(),
        }
    }

    /// Copy another map's contents under a new owner attribution.
    pub fn adopt(
        node_id: NodeId,
        node_order: u64,
        update_seq: u64,
        from: &FullPartitionMap,
        only_active: bool,
    ) -> Self {
        let maps = from
            .maps
            .iter()
            .map(|(&n, m)| (n, if only_active { m.only_active() } else { m.clone() }))
            .collect();

        Self {
            owner: Some(MapOwner {
                node_id,
                node_order,
            }),
            update_seq,
            maps,
        }
    }

    /// Structural copy with a different global update sequence.
    pub fn copy_with_seq(&self, update_seq: u64) -> Self {
        Self {
            owner: self.owner,
            update_seq,
            maps: self.maps.clone(),
        }
    }

    /// Whether the map has been initialized with an owner.
    pub fn is_valid(&self) -> bool {
        self.owner.is_some()
    }

    /// Map owner metadata.
    pub fn owner(&self) -> Option<MapOwner> {
        self.owner
    }

    /// Global update sequence.
    pub fn update_seq(&self) -> u64 {
        self.update_seq
    }

    /// Advance the global update sequence. Returns the previous value.
    pub fn set_update_seq(&mut self, update_seq: u64) -> u64 {
        assert!(
            update_seq >= self.update_seq,
            "full map update sequence must not decrease [cur={}, new={}]",
            self.update_seq,
            update_seq
        );

        std::mem::replace(&mut self.update_seq, update_seq)
    }

    /// Staleness comparison: lexicographic over (owner order, update
    /// sequence). An invalid map is dominated by every owned map.
    ///
    /// `Less` means `self` is staler than `other`; an incoming map is applied
    /// only when the current map compares `Less` against it.
    pub fn dominance(&self, other: &FullPartitionMap) -> Ordering {
        match (self.owner, other.owner) {
            (None, None) => Ordering::Equal,
            (None, Some(_)) => Ordering::Less,
            (Some(_), None) => Ordering::Greater,
            (Some(a), Some(b)) => a
                .node_order
                .cmp(&b.node_order)
                .then(self.update_seq.cmp(&other.update_seq)),
        }
    }

    /// Per-node map, if known.
    pub fn get(&self, node: NodeId) -> Option<&PartitionMap> {
        self.maps.get(&node)
    }

    /// Insert or replace a node's map.
    pub fn insert(&mut self, map: PartitionMap) -> Option<PartitionMap> {
        self.maps.insert(map.node_id(), map)
    }

    /// Remove a node's map.
    pub fn remove(&mut self, node: NodeId) -> Option<PartitionMap> {
        self.maps.remove(&node)
    }

    /// Nodes with a recorded map.
    pub fn node_ids(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.maps.keys().copied()
    }

    /// Drop node entries that fail the predicate.
    pub fn retain_nodes(&mut self, mut keep: impl FnMut(NodeId) -> bool) {
        self.maps.retain(|&n, _| keep(n));
    }

    /// Iterate (node, map) pairs.
    pub fn iter(&self) -> impl Iterator<Item = (NodeId, &PartitionMap)> {
        self.maps.iter().map(|(&n, m)| (n, m))
    }

    /// Mutable access to a node's map.
    pub fn get_mut(&mut self, node: NodeId) -> Option<&mut PartitionMap> {
        self.maps.get_mut(&node)
    }

    /// Number of node entries.
    pub fn len(&self) -> usize {
        self.maps.len()
    }

    /// Whether any node entries are present.
    pub fn is_empty(&self) -> bool {
        self.maps.is_empty()
    }
}
