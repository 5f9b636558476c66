//! Cluster membership oracle.

use crate::types::{NodeId, TopologyVersion};
use parking_lot::RwLock;
use std::collections::BTreeMap;

/// Read-only view of cluster membership.
///
/// Implementations must be deterministic: two queries for the same topology
/// version must observe the same membership snapshot, and join order must be
/// stable for the lifetime of a node.
pub trait ClusterView: Send + Sync {
    /// Nodes alive at the given topology version.
    fn alive_nodes(&self, top_ver: TopologyVersion) -> Vec<NodeId>;

    /// Whether a node is currently alive.
    fn is_alive(&self, node: NodeId) -> bool;

    /// Join order of a node. Lower order joined earlier. `None` if the node
    /// was never seen.
    fn node_order(&self, node: NodeId) -> Option<u64>;

    /// The numerically-oldest live node at the given version, by join order.
    fn oldest(&self, top_ver: TopologyVersion) -> Option<NodeId> {
        self.alive_nodes(top_ver)
            .into_iter()
            .min_by_key(|&n| (self.node_order(n).unwrap_or(u64::MAX), n))
    }
}

/// In-memory membership view with explicit per-version snapshots.
///
/// The embedding discovery service records each membership change under the
/// topology version it produced; queries for older versions answer from the
/// snapshot history.
pub struct StaticClusterView {
    inner: RwLock<ViewInner>,
}

struct ViewInner {
    /// Version -> nodes alive at that version.
    snapshots: BTreeMap<TopologyVersion, Vec<NodeId>>,
    /// Node -> join order. Orders survive node departure.
    orders: BTreeMap<NodeId, u64>,
    next_order: u64,
}

impl StaticClusterView {
    /// Create an empty view.
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(ViewInner {
                snapshots: BTreeMap::new(),
                orders: BTreeMap::new(),
                next_order: 1,
            }),
        }
    }

    /// Record the membership snapshot for a topology version.
    ///
    /// Nodes not seen before are assigned the next join order, in the order
    /// they appear in `nodes`.
    pub fn record(&self, top_ver: TopologyVersion, nodes: Vec<NodeId>) {
        let mut inner = self.inner.write();

        for &n in &nodes {
            if !inner.orders.contains_key(&n) {
                let order = inner.next_order;
                inner.orders.insert(n, order);
                inner.next_order += 1;
            }
        }

        inner.snapshots.insert(top_ver, nodes);
    }

    /// Latest recorded topology version, if any.
    pub fn latest_version(&self) -> Option<TopologyVersion> {
        self.inner.read().snapshots.keys().next_back().copied()
    }
}

impl Default for StaticClusterView {
    fn default() -> Self {
        Self::new()
    }
}

impl ClusterView for StaticClusterView {
    fn alive_nodes(&self, top_ver: TopologyVersion) -> Vec<NodeId> {
        let inner = self.inner.read();

        // Answer from the newest snapshot at or below the requested version.
        inner
            .snapshots
            .range(..=top_ver)
            .next_back()
            .map(|(_, nodes)| nodes.clone())
            .unwrap_or_default()
    }

    fn is_alive(&self, node: NodeId) -> bool {
        let inner = self.inner.read();

        inner
            .snapshots
            .values()
            .next_back()
            .map(|nodes| nodes.contains(&node))
            .unwrap_or(false)
    }

    fn node_order(&self, node: NodeId) -> Option<u64> {
        self.inner.read().orders.get(&node).copied()
    }
}
