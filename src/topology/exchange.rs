//! Exchange identity and the map messages exchanged between peers.

use crate::topology::map::{FullPartitionMap, PartitionMap};
use crate::types::{NodeId, TopologyVersion};
use serde::{Deserialize, Serialize};

/// Kind of membership change that triggered an exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ExchangeEvent {
    /// A node joined the cluster.
    Joined,
    /// A node left the cluster.
    Left,
}

/// Identifies one membership-change event.
///
/// Ordered by the topology version it produces (field order matters for the
/// derived `Ord`), so stale protocol messages compare lower than the last
/// applied exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ExchangeId {
    /// Topology version this exchange produces.
    pub version: TopologyVersion,
    /// The node whose join/leave triggered the exchange.
    pub node_id: NodeId,
    /// Join or leave.
    pub event: ExchangeEvent,
}

impl ExchangeId {
    /// Exchange for a node joining at `version`.
    pub fn joined(node_id: NodeId, version: TopologyVersion) -> Self {
        Self {
            version,
            node_id,
            event: ExchangeEvent::Joined,
        }
    }

    /// Exchange for a node leaving at `version`.
    pub fn left(node_id: NodeId, version: TopologyVersion) -> Self {
        Self {
            version,
            node_id,
            event: ExchangeEvent::Left,
        }
    }

    /// Whether the triggering event was a join.
    pub fn is_joined(&self) -> bool {
        self.event == ExchangeEvent::Joined
    }
}

impl std::fmt::Display for ExchangeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "exchange [ver={}, node={}, event={:?}]",
            self.version, self.node_id, self.event
        )
    }
}

/// Whole-cluster snapshot broadcast by the map owner after an exchange.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FullMapMessage {
    /// Exchange this snapshot belongs to.
    pub exchange_id: ExchangeId,
    /// The full partition map.
    pub map: FullPartitionMap,
}

impl FullMapMessage {
    /// Serialize for the network collaborator.
    pub fn to_bytes(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    /// Deserialize from the network collaborator.
    pub fn from_bytes(data: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(data)
    }
}

/// One node's own map, sent to the map owner as an incremental update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SingleMapMessage {
    /// Exchange this update belongs to; `None` for unsolicited refreshes.
    pub exchange_id: Option<ExchangeId>,
    /// The sender's partition map.
    pub map: PartitionMap,
}

impl SingleMapMessage {
    /// Serialize for the network collaborator.
    pub fn to_bytes(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    /// Deserialize from the network collaborator.
    pub fn from_bytes(data: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(data)
    }
}
