//! Configuration for a partition topology instance.

use crate::types::NodeId;

/// Configuration for one data set's partition topology.
#[derive(Debug, Clone)]
pub struct TopologyConfig {
    /// This node's ID.
    pub node_id: NodeId,

    /// Fixed partition count for the data set.
    pub partitions: u32,

    /// Number of backup copies per partition (ideal owner set size is
    /// `backups + 1`).
    pub backups: usize,

    /// Whether preloading (background rebalancing of partition data) is
    /// enabled. With preloading disabled, partitions that leave this node's
    /// affinity set are rented out immediately on exchange.
    pub preload_enabled: bool,

    /// Run the expensive bidirectional full-map/index consistency check after
    /// every topology mutation. Intended for tests and debugging.
    pub consistency_check: bool,
}

impl TopologyConfig {
    /// Create a config with the default partition count.
    pub fn new(node_id: NodeId, partitions: u32) -> Self {
        Self {
            node_id,
            partitions,
            backups: 1,
            preload_enabled: true,
            consistency_check: false,
        }
    }

    /// Set the backup count.
    pub fn with_backups(mut self, backups: usize) -> Self {
        self.backups = backups;
        self
    }

    /// Enable or disable preloading.
    pub fn with_preload_enabled(mut self, enabled: bool) -> Self {
        self.preload_enabled = enabled;
        self
    }

    /// Enable the per-mutation consistency check.
    pub fn with_consistency_check(mut self, enabled: bool) -> Self {
        self.consistency_check = enabled;
        self
    }

    /// Ideal number of owners per partition.
    pub fn replicas(&self) -> usize {
        self.backups + 1
    }
}
