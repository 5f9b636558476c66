//! Core types used throughout the partition topology.

use std::hash::{Hash, Hasher};
use twox_hash::XxHash64;

/// Node identifier in the cluster.
pub type NodeId = u64;

/// Partition identifier, in `[0, partitions)` for a given data set.
pub type PartitionId = u32;

/// Monotonic counter advanced by exactly one per membership exchange.
pub type TopologyVersion = u64;

/// Map a key to its partition.
///
/// Deterministic for a fixed partition count; every node must agree on this
/// mapping for a data set.
pub fn partition_for(key: &[u8], partitions: u32) -> PartitionId {
    debug_assert!(partitions > 0);

    let mut hasher = XxHash64::with_seed(0);
    key.hash(&mut hasher);

    (hasher.finish() % partitions as u64) as PartitionId
}
