//! Partition topology: the per-data-set, replicated, versioned view of which
//! nodes own or are acquiring each partition.

pub mod exchange;
pub mod map;
pub mod partition;
pub mod partition_topology;

pub use exchange::{ExchangeEvent, ExchangeId, FullMapMessage, SingleMapMessage};
pub use map::{FullPartitionMap, MapOwner, PartitionMap};
pub use partition::{LocalPartition, PartitionState};
pub use partition_topology::PartitionTopology;
