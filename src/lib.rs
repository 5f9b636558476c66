//! Partition topology for a partitioned, replicated in-memory data store.
//!
//! Every data set is split into a fixed number of partitions; an externally
//! supplied [`Affinity`](cluster::Affinity) function maps each partition to
//! its ideal owner set for every topology version. Nodes track where every
//! partition lives through per-node [`PartitionMap`](topology::PartitionMap)
//! snapshots assembled into a cluster-wide
//! [`FullPartitionMap`](topology::FullPartitionMap), reconciled through an
//! exchange protocol driven by membership changes.
//!
//! The crate provides the topology state machine, not the data plane: the
//! storage engine, the preloader and the network layer are collaborators
//! consumed through traits.
//!
//! # Overview
//!
//! - [`topology::PartitionTopology`] is the per-data-set entry point. It owns
//!   the local [`LocalPartition`](topology::LocalPartition) set, merges
//!   incoming map updates, and runs the before/after-exchange hooks.
//! - [`cluster`] holds the membership and affinity seams.
//! - [`reads::GetFuture`] maps a batch of keys onto reserved local partitions
//!   and serves them with retry-on-repartition semantics.

pub mod cluster;
pub mod config;
pub mod error;
pub mod reads;
pub mod topology;
pub mod types;

pub use config::TopologyConfig;
pub use error::{Error, Result};
pub use topology::PartitionTopology;
pub use types::{partition_for, NodeId, PartitionId, TopologyVersion};
