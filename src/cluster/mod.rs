//! External cluster collaborators: membership and affinity.
//!
//! The topology core never discovers nodes or places partitions itself. It
//! consumes a membership oracle ([`ClusterView`]) and an affinity function
//! ([`Affinity`]) supplied by the embedding system, both of which must be
//! deterministic for a given membership snapshot.

pub mod affinity;
pub mod membership;

pub use affinity::{Affinity, RendezvousAffinity, StaticAffinity};
pub use membership::{ClusterView, StaticClusterView};
