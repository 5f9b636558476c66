//! Error types for the partition topology.

use crate::types::{PartitionId, TopologyVersion};
use thiserror::Error;

/// Result type alias for topology operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the partition topology.
#[derive(Error, Debug)]
pub enum Error {
    /// A partition operation targeted a partition that does not belong to the
    /// local node at the effective topology version.
    ///
    /// This is expected during topology churn. Callers must treat it as
    /// "skip this partition, nothing to do", never as a fault.
    #[error("partition {partition} does not belong to local node at version {top_ver:?}")]
    InvalidPartition {
        partition: PartitionId,
        top_ver: Option<TopologyVersion>,
    },

    /// Topology version did not match the version expected by the caller.
    ///
    /// Indicates a protocol bug in the exchange coordinator, not an
    /// environmental condition.
    #[error("topology version mismatch: expected {expected:?}, current {current:?}")]
    TopologyVersionMismatch {
        expected: TopologyVersion,
        current: Option<TopologyVersion>,
    },

    /// A query required a full partition map that has not been initialized
    /// yet (no owner assigned). Querying before the first exchange completes
    /// is a programming error.
    #[error("full partition map is not valid yet")]
    InvalidFullMap,

    /// The storage layer reported that an entry disappeared mid-read.
    /// Recovered locally by retrying entry resolution.
    #[error("entry was concurrently removed")]
    EntryRemoved,

    /// Preloader failure; surfaces as overall read failure.
    #[error("preloader error: {0}")]
    Preload(String),

    /// Storage engine failure; surfaces as overall read failure.
    #[error("store error: {0}")]
    Store(String),
}

impl Error {
    /// The partition carried by an [`Error::InvalidPartition`], if any.
    pub fn invalid_partition(&self) -> Option<PartitionId> {
        match self {
            Error::InvalidPartition { partition, .. } => Some(*partition),
            _ => None,
        }
    }
}
