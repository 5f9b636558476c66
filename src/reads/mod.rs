//! Read path: mapping a batch of keys onto local partitions and serving them
//! with retry-on-repartition semantics.
//!
//! The preloader, the storage engine and the transaction are external
//! collaborators, consumed through the traits below.

pub mod get_future;

pub use get_future::{GetFuture, GetKey, InvalidPartitions};

use crate::error::Result;
use crate::types::{NodeId, PartitionId, TopologyVersion};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::oneshot;

/// Read-time filter applied to candidate entries by the storage engine.
pub type EntryFilter = Arc<dyn Fn(&Bytes, &Bytes) -> bool + Send + Sync>;

/// Entry snapshot produced by the read path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryInfo {
    /// Entry key.
    pub key: Bytes,
    /// Resolved value; entries that resolve absent are dropped from results.
    pub value: Option<Bytes>,
}

impl EntryInfo {
    /// Snapshot without a resolved value yet.
    pub fn pending(key: Bytes) -> Self {
        Self { key, value: None }
    }
}

/// Preloading service consulted before local resolution.
#[async_trait]
pub trait Preloader: Send + Sync {
    /// Prepare the keys for a local read at a topology version. Yields the
    /// partitions the preloader already knows cannot be served locally.
    async fn request(
        &self,
        keys: &[Bytes],
        top_ver: TopologyVersion,
    ) -> Result<HashSet<PartitionId>>;
}

/// Local storage engine collaborator.
#[async_trait]
pub trait EntryStore: Send + Sync {
    /// Snapshot entry metadata for a key.
    ///
    /// Fails with [`Error::EntryRemoved`](crate::Error::EntryRemoved) when
    /// the entry disappears mid-read; the caller retries until it observes a
    /// stable snapshot.
    fn peek(&self, key: &Bytes, top_ver: TopologyVersion) -> Result<EntryInfo>;

    /// Register a transient reader for an entry.
    ///
    /// Returns a settle future when active transactions on the entry must
    /// complete before the read may observe state; `None` when the
    /// registration took effect immediately.
    fn register_reader(
        &self,
        key: &Bytes,
        reader: NodeId,
        msg_id: u64,
    ) -> Option<oneshot::Receiver<()>>;

    /// Batched local get.
    async fn get_all(
        &self,
        keys: &[Bytes],
        filters: &[EntryFilter],
    ) -> Result<HashMap<Bytes, Bytes>>;

    /// Batched read-through reload from the backing store.
    async fn reload_all(
        &self,
        keys: &[Bytes],
        filters: &[EntryFilter],
    ) -> Result<HashMap<Bytes, Bytes>>;
}

/// An owning transaction the read executes under, if any.
#[async_trait]
pub trait ReadTransaction: Send + Sync {
    /// Transactional batched get.
    async fn get_all(
        &self,
        keys: &[Bytes],
        filters: &[EntryFilter],
    ) -> Result<HashMap<Bytes, Bytes>>;
}
