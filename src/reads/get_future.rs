//! Multi-key local read with retry-on-repartition semantics.

use crate::error::{Error, Result};
use crate::reads::{EntryFilter, EntryInfo, EntryStore, Preloader, ReadTransaction};
use crate::topology::partition::LocalPartition;
use crate::topology::PartitionTopology;
use crate::types::{partition_for, NodeId, PartitionId, TopologyVersion};
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

/// One requested key, flagged whether the requester should be registered as
/// a transient reader of the entry.
#[derive(Debug, Clone)]
pub struct GetKey {
    /// Entry key.
    pub key: Bytes,
    /// Register the requester as a reader of this entry.
    pub add_reader: bool,
}

impl GetKey {
    /// Key without reader registration.
    pub fn new(key: impl Into<Bytes>) -> Self {
        Self {
            key: key.into(),
            add_reader: false,
        }
    }

    /// Key with reader registration.
    pub fn with_reader(key: impl Into<Bytes>) -> Self {
        Self {
            key: key.into(),
            add_reader: true,
        }
    }
}

/// Partitions whose ownership changed mid-flight; the caller must retry the
/// affected keys against another node.
///
/// Accumulates monotonically and may be observed before the read completes.
#[derive(Debug, Clone, Default)]
pub struct InvalidPartitions(Arc<Mutex<HashSet<PartitionId>>>);

impl InvalidPartitions {
    fn insert(&self, partition: PartitionId) {
        self.0.lock().insert(partition);
    }

    fn extend(&self, partitions: impl IntoIterator<Item = PartitionId>) {
        self.0.lock().extend(partitions);
    }

    /// Whether a partition has been marked invalid.
    pub fn contains(&self, partition: PartitionId) -> bool {
        self.0.lock().contains(&partition)
    }

    /// Whether any partition has been marked invalid.
    pub fn is_empty(&self) -> bool {
        self.0.lock().is_empty()
    }

    /// Snapshot of the invalid set.
    pub fn snapshot(&self) -> HashSet<PartitionId> {
        self.0.lock().clone()
    }
}

/// Partitions reserved while the read is in flight.
///
/// Releasing happens in `Drop`, so every exit path (success, downstream
/// failure, early abort) releases each reservation exactly once.
#[derive(Default)]
struct ReservedPartitions {
    parts: Vec<Arc<LocalPartition>>,
}

impl ReservedPartitions {
    fn contains(&self, partition: PartitionId) -> bool {
        self.parts.iter().any(|p| p.id() == partition)
    }

    fn push(&mut self, part: Arc<LocalPartition>) {
        self.parts.push(part);
    }
}

impl Drop for ReservedPartitions {
    fn drop(&mut self) {
        for part in &self.parts {
            part.release();
        }
    }
}

/// A batched local get against the partition topology.
///
/// Maps every key to its local partition and reserves it against concurrent
/// eviction; keys whose partition cannot be reserved are reported through
/// [`invalid_partitions`](Self::invalid_partitions) instead of being retried
/// locally. Completion is at-most-once: [`finish`](Self::finish) consumes
/// the future.
pub struct GetFuture {
    topology: Arc<PartitionTopology>,
    preloader: Arc<dyn Preloader>,
    store: Arc<dyn EntryStore>,
    tx: Option<Arc<dyn ReadTransaction>>,
    filters: Vec<EntryFilter>,

    keys: Vec<GetKey>,
    reader: NodeId,
    msg_id: u64,
    top_ver: TopologyVersion,
    reload: bool,

    future_id: Uuid,
    retries: InvalidPartitions,
    reserved: ReservedPartitions,
}

impl GetFuture {
    /// Create a read for a batch of keys at a topology version.
    pub fn new(
        topology: Arc<PartitionTopology>,
        preloader: Arc<dyn Preloader>,
        store: Arc<dyn EntryStore>,
        reader: NodeId,
        msg_id: u64,
        keys: Vec<GetKey>,
        top_ver: TopologyVersion,
    ) -> Self {
        assert!(!keys.is_empty(), "get future requires at least one key");

        Self {
            topology,
            preloader,
            store,
            tx: None,
            filters: Vec::new(),
            keys,
            reader,
            msg_id,
            top_ver,
            reload: false,
            future_id: Uuid::new_v4(),
            retries: InvalidPartitions::default(),
            reserved: ReservedPartitions::default(),
        }
    }

    /// Run the read under an owning transaction.
    pub fn with_transaction(mut self, tx: Arc<dyn ReadTransaction>) -> Self {
        self.tx = Some(tx);
        self
    }

    /// Reload values from the backing store instead of reading locally.
    pub fn with_reload(mut self) -> Self {
        self.reload = true;
        self
    }

    /// Apply read-time filters.
    pub fn with_filters(mut self, filters: Vec<EntryFilter>) -> Self {
        self.filters = filters;
        self
    }

    /// Future ID, for diagnostics.
    pub fn future_id(&self) -> Uuid {
        self.future_id
    }

    /// Handle to the invalid-partition set, valid to observe before and
    /// after completion.
    pub fn invalid_partitions(&self) -> InvalidPartitions {
        self.retries.clone()
    }

    /// Execute the read.
    ///
    /// Returns the resolved entries; keys whose partition turned out invalid
    /// are absent from the result and their partitions are reported through
    /// the invalid-partition set. Every reserved partition is released
    /// exactly once regardless of the completion path.
    pub async fn finish(mut self) -> Result<Vec<EntryInfo>> {
        let keys = std::mem::take(&mut self.keys);
        let all_keys: Vec<Bytes> = keys.iter().map(|k| k.key.clone()).collect();

        // Let the preloader prepare the keys; it may already know some
        // partitions cannot be served here.
        let invalid = self.preloader.request(&all_keys, self.top_ver).await?;

        if !invalid.is_empty() {
            debug!(?invalid, "preloader reported invalid partitions");

            self.retries.extend(invalid);
        }

        // Resolve and reserve a local partition for every remaining key.
        let mut mapped: Vec<GetKey> = Vec::with_capacity(keys.len());

        for k in keys {
            let partition = partition_for(&k.key, self.topology.partitions());

            if self.retries.contains(partition) {
                continue;
            }

            if self.map_partition(partition) {
                mapped.push(k);
            } else {
                debug!(partition, "could not reserve partition, marking for retry");

                self.retries.insert(partition);
            }
        }

        self.get_local(&mapped).await
    }

    /// Resolve and reserve one partition. Reserving makes sure the partition
    /// is not unloaded while the read is processed.
    fn map_partition(&mut self, partition: PartitionId) -> bool {
        if self.reserved.contains(partition) {
            return true;
        }

        match self
            .topology
            .local_partition(partition, Some(self.top_ver), true)
        {
            Ok(Some(part)) => {
                if part.reserve() {
                    self.reserved.push(part);

                    true
                } else {
                    false
                }
            }
            Ok(None) => false,
            Err(Error::InvalidPartition { .. }) => false,
            Err(e) => {
                debug!(partition, error = %e, "partition resolution failed");

                false
            }
        }
    }

    /// Batched local get for the successfully mapped keys.
    async fn get_local(&self, keys: &[GetKey]) -> Result<Vec<EntryInfo>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }

        let mut infos = Vec::with_capacity(keys.len());
        let mut pending = Vec::new();

        for k in keys {
            // Retry until a stable snapshot is observed; the entry may be
            // concurrently removed and recreated.
            let info = loop {
                match self.store.peek(&k.key, self.top_ver) {
                    Ok(info) => break info,
                    Err(Error::EntryRemoved) => {
                        debug!(key = ?k.key, "entry removed mid-read, retrying");
                    }
                    Err(e) => return Err(e),
                }
            };

            if k.add_reader {
                if let Some(rx) = self.store.register_reader(&k.key, self.reader, self.msg_id) {
                    pending.push((k.key.clone(), rx));
                }
            }

            infos.push(info);
        }

        // The read must not observe state until pending reader registrations
        // have settled. A transaction completing between the entry read and
        // the registration could leave the reader untracked, so registration
        // is re-validated after each settle until none remains pending.
        for (key, rx) in pending {
            let _ = rx.await;

            while let Some(rx) = self.store.register_reader(&key, self.reader, self.msg_id) {
                let _ = rx.await;
            }
        }

        let key_bytes: Vec<Bytes> = keys.iter().map(|k| k.key.clone()).collect();

        let values = if self.reload {
            self.store.reload_all(&key_bytes, &self.filters).await?
        } else if let Some(tx) = &self.tx {
            tx.get_all(&key_bytes, &self.filters).await?
        } else {
            self.store.get_all(&key_bytes, &self.filters).await?
        };

        // Entries whose value resolved absent are dropped from the result.
        let mut out = Vec::with_capacity(infos.len());

        for mut info in infos {
            if let Some(v) = values.get(&info.key) {
                info.value = Some(v.clone());

                out.push(info);
            }
        }

        Ok(out)
    }
}
