//! The partition topology state machine.
//!
//! One instance per data set. A single read/write lock guards the full map,
//! the partition-to-node index, the last applied exchange id and the topology
//! version; the local partition arena and the update-sequence counter use
//! their own concurrent primitives and are never touched under someone
//! else's lock. The write lock is never held across an await point or a
//! network call.

use crate::cluster::{Affinity, ClusterView};
use crate::config::TopologyConfig;
use crate::error::{Error, Result};
use crate::topology::exchange::ExchangeId;
use crate::topology::map::{FullPartitionMap, PartitionMap};
use crate::topology::partition::{LocalPartition, PartitionState};
use crate::types::{partition_for, NodeId, PartitionId, TopologyVersion};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::RwLock;
use std::cmp::Ordering as CmpOrdering;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

/// State guarded by the topology lock.
struct Inner {
    /// Node -> partition map for the whole cluster. `None` until the first
    /// exchange or incoming update materializes it.
    full_map: Option<FullPartitionMap>,

    /// Partition -> nodes holding any state for it. Derived from `full_map`
    /// and kept in lock-step with it.
    part_to_node: HashMap<PartitionId, HashSet<NodeId>>,

    /// Last applied exchange id, used to discard stale protocol messages.
    last_exchange: Option<ExchangeId>,

    /// Current topology version. `None` until the first exchange.
    top_ver: Option<TopologyVersion>,
}

/// Partition topology for one data set.
pub struct PartitionTopology {
    config: TopologyConfig,
    affinity: Arc<dyn Affinity>,
    cluster: Arc<dyn ClusterView>,

    /// Local partition arena. Handles are `Arc`s; eviction safety comes from
    /// the reservation counter, never from holding a handle.
    local_parts: DashMap<PartitionId, Arc<LocalPartition>>,

    /// Global update sequence, monotonically increasing.
    update_seq: AtomicU64,

    inner: RwLock<Inner>,
}

impl PartitionTopology {
    /// Create a topology for one data set.
    pub fn new(
        config: TopologyConfig,
        affinity: Arc<dyn Affinity>,
        cluster: Arc<dyn ClusterView>,
    ) -> Self {
        Self {
            config,
            affinity,
            cluster,
            local_parts: DashMap::new(),
            update_seq: AtomicU64::new(1),
            inner: RwLock::new(Inner {
                full_map: None,
                part_to_node: HashMap::new(),
                last_exchange: None,
                top_ver: None,
            }),
        }
    }

    /// This node's ID.
    pub fn local_node(&self) -> NodeId {
        self.config.node_id
    }

    /// Fixed partition count for the data set.
    pub fn partitions(&self) -> u32 {
        self.config.partitions
    }

    /// Current topology version; `None` before the first exchange.
    pub fn topology_version(&self) -> Option<TopologyVersion> {
        self.inner.read().top_ver
    }

    /// Current global update sequence.
    pub fn update_sequence(&self) -> u64 {
        self.update_seq.load(Ordering::Acquire)
    }

    /// Advance the topology version for a new exchange.
    ///
    /// The new version must be strictly greater than the current one; a
    /// violation indicates a protocol bug in the exchange coordinator and is
    /// propagated, never swallowed.
    pub fn update_topology_version(&self, exch: &ExchangeId) -> Result<()> {
        let mut inner = self.inner.write();

        if inner.top_ver.is_some_and(|cur| exch.version <= cur) {
            return Err(Error::TopologyVersionMismatch {
                expected: exch.version,
                current: inner.top_ver,
            });
        }

        inner.top_ver = Some(exch.version);

        Ok(())
    }

    /// Prepare the local partition set for an exchange.
    ///
    /// Drains partitions mid-eviction from the previous version, purges a
    /// left node from the full map, promotes full-map ownership to the local
    /// node when it became the oldest, and pre-creates or rents local
    /// partitions against the affinity function. Waits for any eviction it
    /// triggered before returning; the lock is released while waiting.
    pub async fn before_exchange(&self, exch: &ExchangeId) -> Result<()> {
        self.wait_for_rent().await;

        let local = self.config.node_id;

        {
            let mut inner = self.inner.write();

            if inner.top_ver != Some(exch.version) {
                return Err(Error::TopologyVersionMismatch {
                    expected: exch.version,
                    current: inner.top_ver,
                });
            }

            let top_ver = exch.version;

            if !exch.is_joined() {
                self.remove_node(&mut inner, exch.node_id);
            }

            let oldest = self.cluster.oldest(top_ver);

            debug!(%exch, "partition map before exchange");

            let update_seq = self.next_update_seq();

            if oldest == Some(local) {
                self.ensure_map_owner(&mut inner, update_seq, exch);
            }

            if self.config.preload_enabled {
                let first_node = oldest == Some(local) && exch.node_id == local && exch.is_joined();

                for p in 0..self.config.partitions {
                    if first_node {
                        // The very first node in a brand-new cluster owns all
                        // of its partitions immediately.
                        match self.local_partition_at(p, Some(top_ver), true) {
                            Ok(Some(part)) => {
                                let owned = part.own();
                                assert!(owned, "failed to own partition {p} on first node");

                                debug!(partition = p, "owned partition on first node");

                                self.update_local(&mut inner, p, part.state(), update_seq);
                            }
                            Ok(None) => {}
                            Err(Error::InvalidPartition { .. }) => {
                                debug!(partition = p, "ignoring invalid partition on first node");
                            }
                            Err(e) => return Err(e),
                        }
                    } else {
                        let map_valid = inner.full_map.as_ref().is_some_and(|m| m.is_valid());
                        let belongs = self.affinity.belongs(p, top_ver, local);

                        if map_valid && belongs {
                            // Make sure all missing local partitions exist,
                            // in MOVING state, and are advertised.
                            match self.local_partition_at(p, Some(top_ver), true) {
                                Ok(Some(part)) => {
                                    self.update_local(&mut inner, p, part.state(), update_seq);
                                }
                                Ok(None) => {}
                                Err(Error::InvalidPartition { .. }) => {
                                    debug!(partition = p, "ignoring invalid partition");
                                }
                                Err(e) => return Err(e),
                            }
                        } else if belongs {
                            // No valid map yet: pre-create so the local map
                            // is advertised correctly during the exchange.
                            match self.local_partition_at(p, Some(top_ver), true) {
                                Ok(_) => {}
                                Err(Error::InvalidPartition { .. }) => {
                                    debug!(partition = p, "ignoring invalid partition pre-create");
                                }
                                Err(e) => return Err(e),
                            }
                        }
                    }
                }
            } else {
                // Preloading disabled: clear out partitions this node is no
                // longer responsible for and pre-create the new ones.
                for p in 0..self.config.partitions {
                    let part = self.local_partition_at(p, None, false)?;
                    let belongs = self.affinity.belongs(p, top_ver, local);

                    match part {
                        Some(part) if !belongs => {
                            if part.state().is_active() {
                                part.rent();

                                self.update_local(&mut inner, p, part.state(), update_seq);

                                debug!(
                                    partition = p,
                                    "evicting partition with preloading disabled"
                                );
                            }
                        }
                        None if belongs => match self.local_partition_at(p, Some(top_ver), true) {
                            Ok(_) => {}
                            Err(Error::InvalidPartition { .. }) => {
                                debug!(partition = p, "ignoring invalid partition pre-create");
                            }
                            Err(e) => return Err(e),
                        },
                        _ => {}
                    }
                }
            }

            if inner.full_map.as_ref().is_some_and(|m| m.is_valid()) {
                self.check_evictions(&mut inner, update_seq);
            }

            self.consistency_check(&inner);
        }

        // Wait for evictions triggered above, outside the lock.
        self.wait_for_rent().await;

        Ok(())
    }

    /// Finalize ownership after the exchange protocol has run.
    ///
    /// Promotes local `MOVING` partitions with no other owners and rents
    /// `MOVING` partitions that left this node's affinity set. Returns
    /// whether the local map changed.
    pub async fn after_exchange(&self, exch: &ExchangeId) -> Result<bool> {
        let mut changed = self.wait_for_rent().await;

        let local = self.config.node_id;

        let mut inner = self.inner.write();

        if inner.top_ver != Some(exch.version) {
            return Err(Error::TopologyVersionMismatch {
                expected: exch.version,
                current: inner.top_ver,
            });
        }

        let top_ver = exch.version;

        debug!(%exch, "partition map before after-exchange");

        let update_seq = self.next_update_seq();

        for p in 0..self.config.partitions {
            let part = self.local_partition_at(p, None, false)?;
            let belongs = self.affinity.belongs(p, top_ver, local);

            if belongs {
                // A missing partition will be created during the next
                // topology event; nothing to finalize now.
                let Some(part) = part else {
                    debug!(partition = p, "skipping absent local partition");
                    continue;
                };

                if part.state() != PartitionState::Moving {
                    continue;
                }

                if self.config.preload_enabled {
                    let owners =
                        self.holders_with_state(&inner, p, None, &[PartitionState::Owning]);

                    if owners.is_empty() {
                        // Nobody to preload from; become the owner.
                        let owned = part.own();
                        assert!(owned, "failed to own partition {p} after exchange");

                        self.update_local(&mut inner, p, part.state(), update_seq);

                        changed = true;

                        info!(partition = p, "owned partition after exchange");
                    } else {
                        debug!(
                            partition = p,
                            ?owners,
                            "will not own partition, owners exist to preload from"
                        );
                    }
                } else {
                    self.update_local(&mut inner, p, part.state(), update_seq);
                }
            } else if let Some(part) = part {
                if part.state() == PartitionState::Moving {
                    part.rent();

                    self.update_local(&mut inner, p, part.state(), update_seq);

                    changed = true;

                    debug!(partition = p, "evicting moving partition out of affinity");
                }
            }
        }

        self.consistency_check(&inner);

        Ok(changed)
    }

    /// Local partition lookup, optionally creating it.
    ///
    /// An `EVICTED` partition found in the arena is purged first and treated
    /// as missing. Creation for a partition outside this node's affinity set
    /// at a definite topology version fails with
    /// [`Error::InvalidPartition`]; passing `None` uses the current version
    /// and, before the first exchange, skips the affinity check.
    pub fn local_partition(
        &self,
        partition: PartitionId,
        top_ver: Option<TopologyVersion>,
        create: bool,
    ) -> Result<Option<Arc<LocalPartition>>> {
        let effective = match top_ver {
            Some(v) => Some(v),
            None => self.inner.read().top_ver,
        };

        self.local_partition_at(partition, effective, create)
    }

    /// Lock-free variant used from within write-locked sections.
    fn local_partition_at(
        &self,
        partition: PartitionId,
        effective: Option<TopologyVersion>,
        create: bool,
    ) -> Result<Option<Arc<LocalPartition>>> {
        loop {
            match self.local_parts.entry(partition) {
                Entry::Occupied(entry) => {
                    let existing = entry.get().clone();

                    if existing.state() == PartitionState::Evicted {
                        // Purge and treat as missing; removal is idempotent.
                        entry.remove();

                        if !create {
                            return Ok(None);
                        }

                        continue;
                    }

                    return Ok(Some(existing));
                }
                Entry::Vacant(entry) => {
                    if !create {
                        return Ok(None);
                    }

                    if let Some(v) = effective {
                        if !self.affinity.belongs(partition, v, self.config.node_id) {
                            return Err(Error::InvalidPartition {
                                partition,
                                top_ver: Some(v),
                            });
                        }
                    }

                    let fresh = Arc::new(LocalPartition::new(partition));
                    entry.insert(fresh.clone());

                    self.next_update_seq();

                    debug!(partition, "created local partition");

                    return Ok(Some(fresh));
                }
            }
        }
    }

    /// Handles to every local partition.
    pub fn local_partitions(&self) -> Vec<Arc<LocalPartition>> {
        self.local_parts.iter().map(|e| e.value().clone()).collect()
    }

    /// Resolve the partition for a key and record an entry insertion,
    /// creating the partition if needed.
    pub fn on_added(&self, top_ver: TopologyVersion, key: &[u8]) -> Result<Arc<LocalPartition>> {
        let p = partition_for(key, self.config.partitions);

        match self.local_partition_at(p, Some(top_ver), true)? {
            Some(part) => {
                part.entry_added();

                Ok(part)
            }
            None => unreachable!("creation always yields a partition"),
        }
    }

    /// Record an entry removal from the key's partition, if held locally.
    pub fn on_removed(&self, key: &[u8]) {
        let p = partition_for(key, self.config.partitions);

        if let Ok(Some(part)) = self.local_partition(p, None, false) {
            part.entry_removed();
        }
    }

    /// Snapshot of this node's own partition map (active partitions only),
    /// for advertisement to peers.
    pub fn local_partition_map(&self) -> PartitionMap {
        let _inner = self.inner.read();

        self.local_partition_map_unlocked()
    }

    fn local_partition_map_unlocked(&self) -> PartitionMap {
        let mut parts = BTreeMap::new();

        for entry in self.local_parts.iter() {
            let state = entry.value().state();

            if state.is_active() {
                parts.insert(*entry.key(), state);
            }
        }

        PartitionMap::with_parts(self.config.node_id, self.update_sequence(), parts)
    }

    /// Copy of the full partition map.
    ///
    /// Errors if the map has not been initialized yet; querying before the
    /// first exchange completes is a programming error.
    pub fn partition_map(&self, only_active: bool) -> Result<FullPartitionMap> {
        let inner = self.inner.read();

        let map = Self::valid_map(&inner)?;
        let owner = map.owner().expect("valid map has an owner");

        Ok(FullPartitionMap::adopt(
            owner.node_id,
            owner.node_order,
            map.update_seq(),
            map,
            only_active,
        ))
    }

    /// A peer's partition map, if known.
    pub fn partitions_of(&self, node: NodeId) -> Option<PartitionMap> {
        let inner = self.inner.read();

        inner.full_map.as_ref().and_then(|m| m.get(node).cloned())
    }

    /// Nodes holding a partition at a topology version: the affinity owner
    /// set plus any live non-affinity holders still recorded in the index
    /// (covers the window where a node keeps a copy after losing affinity).
    pub fn nodes(&self, partition: PartitionId, top_ver: TopologyVersion) -> Result<Vec<NodeId>> {
        let aff = self.affinity.nodes(partition, top_ver);

        let inner = self.inner.read();
        let map = Self::valid_map(&inner)?;

        let mut nodes = aff.clone();

        if let Some(ids) = inner.part_to_node.get(&partition) {
            let mut extra: Vec<NodeId> = ids
                .iter()
                .copied()
                .filter(|id| !aff.contains(id))
                .filter(|&id| {
                    Self::has_state(
                        map,
                        partition,
                        id,
                        &[
                            PartitionState::Owning,
                            PartitionState::Moving,
                            PartitionState::Renting,
                        ],
                    )
                })
                .filter(|&id| self.cluster.is_alive(id))
                .collect();

            extra.sort_unstable();
            nodes.extend(extra);
        }

        Ok(nodes)
    }

    /// Nodes currently owning a partition. With preloading disabled, a
    /// `MOVING` copy is the only copy there will ever be, so it counts.
    pub fn owners(
        &self,
        partition: PartitionId,
        top_ver: Option<TopologyVersion>,
    ) -> Result<Vec<NodeId>> {
        let states: &[PartitionState] = if self.config.preload_enabled {
            &[PartitionState::Owning]
        } else {
            &[PartitionState::Owning, PartitionState::Moving]
        };

        let inner = self.inner.read();
        Self::valid_map(&inner)?;

        Ok(self.holders_with_state(&inner, partition, top_ver, states))
    }

    /// Nodes currently moving a partition in.
    pub fn moving(&self, partition: PartitionId) -> Result<Vec<NodeId>> {
        let states: &[PartitionState] = if self.config.preload_enabled {
            &[PartitionState::Moving]
        } else {
            &[PartitionState::Owning, PartitionState::Moving]
        };

        let inner = self.inner.read();
        Self::valid_map(&inner)?;

        Ok(self.holders_with_state(&inner, partition, None, states))
    }

    /// Merge an incoming whole-cluster snapshot.
    ///
    /// Returns the local partition map when anything locally relevant
    /// changed (so the caller can re-advertise it), or `None` when the
    /// update was stale or changed nothing. Stale updates are expected
    /// during churn and are only logged.
    pub fn update_full(
        &self,
        exch: Option<ExchangeId>,
        mut incoming: FullPartitionMap,
    ) -> Option<PartitionMap> {
        debug!(?exch, "updating full partition map");

        let mut inner = self.inner.write();

        if let (Some(last), Some(exch)) = (inner.last_exchange, exch) {
            if last >= exch {
                debug!(%exch, %last, "stale exchange id for full map update, ignoring");

                return None;
            }
        }

        if let Some(cur) = &inner.full_map {
            if cur.dominance(&incoming) != CmpOrdering::Less {
                debug!("stale full map for update, ignoring");

                return None;
            }
        }

        let update_seq = self.next_update_seq();

        if let Some(exch) = exch {
            inner.last_exchange = Some(exch);
        }

        if let Some(cur) = inner.full_map.take() {
            // Keep per-node entries that are locally newer than the
            // incoming ones.
            for (node, cur_map) in cur.iter() {
                if let Some(new_map) = incoming.get(node) {
                    if new_map.update_seq() < cur_map.update_seq() {
                        debug!(
                            node,
                            cur_seq = cur_map.update_seq(),
                            new_seq = new_map.update_seq(),
                            "keeping locally newer map in full update"
                        );

                        incoming.insert(cur_map.clone());
                    }
                }
            }

            // Drop entries for nodes that already left.
            incoming.retain_nodes(|node| {
                let alive = self.cluster.is_alive(node);

                if !alive {
                    debug!(node, "removing left node from full map update");
                }

                alive
            });
        }

        // Rebuild the partition-to-node index from scratch.
        let mut part_to_node: HashMap<PartitionId, HashSet<NodeId>> = HashMap::new();

        for (node, map) in incoming.iter() {
            for p in map.partitions() {
                part_to_node.entry(p).or_default().insert(node);
            }
        }

        inner.full_map = Some(incoming);
        inner.part_to_node = part_to_node;

        let changed = self.check_evictions(&mut inner, update_seq);

        self.consistency_check(&inner);

        debug!("partition map after full update");

        changed.then(|| self.local_partition_map_unlocked())
    }

    /// Merge one peer's incremental snapshot.
    ///
    /// Same return contract as [`update_full`](Self::update_full).
    pub fn update_single(
        &self,
        exch: Option<ExchangeId>,
        parts: PartitionMap,
    ) -> Option<PartitionMap> {
        debug!(node = parts.node_id(), ?exch, "updating single partition map");

        if !self.cluster.is_alive(parts.node_id()) {
            debug!(
                node = parts.node_id(),
                "ignoring partition map update for dead node"
            );

            return None;
        }

        let mut inner = self.inner.write();

        if let (Some(last), Some(exch)) = (inner.last_exchange, exch) {
            if last > exch {
                debug!(%exch, %last, "stale exchange id for single map update, ignoring");

                return None;
            }
        }

        if let Some(exch) = exch {
            inner.last_exchange = Some(exch);
        }

        let cur = inner
            .full_map
            .as_ref()
            .and_then(|m| m.get(parts.node_id()))
            .cloned();

        if let Some(cur) = &cur {
            if cur.update_seq() >= parts.update_seq() {
                debug!(
                    node = parts.node_id(),
                    cur_seq = cur.update_seq(),
                    new_seq = parts.update_seq(),
                    "stale update sequence for single map update, ignoring"
                );

                return None;
            }
        }

        let update_seq = self.next_update_seq();

        // Copy-on-write replacement of the full map.
        let mut map = inner
            .full_map
            .take()
            .unwrap_or_else(FullPartitionMap::invalid)
            .copy_with_seq(update_seq);

        let mut changed = cur.as_ref() != Some(&parts);

        // Add new index mappings.
        for p in parts.partitions() {
            changed |= inner
                .part_to_node
                .entry(p)
                .or_default()
                .insert(parts.node_id());
        }

        // Remove obsolete ones.
        if let Some(cur) = &cur {
            for p in cur.partitions().filter(|&p| !parts.contains(p)) {
                if let Some(ids) = inner.part_to_node.get_mut(&p) {
                    changed |= ids.remove(&parts.node_id());

                    if ids.is_empty() {
                        inner.part_to_node.remove(&p);
                    }
                }
            }
        }

        map.insert(parts);
        inner.full_map = Some(map);

        changed |= self.check_evictions(&mut inner, update_seq);

        self.consistency_check(&inner);

        debug!("partition map after single update");

        changed.then(|| self.local_partition_map_unlocked())
    }

    /// Attempt the `MOVING` -> `OWNING` transition and reflect it into the
    /// full map and index.
    pub fn own(&self, part: &Arc<LocalPartition>) -> bool {
        let mut inner = self.inner.write();

        if part.own() {
            let update_seq = self.next_update_seq();

            self.update_local(&mut inner, part.id(), part.state(), update_seq);
            self.consistency_check(&inner);

            true
        } else {
            false
        }
    }

    /// Synchronously wait for all renting partitions to drain and drop
    /// evicted ones from the local set. Returns whether the set changed.
    async fn wait_for_rent(&self) -> bool {
        let mut changed = false;

        let draining: Vec<Arc<LocalPartition>> = self
            .local_parts
            .iter()
            .filter(|e| {
                matches!(
                    e.value().state(),
                    PartitionState::Renting | PartitionState::Evicted
                )
            })
            .map(|e| e.value().clone())
            .collect();

        for part in draining {
            if part.state() == PartitionState::Renting {
                debug!(partition = part.id(), "waiting for renting partition");

                part.when_evicted().await;

                debug!(partition = part.id(), "finished waiting for renting partition");
            }

            self.local_parts
                .remove_if(&part.id(), |_, v| Arc::ptr_eq(v, &part));

            changed = true;
        }

        changed
    }

    fn next_update_seq(&self) -> u64 {
        self.update_seq.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// On the oldest node, make sure a full map exists and is attributed to
    /// the local node, promoting or copying the previous one as needed.
    fn ensure_map_owner(&self, inner: &mut Inner, update_seq: u64, exch: &ExchangeId) {
        let local = self.config.node_id;
        let order = self
            .cluster
            .node_order(local)
            .expect("membership view must know the local node");

        match &inner.full_map {
            None => {
                inner.full_map = Some(FullPartitionMap::new(local, order, update_seq));

                debug!(%exch, "created brand new full map on oldest node");
            }
            Some(m) if !m.is_valid() => {
                inner.full_map =
                    Some(FullPartitionMap::adopt(local, order, update_seq, m, false));

                debug!(%exch, "initialized full map on oldest node");
            }
            Some(m) if m.owner().map(|o| o.node_id) != Some(local) => {
                inner.full_map =
                    Some(FullPartitionMap::adopt(local, order, update_seq, m, false));

                debug!(%exch, "copied full map from previous oldest node");
            }
            Some(_) => {}
        }
    }

    /// Evict local partitions the affinity no longer requires here.
    ///
    /// A partition is rented immediately when the whole affinity set already
    /// owns it (redundant copy). When owners outnumber the affinity set, the
    /// surplus holders sorted by ascending join order rent first, giving all
    /// nodes observing the same map a collision-free eviction order.
    /// Idempotent: a partition already renting reports no new transition.
    fn check_evictions(&self, inner: &mut Inner, update_seq: u64) -> bool {
        let Some(top_ver) = inner.top_ver else {
            return false;
        };

        let local = self.config.node_id;
        let mut changed = false;

        let parts: Vec<Arc<LocalPartition>> =
            self.local_parts.iter().map(|e| e.value().clone()).collect();

        for part in parts {
            if !part.state().is_active() {
                continue;
            }

            let p = part.id();
            let aff = self.affinity.nodes(p, top_ver);

            if aff.contains(&local) {
                continue;
            }

            let owners: HashSet<NodeId> = self
                .holders_with_state(inner, p, Some(top_ver), &[PartitionState::Owning])
                .into_iter()
                .collect();

            if aff.iter().all(|n| owners.contains(n)) {
                // Every affinity node already owns this partition; the local
                // copy is redundant.
                if part.rent() {
                    self.update_local(inner, p, part.state(), update_seq);

                    changed = true;

                    debug!(partition = p, "evicting local partition, affinity nodes all own it");
                }
            } else if owners.len() > aff.len() {
                let mut sorted: Vec<NodeId> = owners.into_iter().collect();
                sorted.sort_unstable_by_key(|&n| (self.cluster.node_order(n).unwrap_or(u64::MAX), n));

                let surplus = sorted.len() - aff.len();

                if sorted[..surplus].contains(&local) && part.rent() {
                    self.update_local(inner, p, part.state(), update_seq);

                    changed = true;

                    debug!(partition = p, "evicting local partition, surplus owner");
                }
            }
        }

        changed
    }

    /// Record the local state of one partition into the full map and index.
    ///
    /// When the local node is the oldest and has inherited the map, the
    /// global update sequence is reconciled so it never falls below the
    /// sequence recorded in the inherited map.
    fn update_local(
        &self,
        inner: &mut Inner,
        partition: PartitionId,
        state: PartitionState,
        update_seq: u64,
    ) {
        let local = self.config.node_id;
        let mut effective_seq = update_seq;

        let is_oldest = inner
            .top_ver
            .and_then(|v| self.cluster.oldest(v))
            .is_some_and(|oldest| oldest == local);

        let map = inner
            .full_map
            .get_or_insert_with(FullPartitionMap::invalid);

        if is_oldest && map.is_valid() {
            let map_seq = map.update_seq();

            if map_seq != update_seq {
                if map_seq > update_seq {
                    if self.update_seq.load(Ordering::Acquire) < map_seq {
                        self.update_seq.fetch_max(map_seq + 1, Ordering::AcqRel);
                        effective_seq = map_seq + 1;
                    } else {
                        effective_seq = map_seq;
                    }
                }

                map.set_update_seq(effective_seq);
            }
        }

        if map.get(local).is_none() {
            map.insert(PartitionMap::new(local, effective_seq));
        }

        let node_map = map.get_mut(local).expect("just inserted");

        if node_map.update_seq() < effective_seq {
            node_map.set_update_seq(effective_seq);
        }

        node_map.set(partition, state);

        inner.part_to_node.entry(partition).or_default().insert(local);
    }

    /// Purge a left node from the full map and the index, promoting map
    /// ownership to the local node when it just became the oldest.
    fn remove_node(&self, inner: &mut Inner, node: NodeId) {
        let local = self.config.node_id;

        let Some(cur) = inner.full_map.take() else {
            return;
        };

        let is_oldest = inner
            .top_ver
            .and_then(|v| self.cluster.oldest(v))
            .is_some_and(|oldest| oldest == local);

        let mut map = if is_oldest && cur.owner().map(|o| o.node_id) != Some(local) {
            // Inherit the map: reconcile the counter so the new attribution
            // is strictly newer than the inherited one.
            self.update_seq.fetch_max(cur.update_seq(), Ordering::AcqRel);

            let order = self
                .cluster
                .node_order(local)
                .expect("membership view must know the local node");

            FullPartitionMap::adopt(local, order, self.next_update_seq(), &cur, false)
        } else {
            cur.copy_with_seq(cur.update_seq())
        };

        if let Some(parts) = map.remove(node) {
            debug!(node, "removed left node from full map");

            for p in parts.partitions() {
                if let Some(ids) = inner.part_to_node.get_mut(&p) {
                    ids.remove(&node);

                    if ids.is_empty() {
                        inner.part_to_node.remove(&p);
                    }
                }
            }
        }

        inner.full_map = Some(map);

        self.consistency_check(inner);
    }

    fn valid_map(inner: &Inner) -> Result<&FullPartitionMap> {
        inner
            .full_map
            .as_ref()
            .filter(|m| m.is_valid())
            .ok_or(Error::InvalidFullMap)
    }

    fn has_state(
        map: &FullPartitionMap,
        partition: PartitionId,
        node: NodeId,
        states: &[PartitionState],
    ) -> bool {
        map.get(node)
            .and_then(|m| m.get(partition))
            .is_some_and(|s| states.contains(&s))
    }

    /// Index holders of a partition in one of the given states, restricted
    /// to nodes alive at `top_ver` when given. Sorted for determinism.
    fn holders_with_state(
        &self,
        inner: &Inner,
        partition: PartitionId,
        top_ver: Option<TopologyVersion>,
        states: &[PartitionState],
    ) -> Vec<NodeId> {
        let Some(map) = inner.full_map.as_ref().filter(|m| m.is_valid()) else {
            return Vec::new();
        };

        let Some(ids) = inner.part_to_node.get(&partition) else {
            return Vec::new();
        };

        let alive: Option<HashSet<NodeId>> =
            top_ver.map(|v| self.cluster.alive_nodes(v).into_iter().collect());

        let mut out: Vec<NodeId> = ids
            .iter()
            .copied()
            .filter(|id| alive.as_ref().map_or(true, |a| a.contains(id)))
            .filter(|&id| Self::has_state(map, partition, id, states))
            .collect();

        out.sort_unstable();

        out
    }

    /// Verify bidirectional agreement between the full map and the
    /// partition-to-node index. Gated by config; a failure means the
    /// topology is internally inconsistent and must surface loudly.
    fn consistency_check(&self, inner: &Inner) {
        if !self.config.consistency_check {
            return;
        }

        let Some(map) = &inner.full_map else {
            return;
        };

        for (node, m) in map.iter() {
            for p in m.partitions() {
                let ids = inner.part_to_node.get(&p);

                assert!(
                    ids.is_some_and(|ids| ids.contains(&node)),
                    "index missing holder [partition={p}, node={node}]"
                );
            }
        }

        for (p, ids) in &inner.part_to_node {
            for id in ids {
                let m = map.get(*id);

                assert!(
                    m.is_some_and(|m| m.contains(*p)),
                    "index lists non-holder [partition={p}, node={id}]"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::{StaticAffinity, StaticClusterView};

    const PARTS: u32 = 4;

    fn view(records: &[(TopologyVersion, &[NodeId])]) -> Arc<StaticClusterView> {
        let view = Arc::new(StaticClusterView::new());
        for (v, nodes) in records {
            view.record(*v, nodes.to_vec());
        }
        view
    }

    fn topology(
        local: NodeId,
        view: Arc<StaticClusterView>,
        affinity: Arc<StaticAffinity>,
    ) -> PartitionTopology {
        let config = TopologyConfig::new(local, PARTS).with_consistency_check(true);

        PartitionTopology::new(config, affinity, view)
    }

    fn node_map(node: NodeId, seq: u64, parts: &[(PartitionId, PartitionState)]) -> PartitionMap {
        let mut m = PartitionMap::new(node, seq);
        for &(p, s) in parts {
            m.set(p, s);
        }
        m
    }

    #[test]
    fn test_topology_version_must_strictly_increase() {
        let view = view(&[(1, &[1])]);
        let aff = Arc::new(StaticAffinity::new());
        let topo = topology(1, view, aff);

        assert!(topo.update_topology_version(&ExchangeId::joined(1, 1)).is_ok());
        assert_eq!(topo.topology_version(), Some(1));

        // Same and lower versions are protocol bugs.
        assert!(matches!(
            topo.update_topology_version(&ExchangeId::joined(2, 1)),
            Err(Error::TopologyVersionMismatch { .. })
        ));
        assert!(matches!(
            topo.update_topology_version(&ExchangeId::left(1, 0)),
            Err(Error::TopologyVersionMismatch { .. })
        ));

        assert!(topo.update_topology_version(&ExchangeId::joined(2, 2)).is_ok());
        assert_eq!(topo.topology_version(), Some(2));
    }

    #[tokio::test]
    async fn test_first_node_owns_all_partitions() {
        let view = view(&[(1, &[1])]);
        let aff = Arc::new(StaticAffinity::new());
        for p in 0..PARTS {
            aff.assign(1, p, vec![1]);
        }

        let topo = topology(1, view, aff);
        topo.update_topology_version(&ExchangeId::joined(1, 1)).unwrap();
        topo.before_exchange(&ExchangeId::joined(1, 1)).await.unwrap();

        for p in 0..PARTS {
            let part = topo.local_partition(p, Some(1), false).unwrap().unwrap();
            assert_eq!(part.state(), PartitionState::Owning);
            assert_eq!(topo.owners(p, Some(1)).unwrap(), vec![1]);
        }

        let local_map = topo.local_partition_map();
        assert_eq!(local_map.len(), PARTS as usize);

        let full = topo.partition_map(false).unwrap();
        assert_eq!(full.owner().unwrap().node_id, 1);
    }

    #[tokio::test]
    async fn test_exchange_rejects_wrong_topology_version() {
        let view = view(&[(1, &[1])]);
        let aff = Arc::new(StaticAffinity::new());
        let topo = topology(1, view, aff);

        topo.update_topology_version(&ExchangeId::joined(1, 1)).unwrap();

        assert!(matches!(
            topo.before_exchange(&ExchangeId::joined(1, 2)).await,
            Err(Error::TopologyVersionMismatch { .. })
        ));
        assert!(matches!(
            topo.after_exchange(&ExchangeId::joined(1, 2)).await,
            Err(Error::TopologyVersionMismatch { .. })
        ));
    }

    #[tokio::test]
    async fn test_after_exchange_promotes_partition_with_no_owners() {
        // Node 1 is oldest; node 2 joins and gets partition 0 which nobody
        // owns, so there is no one to preload from.
        let view = view(&[(1, &[1]), (2, &[1, 2])]);
        let aff = Arc::new(StaticAffinity::new());
        aff.assign(1, 1, vec![1]);
        aff.assign(2, 0, vec![2]);
        aff.assign(2, 1, vec![1]);

        let topo = topology(2, view, aff);
        topo.update_topology_version(&ExchangeId::joined(2, 2)).unwrap();

        // Snapshot from the map owner: node 1 owns partition 1 only.
        let mut full = FullPartitionMap::new(1, 1, 10);
        full.insert(node_map(1, 9, &[(1, PartitionState::Owning)]));
        assert!(topo.update_full(None, full).is_none());

        topo.before_exchange(&ExchangeId::joined(2, 2)).await.unwrap();

        let part = topo.local_partition(0, Some(2), false).unwrap().unwrap();
        assert_eq!(part.state(), PartitionState::Moving);

        let changed = topo.after_exchange(&ExchangeId::joined(2, 2)).await.unwrap();
        assert!(changed);
        assert_eq!(part.state(), PartitionState::Owning);
        assert_eq!(topo.owners(0, None).unwrap(), vec![2]);
    }

    #[tokio::test]
    async fn test_after_exchange_defers_to_existing_owners() {
        // Partition 0 moves to node 2 but node 1 still owns it; node 2 must
        // stay MOVING and preload instead of declaring ownership.
        let view = view(&[(1, &[1]), (2, &[1, 2])]);
        let aff = Arc::new(StaticAffinity::new());
        aff.assign(2, 0, vec![2]);

        let topo = topology(2, view, aff);
        topo.update_topology_version(&ExchangeId::joined(2, 2)).unwrap();

        let mut full = FullPartitionMap::new(1, 1, 10);
        full.insert(node_map(1, 9, &[(0, PartitionState::Owning)]));
        topo.update_full(None, full);

        topo.before_exchange(&ExchangeId::joined(2, 2)).await.unwrap();
        topo.after_exchange(&ExchangeId::joined(2, 2)).await.unwrap();

        let part = topo.local_partition(0, Some(2), false).unwrap().unwrap();
        assert_eq!(part.state(), PartitionState::Moving);
        assert_eq!(topo.owners(0, None).unwrap(), vec![1]);
        assert_eq!(topo.moving(0).unwrap(), vec![2]);
    }

    #[test]
    fn test_update_full_rejects_dominated_map() {
        let view = view(&[(1, &[1, 2])]);
        let aff = Arc::new(StaticAffinity::new());
        let topo = topology(1, view, aff);
        topo.update_topology_version(&ExchangeId::joined(2, 1)).unwrap();

        let mut newer = FullPartitionMap::new(2, 2, 10);
        newer.insert(node_map(2, 9, &[(0, PartitionState::Owning)]));
        topo.update_full(None, newer);

        // Lower owner order loses regardless of update sequence.
        let mut older = FullPartitionMap::new(1, 1, 99);
        older.insert(node_map(1, 98, &[(0, PartitionState::Owning)]));
        assert!(topo.update_full(None, older).is_none());

        // Same owner, lower sequence loses too.
        let stale = FullPartitionMap::new(2, 2, 9);
        assert!(topo.update_full(None, stale).is_none());

        let map = topo.partition_map(false).unwrap();
        assert_eq!(map.owner().unwrap().node_id, 2);
        assert!(map.get(2).unwrap().contains(0));
    }

    #[test]
    fn test_update_full_rejects_stale_exchange_id() {
        let view = view(&[(1, &[1, 2])]);
        let aff = Arc::new(StaticAffinity::new());
        let topo = topology(1, view, aff);
        topo.update_topology_version(&ExchangeId::joined(2, 1)).unwrap();

        let mut full = FullPartitionMap::new(2, 2, 10);
        full.insert(node_map(2, 9, &[(0, PartitionState::Owning)]));
        topo.update_full(Some(ExchangeId::joined(2, 1)), full);

        // An equal-or-older exchange id is discarded before any map logic.
        let newer = FullPartitionMap::new(2, 2, 20);
        assert!(topo
            .update_full(Some(ExchangeId::joined(2, 1)), newer)
            .is_none());

        assert_eq!(topo.partition_map(false).unwrap().update_seq(), 10);
    }

    #[test]
    fn test_update_single_rejects_out_of_order_sequences() {
        let view = view(&[(1, &[1, 2])]);
        let aff = Arc::new(StaticAffinity::new());
        let topo = topology(1, view, aff);
        topo.update_topology_version(&ExchangeId::joined(2, 1)).unwrap();

        let mut full = FullPartitionMap::new(1, 1, 1);
        full.insert(node_map(1, 1, &[]));
        topo.update_full(None, full);

        topo.update_single(None, node_map(2, 5, &[(0, PartitionState::Owning)]));
        assert!(topo.partitions_of(2).unwrap().contains(0));

        // Sequence 3 arrives late and must not clobber sequence 5.
        let stale = topo.update_single(None, node_map(2, 3, &[(1, PartitionState::Owning)]));
        assert!(stale.is_none());

        let map = topo.partitions_of(2).unwrap();
        assert!(map.contains(0));
        assert!(!map.contains(1));
        assert_eq!(map.update_seq(), 5);

        // Sequence 6 supersedes; partition 0 leaves the node's map and the
        // index follows.
        topo.update_single(None, node_map(2, 6, &[(1, PartitionState::Owning)]));

        let map = topo.partitions_of(2).unwrap();
        assert!(!map.contains(0));
        assert!(map.contains(1));
    }

    #[test]
    fn test_full_and_single_updates_converge_in_either_order() {
        // A full map carrying an older entry for node 3 and a fresher single
        // map from node 3 must produce the same state regardless of delivery
        // order.
        let full = {
            let mut m = FullPartitionMap::new(2, 2, 10);
            m.insert(node_map(2, 9, &[(0, PartitionState::Owning)]));
            m.insert(node_map(3, 4, &[(1, PartitionState::Moving)]));
            m
        };
        let single = node_map(3, 5, &[(1, PartitionState::Owning)]);

        let make = || {
            let view = view(&[(1, &[1, 2, 3])]);
            let aff = Arc::new(StaticAffinity::new());
            let topo = topology(1, view, aff);
            topo.update_topology_version(&ExchangeId::joined(3, 1)).unwrap();
            topo
        };

        let a = make();
        a.update_full(None, full.clone());
        a.update_single(None, single.clone());

        let b = make();
        b.update_single(None, single);
        b.update_full(None, full);

        for topo in [&a, &b] {
            assert_eq!(
                topo.partitions_of(3).unwrap(),
                node_map(3, 5, &[(1, PartitionState::Owning)])
            );
            assert_eq!(topo.owners(0, None).unwrap(), vec![2]);
            assert_eq!(topo.owners(1, None).unwrap(), vec![3]);
        }
    }

    #[test]
    fn test_update_single_ignores_dead_node() {
        let view = view(&[(1, &[1])]);
        let aff = Arc::new(StaticAffinity::new());
        let topo = topology(1, view, aff);
        topo.update_topology_version(&ExchangeId::joined(1, 1)).unwrap();

        assert!(topo
            .update_single(None, node_map(9, 5, &[(0, PartitionState::Owning)]))
            .is_none());
    }

    #[test]
    fn test_update_full_evicts_redundant_local_copy() {
        // Node 3 holds a copy of partition 0 whose whole affinity set {1, 2}
        // already owns it; merging the map rents the local copy.
        let view = view(&[(1, &[1, 2, 3])]);
        let aff = Arc::new(StaticAffinity::new());
        aff.assign(1, 0, vec![1, 2]);

        let topo = topology(3, view, aff);

        // Local stale copy, owned before the first exchange pinned a
        // version. A reservation keeps it out of the terminal state so the
        // transition is observable.
        let part = topo.local_partition(0, None, true).unwrap().unwrap();
        assert!(part.own());
        assert!(part.reserve());

        topo.update_topology_version(&ExchangeId::joined(3, 1)).unwrap();

        let mut full = FullPartitionMap::new(1, 1, 10);
        full.insert(node_map(1, 9, &[(0, PartitionState::Owning)]));
        full.insert(node_map(2, 8, &[(0, PartitionState::Owning)]));
        full.insert(node_map(3, 7, &[(0, PartitionState::Owning)]));

        let local_map = topo.update_full(None, full).expect("local state changed");
        assert_eq!(local_map.get(0), Some(PartitionState::Renting));
        assert_eq!(part.state(), PartitionState::Renting);

        // Re-applying an equivalent newer snapshot is idempotent.
        let mut again = FullPartitionMap::new(1, 1, 11);
        again.insert(node_map(1, 9, &[(0, PartitionState::Owning)]));
        again.insert(node_map(2, 8, &[(0, PartitionState::Owning)]));
        again.insert(node_map(3, 12, &[(0, PartitionState::Renting)]));
        assert!(topo.update_full(None, again).is_none());

        part.release();
        assert_eq!(part.state(), PartitionState::Evicted);
    }

    #[test]
    fn test_update_full_evicts_surplus_owner_by_join_order() {
        // Affinity wants {2, 4} but node 4 has not finished preloading yet,
        // so three owners cover a two-node set. The surplus holder with the
        // earliest join order rents first so all nodes agree who goes.
        let view = view(&[(1, &[1, 2, 3, 4])]);
        let aff = Arc::new(StaticAffinity::new());
        aff.assign(1, 0, vec![2, 4]);

        let topo = topology(1, view, aff);

        let part = topo.local_partition(0, None, true).unwrap().unwrap();
        assert!(part.own());
        assert!(part.reserve());

        topo.update_topology_version(&ExchangeId::joined(4, 1)).unwrap();

        let mut full = FullPartitionMap::new(1, 1, 10);
        full.insert(node_map(1, 9, &[(0, PartitionState::Owning)]));
        full.insert(node_map(2, 8, &[(0, PartitionState::Owning)]));
        full.insert(node_map(3, 7, &[(0, PartitionState::Owning)]));
        full.insert(node_map(4, 6, &[(0, PartitionState::Moving)]));

        // Node 1 joined first and is the surplus holder.
        assert!(topo.update_full(None, full).is_some());
        assert_eq!(part.state(), PartitionState::Renting);

        part.release();
    }

    #[tokio::test]
    async fn test_node_departure_purges_map_and_index() {
        // Nodes 1 and 2, node 2 leaves; the oldest node purges its entries.
        let view = view(&[(1, &[1, 2]), (2, &[1])]);
        let aff = Arc::new(StaticAffinity::new());
        aff.assign(1, 0, vec![1]);
        aff.assign(1, 1, vec![2]);
        aff.assign(2, 0, vec![1]);
        aff.assign(2, 1, vec![1]);

        let topo = topology(1, view, aff);
        topo.update_topology_version(&ExchangeId::joined(2, 1)).unwrap();

        let mut full = FullPartitionMap::new(1, 1, 10);
        full.insert(node_map(1, 9, &[(0, PartitionState::Owning)]));
        full.insert(node_map(2, 8, &[(1, PartitionState::Owning)]));
        topo.update_full(None, full);

        topo.update_topology_version(&ExchangeId::left(2, 2)).unwrap();
        topo.before_exchange(&ExchangeId::left(2, 2)).await.unwrap();

        assert!(topo.partitions_of(2).is_none());

        // Partition 1 lost its only owner; the survivor takes it over.
        topo.after_exchange(&ExchangeId::left(2, 2)).await.unwrap();
        assert_eq!(topo.owners(1, None).unwrap(), vec![1]);
    }

    #[test]
    fn test_own_updates_full_map() {
        let view = view(&[(1, &[1])]);
        let aff = Arc::new(StaticAffinity::new());
        aff.assign(1, 0, vec![1]);

        let topo = topology(1, view, aff);
        topo.update_topology_version(&ExchangeId::joined(1, 1)).unwrap();

        let mut full = FullPartitionMap::new(1, 1, 1);
        full.insert(node_map(1, 1, &[]));
        topo.update_full(None, full);

        let part = topo.local_partition(0, Some(1), true).unwrap().unwrap();
        assert!(topo.own(&part));
        assert!(!topo.own(&part));

        assert_eq!(topo.owners(0, None).unwrap(), vec![1]);
        assert_eq!(
            topo.local_partition_map().get(0),
            Some(PartitionState::Owning)
        );
    }

    #[test]
    fn test_local_partition_create_outside_affinity_fails() {
        let view = view(&[(1, &[1, 2])]);
        let aff = Arc::new(StaticAffinity::new());
        aff.assign(1, 0, vec![2]);

        let topo = topology(1, view, aff);
        topo.update_topology_version(&ExchangeId::joined(2, 1)).unwrap();

        let err = topo.local_partition(0, Some(1), true).unwrap_err();
        assert_eq!(err.invalid_partition(), Some(0));

        // Lookup without creation never fails.
        assert!(topo.local_partition(0, Some(1), false).unwrap().is_none());
    }

    #[test]
    fn test_entry_counting_tracks_partition_size() {
        let view = view(&[(1, &[1])]);
        let aff = Arc::new(StaticAffinity::new());
        for p in 0..PARTS {
            aff.assign(1, p, vec![1]);
        }

        let topo = topology(1, view, aff);
        topo.update_topology_version(&ExchangeId::joined(1, 1)).unwrap();

        let key = b"user:42";
        let part = topo.on_added(1, key).unwrap();
        assert_eq!(part.size(), 1);

        topo.on_removed(key);
        assert_eq!(part.size(), 0);
    }

    #[test]
    fn test_nodes_includes_live_non_affinity_holder() {
        // Node 3 still holds a moving copy of partition 0 after the
        // affinity moved to {1, 2}; readers must still see it.
        let view = view(&[(1, &[1, 2, 3])]);
        let aff = Arc::new(StaticAffinity::new());
        aff.assign(1, 0, vec![1, 2]);

        let topo = topology(1, view, aff);
        topo.update_topology_version(&ExchangeId::joined(3, 1)).unwrap();

        let mut full = FullPartitionMap::new(1, 1, 10);
        full.insert(node_map(1, 9, &[(0, PartitionState::Owning)]));
        full.insert(node_map(2, 8, &[(0, PartitionState::Owning)]));
        full.insert(node_map(3, 7, &[(0, PartitionState::Moving)]));
        topo.update_full(None, full);

        assert_eq!(topo.nodes(0, 1).unwrap(), vec![1, 2, 3]);
        assert_eq!(topo.owners(0, Some(1)).unwrap(), vec![1, 2]);
        assert_eq!(topo.moving(0).unwrap(), vec![3]);
    }
}
