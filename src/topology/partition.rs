//! Local partition state machine.
//!
//! A partition copy held by this node moves through `MOVING` -> `OWNING` ->
//! `RENTING` -> `EVICTED`. State and reservation count live in one packed
//! atomic word so a reservation attempt racing an eviction transition
//! resolves by compare-and-swap: either the reservation lands before the
//! partition starts renting, or it fails cleanly and the caller re-resolves.

use crate::types::PartitionId;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::watch;

/// State of a local partition copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PartitionState {
    /// Local copy is being populated and is not yet authoritative.
    Moving,
    /// Authoritative copy, serves reads.
    Owning,
    /// Being drained prior to removal.
    Renting,
    /// Terminal; removed from the local partition set.
    Evicted,
}

impl PartitionState {
    /// Whether the partition still participates in the topology.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            PartitionState::Moving | PartitionState::Owning | PartitionState::Renting
        )
    }

    fn code(self) -> u64 {
        match self {
            PartitionState::Moving => 0,
            PartitionState::Owning => 1,
            PartitionState::Renting => 2,
            PartitionState::Evicted => 3,
        }
    }

    fn from_code(code: u64) -> Self {
        match code {
            0 => PartitionState::Moving,
            1 => PartitionState::Owning,
            2 => PartitionState::Renting,
            _ => PartitionState::Evicted,
        }
    }
}

impl std::fmt::Display for PartitionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PartitionState::Moving => write!(f, "moving"),
            PartitionState::Owning => write!(f, "owning"),
            PartitionState::Renting => write!(f, "renting"),
            PartitionState::Evicted => write!(f, "evicted"),
        }
    }
}

// Packed word: low 32 bits reservation count, bits 32.. state code.
const RESERVATION_MASK: u64 = 0xFFFF_FFFF;
const STATE_SHIFT: u32 = 32;

fn pack(state: PartitionState, reservations: u64) -> u64 {
    (state.code() << STATE_SHIFT) | reservations
}

fn unpack_state(word: u64) -> PartitionState {
    PartitionState::from_code(word >> STATE_SHIFT)
}

fn unpack_reservations(word: u64) -> u64 {
    word & RESERVATION_MASK
}

/// A single unit of data ownership held locally.
///
/// Owned by the [`PartitionTopology`](crate::topology::PartitionTopology)
/// that created it; in-flight operations hold `Arc` handles and keep the
/// partition alive through reservations, never through the handle itself.
#[derive(Debug)]
pub struct LocalPartition {
    id: PartitionId,

    /// Packed (state, reservation count).
    word: AtomicU64,

    /// Number of entries stored in this partition.
    size: AtomicU64,

    /// Signalled once when the partition reaches `EVICTED`.
    evicted_tx: watch::Sender<bool>,
}

impl LocalPartition {
    /// Create a partition in the initial `MOVING` state.
    pub fn new(id: PartitionId) -> Self {
        let (evicted_tx, _) = watch::channel(false);

        Self {
            id,
            word: AtomicU64::new(pack(PartitionState::Moving, 0)),
            size: AtomicU64::new(0),
            evicted_tx,
        }
    }

    /// Partition ID.
    pub fn id(&self) -> PartitionId {
        self.id
    }

    /// Current state.
    pub fn state(&self) -> PartitionState {
        unpack_state(self.word.load(Ordering::Acquire))
    }

    /// Current reservation count.
    pub fn reservations(&self) -> u64 {
        unpack_reservations(self.word.load(Ordering::Acquire))
    }

    /// Number of entries currently stored.
    pub fn size(&self) -> u64 {
        self.size.load(Ordering::Acquire)
    }

    /// Attempt the `MOVING` -> `OWNING` transition.
    ///
    /// Returns `false` without side effects from any other state; repeated
    /// calls after success are no-ops.
    pub fn own(&self) -> bool {
        let mut word = self.word.load(Ordering::Acquire);

        loop {
            if unpack_state(word) != PartitionState::Moving {
                return false;
            }

            let new = pack(PartitionState::Owning, unpack_reservations(word));

            match self
                .word
                .compare_exchange_weak(word, new, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return true,
                Err(cur) => word = cur,
            }
        }
    }

    /// Reserve the partition against concurrent eviction.
    ///
    /// Fails once the partition has entered `RENTING` or `EVICTED`; the
    /// caller must re-resolve the key against the topology.
    pub fn reserve(&self) -> bool {
        let mut word = self.word.load(Ordering::Acquire);

        loop {
            let state = unpack_state(word);

            if !matches!(state, PartitionState::Moving | PartitionState::Owning) {
                return false;
            }

            match self.word.compare_exchange_weak(
                word,
                word + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(cur) => word = cur,
            }
        }
    }

    /// Release a reservation taken with [`reserve`](Self::reserve).
    ///
    /// Completes the `RENTING` -> `EVICTED` transition if this was the last
    /// reservation on a drained partition.
    pub fn release(&self) {
        let mut word = self.word.load(Ordering::Acquire);

        loop {
            assert!(
                unpack_reservations(word) > 0,
                "release without reservation on partition {}",
                self.id
            );

            match self.word.compare_exchange_weak(
                word,
                word - 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(cur) => word = cur,
            }
        }

        self.try_finish_eviction();
    }

    /// Begin draining the partition: `MOVING`/`OWNING` -> `RENTING`.
    ///
    /// Returns whether the call performed the transition. Eviction completes
    /// once the size counter and the reservation count both reach zero; an
    /// already-drained partition evicts immediately.
    pub fn rent(&self) -> bool {
        let mut word = self.word.load(Ordering::Acquire);

        let transitioned = loop {
            let state = unpack_state(word);

            if !matches!(state, PartitionState::Moving | PartitionState::Owning) {
                break false;
            }

            let new = pack(PartitionState::Renting, unpack_reservations(word));

            match self
                .word
                .compare_exchange_weak(word, new, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => break true,
                Err(cur) => word = cur,
            }
        };

        self.try_finish_eviction();

        transitioned
    }

    /// Record an entry added to this partition.
    pub fn entry_added(&self) {
        debug_assert!(self.state() != PartitionState::Evicted);

        self.size.fetch_add(1, Ordering::AcqRel);
    }

    /// Record an entry removed from this partition.
    pub fn entry_removed(&self) {
        let prev = self.size.fetch_sub(1, Ordering::AcqRel);
        assert!(prev > 0, "size underflow on partition {}", self.id);

        self.try_finish_eviction();
    }

    /// Wait until the partition reaches `EVICTED`.
    pub async fn when_evicted(&self) {
        let mut rx = self.evicted_tx.subscribe();

        // Sender lives on self, so the channel cannot close early.
        let _ = rx.wait_for(|evicted| *evicted).await;
    }

    /// Complete `RENTING` -> `EVICTED` once drained of entries and
    /// reservations. Idempotent.
    fn try_finish_eviction(&self) -> bool {
        let mut word = self.word.load(Ordering::Acquire);

        loop {
            if unpack_state(word) != PartitionState::Renting || unpack_reservations(word) != 0 {
                return false;
            }

            if self.size.load(Ordering::Acquire) != 0 {
                return false;
            }

            match self.word.compare_exchange_weak(
                word,
                pack(PartitionState::Evicted, 0),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    let _ = self.evicted_tx.send(true);

                    return true;
                }
                Err(cur) => word = cur,
            }
        }
    }
}

impl std::fmt::Display for LocalPartition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "partition [id={}, state={}, reservations={}, size={}]",
            self.id,
            self.state(),
            self.reservations(),
            self.size()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_own_only_from_moving() {
        let part = LocalPartition::new(0);
        assert_eq!(part.state(), PartitionState::Moving);

        assert!(part.own());
        assert_eq!(part.state(), PartitionState::Owning);

        // Repeated own is a no-op returning false.
        assert!(!part.own());
        assert_eq!(part.state(), PartitionState::Owning);
    }

    #[test]
    fn test_reserve_fails_after_rent() {
        let part = LocalPartition::new(3);
        assert!(part.reserve());

        assert!(part.rent());
        assert_eq!(part.state(), PartitionState::Renting);

        // New reservations are refused while draining.
        assert!(!part.reserve());

        // Last release completes the eviction.
        part.release();
        assert_eq!(part.state(), PartitionState::Evicted);
        assert!(!part.reserve());
    }

    #[test]
    fn test_rent_waits_for_entries_to_drain() {
        let part = LocalPartition::new(7);
        part.own();
        part.entry_added();
        part.entry_added();

        assert!(part.rent());
        assert_eq!(part.state(), PartitionState::Renting);

        part.entry_removed();
        assert_eq!(part.state(), PartitionState::Renting);

        part.entry_removed();
        assert_eq!(part.state(), PartitionState::Evicted);
    }

    #[test]
    fn test_rent_on_empty_partition_evicts_immediately() {
        let part = LocalPartition::new(1);
        assert!(part.rent());
        assert_eq!(part.state(), PartitionState::Evicted);

        // Second rent observes the terminal state.
        assert!(!part.rent());
    }

    #[test]
    fn test_concurrent_reserve_release_never_underflows() {
        let part = Arc::new(LocalPartition::new(2));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let part = part.clone();
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        if part.reserve() {
                            part.release();
                        }
                    }
                })
            })
            .collect();

        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(part.reservations(), 0);
        assert_eq!(part.state(), PartitionState::Moving);
    }

    #[tokio::test]
    async fn test_when_evicted_wakes_waiter() {
        let part = Arc::new(LocalPartition::new(5));
        part.reserve();
        part.rent();

        let waiter = {
            let part = part.clone();
            tokio::spawn(async move { part.when_evicted().await })
        };

        part.release();
        waiter.await.unwrap();
        assert_eq!(part.state(), PartitionState::Evicted);
    }
}
