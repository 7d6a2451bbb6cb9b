//! Eviction policies over the cache slot table.

use crate::{Slot, SlotState};

/// Decides which slot to reclaim when an insert finds no matching slot.
///
/// Both policies operate on the same slot table owned by the cache; a policy
/// keeps only its own bookkeeping (hand position, recency stamps).
pub trait EvictionPolicy: Send {
    /// Record that `slot` was just accessed (hit, or fresh insert).
    fn note_access(&mut self, slot: usize);

    /// Pick the slot the next insert overwrites. May demote slot states as
    /// a side effect (the CLOCK sweep does); must return an index within
    /// `slots`.
    fn select_victim(&mut self, slots: &mut [Slot]) -> usize;
}

/// CLOCK: approximate LRU with a rotating hand and a one-bit recency state.
///
/// The sweep demotes `Used` slots to `Unused` and advances; it stops at the
/// first slot that is not `Used` and does not advance past it, so the next
/// insert resumes scanning from the victim. A slot marked `Used` therefore
/// survives at least one full revolution before it becomes eligible, and
/// `Empty` slots are simply pre-demoted victims.
#[derive(Debug)]
pub struct ClockPolicy {
    hand: usize,
}

impl ClockPolicy {
    #[must_use]
    pub fn with_capacity(_capacity: usize) -> Self {
        Self { hand: 0 }
    }
}

impl EvictionPolicy for ClockPolicy {
    fn note_access(&mut self, _slot: usize) {
        // Recency lives in the slot state itself; the cache already marked
        // the slot Used.
    }

    fn select_victim(&mut self, slots: &mut [Slot]) -> usize {
        loop {
            let hand = self.hand;
            if slots[hand].state != SlotState::Used {
                return hand;
            }
            slots[hand].state = SlotState::Unused;
            self.hand = (hand + 1) % slots.len();
        }
    }
}

/// Exact LRU: per-slot access stamps from a monotonic tick.
///
/// The victim is the first `Empty` slot if one exists, otherwise the
/// occupied slot with the oldest stamp. Satisfies the same contract as
/// [`ClockPolicy`] without the grace-cycle approximation.
#[derive(Debug)]
pub struct LruPolicy {
    stamps: Vec<u64>,
    tick: u64,
}

impl LruPolicy {
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            stamps: vec![0; capacity],
            tick: 0,
        }
    }
}

impl EvictionPolicy for LruPolicy {
    fn note_access(&mut self, slot: usize) {
        self.tick += 1;
        self.stamps[slot] = self.tick;
    }

    fn select_victim(&mut self, slots: &mut [Slot]) -> usize {
        if let Some(empty) = slots.iter().position(|slot| !slot.is_occupied()) {
            return empty;
        }
        let mut victim = 0;
        for slot in 1..slots.len() {
            if self.stamps[slot] < self.stamps[victim] {
                victim = slot;
            }
        }
        victim
    }
}
