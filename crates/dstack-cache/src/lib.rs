#![forbid(unsafe_code)]
//! Write-through block cache.
//!
//! [`CacheStore`] sits between a client and an underlying [`BlockStore`],
//! intercepting reads and writes through a bounded slot table. Writes always
//! go through to the store beneath before the cache is touched, so
//! durability never depends on cache state. Which occupied slot to reclaim
//! on a miss is delegated to a pluggable [`EvictionPolicy`]; the principal
//! policy is [`ClockPolicy`], with [`LruPolicy`] as a drop-in alternative
//! over the same slot table.
//!
//! The slot buffer is supplied by the caller at construction and is the only
//! memory that ever holds cached block bytes; everything else the cache
//! allocates is metadata. [`CacheStore::into_parts`] hands the buffer back.

use dstack_error::{Result, StoreError};
use dstack_store::BlockStore;
use dstack_types::{Block, BlockIndex};
use parking_lot::Mutex;

mod policy;

pub use policy::{ClockPolicy, EvictionPolicy, LruPolicy};

/// Occupancy state of one cache slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    /// Slot not in use.
    Empty,
    /// In use, but not accessed since the clock hand last swept past.
    Unused,
    /// Recently accessed.
    Used,
}

/// Metadata for one cache slot. The cached bytes live in the caller-supplied
/// frame buffer at the same position.
#[derive(Debug, Clone, Copy)]
pub struct Slot {
    state: SlotState,
    index: BlockIndex,
}

impl Slot {
    const EMPTY: Self = Self {
        state: SlotState::Empty,
        index: BlockIndex(0),
    };

    #[must_use]
    pub fn state(&self) -> SlotState {
        self.state
    }

    /// The block index this slot caches. Meaningful only when the slot is
    /// not [`SlotState::Empty`].
    #[must_use]
    pub fn index(&self) -> BlockIndex {
        self.index
    }

    #[must_use]
    pub fn is_occupied(&self) -> bool {
        self.state != SlotState::Empty
    }
}

/// Hit/miss counters, monotonic from construction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct CacheStats {
    pub read_hits: u64,
    pub read_misses: u64,
    pub write_hits: u64,
    pub write_misses: u64,
}

#[derive(Debug)]
struct CacheState<P> {
    /// Caller-supplied memory for cached block bytes.
    frames: Box<[Block]>,
    slots: Box<[Slot]>,
    policy: P,
    stats: CacheStats,
}

impl<P: EvictionPolicy> CacheState<P> {
    fn lookup(&self, index: BlockIndex) -> Option<usize> {
        self.slots
            .iter()
            .position(|slot| slot.is_occupied() && slot.index == index)
    }

    /// Place `(index, block)` into a slot chosen by the policy. The caller
    /// has already established that no occupied slot matches `index`.
    fn insert(&mut self, index: BlockIndex, block: &Block) {
        let victim = self.policy.select_victim(&mut self.slots);
        let evicted = self.slots[victim];
        if evicted.is_occupied() {
            tracing::debug!(slot = victim, evicted = %evicted.index, inserted = %index, "cache eviction");
        }
        self.slots[victim] = Slot {
            state: SlotState::Used,
            index,
        };
        self.frames[victim].copy_from(block);
        self.policy.note_access(victim);
    }

    fn touch(&mut self, slot: usize) {
        self.slots[slot].state = SlotState::Used;
        self.policy.note_access(slot);
    }
}

/// Write-through cache over an underlying store.
///
/// Caching is a performance optimization, never a behavior change: any
/// sequence of operations through the cache observes exactly what it would
/// observe against the underlying store directly.
#[derive(Debug)]
pub struct CacheStore<S, P = ClockPolicy> {
    below: S,
    state: Mutex<CacheState<P>>,
}

impl<S: BlockStore> CacheStore<S, ClockPolicy> {
    /// CLOCK-evicting cache using `frames` as slot storage.
    ///
    /// `frames` is allocated by the caller; its length fixes the cache
    /// capacity and is independent of the size of the store beneath.
    pub fn new(below: S, frames: Box<[Block]>) -> Result<Self> {
        Self::with_policy(below, frames, ClockPolicy::with_capacity)
    }
}

impl<S: BlockStore> CacheStore<S, LruPolicy> {
    /// LRU-evicting cache, same contract as [`CacheStore::new`].
    pub fn new_lru(below: S, frames: Box<[Block]>) -> Result<Self> {
        Self::with_policy(below, frames, LruPolicy::with_capacity)
    }
}

impl<S: BlockStore, P: EvictionPolicy> CacheStore<S, P> {
    /// Build a cache with an explicit eviction policy constructor.
    pub fn with_policy(
        below: S,
        frames: Box<[Block]>,
        policy: impl FnOnce(usize) -> P,
    ) -> Result<Self> {
        let capacity = frames.len();
        if capacity == 0 {
            return Err(StoreError::Config(
                "cache capacity must be > 0".to_owned(),
            ));
        }
        Ok(Self {
            below,
            state: Mutex::new(CacheState {
                frames,
                slots: vec![Slot::EMPTY; capacity].into_boxed_slice(),
                policy: policy(capacity),
                stats: CacheStats::default(),
            }),
        })
    }

    #[must_use]
    pub fn inner(&self) -> &S {
        &self.below
    }

    /// Number of cache slots.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.state.lock().slots.len()
    }

    /// Snapshot of the hit/miss counters.
    #[must_use]
    pub fn stats(&self) -> CacheStats {
        self.state.lock().stats
    }

    /// Occupied slots as `(index, state)` pairs, for diagnostics and tests.
    #[must_use]
    pub fn occupied_slots(&self) -> Vec<(BlockIndex, SlotState)> {
        self.state
            .lock()
            .slots
            .iter()
            .filter(|slot| slot.is_occupied())
            .map(|slot| (slot.index, slot.state))
            .collect()
    }

    /// Emit the counters through `tracing`.
    pub fn log_stats(&self) {
        let stats = self.stats();
        tracing::info!(
            read_hits = stats.read_hits,
            read_misses = stats.read_misses,
            write_hits = stats.write_hits,
            write_misses = stats.write_misses,
            "cache stats"
        );
    }

    /// Tear down the layer, returning the underlying store and the
    /// caller-supplied frame buffer.
    #[must_use]
    pub fn into_parts(self) -> (S, Box<[Block]>) {
        let state = self.state.into_inner();
        (self.below, state.frames)
    }
}

impl<S: BlockStore, P: EvictionPolicy> BlockStore for CacheStore<S, P> {
    fn block_count(&self) -> u64 {
        self.below.block_count()
    }

    fn resize(&self, new_count: u64) -> Result<u64> {
        // Slots caching indices beyond the new boundary must go before the
        // store beneath shrinks, or a later grow-then-read could serve bytes
        // for an index that was never rewritten after the shrink.
        let mut state = self.state.lock();
        for slot in state.slots.iter_mut() {
            if slot.is_occupied() && slot.index.0 >= new_count {
                slot.state = SlotState::Empty;
            }
        }
        drop(state);
        self.below.resize(new_count)
    }

    fn read_block(&self, index: BlockIndex) -> Result<Block> {
        {
            let mut state = self.state.lock();
            if let Some(slot) = state.lookup(index) {
                let block = state.frames[slot].clone();
                state.touch(slot);
                state.stats.read_hits += 1;
                tracing::trace!(%index, slot, "read hit");
                return Ok(block);
            }
        }

        let block = self.below.read_block(index)?;

        let mut state = self.state.lock();
        state.insert(index, &block);
        state.stats.read_misses += 1;
        drop(state);
        tracing::trace!(%index, "read miss");
        Ok(block)
    }

    fn write_block(&self, index: BlockIndex, block: &Block) -> Result<()> {
        // Write-through: durability lives below. If the store beneath
        // rejects the write, the cache and its counters stay untouched.
        self.below.write_block(index, block)?;

        let mut state = self.state.lock();
        if let Some(slot) = state.lookup(index) {
            state.frames[slot].copy_from(block);
            state.touch(slot);
            state.stats.write_hits += 1;
            tracing::trace!(%index, slot, "write hit");
        } else {
            state.insert(index, block);
            state.stats.write_misses += 1;
            tracing::trace!(%index, "write miss");
        }
        Ok(())
    }
}

/// Allocate a zeroed frame buffer for `capacity` cache slots.
///
/// Convenience for callers; the buffer belongs to the caller until it is
/// handed to [`CacheStore::new`], and comes back out of
/// [`CacheStore::into_parts`].
#[must_use]
pub fn frame_buffer(capacity: usize) -> Box<[Block]> {
    vec![Block::ZERO; capacity].into_boxed_slice()
}

#[cfg(test)]
mod tests {
    use super::*;
    use dstack_store::RamDisk;
    use std::sync::atomic::{AtomicU64, Ordering};

    fn clock_cache(store_blocks: u64, capacity: usize) -> CacheStore<RamDisk> {
        CacheStore::new(RamDisk::new(store_blocks), frame_buffer(capacity)).expect("cache")
    }

    #[test]
    fn zero_capacity_is_a_config_error() {
        let err = CacheStore::new(RamDisk::new(4), frame_buffer(0)).expect_err("zero capacity");
        assert!(matches!(err, StoreError::Config(_)));
    }

    #[test]
    fn read_after_write_through_cache() {
        let cache = clock_cache(10, 2);
        let payload = Block::stamped(BlockIndex(4), 0xB1);
        cache.write_block(BlockIndex(4), &payload).expect("write");
        assert_eq!(cache.read_block(BlockIndex(4)).expect("read"), payload);
    }

    #[test]
    fn writes_reach_the_store_beneath_immediately() {
        let disk = RamDisk::new(10);
        let cache = CacheStore::new(disk.clone(), frame_buffer(2)).expect("cache");

        let payload = Block::filled(0x42);
        cache.write_block(BlockIndex(7), &payload).expect("write");

        // Observed through the backing handle, not the cache.
        assert_eq!(disk.read_block(BlockIndex(7)).expect("read"), payload);
    }

    #[test]
    fn scenario_a_clock_eviction_and_counters() {
        // Capacity 2, store of 10. Three write misses fill and then evict;
        // CLOCK reclaims index 0 first, so reading it afterwards is a miss
        // that still returns the durable content.
        let cache = clock_cache(10, 2);
        let x = Block::filled(0xAA);
        let y = Block::filled(0xBB);
        let z = Block::filled(0xCC);

        cache.write_block(BlockIndex(0), &x).expect("write x");
        cache.write_block(BlockIndex(1), &y).expect("write y");
        cache.write_block(BlockIndex(2), &z).expect("write z");

        let cached: Vec<BlockIndex> = cache
            .occupied_slots()
            .iter()
            .map(|(index, _)| *index)
            .collect();
        assert!(cached.contains(&BlockIndex(1)));
        assert!(cached.contains(&BlockIndex(2)));
        assert!(!cached.contains(&BlockIndex(0)), "index 0 must be evicted");

        assert_eq!(cache.read_block(BlockIndex(0)).expect("read x"), x);

        let stats = cache.stats();
        assert_eq!(
            stats,
            CacheStats {
                read_hits: 0,
                read_misses: 1,
                write_hits: 0,
                write_misses: 3,
            }
        );
    }

    #[test]
    fn clock_grants_one_grace_cycle_to_reaccessed_slots() {
        let cache = clock_cache(10, 2);
        cache
            .write_block(BlockIndex(0), &Block::filled(0x01))
            .expect("write 0");
        cache
            .write_block(BlockIndex(1), &Block::filled(0x02))
            .expect("write 1");

        // Re-access index 0: it is promoted and must survive the next sweep.
        let _ = cache.read_block(BlockIndex(0)).expect("promote 0");

        cache
            .write_block(BlockIndex(2), &Block::filled(0x03))
            .expect("write 2");

        let cached: Vec<BlockIndex> = cache
            .occupied_slots()
            .iter()
            .map(|(index, _)| *index)
            .collect();
        assert!(cached.contains(&BlockIndex(0)), "promoted slot survives");
        assert!(!cached.contains(&BlockIndex(1)), "unpromoted slot is reclaimed");
        assert!(cached.contains(&BlockIndex(2)));
    }

    #[test]
    fn no_two_occupied_slots_share_an_index() {
        let cache = clock_cache(10, 4);
        // Hammer a small set of indices through both paths.
        for round in 0_u8..4 {
            for index in 0_u64..6 {
                cache
                    .write_block(BlockIndex(index), &Block::filled(round))
                    .expect("write");
                let _ = cache.read_block(BlockIndex(index % 3)).expect("read");
            }
        }

        let mut cached: Vec<u64> = cache
            .occupied_slots()
            .iter()
            .map(|(index, _)| index.0)
            .collect();
        cached.sort_unstable();
        let before = cached.len();
        cached.dedup();
        assert_eq!(cached.len(), before, "duplicate cached index");
    }

    #[test]
    fn scenario_c_resize_shrink_evicts_stale_slots() {
        let cache = clock_cache(10, 4);
        for index in [1_u64, 4, 7] {
            cache
                .write_block(BlockIndex(index), &Block::filled(index as u8))
                .expect("write");
        }

        assert_eq!(cache.resize(3).expect("shrink"), 10);

        let cached: Vec<BlockIndex> = cache
            .occupied_slots()
            .iter()
            .map(|(index, _)| *index)
            .collect();
        assert_eq!(cached, vec![BlockIndex(1)]);

        // Grow back and read one of the dropped indices: it must come from
        // the store beneath (zeroed), never from a stale slot.
        cache.resize(10).expect("grow");
        assert_eq!(cache.read_block(BlockIndex(7)).expect("read"), Block::ZERO);
    }

    #[test]
    fn read_hits_do_not_reach_the_store_beneath() {
        struct CountingStore {
            inner: RamDisk,
            reads: AtomicU64,
        }

        impl BlockStore for CountingStore {
            fn block_count(&self) -> u64 {
                self.inner.block_count()
            }
            fn resize(&self, new_count: u64) -> Result<u64> {
                self.inner.resize(new_count)
            }
            fn read_block(&self, index: BlockIndex) -> Result<Block> {
                self.reads.fetch_add(1, Ordering::Relaxed);
                self.inner.read_block(index)
            }
            fn write_block(&self, index: BlockIndex, block: &Block) -> Result<()> {
                self.inner.write_block(index, block)
            }
        }

        let counting = CountingStore {
            inner: RamDisk::new(10),
            reads: AtomicU64::new(0),
        };
        let cache = CacheStore::new(counting, frame_buffer(2)).expect("cache");

        let _ = cache.read_block(BlockIndex(5)).expect("miss");
        let _ = cache.read_block(BlockIndex(5)).expect("hit");
        let _ = cache.read_block(BlockIndex(5)).expect("hit");

        assert_eq!(cache.inner().reads.load(Ordering::Relaxed), 1);
        let stats = cache.stats();
        assert_eq!(stats.read_misses, 1);
        assert_eq!(stats.read_hits, 2);
    }

    #[test]
    fn failed_writes_leave_cache_and_counters_untouched() {
        let cache = clock_cache(4, 2);
        cache
            .write_block(BlockIndex(1), &Block::filled(0x55))
            .expect("write in range");

        let err = cache
            .write_block(BlockIndex(9), &Block::filled(0x66))
            .expect_err("out of range");
        assert!(matches!(err, StoreError::OutOfRange { index: 9, .. }));

        let stats = cache.stats();
        assert_eq!(stats.write_misses, 1, "failed write must not count");
        assert_eq!(cache.occupied_slots().len(), 1);
    }

    #[test]
    fn failed_reads_propagate_unchanged_without_insert() {
        let cache = clock_cache(4, 2);
        let err = cache.read_block(BlockIndex(8)).expect_err("out of range");
        assert!(matches!(
            err,
            StoreError::OutOfRange {
                index: 8,
                block_count: 4
            }
        ));
        assert_eq!(cache.stats(), CacheStats::default());
        assert!(cache.occupied_slots().is_empty());
    }

    #[test]
    fn lru_policy_evicts_least_recently_touched() {
        let cache =
            CacheStore::new_lru(RamDisk::new(10), frame_buffer(2)).expect("lru cache");
        cache
            .write_block(BlockIndex(0), &Block::filled(0x01))
            .expect("write 0");
        cache
            .write_block(BlockIndex(1), &Block::filled(0x02))
            .expect("write 1");

        // Touch 0 so 1 becomes the least recently used.
        let _ = cache.read_block(BlockIndex(0)).expect("touch 0");
        cache
            .write_block(BlockIndex(2), &Block::filled(0x03))
            .expect("write 2");

        let cached: Vec<BlockIndex> = cache
            .occupied_slots()
            .iter()
            .map(|(index, _)| *index)
            .collect();
        assert!(cached.contains(&BlockIndex(0)));
        assert!(!cached.contains(&BlockIndex(1)));
        assert!(cached.contains(&BlockIndex(2)));
    }

    #[test]
    fn into_parts_returns_the_frame_buffer() {
        let frames = frame_buffer(3);
        let cache = CacheStore::new(RamDisk::new(10), frames).expect("cache");
        cache
            .write_block(BlockIndex(0), &Block::filled(0xEE))
            .expect("write");

        let (disk, frames) = cache.into_parts();
        assert_eq!(frames.len(), 3);
        // The write went through to the store beneath.
        assert_eq!(
            disk.read_block(BlockIndex(0)).expect("read"),
            Block::filled(0xEE)
        );
    }

    #[test]
    fn block_count_forwards_without_caching() {
        let disk = RamDisk::new(6);
        let cache = CacheStore::new(disk.clone(), frame_buffer(2)).expect("cache");
        assert_eq!(cache.block_count(), 6);
        disk.resize(9).expect("resize behind the cache");
        assert_eq!(cache.block_count(), 9);
    }
}
