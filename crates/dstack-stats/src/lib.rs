#![forbid(unsafe_code)]
//! Pass-through counter layer.
//!
//! [`StatStore`] counts size queries, resizes, reads, and writes, then
//! delegates unmodified to the store beneath. Counters are monotonic from
//! construction and count attempts, not successes: the increment happens
//! before delegation, so a failed operation is still an operation.

use dstack_error::Result;
use dstack_store::BlockStore;
use dstack_types::{Block, BlockIndex};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Counting wrapper around an underlying store. No independent failure
/// modes; every result is exactly what the store beneath returned.
#[derive(Debug)]
pub struct StatStore<S> {
    below: S,
    size_queries: AtomicU64,
    resizes: AtomicU64,
    reads: AtomicU64,
    writes: AtomicU64,
}

/// Point-in-time copy of the counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatSnapshot {
    pub size_queries: u64,
    pub resizes: u64,
    pub reads: u64,
    pub writes: u64,
}

impl fmt::Display for StatSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "size queries: {}", self.size_queries)?;
        writeln!(f, "resizes:      {}", self.resizes)?;
        writeln!(f, "reads:        {}", self.reads)?;
        write!(f, "writes:       {}", self.writes)
    }
}

impl<S: BlockStore> StatStore<S> {
    pub fn new(below: S) -> Self {
        Self {
            below,
            size_queries: AtomicU64::new(0),
            resizes: AtomicU64::new(0),
            reads: AtomicU64::new(0),
            writes: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub fn inner(&self) -> &S {
        &self.below
    }

    #[must_use]
    pub fn snapshot(&self) -> StatSnapshot {
        StatSnapshot {
            size_queries: self.size_queries.load(Ordering::Relaxed),
            resizes: self.resizes.load(Ordering::Relaxed),
            reads: self.reads.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
        }
    }

    /// Emit the counters through `tracing`.
    pub fn log_stats(&self) {
        let snapshot = self.snapshot();
        tracing::info!(
            size_queries = snapshot.size_queries,
            resizes = snapshot.resizes,
            reads = snapshot.reads,
            writes = snapshot.writes,
            "store stats"
        );
    }

    #[must_use]
    pub fn into_inner(self) -> S {
        self.below
    }
}

impl<S: BlockStore> BlockStore for StatStore<S> {
    fn block_count(&self) -> u64 {
        self.size_queries.fetch_add(1, Ordering::Relaxed);
        self.below.block_count()
    }

    fn resize(&self, new_count: u64) -> Result<u64> {
        self.resizes.fetch_add(1, Ordering::Relaxed);
        self.below.resize(new_count)
    }

    fn read_block(&self, index: BlockIndex) -> Result<Block> {
        self.reads.fetch_add(1, Ordering::Relaxed);
        self.below.read_block(index)
    }

    fn write_block(&self, index: BlockIndex, block: &Block) -> Result<()> {
        self.writes.fetch_add(1, Ordering::Relaxed);
        self.below.write_block(index, block)
    }
}
