#![forbid(unsafe_code)]
//! Shadow-verification layer.
//!
//! [`VerifyStore`] forwards every operation to the store beneath while
//! independently remembering the last known content of every block index it
//! has serviced. A read that disagrees with that record is a proven
//! read-your-writes violation in some lower layer, surfaced as the fatal
//! [`StoreError::Corruption`] kind rather than wrong data.
//!
//! The layer exists to test everything beneath it: compose one around a
//! cache under test and cache bugs (stale data, bad eviction, lost writes)
//! become loud corruption failures. Note the documented limitation: when a
//! cache below this layer serves a hit, the true backing medium is not
//! consulted, so out-of-band corruption behind a warm cache goes unseen
//! until the block is evicted.

use dstack_error::{Result, StoreError};
use dstack_store::BlockStore;
use dstack_types::{Block, BlockIndex};
use parking_lot::Mutex;
use std::collections::HashMap;

/// Corruption-detecting wrapper around an underlying store.
pub struct VerifyStore<S> {
    below: S,
    /// Disambiguates stacked instances in corruption reports.
    label: String,
    shadow: Mutex<HashMap<BlockIndex, Block>>,
}

impl<S: BlockStore> VerifyStore<S> {
    pub fn new(below: S, label: impl Into<String>) -> Self {
        Self {
            below,
            label: label.into(),
            shadow: Mutex::new(HashMap::new()),
        }
    }

    #[must_use]
    pub fn inner(&self) -> &S {
        &self.below
    }

    /// Number of block indices currently remembered.
    #[must_use]
    pub fn record_count(&self) -> usize {
        self.shadow.lock().len()
    }

    /// Tear down the layer, freeing all verification records and returning
    /// the underlying store.
    #[must_use]
    pub fn into_inner(self) -> S {
        self.below
    }
}

impl<S: BlockStore> BlockStore for VerifyStore<S> {
    fn block_count(&self) -> u64 {
        self.below.block_count()
    }

    fn resize(&self, new_count: u64) -> Result<u64> {
        // Records beyond the new boundary must go before the shrink, or a
        // later grow would let a stale record flag a legitimately zeroed
        // block as corrupt.
        let mut shadow = self.shadow.lock();
        let before = shadow.len();
        shadow.retain(|index, _| index.0 < new_count);
        let dropped = before - shadow.len();
        drop(shadow);
        if dropped > 0 {
            tracing::debug!(layer = %self.label, dropped, new_count, "verification records discarded on resize");
        }
        self.below.resize(new_count)
    }

    fn read_block(&self, index: BlockIndex) -> Result<Block> {
        let block = self.below.read_block(index)?;

        let mut shadow = self.shadow.lock();
        match shadow.get(&index) {
            Some(known) if *known != block => {
                drop(shadow);
                tracing::error!(layer = %self.label, %index, "read disagrees with last observed content");
                Err(StoreError::Corruption {
                    layer: self.label.clone(),
                    index: index.0,
                    detail: "read disagrees with last observed content".to_owned(),
                })
            }
            Some(_) => Ok(block),
            None => {
                shadow.insert(index, block.clone());
                Ok(block)
            }
        }
    }

    fn write_block(&self, index: BlockIndex, block: &Block) -> Result<()> {
        self.below.write_block(index, block)?;
        self.shadow.lock().insert(index, block.clone());
        Ok(())
    }
}
