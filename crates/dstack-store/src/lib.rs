#![forbid(unsafe_code)]
//! The block store contract and the raw storage backends.
//!
//! Every layer in a DiskStack pipeline implements [`BlockStore`]: a store is
//! a linear array of 512-byte blocks addressed by [`BlockIndex`]. Layers
//! compose by owning the store beneath them, so a stack is a tree of single
//! ownership with a raw backend ([`RamDisk`] or [`FileDisk`]) at each leaf.
//! Tearing down the top of a stack drops everything beneath it.

use dstack_error::{Result, StoreError};
use dstack_types::{Block, BlockIndex};
use parking_lot::Mutex;
use std::sync::Arc;

mod file;

pub use file::FileDisk;

/// The uniform operation set implemented by every layer and every backend.
///
/// Methods take `&self`; implementations that mutate state use interior
/// locking. The design assumes one logical caller per stack instance; the
/// locks make individual calls safe to share, not sequences of them.
pub trait BlockStore: Send + Sync {
    /// Current number of blocks in the store.
    fn block_count(&self) -> u64;

    /// Truncate or extend the store to `new_count` blocks.
    ///
    /// Returns the previous block count. The content of an extended region
    /// is unspecified unless the backend zero-fills.
    fn resize(&self, new_count: u64) -> Result<u64>;

    /// Read the block at `index`.
    fn read_block(&self, index: BlockIndex) -> Result<Block>;

    /// Write `block` at `index`.
    ///
    /// On success the write is durably applied to the chain beneath; on
    /// failure prior state is intact.
    fn write_block(&self, index: BlockIndex, block: &Block) -> Result<()>;
}

impl<S: BlockStore + ?Sized> BlockStore for Box<S> {
    fn block_count(&self) -> u64 {
        (**self).block_count()
    }

    fn resize(&self, new_count: u64) -> Result<u64> {
        (**self).resize(new_count)
    }

    fn read_block(&self, index: BlockIndex) -> Result<Block> {
        (**self).read_block(index)
    }

    fn write_block(&self, index: BlockIndex, block: &Block) -> Result<()> {
        (**self).write_block(index, block)
    }
}

fn check_range(index: BlockIndex, block_count: u64) -> Result<()> {
    if index.0 >= block_count {
        return Err(StoreError::OutOfRange {
            index: index.0,
            block_count,
        });
    }
    Ok(())
}

/// Memory-backed block store.
///
/// `Clone` yields a second handle onto the same storage. Stacks built for
/// tests keep a clone outside the stack so they can inspect or corrupt the
/// backing medium out of band.
#[derive(Debug, Clone)]
pub struct RamDisk {
    blocks: Arc<Mutex<Vec<Block>>>,
}

impl RamDisk {
    /// Create a zero-filled store of `block_count` blocks.
    #[must_use]
    pub fn new(block_count: u64) -> Self {
        let count = usize::try_from(block_count).unwrap_or(usize::MAX);
        Self {
            blocks: Arc::new(Mutex::new(vec![Block::ZERO; count])),
        }
    }

    /// Overwrite a block directly, bypassing the contract. Test rigging for
    /// simulating media corruption beneath a stack.
    pub fn corrupt_block(&self, index: BlockIndex, block: &Block) {
        let mut blocks = self.blocks.lock();
        let slot = usize::try_from(index.0).ok().and_then(|i| blocks.get_mut(i));
        if let Some(slot) = slot {
            slot.copy_from(block);
        }
    }
}

impl BlockStore for RamDisk {
    fn block_count(&self) -> u64 {
        u64::try_from(self.blocks.lock().len()).unwrap_or(u64::MAX)
    }

    fn resize(&self, new_count: u64) -> Result<u64> {
        let count = usize::try_from(new_count)
            .map_err(|_| StoreError::Config(format!("block count {new_count} does not fit usize")))?;
        let mut blocks = self.blocks.lock();
        let before = u64::try_from(blocks.len()).unwrap_or(u64::MAX);
        blocks.resize(count, Block::ZERO);
        drop(blocks);
        tracing::debug!(before, after = new_count, "ramdisk resized");
        Ok(before)
    }

    fn read_block(&self, index: BlockIndex) -> Result<Block> {
        let blocks = self.blocks.lock();
        check_range(index, u64::try_from(blocks.len()).unwrap_or(u64::MAX))?;
        let idx = usize::try_from(index.0)
            .map_err(|_| StoreError::OutOfRange {
                index: index.0,
                block_count: u64::try_from(blocks.len()).unwrap_or(u64::MAX),
            })?;
        Ok(blocks[idx].clone())
    }

    fn write_block(&self, index: BlockIndex, block: &Block) -> Result<()> {
        let mut blocks = self.blocks.lock();
        check_range(index, u64::try_from(blocks.len()).unwrap_or(u64::MAX))?;
        let idx = usize::try_from(index.0)
            .map_err(|_| StoreError::OutOfRange {
                index: index.0,
                block_count: u64::try_from(blocks.len()).unwrap_or(u64::MAX),
            })?;
        blocks[idx].copy_from(block);
        Ok(())
    }
}
