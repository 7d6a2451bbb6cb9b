use dstack_error::{Result, StoreError};
use dstack_types::{Block, BlockIndex, BLOCK_SIZE};
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;

use crate::BlockStore;

/// File-backed block store using positional `pread`/`pwrite` style I/O via
/// `std::os::unix::fs::FileExt`, so no shared seek position is involved.
///
/// The backing file is not required to be pre-sized: a read past the file's
/// current end yields zeroes for the missing tail, matching the behavior of
/// a sparse image.
#[derive(Debug)]
pub struct FileDisk {
    file: File,
    block_count: Mutex<u64>,
}

impl FileDisk {
    /// Open (creating if absent) `path` as a store of `block_count` blocks.
    pub fn open(path: impl AsRef<Path>, block_count: u64) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path.as_ref())?;
        tracing::debug!(path = %path.as_ref().display(), block_count, "filedisk opened");
        Ok(Self {
            file,
            block_count: Mutex::new(block_count),
        })
    }

    fn byte_offset(index: BlockIndex) -> Result<u64> {
        index
            .0
            .checked_mul(BLOCK_SIZE as u64)
            .ok_or(StoreError::OutOfRange {
                index: index.0,
                block_count: u64::MAX / BLOCK_SIZE as u64,
            })
    }
}

impl BlockStore for FileDisk {
    fn block_count(&self) -> u64 {
        *self.block_count.lock()
    }

    fn resize(&self, new_count: u64) -> Result<u64> {
        let mut count = self.block_count.lock();
        let before = *count;
        let new_len = new_count
            .checked_mul(BLOCK_SIZE as u64)
            .ok_or_else(|| StoreError::Config(format!("block count {new_count} overflows byte length")))?;
        self.file.set_len(new_len)?;
        *count = new_count;
        drop(count);
        tracing::debug!(before, after = new_count, "filedisk resized");
        Ok(before)
    }

    fn read_block(&self, index: BlockIndex) -> Result<Block> {
        let count = *self.block_count.lock();
        if index.0 >= count {
            return Err(StoreError::OutOfRange {
                index: index.0,
                block_count: count,
            });
        }

        let offset = Self::byte_offset(index)?;
        let mut block = Block::ZERO;
        let buf = block.as_mut_slice();

        // Short reads at EOF leave the zero-filled tail in place.
        let mut filled = 0;
        while filled < BLOCK_SIZE {
            let n = self.file.read_at(&mut buf[filled..], offset + filled as u64)?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        Ok(block)
    }

    fn write_block(&self, index: BlockIndex, block: &Block) -> Result<()> {
        let count = *self.block_count.lock();
        if index.0 >= count {
            return Err(StoreError::OutOfRange {
                index: index.0,
                block_count: count,
            });
        }

        let offset = Self::byte_offset(index)?;
        self.file.write_all_at(block.as_slice(), offset)?;
        Ok(())
    }
}
