#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};
use std::fmt;

/// Size of one block in bytes. Every block in every store is exactly this
/// large; there are no partial reads or writes.
pub const BLOCK_SIZE: usize = 512;

/// Index of a block within a store's linear address space.
///
/// Valid range is `[0, block_count)` for the store being addressed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockIndex(pub u64);

impl fmt::Display for BlockIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// One block of storage: an owned buffer of exactly [`BLOCK_SIZE`] bytes.
#[derive(Clone, PartialEq, Eq)]
pub struct Block {
    bytes: [u8; BLOCK_SIZE],
}

impl Block {
    /// An all-zero block.
    pub const ZERO: Self = Self {
        bytes: [0_u8; BLOCK_SIZE],
    };

    #[must_use]
    pub fn new(bytes: [u8; BLOCK_SIZE]) -> Self {
        Self { bytes }
    }

    /// A block with every byte set to `fill`.
    #[must_use]
    pub fn filled(fill: u8) -> Self {
        Self {
            bytes: [fill; BLOCK_SIZE],
        }
    }

    /// Deterministic payload for traces and tests: the block index stamped
    /// little-endian at the front, the rest filled with `seed`.
    #[must_use]
    pub fn stamped(index: BlockIndex, seed: u8) -> Self {
        let mut bytes = [seed; BLOCK_SIZE];
        bytes[..8].copy_from_slice(&index.0.to_le_bytes());
        Self { bytes }
    }

    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }

    #[must_use]
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.bytes
    }

    /// Overwrite this block's bytes from another block.
    pub fn copy_from(&mut self, other: &Self) {
        self.bytes.copy_from_slice(&other.bytes);
    }
}

impl Default for Block {
    fn default() -> Self {
        Self::ZERO
    }
}

impl From<[u8; BLOCK_SIZE]> for Block {
    fn from(bytes: [u8; BLOCK_SIZE]) -> Self {
        Self { bytes }
    }
}

// 512-byte hex dumps make test failures unreadable; show a prefix only.
impl fmt::Debug for Block {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Block[{:02x} {:02x} {:02x} {:02x} ..]",
            self.bytes[0], self.bytes[1], self.bytes[2], self.bytes[3])
    }
}
