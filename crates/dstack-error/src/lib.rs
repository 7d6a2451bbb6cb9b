#![forbid(unsafe_code)]
//! Error types for DiskStack.
//!
//! # Error Taxonomy
//!
//! DiskStack distinguishes two classes of failure:
//!
//! | Class | Variants | Handling |
//! |-------|----------|----------|
//! | Recoverable I/O | `Io`, `OutOfRange` | Returned from the failing operation, propagated unchanged through every layer, never retried internally. The caller decides whether to retry. |
//! | Fatal | `Corruption` | A proven invariant violation in a lower layer (the verification layer observed a read that disagrees with the last known content). Not recoverable; top-level callers should terminate after reporting it. |
//!
//! `Config` sits outside both classes: it is a constructor-time misuse
//! (e.g. a zero-capacity cache) that never occurs on the I/O path.
//!
//! Every layer surfaces lower-layer errors unchanged; no layer masks,
//! wraps, or retries a failure from the store beneath it. [`StoreError::is_fatal`]
//! is the single classification point, so a top-level driver can default to
//! process termination on fatal errors without string matching.

use thiserror::Error;

/// Unified error type for all DiskStack block store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Operating system I/O error from a file-backed store.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A block index at or beyond the store's current size.
    #[error("block {index} out of range for store with {block_count} blocks")]
    OutOfRange { index: u64, block_count: u64 },

    /// The verification layer observed a read that disagrees with the last
    /// known content for that index. A lower layer has violated the
    /// read-your-writes contract; this is a proven bug, not a transient
    /// condition.
    #[error("corruption detected by layer {layer:?} at block {index}: {detail}")]
    Corruption {
        layer: String,
        index: u64,
        detail: String,
    },

    /// Invalid layer configuration at construction time.
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl StoreError {
    /// True for invariant violations that a top-level caller should treat as
    /// terminal rather than retryable.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Corruption { .. })
    }
}

/// Result alias using `StoreError`.
pub type Result<T> = std::result::Result<T, StoreError>;
