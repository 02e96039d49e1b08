//! Storage layer error types.

use crate::storage::layout::BlockId;
use std::time::Duration;
use thiserror::Error;

/// Errors that can occur in the block store.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Short read at {address:#x}: expected {expected} bytes, got {actual}")]
    ShortRead {
        address: u64,
        expected: usize,
        actual: usize,
    },

    #[error("{store} double free of block {block_id}")]
    DoubleFree { store: String, block_id: BlockId },

    #[error("Block mismatch: requested {expected}, cache returned {actual}")]
    BlockMismatch { expected: BlockId, actual: BlockId },

    #[error("Allocation mismatch at block {index}: expected {expected}, found {actual}")]
    AllocationMismatch {
        index: u64,
        expected: String,
        actual: String,
    },

    #[error("Invalid allocation code {code:#x} at block {index}")]
    InvalidAllocationCode { index: u64, code: u8 },

    #[error("Store is corrupted: {0}")]
    Corrupted(String),

    #[error("No free store id available")]
    NoFreeStoreId,

    #[error("Timed out after {timeout:?} waiting for lock on block {block_id}")]
    LockTimeout { block_id: BlockId, timeout: Duration },

    #[error("Gave up finding a free block after {0} attempts")]
    AllocationRetriesExceeded(usize),

    #[error("Store {0} is closed")]
    StoreClosed(String),

    #[error("Block {0} has released its buffer")]
    BufferReleased(BlockId),

    #[error("Offset {offset} with length {length} exceeds limit {limit}")]
    OutOfBounds {
        offset: usize,
        length: usize,
        limit: usize,
    },

    #[error("Invalid store header: {0}")]
    Header(#[from] bincode::Error),
}

impl StoreError {
    /// True for errors that signal possible on-disk corruption.
    pub fn is_invariant_violation(&self) -> bool {
        matches!(
            self,
            StoreError::DoubleFree { .. }
                | StoreError::BlockMismatch { .. }
                | StoreError::AllocationMismatch { .. }
                | StoreError::InvalidAllocationCode { .. }
                | StoreError::Corrupted(_)
        )
    }
}

/// Result type for storage operations.
pub type StoreResult<T> = Result<T, StoreError>;
