use crate::storage::error::{StoreError, StoreResult};
use crate::storage::layout::{ALLOC_GROUP_COUNT, BLOCK_SIZE};
use serde::{Deserialize, Serialize};

pub const STORE_MAGIC: [u8; 8] = *b"BLKSTORE";
pub const STORE_VERSION: u32 = 1;

/// Identifies a store file and the geometry it was written with. Lives at
/// the start of the header block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreHeader {
    pub magic: [u8; 8],
    pub version: u32,
    pub block_size: u32,
    pub alloc_group_count: u32,
}

impl StoreHeader {
    pub fn new() -> Self {
        Self {
            magic: STORE_MAGIC,
            version: STORE_VERSION,
            block_size: BLOCK_SIZE as u32,
            alloc_group_count: ALLOC_GROUP_COUNT as u32,
        }
    }

    pub fn encode(&self) -> StoreResult<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    /// Decodes and validates a header from the start of `page`.
    pub fn decode(page: &[u8]) -> StoreResult<Self> {
        let header: StoreHeader = bincode::deserialize(page)?;
        header.validate()?;
        Ok(header)
    }

    pub fn validate(&self) -> StoreResult<()> {
        if self.magic != STORE_MAGIC {
            return Err(StoreError::Corrupted(format!(
                "bad magic {:02x?}",
                self.magic
            )));
        }
        if self.version != STORE_VERSION {
            return Err(StoreError::Corrupted(format!(
                "unsupported version {}",
                self.version
            )));
        }
        if self.block_size as usize != BLOCK_SIZE
            || self.alloc_group_count as u64 != ALLOC_GROUP_COUNT
        {
            return Err(StoreError::Corrupted(format!(
                "geometry mismatch: block size {}, group count {}",
                self.block_size, self.alloc_group_count
            )));
        }
        Ok(())
    }
}

impl Default for StoreHeader {
    fn default() -> Self {
        Self::new()
    }
}
