use crate::storage::layout::BlockId;
use std::fmt::Debug;

pub trait Replacer: Send + Sync + Debug {
    /// Record an access, making the block the most recently used.
    fn record_access(&mut self, block_id: BlockId);

    /// Forget a block that left the cache.
    fn remove(&mut self, block_id: BlockId);

    /// Up to `limit` eviction candidates, least recently used first.
    fn candidates(&self, limit: usize) -> Vec<BlockId>;

    /// Get the number of tracked blocks.
    fn size(&self) -> usize;
}
