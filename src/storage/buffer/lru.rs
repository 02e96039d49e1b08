use super::replacer::Replacer;
use crate::storage::layout::BlockId;
use std::collections::{BTreeMap, HashMap};

#[derive(Debug, Default)]
pub struct LruReplacer {
    /// Access order: tick -> block, oldest first
    order: BTreeMap<u64, BlockId>,
    /// Latest tick per block for O(log n) reordering
    ticks: HashMap<BlockId, u64>,
    /// Monotonic access counter
    clock: u64,
}

impl LruReplacer {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Replacer for LruReplacer {
    fn record_access(&mut self, block_id: BlockId) {
        self.clock += 1;
        if let Some(old) = self.ticks.insert(block_id, self.clock) {
            self.order.remove(&old);
        }
        self.order.insert(self.clock, block_id);
    }

    fn remove(&mut self, block_id: BlockId) {
        if let Some(tick) = self.ticks.remove(&block_id) {
            self.order.remove(&tick);
        }
    }

    fn candidates(&self, limit: usize) -> Vec<BlockId> {
        self.order.values().take(limit).copied().collect()
    }

    fn size(&self) -> usize {
        self.ticks.len()
    }
}
