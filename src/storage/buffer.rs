pub mod lru;
pub mod pool;
pub mod replacer;

use crate::storage::block::Block;
use crate::storage::config::CacheConfig;
use crate::storage::error::{StoreError, StoreResult};
use crate::storage::layout::{BlockId, MAX_STORE_ID};
use crate::storage::store::Store;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use pool::BufferPool;
use replacer::Replacer;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Process-wide LRU cache of blocks, shared by every store that uses it.
///
/// Blocks are keyed by [`BlockId`], which already carries the store id, so
/// stores never collide. The cache also hands out store ids.
#[derive(Clone)]
pub struct BlockCache {
    inner: Arc<BlockCacheInner>,
}

struct BlockCacheInner {
    blocks: DashMap<BlockId, Arc<Block>>,
    /// Eviction bookkeeping; held while a block leaves `blocks` so the
    /// map and the LRU order stay in step.
    replacer: Mutex<Box<dyn Replacer>>,
    buffers: BufferPool,
    store_ids: Mutex<StoreIdTable>,
    capacity: AtomicUsize,
    max_capacity: AtomicUsize,
    eviction_probes: usize,
}

impl BlockCache {
    pub fn new(config: CacheConfig) -> Self {
        Self::with_replacer(config, Box::new(lru::LruReplacer::new()))
    }

    pub fn with_replacer(config: CacheConfig, replacer: Box<dyn Replacer>) -> Self {
        Self {
            inner: Arc::new(BlockCacheInner {
                blocks: DashMap::with_capacity(config.capacity),
                replacer: Mutex::new(replacer),
                buffers: BufferPool::new(config.buffer_pool_size),
                store_ids: Mutex::new(StoreIdTable::new()),
                capacity: AtomicUsize::new(config.capacity),
                max_capacity: AtomicUsize::new(config.max_capacity.max(config.capacity)),
                eviction_probes: config.eviction_probes,
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity.load(Ordering::SeqCst)
    }

    /// Number of blocks currently cached.
    pub fn len(&self) -> usize {
        self.inner.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.blocks.is_empty()
    }

    pub fn contains(&self, block_id: BlockId) -> bool {
        self.inner.blocks.contains_key(&block_id)
    }

    pub(crate) fn buffer_pool(&self) -> BufferPool {
        self.inner.buffers.clone()
    }

    /// Raises the capacity to at least `min_capacity` blocks.
    pub fn ensure_capacity(&self, min_capacity: usize) {
        self.inner.capacity.fetch_max(min_capacity, Ordering::SeqCst);
        self.inner
            .max_capacity
            .fetch_max(min_capacity, Ordering::SeqCst);
    }

    /// Returns the block for `block_id`, pinned for the caller.
    ///
    /// A cached block that is being evicted refuses the pin; it is then
    /// dropped from the map and a fresh block takes its place. When two
    /// threads race to insert, the loser's block is discarded.
    pub(crate) fn get_block(&self, store: &Arc<Store>, block_id: BlockId) -> StoreResult<Arc<Block>> {
        loop {
            let cached = self.inner.blocks.get(&block_id).map(|e| e.value().clone());

            let block = match cached {
                Some(block) => {
                    if !block.allocate() {
                        self.inner
                            .blocks
                            .remove_if(&block_id, |_, b| Arc::ptr_eq(b, &block));
                        continue;
                    }
                    block
                }
                None => {
                    let block = Arc::new(Block::new(
                        store.clone(),
                        block_id,
                        self.inner.buffers.clone(),
                    ));

                    let inserted = match self.inner.blocks.entry(block_id) {
                        Entry::Occupied(_) => false,
                        Entry::Vacant(entry) => {
                            entry.insert(block.clone());
                            true
                        }
                    };

                    if !inserted {
                        block.discard();
                        continue;
                    }
                    if !block.allocate() {
                        continue;
                    }
                    block
                }
            };

            if block.id() != block_id || !Arc::ptr_eq(block.store(), store) {
                log::error!(
                    "{} cache returned {} for requested {}",
                    store,
                    block,
                    block_id
                );
                let actual = block.id();
                block.free();
                return Err(StoreError::BlockMismatch {
                    expected: block_id,
                    actual,
                });
            }

            self.inner.replacer.lock().record_access(block_id);
            self.evict_if_needed();

            return Ok(block);
        }
    }

    /// Evicts least recently used blocks until the cache is back within
    /// capacity. Pinned blocks veto their eviction; if no candidate can be
    /// evicted the capacity grows instead, up to the configured ceiling.
    fn evict_if_needed(&self) {
        if self.inner.blocks.len() <= self.capacity() {
            return;
        }

        let mut replacer = self.inner.replacer.lock();

        while self.inner.blocks.len() > self.capacity() {
            let mut evicted = false;

            for block_id in replacer.candidates(self.inner.eviction_probes) {
                let Some(block) = self.inner.blocks.get(&block_id).map(|e| e.value().clone())
                else {
                    replacer.remove(block_id);
                    continue;
                };

                if block.start_lru_remove() {
                    self.inner
                        .blocks
                        .remove_if(&block_id, |_, b| Arc::ptr_eq(b, &block));
                    replacer.remove(block_id);
                    block.sync_lru_remove_event();
                    evicted = true;
                    break;
                }
            }

            if !evicted && !self.grow() {
                break;
            }
        }
    }

    fn grow(&self) -> bool {
        let capacity = self.capacity();
        let max_capacity = self.inner.max_capacity.load(Ordering::SeqCst);

        if capacity >= max_capacity {
            log::warn!(
                "block cache over capacity {} with every candidate pinned",
                capacity
            );
            return false;
        }

        let grown = (capacity + capacity / 2 + 1).min(max_capacity);
        self.inner.capacity.store(grown, Ordering::SeqCst);
        log::info!("block cache capacity grown from {} to {}", capacity, grown);
        true
    }

    fn store_blocks(&self, store: &Arc<Store>) -> Vec<Arc<Block>> {
        self.inner
            .blocks
            .iter()
            .filter(|e| Arc::ptr_eq(e.value().store(), store))
            .map(|e| e.value().clone())
            .collect()
    }

    /// Queues every dirty cached block of `store` on its writer.
    pub fn flush(&self, store: &Arc<Store>) {
        for block in self.store_blocks(store) {
            if block.is_dirty() {
                store.writer().add_dirty_block(block);
            }
        }
    }

    /// Drops every cached block of `store`.
    pub fn free_store(&self, store: &Arc<Store>) {
        self.remove_store_blocks(store, false);
    }

    /// Drops every cached block of `store` along with unflushed changes.
    pub(crate) fn discard_store(&self, store: &Arc<Store>) {
        self.remove_store_blocks(store, true);
    }

    fn remove_store_blocks(&self, store: &Arc<Store>, discard: bool) {
        let removed: Vec<Arc<Block>> = {
            let mut replacer = self.inner.replacer.lock();
            self.store_blocks(store)
                .into_iter()
                .filter_map(|block| {
                    let id = block.id();
                    let (_, removed) = self
                        .inner
                        .blocks
                        .remove_if(&id, |_, b| Arc::ptr_eq(b, &block))?;
                    replacer.remove(id);
                    Some(removed)
                })
                .collect()
        };

        for block in removed {
            if discard {
                block.invalidate();
            }
            block.sync_remove_event();
        }
    }

    /// Reserves a store id. Id 0 is never handed out.
    pub fn allocate_store_id(&self) -> StoreResult<u32> {
        self.inner
            .store_ids
            .lock()
            .allocate()
            .ok_or(StoreError::NoFreeStoreId)
    }

    pub fn free_store_id(&self, id: u32) {
        self.inner.store_ids.lock().free(id);
    }
}

impl std::fmt::Debug for BlockCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockCache")
            .field("len", &self.len())
            .field("capacity", &self.capacity())
            .finish()
    }
}

/// Bitmap of store ids in use.
struct StoreIdTable {
    words: Vec<u64>,
    /// Word to start the next scan from.
    cursor: usize,
}

impl StoreIdTable {
    fn new() -> Self {
        let mut words = vec![0u64; MAX_STORE_ID / 64];
        // id 0 would make block id 0 ambiguous
        words[0] = 1;
        Self { words, cursor: 0 }
    }

    fn allocate(&mut self) -> Option<u32> {
        let len = self.words.len();
        for step in 0..len {
            let i = (self.cursor + step) % len;
            let word = self.words[i];
            if word != u64::MAX {
                let bit = (!word).trailing_zeros() as usize;
                self.words[i] |= 1 << bit;
                self.cursor = i;
                return Some((i * 64 + bit) as u32);
            }
        }
        None
    }

    fn free(&mut self, id: u32) {
        let id = id as usize;
        if id == 0 || id >= MAX_STORE_ID {
            return;
        }
        self.words[id / 64] &= !(1 << (id % 64));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::config::StoreConfig;
    use crate::storage::layout::BLOCK_SIZE;
    use anyhow::Result;
    use tempfile::{tempdir, TempDir};

    fn create_test_store(capacity: usize) -> Result<(TempDir, BlockCache, Arc<Store>)> {
        let dir = tempdir()?;
        let cache = BlockCache::new(CacheConfig::with_capacity(capacity).max_capacity(capacity));
        let config = StoreConfig::default().sync_on_flush(false);
        let store = Store::open(&cache, dir.path().join("test.db"), config)?;
        Ok((dir, cache, store))
    }

    #[test]
    fn test_store_ids() {
        let mut table = StoreIdTable::new();
        assert_eq!(table.allocate(), Some(1));
        assert_eq!(table.allocate(), Some(2));
        table.free(1);
        assert_eq!(table.allocate(), Some(1));

        // freeing the reserved id is ignored
        table.free(0);
        for _ in 3..MAX_STORE_ID {
            assert!(table.allocate().is_some());
        }
        assert_eq!(table.allocate(), None);
    }

    #[test]
    fn test_allocate_store_id_exhaustion() {
        let cache = BlockCache::new(CacheConfig::with_capacity(8));
        let ids: Vec<u32> = (1..MAX_STORE_ID)
            .map(|_| cache.allocate_store_id().unwrap())
            .collect();
        assert!(!ids.contains(&0));
        assert!(matches!(
            cache.allocate_store_id(),
            Err(StoreError::NoFreeStoreId)
        ));

        cache.free_store_id(ids[10]);
        assert_eq!(cache.allocate_store_id().unwrap(), ids[10]);
    }

    #[test]
    fn test_get_block_returns_cached_block() -> Result<()> {
        let (_dir, cache, store) = create_test_store(16)?;
        let id = BlockId::new(store.id(), 5);

        let a = cache.get_block(&store, id)?;
        let b = cache.get_block(&store, id)?;
        assert!(Arc::ptr_eq(&a, &b));
        // cache reference + two pins
        assert_eq!(a.use_count(), 3);

        a.free();
        b.free();
        assert_eq!(a.use_count(), 1);
        assert!(cache.contains(id));

        store.close()?;
        Ok(())
    }

    #[test]
    fn test_eviction_skips_pinned_blocks() -> Result<()> {
        let (_dir, cache, store) = create_test_store(4)?;

        let pinned = store.allocate_row()?;
        let pinned_id = pinned.id();

        let mut addresses = Vec::new();
        for _ in 0..8 {
            let block = store.allocate_row()?;
            addresses.push(block.address());
        }

        assert!(cache.contains(pinned_id));
        assert!(!pinned.is_released());
        assert!(cache.len() <= 4);

        // evicted blocks come back with their contents
        for address in addresses {
            let block = store.read_block(address)?;
            assert!(block.read_lock()?.iter().all(|&b| b == 0));
        }

        drop(pinned);
        store.close()?;
        Ok(())
    }

    #[test]
    fn test_capacity_grows_when_everything_is_pinned() -> Result<()> {
        let dir = tempdir()?;
        let cache = BlockCache::new(CacheConfig::with_capacity(2).max_capacity(64));
        let store = Store::open(
            &cache,
            dir.path().join("test.db"),
            StoreConfig::default().sync_on_flush(false),
        )?;

        let held: Vec<_> = (0..6).map(|_| store.allocate_row()).collect::<Result<_, _>>()?;
        assert!(cache.capacity() > 2);
        assert!(held.iter().all(|b| !b.is_released()));

        drop(held);
        store.close()?;
        Ok(())
    }

    #[test]
    fn test_ensure_capacity() {
        let cache = BlockCache::new(CacheConfig::with_capacity(8));
        cache.ensure_capacity(100);
        assert_eq!(cache.capacity(), 100);
        cache.ensure_capacity(10);
        assert_eq!(cache.capacity(), 100);
    }

    #[test]
    fn test_flush_queues_dirty_blocks() -> Result<()> {
        let (_dir, cache, store) = create_test_store(16)?;
        let block = store.allocate_row()?;
        let address = block.address();
        block.write_lock()?[7] = 77;
        drop(block);

        cache.flush(&store);
        assert!(store.writer().wait_for_complete(std::time::Duration::from_secs(10)));

        let mut byte = [0u8; 1];
        store.file_io().read(address + 7, &mut byte)?;
        assert_eq!(byte[0], 77);

        store.close()?;
        Ok(())
    }

    #[test]
    fn test_free_store_removes_blocks() -> Result<()> {
        let (_dir, cache, store) = create_test_store(16)?;
        let block = store.allocate_row()?;
        let inner = block.inner().clone();
        drop(block);
        assert!(cache.contains(inner.id()));

        cache.flush(&store);
        store.writer().wait_for_complete(std::time::Duration::from_secs(10));
        cache.free_store(&store);

        assert!(!cache.contains(inner.id()));
        assert!(inner.is_released());
        assert!(cache.is_empty());

        store.close()?;
        Ok(())
    }

    #[test]
    fn test_stores_do_not_share_blocks() -> Result<()> {
        let dir = tempdir()?;
        let cache = BlockCache::new(CacheConfig::with_capacity(32));
        let config = StoreConfig::default().sync_on_flush(false);
        let a = Store::open(&cache, dir.path().join("a.db"), config.clone())?;
        let b = Store::open(&cache, dir.path().join("b.db"), config)?;
        assert_ne!(a.id(), b.id());

        let address = a.allocate_row()?.address();
        assert_eq!(b.allocate_row()?.address(), address);
        assert_eq!(address, 2 * BLOCK_SIZE as u64);

        let block_a = a.write_block(address, 0, b"from a")?;
        let block_b = b.write_block(address, 0, b"from b")?;
        assert_ne!(block_a.id(), block_b.id());
        drop((block_a, block_b));

        let mut buf = [0u8; 6];
        a.read_block_bytes(address, 0, &mut buf)?;
        assert_eq!(&buf, b"from a");
        b.read_block_bytes(address, 0, &mut buf)?;
        assert_eq!(&buf, b"from b");

        a.close()?;
        b.close()?;
        Ok(())
    }
}
