//! In-memory representation of one on-disk page.
//!
//! A `Block` owns a pooled page buffer for as long as it is live. Its
//! use-count includes the cache's own reference, so a block sitting idle in
//! the cache has a count of 1 and every caller pin adds one. When the count
//! reaches 0 the buffer goes back to the pool, unless a flush is still
//! queued, in which case the writer releases it after the flush. A released
//! block has a count of -1 and is never reused.

use crate::storage::buffer::pool::{BufferPool, PageBuffer};
use crate::storage::error::{StoreError, StoreResult};
use crate::storage::layout::{BlockId, BLOCK_SIZE};
use crate::storage::store::Store;
use parking_lot::{
    MappedRwLockReadGuard, MappedRwLockWriteGuard, Mutex, RwLock, RwLockReadGuard,
    RwLockWriteGuard,
};
use std::fmt;
use std::ops::Deref;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, Ordering};

/// Use-count of a block whose buffer went back to the pool.
const RELEASED: i32 = -1;

/// Packed dirty range meaning "nothing to flush".
const CLEAN: u64 = pack_range(u32::MAX, 0);

const fn pack_range(min: u32, max: u32) -> u64 {
    ((min as u64) << 32) | max as u64
}

const fn unpack_range(packed: u64) -> (u32, u32) {
    ((packed >> 32) as u32, packed as u32)
}

pub type BlockReadGuard<'a> = MappedRwLockReadGuard<'a, [u8; BLOCK_SIZE]>;
pub type BlockWriteGuard<'a> = MappedRwLockWriteGuard<'a, [u8; BLOCK_SIZE]>;

pub struct Block {
    store: Arc<Store>,
    id: BlockId,
    pool: BufferPool,
    data: RwLock<Option<PageBuffer>>,
    use_count: AtomicI32,
    dirty: AtomicU64,
    is_valid: AtomicBool,
    is_write_queued: AtomicBool,
    is_deallocate: AtomicBool,
    load_lock: Mutex<()>,
}

impl Block {
    /// Creates a block holding the cache's reference (use-count 1).
    pub(crate) fn new(store: Arc<Store>, id: BlockId, pool: BufferPool) -> Self {
        let buffer = pool.get();

        Self {
            store,
            id,
            pool,
            data: RwLock::new(Some(buffer)),
            use_count: AtomicI32::new(1),
            dirty: AtomicU64::new(CLEAN),
            is_valid: AtomicBool::new(false),
            is_write_queued: AtomicBool::new(false),
            is_deallocate: AtomicBool::new(false),
            load_lock: Mutex::new(()),
        }
    }

    pub fn id(&self) -> BlockId {
        self.id
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    pub fn use_count(&self) -> i32 {
        self.use_count.load(Ordering::SeqCst)
    }

    pub fn is_released(&self) -> bool {
        self.use_count() == RELEASED
    }

    pub fn is_valid(&self) -> bool {
        self.is_valid.load(Ordering::SeqCst)
    }

    pub fn is_write_queued(&self) -> bool {
        self.is_write_queued.load(Ordering::SeqCst)
    }

    /// Pins the block for a caller.
    ///
    /// Fails once the count has dropped below 1: the block is being evicted
    /// or is already released, and the caller must retry with a fresh block.
    pub(crate) fn allocate(&self) -> bool {
        let mut count = self.use_count.load(Ordering::SeqCst);
        loop {
            if count < 1 {
                return false;
            }
            match self.use_count.compare_exchange_weak(
                count,
                count + 1,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return true,
                Err(actual) => count = actual,
            }
        }
    }

    /// Drops one pin. When only the cache still holds a block marked for
    /// deallocation, its allocation slot is freed.
    pub(crate) fn free(self: &Arc<Self>) {
        let Some(count) = self.unpin() else {
            return;
        };

        if count < 2 && self.is_deallocate.swap(false, Ordering::SeqCst) {
            self.invalidate();
            if let Err(e) = self.store.free_block(self.id) {
                log::error!("{} deallocate of {} failed: {}", self.store, self.id, e);
            }
        }
    }

    /// Decrements the use-count, returning the new count.
    fn unpin(self: &Arc<Self>) -> Option<i32> {
        let mut count = self.use_count.load(Ordering::SeqCst);
        loop {
            if count <= 0 {
                log::error!("{} freed with use-count {}", self, count);
                return None;
            }
            match self.use_count.compare_exchange_weak(
                count,
                count - 1,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => break,
                Err(actual) => count = actual,
            }
        }

        let count = count - 1;
        if count == 0 {
            self.release_if_idle();
        }
        Some(count)
    }

    /// Called once the use-count is 0. A queued write keeps the buffer
    /// alive until the writer finishes; a dirty block is queued first.
    fn release_if_idle(self: &Arc<Self>) {
        if self.is_write_queued() {
            return;
        }

        if self.is_dirty() {
            self.store.writer().add_dirty_block(self.clone());
            return;
        }

        self.release_buffer();
    }

    /// Returns the buffer to the pool. Only one caller wins the 0 -> -1
    /// transition.
    fn release_buffer(&self) -> bool {
        if self
            .use_count
            .compare_exchange(0, RELEASED, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return false;
        }

        self.is_valid.store(false, Ordering::SeqCst);
        if let Some(buffer) = self.data.write().take() {
            self.pool.put(buffer);
        }
        true
    }

    /// Loads the page unless it is already valid.
    ///
    /// A copy still waiting in the write-back queue wins over the file, so
    /// a reader always sees the newest bytes even before they hit disk.
    pub fn read(self: &Arc<Self>) -> StoreResult<()> {
        if self.is_valid() {
            return Ok(());
        }

        let _load = self.load_lock.lock();

        if self.is_valid() {
            return Ok(());
        }

        if !self.store.writer().copy_dirty_block(self.id, self) {
            let mut data = self.write_lock()?;
            let address = self.id.address();
            let read = self.store.file_io().read(address, &mut data[..])?;

            if read < BLOCK_SIZE {
                return Err(StoreError::ShortRead {
                    address,
                    expected: BLOCK_SIZE,
                    actual: read,
                });
            }
        }

        self.is_valid.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Drops a block that lost the race to enter the cache. Nobody else
    /// has seen it, so its buffer goes straight back to the pool.
    pub(crate) fn discard(&self) {
        if self
            .use_count
            .compare_exchange(1, 0, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            self.release_buffer();
        }
    }

    /// The writer dropped this block without flushing it.
    pub(crate) fn cancel_write(&self) {
        self.is_write_queued.store(false, Ordering::SeqCst);
        if self.use_count() == 0 {
            self.release_buffer();
        }
    }

    /// Marks the buffer contents as loaded without reading the file.
    pub(crate) fn validate(&self) {
        self.is_valid.store(true, Ordering::SeqCst);
    }

    /// Forgets the loaded contents and any unflushed changes.
    pub(crate) fn invalidate(&self) {
        let _load = self.load_lock.lock();
        self.is_valid.store(false, Ordering::SeqCst);
        self.dirty.store(CLEAN, Ordering::SeqCst);
    }

    /// Requests that the allocation slot be freed once the last caller
    /// releases the block.
    pub fn deallocate(&self) {
        self.is_deallocate.store(true, Ordering::SeqCst);
    }

    pub fn read_lock(&self) -> StoreResult<BlockReadGuard<'_>> {
        let timeout = self.store.config().lock_timeout;
        let guard = self
            .data
            .try_read_for(timeout)
            .ok_or(StoreError::LockTimeout {
                block_id: self.id,
                timeout,
            })?;

        RwLockReadGuard::try_map(guard, |data| data.as_deref())
            .map_err(|_| StoreError::BufferReleased(self.id))
    }

    pub fn write_lock(&self) -> StoreResult<BlockWriteGuard<'_>> {
        let timeout = self.store.config().lock_timeout;
        let guard = self
            .data
            .try_write_for(timeout)
            .ok_or(StoreError::LockTimeout {
                block_id: self.id,
                timeout,
            })?;

        RwLockWriteGuard::try_map(guard, |data| data.as_deref_mut())
            .map_err(|_| StoreError::BufferReleased(self.id))
    }

    /// Widens the dirty range to cover `[min, max)`.
    pub fn set_dirty(&self, min: usize, max: usize) {
        debug_assert!(min <= max && max <= BLOCK_SIZE);
        if min >= max {
            return;
        }
        let (min, max) = (min as u32, max as u32);

        let _ = self
            .dirty
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |packed| {
                let (old_min, old_max) = unpack_range(packed);
                let widened = pack_range(old_min.min(min), old_max.max(max));
                (widened != packed).then_some(widened)
            });
    }

    /// The pending `[min, max)` range, if any.
    pub fn dirty_range(&self) -> Option<(usize, usize)> {
        let (min, max) = unpack_range(self.dirty.load(Ordering::SeqCst));
        (min < max).then_some((min as usize, max as usize))
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty_range().is_some()
    }

    /// Hands a dirty block to the store's writer.
    pub fn commit(self: &Arc<Self>) {
        if self.store.config().flush_dirty_blocks_on_commit && self.is_dirty() {
            self.store.writer().add_dirty_block(self.clone());
        }
    }

    /// Claims the queued-write flag. False if the block is already queued.
    pub(crate) fn mark_write_queued(&self) -> bool {
        self.is_write_queued
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Flushes the dirty range; only the write-back worker calls this.
    ///
    /// The range is taken and cleared before the write, so changes landing
    /// mid-flush leave the block dirty again and are picked up by the next
    /// pass of the loop. A failed write restores the range and keeps the
    /// block queued.
    pub(crate) fn write_from_queue(self: &Arc<Self>) -> StoreResult<()> {
        loop {
            let (min, max) = unpack_range(self.dirty.swap(CLEAN, Ordering::SeqCst));

            if min < max {
                if let Err(e) = self.write_range(min as usize, max as usize) {
                    self.set_dirty(min as usize, max as usize);
                    return Err(e);
                }
                continue;
            }

            self.is_write_queued.store(false, Ordering::SeqCst);

            // dirtied after the last pass but the producer saw us queued
            if self.is_dirty() && self.mark_write_queued() {
                continue;
            }
            break;
        }

        if self.use_count() == 0 {
            self.release_buffer();
        }

        Ok(())
    }

    fn write_range(&self, min: usize, max: usize) -> StoreResult<()> {
        let data = self.read_lock()?;
        self.store
            .file_io()
            .write(self.id.address() + min as u64, &data[min..max])
    }

    /// Copies this block's page into `target`.
    ///
    /// The source is pinned for the duration of the copy, so a block the
    /// writer is about to release stays intact. Returns false if the source
    /// has already released its buffer.
    pub(crate) fn copy_to_block(self: &Arc<Self>, target: &Block) -> bool {
        if std::ptr::eq(self.as_ref(), target) {
            return true;
        }

        let mut count = self.use_count.load(Ordering::SeqCst);
        loop {
            if count < 0 {
                return false;
            }
            match self.use_count.compare_exchange_weak(
                count,
                count + 1,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => break,
                Err(actual) => count = actual,
            }
        }

        let copied = self.is_valid() && self.copy_page(target).is_ok();

        self.unpin();
        copied
    }

    fn copy_page(&self, target: &Block) -> StoreResult<()> {
        let source = self.read_lock()?;
        let mut dest = target.write_lock()?;
        dest.copy_from_slice(&source[..]);
        Ok(())
    }

    /// The cache asks to evict this block.
    ///
    /// A dirty block is queued for flush first. Eviction is granted only if
    /// no caller holds a pin, by moving the count from 1 to 0.
    pub(crate) fn start_lru_remove(self: &Arc<Self>) -> bool {
        if self.use_count() != 1 {
            return false;
        }

        if self.is_dirty() {
            self.store.writer().add_dirty_block(self.clone());
        }

        self.use_count
            .compare_exchange(1, 0, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// The cache evicted this block after `start_lru_remove` succeeded.
    pub(crate) fn sync_lru_remove_event(self: &Arc<Self>) {
        self.release_if_idle();
    }

    /// The cache dropped this block without the eviction handshake, e.g.
    /// when its store is being freed.
    pub(crate) fn sync_remove_event(self: &Arc<Self>) {
        self.unpin();
    }
}

impl fmt::Display for Block {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Block[{},{}]", self.store, self.id)
    }
}

impl fmt::Debug for Block {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Block")
            .field("id", &self.id)
            .field("use_count", &self.use_count())
            .field("dirty", &self.dirty_range())
            .field("valid", &self.is_valid())
            .field("write_queued", &self.is_write_queued())
            .finish()
    }
}

/// A caller's pin on a block, released on drop.
pub struct BlockRef {
    block: Arc<Block>,
}

impl BlockRef {
    /// Wraps a block that has already been pinned for this caller.
    pub(crate) fn new(block: Arc<Block>) -> Self {
        Self { block }
    }

    pub fn address(&self) -> u64 {
        self.block.id.address()
    }

    /// Loads the page if needed; see [`Block::read`].
    pub fn read(&self) -> StoreResult<()> {
        self.block.read()
    }

    /// Hands the block to the writer if it has unflushed changes.
    pub fn commit(&self) {
        self.block.commit();
    }

    pub(crate) fn inner(&self) -> &Arc<Block> {
        &self.block
    }
}

impl Deref for BlockRef {
    type Target = Block;

    fn deref(&self) -> &Block {
        &self.block
    }
}

impl Drop for BlockRef {
    fn drop(&mut self) {
        self.block.free();
    }
}

impl fmt::Debug for BlockRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.block.fmt(f)
    }
}
