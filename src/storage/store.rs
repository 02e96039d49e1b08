//! A single store file: block allocation, typed page IO and lifecycle.
//!
//! Every store shares the process-wide [`BlockCache`] and owns a
//! [`WriteBackQueue`] that flushes its dirty blocks. Cached blocks keep
//! their store alive, so a store must be [`close`](Store::close)d (or
//! [`remove`](Store::remove)d) to release its cache entries and its id.

pub mod allocation;
pub mod fragment;
pub mod header;

pub use allocation::{Allocation, AllocationTable};
pub use header::StoreHeader;

use crate::storage::block::BlockRef;
use crate::storage::buffer::BlockCache;
use crate::storage::config::StoreConfig;
use crate::storage::disk::FileIo;
use crate::storage::error::{StoreError, StoreResult};
use crate::storage::layout::{
    address_to_block_index, block_index_to_address, read_chars, read_long, write_chars,
    write_long, BlockId, ALLOC_BYTES_PER_BLOCK, ALLOC_CHUNK_SIZE, ALLOC_GROUP_COUNT,
    ALLOC_GROUP_SIZE, ALLOC_TABLE_BLOCK, BLOCK_SIZE, DATA_START, HEADER_BLOCK,
};
use crate::storage::writer::WriteBackQueue;
use parking_lot::Mutex;
use std::fmt;
use std::io::Write;
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

/// Scan-then-extend rounds before allocation gives up.
const MAX_ALLOC_RETRIES: usize = 64;

/// Files smaller than this grow one block at a time.
const EXTEND_THRESHOLD: u64 = 256;
const EXTEND_BLOCKS: u64 = 256;

/// At most one writer and one waiter persist the allocation table.
const MAX_ALLOC_WRITERS: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    New,
    Active,
    Closed,
}

/// Allocator state guarded by the store's allocation lock.
struct AllocState {
    block_count: u64,
    /// Scan cursor for free blocks.
    free_alloc_index: u64,
    /// Free blocks handed out since the cursor last wrapped.
    free_alloc_count: u64,
    /// Unsaved byte range of the table, `[dirty_min, dirty_max)`.
    dirty_min: usize,
    dirty_max: usize,
}

impl AllocState {
    fn new() -> Self {
        Self {
            block_count: 0,
            free_alloc_index: 0,
            free_alloc_count: 0,
            dirty_min: usize::MAX,
            dirty_max: 0,
        }
    }

    fn mark_dirty(&mut self, index: u64) {
        let offset = index as usize * ALLOC_BYTES_PER_BLOCK;
        self.dirty_min = self.dirty_min.min(offset);
        self.dirty_max = self.dirty_max.max(offset + ALLOC_BYTES_PER_BLOCK);
    }

    fn is_dirty(&self) -> bool {
        self.dirty_min < self.dirty_max
    }

    fn take_dirty(&mut self) -> Option<Range<usize>> {
        let range = self.dirty_min..self.dirty_max;
        self.dirty_min = usize::MAX;
        self.dirty_max = 0;
        (!range.is_empty()).then_some(range)
    }

    fn restore_dirty(&mut self, range: Range<usize>) {
        self.dirty_min = self.dirty_min.min(range.start);
        self.dirty_max = self.dirty_max.max(range.end);
    }
}

/// Decrements the allocation writer count on drop.
struct AllocWriterClaim<'a> {
    writers: &'a AtomicUsize,
    position: usize,
}

impl<'a> AllocWriterClaim<'a> {
    fn new(writers: &'a AtomicUsize) -> Self {
        let position = writers.fetch_add(1, Ordering::SeqCst);
        Self { writers, position }
    }

    fn is_claimed(&self) -> bool {
        self.position < MAX_ALLOC_WRITERS
    }
}

impl Drop for AllocWriterClaim<'_> {
    fn drop(&mut self) {
        self.writers.fetch_sub(1, Ordering::SeqCst);
    }
}

pub struct Store {
    name: String,
    id: u32,
    cache: BlockCache,
    config: StoreConfig,
    file_io: FileIo,
    writer: WriteBackQueue,
    table: AllocationTable,
    alloc: Mutex<AllocState>,
    /// Mirror of `AllocState::block_count` for lock-free readers.
    block_count: AtomicU64,
    alloc_writers: AtomicUsize,
    alloc_write_lock: Mutex<()>,
    free_mini_index: AtomicU64,
    free_mini_count: AtomicU64,
    mini_fragment_use_count: AtomicI64,
    lifecycle: Mutex<Lifecycle>,
    is_corrupted: AtomicBool,
}

impl Store {
    /// Creates an unopened store and reserves its id in `cache`.
    pub fn new(
        cache: &BlockCache,
        name: impl Into<String>,
        path: impl Into<PathBuf>,
        config: StoreConfig,
    ) -> StoreResult<Arc<Self>> {
        let id = cache.allocate_store_id()?;
        let name = name.into();

        Ok(Arc::new(Self {
            file_io: FileIo::new(path, config.file_io_concurrency, config.sync_on_flush),
            writer: WriteBackQueue::new(format!("{}:{}", name, id), &config),
            name,
            id,
            cache: cache.clone(),
            config,
            table: AllocationTable::new(),
            alloc: Mutex::new(AllocState::new()),
            block_count: AtomicU64::new(0),
            alloc_writers: AtomicUsize::new(0),
            alloc_write_lock: Mutex::new(()),
            free_mini_index: AtomicU64::new(0),
            free_mini_count: AtomicU64::new(0),
            mini_fragment_use_count: AtomicI64::new(0),
            lifecycle: Mutex::new(Lifecycle::New),
            is_corrupted: AtomicBool::new(false),
        }))
    }

    /// Opens the store at `path`, initializing from the file when it has
    /// contents and creating a fresh store otherwise.
    pub fn open(
        cache: &BlockCache,
        path: impl AsRef<Path>,
        config: StoreConfig,
    ) -> StoreResult<Arc<Self>> {
        let path = path.as_ref();
        let name = path
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_else(|| "store".to_string());

        let store = Self::new(cache, name, path, config)?;
        let has_contents = std::fs::metadata(path).map(|m| m.len() > 0).unwrap_or(false);

        let opened = if has_contents {
            store.init()
        } else {
            store.create()
        };

        if let Err(e) = opened {
            if let Err(close_err) = store.close() {
                log::warn!("{} close after failed open: {}", store, close_err);
            }
            return Err(e);
        }

        Ok(store)
    }

    /// Creates a fresh file with the allocation table and header blocks.
    pub fn create(&self) -> StoreResult<()> {
        let mut lifecycle = self.lifecycle.lock();
        if !self.begin_open(*lifecycle)? {
            return Ok(());
        }

        log::debug!("{} creating {:?}", self, self.file_io.path());
        self.file_io.create()?;

        {
            let mut state = self.alloc.lock();
            self.table.reset(ALLOC_GROUP_COUNT);
            self.set_allocation(&mut state, ALLOC_TABLE_BLOCK, Allocation::Used);
            self.set_allocation(&mut state, HEADER_BLOCK, Allocation::Used);
            state.block_count = HEADER_BLOCK + 1;
            state.free_alloc_index = 0;
            state.free_alloc_count = 0;
            // written in full below
            state.take_dirty();
            self.block_count.store(state.block_count, Ordering::SeqCst);
        }

        let mut header = vec![0u8; BLOCK_SIZE];
        let encoded = StoreHeader::new().encode()?;
        header[..encoded.len()].copy_from_slice(&encoded);

        self.file_io
            .write(block_index_to_address(ALLOC_TABLE_BLOCK), &self.table.to_bytes(0..ALLOC_CHUNK_SIZE))?;
        self.file_io
            .write(block_index_to_address(HEADER_BLOCK), &header)?;

        *lifecycle = Lifecycle::Active;
        Ok(())
    }

    /// Opens an existing file and loads its allocation table.
    pub fn init(&self) -> StoreResult<()> {
        let mut lifecycle = self.lifecycle.lock();
        if !self.begin_open(*lifecycle)? {
            return Ok(());
        }

        self.file_io.init()?;

        let file_size = self.file_io.file_size();
        let block_count = file_size.div_ceil(BLOCK_SIZE as u64);
        if block_count <= HEADER_BLOCK {
            return Err(StoreError::Corrupted(format!(
                "{} is only {} bytes",
                self, file_size
            )));
        }

        let mut page = vec![0u8; BLOCK_SIZE];
        self.file_io
            .read(block_index_to_address(HEADER_BLOCK), &mut page)?;
        StoreHeader::decode(&page)?;

        let groups = block_count.div_ceil(ALLOC_GROUP_COUNT) as usize;
        let mut bytes = vec![0u8; groups * ALLOC_CHUNK_SIZE];
        for (group, chunk) in bytes.chunks_mut(ALLOC_CHUNK_SIZE).enumerate() {
            self.file_io.read(group as u64 * ALLOC_GROUP_SIZE, chunk)?;
        }

        let loaded = AllocationTable::from_bytes(&bytes)?;
        {
            let mut state = self.alloc.lock();
            self.table.replace(loaded);

            // mini-fragment claims do not survive a restart
            for index in 0..self.table.len() {
                if let Some(Allocation::MiniFrag { mask }) = self.table.get(index) {
                    if mask != 0 {
                        self.table.set(index, Allocation::MiniFrag { mask: 0 });
                    }
                }
            }

            state.block_count = block_count;
            state.free_alloc_index = 0;
            state.free_alloc_count = 0;
            state.take_dirty();
            self.block_count.store(block_count, Ordering::SeqCst);
        }

        log::debug!("{} opened {} blocks", self, block_count);
        *lifecycle = Lifecycle::Active;
        Ok(())
    }

    /// Whether an open request should proceed from `lifecycle`.
    fn begin_open(&self, lifecycle: Lifecycle) -> StoreResult<bool> {
        match lifecycle {
            Lifecycle::New => Ok(true),
            Lifecycle::Active => Ok(false),
            Lifecycle::Closed => Err(StoreError::StoreClosed(self.to_string())),
        }
    }

    /// Flushes every dirty block, persists the allocation table and
    /// releases the store's cache entries and id. Closing twice is a no-op.
    pub fn close(self: &Arc<Self>) -> StoreResult<()> {
        let previous = std::mem::replace(&mut *self.lifecycle.lock(), Lifecycle::Closed);

        match previous {
            Lifecycle::Closed => return Ok(()),
            Lifecycle::New => {
                self.writer.discard();
                self.file_io.close();
                self.cache.free_store_id(self.id);
                return Ok(());
            }
            Lifecycle::Active => {}
        }

        log::debug!("{} closing", self);

        self.cache.flush(self);
        self.cache.free_store(self);

        if !self.writer.close(self.config.shutdown_timeout) {
            log::warn!("{} closed with unflushed blocks", self);
        }

        let saved = self.write_allocation().and_then(|()| self.file_io.sync());

        self.file_io.close();
        self.cache.free_store_id(self.id);
        saved
    }

    /// Closes the store without flushing and deletes its file.
    pub fn remove(self: &Arc<Self>) -> StoreResult<()> {
        let previous = std::mem::replace(&mut *self.lifecycle.lock(), Lifecycle::Closed);

        log::debug!("{} removing {:?}", self, self.file_io.path());

        if previous != Lifecycle::Closed {
            self.cache.discard_store(self);
            self.writer.discard();
        }

        let removed = self.file_io.remove();

        if previous != Lifecycle::Closed {
            self.cache.free_store_id(self.id);
        }
        removed
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn path(&self) -> &Path {
        self.file_io.path()
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn cache(&self) -> &BlockCache {
        &self.cache
    }

    pub fn writer(&self) -> &WriteBackQueue {
        &self.writer
    }

    pub fn file_io(&self) -> &FileIo {
        &self.file_io
    }

    pub fn lifecycle(&self) -> Lifecycle {
        *self.lifecycle.lock()
    }

    pub fn is_active(&self) -> bool {
        self.lifecycle() == Lifecycle::Active
    }

    fn assert_active(&self) -> StoreResult<()> {
        if self.is_active() {
            Ok(())
        } else {
            Err(StoreError::StoreClosed(self.to_string()))
        }
    }

    /// Reads the header block from the file.
    pub fn header(&self) -> StoreResult<StoreHeader> {
        self.assert_active()?;
        let mut page = vec![0u8; BLOCK_SIZE];
        self.file_io
            .read(block_index_to_address(HEADER_BLOCK), &mut page)?;
        StoreHeader::decode(&page)
    }

    pub fn set_corrupted(&self, corrupted: bool) {
        if corrupted {
            log::error!("{} marked corrupted", self);
        }
        self.is_corrupted.store(corrupted, Ordering::SeqCst);
    }

    pub fn is_corrupted(&self) -> bool {
        self.is_corrupted.load(Ordering::SeqCst)
    }

    pub fn block_count(&self) -> u64 {
        self.block_count.load(Ordering::SeqCst)
    }

    pub fn file_size(&self) -> u64 {
        self.file_io.file_size()
    }

    /// Checks that `block_id` names a block of this open store.
    pub fn validate_block_id(&self, block_id: BlockId) -> StoreResult<()> {
        self.assert_active()?;

        if block_id.store_id() != self.id {
            return Err(StoreError::BlockMismatch {
                expected: BlockId::from_address(self.id, block_id.address()),
                actual: block_id,
            });
        }

        let block_count = self.block_count();
        if block_id.index() >= block_count {
            return Err(StoreError::OutOfBounds {
                offset: block_id.index() as usize,
                length: 1,
                limit: block_count as usize,
            });
        }

        Ok(())
    }

    /// Queues every dirty cached block of this store for write-back.
    pub fn flush(self: &Arc<Self>) {
        if self.is_active() {
            self.cache.flush(self);
        }
    }

    /// Waits for queued writes to reach the file.
    pub fn wait_for_writes(&self, timeout: Duration) -> bool {
        self.writer.wait_for_complete(timeout)
    }

    // Block access

    /// Pins the block at `address` without loading its contents.
    pub fn load_block(self: &Arc<Self>, address: u64) -> StoreResult<BlockRef> {
        let block_id = BlockId::from_address(self.id, address);
        self.validate_block_id(block_id)?;
        Ok(BlockRef::new(self.cache.get_block(self, block_id)?))
    }

    /// Pins the block at `address`, loading it if needed.
    pub fn read_block(self: &Arc<Self>, address: u64) -> StoreResult<BlockRef> {
        let block = self.load_block(address)?;
        block.read()?;
        Ok(block)
    }

    // Allocation

    /// Allocates a zeroed row block.
    pub fn allocate_row(self: &Arc<Self>) -> StoreResult<BlockRef> {
        self.allocate_typed(Allocation::Row)
    }

    /// Allocates a zeroed block for internal use.
    pub fn allocate_block(self: &Arc<Self>) -> StoreResult<BlockRef> {
        self.allocate_typed(Allocation::Used)
    }

    pub fn allocate_index_block(self: &Arc<Self>) -> StoreResult<BlockRef> {
        self.allocate_typed(Allocation::Index)
    }

    /// Allocates a block, zero-fills it and marks it fully dirty.
    fn allocate_typed(self: &Arc<Self>, alloc: Allocation) -> StoreResult<BlockRef> {
        self.assert_active()?;

        let index = self.find_or_extend()?;

        let block = match self.init_new_block(index) {
            Ok(block) => block,
            Err(e) => {
                self.set_allocation_locked(index, Allocation::Free);
                return Err(e);
            }
        };

        self.set_allocation_locked(index, alloc);
        self.save_allocation()?;

        Ok(block)
    }

    fn init_new_block(self: &Arc<Self>, index: u64) -> StoreResult<BlockRef> {
        let block_id = BlockId::new(self.id, index);
        let block = BlockRef::new(self.cache.get_block(self, block_id)?);

        {
            let mut page = block.write_lock()?;
            page.fill(0);
            block.set_dirty(0, BLOCK_SIZE);
        }
        block.validate();

        Ok(block)
    }

    fn find_or_extend(&self) -> StoreResult<u64> {
        for _ in 0..MAX_ALLOC_RETRIES {
            if let Some(index) = self.find_free_block() {
                return Ok(index);
            }
            self.extend_file()?;
        }

        log::error!("{} no free block after {} attempts", self, MAX_ALLOC_RETRIES);
        Err(StoreError::AllocationRetriesExceeded(MAX_ALLOC_RETRIES))
    }

    /// Scans from the cursor for a free block and reserves it as used.
    ///
    /// On reaching the end, the cursor wraps to the start if anything was
    /// found since the last wrap; otherwise it parks at the end of the file
    /// to request an extension.
    fn find_free_block(&self) -> Option<u64> {
        let mut state = self.alloc.lock();
        let end = state.block_count.min(self.table.len());

        for index in state.free_alloc_index..end {
            if self.table.get(index) == Some(Allocation::Free) {
                state.free_alloc_index = index;
                state.free_alloc_count += 1;
                self.set_allocation(&mut state, index, Allocation::Used);
                return Some(index);
            }
        }

        if state.free_alloc_count > 0 {
            state.free_alloc_index = 0;
            state.free_alloc_count = 0;
        } else {
            state.free_alloc_index = state.block_count;
        }

        None
    }

    /// Grows the file. Small files grow by one block, larger ones by
    /// `EXTEND_BLOCKS`.
    ///
    /// Runs under the allocation lock: the new table chunks and the last
    /// block reach the file before the new block count is published, so no
    /// block of a new group is handed out ahead of its table chunk.
    fn extend_file(&self) -> StoreResult<()> {
        {
            let mut state = self.alloc.lock();

            // another thread extended or the cursor wrapped
            if state.free_alloc_index < state.block_count {
                return Ok(());
            }

            let old_count = state.block_count;
            let grow = if old_count < EXTEND_THRESHOLD {
                1
            } else {
                EXTEND_BLOCKS
            };
            let new_count = old_count + grow;

            let first_group = old_count.div_ceil(ALLOC_GROUP_COUNT);
            let last_group = (new_count - 1) / ALLOC_GROUP_COUNT;
            self.table.grow((last_group + 1) * ALLOC_GROUP_COUNT);

            for group in first_group..=last_group {
                let group_start = group * ALLOC_GROUP_COUNT;
                self.set_allocation(&mut state, group_start, Allocation::Used);

                let offset = group_start as usize * ALLOC_BYTES_PER_BLOCK;
                let chunk = self.table.to_bytes(offset..offset + ALLOC_CHUNK_SIZE);
                self.file_io
                    .write(block_index_to_address(group_start), &chunk)?;
            }

            let last = new_count - 1;
            if last % ALLOC_GROUP_COUNT != 0 {
                let zeros = vec![0u8; BLOCK_SIZE];
                self.file_io.write(block_index_to_address(last), &zeros)?;
            }

            state.block_count = new_count;
            state.free_alloc_index = old_count;
            state.free_alloc_count = 0;
            self.block_count.store(new_count, Ordering::SeqCst);

            log::debug!("{} extended from {} to {} blocks", self, old_count, new_count);
        }

        self.save_allocation()
    }

    /// Returns a block to the free pool.
    pub fn free_block(&self, block_id: BlockId) -> StoreResult<()> {
        if block_id.address() == 0 {
            return Ok(());
        }

        if block_id.store_id() != self.id {
            return Err(StoreError::BlockMismatch {
                expected: BlockId::from_address(self.id, block_id.address()),
                actual: block_id,
            });
        }

        let index = block_id.index();
        {
            let mut state = self.alloc.lock();

            match self.table.get(index) {
                None => {
                    return Err(StoreError::OutOfBounds {
                        offset: index as usize,
                        length: 1,
                        limit: self.table.len() as usize,
                    })
                }
                Some(Allocation::Free) => {
                    log::error!("{} double free of {}", self, block_id);
                    return Err(StoreError::DoubleFree {
                        store: self.to_string(),
                        block_id,
                    });
                }
                Some(alloc) if is_reserved_block(index) => {
                    log::error!("{} refusing to free reserved block {}", self, index);
                    return Err(StoreError::AllocationMismatch {
                        index,
                        expected: "row".to_string(),
                        actual: alloc.to_string(),
                    });
                }
                Some(_) => self.set_allocation(&mut state, index, Allocation::Free),
            }
        }

        self.save_allocation()
    }

    /// Allocation of block `index`, or `None` past the end of the table.
    pub fn allocation(&self, index: u64) -> Option<Allocation> {
        self.table.get(index)
    }

    /// A copy of the allocation of every block in the file.
    pub fn allocation_table(&self) -> Vec<Allocation> {
        let mut table = self.table.snapshot();
        table.truncate(self.block_count() as usize);
        table
    }

    pub fn is_row_block(&self, address: u64) -> bool {
        self.allocation(address_to_block_index(address)) == Some(Allocation::Row)
    }

    pub fn is_index_block(&self, address: u64) -> bool {
        self.allocation(address_to_block_index(address)) == Some(Allocation::Index)
    }

    /// Address of the first block at or after `from_address` with the same
    /// allocation code as `kind`.
    pub fn first_block(&self, from_address: u64, kind: Allocation) -> Option<u64> {
        let start = address_to_block_index(from_address.max(DATA_START));
        (start..self.block_count())
            .find(|&index| {
                self.table
                    .get(index)
                    .is_some_and(|alloc| alloc.code() == kind.code())
            })
            .map(block_index_to_address)
    }

    pub fn first_row_block(&self, from_address: u64) -> Option<u64> {
        self.first_block(from_address, Allocation::Row)
    }

    fn set_allocation(&self, state: &mut AllocState, index: u64, alloc: Allocation) {
        self.table.set(index, alloc);
        state.mark_dirty(index);
    }

    fn set_allocation_locked(&self, index: u64, alloc: Allocation) {
        let mut state = self.alloc.lock();
        self.set_allocation(&mut state, index, alloc);
    }

    /// Persists allocation changes.
    ///
    /// One caller writes while at most one more waits to write whatever
    /// accumulates meanwhile; further callers return at once, since the
    /// waiting writer will pick up their changes.
    pub fn save_allocation(&self) -> StoreResult<()> {
        if !self.config.flush_dirty_blocks_on_commit || !self.alloc.lock().is_dirty() {
            return Ok(());
        }

        let claim = AllocWriterClaim::new(&self.alloc_writers);
        if !claim.is_claimed() {
            return Ok(());
        }

        self.write_allocation()
    }

    fn write_allocation(&self) -> StoreResult<()> {
        let _writer = self.alloc_write_lock.lock();

        let Some(range) = self.alloc.lock().take_dirty() else {
            return Ok(());
        };

        if let Err(e) = self.write_table_range(range.clone()) {
            self.alloc.lock().restore_dirty(range);
            return Err(e);
        }

        Ok(())
    }

    /// Writes a byte range of the table, one write per chunk it touches.
    fn write_table_range(&self, range: Range<usize>) -> StoreResult<()> {
        let bytes = self.table.to_bytes(range.clone());
        let mut offset = range.start;

        while offset < range.end {
            let chunk = offset / ALLOC_CHUNK_SIZE;
            let end = ((chunk + 1) * ALLOC_CHUNK_SIZE).min(range.end);
            let address = chunk as u64 * ALLOC_GROUP_SIZE + (offset % ALLOC_CHUNK_SIZE) as u64;

            self.file_io
                .write(address, &bytes[offset - range.start..end - range.start])?;
            offset = end;
        }

        Ok(())
    }

    // Typed block IO

    pub fn read_block_bytes(
        self: &Arc<Self>,
        address: u64,
        offset: usize,
        buf: &mut [u8],
    ) -> StoreResult<usize> {
        check_range(offset, buf.len(), BLOCK_SIZE)?;
        let block = self.read_block(address)?;
        let page = block.read_lock()?;
        buf.copy_from_slice(&page[offset..offset + buf.len()]);
        Ok(buf.len())
    }

    /// Streams `length` bytes of a block into `out`.
    pub fn read_block_to(
        self: &Arc<Self>,
        address: u64,
        offset: usize,
        length: usize,
        out: &mut impl Write,
    ) -> StoreResult<()> {
        check_range(offset, length, BLOCK_SIZE)?;
        let block = self.read_block(address)?;
        let page = block.read_lock()?;
        out.write_all(&page[offset..offset + length])?;
        Ok(())
    }

    pub fn read_block_chars(
        self: &Arc<Self>,
        address: u64,
        offset: usize,
        chars: &mut [u16],
    ) -> StoreResult<usize> {
        check_range(offset, 2 * chars.len(), BLOCK_SIZE)?;
        let block = self.read_block(address)?;
        let page = block.read_lock()?;
        read_chars(&page[..], offset, chars);
        Ok(chars.len())
    }

    pub fn read_block_long(self: &Arc<Self>, address: u64, offset: usize) -> StoreResult<i64> {
        check_range(offset, 8, BLOCK_SIZE)?;
        let block = self.read_block(address)?;
        let page = block.read_lock()?;
        Ok(read_long(&page[..], offset))
    }

    /// Writes `data` into a block and returns it, dirty, for the caller to
    /// commit.
    pub fn write_block(
        self: &Arc<Self>,
        address: u64,
        offset: usize,
        data: &[u8],
    ) -> StoreResult<BlockRef> {
        self.modify_block(address, offset, data.len(), |dest| dest.copy_from_slice(data))
    }

    pub fn write_block_chars(
        self: &Arc<Self>,
        address: u64,
        offset: usize,
        chars: &[u16],
    ) -> StoreResult<BlockRef> {
        self.modify_block(address, offset, 2 * chars.len(), |dest| {
            write_chars(dest, 0, chars)
        })
    }

    pub fn write_block_long(
        self: &Arc<Self>,
        address: u64,
        offset: usize,
        value: i64,
    ) -> StoreResult<BlockRef> {
        self.modify_block(address, offset, 8, |dest| write_long(dest, 0, value))
    }

    fn modify_block(
        self: &Arc<Self>,
        address: u64,
        offset: usize,
        length: usize,
        modify: impl FnOnce(&mut [u8]),
    ) -> StoreResult<BlockRef> {
        check_range(offset, length, BLOCK_SIZE)?;
        let block = self.read_block(address)?;

        {
            let mut page = block.write_lock()?;
            modify(&mut page[offset..offset + length]);
            block.set_dirty(offset, offset + length);
        }

        Ok(block)
    }
}

/// Blocks the store keeps for itself: the header and every table chunk.
fn is_reserved_block(index: u64) -> bool {
    index == HEADER_BLOCK || index % ALLOC_GROUP_COUNT == 0
}

fn check_range(offset: usize, length: usize, limit: usize) -> StoreResult<()> {
    match offset.checked_add(length) {
        Some(end) if end <= limit => Ok(()),
        _ => Err(StoreError::OutOfBounds {
            offset,
            length,
            limit,
        }),
    }
}

impl fmt::Display for Store {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Store[{}:{}]", self.name, self.id)
    }
}

impl fmt::Debug for Store {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Store")
            .field("name", &self.name)
            .field("id", &self.id)
            .field("path", &self.file_io.path())
            .field("block_count", &self.block_count())
            .field("lifecycle", &self.lifecycle())
            .finish()
    }
}
