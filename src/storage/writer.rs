//! Asynchronous write-back of dirty blocks.
//!
//! Each store owns one queue drained by a dedicated worker thread. Blocks
//! are flushed in FIFO order, while `copy_dirty_block` searches newest
//! first so a reader always observes the latest queued version of a page.

use crate::storage::block::Block;
use crate::storage::config::StoreConfig;
use crate::storage::layout::BlockId;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

pub struct WriteBackQueue {
    name: String,
    shared: Arc<QueueShared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

struct QueueShared {
    state: Mutex<QueueState>,
    /// Wakes the worker.
    work_available: Condvar,
    /// Wakes throttled producers and `wait_for_complete` callers.
    progress: Condvar,
    capacity: usize,
    backpressure_timeout: Duration,
    idle_retries: usize,
    idle_interval: Duration,
    retry_delay: Duration,
}

#[derive(Default)]
struct QueueState {
    blocks: VecDeque<Arc<Block>>,
    is_closed: bool,
    /// Set when close gave up waiting; the worker exits without draining.
    is_abandoned: bool,
}

impl WriteBackQueue {
    pub fn new(name: impl Into<String>, config: &StoreConfig) -> Self {
        Self {
            name: name.into(),
            shared: Arc::new(QueueShared {
                state: Mutex::new(QueueState::default()),
                work_available: Condvar::new(),
                progress: Condvar::new(),
                capacity: config.writer_queue_capacity,
                backpressure_timeout: config.writer_backpressure_timeout,
                idle_retries: config.writer_idle_retries,
                idle_interval: config.writer_idle_interval,
                retry_delay: config.writer_retry_delay,
            }),
            worker: Mutex::new(None),
        }
    }

    pub fn len(&self) -> usize {
        self.shared.state.lock().blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Queues a block for flushing. A block already queued is left where
    /// it is; its flush picks up the latest dirty range.
    ///
    /// When the queue is at capacity the producer waits, bounded by the
    /// backpressure timeout, for the worker to make room.
    pub fn add_dirty_block(&self, block: Arc<Block>) {
        if !block.mark_write_queued() {
            return;
        }

        let mut state = self.shared.state.lock();

        if state.is_closed {
            drop(state);
            log::warn!("{} closed, flushing {} inline", self.name, block);
            if let Err(e) = block.write_from_queue() {
                log::error!("{} inline flush of {} failed: {}", self.name, block, e);
            }
            return;
        }

        if state.blocks.len() >= self.shared.capacity {
            log::debug!(
                "{} full ({} blocks), throttling producer",
                self.name,
                state.blocks.len()
            );
            self.shared.work_available.notify_one();
            self.shared
                .progress
                .wait_for(&mut state, self.shared.backpressure_timeout);
        }

        state.blocks.push_back(block);
        self.shared.work_available.notify_one();
        drop(state);

        self.ensure_worker();
    }

    /// Copies the newest queued version of `block_id` into `target`.
    /// Returns false if no in-flight copy exists.
    pub fn copy_dirty_block(&self, block_id: BlockId, target: &Arc<Block>) -> bool {
        let source = {
            let state = self.shared.state.lock();
            state
                .blocks
                .iter()
                .rev()
                .find(|block| block.id() == block_id && !Arc::ptr_eq(block, target))
                .cloned()
        };

        match source {
            Some(source) => source.copy_to_block(target),
            None => false,
        }
    }

    /// Blocks until the queue drains or `timeout` elapses. Returns true if
    /// the queue is empty.
    pub fn wait_for_complete(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.shared.state.lock();

        while !state.blocks.is_empty() {
            if self
                .shared
                .progress
                .wait_until(&mut state, deadline)
                .timed_out()
            {
                return state.blocks.is_empty();
            }
        }

        true
    }

    /// Stops accepting work and drains the queue, giving up after
    /// `timeout`. Returns true if everything was flushed.
    pub fn close(&self, timeout: Duration) -> bool {
        {
            let mut state = self.shared.state.lock();
            state.is_closed = true;
            self.shared.work_available.notify_all();
        }

        let drained = self.wait_for_complete(timeout);

        if !drained {
            log::warn!(
                "{} abandoning {} unflushed blocks after {:?}",
                self.name,
                self.len(),
                timeout
            );
            self.abandon();
        }

        self.join_worker();
        drained
    }

    /// Stops the queue and drops pending writes without flushing them.
    pub fn discard(&self) {
        self.abandon();
        self.join_worker();
    }

    fn abandon(&self) {
        let blocks = {
            let mut state = self.shared.state.lock();
            state.is_closed = true;
            state.is_abandoned = true;
            self.shared.work_available.notify_all();
            self.shared.progress.notify_all();
            std::mem::take(&mut state.blocks)
        };

        for block in blocks {
            block.cancel_write();
        }
    }

    fn join_worker(&self) {
        if let Some(handle) = self.worker.lock().take() {
            if handle.join().is_err() {
                log::error!("{} worker panicked", self.name);
            }
        }
    }

    fn ensure_worker(&self) {
        let mut worker = self.worker.lock();
        if worker.is_some() {
            return;
        }

        let shared = self.shared.clone();
        let name = self.name.clone();
        match thread::Builder::new()
            .name(format!("writer-{}", self.name))
            .spawn(move || run_worker(&name, &shared))
        {
            Ok(handle) => *worker = Some(handle),
            Err(e) => log::error!("{} failed to start writer: {}", self.name, e),
        }
    }
}

impl Drop for WriteBackQueue {
    fn drop(&mut self) {
        let mut state = self.shared.state.lock();
        state.is_closed = true;
        self.shared.work_available.notify_all();
    }
}

fn run_worker(name: &str, shared: &QueueShared) {
    log::debug!("{} worker started", name);
    let mut idle = 0;

    loop {
        let block = {
            let mut state = shared.state.lock();
            loop {
                if state.is_abandoned {
                    shared.progress.notify_all();
                    return;
                }
                if let Some(block) = state.blocks.front() {
                    break block.clone();
                }
                if state.is_closed {
                    shared.progress.notify_all();
                    log::debug!("{} worker stopped", name);
                    return;
                }

                if idle < shared.idle_retries {
                    idle += 1;
                    shared
                        .work_available
                        .wait_for(&mut state, shared.idle_interval);
                } else {
                    shared.work_available.wait(&mut state);
                }
            }
        };
        idle = 0;

        let result = block.write_from_queue();

        match result {
            Ok(()) => {
                let mut state = shared.state.lock();
                if state.is_abandoned {
                    continue;
                }
                if state
                    .blocks
                    .front()
                    .is_some_and(|head| Arc::ptr_eq(head, &block))
                {
                    state.blocks.pop_front();
                }
                shared.progress.notify_all();
            }
            Err(e) => {
                // stays at the head so no newer version of the page can
                // reach the file before it
                log::error!("{} flush of {} failed, will retry: {}", name, block, e);
                thread::sleep(shared.retry_delay);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::buffer::BlockCache;
    use crate::storage::config::CacheConfig;
    use crate::storage::layout::BLOCK_SIZE;
    use crate::storage::store::Store;
    use anyhow::Result;
    use tempfile::{tempdir, TempDir};

    fn test_store(config: StoreConfig) -> Result<(TempDir, BlockCache, Arc<Store>)> {
        let dir = tempdir()?;
        let cache = BlockCache::new(CacheConfig::with_capacity(64));
        let store = Store::open(&cache, dir.path().join("test.db"), config.sync_on_flush(false))?;
        Ok((dir, cache, store))
    }

    /// Queues a block without starting the worker.
    fn park(queue: &WriteBackQueue, block: &Arc<Block>) {
        assert!(block.mark_write_queued());
        queue.shared.state.lock().blocks.push_back(block.clone());
    }

    #[test]
    fn test_add_dirty_block_flushes() -> Result<()> {
        let (_dir, _cache, store) = test_store(StoreConfig::default())?;
        let block = store.allocate_row()?;
        let address = block.address();
        {
            let mut data = block.write_lock()?;
            data[0..3].copy_from_slice(b"abc");
        }
        block.set_dirty(0, 3);
        block.commit();

        assert!(store.writer().wait_for_complete(Duration::from_secs(10)));
        assert!(!block.is_dirty());
        assert!(!block.is_write_queued());

        let mut on_disk = [0u8; 3];
        store.file_io().read(address, &mut on_disk)?;
        assert_eq!(&on_disk, b"abc");

        drop(block);
        store.close()?;
        Ok(())
    }

    #[test]
    fn test_duplicate_add_is_noop() -> Result<()> {
        let (_dir, _cache, store) = test_store(StoreConfig::default())?;
        let queue = WriteBackQueue::new("test", &StoreConfig::default());
        let block = store.allocate_row()?;

        park(&queue, block.inner());
        queue.add_dirty_block(block.inner().clone());
        assert_eq!(queue.len(), 1);

        queue.discard();
        drop(block);
        store.close()?;
        Ok(())
    }

    #[test]
    fn test_copy_dirty_block_prefers_newest() -> Result<()> {
        let (_dir, cache, store) = test_store(StoreConfig::default())?;
        let queue = WriteBackQueue::new("test", &StoreConfig::default());

        let first = store.allocate_row()?;
        let id = first.id();
        first.write_lock()?.fill(1);
        park(&queue, first.inner());

        // a second in-flight version of the same page
        let second = Arc::new(Block::new(store.clone(), id, cache.buffer_pool()));
        second.write_lock()?.fill(2);
        second.validate();
        park(&queue, &second);

        let target = Arc::new(Block::new(store.clone(), id, cache.buffer_pool()));
        assert!(queue.copy_dirty_block(id, &target));
        assert!(target.read_lock()?.iter().all(|&b| b == 2));

        let other = Arc::new(Block::new(store.clone(), BlockId(id.0 + BLOCK_SIZE as u64), cache.buffer_pool()));
        assert!(!queue.copy_dirty_block(other.id(), &other));

        queue.discard();
        drop(first);
        store.close()?;
        Ok(())
    }

    #[test]
    fn test_failed_flush_retries_in_order() -> Result<()> {
        let config = StoreConfig::default()
            .lock_timeout(Duration::from_millis(30))
            .writer_retry_delay(Duration::from_millis(10));
        let (_dir, cache, store) = test_store(config.clone())?;
        let queue = WriteBackQueue::new("test", &config);

        let older = store.allocate_row()?;
        let id = older.id();
        older.inner().write_from_queue()?;
        older.write_lock()?.fill(1);
        older.set_dirty(0, BLOCK_SIZE);

        let newer = Arc::new(Block::new(store.clone(), id, cache.buffer_pool()));
        newer.write_lock()?.fill(2);
        newer.validate();
        newer.set_dirty(0, BLOCK_SIZE);

        // the older version cannot be flushed while its page is locked
        let held = older.write_lock()?;
        park(&queue, older.inner());
        park(&queue, &newer);
        queue.ensure_worker();
        thread::sleep(Duration::from_millis(150));

        assert_eq!(queue.len(), 2);
        let target = Arc::new(Block::new(store.clone(), id, cache.buffer_pool()));
        assert!(queue.copy_dirty_block(id, &target));
        assert!(target.read_lock()?.iter().all(|&b| b == 2));
        drop(held);

        assert!(queue.wait_for_complete(Duration::from_secs(10)));
        assert!(!older.is_dirty());
        assert!(!newer.is_dirty());

        let mut on_disk = vec![0u8; BLOCK_SIZE];
        store.file_io().read(id.address(), &mut on_disk)?;
        assert!(on_disk.iter().all(|&b| b == 2));

        assert!(queue.close(Duration::from_secs(1)));
        drop(older);
        store.close()?;
        Ok(())
    }

    #[test]
    fn test_backpressure_is_bounded() -> Result<()> {
        let config = StoreConfig::default()
            .writer_queue_capacity(1)
            .writer_backpressure_timeout(Duration::from_millis(5));
        let (_dir, _cache, store) = test_store(config.clone())?;
        let queue = WriteBackQueue::new("test", &config);

        let a = store.allocate_row()?;
        let b = store.allocate_row()?;
        park(&queue, a.inner());

        // no worker is running yet, so the producer waits out its timeout
        let start = Instant::now();
        queue.add_dirty_block(b.inner().clone());
        assert!(start.elapsed() >= Duration::from_millis(5));

        // the producer started the worker, which drains both blocks
        assert!(queue.wait_for_complete(Duration::from_secs(10)));
        assert!(!a.is_dirty());
        assert!(!b.is_dirty());
        assert!(queue.close(Duration::from_secs(1)));

        drop((a, b));
        store.close()?;
        Ok(())
    }

    #[test]
    fn test_wait_for_complete_times_out() -> Result<()> {
        let (_dir, _cache, store) = test_store(StoreConfig::default())?;
        let queue = WriteBackQueue::new("test", &StoreConfig::default());
        let block = store.allocate_row()?;
        park(&queue, block.inner());

        assert!(!queue.wait_for_complete(Duration::from_millis(20)));
        assert!(!queue.close(Duration::from_millis(20)));
        assert!(queue.is_empty());

        drop(block);
        store.close()?;
        Ok(())
    }

    #[test]
    fn test_close_drains_queue() -> Result<()> {
        let (_dir, _cache, store) = test_store(StoreConfig::default())?;
        let mut addresses = Vec::new();

        for i in 0..20u8 {
            let block = store.allocate_row()?;
            block.write_lock()?[0] = i + 1;
            block.set_dirty(0, 1);
            addresses.push(block.address());
            block.commit();
        }

        assert!(store.writer().close(Duration::from_secs(10)));
        for (i, address) in addresses.into_iter().enumerate() {
            let mut byte = [0u8; 1];
            store.file_io().read(address, &mut byte)?;
            assert_eq!(byte[0], i as u8 + 1);
        }

        store.close()?;
        Ok(())
    }
}
