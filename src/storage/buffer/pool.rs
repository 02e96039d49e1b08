use crate::storage::layout::BLOCK_SIZE;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

pub type PageBuffer = Box<[u8; BLOCK_SIZE]>;

/// Free-list of page buffers shared by every block of a cache.
///
/// Buffers handed out may hold stale bytes from a previous block; the
/// owner is expected to load or zero them before use.
#[derive(Clone, Debug)]
pub struct BufferPool {
    inner: Arc<BufferPoolInner>,
}

#[derive(Debug)]
struct BufferPoolInner {
    free: Mutex<Vec<PageBuffer>>,
    max_free: usize,
    allocated: AtomicUsize,
}

impl BufferPool {
    pub fn new(max_free: usize) -> Self {
        Self {
            inner: Arc::new(BufferPoolInner {
                free: Mutex::new(Vec::with_capacity(max_free)),
                max_free,
                allocated: AtomicUsize::new(0),
            }),
        }
    }

    pub fn get(&self) -> PageBuffer {
        if let Some(buffer) = self.inner.free.lock().pop() {
            return buffer;
        }

        self.inner.allocated.fetch_add(1, Ordering::Relaxed);
        Box::new([0u8; BLOCK_SIZE])
    }

    /// Returns a buffer to the free-list, dropping it when the list is full.
    pub fn put(&self, buffer: PageBuffer) {
        let mut free = self.inner.free.lock();
        if free.len() < self.inner.max_free {
            free.push(buffer);
        }
    }

    /// Number of idle buffers ready for reuse.
    pub fn idle(&self) -> usize {
        self.inner.free.lock().len()
    }

    /// Buffers created over the pool's lifetime.
    pub fn allocated(&self) -> usize {
        self.inner.allocated.load(Ordering::Relaxed)
    }
}
