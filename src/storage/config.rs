use crate::storage::layout::BLOCK_SIZE;
use std::time::Duration;

/// Smallest block cache the manager will run with.
pub const MIN_CACHE_CAPACITY: usize = 64;

/// Memory assumed when the platform does not report it (1GB).
const FALLBACK_MEMORY: u64 = 1024 * 1024 * 1024;

/// Configuration for a single store file.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Upper bound on waiting for a block's read or write lock (default: 120s)
    pub lock_timeout: Duration,

    /// Soft cap on queued dirty blocks before producers are throttled (default: 256)
    pub writer_queue_capacity: usize,

    /// How long a throttled producer waits for the writer (default: 10ms)
    pub writer_backpressure_timeout: Duration,

    /// Empty-queue polls before the writer parks (default: 10)
    pub writer_idle_retries: usize,

    /// Interval between empty-queue polls (default: 10ms)
    pub writer_idle_interval: Duration,

    /// Delay before re-trying a failed flush (default: 100ms)
    pub writer_retry_delay: Duration,

    /// Deadline for draining the writer on close (default: 60s)
    pub shutdown_timeout: Duration,

    /// Maximum concurrently open file handles (default: 8)
    pub file_io_concurrency: usize,

    /// Sync the file after every block flush (default: true)
    pub sync_on_flush: bool,

    /// Write dirty blocks and allocation changes on commit (default: true)
    pub flush_dirty_blocks_on_commit: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            lock_timeout: Duration::from_secs(120),
            writer_queue_capacity: 256,
            writer_backpressure_timeout: Duration::from_millis(10),
            writer_idle_retries: 10,
            writer_idle_interval: Duration::from_millis(10),
            writer_retry_delay: Duration::from_millis(100),
            shutdown_timeout: Duration::from_secs(60),
            file_io_concurrency: 8,
            sync_on_flush: true,
            flush_dirty_blocks_on_commit: true,
        }
    }
}

impl StoreConfig {
    /// Set the block lock timeout
    pub fn lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    /// Set the writer queue soft cap
    pub fn writer_queue_capacity(mut self, capacity: usize) -> Self {
        self.writer_queue_capacity = capacity.max(1);
        self
    }

    /// Set the producer wait under backpressure
    pub fn writer_backpressure_timeout(mut self, timeout: Duration) -> Self {
        self.writer_backpressure_timeout = timeout;
        self
    }

    /// Set the delay between failed flush attempts
    pub fn writer_retry_delay(mut self, delay: Duration) -> Self {
        self.writer_retry_delay = delay;
        self
    }

    /// Set the writer drain deadline used on close
    pub fn shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Set the number of concurrently open file handles
    pub fn file_io_concurrency(mut self, concurrency: usize) -> Self {
        self.file_io_concurrency = concurrency.max(1);
        self
    }

    /// Enable or disable sync after every flush
    pub fn sync_on_flush(mut self, enabled: bool) -> Self {
        self.sync_on_flush = enabled;
        self
    }

    /// Enable or disable writing on commit
    pub fn flush_dirty_blocks_on_commit(mut self, enabled: bool) -> Self {
        self.flush_dirty_blocks_on_commit = enabled;
        self
    }
}

/// Configuration for the shared block cache.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Number of cached blocks (default: 1/16 of memory, at least 64)
    pub capacity: usize,

    /// Ceiling for dynamic growth when every block is pinned (default: 4x capacity)
    pub max_capacity: usize,

    /// Idle page buffers kept for reuse (default: 64)
    pub buffer_pool_size: usize,

    /// LRU candidates tried per eviction before growing (default: 32)
    pub eviction_probes: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        let capacity = default_capacity(physical_memory());

        Self {
            capacity,
            max_capacity: 4 * capacity,
            buffer_pool_size: 64,
            eviction_probes: 32,
        }
    }
}

impl CacheConfig {
    /// Create a config with a fixed capacity
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            max_capacity: 4 * capacity,
            ..Default::default()
        }
    }

    /// Set the growth ceiling
    pub fn max_capacity(mut self, max_capacity: usize) -> Self {
        self.max_capacity = max_capacity.max(self.capacity);
        self
    }

    /// Set the idle buffer pool size
    pub fn buffer_pool_size(mut self, size: usize) -> Self {
        self.buffer_pool_size = size;
        self
    }

    /// Set the eviction probe count
    pub fn eviction_probes(mut self, probes: usize) -> Self {
        self.eviction_probes = probes.max(1);
        self
    }
}

fn default_capacity(memory: u64) -> usize {
    let blocks = (memory / 16 / BLOCK_SIZE as u64) as usize;
    blocks.max(MIN_CACHE_CAPACITY)
}

/// Total physical memory, from /proc/meminfo where available.
fn physical_memory() -> u64 {
    std::fs::read_to_string("/proc/meminfo")
        .ok()
        .and_then(|info| parse_mem_total(&info))
        .unwrap_or(FALLBACK_MEMORY)
}

fn parse_mem_total(info: &str) -> Option<u64> {
    let line = info.lines().find(|l| l.starts_with("MemTotal:"))?;
    let kb: u64 = line.split_whitespace().nth(1)?.parse().ok()?;
    Some(kb * 1024)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_store_config() {
        let config = StoreConfig::default();
        assert_eq!(config.lock_timeout, Duration::from_secs(120));
        assert_eq!(config.writer_queue_capacity, 256);
        assert_eq!(config.file_io_concurrency, 8);
        assert!(config.flush_dirty_blocks_on_commit);
    }

    #[test]
    fn test_store_config_builder() {
        let config = StoreConfig::default()
            .lock_timeout(Duration::from_secs(1))
            .writer_queue_capacity(0)
            .file_io_concurrency(2)
            .sync_on_flush(false);

        assert_eq!(config.lock_timeout, Duration::from_secs(1));
        assert_eq!(config.writer_queue_capacity, 1);
        assert_eq!(config.file_io_concurrency, 2);
        assert!(!config.sync_on_flush);
    }

    #[test]
    fn test_default_capacity_is_clamped() {
        assert_eq!(default_capacity(0), MIN_CACHE_CAPACITY);
        assert_eq!(default_capacity(16 * 1024 * BLOCK_SIZE as u64), 1024);
        assert!(CacheConfig::default().capacity >= MIN_CACHE_CAPACITY);
    }

    #[test]
    fn test_parse_mem_total() {
        let info = "MemTotal:       16384 kB\nMemFree:        1024 kB\n";
        assert_eq!(parse_mem_total(info), Some(16384 * 1024));
        assert_eq!(parse_mem_total("nothing here"), None);
    }

    #[test]
    fn test_cache_config_with_capacity() {
        let config = CacheConfig::with_capacity(10).max_capacity(5);
        assert_eq!(config.capacity, 10);
        assert_eq!(config.max_capacity, 10);
    }
}
