//! Block storage engine.
//!
//! Key components:
//!
//! - **FileIo**: pooled random-access handles on a store's backing file
//! - **BlockCache**: process-wide LRU cache of refcounted blocks
//! - **Block**: one in-memory page with its dirty range and use-count
//! - **WriteBackQueue**: per-store worker flushing dirty blocks in order
//! - **Store**: block and mini-fragment allocation over a persisted table

pub mod block;
pub mod buffer;
pub mod config;
pub mod disk;
pub mod error;
pub mod layout;
pub mod store;
pub mod writer;

pub use block::{Block, BlockRef};
pub use buffer::BlockCache;
pub use config::{CacheConfig, StoreConfig};
pub use disk::FileIo;
pub use error::{StoreError, StoreResult};
pub use layout::{BlockId, BLOCK_SIZE, MINI_FRAG_PER_BLOCK, MINI_FRAG_SIZE};
pub use store::{Allocation, Lifecycle, Store};
pub use writer::WriteBackQueue;
