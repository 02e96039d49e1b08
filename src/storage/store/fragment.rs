//! Mini-fragments: 256-byte slots packed 31 to a block.
//!
//! A fragment address is its block's address plus the fragment number.
//! Occupancy lives in a bitmap at the tail of the block. The allocation
//! table mask only summarizes it: 0xff while a block is full or claimed by
//! an allocator, 0 when it may have room.

use super::{check_range, Allocation, Store};
use crate::storage::block::BlockRef;
use crate::storage::error::{StoreError, StoreResult};
use crate::storage::layout::{
    address_to_block_index, block_index_to_address, mini_fragment_bit, mini_fragment_offset,
    BLOCK_MASK, BLOCK_OFFSET_MASK, MINI_FRAG_PER_BLOCK, MINI_FRAG_SIZE,
};
use std::sync::Arc;
use std::sync::atomic::Ordering;

/// Claim attempts before fragment allocation gives up.
const MAX_FRAGMENT_RETRIES: usize = 64;

/// Blocks allocated at once when no mini-fragment block has room, once the
/// file is past its small-file phase.
const MINI_FRAG_BATCH: usize = 16;

fn is_fragment_used(page: &[u8], fragment: usize) -> bool {
    let (offset, bit) = mini_fragment_bit(fragment);
    page[offset] & bit != 0
}

/// Offset inside the block of `[offset, offset + length)` within a fragment.
fn fragment_range(fragment_address: u64, offset: usize, length: usize) -> StoreResult<usize> {
    let fragment = (fragment_address & BLOCK_OFFSET_MASK) as usize;
    if fragment >= MINI_FRAG_PER_BLOCK {
        return Err(StoreError::OutOfBounds {
            offset: fragment,
            length: 1,
            limit: MINI_FRAG_PER_BLOCK,
        });
    }

    check_range(offset, length, MINI_FRAG_SIZE)?;
    Ok(mini_fragment_offset(fragment_address) + offset)
}

impl Store {
    /// Allocates a mini-fragment and returns its address.
    ///
    /// Blocks are scanned from a cursor, so a freed slot is reused before
    /// any new block is allocated.
    pub fn allocate_mini_fragment(self: &Arc<Self>) -> StoreResult<u64> {
        self.assert_active()?;

        for _ in 0..MAX_FRAGMENT_RETRIES {
            let block_address = self.claim_mini_fragment_block()?;
            let block = self.read_block(block_address)?;

            let (fragment, has_room) = {
                let mut page = block.write_lock()?;
                let fragment = (0..MINI_FRAG_PER_BLOCK).find(|&f| !is_fragment_used(&page[..], f));

                if let Some(fragment) = fragment {
                    let (offset, bit) = mini_fragment_bit(fragment);
                    page[offset] |= bit;
                    block.set_dirty(offset, offset + 1);
                }

                let has_room = (0..MINI_FRAG_PER_BLOCK).any(|f| !is_fragment_used(&page[..], f));
                (fragment, has_room)
            };

            // a full block keeps its claim so nobody scans it again
            if has_room {
                self.set_mini_frag_mask(block.id().index(), 0);
            }

            if let Some(fragment) = fragment {
                self.mini_fragment_use_count.fetch_add(1, Ordering::SeqCst);
                self.save_allocation()?;
                return Ok(block_address + fragment as u64);
            }
        }

        log::error!("{} no mini-fragment after {} attempts", self, MAX_FRAGMENT_RETRIES);
        Err(StoreError::AllocationRetriesExceeded(MAX_FRAGMENT_RETRIES))
    }

    /// Allocates an empty mini-fragment block. Its zeroed page doubles as
    /// a cleared occupancy bitmap.
    pub fn allocate_mini_fragment_block(self: &Arc<Self>) -> StoreResult<BlockRef> {
        self.allocate_typed(Allocation::MiniFrag { mask: 0 })
    }

    /// Claims a mini-fragment block with room, allocating new ones when a
    /// full scan finds none.
    fn claim_mini_fragment_block(self: &Arc<Self>) -> StoreResult<u64> {
        for _ in 0..MAX_FRAGMENT_RETRIES {
            if let Some(index) = self.find_mini_fragment_block() {
                return Ok(block_index_to_address(index));
            }

            if self.free_mini_count.load(Ordering::SeqCst) == 0 {
                let batch = if self.block_count() >= super::EXTEND_THRESHOLD {
                    MINI_FRAG_BATCH
                } else {
                    1
                };

                log::debug!("{} allocating {} mini-fragment blocks", self, batch);
                for _ in 0..batch {
                    self.allocate_mini_fragment_block()?;
                }
            }

            self.free_mini_index.store(0, Ordering::SeqCst);
            self.free_mini_count.store(0, Ordering::SeqCst);
        }

        Err(StoreError::AllocationRetriesExceeded(MAX_FRAGMENT_RETRIES))
    }

    /// Scans from the mini-fragment cursor for an unclaimed block and marks
    /// it claimed.
    fn find_mini_fragment_block(&self) -> Option<u64> {
        let start = self.free_mini_index.load(Ordering::SeqCst);

        for index in start..self.block_count() {
            if !is_claimable(self.table.get(index)) {
                continue;
            }

            let mut state = self.alloc.lock();
            if is_claimable(self.table.get(index)) {
                self.set_allocation(
                    &mut state,
                    index,
                    Allocation::MiniFrag {
                        mask: Allocation::MINI_FRAG_FULL,
                    },
                );
                drop(state);

                self.free_mini_index.store(index, Ordering::SeqCst);
                self.free_mini_count.fetch_add(1, Ordering::SeqCst);
                return Some(index);
            }
        }

        None
    }

    fn set_mini_frag_mask(&self, index: u64, mask: u8) {
        let mut state = self.alloc.lock();
        if let Some(Allocation::MiniFrag { .. }) = self.table.get(index) {
            self.set_allocation(&mut state, index, Allocation::MiniFrag { mask });
        }
    }

    /// Releases a mini-fragment and makes its block eligible again.
    pub fn delete_mini_fragment(self: &Arc<Self>, fragment_address: u64) -> StoreResult<()> {
        self.assert_active()?;
        fragment_range(fragment_address, 0, 0)?;

        let index = address_to_block_index(fragment_address);
        match self.allocation(index) {
            Some(Allocation::MiniFrag { .. }) => {}
            other => {
                let actual = other.map_or("none", |alloc| alloc.name());
                log::error!(
                    "{} deleting fragment {:#x} in {} block",
                    self,
                    fragment_address,
                    actual
                );
                return Err(StoreError::AllocationMismatch {
                    index,
                    expected: Allocation::MiniFrag { mask: 0 }.to_string(),
                    actual: actual.to_string(),
                });
            }
        }

        let block = self.read_block(fragment_address)?;
        {
            let mut page = block.write_lock()?;
            let fragment = (fragment_address & BLOCK_OFFSET_MASK) as usize;
            let (offset, bit) = mini_fragment_bit(fragment);

            if page[offset] & bit == 0 {
                log::error!("{} double free of fragment {:#x}", self, fragment_address);
                return Err(StoreError::DoubleFree {
                    store: self.to_string(),
                    block_id: block.id(),
                });
            }

            page[offset] &= !bit;
            block.set_dirty(offset, offset + 1);
            self.set_mini_frag_mask(index, 0);
        }

        self.mini_fragment_use_count.fetch_sub(1, Ordering::SeqCst);
        self.save_allocation()
    }

    /// Live mini-fragments allocated through this store since it opened.
    pub fn mini_fragment_use_count(&self) -> i64 {
        self.mini_fragment_use_count.load(Ordering::SeqCst)
    }

    pub fn read_mini_fragment(
        self: &Arc<Self>,
        fragment_address: u64,
        offset: usize,
        buf: &mut [u8],
    ) -> StoreResult<usize> {
        let block_offset = fragment_range(fragment_address, offset, buf.len())?;
        self.read_block_bytes(fragment_address & BLOCK_MASK, block_offset, buf)
    }

    pub fn read_mini_fragment_chars(
        self: &Arc<Self>,
        fragment_address: u64,
        offset: usize,
        chars: &mut [u16],
    ) -> StoreResult<usize> {
        let block_offset = fragment_range(fragment_address, offset, 2 * chars.len())?;
        self.read_block_chars(fragment_address & BLOCK_MASK, block_offset, chars)
    }

    pub fn read_mini_fragment_long(
        self: &Arc<Self>,
        fragment_address: u64,
        offset: usize,
    ) -> StoreResult<i64> {
        let block_offset = fragment_range(fragment_address, offset, 8)?;
        self.read_block_long(fragment_address & BLOCK_MASK, block_offset)
    }

    pub fn write_mini_fragment(
        self: &Arc<Self>,
        fragment_address: u64,
        offset: usize,
        data: &[u8],
    ) -> StoreResult<BlockRef> {
        let block_offset = fragment_range(fragment_address, offset, data.len())?;
        self.write_block(fragment_address & BLOCK_MASK, block_offset, data)
    }

    pub fn write_mini_fragment_chars(
        self: &Arc<Self>,
        fragment_address: u64,
        offset: usize,
        chars: &[u16],
    ) -> StoreResult<BlockRef> {
        let block_offset = fragment_range(fragment_address, offset, 2 * chars.len())?;
        self.write_block_chars(fragment_address & BLOCK_MASK, block_offset, chars)
    }

    pub fn write_mini_fragment_long(
        self: &Arc<Self>,
        fragment_address: u64,
        offset: usize,
        value: i64,
    ) -> StoreResult<BlockRef> {
        let block_offset = fragment_range(fragment_address, offset, 8)?;
        self.write_block_long(fragment_address & BLOCK_MASK, block_offset, value)
    }
}

fn is_claimable(alloc: Option<Allocation>) -> bool {
    matches!(alloc, Some(Allocation::MiniFrag { mask }) if mask != Allocation::MINI_FRAG_FULL)
}
