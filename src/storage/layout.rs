//! On-disk geometry of a store file and block addressing.
//!
//! A store file is a flat array of `BLOCK_SIZE` pages. Three kinds of
//! numbers refer to a page:
//!
//! - **block index**: the page number inside the file.
//! - **address**: a byte offset inside the file, treating it as flat.
//!   Page-aligned addresses name whole blocks; mini-fragment addresses carry
//!   the fragment number in their low bits.
//! - **block id**: the page address with the owning store id merged into the
//!   low `BLOCK_BITS`, unique across every store sharing a cache.

use byteorder::{BigEndian, ByteOrder};
use std::fmt;

pub const BLOCK_BITS: u32 = 13;
pub const BLOCK_SIZE: usize = 1 << BLOCK_BITS;
pub const BLOCK_OFFSET_MASK: u64 = BLOCK_SIZE as u64 - 1;
pub const BLOCK_MASK: u64 = !BLOCK_OFFSET_MASK;

/// Store ids live in the low bits of a block id.
pub const MAX_STORE_ID: usize = 1 << BLOCK_BITS;

pub const ALLOC_BYTES_PER_BLOCK: usize = 2;
/// Size of one chunk of the allocation table, stored in a single block.
pub const ALLOC_CHUNK_SIZE: usize = BLOCK_SIZE;
/// Number of blocks described by one allocation-table chunk.
pub const ALLOC_GROUP_COUNT: u64 = (BLOCK_SIZE / ALLOC_BYTES_PER_BLOCK) as u64;
/// Bytes of file covered by one allocation-table chunk.
pub const ALLOC_GROUP_SIZE: u64 = ALLOC_GROUP_COUNT * BLOCK_SIZE as u64;

pub const MINI_FRAG_SIZE: usize = 256;
pub const MINI_FRAG_PER_BLOCK: usize = (BLOCK_SIZE - 64) / MINI_FRAG_SIZE;
/// Offset of the in-page occupancy bitmap of a mini-fragment block.
pub const MINI_FRAG_ALLOC_OFFSET: usize = MINI_FRAG_PER_BLOCK * MINI_FRAG_SIZE;

/// Block 0 holds the first allocation-table chunk.
pub const ALLOC_TABLE_BLOCK: u64 = 0;
/// Block 1 holds the store header.
pub const HEADER_BLOCK: u64 = 1;
pub const DATA_START: u64 = BLOCK_SIZE as u64;

/// Unique id of a cached block: page address plus store id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockId(pub u64);

impl BlockId {
    pub fn new(store_id: u32, block_index: u64) -> Self {
        debug_assert!((store_id as usize) < MAX_STORE_ID);
        BlockId((block_index << BLOCK_BITS) | store_id as u64)
    }

    pub fn from_address(store_id: u32, address: u64) -> Self {
        BlockId((address & BLOCK_MASK) | store_id as u64)
    }

    pub fn store_id(&self) -> u32 {
        (self.0 & BLOCK_OFFSET_MASK) as u32
    }

    pub fn index(&self) -> u64 {
        self.0 >> BLOCK_BITS
    }

    /// Page-aligned address of the block inside its store file.
    pub fn address(&self) -> u64 {
        self.0 & BLOCK_MASK
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

pub fn block_index_to_address(block_index: u64) -> u64 {
    block_index << BLOCK_BITS
}

pub fn address_to_block_index(address: u64) -> u64 {
    address >> BLOCK_BITS
}

/// Byte offset of a mini-fragment inside its block.
pub fn mini_fragment_offset(fragment_address: u64) -> usize {
    (fragment_address & BLOCK_OFFSET_MASK) as usize * MINI_FRAG_SIZE
}

/// Position of a mini-fragment's bit in the in-page occupancy bitmap.
pub fn mini_fragment_bit(fragment: usize) -> (usize, u8) {
    (MINI_FRAG_ALLOC_OFFSET + fragment / 8, 1 << (fragment % 8))
}

pub fn read_long(buffer: &[u8], offset: usize) -> i64 {
    BigEndian::read_i64(&buffer[offset..offset + 8])
}

pub fn write_long(buffer: &mut [u8], offset: usize, value: i64) {
    BigEndian::write_i64(&mut buffer[offset..offset + 8], value);
}

pub fn read_chars(buffer: &[u8], offset: usize, chars: &mut [u16]) {
    BigEndian::read_u16_into(&buffer[offset..offset + 2 * chars.len()], chars);
}

pub fn write_chars(buffer: &mut [u8], offset: usize, chars: &[u16]) {
    BigEndian::write_u16_into(chars, &mut buffer[offset..offset + 2 * chars.len()]);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_geometry() {
        assert_eq!(BLOCK_SIZE, 8192);
        assert_eq!(ALLOC_GROUP_COUNT, 4096);
        assert_eq!(MINI_FRAG_PER_BLOCK, 31);
        assert_eq!(MINI_FRAG_ALLOC_OFFSET, 7936);
        // bitmap fits in the page tail
        assert!(MINI_FRAG_ALLOC_OFFSET + MINI_FRAG_PER_BLOCK.div_ceil(8) <= BLOCK_SIZE);
    }

    #[test]
    fn test_block_id_parts() {
        let id = BlockId::new(7, 42);
        assert_eq!(id.store_id(), 7);
        assert_eq!(id.index(), 42);
        assert_eq!(id.address(), 42 * BLOCK_SIZE as u64);

        let from_addr = BlockId::from_address(7, id.address() + 100);
        assert_eq!(from_addr, id);
    }

    #[test]
    fn test_mini_fragment_offsets() {
        let block = block_index_to_address(3);
        assert_eq!(mini_fragment_offset(block), 0);
        assert_eq!(mini_fragment_offset(block + 5), 5 * MINI_FRAG_SIZE);
        assert_eq!(mini_fragment_bit(0), (MINI_FRAG_ALLOC_OFFSET, 1));
        assert_eq!(mini_fragment_bit(9), (MINI_FRAG_ALLOC_OFFSET + 1, 2));
    }

    #[test]
    fn test_long_and_chars_are_big_endian() {
        let mut buf = [0u8; 16];
        write_long(&mut buf, 2, 0x0102_0304_0506_0708);
        assert_eq!(&buf[2..10], &[1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(read_long(&buf, 2), 0x0102_0304_0506_0708);

        write_chars(&mut buf, 0, &[0x4142, 0x0043]);
        assert_eq!(&buf[0..4], &[0x41, 0x42, 0x00, 0x43]);
        let mut chars = [0u16; 2];
        read_chars(&buf, 0, &mut chars);
        assert_eq!(chars, [0x4142, 0x0043]);
    }
}
