//! The per-store allocation table: two bytes per block, code then mask.

use crate::storage::error::{StoreError, StoreResult};
use crate::storage::layout::{ALLOC_BYTES_PER_BLOCK, ALLOC_GROUP_COUNT};
use parking_lot::RwLock;
use std::fmt;
use std::ops::Range;
use std::sync::atomic::{AtomicU16, Ordering};

/// What a block is used for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Allocation {
    Free,
    Row,
    /// Reserved by the store itself, or claimed but not yet typed.
    Used,
    Index,
    /// Holds up to 31 mini-fragments. A mask of 0xff means the block is
    /// full or claimed by an allocator; 0 means it may have room.
    MiniFrag { mask: u8 },
}

impl Allocation {
    pub const FREE: u8 = 0x00;
    pub const ROW: u8 = 0x01;
    pub const USED: u8 = 0x02;
    pub const INDEX: u8 = 0x04;
    pub const MINI_FRAG: u8 = 0x05;
    pub const MASK: u8 = 0x0f;

    pub const MINI_FRAG_FULL: u8 = 0xff;

    pub fn code(&self) -> u8 {
        match self {
            Allocation::Free => Self::FREE,
            Allocation::Row => Self::ROW,
            Allocation::Used => Self::USED,
            Allocation::Index => Self::INDEX,
            Allocation::MiniFrag { .. } => Self::MINI_FRAG,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Allocation::Free => "free",
            Allocation::Row => "row",
            Allocation::Used => "used",
            Allocation::Index => "index",
            Allocation::MiniFrag { .. } => "mini-fragment",
        }
    }

    /// Decodes an on-disk `[code, mask]` entry.
    pub fn from_bytes(code: u8, mask: u8) -> Option<Self> {
        match code & Self::MASK {
            Self::FREE => Some(Allocation::Free),
            Self::ROW => Some(Allocation::Row),
            Self::USED => Some(Allocation::Used),
            Self::INDEX => Some(Allocation::Index),
            Self::MINI_FRAG => Some(Allocation::MiniFrag { mask }),
            _ => None,
        }
    }

    fn to_raw(self) -> u16 {
        let mask = match self {
            Allocation::MiniFrag { mask } => mask,
            _ => 0,
        };
        self.code() as u16 | (mask as u16) << 8
    }

    fn from_raw(raw: u16) -> Option<Self> {
        Self::from_bytes(raw as u8, (raw >> 8) as u8)
    }

    pub fn is_free(&self) -> bool {
        matches!(self, Allocation::Free)
    }
}

impl fmt::Display for Allocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// In-memory copy of the allocation table.
///
/// Entries are read lock-free. Every mutation goes through the owning
/// store while it holds its allocation lock; the `RwLock` only guards the
/// vector against reallocation when the table grows.
pub struct AllocationTable {
    entries: RwLock<Vec<AtomicU16>>,
}

impl AllocationTable {
    /// An empty table covering one allocation group.
    pub fn new() -> Self {
        Self::with_len(ALLOC_GROUP_COUNT)
    }

    fn with_len(len: u64) -> Self {
        Self {
            entries: RwLock::new((0..len).map(|_| AtomicU16::new(0)).collect()),
        }
    }

    /// Rebuilds a table from its on-disk bytes, rejecting unknown codes.
    pub fn from_bytes(bytes: &[u8]) -> StoreResult<Self> {
        let entries = bytes
            .chunks_exact(ALLOC_BYTES_PER_BLOCK)
            .enumerate()
            .map(|(index, entry)| {
                Allocation::from_bytes(entry[0], entry[1])
                    .map(|alloc| AtomicU16::new(alloc.to_raw()))
                    .ok_or(StoreError::InvalidAllocationCode {
                        index: index as u64,
                        code: entry[0],
                    })
            })
            .collect::<StoreResult<Vec<_>>>()?;

        Ok(Self {
            entries: RwLock::new(entries),
        })
    }

    /// Number of blocks the table can describe.
    pub fn len(&self) -> u64 {
        self.entries.read().len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Entry for `index`, or `None` past the end of the table.
    pub fn get(&self, index: u64) -> Option<Allocation> {
        let entries = self.entries.read();
        let raw = entries.get(index as usize)?.load(Ordering::Acquire);
        Allocation::from_raw(raw)
    }

    pub(super) fn set(&self, index: u64, alloc: Allocation) {
        let entries = self.entries.read();
        if let Some(entry) = entries.get(index as usize) {
            entry.store(alloc.to_raw(), Ordering::Release);
        }
    }

    /// Grows the table to `len` entries; new entries are free.
    pub(super) fn grow(&self, len: u64) {
        let mut entries = self.entries.write();
        let len = len as usize;
        if entries.len() < len {
            entries.resize_with(len, || AtomicU16::new(0));
        }
    }

    /// Takes over the entries of `other`, e.g. a table loaded from disk.
    pub(super) fn replace(&self, other: AllocationTable) {
        *self.entries.write() = other.entries.into_inner();
    }

    /// Replaces the whole table with a fresh one of `len` free entries.
    pub(super) fn reset(&self, len: u64) {
        let mut entries = self.entries.write();
        entries.clear();
        entries.resize_with(len as usize, || AtomicU16::new(0));
    }

    /// Serialized bytes for the byte range `range` of the table.
    pub fn to_bytes(&self, range: Range<usize>) -> Vec<u8> {
        let entries = self.entries.read();
        let first = range.start / ALLOC_BYTES_PER_BLOCK;
        let last = range.end.div_ceil(ALLOC_BYTES_PER_BLOCK).min(entries.len());

        let mut bytes = Vec::with_capacity((last - first) * ALLOC_BYTES_PER_BLOCK);
        for entry in &entries[first..last] {
            let raw = entry.load(Ordering::Acquire);
            bytes.push(raw as u8);
            bytes.push((raw >> 8) as u8);
        }

        let skip = range.start - first * ALLOC_BYTES_PER_BLOCK;
        bytes.drain(..skip);
        bytes.truncate(range.end - range.start);
        bytes
    }

    /// A copy of every entry.
    pub fn snapshot(&self) -> Vec<Allocation> {
        let entries = self.entries.read();
        entries
            .iter()
            .map(|e| Allocation::from_raw(e.load(Ordering::Acquire)).unwrap_or(Allocation::Used))
            .collect()
    }
}

impl Default for AllocationTable {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for AllocationTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AllocationTable")
            .field("len", &self.len())
            .finish()
    }
}
