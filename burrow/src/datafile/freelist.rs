//! Deleted-record free list.
//!
//! The datafile keeps an in-memory table of (offset, length) pairs mirroring
//! deleted slots, persisted as a single framed record. Allocation scans the
//! table first-fit; the persisted record's slot is sized in blocks of
//! [`DELLIST_BLOCK_SIZE`] entries so routine growth rewrites it in place.

use crate::datafile::Ref;
use crate::{Error, Result};

/// Persisted free-list capacity is rounded up to a multiple of this many
/// entries.
pub const DELLIST_BLOCK_SIZE: usize = 256;

const ENTRY_SIZE: usize = 16;
const TABLE_HEADER_SIZE: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FreeSlot {
    pub at: Ref,
    pub len: i64,
}

/// In-memory mirror of the deleted-record table.
#[derive(Debug, Clone, Default)]
pub struct FreeList {
    slots: Vec<FreeSlot>,
}

impl FreeList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Records a freed slot. A slot may appear at most once.
    pub fn insert(&mut self, at: Ref, len: i64) -> Result<()> {
        if self.slots.iter().any(|s| s.at == at) {
            return Err(Error::DuplicateRemove(at.raw()));
        }

        self.slots.push(FreeSlot { at, len });
        Ok(())
    }

    /// Removes and returns the first slot with capacity for `len` bytes.
    pub fn take_fit(&mut self, len: i64) -> Option<FreeSlot> {
        let index = self.slots.iter().position(|s| s.len >= len)?;
        Some(self.slots.remove(index))
    }

    /// Serialized byte length of the persisted record for `entries` slots,
    /// rounded up to the block size.
    pub fn slot_capacity(entries: usize) -> i64 {
        let blocks = (entries / DELLIST_BLOCK_SIZE) + 1;
        (TABLE_HEADER_SIZE + blocks * DELLIST_BLOCK_SIZE * ENTRY_SIZE) as i64
    }

    pub fn serialized_len(&self) -> i64 {
        (TABLE_HEADER_SIZE + self.slots.len() * ENTRY_SIZE) as i64
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.serialized_len() as usize);

        bytes.extend_from_slice(&(self.slots.len() as u64).to_le_bytes());

        for slot in &self.slots {
            bytes.extend_from_slice(&slot.at.raw().to_le_bytes());
            bytes.extend_from_slice(&slot.len.to_le_bytes());
        }

        bytes
    }

    pub fn from_bytes(bytes: &[u8], at: i64) -> Result<Self> {
        if bytes.len() < TABLE_HEADER_SIZE {
            return Err(Error::InvalidRecord(at));
        }

        let count = u64::from_le_bytes(bytes[0..8].try_into().unwrap()) as usize;

        if bytes.len() < TABLE_HEADER_SIZE + count * ENTRY_SIZE {
            return Err(Error::InvalidRecord(at));
        }

        let mut slots = Vec::with_capacity(count);

        for n in 0..count {
            let base = TABLE_HEADER_SIZE + n * ENTRY_SIZE;
            let slot_at = i64::from_le_bytes(bytes[base..base + 8].try_into().unwrap());
            let len = i64::from_le_bytes(bytes[base + 8..base + 16].try_into().unwrap());
            slots.push(FreeSlot {
                at: Ref::from_raw(slot_at),
                len,
            });
        }

        Ok(Self { slots })
    }
}
