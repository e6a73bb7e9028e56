//! Record framing.
//!
//! Every blob stored in a datafile is prefixed with a fixed 24-byte header
//! identifying it as a burrow record, naming its category, and recording
//! both the allocated slot length and the payload length actually in use.
//! A slot may be reused for a smaller payload without shrinking, so the two
//! lengths differ for recycled records.

use crate::{Error, Result};

/// Magic number identifying a burrow datafile.
pub const DATAFILE_SIGNATURE: u32 = 0x4D5A5449;

/// Magic number identifying a framed record.
pub const RECORD_SIGNATURE: u32 = 0x525A5449;

/// Datafile format version (64-bit refs).
pub const DATAFILE_VERSION: u32 = 0x4005_0100;

// Record category flags.
pub const RECORD_IN_USE: u32 = 0x0000_0001;
pub const RECORD_DELLIST: u32 = 0x0000_0002;
/// Reserved category for schema records; part of the on-disk flag bitset
/// but never written by this crate.
pub const RECORD_SCHEMA: u32 = 0x0000_0004;
pub const RECORD_TRAN_HEADER: u32 = 0x0000_0010;
pub const RECORD_TRAN_RECORD: u32 = 0x0000_0020;
pub const RECORD_BTREE_HEADER: u32 = 0x0000_0100;
pub const RECORD_BTREE_PAGE: u32 = 0x0000_0200;
/// Reserved category for standalone key records; part of the on-disk flag
/// bitset but never written by this crate.
pub const RECORD_BTREE_KEY: u32 = 0x0000_0400;

/// Header prefixed to every record in a datafile.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordHeader {
    pub flags: u32,
    /// Allocated slot length in bytes (never shrinks on reuse).
    pub slot_len: i64,
    /// Payload bytes actually in use; `rec_len <= slot_len`.
    pub rec_len: i64,
}

impl RecordHeader {
    /// Serialized size of a record header.
    pub const SIZE: usize = 24;

    pub fn new(flags: u32, slot_len: i64, rec_len: i64) -> Self {
        debug_assert!(rec_len <= slot_len);
        Self {
            flags,
            slot_len,
            rec_len,
        }
    }

    pub fn in_use(&self) -> bool {
        self.flags & RECORD_IN_USE != 0
    }

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut bytes = [0u8; Self::SIZE];

        bytes[0..4].copy_from_slice(&RECORD_SIGNATURE.to_le_bytes());
        bytes[4..8].copy_from_slice(&self.flags.to_le_bytes());
        bytes[8..16].copy_from_slice(&self.slot_len.to_le_bytes());
        bytes[16..24].copy_from_slice(&self.rec_len.to_le_bytes());

        bytes
    }

    /// Deserializes a record header read at file offset `at`.
    ///
    /// `at` is used only for error reporting.
    pub fn from_bytes(bytes: &[u8], at: i64) -> Result<Self> {
        if bytes.len() < Self::SIZE {
            return Err(Error::InvalidRecord(at));
        }

        let signature = u32::from_le_bytes(bytes[0..4].try_into().unwrap());

        if signature != RECORD_SIGNATURE {
            return Err(Error::InvalidRecord(at));
        }

        let header = Self {
            flags: u32::from_le_bytes(bytes[4..8].try_into().unwrap()),
            slot_len: i64::from_le_bytes(bytes[8..16].try_into().unwrap()),
            rec_len: i64::from_le_bytes(bytes[16..24].try_into().unwrap()),
        };

        if header.slot_len < 0 || header.rec_len < 0 || header.rec_len > header.slot_len {
            return Err(Error::InvalidRecord(at));
        }

        Ok(header)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_header_size() {
        assert_eq!(RecordHeader::new(RECORD_IN_USE, 8, 8).to_bytes().len(), 24);
    }

    #[test]
    fn test_round_trip() {
        let header = RecordHeader::new(RECORD_IN_USE | RECORD_BTREE_PAGE, 128, 100);
        let bytes = header.to_bytes();

        assert_eq!(RecordHeader::from_bytes(&bytes, 0).unwrap(), header);
    }

    #[test]
    fn test_rejects_bad_signature() {
        let mut bytes = RecordHeader::new(RECORD_IN_USE, 8, 8).to_bytes();
        bytes[0] ^= 0xFF;

        assert!(matches!(
            RecordHeader::from_bytes(&bytes, 40),
            Err(Error::InvalidRecord(40))
        ));
    }

    #[test]
    fn test_rejects_payload_longer_than_slot() {
        let mut bytes = RecordHeader::new(RECORD_IN_USE, 8, 8).to_bytes();
        bytes[16..24].copy_from_slice(&16i64.to_le_bytes());

        assert!(RecordHeader::from_bytes(&bytes, 0).is_err());
    }
}
