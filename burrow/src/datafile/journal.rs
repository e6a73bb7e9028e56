//! Before-image journal.
//!
//! While a transaction is active, every mutation of the main datafile first
//! saves the bytes it is about to destroy into a side journal file. The
//! journal is itself a datafile: each entry is a framed `TRAN_RECORD`
//! holding the operation kind, the target offset in the main file, a link
//! to the previous entry, and the old record header plus a reference to the
//! saved old payload. The main file header's `transaction_tail` points at
//! the newest entry, so an interrupted transaction can be walked backwards
//! and undone on the next open.

use std::path::{Path, PathBuf};

use crate::datafile::record::{RecordHeader, RECORD_TRAN_HEADER, RECORD_TRAN_RECORD};
use crate::datafile::{Datafile, Ref};
use crate::{Error, Result};

/// Extension appended to the datafile path for its journal.
pub const JOURNAL_EXTENSION: &str = "jnl";

const ENTRY_SIZE: usize = 56;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpKind {
    /// Image of the 44-byte main file header, taken at transaction start.
    FileHeader,
    Write,
    Remove,
    Overwrite,
}

impl OpKind {
    fn to_u32(self) -> u32 {
        match self {
            OpKind::FileHeader => 0,
            OpKind::Write => 1,
            OpKind::Remove => 2,
            OpKind::Overwrite => 3,
        }
    }

    fn from_u32(raw: u32, at: i64) -> Result<Self> {
        match raw {
            0 => Ok(OpKind::FileHeader),
            1 => Ok(OpKind::Write),
            2 => Ok(OpKind::Remove),
            3 => Ok(OpKind::Overwrite),
            _ => Err(Error::InvalidRecord(at)),
        }
    }
}

/// One undo step.
#[derive(Debug, Clone, Copy)]
pub struct JournalEntry {
    pub kind: OpKind,
    /// Offset of the mutated record in the main file.
    pub target: Ref,
    /// Previous entry in this transaction's chain.
    pub prev: Ref,
    /// Record header that stood at `target` before the mutation, if any.
    /// `None` marks a write into a slot that did not exist before the
    /// transaction (an end-of-file append).
    pub old_header: Option<RecordHeader>,
    /// Journal-file offset of the saved old payload, or NULL.
    pub saved: Ref,
}

impl JournalEntry {
    fn to_bytes(&self) -> [u8; ENTRY_SIZE] {
        let mut bytes = [0u8; ENTRY_SIZE];

        bytes[0..4].copy_from_slice(&self.kind.to_u32().to_le_bytes());
        bytes[4..8].copy_from_slice(&u32::from(self.old_header.is_some()).to_le_bytes());
        bytes[8..16].copy_from_slice(&self.target.raw().to_le_bytes());
        bytes[16..24].copy_from_slice(&self.prev.raw().to_le_bytes());

        if let Some(header) = &self.old_header {
            bytes[24..48].copy_from_slice(&header.to_bytes());
        }

        bytes[48..56].copy_from_slice(&self.saved.raw().to_le_bytes());

        bytes
    }

    fn from_bytes(bytes: &[u8], at: i64) -> Result<Self> {
        if bytes.len() < ENTRY_SIZE {
            return Err(Error::InvalidRecord(at));
        }

        let kind = OpKind::from_u32(u32::from_le_bytes(bytes[0..4].try_into().unwrap()), at)?;
        let has_old = u32::from_le_bytes(bytes[4..8].try_into().unwrap()) != 0;

        let old_header = if has_old {
            Some(RecordHeader::from_bytes(&bytes[24..48], at)?)
        } else {
            None
        };

        Ok(Self {
            kind,
            target: Ref::from_raw(i64::from_le_bytes(bytes[8..16].try_into().unwrap())),
            prev: Ref::from_raw(i64::from_le_bytes(bytes[16..24].try_into().unwrap())),
            old_header,
            saved: Ref::from_raw(i64::from_le_bytes(bytes[48..56].try_into().unwrap())),
        })
    }
}

/// Append-only store of undo entries for one transaction.
pub struct Journal {
    datafile: Datafile,
    path: PathBuf,
}

impl Journal {
    pub fn path_for(datafile_path: &Path) -> PathBuf {
        let mut name = datafile_path.as_os_str().to_os_string();
        name.push(".");
        name.push(JOURNAL_EXTENSION);
        PathBuf::from(name)
    }

    pub fn create(datafile_path: &Path) -> Result<Self> {
        let path = Self::path_for(datafile_path);
        let datafile = Datafile::create(&path)?;
        Ok(Self { datafile, path })
    }

    /// Opens an existing journal left behind by an interrupted transaction.
    pub fn open(datafile_path: &Path) -> Result<Self> {
        let path = Self::path_for(datafile_path);
        let datafile = Datafile::open(&path, false, false)?;
        Ok(Self { datafile, path })
    }

    pub fn exists(datafile_path: &Path) -> bool {
        Self::path_for(datafile_path).exists()
    }

    /// Appends an undo step, saving `old_payload` alongside it, and returns
    /// the entry's offset for the chain tail.
    pub fn append(
        &mut self,
        kind: OpKind,
        target: Ref,
        prev: Ref,
        old_header: Option<RecordHeader>,
        old_payload: Option<&[u8]>,
    ) -> Result<Ref> {
        let saved = match old_payload {
            Some(payload) => self
                .datafile
                .write_with_flags(payload, Ref::NULL, RECORD_TRAN_HEADER)?,
            None => Ref::NULL,
        };

        let entry = JournalEntry {
            kind,
            target,
            prev,
            old_header,
            saved,
        };

        self.datafile
            .write_with_flags(&entry.to_bytes(), Ref::NULL, RECORD_TRAN_RECORD)
    }

    pub fn read_entry(&mut self, at: Ref) -> Result<JournalEntry> {
        self.datafile.seek(at)?;
        let (_, payload) = self.datafile.read_record_checked(RECORD_TRAN_RECORD)?;
        JournalEntry::from_bytes(&payload, at.raw())
    }

    /// Reads a saved payload written by [`Journal::append`].
    pub fn read_saved(&mut self, at: Ref) -> Result<Vec<u8>> {
        self.datafile.seek(at)?;
        let (_, payload) = self.datafile.read_record_checked(RECORD_TRAN_HEADER)?;
        Ok(payload)
    }

    pub fn sync(&mut self) -> Result<()> {
        self.datafile.sync()
    }

    /// Deletes the journal file.
    pub fn discard(self) -> Result<()> {
        drop(self.datafile);
        std::fs::remove_file(&self.path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datafile::record::RECORD_IN_USE;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_entry_round_trip() {
        let entry = JournalEntry {
            kind: OpKind::Remove,
            target: Ref::from_raw(512),
            prev: Ref::from_raw(88),
            old_header: Some(RecordHeader::new(RECORD_IN_USE, 64, 48)),
            saved: Ref::from_raw(132),
        };

        let restored = JournalEntry::from_bytes(&entry.to_bytes(), 0).unwrap();

        assert_eq!(restored.kind, entry.kind);
        assert_eq!(restored.target, entry.target);
        assert_eq!(restored.prev, entry.prev);
        assert_eq!(restored.old_header, entry.old_header);
        assert_eq!(restored.saved, entry.saved);
    }

    #[test]
    fn test_fresh_write_has_no_old_header() {
        let entry = JournalEntry {
            kind: OpKind::Write,
            target: Ref::from_raw(1024),
            prev: Ref::NULL,
            old_header: None,
            saved: Ref::NULL,
        };

        let restored = JournalEntry::from_bytes(&entry.to_bytes(), 0).unwrap();

        assert!(restored.old_header.is_none());
        assert!(restored.saved.is_null());
        assert!(restored.prev.is_null());
    }

    #[test]
    fn test_append_and_walk_chain() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("main.bdb");
        let mut journal = Journal::create(&base).unwrap();

        let first = journal
            .append(OpKind::Write, Ref::from_raw(100), Ref::NULL, None, None)
            .unwrap();
        let second = journal
            .append(
                OpKind::Remove,
                Ref::from_raw(200),
                first,
                Some(RecordHeader::new(RECORD_IN_USE, 16, 16)),
                Some(b"old payload bits"),
            )
            .unwrap();

        let tail = journal.read_entry(second).unwrap();
        assert_eq!(tail.prev, first);
        assert_eq!(
            journal.read_saved(tail.saved).unwrap(),
            b"old payload bits".to_vec()
        );

        let head = journal.read_entry(tail.prev).unwrap();
        assert!(head.prev.is_null());
        assert!(head.old_header.is_none());
    }
}
