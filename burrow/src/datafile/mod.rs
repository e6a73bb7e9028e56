//! Variable-length record datafile.
//!
//! A datafile is a single flat file holding framed records. It opens with a
//! fixed 44-byte header carrying a signature, a format version, references
//! to the deleted-record list and the active transaction tail, and a CRC32
//! of the header bytes. Records are addressed by their absolute file offset
//! ([`Ref`]); deleting a record clears its in-use flag and parks the slot on
//! a first-fit free list for reuse. While a transaction is active every
//! mutation journals a before-image, so an interrupted writer can be rolled
//! back on the next open.

pub mod freelist;
pub(crate) mod journal;
pub mod record;

use std::fmt;
use std::fs::OpenOptions;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::datafile::freelist::FreeList;
use crate::datafile::journal::{Journal, OpKind};
use crate::datafile::record::{
    RecordHeader, DATAFILE_SIGNATURE, DATAFILE_VERSION, RECORD_DELLIST, RECORD_IN_USE,
};
use crate::{default_error_handler, Error, ErrorHandler, Result};

/// Absolute file offset of a record, or [`Ref::NULL`] for "no record".
///
/// Tree links and record handles are refs, never memory addresses, so the
/// on-disk structure is position-independent and shareable between handles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Ref(i64);

impl Ref {
    pub const NULL: Ref = Ref(-1);

    pub const fn from_raw(raw: i64) -> Self {
        Ref(raw)
    }

    pub const fn raw(self) -> i64 {
        self.0
    }

    pub const fn is_null(self) -> bool {
        self.0 < 0
    }
}

impl Default for Ref {
    fn default() -> Self {
        Ref::NULL
    }
}

impl fmt::Display for Ref {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_null() {
            write!(f, "NULL")
        } else {
            write!(f, "{}", self.0)
        }
    }
}

/// Serialized size of the datafile header.
pub(crate) const FILE_HEADER_SIZE: usize = 44;

/// Fixed header at offset zero of every datafile.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct DatafileHeader {
    /// Deleted-record table, or NULL while nothing has been deleted.
    pub dellist_ref: Ref,
    /// Reserved for a schema record.
    pub schema_ref: Ref,
    /// Reserved for an index catalog record.
    pub index_list_ref: Ref,
    /// Newest journal entry of the active transaction, or NULL.
    pub transaction_tail: Ref,
}

impl DatafileHeader {
    pub fn to_bytes(&self) -> [u8; FILE_HEADER_SIZE] {
        let mut bytes = [0u8; FILE_HEADER_SIZE];

        bytes[0..4].copy_from_slice(&DATAFILE_SIGNATURE.to_le_bytes());
        bytes[4..8].copy_from_slice(&DATAFILE_VERSION.to_le_bytes());
        bytes[8..16].copy_from_slice(&self.dellist_ref.raw().to_le_bytes());
        bytes[16..24].copy_from_slice(&self.schema_ref.raw().to_le_bytes());
        bytes[24..32].copy_from_slice(&self.index_list_ref.raw().to_le_bytes());
        bytes[32..40].copy_from_slice(&self.transaction_tail.raw().to_le_bytes());

        let crc = crc32fast::hash(&bytes[0..40]);
        bytes[40..44].copy_from_slice(&crc.to_le_bytes());

        bytes
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < FILE_HEADER_SIZE {
            return Err(Error::InvalidSignature);
        }

        let signature = u32::from_le_bytes(bytes[0..4].try_into().unwrap());
        if signature != DATAFILE_SIGNATURE {
            return Err(Error::InvalidSignature);
        }

        let version = u32::from_le_bytes(bytes[4..8].try_into().unwrap());
        if version != DATAFILE_VERSION {
            return Err(Error::VersionMismatch {
                expected: DATAFILE_VERSION,
                found: version,
            });
        }

        let stored_crc = u32::from_le_bytes(bytes[40..44].try_into().unwrap());
        if crc32fast::hash(&bytes[0..40]) != stored_crc {
            return Err(Error::ChecksumMismatch);
        }

        Ok(Self {
            dellist_ref: Ref::from_raw(i64::from_le_bytes(bytes[8..16].try_into().unwrap())),
            schema_ref: Ref::from_raw(i64::from_le_bytes(bytes[16..24].try_into().unwrap())),
            index_list_ref: Ref::from_raw(i64::from_le_bytes(bytes[24..32].try_into().unwrap())),
            transaction_tail: Ref::from_raw(i64::from_le_bytes(bytes[32..40].try_into().unwrap())),
        })
    }
}

/// A variable-length record store over a single file.
///
/// Handles are not synchronized; the B-tree layer serializes access with a
/// per-file mutex. Read and remove operate at the current seek position, the
/// write entry points take an explicit target ref.
pub struct Datafile {
    file: std::fs::File,
    path: PathBuf,
    header: DatafileHeader,
    freelist: FreeList,
    error_handler: ErrorHandler,
    read_only: bool,
    in_transaction: bool,
    // boxed: Journal owns a Datafile of its own, so the inline field would
    // make the type infinitely sized
    journal: Option<Box<Journal>>,
}

impl Datafile {
    /// Creates a new datafile, truncating any existing file at `path`.
    pub fn create(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;

        let mut datafile = Self {
            file,
            path,
            header: DatafileHeader::default(),
            freelist: FreeList::new(),
            error_handler: default_error_handler,
            read_only: false,
            in_transaction: false,
            journal: None,
        };

        datafile.write_file_header()?;
        datafile.sync()?;

        log::debug!("created datafile {}", datafile.path.display());
        Ok(datafile)
    }

    /// Opens an existing datafile.
    ///
    /// With `recover` set, a journal left behind by an interrupted
    /// transaction is rolled back before the handle is returned.
    pub fn open(path: impl AsRef<Path>, recover: bool, read_only: bool) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new().read(true).write(!read_only).open(&path)?;

        let mut datafile = Self {
            file,
            path,
            header: DatafileHeader::default(),
            freelist: FreeList::new(),
            error_handler: default_error_handler,
            read_only,
            in_transaction: false,
            journal: None,
        };

        datafile.load_file_header()?;
        datafile.load_freelist()?;

        if recover {
            datafile.recover_journal()?;
        }

        log::debug!("opened datafile {}", datafile.path.display());
        Ok(datafile)
    }

    pub fn exists(path: impl AsRef<Path>) -> bool {
        path.as_ref().is_file()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub fn in_transaction(&self) -> bool {
        self.in_transaction
    }

    /// Replaces the handler observing fatal-class errors.
    pub fn set_error_handler(&mut self, handler: ErrorHandler) {
        self.error_handler = handler;
    }

    pub fn seek(&mut self, at: Ref) -> Result<()> {
        if at.is_null() {
            let err = Error::InvalidRecord(at.raw());
            self.report("datafile_seek", &err);
            return Err(err);
        }
        self.seek_to(at.raw())
    }

    pub fn tell(&mut self) -> Result<Ref> {
        Ok(Ref::from_raw(self.file.stream_position()? as i64))
    }

    /// Positions at the first record, just past the file header.
    pub fn rewind(&mut self) -> Result<()> {
        self.seek_to(FILE_HEADER_SIZE as i64)
    }

    /// Writes a plain data record, allocating a slot.
    pub fn write(&mut self, data: &[u8]) -> Result<Ref> {
        self.write_with_flags(data, Ref::NULL, 0)
    }

    /// Rewrites the record at `at` in place. The payload must fit the
    /// existing slot.
    pub fn write_at(&mut self, data: &[u8], at: Ref) -> Result<Ref> {
        self.write_with_flags(data, at, 0)
    }

    /// Writes a record with category flags. A NULL `at` allocates a slot,
    /// first-fit from the free list, else at end of file.
    pub(crate) fn write_with_flags(&mut self, data: &[u8], at: Ref, flags: u32) -> Result<Ref> {
        if self.read_only {
            return Err(Error::ReadOnly);
        }

        let len = data.len() as i64;

        let (target, slot_len, fresh) = if at.is_null() {
            match self.freelist.take_fit(len) {
                Some(slot) => {
                    self.persist_freelist()?;
                    (slot.at, slot.len, false)
                }
                None => (Ref::from_raw(self.end_of_file()?), len, true),
            }
        } else {
            let old = self.read_header_at(at)?;
            if len > old.slot_len {
                let err = Error::OverwriteTooLong {
                    len,
                    slot: old.slot_len,
                };
                self.report("datafile_write", &err);
                return Err(err);
            }
            (at, old.slot_len, false)
        };

        if fresh {
            self.journal_fresh(target)?;
        } else {
            self.journal_existing(target, OpKind::Write)?;
        }

        let header = RecordHeader::new(flags | RECORD_IN_USE, slot_len, len);
        self.seek(target)?;
        self.file.write_all(&header.to_bytes())?;
        self.file.write_all(data)?;

        Ok(target)
    }

    /// Patches `data` into the record at `at`, starting `offset` bytes into
    /// its payload. The write must stay within the payload in use.
    pub fn overwrite(&mut self, data: &[u8], at: Ref, offset: i64) -> Result<()> {
        if self.read_only {
            return Err(Error::ReadOnly);
        }

        let old = self.read_header_at(at)?;

        if !old.in_use() {
            let err = Error::ReadDeleted(at.raw());
            self.report("datafile_overwrite", &err);
            return Err(err);
        }

        let end = offset + data.len() as i64;
        if offset < 0 || end > old.rec_len {
            let err = Error::OverwriteTooLong {
                len: end,
                slot: old.rec_len,
            };
            self.report("datafile_overwrite", &err);
            return Err(err);
        }

        self.journal_before(at, OpKind::Overwrite, &old)?;

        self.seek_to(at.raw() + RecordHeader::SIZE as i64 + offset)?;
        self.file.write_all(data)?;
        Ok(())
    }

    /// Claims a slot of at least `len` bytes without storing a payload yet.
    ///
    /// Used for records whose body embeds its own offset and is written
    /// immediately after, such as tree pages.
    pub(crate) fn reserve(&mut self, len: i64) -> Result<Ref> {
        if self.read_only {
            return Err(Error::ReadOnly);
        }

        if let Some(slot) = self.freelist.take_fit(len) {
            self.persist_freelist()?;
            self.journal_existing(slot.at, OpKind::Write)?;

            let header = RecordHeader::new(RECORD_IN_USE, slot.len, len);
            self.seek(slot.at)?;
            self.file.write_all(&header.to_bytes())?;
            return Ok(slot.at);
        }

        let target = Ref::from_raw(self.end_of_file()?);
        self.journal_fresh(target)?;

        let header = RecordHeader::new(RECORD_IN_USE, len, len);
        self.seek(target)?;
        self.file.write_all(&header.to_bytes())?;
        self.file.write_all(&vec![0u8; len as usize])?;

        Ok(target)
    }

    /// Reads the payload of the record at the current position.
    pub fn read_record(&mut self) -> Result<Vec<u8>> {
        let (_, payload) = self.read_any_record(0)?;
        Ok(payload)
    }

    /// Reads the record at the current position, requiring one of the
    /// category bits in `required` to be set.
    pub(crate) fn read_record_checked(&mut self, required: u32) -> Result<(RecordHeader, Vec<u8>)> {
        self.read_any_record(required)
    }

    /// Reads the payload of the record at the current position into `buf`
    /// and returns the payload length.
    pub fn read_into(&mut self, buf: &mut [u8]) -> Result<usize> {
        let at = self.tell()?;
        let header = self.read_header_here(at)?;

        if (buf.len() as i64) < header.rec_len {
            let err = Error::TooSmall {
                needed: header.rec_len,
                have: buf.len(),
            };
            self.report("datafile_read", &err);
            return Err(err);
        }

        self.file.read_exact(&mut buf[..header.rec_len as usize])?;
        Ok(header.rec_len as usize)
    }

    /// Deletes the record at the current position and parks its slot on the
    /// free list.
    pub fn remove(&mut self) -> Result<()> {
        if self.read_only {
            return Err(Error::ReadOnly);
        }

        let at = self.tell()?;
        let slot_len = self.mark_deleted(at)?;

        self.freelist.insert(at, slot_len)?;
        self.persist_freelist()
    }

    /// Opens a transaction: creates the journal file and saves a file
    /// header image as the first undo entry.
    pub fn transaction_start(&mut self) -> Result<()> {
        if self.read_only {
            return Err(Error::ReadOnly);
        }
        if self.in_transaction {
            return Err(Error::TransactionActive);
        }

        let mut journal = Journal::create(&self.path)?;
        let image = self.header.to_bytes();
        let tail = journal.append(OpKind::FileHeader, Ref::from_raw(0), Ref::NULL, None, Some(&image))?;
        journal.sync()?;

        self.journal = Some(Box::new(journal));
        self.header.transaction_tail = tail;
        self.in_transaction = true;
        self.write_file_header()?;
        self.sync()?;

        log::debug!("transaction started on {}", self.path.display());
        Ok(())
    }

    /// Keeps every change made since [`Datafile::transaction_start`] and
    /// deletes the journal.
    pub fn transaction_commit(&mut self) -> Result<()> {
        if !self.in_transaction {
            return Err(Error::NoTransaction);
        }

        self.in_transaction = false;
        self.header.transaction_tail = Ref::NULL;
        self.write_file_header()?;
        self.sync()?;

        if let Some(journal) = self.journal.take() {
            journal.discard()?;
        }

        log::debug!("transaction committed on {}", self.path.display());
        Ok(())
    }

    /// Undoes every change made since [`Datafile::transaction_start`].
    pub fn transaction_rollback(&mut self) -> Result<()> {
        if !self.in_transaction {
            return Err(Error::NoTransaction);
        }

        self.in_transaction = false;
        let journal = self.journal.take().ok_or(Error::NoTransaction)?;
        self.rollback_with(*journal)
    }

    pub fn sync(&mut self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }

    fn report(&self, operation: &'static str, error: &Error) {
        (self.error_handler)(operation, error);
    }

    fn seek_to(&mut self, pos: i64) -> Result<()> {
        self.file.seek(SeekFrom::Start(pos as u64))?;
        Ok(())
    }

    fn end_of_file(&mut self) -> Result<i64> {
        Ok(self.file.seek(SeekFrom::End(0))? as i64)
    }

    fn write_file_header(&mut self) -> Result<()> {
        let bytes = self.header.to_bytes();
        self.seek_to(0)?;
        self.file.write_all(&bytes)?;
        Ok(())
    }

    fn load_file_header(&mut self) -> Result<()> {
        let mut bytes = [0u8; FILE_HEADER_SIZE];
        self.seek_to(0)?;
        self.file.read_exact(&mut bytes)?;

        match DatafileHeader::from_bytes(&bytes) {
            Ok(header) => {
                self.header = header;
                Ok(())
            }
            Err(err) => {
                self.report("datafile_open", &err);
                Err(err)
            }
        }
    }

    fn load_freelist(&mut self) -> Result<()> {
        self.freelist = if self.header.dellist_ref.is_null() {
            FreeList::new()
        } else {
            let at = self.header.dellist_ref;
            self.seek(at)?;
            let (_, payload) = self.read_any_record(RECORD_DELLIST)?;
            FreeList::from_bytes(&payload, at.raw())?
        };
        Ok(())
    }

    /// Rewrites the deleted-record table. If the table outgrew its slot the
    /// old slot is itself retired and a larger table is appended at end of
    /// file, so persisting can never recurse into slot reuse.
    fn persist_freelist(&mut self) -> Result<()> {
        let at = self.header.dellist_ref;

        if !at.is_null() {
            let old = self.read_header_at(at)?;

            if self.freelist.serialized_len() <= old.slot_len {
                self.journal_before(at, OpKind::Write, &old)?;

                let data = self.freelist.to_bytes();
                let header = RecordHeader::new(
                    RECORD_IN_USE | RECORD_DELLIST,
                    old.slot_len,
                    data.len() as i64,
                );
                self.seek(at)?;
                self.file.write_all(&header.to_bytes())?;
                self.file.write_all(&data)?;
                return Ok(());
            }

            let slot_len = self.mark_deleted(at)?;
            self.freelist.insert(at, slot_len)?;
        }

        let capacity = FreeList::slot_capacity(self.freelist.len());
        let target = Ref::from_raw(self.end_of_file()?);
        self.journal_fresh(target)?;

        let data = self.freelist.to_bytes();
        let header = RecordHeader::new(RECORD_IN_USE | RECORD_DELLIST, capacity, data.len() as i64);
        self.seek(target)?;
        self.file.write_all(&header.to_bytes())?;
        self.file.write_all(&data)?;
        self.file
            .write_all(&vec![0u8; (capacity - data.len() as i64) as usize])?;

        self.header.dellist_ref = target;
        self.write_file_header()
    }

    /// Clears the in-use flag of the record at `at` and returns its slot
    /// length. Does not touch the free list.
    fn mark_deleted(&mut self, at: Ref) -> Result<i64> {
        let old = self.read_header_at(at)?;

        if !old.in_use() {
            let err = Error::DuplicateRemove(at.raw());
            self.report("datafile_remove", &err);
            return Err(err);
        }

        self.journal_before(at, OpKind::Remove, &old)?;

        let header = RecordHeader::new(old.flags & !RECORD_IN_USE, old.slot_len, old.rec_len);
        self.seek(at)?;
        self.file.write_all(&header.to_bytes())?;

        Ok(old.slot_len)
    }

    fn read_header_at(&mut self, at: Ref) -> Result<RecordHeader> {
        self.seek(at)?;
        self.read_header_here(at)
    }

    fn read_header_here(&mut self, at: Ref) -> Result<RecordHeader> {
        let mut bytes = [0u8; RecordHeader::SIZE];
        self.file.read_exact(&mut bytes)?;

        match RecordHeader::from_bytes(&bytes, at.raw()) {
            Ok(header) => Ok(header),
            Err(err) => {
                self.report("datafile_read", &err);
                Err(err)
            }
        }
    }

    fn read_any_record(&mut self, required: u32) -> Result<(RecordHeader, Vec<u8>)> {
        let at = self.tell()?;
        let header = self.read_header_here(at)?;

        if !header.in_use() {
            let err = Error::ReadDeleted(at.raw());
            self.report("datafile_read", &err);
            return Err(err);
        }

        if required != 0 && header.flags & required == 0 {
            let err = Error::InvalidRecord(at.raw());
            self.report("datafile_read", &err);
            return Err(err);
        }

        let mut payload = vec![0u8; header.rec_len as usize];
        self.file.read_exact(&mut payload)?;
        Ok((header, payload))
    }

    /// Journals a before-image for the record at `target` using an already
    /// read header.
    fn journal_before(&mut self, target: Ref, kind: OpKind, old: &RecordHeader) -> Result<()> {
        if !self.in_transaction {
            return Ok(());
        }

        let mut payload = vec![0u8; old.rec_len as usize];
        self.seek_to(target.raw() + RecordHeader::SIZE as i64)?;
        self.file.read_exact(&mut payload)?;

        let prev = self.header.transaction_tail;
        let journal = self.journal.as_mut().ok_or(Error::NoTransaction)?;
        let tail = journal.append(kind, target, prev, Some(*old), Some(&payload))?;

        self.header.transaction_tail = tail;
        self.write_file_header()
    }

    fn journal_existing(&mut self, target: Ref, kind: OpKind) -> Result<()> {
        if !self.in_transaction {
            return Ok(());
        }

        let old = self.read_header_at(target)?;
        self.journal_before(target, kind, &old)
    }

    /// Journals an end-of-file append. There is no before-image; undo
    /// clears the in-use flag and frees the slot.
    fn journal_fresh(&mut self, target: Ref) -> Result<()> {
        if !self.in_transaction {
            return Ok(());
        }

        let prev = self.header.transaction_tail;
        let journal = self.journal.as_mut().ok_or(Error::NoTransaction)?;
        let tail = journal.append(OpKind::Write, target, prev, None, None)?;

        self.header.transaction_tail = tail;
        self.write_file_header()
    }

    /// Walks the journal chain newest to oldest, restoring before-images.
    /// The file header image written at transaction start is restored last,
    /// bringing back the pre-transaction dellist ref and a NULL tail.
    fn rollback_with(&mut self, mut journal: Journal) -> Result<()> {
        let mut at = self.header.transaction_tail;
        let mut freed: Vec<(Ref, i64)> = Vec::new();

        while !at.is_null() {
            let entry = journal.read_entry(at)?;

            match entry.kind {
                OpKind::FileHeader => {
                    let image = journal.read_saved(entry.saved)?;
                    self.seek_to(0)?;
                    self.file.write_all(&image)?;
                }
                OpKind::Write | OpKind::Remove | OpKind::Overwrite => match entry.old_header {
                    Some(old) => {
                        self.seek(entry.target)?;
                        self.file.write_all(&old.to_bytes())?;
                        if !entry.saved.is_null() {
                            let payload = journal.read_saved(entry.saved)?;
                            self.file.write_all(&payload)?;
                        }
                    }
                    None => {
                        let current = self.read_header_at(entry.target)?;
                        let header = RecordHeader::new(
                            current.flags & !RECORD_IN_USE,
                            current.slot_len,
                            current.rec_len,
                        );
                        self.seek(entry.target)?;
                        self.file.write_all(&header.to_bytes())?;
                        freed.push((entry.target, current.slot_len));
                    }
                },
            }

            at = entry.prev;
        }

        self.load_file_header()?;
        self.load_freelist()?;

        // Slots appended past the pre-transaction end of file are dead
        // space now; make them reusable.
        if !freed.is_empty() {
            for (slot, len) in freed {
                if let Err(err) = self.freelist.insert(slot, len) {
                    self.report("transaction_rollback", &err);
                }
            }
            self.persist_freelist()?;
        }

        self.sync()?;
        journal.discard()?;

        log::debug!("transaction rolled back on {}", self.path.display());
        Ok(())
    }

    fn recover_journal(&mut self) -> Result<()> {
        if Journal::exists(&self.path) {
            if self.header.transaction_tail.is_null() {
                log::warn!("removing stale journal for {}", self.path.display());
                std::fs::remove_file(Journal::path_for(&self.path))?;
            } else {
                if self.read_only {
                    let err = Error::ReadOnly;
                    self.report("datafile_open", &err);
                    return Err(err);
                }
                log::warn!(
                    "rolling back interrupted transaction on {}",
                    self.path.display()
                );
                let journal = Journal::open(&self.path)?;
                self.rollback_with(journal)?;
            }
        } else if !self.header.transaction_tail.is_null() {
            log::warn!(
                "transaction tail set but journal missing for {}, clearing",
                self.path.display()
            );
            self.header.transaction_tail = Ref::NULL;
            if !self.read_only {
                self.write_file_header()?;
            }
        }
        Ok(())
    }
}

impl Drop for Datafile {
    fn drop(&mut self) {
        if !self.read_only {
            let _ = self.file.sync_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::fs;
    use tempfile::tempdir;

    fn scratch(name: &str) -> (tempfile::TempDir, PathBuf) {
        let dir = tempdir().unwrap();
        let path = dir.path().join(name);
        (dir, path)
    }

    #[test]
    fn test_create_write_reopen_read() {
        let (_dir, path) = scratch("basic.bdb");

        let at = {
            let mut df = Datafile::create(&path).unwrap();
            df.write(b"hello records").unwrap()
        };

        let mut df = Datafile::open(&path, true, false).unwrap();
        df.seek(at).unwrap();
        assert_eq!(df.read_record().unwrap(), b"hello records".to_vec());
    }

    #[test]
    fn test_rejects_foreign_file() {
        let (_dir, path) = scratch("foreign.bdb");
        fs::write(&path, vec![0u8; 128]).unwrap();

        assert!(matches!(
            Datafile::open(&path, false, false),
            Err(Error::InvalidSignature)
        ));
    }

    #[test]
    fn test_rejects_version_mismatch() {
        let (_dir, path) = scratch("version.bdb");
        drop(Datafile::create(&path).unwrap());

        let mut bytes = fs::read(&path).unwrap();
        bytes[4..8].copy_from_slice(&0x1234_5678u32.to_le_bytes());
        // keep the checksum consistent so only the version trips
        let crc = crc32fast::hash(&bytes[0..40]);
        bytes[40..44].copy_from_slice(&crc.to_le_bytes());
        fs::write(&path, bytes).unwrap();

        assert!(matches!(
            Datafile::open(&path, false, false),
            Err(Error::VersionMismatch { found: 0x1234_5678, .. })
        ));
    }

    #[test]
    fn test_rejects_corrupt_header() {
        let (_dir, path) = scratch("crc.bdb");
        drop(Datafile::create(&path).unwrap());

        let mut bytes = fs::read(&path).unwrap();
        bytes[10] ^= 0xFF;
        fs::write(&path, bytes).unwrap();

        assert!(matches!(
            Datafile::open(&path, false, false),
            Err(Error::ChecksumMismatch)
        ));
    }

    #[test]
    fn test_deleted_slot_is_reused_first_fit() {
        let (_dir, path) = scratch("reuse.bdb");
        let mut df = Datafile::create(&path).unwrap();

        let first = df.write(&[1u8; 64]).unwrap();
        let _second = df.write(&[2u8; 64]).unwrap();

        df.seek(first).unwrap();
        df.remove().unwrap();

        // smaller payload fits the freed 64-byte slot
        let third = df.write(&[3u8; 40]).unwrap();
        assert_eq!(third, first);

        df.seek(third).unwrap();
        assert_eq!(df.read_record().unwrap(), vec![3u8; 40]);
    }

    #[test]
    fn test_freelist_survives_reopen() {
        let (_dir, path) = scratch("reuse2.bdb");

        let first = {
            let mut df = Datafile::create(&path).unwrap();
            let first = df.write(&[1u8; 64]).unwrap();
            df.write(&[2u8; 64]).unwrap();
            df.seek(first).unwrap();
            df.remove().unwrap();
            first
        };

        let mut df = Datafile::open(&path, true, false).unwrap();
        assert_eq!(df.write(&[3u8; 64]).unwrap(), first);
    }

    #[test]
    fn test_read_deleted_record_fails() {
        let (_dir, path) = scratch("deleted.bdb");
        let mut df = Datafile::create(&path).unwrap();

        let at = df.write(b"doomed").unwrap();
        df.seek(at).unwrap();
        df.remove().unwrap();

        df.seek(at).unwrap();
        assert!(matches!(df.read_record(), Err(Error::ReadDeleted(_))));
    }

    #[test]
    fn test_double_remove_fails() {
        let (_dir, path) = scratch("double.bdb");
        let mut df = Datafile::create(&path).unwrap();

        let at = df.write(b"once").unwrap();
        df.seek(at).unwrap();
        df.remove().unwrap();

        df.seek(at).unwrap();
        assert!(matches!(df.remove(), Err(Error::DuplicateRemove(_))));
    }

    #[test]
    fn test_overwrite_patches_payload() {
        let (_dir, path) = scratch("patch.bdb");
        let mut df = Datafile::create(&path).unwrap();

        let at = df.write(b"aaaaaaaa").unwrap();
        df.overwrite(b"XY", at, 3).unwrap();

        df.seek(at).unwrap();
        assert_eq!(df.read_record().unwrap(), b"aaaXYaaa".to_vec());
    }

    #[test]
    fn test_overwrite_past_payload_fails() {
        let (_dir, path) = scratch("patch2.bdb");
        let mut df = Datafile::create(&path).unwrap();

        let at = df.write(b"short").unwrap();
        assert!(matches!(
            df.overwrite(b"too much data", at, 0),
            Err(Error::OverwriteTooLong { .. })
        ));
    }

    #[test]
    fn test_write_at_larger_than_slot_fails() {
        let (_dir, path) = scratch("slot.bdb");
        let mut df = Datafile::create(&path).unwrap();

        let at = df.write(&[0u8; 16]).unwrap();
        assert!(matches!(
            df.write_at(&[1u8; 32], at),
            Err(Error::OverwriteTooLong { len: 32, slot: 16 })
        ));

        // in-place rewrite with a smaller payload keeps the slot length
        df.write_at(&[1u8; 8], at).unwrap();
        df.seek(at).unwrap();
        let (header, payload) = df.read_record_checked(0).unwrap();
        assert_eq!(header.slot_len, 16);
        assert_eq!(payload, vec![1u8; 8]);
    }

    #[test]
    fn test_read_only_refuses_writes() {
        let (_dir, path) = scratch("ro.bdb");
        drop(Datafile::create(&path).unwrap());

        let mut df = Datafile::open(&path, false, true).unwrap();
        assert!(matches!(df.write(b"nope"), Err(Error::ReadOnly)));
        assert!(matches!(df.transaction_start(), Err(Error::ReadOnly)));
    }

    #[test]
    fn test_reserve_then_write_at() {
        let (_dir, path) = scratch("reserve.bdb");
        let mut df = Datafile::create(&path).unwrap();

        let at = df.reserve(32).unwrap();
        df.write_at(&[7u8; 32], at).unwrap();

        df.seek(at).unwrap();
        assert_eq!(df.read_record().unwrap(), vec![7u8; 32]);
    }

    #[test]
    fn test_commit_keeps_changes() {
        let (_dir, path) = scratch("commit.bdb");
        let mut df = Datafile::create(&path).unwrap();

        let before = df.write(b"original").unwrap();

        df.transaction_start().unwrap();
        df.write_at(b"replaced", before).unwrap();
        let added = df.write(b"brand new").unwrap();
        df.transaction_commit().unwrap();

        df.seek(before).unwrap();
        assert_eq!(df.read_record().unwrap(), b"replaced".to_vec());
        df.seek(added).unwrap();
        assert_eq!(df.read_record().unwrap(), b"brand new".to_vec());
        assert!(!Journal::exists(&path));
    }

    #[test]
    fn test_rollback_restores_changes() {
        let (_dir, path) = scratch("rollback.bdb");
        let mut df = Datafile::create(&path).unwrap();

        let kept = df.write(b"original").unwrap();
        let removed = df.write(b"survivor").unwrap();

        df.transaction_start().unwrap();
        df.write_at(b"replaced", kept).unwrap();
        df.seek(removed).unwrap();
        df.remove().unwrap();
        let added = df.write(b"ephemeral").unwrap();
        df.transaction_rollback().unwrap();

        df.seek(kept).unwrap();
        assert_eq!(df.read_record().unwrap(), b"original".to_vec());
        df.seek(removed).unwrap();
        assert_eq!(df.read_record().unwrap(), b"survivor".to_vec());
        df.seek(added).unwrap();
        assert!(matches!(df.read_record(), Err(Error::ReadDeleted(_))));
        assert!(!Journal::exists(&path));
    }

    #[test]
    fn test_interrupted_transaction_recovered_on_open() {
        let (_dir, path) = scratch("crash.bdb");

        let (kept, added) = {
            let mut df = Datafile::create(&path).unwrap();
            let kept = df.write(b"stable value").unwrap();

            df.transaction_start().unwrap();
            df.write_at(b"torn write!!", kept).unwrap();
            let added = df.write(b"uncommitted").unwrap();
            // drop without commit, as a crashed process would
            (kept, added)
        };

        assert!(Journal::exists(&path));

        let mut df = Datafile::open(&path, true, false).unwrap();
        assert!(!Journal::exists(&path));

        df.seek(kept).unwrap();
        assert_eq!(df.read_record().unwrap(), b"stable value".to_vec());
        df.seek(added).unwrap();
        assert!(matches!(df.read_record(), Err(Error::ReadDeleted(_))));
    }

    #[test]
    fn test_stale_journal_is_discarded() {
        let (_dir, path) = scratch("stale.bdb");
        drop(Datafile::create(&path).unwrap());

        // a journal with no transaction tail in the main header
        drop(Journal::create(&path).unwrap());
        assert!(Journal::exists(&path));

        drop(Datafile::open(&path, true, false).unwrap());
        assert!(!Journal::exists(&path));
    }

    #[test]
    fn test_nested_transactions_rejected() {
        let (_dir, path) = scratch("nested.bdb");
        let mut df = Datafile::create(&path).unwrap();

        df.transaction_start().unwrap();
        assert!(matches!(
            df.transaction_start(),
            Err(Error::TransactionActive)
        ));
        df.transaction_commit().unwrap();

        assert!(matches!(df.transaction_commit(), Err(Error::NoTransaction)));
        assert!(matches!(
            df.transaction_rollback(),
            Err(Error::NoTransaction)
        ));
    }

    #[test]
    fn test_read_into_reports_short_buffer() {
        let (_dir, path) = scratch("into.bdb");
        let mut df = Datafile::create(&path).unwrap();

        let at = df.write(b"twelve bytes").unwrap();

        let mut small = [0u8; 4];
        df.seek(at).unwrap();
        assert!(matches!(
            df.read_into(&mut small),
            Err(Error::TooSmall { needed: 12, have: 4 })
        ));

        let mut big = [0u8; 64];
        df.seek(at).unwrap();
        assert_eq!(df.read_into(&mut big).unwrap(), 12);
        assert_eq!(&big[..12], b"twelve bytes");
    }
}
