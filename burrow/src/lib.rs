//! Embedded B-tree index engine for BurrowDB
//!
//! This crate stores fixed-size keys in a disk-resident B-tree and associates
//! them with variable-length records in an append/reuse datafile. The pieces,
//! bottom up:
//!
//! - [`datafile`] — a variable-length record store with framed records, a
//!   free list of deleted slots, and a before-image journal for rollback.
//! - [`btree::page`] — fixed-order B-tree pages serialized as datafile records.
//! - [`btree`] — search, insert (split/promote), remove (redistribute/
//!   concatenate), and whole-operation transactions.
//! - [`btree::cursor`] — in-order key traversal via an explicit parent stack.
//!
//! Tree links are file offsets ([`Ref`]), never memory addresses, so the
//! structure is relocatable and shareable between handles. All public B-tree
//! operations serialize on a coarse per-datafile mutex; multiple handles
//! opened on the same path observe a single shared header and root page.

pub mod compare;
pub mod datafile;
pub mod btree;
pub mod shared;

pub use btree::{BTree, Cursor, Transaction};
pub use compare::KeyComparator;
pub use datafile::{Datafile, Ref};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("not a burrow datafile (bad signature)")]
    InvalidSignature,

    #[error("unsupported file version: expected {expected:#010x}, found {found:#010x}")]
    VersionMismatch { expected: u32, found: u32 },

    #[error("header checksum mismatch")]
    ChecksumMismatch,

    #[error("key not found")]
    NotFound,

    #[error("duplicate key")]
    Duplicate,

    #[error("datafile is open read-only")]
    ReadOnly,

    #[error("payload of {len} bytes does not fit in a slot of {slot} bytes")]
    OverwriteTooLong { len: i64, slot: i64 },

    #[error("buffer of {have} bytes is too small for a {needed}-byte record")]
    TooSmall { needed: i64, have: usize },

    #[error("a transaction is already active")]
    TransactionActive,

    #[error("no transaction is active")]
    NoTransaction,

    #[error("structural mutation refused while {0} cursor(s) are open")]
    CursorOpen(u16),

    #[error("record at {0} is already deleted")]
    DuplicateRemove(i64),

    #[error("record at {0} is deleted")]
    ReadDeleted(i64),

    #[error("page not found at {0}")]
    PageNotFound(i64),

    #[error("invalid record at {0}")]
    InvalidRecord(i64),

    #[error("page is not linked from its parent")]
    LostKey,

    #[error("key size mismatch: tree stores {expected}-byte keys, got {found}")]
    KeySize { expected: usize, found: usize },

    #[error("tree is already open for writing by another handle")]
    AlreadyOpen,
}

pub type Result<T> = std::result::Result<T, Error>;

/// Callback observing fatal-class errors before they are returned.
///
/// The engine treats structural corruption and I/O failure as fatal at the
/// point of detection and reports them through this handler; key-level
/// outcomes ([`Error::NotFound`], [`Error::Duplicate`], read-only and
/// overflow conditions) are ordinary control flow and are not reported.
/// The default handler logs through the `log` facade. A handler that wants
/// the fail-fast behavior of terminating the process may do so itself.
pub type ErrorHandler = fn(operation: &'static str, error: &Error);

/// Default [`ErrorHandler`]: log and continue (the error is still returned).
pub fn default_error_handler(operation: &'static str, error: &Error) {
    log::error!("burrow internal error in {operation}: {error}");
}
