//! Disk-resident B-tree.
//!
//! Keys live in fixed-order pages stored as datafile records; child links
//! are record offsets. Insertion splits full pages bottom-up, promoting the
//! median key; removal swaps interior keys with their in-order successor
//! and rebalances underflowed pages by borrowing from or merging with a
//! sibling. A tree header record tracks the key count, a monotonic insert
//! ticker, and the current root offset.
//!
//! Handles opened on the same path share one [`TreeCore`] through the
//! process-wide registry in [`crate::shared`], so every handle observes the
//! same header and root page. All operations serialize on the core's mutex.

pub mod cursor;
pub mod page;

pub use cursor::Cursor;

use std::cmp::Ordering;
use std::path::Path;
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};

use crate::btree::page::Page;
use crate::compare::KeyComparator;
use crate::datafile::record::{RECORD_BTREE_HEADER, RECORD_BTREE_PAGE};
use crate::datafile::{Datafile, Ref};
use crate::{shared, Error, ErrorHandler, Result};

/// Smallest usable page order.
pub const ORDER_MINIMUM: usize = 4;

/// Default page order when the caller has no preference.
pub const ORDER_DEFAULT: usize = 25;

/// Persistent tree state, stored as the first record of the datafile.
#[derive(Debug, Clone, Copy)]
pub(crate) struct TreeHeader {
    pub page_size: u32,
    pub key_size: u32,
    pub order: u16,
    /// Live key count.
    pub count: u64,
    /// Total keys ever inserted; never decremented.
    pub ticker: u64,
    /// Offset of this header record.
    pub at: Ref,
    pub root_ref: Ref,
    /// Reserved for a schema record.
    pub schema_ref: Ref,
}

impl TreeHeader {
    pub const SIZE: usize = 56;
    pub const VERSION: u32 = 0x0004_0000;

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut bytes = [0u8; Self::SIZE];

        bytes[0..4].copy_from_slice(&Self::VERSION.to_le_bytes());
        bytes[4..8].copy_from_slice(&self.page_size.to_le_bytes());
        bytes[8..12].copy_from_slice(&self.key_size.to_le_bytes());
        bytes[12..14].copy_from_slice(&self.order.to_le_bytes());
        bytes[16..24].copy_from_slice(&self.count.to_le_bytes());
        bytes[24..32].copy_from_slice(&self.ticker.to_le_bytes());
        bytes[32..40].copy_from_slice(&self.at.raw().to_le_bytes());
        bytes[40..48].copy_from_slice(&self.root_ref.raw().to_le_bytes());
        bytes[48..56].copy_from_slice(&self.schema_ref.raw().to_le_bytes());

        bytes
    }

    pub fn from_bytes(bytes: &[u8], at: Ref) -> Result<Self> {
        if bytes.len() < Self::SIZE {
            return Err(Error::InvalidRecord(at.raw()));
        }

        let version = u32::from_le_bytes(bytes[0..4].try_into().unwrap());
        if version != Self::VERSION {
            return Err(Error::VersionMismatch {
                expected: Self::VERSION,
                found: version,
            });
        }

        let stored_at = Ref::from_raw(i64::from_le_bytes(bytes[32..40].try_into().unwrap()));
        if stored_at != at {
            return Err(Error::InvalidRecord(at.raw()));
        }

        Ok(Self {
            page_size: u32::from_le_bytes(bytes[4..8].try_into().unwrap()),
            key_size: u32::from_le_bytes(bytes[8..12].try_into().unwrap()),
            order: u16::from_le_bytes(bytes[12..14].try_into().unwrap()),
            count: u64::from_le_bytes(bytes[16..24].try_into().unwrap()),
            ticker: u64::from_le_bytes(bytes[24..32].try_into().unwrap()),
            at,
            root_ref: Ref::from_raw(i64::from_le_bytes(bytes[40..48].try_into().unwrap())),
            schema_ref: Ref::from_raw(i64::from_le_bytes(bytes[48..56].try_into().unwrap())),
        })
    }
}

pub(crate) struct SearchOutcome {
    pub page: Page,
    pub index: usize,
    pub found: bool,
}

/// Tree state shared by every handle on one file. Callers hold the
/// enclosing mutex for the duration of an operation.
pub(crate) struct TreeCore {
    pub datafile: Datafile,
    pub header: TreeHeader,
    /// In-memory mirror of the root page, refreshed whenever a root-level
    /// page is persisted.
    pub root: Page,
    pub cursor_count: u16,
    min_keys: usize,
}

impl TreeCore {
    fn key_size(&self) -> usize {
        self.header.key_size as usize
    }

    fn order(&self) -> usize {
        self.header.order as usize
    }

    pub(crate) fn read_page(&mut self, at: Ref) -> Result<Page> {
        self.datafile.seek(at)?;
        let (_, payload) = self.datafile.read_record_checked(RECORD_BTREE_PAGE)?;
        Page::from_bytes(&payload, self.key_size(), self.order(), at)
    }

    /// Writes a page back to its record. A page persisted with no parent is
    /// the root: the in-memory mirror and the header's root ref follow it.
    fn persist_page(&mut self, page: &Page) -> Result<()> {
        let at = self
            .datafile
            .write_with_flags(&page.to_bytes(), page.at(), RECORD_BTREE_PAGE)?;
        if at != page.at() {
            return Err(Error::PageNotFound(page.at().raw()));
        }

        if page.parent().is_null() {
            self.root = page.clone();
            if self.header.root_ref != page.at() {
                self.header.root_ref = page.at();
                self.update_header()?;
            }
        }
        Ok(())
    }

    fn update_header(&mut self) -> Result<()> {
        let bytes = self.header.to_bytes();
        self.datafile
            .write_with_flags(&bytes, self.header.at, RECORD_BTREE_HEADER)?;
        Ok(())
    }

    fn reserve_page(&mut self) -> Result<Ref> {
        self.datafile.reserve(self.header.page_size as i64)
    }

    /// Descends from the root comparing keys in page order. Returns the
    /// page holding the key, or the leaf where it would be inserted.
    pub(crate) fn search(&mut self, comparator: KeyComparator, key: &[u8]) -> Result<SearchOutcome> {
        let mut page = self.root.clone();

        loop {
            let mut index = 0;

            while index < page.key_count() {
                match comparator(key, page.key(index)) {
                    Ordering::Greater => index += 1,
                    Ordering::Equal => {
                        return Ok(SearchOutcome {
                            page,
                            index,
                            found: true,
                        })
                    }
                    Ordering::Less => break,
                }
            }

            let child = page.link(index);
            if child.is_null() {
                return Ok(SearchOutcome {
                    page,
                    index,
                    found: false,
                });
            }
            page = self.read_page(child)?;
        }
    }

    pub(crate) fn find(&mut self, comparator: KeyComparator, key: &[u8]) -> Result<Vec<u8>> {
        let outcome = self.search(comparator, key)?;
        if outcome.found {
            Ok(outcome.page.key(outcome.index).to_vec())
        } else {
            Err(Error::NotFound)
        }
    }

    pub(crate) fn insert(&mut self, comparator: KeyComparator, key: &[u8]) -> Result<()> {
        if self.cursor_count > 0 {
            return Err(Error::CursorOpen(self.cursor_count));
        }

        let outcome = self.search(comparator, key)?;
        if outcome.found {
            return Err(Error::Duplicate);
        }

        let mut page = outcome.page;
        if page.is_full() {
            self.split_and_promote(comparator, page, key, Ref::NULL)?;
        } else {
            self.insert_key(&mut page, comparator, key, Ref::NULL)?;
        }

        self.header.count += 1;
        self.header.ticker += 1;
        self.update_header()
    }

    /// Places `key` into a page with room, shifting larger keys and their
    /// right-hand links over by one.
    fn insert_key(
        &mut self,
        page: &mut Page,
        comparator: KeyComparator,
        key: &[u8],
        right_link: Ref,
    ) -> Result<()> {
        let count = page.key_count();

        let mut index = 0;
        while index < count && comparator(key, page.key(index)) == Ordering::Greater {
            index += 1;
        }

        let mut n = count;
        while n > index {
            page.move_key(n - 1, n);
            page.set_link(n + 1, page.link(n));
            n -= 1;
        }

        page.set_key(index, key);
        page.set_link(index + 1, right_link);
        page.set_key_count(count + 1);

        self.persist_page(page)
    }

    /// Splits a full page around its median. The lower keys stay, the upper
    /// keys move to a new sibling, and the median is promoted into the
    /// parent, splitting it in turn if full.
    fn split_and_promote(
        &mut self,
        comparator: KeyComparator,
        mut page: Page,
        key: &[u8],
        right_link: Ref,
    ) -> Result<()> {
        let order = self.order();
        let key_size = self.key_size();

        // merge the page's keys and the new key into sorted scratch arrays
        let mut insert_at = 0;
        while insert_at < order && comparator(key, page.key(insert_at)) == Ordering::Greater {
            insert_at += 1;
        }

        let mut temp_keys: Vec<u8> = Vec::with_capacity((order + 1) * key_size);
        let mut temp_links: Vec<Ref> = Vec::with_capacity(order + 2);

        temp_links.push(page.link(0));
        for n in 0..order {
            if n == insert_at {
                temp_keys.extend_from_slice(key);
                temp_links.push(right_link);
            }
            temp_keys.extend_from_slice(page.key(n));
            temp_links.push(page.link(n + 1));
        }
        if insert_at == order {
            temp_keys.extend_from_slice(key);
            temp_links.push(right_link);
        }

        let min_keys = self.min_keys;
        let temp_key = |n: usize| &temp_keys[n * key_size..(n + 1) * key_size];

        // lower half stays in place
        for n in 0..order {
            page.clear_key(n);
        }
        for n in 0..min_keys {
            page.set_key(n, temp_key(n));
        }
        for n in 0..=order {
            let link = if n <= min_keys { temp_links[n] } else { Ref::NULL };
            page.set_link(n, link);
        }
        page.set_key_count(min_keys);

        // upper half moves to a new sibling
        let mut sibling = Page::new(key_size, order);
        sibling.set_parent(page.parent());
        sibling.set_at(self.reserve_page()?);

        let upper = order - min_keys;
        for n in 0..upper {
            let src = min_keys + 1 + n;
            sibling.set_key(n, temp_key(src));
            sibling.set_link(n, temp_links[src]);
        }
        sibling.set_link(upper, temp_links[order + 1]);
        sibling.set_key_count(upper);

        let median = temp_key(min_keys).to_vec();

        if page.parent().is_null() {
            self.promote_root(&median, page, sibling)
        } else {
            self.persist_page(&page)?;
            self.persist_page(&sibling)?;
            self.reparent_children(&sibling)?;

            let mut parent = self.read_page(page.parent())?;
            if parent.is_full() {
                self.split_and_promote(comparator, parent, &median, sibling.at())
            } else {
                self.insert_key(&mut parent, comparator, &median, sibling.at())
            }
        }
    }

    /// Builds a fresh one-key root above two halves of a split root.
    fn promote_root(&mut self, median: &[u8], mut before: Page, mut after: Page) -> Result<()> {
        let mut root = Page::new(self.key_size(), self.order());
        root.set_at(self.reserve_page()?);
        root.set_key(0, median);
        root.set_key_count(1);
        root.set_link(0, before.at());
        root.set_link(1, after.at());

        self.persist_page(&root)?;

        before.set_parent(root.at());
        after.set_parent(root.at());
        self.persist_page(&before)?;
        self.persist_page(&after)?;
        self.reparent_children(&after)?;

        Ok(())
    }

    fn reparent_children(&mut self, page: &Page) -> Result<()> {
        if page.is_leaf() {
            return Ok(());
        }
        for n in 0..=page.key_count() {
            let mut child = self.read_page(page.link(n))?;
            child.set_parent(page.at());
            self.persist_page(&child)?;
        }
        Ok(())
    }

    pub(crate) fn remove(&mut self, comparator: KeyComparator, key: &[u8]) -> Result<()> {
        if self.cursor_count > 0 {
            return Err(Error::CursorOpen(self.cursor_count));
        }

        let outcome = self.search(comparator, key)?;
        if !outcome.found {
            return Err(Error::NotFound);
        }

        let mut page = outcome.page;
        let index = outcome.index;

        let leaf = if page.is_leaf() {
            self.delete_from_leaf(&mut page, index)?;
            page
        } else {
            // interior key: swap in the in-order successor, the smallest
            // key of the right subtree, then delete it from its leaf
            let mut succ = self.read_page(page.link(index + 1))?;
            while !succ.is_leaf() {
                succ = self.read_page(succ.link(0))?;
            }

            let succ_key = succ.key(0).to_vec();
            page.set_key(index, &succ_key);
            self.persist_page(&page)?;

            self.delete_from_leaf(&mut succ, 0)?;
            succ
        };

        self.adjust_tree(leaf)?;

        self.header.count -= 1;
        self.update_header()
    }

    fn delete_from_leaf(&mut self, page: &mut Page, index: usize) -> Result<()> {
        let count = page.key_count();
        for n in index + 1..count {
            page.move_key(n, n - 1);
        }
        page.clear_key(count - 1);
        page.set_key_count(count - 1);
        self.persist_page(page)
    }

    /// Rebalances upward from an underflowed page. Prefers the left
    /// sibling; borrows a key through the parent separator when the sibling
    /// can spare one, otherwise merges the two pages and recurses on the
    /// parent.
    fn adjust_tree(&mut self, start: Page) -> Result<()> {
        let mut page = start;

        while page.key_count() < self.min_keys && !page.parent().is_null() {
            let mut parent = self.read_page(page.parent())?;

            let position = (0..=parent.key_count())
                .find(|&n| parent.link(n) == page.at())
                .ok_or(Error::LostKey)?;

            if position > 0 {
                let sibling = self.read_page(parent.link(position - 1))?;
                if sibling.key_count() > self.min_keys {
                    self.borrow_from_left(&mut page, sibling, &mut parent, position - 1)?;
                    break;
                }
                page = self.concatenate(sibling, page, parent, position - 1)?;
            } else {
                let sibling = self.read_page(parent.link(position + 1))?;
                if sibling.key_count() > self.min_keys {
                    self.borrow_from_right(&mut page, sibling, &mut parent, position)?;
                    break;
                }
                page = self.concatenate(page, sibling, parent, position)?;
            }
        }

        Ok(())
    }

    /// Rotates one key from the left sibling through the parent separator
    /// into `page`.
    fn borrow_from_left(
        &mut self,
        page: &mut Page,
        mut sibling: Page,
        parent: &mut Page,
        sep: usize,
    ) -> Result<()> {
        let count = page.key_count();

        let mut n = count;
        while n > 0 {
            page.move_key(n - 1, n);
            n -= 1;
        }
        let mut n = count + 1;
        while n > 0 {
            page.set_link(n, page.link(n - 1));
            n -= 1;
        }

        page.set_key(0, parent.key(sep));
        let moved = sibling.link(sibling.key_count());
        page.set_link(0, moved);
        page.set_key_count(count + 1);

        parent.set_key(sep, sibling.key(sibling.key_count() - 1));

        let scount = sibling.key_count();
        sibling.clear_key(scount - 1);
        sibling.set_link(scount, Ref::NULL);
        sibling.set_key_count(scount - 1);

        self.persist_page(page)?;
        self.persist_page(&sibling)?;
        self.persist_page(parent)?;

        if !moved.is_null() {
            let mut child = self.read_page(moved)?;
            child.set_parent(page.at());
            self.persist_page(&child)?;
        }
        Ok(())
    }

    /// Rotates one key from the right sibling through the parent separator
    /// into `page`.
    fn borrow_from_right(
        &mut self,
        page: &mut Page,
        mut sibling: Page,
        parent: &mut Page,
        sep: usize,
    ) -> Result<()> {
        let count = page.key_count();

        page.set_key(count, parent.key(sep));
        let moved = sibling.link(0);
        page.set_link(count + 1, moved);
        page.set_key_count(count + 1);

        parent.set_key(sep, sibling.key(0));

        let scount = sibling.key_count();
        for n in 1..scount {
            sibling.move_key(n, n - 1);
        }
        for n in 0..scount {
            sibling.set_link(n, sibling.link(n + 1));
        }
        sibling.clear_key(scount - 1);
        sibling.set_link(scount, Ref::NULL);
        sibling.set_key_count(scount - 1);

        self.persist_page(page)?;
        self.persist_page(&sibling)?;
        self.persist_page(parent)?;

        if !moved.is_null() {
            let mut child = self.read_page(moved)?;
            child.set_parent(page.at());
            self.persist_page(&child)?;
        }
        Ok(())
    }

    /// Merges `right` and the parent separator into `left`, deletes the
    /// emptied page's record, and removes the separator from the parent.
    /// Returns the page to examine next; an emptied root hands the tree to
    /// the merged page.
    fn concatenate(
        &mut self,
        mut left: Page,
        right: Page,
        mut parent: Page,
        sep: usize,
    ) -> Result<Page> {
        let base = left.key_count();

        left.set_key(base, parent.key(sep));
        for n in 0..right.key_count() {
            left.set_key(base + 1 + n, right.key(n));
            left.set_link(base + 1 + n, right.link(n));
        }
        left.set_link(base + 1 + right.key_count(), right.link(right.key_count()));
        left.set_key_count(base + 1 + right.key_count());

        self.persist_page(&left)?;

        if !left.is_leaf() {
            for n in base + 1..=left.key_count() {
                let mut child = self.read_page(left.link(n))?;
                child.set_parent(left.at());
                self.persist_page(&child)?;
            }
        }

        self.datafile.seek(right.at())?;
        self.datafile.remove()?;

        let pcount = parent.key_count();
        for n in sep + 1..pcount {
            parent.move_key(n, n - 1);
            parent.set_link(n, parent.link(n + 1));
        }
        parent.clear_key(pcount - 1);
        parent.set_link(pcount, Ref::NULL);
        parent.set_key_count(pcount - 1);

        if parent.parent().is_null() && parent.key_count() == 0 {
            // the root emptied out; the merged page is the new root
            left.set_parent(Ref::NULL);
            self.persist_page(&left)?;
            self.datafile.seek(parent.at())?;
            self.datafile.remove()?;
            return Ok(left);
        }

        self.persist_page(&parent)?;
        Ok(parent)
    }
}

/// Handle on a disk-resident B-tree.
///
/// Cloning a handle, or opening the same path again, shares the underlying
/// tree; all handles observe every change immediately.
#[derive(Clone)]
pub struct BTree {
    pub(crate) core: Arc<Mutex<TreeCore>>,
    pub(crate) comparator: KeyComparator,
    read_only: bool,
}

impl BTree {
    /// Creates a new tree file. Fails with [`Error::AlreadyOpen`] when a
    /// live handle exists on the same path.
    pub fn create(
        path: impl AsRef<Path>,
        key_size: usize,
        order: usize,
        comparator: KeyComparator,
    ) -> Result<Self> {
        Self::create_with_handler(path, key_size, order, comparator, crate::default_error_handler)
    }

    /// [`BTree::create`] with a custom handler for fatal-class errors.
    pub fn create_with_handler(
        path: impl AsRef<Path>,
        key_size: usize,
        order: usize,
        comparator: KeyComparator,
        handler: ErrorHandler,
    ) -> Result<Self> {
        let path = path.as_ref();

        if key_size == 0 {
            return Err(Error::KeySize {
                expected: 1,
                found: 0,
            });
        }
        let order = order.max(ORDER_MINIMUM);

        let core = shared::create(&shared::key_for(path), || {
            let mut datafile = Datafile::create(path)?;
            datafile.set_error_handler(handler);

            let page_size = Page::serialized_size(key_size, order);
            let mut header = TreeHeader {
                page_size: page_size as u32,
                key_size: key_size as u32,
                order: order as u16,
                count: 0,
                ticker: 0,
                at: Ref::NULL,
                root_ref: Ref::NULL,
                schema_ref: Ref::NULL,
            };

            header.at = datafile.reserve(TreeHeader::SIZE as i64)?;
            datafile.write_with_flags(&header.to_bytes(), header.at, RECORD_BTREE_HEADER)?;

            let mut root = Page::new(key_size, order);
            root.set_at(datafile.reserve(page_size as i64)?);
            datafile.write_with_flags(&root.to_bytes(), root.at(), RECORD_BTREE_PAGE)?;

            header.root_ref = root.at();
            datafile.write_with_flags(&header.to_bytes(), header.at, RECORD_BTREE_HEADER)?;
            datafile.sync()?;

            log::debug!(
                "created btree {} (order {order}, {key_size}-byte keys)",
                path.display()
            );

            Ok(Mutex::new(TreeCore {
                datafile,
                header,
                root,
                cursor_count: 0,
                min_keys: order / 2,
            }))
        })?;

        Ok(Self {
            core,
            comparator,
            read_only: false,
        })
    }

    /// Opens an existing tree. When a live handle already exists for the
    /// path it is shared and `recover`/`read_only` are ignored; otherwise
    /// the file is opened fresh, rolling back an interrupted transaction
    /// when `recover` is set.
    pub fn open(
        path: impl AsRef<Path>,
        comparator: KeyComparator,
        recover: bool,
        read_only: bool,
    ) -> Result<Self> {
        let path = path.as_ref();

        let (core, _created) = shared::obtain(&shared::key_for(path), || {
            let mut datafile = Datafile::open(path, recover, read_only)?;

            datafile.rewind()?;
            let at = datafile.tell()?;
            let (_, payload) = datafile.read_record_checked(RECORD_BTREE_HEADER)?;
            let header = TreeHeader::from_bytes(&payload, at)?;

            let key_size = header.key_size as usize;
            let order = header.order as usize;

            datafile.seek(header.root_ref)?;
            let (_, payload) = datafile.read_record_checked(RECORD_BTREE_PAGE)?;
            let root = Page::from_bytes(&payload, key_size, order, header.root_ref)?;

            log::debug!("opened btree {} ({} keys)", path.display(), header.count);

            Ok(Mutex::new(TreeCore {
                datafile,
                header,
                root,
                cursor_count: 0,
                min_keys: order / 2,
            }))
        })?;

        Ok(Self {
            core,
            comparator,
            read_only,
        })
    }

    fn check_key(core: &TreeCore, key: &[u8]) -> Result<()> {
        let expected = core.header.key_size as usize;
        if key.len() != expected {
            return Err(Error::KeySize {
                expected,
                found: key.len(),
            });
        }
        Ok(())
    }

    pub fn insert(&self, key: &[u8]) -> Result<()> {
        if self.read_only {
            return Err(Error::ReadOnly);
        }
        let mut core = self.core.lock();
        Self::check_key(&core, key)?;
        core.insert(self.comparator, key)
    }

    /// Looks up `key` and returns a copy of the stored key slot, payload
    /// bytes included.
    pub fn find(&self, key: &[u8]) -> Result<Vec<u8>> {
        let mut core = self.core.lock();
        Self::check_key(&core, key)?;
        core.find(self.comparator, key)
    }

    pub fn contains(&self, key: &[u8]) -> bool {
        self.find(key).is_ok()
    }

    pub fn remove(&self, key: &[u8]) -> Result<()> {
        if self.read_only {
            return Err(Error::ReadOnly);
        }
        let mut core = self.core.lock();
        Self::check_key(&core, key)?;
        core.remove(self.comparator, key)
    }

    /// Live key count.
    pub fn count(&self) -> u64 {
        self.core.lock().header.count
    }

    /// Total keys ever inserted. Unlike [`BTree::count`] this never goes
    /// down, which makes it usable as a unique id source.
    pub fn ticker(&self) -> u64 {
        self.core.lock().header.ticker
    }

    pub fn key_size(&self) -> usize {
        self.core.lock().header.key_size as usize
    }

    pub fn order(&self) -> usize {
        self.core.lock().header.order as usize
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub fn set_error_handler(&self, handler: ErrorHandler) {
        self.core.lock().datafile.set_error_handler(handler);
    }

    pub fn sync(&self) -> Result<()> {
        self.core.lock().datafile.sync()
    }

    /// Opens an in-order cursor over the tree. While any cursor is open,
    /// insert and remove refuse to run.
    pub fn cursor(&self) -> Result<Cursor<'_>> {
        Cursor::new(self)
    }

    /// Starts a transaction covering every operation made through the
    /// returned guard. The guard holds the tree lock until it is committed
    /// or dropped; dropping without commit rolls everything back.
    pub fn transaction(&self) -> Result<Transaction<'_>> {
        if self.read_only {
            return Err(Error::ReadOnly);
        }

        let mut core = self.core.lock();
        if core.cursor_count > 0 {
            return Err(Error::CursorOpen(core.cursor_count));
        }

        core.datafile.transaction_start()?;
        let saved = core.header;

        Ok(Transaction {
            comparator: self.comparator,
            core: Some(core),
            saved,
        })
    }
}

/// An open transaction on a [`BTree`].
///
/// Operations go through the guard while it lives. [`Transaction::commit`]
/// makes them permanent; dropping the guard, or calling
/// [`Transaction::rollback`], undoes them.
pub struct Transaction<'a> {
    comparator: KeyComparator,
    core: Option<MutexGuard<'a, TreeCore>>,
    saved: TreeHeader,
}

impl Transaction<'_> {
    fn core(&mut self) -> Result<&mut TreeCore> {
        match self.core.as_mut() {
            Some(core) => Ok(core),
            None => Err(Error::NoTransaction),
        }
    }

    pub fn insert(&mut self, key: &[u8]) -> Result<()> {
        let comparator = self.comparator;
        let core = self.core()?;
        BTree::check_key(core, key)?;
        core.insert(comparator, key)
    }

    pub fn remove(&mut self, key: &[u8]) -> Result<()> {
        let comparator = self.comparator;
        let core = self.core()?;
        BTree::check_key(core, key)?;
        core.remove(comparator, key)
    }

    pub fn find(&mut self, key: &[u8]) -> Result<Vec<u8>> {
        let comparator = self.comparator;
        let core = self.core()?;
        BTree::check_key(core, key)?;
        core.find(comparator, key)
    }

    pub fn count(&self) -> u64 {
        match &self.core {
            Some(core) => core.header.count,
            None => self.saved.count,
        }
    }

    pub fn commit(mut self) -> Result<()> {
        let mut core = self.core.take().ok_or(Error::NoTransaction)?;
        core.datafile.transaction_commit()
    }

    pub fn rollback(mut self) -> Result<()> {
        let mut core = self.core.take().ok_or(Error::NoTransaction)?;
        Self::rollback_core(&mut core, self.saved)
    }

    fn rollback_core(core: &mut TreeCore, saved: TreeHeader) -> Result<()> {
        core.datafile.transaction_rollback()?;
        core.header = saved;
        core.root = core.read_page(saved.root_ref)?;
        Ok(())
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        if let Some(mut core) = self.core.take() {
            if let Err(err) = Self::rollback_core(&mut core, self.saved) {
                log::error!("implicit transaction rollback failed: {err}");
            }
        }
    }
}
