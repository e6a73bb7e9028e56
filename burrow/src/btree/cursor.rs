//! In-order tree traversal.
//!
//! A cursor walks keys in comparator order by keeping an explicit stack of
//! ancestor pages and the link index taken through each. It holds no lock
//! between calls; instead an open cursor raises the tree's cursor count,
//! which makes insert and remove refuse to run until it is dropped.

use crate::btree::page::Page;
use crate::btree::BTree;
use crate::{Error, Result};

/// Read-only in-order cursor over a [`BTree`].
///
/// A cursor on an empty tree starts out invalid. After the last key,
/// [`Cursor::next`] returns `false` and the cursor goes invalid.
pub struct Cursor<'a> {
    btree: &'a BTree,
    page: Option<Page>,
    index: usize,
    /// Ancestors of the current page with the link index we descended.
    stack: Vec<(Page, usize)>,
}

impl<'a> Cursor<'a> {
    pub(crate) fn new(btree: &'a BTree) -> Result<Self> {
        btree.core.lock().cursor_count += 1;

        // the count is already raised, so Drop balances it on error
        let mut cursor = Self {
            btree,
            page: None,
            index: 0,
            stack: Vec::new(),
        };
        cursor.descend_to_first()?;
        Ok(cursor)
    }

    fn descend_to_first(&mut self) -> Result<()> {
        let mut core = self.btree.core.lock();

        let mut page = core.root.clone();
        if page.key_count() == 0 {
            self.page = None;
            return Ok(());
        }

        while !page.is_leaf() {
            let child = core.read_page(page.link(0))?;
            self.stack.push((page, 0));
            page = child;
        }

        self.page = Some(page);
        self.index = 0;
        Ok(())
    }

    /// Rewinds to the smallest key.
    pub fn reset(&mut self) -> Result<()> {
        self.stack.clear();
        self.index = 0;
        self.descend_to_first()
    }

    pub fn valid(&self) -> bool {
        self.page.is_some()
    }

    /// Copies the current key slot.
    pub fn read(&self) -> Result<Vec<u8>> {
        match &self.page {
            Some(page) => Ok(page.key(self.index).to_vec()),
            None => Err(Error::NotFound),
        }
    }

    /// Advances to the next key in order. Returns `false` once the keys are
    /// exhausted.
    pub fn next(&mut self) -> Result<bool> {
        let Some(page) = self.page.take() else {
            return Ok(false);
        };

        if page.is_leaf() {
            if self.index + 1 < page.key_count() {
                self.index += 1;
                self.page = Some(page);
                return Ok(true);
            }

            // climb until an ancestor has a separator right of the link we
            // came through
            while let Some((parent, link_index)) = self.stack.pop() {
                if link_index < parent.key_count() {
                    self.index = link_index;
                    self.page = Some(parent);
                    return Ok(true);
                }
            }
            return Ok(false);
        }

        // interior key: the successor is the leftmost leaf of the subtree
        // just right of it
        let mut core = self.btree.core.lock();

        let link_index = self.index + 1;
        let mut child = core.read_page(page.link(link_index))?;
        self.stack.push((page, link_index));

        while !child.is_leaf() {
            let next = core.read_page(child.link(0))?;
            self.stack.push((child, 0));
            child = next;
        }

        self.index = 0;
        self.page = Some(child);
        Ok(true)
    }
}

impl Drop for Cursor<'_> {
    fn drop(&mut self) {
        let mut core = self.btree.core.lock();
        core.cursor_count = core.cursor_count.saturating_sub(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compare::compare_u32;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    fn key(id: u32) -> [u8; 4] {
        id.to_le_bytes()
    }

    fn drain(cursor: &mut Cursor<'_>) -> Vec<u32> {
        let mut ids = Vec::new();
        while cursor.valid() {
            ids.push(u32::from_le_bytes(cursor.read().unwrap().try_into().unwrap()));
            if !cursor.next().unwrap() {
                break;
            }
        }
        ids
    }

    #[test]
    fn test_empty_tree_cursor_is_invalid() {
        let dir = TempDir::new().unwrap();
        let tree = BTree::create(dir.path().join("e.bdb"), 4, 4, compare_u32).unwrap();

        let mut cursor = tree.cursor().unwrap();
        assert!(!cursor.valid());
        assert!(matches!(cursor.read(), Err(Error::NotFound)));
        assert!(!cursor.next().unwrap());
    }

    #[test]
    fn test_in_order_traversal_across_splits() {
        let dir = TempDir::new().unwrap();
        let tree = BTree::create(dir.path().join("t.bdb"), 4, 4, compare_u32).unwrap();

        // insertion order scrambled; traversal must come back sorted
        for id in [13u32, 2, 40, 7, 1, 25, 9, 30, 4, 18, 11, 3] {
            tree.insert(&key(id)).unwrap();
        }

        let mut cursor = tree.cursor().unwrap();
        assert_eq!(drain(&mut cursor), vec![1, 2, 3, 4, 7, 9, 11, 13, 18, 25, 30, 40]);
    }

    #[test]
    fn test_reset_rewinds() {
        let dir = TempDir::new().unwrap();
        let tree = BTree::create(dir.path().join("r.bdb"), 4, 4, compare_u32).unwrap();

        for id in 1..=10u32 {
            tree.insert(&key(id)).unwrap();
        }

        let mut cursor = tree.cursor().unwrap();
        cursor.next().unwrap();
        cursor.next().unwrap();
        cursor.reset().unwrap();

        assert_eq!(drain(&mut cursor), (1..=10).collect::<Vec<_>>());
    }

    #[test]
    fn test_open_cursor_blocks_mutation() {
        let dir = TempDir::new().unwrap();
        let tree = BTree::create(dir.path().join("b.bdb"), 4, 4, compare_u32).unwrap();
        tree.insert(&key(1)).unwrap();

        {
            let cursor = tree.cursor().unwrap();
            assert!(cursor.valid());
            assert!(matches!(tree.insert(&key(2)), Err(Error::CursorOpen(1))));
            assert!(matches!(tree.remove(&key(1)), Err(Error::CursorOpen(1))));
            // reads are fine
            assert!(tree.contains(&key(1)));
        }

        // dropping the cursor releases the tree
        tree.insert(&key(2)).unwrap();
        assert_eq!(tree.count(), 2);
    }

    #[test]
    fn test_two_cursors_both_counted() {
        let dir = TempDir::new().unwrap();
        let tree = BTree::create(dir.path().join("two.bdb"), 4, 4, compare_u32).unwrap();
        tree.insert(&key(1)).unwrap();

        let first = tree.cursor().unwrap();
        let second = tree.cursor().unwrap();
        assert!(matches!(tree.insert(&key(2)), Err(Error::CursorOpen(2))));

        drop(first);
        assert!(matches!(tree.insert(&key(2)), Err(Error::CursorOpen(1))));
        drop(second);
        tree.insert(&key(2)).unwrap();
    }

    #[test]
    fn test_single_page_traversal() {
        let dir = TempDir::new().unwrap();
        let tree = BTree::create(dir.path().join("one.bdb"), 4, 25, compare_u32).unwrap();

        for id in [5u32, 3, 9, 1] {
            tree.insert(&key(id)).unwrap();
        }

        let mut cursor = tree.cursor().unwrap();
        assert_eq!(drain(&mut cursor), vec![1, 3, 5, 9]);
    }
}
