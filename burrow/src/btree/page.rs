//! B-tree pages.
//!
//! A page holds up to `order` fixed-size keys and `order + 1` child links,
//! serialized as one datafile record. The layout is a 24-byte page header
//! (own offset, parent offset, key count), then the key slots back to back,
//! then the links. A page's record is exactly `Page::serialized_size` bytes
//! for the life of the tree, so pages rewrite in place.

use crate::datafile::Ref;
use crate::{Error, Result};

/// Serialized size of the fixed page header.
pub const PAGE_HEADER_SIZE: usize = 24;

/// In-memory copy of one tree page.
///
/// Pages are value types here: search and mutation work on owned copies and
/// write them back through the datafile, so two handles never alias the
/// same buffer.
#[derive(Debug, Clone)]
pub struct Page {
    at: Ref,
    parent: Ref,
    key_count: u16,
    key_size: usize,
    order: usize,
    keys: Vec<u8>,
    links: Vec<Ref>,
}

impl Page {
    /// Creates an empty detached page. `at` stays NULL until a slot is
    /// reserved for it.
    pub fn new(key_size: usize, order: usize) -> Self {
        Self {
            at: Ref::NULL,
            parent: Ref::NULL,
            key_count: 0,
            key_size,
            order,
            keys: vec![0u8; key_size * order],
            links: vec![Ref::NULL; order + 1],
        }
    }

    /// Serialized record size for a page of the given shape.
    pub const fn serialized_size(key_size: usize, order: usize) -> usize {
        PAGE_HEADER_SIZE + key_size * order + 8 * (order + 1)
    }

    pub fn at(&self) -> Ref {
        self.at
    }

    pub fn set_at(&mut self, at: Ref) {
        self.at = at;
    }

    pub fn parent(&self) -> Ref {
        self.parent
    }

    pub fn set_parent(&mut self, parent: Ref) {
        self.parent = parent;
    }

    pub fn key_count(&self) -> usize {
        self.key_count as usize
    }

    pub fn set_key_count(&mut self, count: usize) {
        debug_assert!(count <= self.order);
        self.key_count = count as u16;
    }

    pub fn order(&self) -> usize {
        self.order
    }

    pub fn is_full(&self) -> bool {
        self.key_count as usize == self.order
    }

    /// A page with no first child is a leaf; internal pages always carry a
    /// full complement of links.
    pub fn is_leaf(&self) -> bool {
        self.links[0].is_null()
    }

    pub fn key(&self, index: usize) -> &[u8] {
        let base = index * self.key_size;
        &self.keys[base..base + self.key_size]
    }

    pub fn set_key(&mut self, index: usize, key: &[u8]) {
        debug_assert_eq!(key.len(), self.key_size);
        let base = index * self.key_size;
        self.keys[base..base + self.key_size].copy_from_slice(key);
    }

    /// Copies the key in slot `from` over slot `to` within this page.
    pub fn move_key(&mut self, from: usize, to: usize) {
        let src = from * self.key_size;
        let dst = to * self.key_size;
        self.keys.copy_within(src..src + self.key_size, dst);
    }

    /// Zeroes a key slot after its key has been shifted or removed.
    pub fn clear_key(&mut self, index: usize) {
        let base = index * self.key_size;
        self.keys[base..base + self.key_size].fill(0);
    }

    pub fn link(&self, index: usize) -> Ref {
        self.links[index]
    }

    pub fn set_link(&mut self, index: usize, link: Ref) {
        self.links[index] = link;
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(Self::serialized_size(self.key_size, self.order));

        let mut header = [0u8; PAGE_HEADER_SIZE];
        header[0..8].copy_from_slice(&self.at.raw().to_le_bytes());
        header[8..16].copy_from_slice(&self.parent.raw().to_le_bytes());
        header[16..18].copy_from_slice(&self.key_count.to_le_bytes());
        bytes.extend_from_slice(&header);

        bytes.extend_from_slice(&self.keys);

        for link in &self.links {
            bytes.extend_from_slice(&link.raw().to_le_bytes());
        }

        bytes
    }

    /// Deserializes a page record read at file offset `at`.
    pub fn from_bytes(bytes: &[u8], key_size: usize, order: usize, at: Ref) -> Result<Self> {
        if bytes.len() != Self::serialized_size(key_size, order) {
            return Err(Error::InvalidRecord(at.raw()));
        }

        let stored_at = Ref::from_raw(i64::from_le_bytes(bytes[0..8].try_into().unwrap()));
        if stored_at != at {
            return Err(Error::PageNotFound(at.raw()));
        }

        let parent = Ref::from_raw(i64::from_le_bytes(bytes[8..16].try_into().unwrap()));
        let key_count = u16::from_le_bytes(bytes[16..18].try_into().unwrap());
        if key_count as usize > order {
            return Err(Error::InvalidRecord(at.raw()));
        }

        let keys_end = PAGE_HEADER_SIZE + key_size * order;
        let keys = bytes[PAGE_HEADER_SIZE..keys_end].to_vec();

        let mut links = Vec::with_capacity(order + 1);
        for n in 0..=order {
            let base = keys_end + n * 8;
            links.push(Ref::from_raw(i64::from_le_bytes(
                bytes[base..base + 8].try_into().unwrap(),
            )));
        }

        Ok(Self {
            at,
            parent,
            key_count,
            key_size,
            order,
            keys,
            links,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_serialized_size() {
        // header + 4 keys of 8 bytes + 5 links
        assert_eq!(Page::serialized_size(8, 4), 24 + 32 + 40);
    }

    #[test]
    fn test_round_trip() {
        let mut page = Page::new(4, 4);
        page.set_at(Ref::from_raw(100));
        page.set_parent(Ref::from_raw(44));
        page.set_key(0, &7u32.to_le_bytes());
        page.set_key(1, &9u32.to_le_bytes());
        page.set_key_count(2);
        page.set_link(0, Ref::from_raw(300));
        page.set_link(1, Ref::from_raw(400));
        page.set_link(2, Ref::from_raw(500));

        let restored = Page::from_bytes(&page.to_bytes(), 4, 4, Ref::from_raw(100)).unwrap();

        assert_eq!(restored.at(), page.at());
        assert_eq!(restored.parent(), page.parent());
        assert_eq!(restored.key_count(), 2);
        assert_eq!(restored.key(0), &7u32.to_le_bytes());
        assert_eq!(restored.key(1), &9u32.to_le_bytes());
        assert_eq!(restored.link(2), Ref::from_raw(500));
        assert!(restored.link(3).is_null());
        assert!(!restored.is_leaf());
    }

    #[test]
    fn test_rejects_relocated_page() {
        let mut page = Page::new(4, 4);
        page.set_at(Ref::from_raw(100));

        assert!(matches!(
            Page::from_bytes(&page.to_bytes(), 4, 4, Ref::from_raw(200)),
            Err(Error::PageNotFound(200))
        ));
    }

    #[test]
    fn test_move_and_clear_key() {
        let mut page = Page::new(4, 4);
        page.set_key(0, &1u32.to_le_bytes());
        page.set_key(1, &2u32.to_le_bytes());
        page.set_key_count(2);

        page.move_key(1, 0);
        page.clear_key(1);

        assert_eq!(page.key(0), &2u32.to_le_bytes());
        assert_eq!(page.key(1), &[0u8; 4]);
    }

    #[test]
    fn test_empty_page_is_leaf() {
        assert!(Page::new(8, 25).is_leaf());
    }
}
