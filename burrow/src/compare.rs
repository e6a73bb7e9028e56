//! Key comparison.
//!
//! A B-tree orders its fixed-size keys with a caller-supplied total-order
//! function over raw key buffers. Keys may embed payload fields after the
//! ordered prefix, so the built-ins below compare only the bytes they
//! understand and ignore the rest of the slot.

use std::cmp::Ordering;

/// Total order over two fixed-size key buffers.
///
/// Both slices are exactly the tree's key size. The comparator must be
/// consistent for the lifetime of the file: changing the ordering between
/// opens corrupts lookups.
pub type KeyComparator = fn(&[u8], &[u8]) -> Ordering;

/// Compares the first four bytes as little-endian `i32`.
pub fn compare_i32(a: &[u8], b: &[u8]) -> Ordering {
    let ka = i32::from_le_bytes(a[..4].try_into().unwrap());
    let kb = i32::from_le_bytes(b[..4].try_into().unwrap());
    ka.cmp(&kb)
}

/// Compares the first four bytes as little-endian `u32`.
pub fn compare_u32(a: &[u8], b: &[u8]) -> Ordering {
    let ka = u32::from_le_bytes(a[..4].try_into().unwrap());
    let kb = u32::from_le_bytes(b[..4].try_into().unwrap());
    ka.cmp(&kb)
}

/// Lexicographic comparison of the whole key slot.
pub fn compare_bytes(a: &[u8], b: &[u8]) -> Ordering {
    a.cmp(b)
}

/// Compares NUL-terminated strings stored in fixed-size slots.
pub fn compare_cstr(a: &[u8], b: &[u8]) -> Ordering {
    cstr_of(a).cmp(cstr_of(b))
}

fn cstr_of(slot: &[u8]) -> &[u8] {
    match slot.iter().position(|&b| b == 0) {
        Some(end) => &slot[..end],
        None => slot,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_i32_ordering() {
        let neg = (-5i32).to_le_bytes();
        let pos = 3i32.to_le_bytes();

        assert_eq!(compare_i32(&neg, &pos), Ordering::Less);
        assert_eq!(compare_i32(&pos, &neg), Ordering::Greater);
        assert_eq!(compare_i32(&pos, &pos), Ordering::Equal);
    }

    #[test]
    fn test_u32_ignores_trailing_payload() {
        // 8-byte slots: 4-byte key prefix + 4 bytes of payload
        let a = [1, 0, 0, 0, 0xAA, 0xBB, 0xCC, 0xDD];
        let b = [1, 0, 0, 0, 0x11, 0x22, 0x33, 0x44];

        assert_eq!(compare_u32(&a, &b), Ordering::Equal);
    }

    #[test]
    fn test_cstr_stops_at_nul() {
        let a = *b"abc\0zzzz";
        let b = *b"abc\0aaaa";
        let c = *b"abd\0\0\0\0\0";

        assert_eq!(compare_cstr(&a, &b), Ordering::Equal);
        assert_eq!(compare_cstr(&a, &c), Ordering::Less);
    }
}
