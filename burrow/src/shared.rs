//! Process-wide handle sharing.
//!
//! Opening the same tree file twice must yield handles over one shared
//! core, or the two would clobber each other's header and free list. A
//! global registry maps a normalized path key to a weak reference of the
//! live core; open joins it, create refuses while it is alive. The
//! registry lock is held across initialization, so concurrent creates and
//! opens of one path serialize.

use std::any::Any;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock, Weak};

use parking_lot::Mutex;

use crate::{Error, Result};

type Registry = Mutex<HashMap<String, Box<dyn Any + Send>>>;

static REGISTRY: OnceLock<Registry> = OnceLock::new();

fn registry() -> &'static Registry {
    REGISTRY.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Resolves a path to its canonical form so different spellings of one
/// file share a key. A file that does not exist yet resolves through its
/// parent directory; if that fails too, the raw spelling stands.
fn resolve(path: &Path) -> PathBuf {
    if let Ok(canonical) = path.canonicalize() {
        return canonical;
    }

    if let Some(name) = path.file_name() {
        let parent = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        if let Ok(dir) = parent.canonicalize() {
            return dir.join(name);
        }
    }

    path.to_path_buf()
}

/// Normalizes a path into a registry key: canonicalized, lowercased, with
/// every non-alphanumeric character folded to `_`.
pub(crate) fn key_for(path: &Path) -> String {
    resolve(path)
        .to_string_lossy()
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() {
                ch.to_ascii_lowercase()
            } else {
                '_'
            }
        })
        .collect()
}

/// Returns the live value registered under `key`, or initializes and
/// registers a new one. The boolean is true when `init` ran.
pub(crate) fn obtain<T, F>(key: &str, init: F) -> Result<(Arc<T>, bool)>
where
    T: Send + Sync + 'static,
    F: FnOnce() -> Result<T>,
{
    let mut registry = registry().lock();

    if let Some(entry) = registry.get(key) {
        if let Some(weak) = entry.downcast_ref::<Weak<T>>() {
            if let Some(live) = weak.upgrade() {
                return Ok((live, false));
            }
        }
    }

    let value = Arc::new(init()?);
    registry.insert(key.to_string(), Box::new(Arc::downgrade(&value)));
    Ok((value, true))
}

/// Initializes and registers a new value, refusing while a live value
/// exists under `key`.
pub(crate) fn create<T, F>(key: &str, init: F) -> Result<Arc<T>>
where
    T: Send + Sync + 'static,
    F: FnOnce() -> Result<T>,
{
    let mut registry = registry().lock();

    if let Some(entry) = registry.get(key) {
        if let Some(weak) = entry.downcast_ref::<Weak<T>>() {
            if weak.upgrade().is_some() {
                return Err(Error::AlreadyOpen);
            }
        }
    }

    let value = Arc::new(init()?);
    registry.insert(key.to_string(), Box::new(Arc::downgrade(&value)));
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_key_normalization() {
        // nothing to canonicalize here, so the raw spelling is normalized
        assert_eq!(
            key_for(Path::new("/no-such-dir/My Trees/Index-7.bdb")),
            "_no_such_dir_my_trees_index_7_bdb"
        );
    }

    #[test]
    fn test_key_ignores_path_spelling() {
        let dir = tempfile::tempdir().unwrap();
        let plain = dir.path().join("tree.bdb");
        let dotted = dir.path().join(".").join("tree.bdb");

        // same file before it exists...
        assert_eq!(key_for(&plain), key_for(&dotted));

        // ...and once it does
        let before = key_for(&plain);
        std::fs::write(&plain, b"").unwrap();
        assert_eq!(key_for(&plain), before);
        assert_eq!(key_for(&dotted), before);
    }

    #[test]
    fn test_obtain_shares_live_value() {
        let (first, created) = obtain::<u64, _>("shared_obtain_test", || Ok(41)).unwrap();
        assert!(created);

        let (second, created) = obtain::<u64, _>("shared_obtain_test", || Ok(99)).unwrap();
        assert!(!created);
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(*second, 41);
    }

    #[test]
    fn test_dead_entry_reinitializes() {
        let (first, _) = obtain::<u64, _>("shared_dead_test", || Ok(1)).unwrap();
        drop(first);

        let (second, created) = obtain::<u64, _>("shared_dead_test", || Ok(2)).unwrap();
        assert!(created);
        assert_eq!(*second, 2);
    }

    #[test]
    fn test_create_refuses_live_value() {
        let live = create::<u64, _>("shared_create_test", || Ok(7)).unwrap();

        assert!(matches!(
            create::<u64, _>("shared_create_test", || Ok(8)),
            Err(Error::AlreadyOpen)
        ));

        drop(live);
        let again = create::<u64, _>("shared_create_test", || Ok(8)).unwrap();
        assert_eq!(*again, 8);
    }

    #[test]
    fn test_failed_init_registers_nothing() {
        let result = obtain::<u64, _>("shared_fail_test", || Err(Error::NotFound));
        assert!(result.is_err());

        let (value, created) = obtain::<u64, _>("shared_fail_test", || Ok(5)).unwrap();
        assert!(created);
        assert_eq!(*value, 5);
    }
}
