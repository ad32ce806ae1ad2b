//! In-memory storage backend for testing.

use crate::backend::KeyValueBackend;
use crate::error::{StorageError, StorageResult};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};

/// An in-memory key-value backend.
///
/// This backend stores all data in memory and is suitable for:
/// - Unit tests
/// - Integration tests where several contexts share one store
/// - Ephemeral sessions that don't need persistence
///
/// It can be switched to read-only mode to simulate a full or unavailable
/// medium.
///
/// # Example
///
/// ```rust
/// use tabsync_storage::{KeyValueBackend, InMemoryBackend};
///
/// let backend = InMemoryBackend::new();
/// backend.put("k", b"v").unwrap();
/// assert_eq!(backend.len(), 1);
/// ```
#[derive(Debug, Default)]
pub struct InMemoryBackend {
    data: RwLock<BTreeMap<String, Vec<u8>>>,
    read_only: AtomicBool,
}

impl InMemoryBackend {
    /// Creates a new empty in-memory backend.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a backend with pre-existing entries.
    ///
    /// Useful for testing recovery from previously persisted (or corrupt)
    /// state.
    #[must_use]
    pub fn with_entries<I, K, V>(entries: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<Vec<u8>>,
    {
        let data = entries
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        Self {
            data: RwLock::new(data),
            read_only: AtomicBool::new(false),
        }
    }

    /// Makes every subsequent write fail with [`StorageError::ReadOnly`].
    pub fn set_read_only(&self, read_only: bool) {
        self.read_only.store(read_only, Ordering::SeqCst);
    }

    /// Returns the number of stored keys.
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.read().len()
    }

    /// Returns true if nothing is stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.read().is_empty()
    }

    /// Removes every entry.
    pub fn clear(&self) {
        self.data.write().clear();
    }

    fn check_writable(&self) -> StorageResult<()> {
        if self.read_only.load(Ordering::SeqCst) {
            return Err(StorageError::ReadOnly);
        }
        Ok(())
    }
}

impl KeyValueBackend for InMemoryBackend {
    fn get(&self, key: &str) -> StorageResult<Option<Vec<u8>>> {
        Ok(self.data.read().get(key).cloned())
    }

    fn put(&self, key: &str, value: &[u8]) -> StorageResult<()> {
        self.check_writable()?;
        self.data.write().insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn remove(&self, key: &str) -> StorageResult<()> {
        self.check_writable()?;
        self.data.write().remove(key);
        Ok(())
    }

    fn keys(&self) -> StorageResult<Vec<String>> {
        Ok(self.data.read().keys().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_new_is_empty() {
        let backend = InMemoryBackend::new();
        assert!(backend.is_empty());
        assert!(backend.keys().unwrap().is_empty());
    }

    #[test]
    fn memory_put_and_get() {
        let backend = InMemoryBackend::new();
        backend.put("a", b"hello").unwrap();

        assert_eq!(backend.get("a").unwrap(), Some(b"hello".to_vec()));
        assert_eq!(backend.get("missing").unwrap(), None);
    }

    #[test]
    fn memory_put_overwrites() {
        let backend = InMemoryBackend::new();
        backend.put("a", b"one").unwrap();
        backend.put("a", b"two").unwrap();

        assert_eq!(backend.get("a").unwrap(), Some(b"two".to_vec()));
        assert_eq!(backend.len(), 1);
    }

    #[test]
    fn memory_remove_missing_is_ok() {
        let backend = InMemoryBackend::new();
        backend.remove("nothing").unwrap();

        backend.put("a", b"x").unwrap();
        backend.remove("a").unwrap();
        assert!(!backend.contains("a").unwrap());
    }

    #[test]
    fn memory_keys_are_sorted() {
        let backend = InMemoryBackend::new();
        backend.put("b", b"2").unwrap();
        backend.put("a", b"1").unwrap();
        backend.put("c", b"3").unwrap();

        assert_eq!(backend.keys().unwrap(), vec!["a", "b", "c"]);
    }

    #[test]
    fn memory_with_entries() {
        let backend = InMemoryBackend::with_entries([("k", b"preloaded".to_vec())]);
        assert_eq!(backend.get("k").unwrap(), Some(b"preloaded".to_vec()));
    }

    #[test]
    fn memory_read_only_rejects_writes() {
        let backend = InMemoryBackend::new();
        backend.put("a", b"1").unwrap();
        backend.set_read_only(true);

        assert!(matches!(backend.put("a", b"2"), Err(StorageError::ReadOnly)));
        assert!(matches!(backend.remove("a"), Err(StorageError::ReadOnly)));
        assert_eq!(backend.get("a").unwrap(), Some(b"1".to_vec()));

        backend.set_read_only(false);
        backend.put("a", b"2").unwrap();
        assert_eq!(backend.get("a").unwrap(), Some(b"2".to_vec()));
    }

    #[test]
    fn memory_clear() {
        let backend = InMemoryBackend::new();
        backend.put("a", b"1").unwrap();
        backend.clear();
        assert!(backend.is_empty());
    }
}
