//! Storage backend trait definition.

use crate::error::StorageResult;

/// A durable key-value backend.
///
/// Backends are **opaque byte stores** keyed by string. The sync engine owns
/// all format interpretation - backends do not understand entities, events
/// or queued operations.
///
/// # Invariants
///
/// - `get` returns exactly the bytes of the last successful `put` for a key
/// - `remove` of a missing key is not an error
/// - Backends must be `Send + Sync`; a single backend is shared by every
///   context and concurrent writers race with last-write-wins semantics
///
/// # Implementors
///
/// - [`super::InMemoryBackend`] - For testing
/// - [`super::FileBackend`] - For persistent storage
pub trait KeyValueBackend: Send + Sync {
    /// Reads the value stored under `key`.
    ///
    /// Returns `Ok(None)` if the key has never been written or was removed.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying medium cannot be read.
    fn get(&self, key: &str) -> StorageResult<Option<Vec<u8>>>;

    /// Stores `value` under `key`, replacing any previous value.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails or the backend is read-only.
    fn put(&self, key: &str, value: &[u8]) -> StorageResult<()>;

    /// Removes `key`. Removing a missing key succeeds.
    ///
    /// # Errors
    ///
    /// Returns an error if the removal fails.
    fn remove(&self, key: &str) -> StorageResult<()>;

    /// Returns every key currently stored, in lexical order.
    ///
    /// # Errors
    ///
    /// Returns an error if the key set cannot be enumerated.
    fn keys(&self) -> StorageResult<Vec<String>>;

    /// Returns true if `key` holds a value.
    ///
    /// # Errors
    ///
    /// Returns an error if the lookup fails.
    fn contains(&self, key: &str) -> StorageResult<bool> {
        Ok(self.get(key)?.is_some())
    }
}
