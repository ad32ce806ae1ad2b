//! Best-effort JSON persistence on top of a [`KeyValueBackend`].

use crate::backend::KeyValueBackend;
use crate::error::{StorageError, StorageResult};
use crate::memory::InMemoryBackend;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use tracing::warn;

/// Shared handle used by the sync engine to persist snapshots, event logs
/// and the offline queue.
///
/// The `try_*` methods report failures. The plain methods are best-effort:
/// a storage or decoding failure is logged and turned into `None` / `false`,
/// so the caller keeps running on in-memory state.
#[derive(Clone)]
pub struct Persistence {
    backend: Arc<dyn KeyValueBackend>,
}

impl Persistence {
    /// Wraps a shared backend.
    pub fn new(backend: Arc<dyn KeyValueBackend>) -> Self {
        Self { backend }
    }

    /// Creates a persistence handle over a fresh in-memory backend.
    pub fn in_memory() -> Self {
        Self::new(Arc::new(InMemoryBackend::new()))
    }

    /// Returns the underlying backend.
    pub fn backend(&self) -> &Arc<dyn KeyValueBackend> {
        &self.backend
    }

    /// Reads and decodes the JSON value stored under `key`.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend read fails or the bytes are not a
    /// valid JSON encoding of `T`.
    pub fn try_read_json<T: DeserializeOwned>(&self, key: &str) -> StorageResult<Option<T>> {
        let Some(bytes) = self.backend.get(key)? else {
            return Ok(None);
        };
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|source| StorageError::Serialization {
                key: key.to_string(),
                source,
            })
    }

    /// Encodes `value` as JSON and stores it under `key`.
    ///
    /// # Errors
    ///
    /// Returns an error if encoding or the backend write fails.
    pub fn try_write_json<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> StorageResult<()> {
        let bytes = serde_json::to_vec(value).map_err(|source| StorageError::Serialization {
            key: key.to_string(),
            source,
        })?;
        self.backend.put(key, &bytes)
    }

    /// Best-effort read. Missing keys, I/O failures and malformed data all
    /// yield `None`; the latter two are logged.
    pub fn read_json<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        match self.try_read_json(key) {
            Ok(value) => value,
            Err(e) => {
                warn!(key, error = %e, "discarding unreadable persisted value");
                None
            }
        }
    }

    /// Best-effort write. Returns `false` (and logs) on failure.
    pub fn write_json<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> bool {
        match self.try_write_json(key, value) {
            Ok(()) => true,
            Err(e) => {
                warn!(key, error = %e, "failed to persist value, keeping in-memory state");
                false
            }
        }
    }

    /// Best-effort removal. Returns `false` (and logs) on failure.
    pub fn remove(&self, key: &str) -> bool {
        match self.backend.remove(key) {
            Ok(()) => true,
            Err(e) => {
                warn!(key, error = %e, "failed to remove persisted value");
                false
            }
        }
    }
}

impl fmt::Debug for Persistence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Persistence").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Snapshot {
        ids: Vec<String>,
        version: u64,
    }

    #[test]
    fn json_roundtrip() {
        let persistence = Persistence::in_memory();
        let snapshot = Snapshot {
            ids: vec!["a".into(), "b".into()],
            version: 7,
        };

        assert!(persistence.write_json("snap", &snapshot));
        let read: Option<Snapshot> = persistence.read_json("snap");
        assert_eq!(read, Some(snapshot));
    }

    #[test]
    fn missing_key_is_none() {
        let persistence = Persistence::in_memory();
        let read: Option<Snapshot> = persistence.read_json("absent");
        assert!(read.is_none());
    }

    #[test]
    fn malformed_value_is_discarded() {
        let backend = Arc::new(InMemoryBackend::with_entries([("snap", b"{not json".to_vec())]));
        let persistence = Persistence::new(backend);

        let read: Option<Snapshot> = persistence.read_json("snap");
        assert!(read.is_none());

        let err = persistence.try_read_json::<Snapshot>("snap").unwrap_err();
        assert!(matches!(err, StorageError::Serialization { .. }));
    }

    #[test]
    fn write_failure_is_swallowed() {
        let backend = Arc::new(InMemoryBackend::new());
        backend.set_read_only(true);
        let persistence = Persistence::new(backend);

        assert!(!persistence.write_json("snap", &[1, 2, 3]));
        assert!(!persistence.remove("snap"));
    }

    proptest! {
        #[test]
        fn arbitrary_bytes_never_panic(bytes in proptest::collection::vec(any::<u8>(), 0..256)) {
            let backend = Arc::new(InMemoryBackend::with_entries([("snap", bytes)]));
            let persistence = Persistence::new(backend);
            let _ = persistence.read_json::<Snapshot>("snap");
        }
    }
}
