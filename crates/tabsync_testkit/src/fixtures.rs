//! Test fixtures and storage helpers.

use serde_json::Value;
use std::sync::{Arc, Once};
use tabsync_protocol::{Entity, Patch, Timestamp};
use tabsync_storage::{FileBackend, Persistence};
use tempfile::TempDir;

static TRACING: Once = Once::new();

/// Installs a test-friendly tracing subscriber once per process.
///
/// Honors `RUST_LOG`; output goes through the test harness writer so it is
/// only shown for failing tests.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// Builds an unstamped tour show.
pub fn show(id: &str, date: &str, fee: i64) -> Entity {
    Entity::new(id)
        .with_field("name", format!("Show {id}"))
        .with_field("date", date)
        .with_field("city", "Madrid")
        .with_field("fee", fee)
}

/// Builds a show with explicit sync metadata.
pub fn stamped_show(id: &str, fee: i64, version: u64, modified_at: Timestamp, by: &str) -> Entity {
    show(id, "2025-01-01", fee).with_meta(version, modified_at, by)
}

/// Builds a patch from field/value pairs.
pub fn patch<I, V>(fields: I) -> Patch
where
    I: IntoIterator<Item = (&'static str, V)>,
    V: Into<Value>,
{
    fields
        .into_iter()
        .map(|(key, value)| (key.to_string(), value.into()))
        .collect()
}

/// Persistence backed by a directory that lives as long as the guard.
pub struct TempPersistence {
    /// The persistence handle.
    pub persistence: Persistence,
    /// The temporary directory (kept alive to prevent cleanup).
    _temp_dir: TempDir,
}

impl TempPersistence {
    /// Creates file-backed persistence in a fresh temporary directory.
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let backend = FileBackend::open(temp_dir.path()).expect("Failed to open file backend");
        Self {
            persistence: Persistence::new(Arc::new(backend)),
            _temp_dir: temp_dir,
        }
    }

    /// Returns the storage directory.
    pub fn path(&self) -> &std::path::Path {
        self._temp_dir.path()
    }
}

impl Default for TempPersistence {
    fn default() -> Self {
        Self::new()
    }
}

impl std::ops::Deref for TempPersistence {
    type Target = Persistence;

    fn deref(&self) -> &Self::Target {
        &self.persistence
    }
}
