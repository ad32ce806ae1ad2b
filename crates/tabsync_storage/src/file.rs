//! File-based storage backend for persistent storage.

use crate::backend::KeyValueBackend;
use crate::error::{StorageError, StorageResult};
use parking_lot::RwLock;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

const VALUE_EXT: &str = "val";
const TEMP_EXT: &str = "tmp";

/// A directory-based key-value backend.
///
/// Every key is stored in its own file inside the backend directory. Data
/// survives process restarts and is visible to every process that opens the
/// same directory.
///
/// # Durability
///
/// `put` writes to a temporary file, syncs it and renames it over the
/// previous value, so a reader never observes a half-written value.
///
/// # Key encoding
///
/// ASCII alphanumerics, `-`, `_` and `.` are kept as-is; every other byte is
/// written as `%XX`. Keys therefore map to unique file names on every
/// platform.
///
/// # Example
///
/// ```no_run
/// use tabsync_storage::{KeyValueBackend, FileBackend};
/// use std::path::Path;
///
/// let backend = FileBackend::open(Path::new("state")).unwrap();
/// backend.put("tabsync:entities", b"[]").unwrap();
/// ```
#[derive(Debug)]
pub struct FileBackend {
    dir: PathBuf,
    lock: RwLock<()>,
}

impl FileBackend {
    /// Opens (creating if needed) a backend rooted at `dir`.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created, or if `dir`
    /// exists and is not a directory.
    pub fn open(dir: &Path) -> StorageResult<Self> {
        fs::create_dir_all(dir)?;
        if !dir.is_dir() {
            return Err(StorageError::Io(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{} is not a directory", dir.display()),
            )));
        }

        Ok(Self {
            dir: dir.to_path_buf(),
            lock: RwLock::new(()),
        })
    }

    /// Returns the backend directory.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.dir
    }

    fn value_path(&self, key: &str) -> StorageResult<PathBuf> {
        if key.is_empty() {
            return Err(StorageError::InvalidKey(key.to_string()));
        }
        Ok(self.dir.join(format!("{}.{VALUE_EXT}", encode_key(key))))
    }
}

impl KeyValueBackend for FileBackend {
    fn get(&self, key: &str) -> StorageResult<Option<Vec<u8>>> {
        let path = self.value_path(key)?;
        let _guard = self.lock.read();

        match fs::read(&path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn put(&self, key: &str, value: &[u8]) -> StorageResult<()> {
        let path = self.value_path(key)?;
        let temp = path.with_extension(TEMP_EXT);
        let _guard = self.lock.write();

        {
            let mut file = File::create(&temp)?;
            file.write_all(value)?;
            file.sync_all()?;
        }
        fs::rename(&temp, &path)?;
        Ok(())
    }

    fn remove(&self, key: &str) -> StorageResult<()> {
        let path = self.value_path(key)?;
        let _guard = self.lock.write();

        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn keys(&self) -> StorageResult<Vec<String>> {
        let _guard = self.lock.read();
        let mut keys = Vec::new();

        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some(VALUE_EXT) {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let key = decode_key(stem).ok_or_else(|| {
                StorageError::Corrupted(format!("undecodable key file {}", path.display()))
            })?;
            keys.push(key);
        }

        keys.sort();
        Ok(keys)
    }
}

fn encode_key(key: &str) -> String {
    let mut out = String::with_capacity(key.len());
    for byte in key.bytes() {
        match byte {
            b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9' | b'-' | b'_' | b'.' => out.push(byte as char),
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}

fn decode_key(encoded: &str) -> Option<String> {
    let bytes = encoded.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;

    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = encoded.get(i + 1..i + 3)?;
            out.push(u8::from_str_radix(hex, 16).ok()?);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }

    String::from_utf8(out).ok()
}
