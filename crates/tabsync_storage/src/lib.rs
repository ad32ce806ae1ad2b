//! # TabSync Storage
//!
//! Durable key-value persistence for TabSync.
//!
//! This crate provides the lowest-level storage abstraction for the sync
//! engine. Backends are **opaque key-value stores** - they do not interpret
//! the bytes stored under a key.
//!
//! ## Design Principles
//!
//! - Backends are simple byte stores (get, put, remove)
//! - No knowledge of entities, events or queue formats
//! - Must be `Send + Sync`: one backend is shared by every context
//! - Writes are last-write-wins with no transactional isolation
//!
//! ## Available Backends
//!
//! - [`InMemoryBackend`] - For testing and ephemeral storage
//! - [`FileBackend`] - One file per key inside a directory
//!
//! On top of a backend, [`Persistence`] offers best-effort JSON reads and
//! writes that never fail the caller.
//!
//! ## Example
//!
//! ```rust
//! use tabsync_storage::{KeyValueBackend, InMemoryBackend};
//!
//! let backend = InMemoryBackend::new();
//! backend.put("greeting", b"hello world").unwrap();
//! assert_eq!(backend.get("greeting").unwrap().as_deref(), Some(&b"hello world"[..]));
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod backend;
mod error;
mod file;
mod memory;
mod persistence;

pub use backend::KeyValueBackend;
pub use error::{StorageError, StorageResult};
pub use file::FileBackend;
pub use memory::InMemoryBackend;
pub use persistence::Persistence;
