//! # TabSync Testkit
//!
//! Test utilities for TabSync.
//!
//! This crate provides:
//! - Entity and patch fixtures, storage helpers and tracing setup
//! - A recording remote backend with scripted failures
//! - A multi-context cluster harness sharing one channel hub, storage and
//!   clock
//! - Property-based test generators using proptest
//!
//! ## Usage
//!
//! ```rust,ignore
//! use tabsync_testkit::prelude::*;
//!
//! #[test]
//! fn two_contexts_converge() {
//!     let cluster = TestCluster::new(&["A", "B"]);
//!     cluster.context("A").store().add(show("s1", "2025-03-01", 100));
//!     cluster.settle();
//!     assert!(cluster.context("B").store().get_by_id("s1").is_some());
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod backend;
pub mod cluster;
pub mod fixtures;
pub mod generators;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::backend::*;
    pub use crate::cluster::*;
    pub use crate::fixtures::*;
    pub use crate::generators::*;
}

pub use backend::*;
pub use cluster::*;
pub use fixtures::*;
pub use generators::*;
