//! # TabSync Engine
//!
//! Keeps several execution contexts (tabs, processes, threads) consistent
//! with each other and with a remote backend that may be unreachable.
//!
//! This crate provides:
//! - [`EntityStore`]: the versioned, allow-listed local collection
//! - [`EventBus`]: cross-context broadcast with a bounded, persisted log and
//!   the sync status state machine
//! - [`OfflineQueue`]: durable pending remote operations with attempt
//!   accounting and drain-on-reconnect
//! - [`SyncContext`]: explicit per-context wiring and lifecycle
//!
//! ## Architecture
//!
//! A local mutation flows through the store:
//! 1. Filter the patch, bump `version`, stamp `modifiedAt`/`modifiedBy`
//! 2. Persist the collection and notify subscribers
//! 3. Broadcast the change to the other contexts
//! 4. Submit the remote effect to the offline queue
//!
//! Other contexts receive the broadcast on their next [`SyncContext::tick`]
//! and apply it, resolving concurrent edits with the configured
//! [`ConflictStrategy`](tabsync_protocol::ConflictStrategy).
//!
//! ## Key Invariants
//!
//! - Within one store, an entity's version only moves forward
//! - A context never re-applies or re-broadcasts its own events
//! - Every backend call goes through the offline queue
//! - No lock is held while listeners or the backend run

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod backend;
mod bus;
mod channel;
mod clock;
mod config;
mod connectivity;
mod context;
mod error;
mod listeners;
mod queue;
mod store;

pub use backend::{NoopBackend, RemoteBackend};
pub use bus::{BusStats, EventBus};
pub use channel::{Channel, ChannelEndpoint, ChannelHub, DisabledChannel};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{
    BusConfig, ContextConfig, QueueConfig, RetryConfig, StoreConfig, DEFAULT_CHANNEL_NAME,
    DEFAULT_EVENT_LOG_KEY, DEFAULT_LEGACY_STORAGE_KEY, DEFAULT_QUEUE_KEY, DEFAULT_STORAGE_KEY,
    DEFAULT_TOMBSTONE_KEY,
};
pub use connectivity::Connectivity;
pub use context::{ContextDeps, ContextStats, SyncContext, TickReport};
pub use error::{ChannelError, ChannelResult, SyncError, SyncResult};
pub use listeners::Subscription;
pub use queue::{DrainReport, OfflineQueue, QueueState, QueueStats, SubmitOutcome};
pub use store::EntityStore;
