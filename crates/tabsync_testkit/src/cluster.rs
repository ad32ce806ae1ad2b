//! Multi-context test harness.
//!
//! A [`TestCluster`] runs several [`SyncContext`]s in one process the way
//! browser tabs share an origin: one channel hub, one durable store, one
//! remote backend, one connectivity signal. Time is a shared
//! [`ManualClock`].

use crate::backend::RecordingBackend;
use crate::fixtures::init_tracing;
use std::sync::Arc;
use tabsync_engine::{
    ChannelHub, Connectivity, ContextConfig, ContextDeps, ManualClock, SyncContext,
};
use tabsync_protocol::Timestamp;
use tabsync_storage::Persistence;

/// Upper bound on delivery rounds in [`TestCluster::settle`].
const MAX_SETTLE_ROUNDS: usize = 32;

/// Several contexts wired to the same environment.
pub struct TestCluster {
    /// The shared channel hub.
    pub hub: ChannelHub,
    /// The shared durable store.
    pub persistence: Persistence,
    /// The shared remote backend.
    pub backend: Arc<RecordingBackend>,
    /// The shared clock.
    pub clock: ManualClock,
    /// The shared connectivity signal.
    pub connectivity: Connectivity,
    contexts: Vec<SyncContext>,
}

impl TestCluster {
    /// Creates one context per id, online, with the clock at 1000.
    pub fn new(ids: &[&str]) -> Self {
        Self::with_config(ids, ContextConfig::new)
    }

    /// Like [`TestCluster::new`] with a custom base configuration.
    pub fn with_config(ids: &[&str], config: impl Fn() -> ContextConfig) -> Self {
        init_tracing();

        let mut cluster = Self {
            hub: ChannelHub::new(),
            persistence: Persistence::in_memory(),
            backend: Arc::new(RecordingBackend::new()),
            clock: ManualClock::new(1000),
            connectivity: Connectivity::online(),
            contexts: Vec::new(),
        };
        for id in ids {
            cluster.join(id, config());
        }
        cluster
    }

    /// Adds a context. It receives nothing that was sent before it joined.
    pub fn join(&mut self, id: &str, config: ContextConfig) -> &SyncContext {
        let config = config.with_context_id(id).with_actor(id);
        let channel = Arc::new(self.hub.open(&config.bus.channel_name));
        let deps = ContextDeps::new(channel, self.persistence.clone())
            .with_backend(self.backend.clone())
            .with_clock(Arc::new(self.clock.clone()))
            .with_connectivity(self.connectivity.clone());

        self.contexts.push(SyncContext::init(config, deps));
        &self.contexts[self.contexts.len() - 1]
    }

    /// Destroys and removes a context.
    pub fn leave(&mut self, id: &str) {
        if let Some(i) = self.contexts.iter().position(|c| c.id() == id) {
            self.contexts.remove(i).destroy();
        }
    }

    /// Returns the context with `id`.
    ///
    /// # Panics
    ///
    /// Panics if no such context exists.
    pub fn context(&self, id: &str) -> &SyncContext {
        self.contexts
            .iter()
            .find(|c| c.id() == id)
            .unwrap_or_else(|| panic!("no context {id:?} in cluster"))
    }

    /// Returns every context.
    pub fn contexts(&self) -> &[SyncContext] {
        &self.contexts
    }

    /// Sets the shared clock.
    pub fn set_time(&self, now: Timestamp) {
        self.clock.set(now);
    }

    /// Sets the shared connectivity.
    pub fn set_online(&self, online: bool) {
        self.connectivity.set_online(online);
    }

    /// Ticks one context. Returns the number of events it accepted.
    pub fn tick(&self, id: &str) -> usize {
        self.context(id)
            .tick()
            .map(|report| report.events)
            .unwrap_or(0)
    }

    /// Ticks every context until no more events are delivered.
    ///
    /// Returns the total number of accepted events.
    pub fn settle(&self) -> usize {
        let mut total = 0;
        for _ in 0..MAX_SETTLE_ROUNDS {
            let round: usize = self.contexts.iter().map(|c| self.tick(c.id())).sum();
            if round == 0 {
                return total;
            }
            total += round;
        }
        panic!("cluster did not settle after {MAX_SETTLE_ROUNDS} rounds");
    }
}

impl Drop for TestCluster {
    fn drop(&mut self) {
        for context in &self.contexts {
            context.destroy();
        }
    }
}
