//! Configuration for the sync engine.

use std::time::Duration;
use tabsync_protocol::{ConflictStrategy, FieldAllowList};

/// Storage key of the entity collection.
pub const DEFAULT_STORAGE_KEY: &str = "tabsync:entities:v2";
/// Older key the collection is also mirrored to.
pub const DEFAULT_LEGACY_STORAGE_KEY: &str = "tabsync:entities";
/// Storage key of the tombstone set.
pub const DEFAULT_TOMBSTONE_KEY: &str = "tabsync:tombstones";
/// Storage key of the persisted event-log tail.
pub const DEFAULT_EVENT_LOG_KEY: &str = "tabsync:event-log";
/// Storage key of the offline queue.
pub const DEFAULT_QUEUE_KEY: &str = "tabsync:offline-queue";
/// Name of the cross-context channel.
pub const DEFAULT_CHANNEL_NAME: &str = "tabsync";

/// Configuration of an [`EntityStore`](crate::EntityStore).
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Current storage key of the collection.
    pub storage_key: String,
    /// Legacy key, read as a fallback and kept in sync on write.
    pub legacy_storage_key: Option<String>,
    /// Storage key of the tombstone set.
    pub tombstone_key: String,
    /// Domain field the collection is sorted by.
    pub order_key: String,
    /// Fields a patch may write.
    pub allowed_fields: FieldAllowList,
    /// Strategy for inbound conflicts.
    pub conflict_strategy: ConflictStrategy,
    /// Resource type recorded on offline operations.
    pub resource_type: String,
    /// How long tombstones are kept.
    pub tombstone_ttl: Duration,
}

impl StoreConfig {
    /// Creates the default configuration for tour shows.
    pub fn new() -> Self {
        Self {
            storage_key: DEFAULT_STORAGE_KEY.into(),
            legacy_storage_key: Some(DEFAULT_LEGACY_STORAGE_KEY.into()),
            tombstone_key: DEFAULT_TOMBSTONE_KEY.into(),
            order_key: "date".into(),
            allowed_fields: FieldAllowList::shows(),
            conflict_strategy: ConflictStrategy::Merge,
            resource_type: "show".into(),
            tombstone_ttl: Duration::from_secs(24 * 60 * 60),
        }
    }

    /// Sets the storage key.
    pub fn with_storage_key(mut self, key: impl Into<String>) -> Self {
        self.storage_key = key.into();
        self
    }

    /// Sets or clears the legacy storage key.
    pub fn with_legacy_storage_key(mut self, key: Option<String>) -> Self {
        self.legacy_storage_key = key;
        self
    }

    /// Sets the sort field.
    pub fn with_order_key(mut self, key: impl Into<String>) -> Self {
        self.order_key = key.into();
        self
    }

    /// Sets the patch allow-list.
    pub fn with_allowed_fields(mut self, fields: FieldAllowList) -> Self {
        self.allowed_fields = fields;
        self
    }

    /// Sets the conflict strategy.
    pub fn with_conflict_strategy(mut self, strategy: ConflictStrategy) -> Self {
        self.conflict_strategy = strategy;
        self
    }

    /// Sets the resource type.
    pub fn with_resource_type(mut self, resource_type: impl Into<String>) -> Self {
        self.resource_type = resource_type.into();
        self
    }

    /// Sets the tombstone TTL.
    pub fn with_tombstone_ttl(mut self, ttl: Duration) -> Self {
        self.tombstone_ttl = ttl;
        self
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Configuration of an [`EventBus`](crate::EventBus).
#[derive(Debug, Clone)]
pub struct BusConfig {
    /// Name of the cross-context channel.
    pub channel_name: String,
    /// Ring buffer capacity.
    pub capacity: usize,
    /// Number of most recent events persisted.
    pub persisted_tail: usize,
    /// Storage key of the persisted tail.
    pub log_key: String,
}

impl BusConfig {
    /// Creates the default configuration.
    pub fn new() -> Self {
        Self {
            channel_name: DEFAULT_CHANNEL_NAME.into(),
            capacity: 1000,
            persisted_tail: 100,
            log_key: DEFAULT_EVENT_LOG_KEY.into(),
        }
    }

    /// Sets the channel name.
    pub fn with_channel_name(mut self, name: impl Into<String>) -> Self {
        self.channel_name = name.into();
        self
    }

    /// Sets the ring buffer capacity.
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity.max(1);
        self
    }

    /// Sets the persisted tail length.
    pub fn with_persisted_tail(mut self, len: usize) -> Self {
        self.persisted_tail = len;
        self
    }

    /// Sets the storage key of the persisted tail.
    pub fn with_log_key(mut self, key: impl Into<String>) -> Self {
        self.log_key = key.into();
        self
    }
}

impl Default for BusConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Configuration of an [`OfflineQueue`](crate::OfflineQueue).
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Attempts after which an operation moves to `failed`.
    pub max_attempts: u32,
    /// Storage key of the queue.
    pub storage_key: String,
    /// Backoff between attempts.
    pub retry: RetryConfig,
}

impl QueueConfig {
    /// Creates the default configuration.
    pub fn new() -> Self {
        Self {
            max_attempts: 3,
            storage_key: DEFAULT_QUEUE_KEY.into(),
            retry: RetryConfig::none(),
        }
    }

    /// Sets the attempt threshold.
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    /// Sets the storage key.
    pub fn with_storage_key(mut self, key: impl Into<String>) -> Self {
        self.storage_key = key.into();
        self
    }

    /// Sets the backoff configuration.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Backoff between attempts of one queued operation.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Delay before the second attempt.
    pub initial_delay: Duration,
    /// Maximum delay between attempts.
    pub max_delay: Duration,
    /// Multiplier for exponential backoff.
    pub backoff_multiplier: f64,
}

impl RetryConfig {
    /// Exponential backoff starting at `initial_delay`.
    pub fn exponential(initial_delay: Duration) -> Self {
        Self {
            initial_delay,
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
        }
    }

    /// No delay between attempts.
    pub fn none() -> Self {
        Self {
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            backoff_multiplier: 1.0,
        }
    }

    /// Sets the maximum delay.
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Sets the backoff multiplier.
    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Calculates the delay to wait after `attempts` failed attempts.
    pub fn delay_for_attempt(&self, attempts: u32) -> Duration {
        if attempts == 0 || self.initial_delay.is_zero() {
            return Duration::ZERO;
        }

        let base_delay = self.initial_delay.as_secs_f64()
            * self.backoff_multiplier.powi(attempts.saturating_sub(1) as i32);

        Duration::from_secs_f64(base_delay.min(self.max_delay.as_secs_f64()))
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::none()
    }
}

/// Configuration of a whole [`SyncContext`](crate::SyncContext).
#[derive(Debug, Clone, Default)]
pub struct ContextConfig {
    /// Context id; a random UUID when unset.
    pub context_id: Option<String>,
    /// Actor stamped into `modifiedBy`; the context id when unset.
    pub actor: Option<String>,
    /// Entity store settings.
    pub store: StoreConfig,
    /// Event bus settings.
    pub bus: BusConfig,
    /// Offline queue settings.
    pub queue: QueueConfig,
}

impl ContextConfig {
    /// Creates the default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets a fixed context id.
    pub fn with_context_id(mut self, id: impl Into<String>) -> Self {
        self.context_id = Some(id.into());
        self
    }

    /// Sets the actor id.
    pub fn with_actor(mut self, actor: impl Into<String>) -> Self {
        self.actor = Some(actor.into());
        self
    }

    /// Sets the store configuration.
    pub fn with_store(mut self, store: StoreConfig) -> Self {
        self.store = store;
        self
    }

    /// Sets the bus configuration.
    pub fn with_bus(mut self, bus: BusConfig) -> Self {
        self.bus = bus;
        self
    }

    /// Sets the queue configuration.
    pub fn with_queue(mut self, queue: QueueConfig) -> Self {
        self.queue = queue;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_config_defaults() {
        let config = StoreConfig::default();
        assert_eq!(config.storage_key, DEFAULT_STORAGE_KEY);
        assert_eq!(config.legacy_storage_key.as_deref(), Some(DEFAULT_LEGACY_STORAGE_KEY));
        assert_eq!(config.order_key, "date");
        assert_eq!(config.conflict_strategy, ConflictStrategy::Merge);
        assert_eq!(config.tombstone_ttl, Duration::from_secs(86_400));
        assert!(config.allowed_fields.allows("fee"));
    }

    #[test]
    fn bus_config_builder() {
        let config = BusConfig::new()
            .with_channel_name("shows")
            .with_capacity(0)
            .with_persisted_tail(5);

        assert_eq!(config.channel_name, "shows");
        assert_eq!(config.capacity, 1);
        assert_eq!(config.persisted_tail, 5);
    }

    #[test]
    fn queue_config_defaults() {
        let config = QueueConfig::default();
        assert_eq!(config.max_attempts, 3);
        assert_eq!(config.retry, RetryConfig::none());
        assert_eq!(QueueConfig::new().with_max_attempts(0).max_attempts, 1);
    }

    #[test]
    fn no_backoff_by_default() {
        let config = RetryConfig::default();
        assert_eq!(config.delay_for_attempt(0), Duration::ZERO);
        assert_eq!(config.delay_for_attempt(5), Duration::ZERO);
    }

    #[test]
    fn retry_delay_calculation() {
        let config = RetryConfig::exponential(Duration::from_millis(100));

        assert_eq!(config.delay_for_attempt(0), Duration::ZERO);
        assert_eq!(config.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(config.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(config.delay_for_attempt(3), Duration::from_millis(400));
    }

    #[test]
    fn retry_delay_respects_max() {
        let config = RetryConfig::exponential(Duration::from_secs(1))
            .with_max_delay(Duration::from_secs(5))
            .with_backoff_multiplier(10.0);

        assert_eq!(config.delay_for_attempt(5), Duration::from_secs(5));
    }

    #[test]
    fn context_config_builder() {
        let config = ContextConfig::new()
            .with_context_id("tab-1")
            .with_actor("alice")
            .with_queue(QueueConfig::new().with_max_attempts(5));

        assert_eq!(config.context_id.as_deref(), Some("tab-1"));
        assert_eq!(config.actor.as_deref(), Some("alice"));
        assert_eq!(config.queue.max_attempts, 5);
    }
}
