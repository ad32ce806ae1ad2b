//! Property-based test generators using proptest.
//!
//! Provides strategies for generating entities, patches and local
//! operations that respect the data model's invariants.

use proptest::prelude::*;
use serde_json::{json, Value};
use tabsync_protocol::{Entity, Patch};

/// Strategy for entity ids drawn from a small pool, so collisions happen.
pub fn entity_id_strategy() -> impl Strategy<Value = String> {
    prop::sample::select(vec!["s1", "s2", "s3", "s4"]).prop_map(str::to_string)
}

/// Strategy for actor ids.
pub fn actor_strategy() -> impl Strategy<Value = String> {
    prop::sample::select(vec!["A", "B", "C"]).prop_map(str::to_string)
}

/// Strategy for a JSON value of any scalar kind or a short array.
pub fn field_value_strategy() -> impl Strategy<Value = Value> {
    prop_oneof![
        3 => (0i64..100_000).prop_map(Value::from),
        2 => "[a-z]{1,8}".prop_map(Value::from),
        1 => any::<bool>().prop_map(Value::from),
        1 => prop::collection::vec("[a-z]{1,4}", 0..3).prop_map(|v| json!(v)),
        1 => Just(Value::Null),
    ]
}

/// Strategy for domain fields keyed by allow-listed show fields.
pub fn fields_strategy() -> impl Strategy<Value = Vec<(String, Value)>> {
    prop::collection::vec(
        (
            prop::sample::select(vec!["fee", "city", "venue", "notes", "costs", "lat"]),
            field_value_strategy(),
        ),
        0..5,
    )
    .prop_map(|pairs| {
        pairs
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect()
    })
}

/// Strategy for a stamped entity with the given id.
pub fn entity_with_id_strategy(id: String) -> impl Strategy<Value = Entity> {
    (0u64..6, 1i64..5000, actor_strategy(), fields_strategy()).prop_map(
        move |(version, modified_at, actor, fields)| {
            let mut entity = Entity::new(id.clone()).with_meta(version, modified_at, &actor);
            for (key, value) in fields {
                entity.fields.insert(key, value);
            }
            entity
        },
    )
}

/// Strategy for a stamped entity.
pub fn entity_strategy() -> impl Strategy<Value = Entity> {
    entity_id_strategy().prop_flat_map(entity_with_id_strategy)
}

/// Strategy for two versions of the same entity.
pub fn entity_pair_strategy() -> impl Strategy<Value = (Entity, Entity)> {
    entity_id_strategy()
        .prop_flat_map(|id| (entity_with_id_strategy(id.clone()), entity_with_id_strategy(id)))
}

/// Strategy for a patch, possibly containing fields outside the allow-list.
pub fn patch_strategy() -> impl Strategy<Value = Patch> {
    prop::collection::vec(
        (
            prop::sample::select(vec!["fee", "city", "notes", "isAdmin", "version", "modifiedBy"]),
            field_value_strategy(),
        ),
        0..4,
    )
    .prop_map(|pairs| {
        pairs
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect()
    })
}

/// A local store operation for generated sequences.
#[derive(Debug, Clone)]
pub enum StoreOperation {
    /// Add an entity.
    Add(Entity),
    /// Patch an entity.
    Update {
        /// Entity id
        id: String,
        /// Patch to apply
        patch: Patch,
    },
    /// Remove an entity.
    Remove {
        /// Entity id
        id: String,
    },
}

/// Strategy for store operations.
pub fn store_operation_strategy() -> impl Strategy<Value = StoreOperation> {
    prop_oneof![
        2 => entity_strategy().prop_map(StoreOperation::Add),
        3 => (entity_id_strategy(), patch_strategy())
            .prop_map(|(id, patch)| StoreOperation::Update { id, patch }),
        1 => entity_id_strategy().prop_map(|id| StoreOperation::Remove { id }),
    ]
}

/// Strategy for a sequence of store operations.
pub fn operation_sequence_strategy(
    min_ops: usize,
    max_ops: usize,
) -> impl Strategy<Value = Vec<StoreOperation>> {
    prop::collection::vec(store_operation_strategy(), min_ops..max_ops)
}

/// Configuration for property tests.
#[derive(Debug, Clone)]
pub struct PropTestConfig {
    /// Number of test cases to run.
    pub cases: u32,
    /// Maximum shrink iterations.
    pub max_shrink_iters: u32,
}

impl Default for PropTestConfig {
    fn default() -> Self {
        Self {
            cases: 256,
            max_shrink_iters: 1000,
        }
    }
}

impl PropTestConfig {
    /// Creates a configuration for quick tests.
    #[must_use]
    pub fn quick() -> Self {
        Self {
            cases: 32,
            max_shrink_iters: 100,
        }
    }

    /// Creates a configuration for thorough tests.
    #[must_use]
    pub fn thorough() -> Self {
        Self {
            cases: 1024,
            max_shrink_iters: 10000,
        }
    }

    /// Converts to proptest config.
    #[must_use]
    pub fn to_proptest_config(&self) -> ProptestConfig {
        ProptestConfig {
            cases: self.cases,
            max_shrink_iters: self.max_shrink_iters,
            ..ProptestConfig::default()
        }
    }
}
