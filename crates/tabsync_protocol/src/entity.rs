//! Versioned entities and patch filtering.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::cmp::Ordering;
use std::collections::BTreeSet;

/// Milliseconds since the Unix epoch.
pub type Timestamp = i64;

/// A partial update: field name to new value.
pub type Patch = Map<String, Value>;

/// Actor recorded on entities that arrive without a `modifiedBy`.
pub const SYSTEM_ACTOR: &str = "system";

/// Field names that are never writable through a patch.
///
/// Includes the legacy double-underscore spellings of the sync fields.
pub const RESERVED_FIELDS: &[&str] = &[
    "id",
    "version",
    "modifiedAt",
    "modifiedBy",
    "__version",
    "__modifiedAt",
    "__modifiedBy",
];

/// A versioned domain record.
///
/// The three sync fields are typed; everything else lives in `fields` and is
/// flattened into the same JSON object on the wire.
///
/// # Invariants
///
/// - `id` is non-empty and never changes
/// - Within one store, `version` strictly increases on every mutation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    /// Stable unique identifier.
    pub id: String,
    /// Mutation counter, starting at 0.
    #[serde(default, alias = "__version")]
    pub version: u64,
    /// Time of the last mutation. `0` means "not yet stamped".
    #[serde(rename = "modifiedAt", alias = "__modifiedAt", default)]
    pub modified_at: Timestamp,
    /// Actor that performed the last mutation. Empty means "unknown".
    #[serde(rename = "modifiedBy", alias = "__modifiedBy", default)]
    pub modified_by: String,
    /// Domain payload.
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl Entity {
    /// Creates an unstamped entity with no domain fields.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            version: 0,
            modified_at: 0,
            modified_by: String::new(),
            fields: Map::new(),
        }
    }

    /// Sets a domain field.
    #[must_use]
    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    /// Sets the sync metadata.
    #[must_use]
    pub fn with_meta(mut self, version: u64, modified_at: Timestamp, modified_by: &str) -> Self {
        self.version = version;
        self.modified_at = modified_at;
        self.modified_by = modified_by.to_string();
        self
    }

    /// Returns a domain field.
    pub fn field(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    /// Returns a numeric domain field as `f64`.
    pub fn number(&self, key: &str) -> Option<f64> {
        self.fields.get(key).and_then(Value::as_f64)
    }

    /// Fills in missing sync metadata.
    ///
    /// `version` already defaults to 0 on decode; an unset `modifiedAt`
    /// becomes `now` and an empty `modifiedBy` becomes [`SYSTEM_ACTOR`].
    pub fn normalize(&mut self, now: Timestamp) {
        if self.modified_at <= 0 {
            self.modified_at = now;
        }
        if self.modified_by.is_empty() {
            self.modified_by = SYSTEM_ACTOR.to_string();
        }
    }

    /// Consuming variant of [`Entity::normalize`].
    #[must_use]
    pub fn normalized(mut self, now: Timestamp) -> Self {
        self.normalize(now);
        self
    }

    /// Applies an already-filtered patch and stamps a new version.
    pub fn apply_patch(&mut self, patch: Patch, now: Timestamp, actor: &str) {
        for (key, value) in patch {
            self.fields.insert(key, value);
        }
        self.version += 1;
        self.modified_at = now;
        self.modified_by = actor.to_string();
    }
}

/// Orders two entities by a domain field, then by id.
///
/// Strings compare lexically and numbers numerically. Entities that have the
/// field sort before entities that lack it; mixed types sort by type rank.
pub fn compare_by_field(a: &Entity, b: &Entity, key: &str) -> Ordering {
    compare_values(a.field(key), b.field(key)).then_with(|| a.id.cmp(&b.id))
}

fn compare_values(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    match (a, b) {
        (None, None) => Ordering::Equal,
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (Some(Value::String(x)), Some(Value::String(y))) => x.cmp(y),
        (Some(Value::Number(x)), Some(Value::Number(y))) => {
            let (x, y) = (x.as_f64().unwrap_or(0.0), y.as_f64().unwrap_or(0.0));
            x.partial_cmp(&y).unwrap_or(Ordering::Equal)
        }
        (Some(Value::Bool(x)), Some(Value::Bool(y))) => x.cmp(y),
        (Some(x), Some(y)) => type_rank(x).cmp(&type_rank(y)),
    }
}

fn type_rank(value: &Value) -> u8 {
    match value {
        Value::Null => 0,
        Value::Bool(_) => 1,
        Value::Number(_) => 2,
        Value::String(_) => 3,
        Value::Array(_) => 4,
        Value::Object(_) => 5,
    }
}

/// Explicit list of fields a patch may write.
///
/// Anything not listed, and every [`RESERVED_FIELDS`] name, is rejected so
/// untrusted callers cannot inject fields or forge sync metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldAllowList {
    fields: BTreeSet<String>,
}

impl FieldAllowList {
    /// Creates an allow-list from field names.
    pub fn new<I, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            fields: fields.into_iter().map(Into::into).collect(),
        }
    }

    /// The allow-list for tour show records.
    pub fn shows() -> Self {
        Self::new([
            "name",
            "city",
            "country",
            "venue",
            "lat",
            "lng",
            "date",
            "endDate",
            "status",
            "fee",
            "feeCurrency",
            "fxRateToBase",
            "costs",
            "notes",
            "promoter",
            "tourId",
        ])
    }

    /// Adds a field to the list.
    #[must_use]
    pub fn with(mut self, field: impl Into<String>) -> Self {
        self.fields.insert(field.into());
        self
    }

    /// Returns true if `field` may be written.
    pub fn allows(&self, field: &str) -> bool {
        !RESERVED_FIELDS.contains(&field) && self.fields.contains(field)
    }

    /// Splits a patch into the accepted part and the names of rejected keys.
    pub fn filter(&self, patch: Patch) -> (Patch, Vec<String>) {
        let mut accepted = Patch::new();
        let mut rejected = Vec::new();

        for (key, value) in patch {
            if self.allows(&key) {
                accepted.insert(key, value);
            } else {
                rejected.push(key);
            }
        }

        (accepted, rejected)
    }
}

impl Default for FieldAllowList {
    fn default() -> Self {
        Self::shows()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decode_fills_defaults() {
        let entity: Entity = serde_json::from_value(json!({"id": "s1", "city": "Madrid"})).unwrap();

        assert_eq!(entity.version, 0);
        assert_eq!(entity.modified_at, 0);
        assert!(entity.modified_by.is_empty());
        assert_eq!(entity.field("city"), Some(&json!("Madrid")));
    }

    #[test]
    fn decode_accepts_legacy_metadata_names() {
        let entity: Entity = serde_json::from_value(json!({
            "id": "s1",
            "__version": 4,
            "__modifiedAt": 1234,
            "__modifiedBy": "tab-a",
            "fee": 100
        }))
        .unwrap();

        assert_eq!(entity.version, 4);
        assert_eq!(entity.modified_at, 1234);
        assert_eq!(entity.modified_by, "tab-a");
        assert!(entity.field("__version").is_none());
    }

    #[test]
    fn encode_flattens_fields() {
        let entity = Entity::new("s1")
            .with_field("fee", 100)
            .with_meta(2, 1000, "tab-a");
        let value = serde_json::to_value(&entity).unwrap();

        assert_eq!(
            value,
            json!({"id": "s1", "version": 2, "modifiedAt": 1000, "modifiedBy": "tab-a", "fee": 100})
        );
    }

    #[test]
    fn decode_requires_id() {
        let result: Result<Entity, _> = serde_json::from_value(json!({"city": "Madrid"}));
        assert!(result.is_err());
    }

    #[test]
    fn normalize_stamps_missing_metadata() {
        let entity = Entity::new("s1").normalized(5000);
        assert_eq!(entity.version, 0);
        assert_eq!(entity.modified_at, 5000);
        assert_eq!(entity.modified_by, SYSTEM_ACTOR);

        let stamped = Entity::new("s2").with_meta(3, 10, "tab-b").normalized(5000);
        assert_eq!(stamped.modified_at, 10);
        assert_eq!(stamped.modified_by, "tab-b");
    }

    #[test]
    fn apply_patch_bumps_version() {
        let mut entity = Entity::new("s1").with_meta(1, 1000, "tab-a");
        let mut patch = Patch::new();
        patch.insert("fee".into(), json!(200));

        entity.apply_patch(patch, 2000, "tab-b");

        assert_eq!(entity.version, 2);
        assert_eq!(entity.modified_at, 2000);
        assert_eq!(entity.modified_by, "tab-b");
        assert_eq!(entity.number("fee"), Some(200.0));
    }

    #[test]
    fn ordering_by_date_then_id() {
        let a = Entity::new("b").with_field("date", "2025-01-02");
        let b = Entity::new("a").with_field("date", "2025-01-02");
        let c = Entity::new("c").with_field("date", "2024-12-31");
        let d = Entity::new("d");

        let mut list = vec![d.clone(), a.clone(), b.clone(), c.clone()];
        list.sort_by(|x, y| compare_by_field(x, y, "date"));

        let ids: Vec<_> = list.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, vec!["c", "a", "b", "d"]);
    }

    #[test]
    fn ordering_numbers_numerically() {
        let a = Entity::new("a").with_field("rank", 10);
        let b = Entity::new("b").with_field("rank", 9);
        assert_eq!(compare_by_field(&a, &b, "rank"), Ordering::Greater);
    }

    #[test]
    fn allow_list_filters_patch() {
        let list = FieldAllowList::new(["fee", "city"]);
        let mut patch = Patch::new();
        patch.insert("fee".into(), json!(1));
        patch.insert("isAdmin".into(), json!(true));
        patch.insert("version".into(), json!(99));

        let (accepted, mut rejected) = list.filter(patch);
        rejected.sort();

        assert_eq!(accepted.len(), 1);
        assert!(accepted.contains_key("fee"));
        assert_eq!(rejected, vec!["isAdmin", "version"]);
    }

    #[test]
    fn reserved_fields_never_allowed() {
        let list = FieldAllowList::new(["id", "modifiedBy", "fee"]);
        assert!(!list.allows("id"));
        assert!(!list.allows("modifiedBy"));
        assert!(list.allows("fee"));
    }
}
