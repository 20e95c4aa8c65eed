//! Patch documents and per-entity-type patchable-field allow-lists.
//!
//! PATCH bodies set scalar fields only. List-shaped data is never
//! patched by index; item mutations go through commands keyed by
//! stable item ids. Quantity fields derived from the portion ledger
//! are not patchable at all.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::SyncError;

/// Stored-body key holding the change-level observation timestamp of
/// the last write.
pub const OBSERVED_AT_KEY: &str = "_observedAt";
/// Stored-body key holding per-field observation timestamps.
pub const FIELD_OBSERVED_AT_KEY: &str = "_fieldObservedAt";

/// Fields derived from the portion ledger; never directly writable.
pub const LEDGER_DERIVED_FIELDS: &[&str] = &["portionsRemaining", "originalPortions"];

/// A patch document: field assignments plus optional per-field
/// observation timestamps. Fields without their own timestamp fall
/// back to the change's `clientObservedAt`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PatchDocument {
    pub set: BTreeMap<String, Value>,
    #[serde(default)]
    pub field_observed_at: BTreeMap<String, DateTime<Utc>>,
}

impl PatchDocument {
    /// Parse a PATCH change body.
    pub fn parse(body: &Value) -> Result<Self, SyncError> {
        serde_json::from_value(body.clone())
            .map_err(|e| SyncError::validation(format!("invalid patch document: {}", e)))
    }

    /// A patch assigning every top-level field of an entity body,
    /// stamped with one observation time. Used to reconcile CREATE
    /// races through the same merge machinery as PATCH conflicts.
    pub fn from_entity_body(body: &Value) -> Self {
        let mut set = BTreeMap::new();
        if let Some(map) = body.as_object() {
            for (k, v) in map {
                if !k.starts_with('_') {
                    set.insert(k.clone(), v.clone());
                }
            }
        }
        Self {
            set,
            field_observed_at: BTreeMap::new(),
        }
    }

    /// Observation timestamp for one field.
    pub fn field_observed_at(&self, field: &str, default: DateTime<Utc>) -> DateTime<Utc> {
        self.field_observed_at.get(field).copied().unwrap_or(default)
    }

    /// Validate field names against the entity type's allow-list.
    /// Rejects before any state is touched.
    pub fn validate_for(&self, entity_type: &str) -> Result<(), SyncError> {
        let allowed = patchable_fields(entity_type).ok_or_else(|| {
            SyncError::validation(format!("unknown entity type '{}'", entity_type))
        })?;
        if allowed.is_empty() {
            return Err(SyncError::validation(format!(
                "'{}' records are append-only and cannot be patched",
                entity_type
            )));
        }
        if self.set.is_empty() {
            return Err(SyncError::validation("patch must set at least one field"));
        }
        for field in self.set.keys() {
            validate_field_name(entity_type, allowed, field)?;
        }
        Ok(())
    }

    /// Apply this patch over a base body, stamping each written field
    /// with its observation time and the record with `observed_at`.
    pub fn apply_to(&self, base: &Value, observed_at: DateTime<Utc>) -> Value {
        let mut merged = base.clone();
        if !merged.is_object() {
            merged = Value::Object(serde_json::Map::new());
        }
        for (field, value) in &self.set {
            let ts = self.field_observed_at(field, observed_at);
            set_field_stamped(&mut merged, field, value.clone(), ts);
        }
        set_record_observed_at(&mut merged, observed_at);
        merged
    }
}

fn validate_field_name(
    entity_type: &str,
    allowed: &[&str],
    field: &str,
) -> Result<(), SyncError> {
    if field.starts_with('_') {
        return Err(SyncError::validation(format!(
            "field '{}' is reserved",
            field
        )));
    }
    if field.contains('.') || field.contains('[') {
        return Err(SyncError::validation(format!(
            "nested and array-index paths are not patchable: '{}'",
            field
        )));
    }
    if LEDGER_DERIVED_FIELDS.contains(&field) {
        return Err(SyncError::validation(format!(
            "'{}' is derived from the portion ledger; use portion commands",
            field
        )));
    }
    if !allowed.contains(&field) {
        return Err(SyncError::validation(format!(
            "field '{}' is not patchable on '{}'",
            field, entity_type
        )));
    }
    Ok(())
}

/// Patchable fields per entity type. Returns None for unknown types,
/// an empty list for append-only types.
pub fn patchable_fields(entity_type: &str) -> Option<&'static [&'static str]> {
    match entity_type {
        "preferences" => Some(&[
            "theme",
            "timezone",
            "weekStart",
            "defaultMealType",
            "notificationsEnabled",
        ]),
        "shoppingList" => Some(&["name", "week", "notes"]),
        "shoppingItem" => Some(&["name", "quantity", "unit", "notes", "checked", "checkedAt"]),
        "mealSlot" | "unscheduledMeal" => Some(&[
            "date", "mealType", "dishId", "title", "cook", "status", "notes",
        ]),
        "preppedMeal" => Some(&["name", "preparedOn", "useBy", "notes"]),
        // Append-only history records: CREATE only, never PATCH.
        "mealLog" => Some(&[]),
        _ => None,
    }
}

/// Validate a CREATE body for an entity type.
pub fn validate_create_body(entity_type: &str, body: &Value) -> Result<(), SyncError> {
    if patchable_fields(entity_type).is_none() {
        return Err(SyncError::validation(format!(
            "unknown entity type '{}'",
            entity_type
        )));
    }
    let map = body
        .as_object()
        .ok_or_else(|| SyncError::validation("CREATE body must be an object"))?;
    for key in map.keys() {
        if key.starts_with('_') {
            return Err(SyncError::validation(format!(
                "field '{}' is reserved",
                key
            )));
        }
    }
    if entity_type == "preppedMeal" {
        match body.get("originalPortions").and_then(Value::as_i64) {
            Some(n) if n >= 0 => {}
            _ => {
                return Err(SyncError::validation(
                    "preppedMeal requires a non-negative integer originalPortions",
                ))
            }
        }
    }
    Ok(())
}

/// Write one field and its observation timestamp into a body.
pub fn set_field_stamped(body: &mut Value, field: &str, value: Value, ts: DateTime<Utc>) {
    if let Some(map) = body.as_object_mut() {
        map.insert(field.to_string(), value);
        let stamps = map
            .entry(FIELD_OBSERVED_AT_KEY)
            .or_insert_with(|| Value::Object(serde_json::Map::new()));
        if let Some(stamps) = stamps.as_object_mut() {
            stamps.insert(field.to_string(), Value::String(ts.to_rfc3339()));
        }
    }
}

/// Set the record-level observation timestamp.
pub fn set_record_observed_at(body: &mut Value, ts: DateTime<Utc>) {
    if let Some(map) = body.as_object_mut() {
        map.insert(OBSERVED_AT_KEY.to_string(), Value::String(ts.to_rfc3339()));
    }
}

/// Record-level observation timestamp of a stored body, if stamped.
pub fn record_observed_at(body: &Value) -> Option<DateTime<Utc>> {
    parse_ts(body.get(OBSERVED_AT_KEY)?)
}

/// Per-field observation timestamp of a stored body, if stamped.
pub fn field_observed_at(body: &Value, field: &str) -> Option<DateTime<Utc>> {
    parse_ts(body.get(FIELD_OBSERVED_AT_KEY)?.get(field)?)
}

fn parse_ts(value: &Value) -> Option<DateTime<Utc>> {
    value
        .as_str()
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
}
