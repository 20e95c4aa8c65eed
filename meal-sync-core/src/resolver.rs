//! Per-entity-class resolution policies for version-token mismatches.
//!
//! The policy table is authoritative and never overridable per request:
//!
//! | Class              | Policy                                          |
//! |--------------------|-------------------------------------------------|
//! | PreferenceLike     | whole-record LWW by clientObservedAt            |
//! | CollaborativeList  | container fields per-field LWW, item set union  |
//! | CheckableItem      | status by latest transition, fields per-field   |
//! | SlotSchedule       | deterministic winner, loser kept as unscheduled |
//! | QuantityLedger     | never LWW; quantities go through the ledger     |
//! | AppendOnlyLog      | CREATE only; no conflict possible               |
//!
//! Timestamp ties break by changeId lexical order (the greater id wins),
//! so every replica resolves the same way.

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::conflict::ResolutionChoice;
use crate::patch::{
    field_observed_at, record_observed_at, set_field_stamped, set_record_observed_at,
    PatchDocument, FIELD_OBSERVED_AT_KEY, OBSERVED_AT_KEY,
};

/// Entity type for preserved losing slot assignments.
pub const UNSCHEDULED_ENTITY_TYPE: &str = "unscheduledMeal";

/// Fields that participate in a checkable item's status transition.
const STATUS_FIELDS: &[&str] = &["checked", "checkedAt", "status", "statusChangedAt"];

/// Resolution class of an entity type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityClass {
    PreferenceLike,
    CollaborativeList,
    CheckableItem,
    SlotSchedule,
    QuantityLedger,
    AppendOnlyLog,
}

/// Authoritative entity-type to class mapping.
pub fn classify(entity_type: &str) -> EntityClass {
    match entity_type {
        "preferences" => EntityClass::PreferenceLike,
        "shoppingList" => EntityClass::CollaborativeList,
        "shoppingItem" => EntityClass::CheckableItem,
        "mealSlot" => EntityClass::SlotSchedule,
        "preppedMeal" => EntityClass::QuantityLedger,
        "mealLog" => EntityClass::AppendOnlyLog,
        _ => EntityClass::PreferenceLike,
    }
}

/// Inputs to a merge decision.
#[derive(Debug)]
pub struct MergeInput<'a> {
    pub entity_type: &'a str,
    /// Current authoritative body (with stored observation stamps).
    pub server_body: &'a Value,
    pub server_version: i64,
    /// Server wall-clock of the last write; fallback when the body
    /// carries no observation stamp.
    pub server_updated_at: DateTime<Utc>,
    /// Change id of the last applied write, for tie-breaking.
    pub server_change_id: Option<&'a str>,
    pub patch: &'a PatchDocument,
    pub client_observed_at: DateTime<Utc>,
    pub change_id: &'a str,
}

/// An additional record a resolution asks the caller to persist,
/// e.g. the preserved losing slot assignment.
#[derive(Debug, Clone, PartialEq)]
pub struct ExtraRecord {
    pub entity_type: String,
    pub body: Value,
}

/// Outcome of a resolution attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    /// Deterministically merged; write `merged`, persist any extras.
    AutoMerged {
        merged: Value,
        extra_records: Vec<ExtraRecord>,
    },
    /// Cannot fully auto-resolve; surface a conflict with a suggestion.
    Manual {
        suggested_patch: Value,
        options: Vec<ResolutionChoice>,
    },
}

/// Resolve a version mismatch according to the entity's class.
pub fn resolve(input: &MergeInput<'_>) -> Resolution {
    match classify(input.entity_type) {
        EntityClass::PreferenceLike => resolve_preference_like(input),
        EntityClass::CollaborativeList => resolve_collaborative_list(input),
        EntityClass::CheckableItem => resolve_checkable_item(input),
        EntityClass::SlotSchedule => resolve_slot_schedule(input),
        // Scalar edits on ledger-backed entities carry no safe merge
        // semantics; quantities themselves only move via ledger
        // commands, which never reach this path.
        EntityClass::QuantityLedger | EntityClass::AppendOnlyLog => Resolution::Manual {
            suggested_patch: serde_json::to_value(input.patch).unwrap_or(Value::Null),
            options: vec![
                ResolutionChoice::KeepServer,
                ResolutionChoice::ApplyClientPatchOnLatest,
                ResolutionChoice::ManualMerge,
            ],
        },
    }
}

/// Record-level observation time of the server body.
fn server_record_ts(input: &MergeInput<'_>) -> DateTime<Utc> {
    record_observed_at(input.server_body).unwrap_or(input.server_updated_at)
}

/// True when the client write wins a timestamp comparison; ties break
/// by changeId lexical order, greater id winning.
fn client_wins(
    client_ts: DateTime<Utc>,
    server_ts: DateTime<Utc>,
    client_change_id: &str,
    server_change_id: Option<&str>,
) -> bool {
    if client_ts != server_ts {
        return client_ts > server_ts;
    }
    match server_change_id {
        Some(server_id) => client_change_id > server_id,
        None => true,
    }
}

fn resolve_preference_like(input: &MergeInput<'_>) -> Resolution {
    let wins = client_wins(
        input.client_observed_at,
        server_record_ts(input),
        input.change_id,
        input.server_change_id,
    );
    let merged = if wins {
        input.patch.apply_to(input.server_body, input.client_observed_at)
    } else {
        input.server_body.clone()
    };
    Resolution::AutoMerged {
        merged,
        extra_records: Vec::new(),
    }
}

/// Per-field LWW against the server's stored field stamps. Fields the
/// server has never stamped are treated as older than any client edit,
/// so concurrent edits to unrelated fields never discard each other.
fn merge_fields_lww(input: &MergeInput<'_>, skip: &[&str]) -> Value {
    let mut merged = input.server_body.clone();
    let mut any_applied = false;
    for (field, value) in &input.patch.set {
        if skip.contains(&field.as_str()) {
            continue;
        }
        let client_ts = input.patch.field_observed_at(field, input.client_observed_at);
        let wins = match field_observed_at(input.server_body, field) {
            Some(server_ts) => client_wins(
                client_ts,
                server_ts,
                input.change_id,
                input.server_change_id,
            ),
            None => true,
        };
        if wins {
            set_field_stamped(&mut merged, field, value.clone(), client_ts);
            any_applied = true;
        }
    }
    if any_applied {
        let record_ts = server_record_ts(input).max(input.client_observed_at);
        set_record_observed_at(&mut merged, record_ts);
    }
    merged
}

fn resolve_collaborative_list(input: &MergeInput<'_>) -> Resolution {
    let mut merged = merge_fields_lww(input, &["items"]);
    // Item membership is a set union keyed by stable item id; a CREATE
    // race between two devices keeps both devices' items.
    if let Some(client_items) = input.patch.set.get("items") {
        let server_items = input.server_body.get("items").cloned().unwrap_or(Value::Null);
        let union = union_items(&server_items, client_items);
        if let Some(map) = merged.as_object_mut() {
            map.insert("items".to_string(), union);
        }
    }
    Resolution::AutoMerged {
        merged,
        extra_records: Vec::new(),
    }
}

fn resolve_checkable_item(input: &MergeInput<'_>) -> Resolution {
    // Independent fields merge per-field; status fields move together,
    // won by the most recent status transition.
    let mut merged = merge_fields_lww(input, STATUS_FIELDS);

    let patch_touches_status = input
        .patch
        .set
        .keys()
        .any(|f| STATUS_FIELDS.contains(&f.as_str()));
    if patch_touches_status {
        let client_ts = input
            .patch
            .field_observed_at("checked", input.client_observed_at);
        let server_ts = field_observed_at(input.server_body, "checked")
            .or_else(|| parse_body_ts(input.server_body, "checkedAt"))
            .unwrap_or(server_record_ts(input));

        if client_wins(client_ts, server_ts, input.change_id, input.server_change_id) {
            for field in STATUS_FIELDS {
                if let Some(value) = input.patch.set.get(*field) {
                    set_field_stamped(&mut merged, field, value.clone(), client_ts);
                }
            }
            // A bare checked toggle still records when it happened.
            if input.patch.set.contains_key("checked")
                && !input.patch.set.contains_key("checkedAt")
            {
                set_field_stamped(
                    &mut merged,
                    "checkedAt",
                    Value::String(client_ts.to_rfc3339()),
                    client_ts,
                );
            }
            set_record_observed_at(&mut merged, server_record_ts(input).max(client_ts));
        }
    }

    Resolution::AutoMerged {
        merged,
        extra_records: Vec::new(),
    }
}

fn resolve_slot_schedule(input: &MergeInput<'_>) -> Resolution {
    let server_ts = server_record_ts(input);
    let wins = client_wins(
        input.client_observed_at,
        server_ts,
        input.change_id,
        input.server_change_id,
    );

    if wins {
        let merged = input.patch.apply_to(input.server_body, input.client_observed_at);
        let loser = unscheduled_record(input.server_body, server_ts);
        Resolution::AutoMerged {
            merged,
            extra_records: vec![loser],
        }
    } else {
        // The losing client assignment is preserved as a recoverable
        // record, never silently dropped.
        let losing_body = input.patch.apply_to(input.server_body, input.client_observed_at);
        let loser = unscheduled_record(&losing_body, input.client_observed_at);
        Resolution::AutoMerged {
            merged: input.server_body.clone(),
            extra_records: vec![loser],
        }
    }
}

/// Build the preserved "unscheduled" variant of a losing slot assignment.
fn unscheduled_record(body: &Value, original_ts: DateTime<Utc>) -> ExtraRecord {
    let mut preserved = body.clone();
    if let Some(map) = preserved.as_object_mut() {
        map.insert("status".to_string(), Value::String("unscheduled".into()));
        map.insert(
            "unscheduledAt".to_string(),
            Value::String(original_ts.to_rfc3339()),
        );
        map.remove(OBSERVED_AT_KEY);
        map.remove(FIELD_OBSERVED_AT_KEY);
    }
    ExtraRecord {
        entity_type: UNSCHEDULED_ENTITY_TYPE.to_string(),
        body: preserved,
    }
}

/// Union two item arrays keyed by `id`. Server order is kept,
/// client-only items append; for items on both sides the newer
/// `updatedAt` wins, defaulting to the server's copy.
pub fn union_items(server_items: &Value, client_items: &Value) -> Value {
    let server_list = server_items.as_array().cloned().unwrap_or_default();
    let client_list = client_items.as_array().cloned().unwrap_or_default();

    let mut result: Vec<Value> = Vec::with_capacity(server_list.len() + client_list.len());
    for server_item in &server_list {
        let id = item_id(server_item);
        let chosen = match id.and_then(|id| {
            client_list
                .iter()
                .find(|c| item_id(c) == Some(id))
        }) {
            Some(client_item) if item_newer(client_item, server_item) => client_item.clone(),
            _ => server_item.clone(),
        };
        result.push(chosen);
    }
    for client_item in &client_list {
        let id = item_id(client_item);
        let seen = id
            .map(|id| server_list.iter().any(|s| item_id(s) == Some(id)))
            .unwrap_or(false);
        if !seen {
            result.push(client_item.clone());
        }
    }
    Value::Array(result)
}

fn item_id(item: &Value) -> Option<&str> {
    item.get("id").and_then(Value::as_str)
}

fn item_newer(candidate: &Value, reference: &Value) -> bool {
    match (
        parse_body_ts(candidate, "updatedAt"),
        parse_body_ts(reference, "updatedAt"),
    ) {
        (Some(c), Some(r)) => c > r,
        _ => false,
    }
}

fn parse_body_ts(body: &Value, field: &str) -> Option<DateTime<Utc>> {
    body.get(field)
        .and_then(Value::as_str)
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use serde_json::json;
    use std::collections::BTreeMap;

    fn patch(fields: Value) -> PatchDocument {
        PatchDocument::parse(&json!({"set": fields})).unwrap()
    }

    fn input<'a>(
        entity_type: &'a str,
        server_body: &'a Value,
        server_updated_at: DateTime<Utc>,
        patch: &'a PatchDocument,
        client_observed_at: DateTime<Utc>,
    ) -> MergeInput<'a> {
        MergeInput {
            entity_type,
            server_body,
            server_version: 2,
            server_updated_at,
            server_change_id: Some("c-server"),
            patch,
            client_observed_at,
            change_id: "c-client",
        }
    }

    #[test]
    fn test_classify_table() {
        assert_eq!(classify("preferences"), EntityClass::PreferenceLike);
        assert_eq!(classify("shoppingList"), EntityClass::CollaborativeList);
        assert_eq!(classify("shoppingItem"), EntityClass::CheckableItem);
        assert_eq!(classify("mealSlot"), EntityClass::SlotSchedule);
        assert_eq!(classify("preppedMeal"), EntityClass::QuantityLedger);
        assert_eq!(classify("mealLog"), EntityClass::AppendOnlyLog);
    }

    #[test]
    fn test_preference_newer_client_wins() {
        let now = Utc::now();
        let server = json!({"theme": "dark", "_observedAt": (now - Duration::minutes(5)).to_rfc3339()});
        let p = patch(json!({"theme": "light"}));
        let i = input("preferences", &server, now - Duration::minutes(5), &p, now);

        match resolve(&i) {
            Resolution::AutoMerged { merged, .. } => assert_eq!(merged["theme"], "light"),
            other => panic!("expected auto merge, got {:?}", other),
        }
    }

    #[test]
    fn test_preference_older_client_loses() {
        let now = Utc::now();
        let server = json!({"theme": "dark", "_observedAt": now.to_rfc3339()});
        let p = patch(json!({"theme": "light"}));
        let i = input(
            "preferences",
            &server,
            now,
            &p,
            now - Duration::minutes(5),
        );

        match resolve(&i) {
            Resolution::AutoMerged { merged, .. } => assert_eq!(merged["theme"], "dark"),
            other => panic!("expected auto merge, got {:?}", other),
        }
    }

    #[test]
    fn test_preference_tie_breaks_by_change_id() {
        let now = Utc::now();
        let server = json!({"theme": "dark", "_observedAt": now.to_rfc3339()});
        let p = patch(json!({"theme": "light"}));

        let mut i = input("preferences", &server, now, &p, now);
        // "c-client" < "c-server": server keeps the tie.
        match resolve(&i) {
            Resolution::AutoMerged { merged, .. } => assert_eq!(merged["theme"], "dark"),
            other => panic!("unexpected {:?}", other),
        }

        i.change_id = "z-client";
        match resolve(&i) {
            Resolution::AutoMerged { merged, .. } => assert_eq!(merged["theme"], "light"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_checkable_item_merges_notes_and_checked() {
        // Device A edited notes at t0; its write is already applied.
        // Device B toggled checked at t1 > t0 and now conflicts.
        // The merge must keep A's notes and take B's checked state.
        let t0 = Utc::now() - Duration::minutes(10);
        let t1 = Utc::now();
        let server = json!({
            "name": "eggs",
            "notes": "free range",
            "checked": false,
            "_observedAt": t0.to_rfc3339(),
            "_fieldObservedAt": {"notes": t0.to_rfc3339()}
        });
        let p = patch(json!({"checked": true}));
        let i = input("shoppingItem", &server, t0, &p, t1);

        match resolve(&i) {
            Resolution::AutoMerged { merged, .. } => {
                assert_eq!(merged["notes"], "free range");
                assert_eq!(merged["checked"], true);
                assert_eq!(merged["checkedAt"], t1.to_rfc3339());
            }
            other => panic!("expected auto merge, got {:?}", other),
        }
    }

    #[test]
    fn test_checkable_item_merge_opposite_apply_order() {
        // Device B's checked toggle (later wall clock) applied first;
        // Device A's earlier notes edit conflicts. Notes must survive
        // because the server never saw a notes write.
        let t0 = Utc::now() - Duration::minutes(10);
        let t1 = Utc::now();
        let server = json!({
            "name": "eggs",
            "checked": true,
            "checkedAt": t1.to_rfc3339(),
            "_observedAt": t1.to_rfc3339(),
            "_fieldObservedAt": {"checked": t1.to_rfc3339()}
        });
        let p = patch(json!({"notes": "free range"}));
        let i = input("shoppingItem", &server, t1, &p, t0);

        match resolve(&i) {
            Resolution::AutoMerged { merged, .. } => {
                assert_eq!(merged["notes"], "free range");
                assert_eq!(merged["checked"], true);
            }
            other => panic!("expected auto merge, got {:?}", other),
        }
    }

    #[test]
    fn test_checkable_stale_toggle_loses() {
        let t0 = Utc::now() - Duration::minutes(10);
        let t1 = Utc::now();
        let server = json!({
            "checked": true,
            "checkedAt": t1.to_rfc3339(),
            "_fieldObservedAt": {"checked": t1.to_rfc3339()}
        });
        let p = patch(json!({"checked": false}));
        let i = input("shoppingItem", &server, t1, &p, t0);

        match resolve(&i) {
            Resolution::AutoMerged { merged, .. } => assert_eq!(merged["checked"], true),
            other => panic!("expected auto merge, got {:?}", other),
        }
    }

    #[test]
    fn test_slot_schedule_client_wins_preserves_server_assignment() {
        let t0 = Utc::now() - Duration::minutes(10);
        let t1 = Utc::now();
        let server = json!({
            "date": "2026-01-15",
            "mealType": "dinner",
            "title": "Curry",
            "_observedAt": t0.to_rfc3339()
        });
        let p = patch(json!({"title": "Tacos"}));
        let i = input("mealSlot", &server, t0, &p, t1);

        match resolve(&i) {
            Resolution::AutoMerged {
                merged,
                extra_records,
            } => {
                assert_eq!(merged["title"], "Tacos");
                assert_eq!(extra_records.len(), 1);
                let loser = &extra_records[0];
                assert_eq!(loser.entity_type, UNSCHEDULED_ENTITY_TYPE);
                assert_eq!(loser.body["title"], "Curry");
                assert_eq!(loser.body["status"], "unscheduled");
                assert_eq!(loser.body["unscheduledAt"], t0.to_rfc3339());
            }
            other => panic!("expected auto merge, got {:?}", other),
        }
    }

    #[test]
    fn test_slot_schedule_client_loses_but_is_preserved() {
        let t0 = Utc::now() - Duration::minutes(10);
        let t1 = Utc::now();
        let server = json!({
            "date": "2026-01-15",
            "title": "Curry",
            "_observedAt": t1.to_rfc3339()
        });
        let p = patch(json!({"title": "Tacos"}));
        let i = input("mealSlot", &server, t1, &p, t0);

        match resolve(&i) {
            Resolution::AutoMerged {
                merged,
                extra_records,
            } => {
                assert_eq!(merged["title"], "Curry");
                assert_eq!(extra_records[0].body["title"], "Tacos");
                assert_eq!(extra_records[0].body["unscheduledAt"], t0.to_rfc3339());
            }
            other => panic!("expected auto merge, got {:?}", other),
        }
    }

    #[test]
    fn test_quantity_ledger_never_lww() {
        let now = Utc::now();
        let server = json!({"name": "chili"});
        let p = patch(json!({"name": "white chili"}));
        let i = input("preppedMeal", &server, now, &p, now + Duration::minutes(1));

        match resolve(&i) {
            Resolution::Manual { options, .. } => {
                assert!(options.contains(&ResolutionChoice::ManualMerge));
            }
            other => panic!("expected manual resolution, got {:?}", other),
        }
    }

    #[test]
    fn test_collaborative_list_item_union() {
        let t0 = Utc::now() - Duration::minutes(10);
        let server = json!({
            "name": "Groceries",
            "items": [
                {"id": "i1", "name": "eggs", "updatedAt": t0.to_rfc3339()},
                {"id": "i2", "name": "milk", "updatedAt": t0.to_rfc3339()}
            ]
        });
        let t1 = Utc::now();
        let mut p = patch(json!({"name": "Groceries"}));
        p.set.insert(
            "items".into(),
            json!([
                {"id": "i2", "name": "oat milk", "updatedAt": t1.to_rfc3339()},
                {"id": "i3", "name": "bread", "updatedAt": t1.to_rfc3339()}
            ]),
        );
        let i = input("shoppingList", &server, t0, &p, t1);

        match resolve(&i) {
            Resolution::AutoMerged { merged, .. } => {
                let items = merged["items"].as_array().unwrap();
                assert_eq!(items.len(), 3);
                assert_eq!(items[0]["id"], "i1");
                // Newer client copy of i2 wins.
                assert_eq!(items[1]["name"], "oat milk");
                assert_eq!(items[2]["id"], "i3");
            }
            other => panic!("expected auto merge, got {:?}", other),
        }
    }

    #[test]
    fn test_union_items_prefers_server_without_timestamps() {
        let server = json!([{"id": "i1", "name": "eggs"}]);
        let client = json!([{"id": "i1", "name": "egg whites"}]);
        let union = union_items(&server, &client);
        assert_eq!(union[0]["name"], "eggs");
    }

    #[test]
    fn test_merge_fields_lww_unstamped_server_field_yields() {
        let t0 = Utc::now() - Duration::minutes(10);
        let server = json!({"name": "eggs", "notes": "old"});
        let mut set = BTreeMap::new();
        set.insert("notes".to_string(), json!("new"));
        let p = PatchDocument {
            set,
            field_observed_at: BTreeMap::new(),
        };
        let i = input("shoppingItem", &server, Utc::now(), &p, t0);

        // Server has no stamp for notes; the client edit applies even
        // though its wall clock is older than the record update.
        let merged = merge_fields_lww(&i, &[]);
        assert_eq!(merged["notes"], "new");
    }
}
