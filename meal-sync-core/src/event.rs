//! Domain events published through the transactional outbox.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::conflict::Conflict;
use crate::portion::PortionEvent;

/// A domain event recorded atomically with the state change that
/// produced it, then published after commit.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DomainEvent {
    pub event_id: String,
    /// Dotted type, e.g. `entity.updated` or `portion.consumed`.
    pub event_type: String,
    pub household_id: String,
    pub payload: Value,
    pub occurred_at: DateTime<Utc>,
}

impl DomainEvent {
    pub fn new(event_type: impl Into<String>, household_id: impl Into<String>, payload: Value) -> Self {
        Self {
            event_id: Uuid::new_v4().to_string(),
            event_type: event_type.into(),
            household_id: household_id.into(),
            payload,
            occurred_at: Utc::now(),
        }
    }

    /// A newly created entity.
    pub fn entity_created(
        household_id: &str,
        entity_type: &str,
        entity_id: &str,
        version: i64,
    ) -> Self {
        Self::new(
            "entity.created",
            household_id,
            json!({
                "entityType": entity_type,
                "entityId": entity_id,
                "version": version,
            }),
        )
    }

    /// An entity write (patch, merge, or delete).
    pub fn entity_changed(
        household_id: &str,
        entity_type: &str,
        entity_id: &str,
        version: i64,
        deleted: bool,
    ) -> Self {
        let event_type = if deleted {
            "entity.deleted"
        } else {
            "entity.updated"
        };
        Self::new(
            event_type,
            household_id,
            json!({
                "entityType": entity_type,
                "entityId": entity_id,
                "version": version,
            }),
        )
    }

    /// A ledger append, typed by the portion kind.
    pub fn portion_recorded(household_id: &str, event: &PortionEvent, remaining: i64) -> Self {
        Self::new(
            event.kind.event_type(),
            household_id,
            json!({
                "portionEventId": event.portion_event_id,
                "resourceId": event.resource_id,
                "deltaPortions": event.delta_portions,
                "sequence": event.sequence,
                "remaining": remaining,
            }),
        )
    }

    /// A change that could not be auto-resolved.
    pub fn conflict_detected(household_id: &str, conflict: &Conflict) -> Self {
        Self::new(
            "conflict.detected",
            household_id,
            json!({
                "conflictId": conflict.conflict_id,
                "entityType": conflict.change.target.entity_type,
                "entityId": conflict.change.target.id,
                "reason": conflict.reason,
            }),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::portion::PortionKind;

    #[test]
    fn test_entity_event_types() {
        let e = DomainEvent::entity_changed("h1", "shoppingItem", "i1", 3, false);
        assert_eq!(e.event_type, "entity.updated");
        assert_eq!(e.payload["version"], 3);

        let e = DomainEvent::entity_changed("h1", "shoppingItem", "i1", 4, true);
        assert_eq!(e.event_type, "entity.deleted");
    }

    #[test]
    fn test_portion_event_typed_by_kind() {
        let row = PortionEvent {
            portion_event_id: "pe1".into(),
            resource_id: "pm1".into(),
            kind: PortionKind::Expired,
            delta_portions: -3,
            occurred_at: Utc::now(),
            recorded_at: Utc::now(),
            sequence: 2,
            idempotency_key: Some("expire:pm1:2026-01-11".into()),
        };
        let e = DomainEvent::portion_recorded("h1", &row, 0);
        assert_eq!(e.event_type, "portion.expired");
        assert_eq!(e.payload["remaining"], 0);
    }

    #[test]
    fn test_event_ids_are_unique() {
        let a = DomainEvent::new("entity.updated", "h1", json!({}));
        let b = DomainEvent::new("entity.updated", "h1", json!({}));
        assert_ne!(a.event_id, b.event_id);
    }
}
