//! The command catalog: named semantic operations with typed arguments.
//!
//! Commands cover effects that CRUD patches cannot express safely:
//! ledger production, stable-id list mutations, and status transitions
//! with cross-field invariants. Argument schemas are validated before
//! any state mutation.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::SyncError;
use crate::portion::PortionKind;

/// A parsed, validated command call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "name", content = "args", rename_all = "PascalCase")]
pub enum Command {
    /// Consume portions of a prepped meal. Produces a CONSUMED ledger row.
    #[serde(rename_all = "camelCase")]
    ConsumePortion { resource_id: String, qty: i64 },

    /// Throw portions away. Produces a DISCARDED ledger row.
    #[serde(rename_all = "camelCase")]
    DiscardPortion { resource_id: String, qty: i64 },

    /// System-actuated sweep expiring all remaining portions of a
    /// resource for a given day. Idempotent per resource+day.
    #[serde(rename_all = "camelCase")]
    ExpirePortions {
        resource_id: String,
        date: NaiveDate,
    },

    /// Manual correction; the only command allowed a positive delta.
    #[serde(rename_all = "camelCase")]
    AdjustPortions { resource_id: String, delta: i64 },

    /// Add an item with a client-chosen stable id to a collaborative list.
    #[serde(rename_all = "camelCase")]
    AddListItem {
        list_id: String,
        item_id: String,
        #[serde(default)]
        fields: serde_json::Map<String, Value>,
    },

    /// Remove an item from a collaborative list by stable id.
    #[serde(rename_all = "camelCase")]
    RemoveListItem { list_id: String, item_id: String },

    /// Check or uncheck a list item. Resolved by the most recent
    /// status-transition timestamp, so stale toggles lose deterministically.
    #[serde(rename_all = "camelCase")]
    SetItemChecked {
        list_id: String,
        item_id: String,
        checked: bool,
        changed_at: DateTime<Utc>,
    },
}

impl Command {
    /// Parse a COMMAND change body (`{"name": ..., "args": {...}}`).
    pub fn parse(body: &Value) -> Result<Self, SyncError> {
        let command: Command = serde_json::from_value(body.clone())
            .map_err(|e| SyncError::validation(format!("invalid command: {}", e)))?;
        command.validate()?;
        Ok(command)
    }

    /// Argument-level validation.
    pub fn validate(&self) -> Result<(), SyncError> {
        match self {
            Command::ConsumePortion { resource_id, qty }
            | Command::DiscardPortion { resource_id, qty } => {
                if resource_id.is_empty() {
                    return Err(SyncError::validation("resourceId must not be empty"));
                }
                if *qty < 1 {
                    return Err(SyncError::validation("qty must be at least 1"));
                }
            }
            Command::ExpirePortions { resource_id, .. } => {
                if resource_id.is_empty() {
                    return Err(SyncError::validation("resourceId must not be empty"));
                }
            }
            Command::AdjustPortions { resource_id, delta } => {
                if resource_id.is_empty() {
                    return Err(SyncError::validation("resourceId must not be empty"));
                }
                if *delta == 0 {
                    return Err(SyncError::validation("delta must be non-zero"));
                }
            }
            Command::AddListItem {
                list_id,
                item_id,
                fields,
            } => {
                if list_id.is_empty() || item_id.is_empty() {
                    return Err(SyncError::validation("listId and itemId are required"));
                }
                for key in fields.keys() {
                    if key.starts_with('_') {
                        return Err(SyncError::validation(format!(
                            "field '{}' is reserved",
                            key
                        )));
                    }
                }
            }
            Command::RemoveListItem { list_id, item_id }
            | Command::SetItemChecked {
                list_id, item_id, ..
            } => {
                if list_id.is_empty() || item_id.is_empty() {
                    return Err(SyncError::validation("listId and itemId are required"));
                }
            }
        }
        Ok(())
    }

    /// Ledger kind and signed delta for portion commands.
    pub fn ledger_kind_and_delta(&self) -> Option<(PortionKind, i64)> {
        match self {
            Command::ConsumePortion { qty, .. } => Some((PortionKind::Consumed, -qty)),
            Command::DiscardPortion { qty, .. } => Some((PortionKind::Discarded, -qty)),
            Command::AdjustPortions { delta, .. } => Some((PortionKind::Adjusted, *delta)),
            _ => None,
        }
    }

    /// Derived idempotency key for the expiry sweep: one per
    /// resource+day, so a retried sweep never double-expires.
    pub fn expiry_idempotency_key(resource_id: &str, date: NaiveDate) -> String {
        format!("expire:{}:{}", resource_id, date)
    }
}
