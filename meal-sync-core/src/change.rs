//! The change envelope: a client's unit of intent against server state.
//!
//! Field names use camelCase on the wire. `(clientId, changeId)` is the
//! global dedupe key - replaying a change must return the originally
//! recorded outcome without a second durable effect.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::conflict::Conflict;
use crate::error::SyncError;

/// Client id used for server-originated feed records.
pub const SERVER_CLIENT_ID: &str = "server";

/// Reference to the entity a change targets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetRef {
    /// Entity type (e.g. "shoppingList", "preppedMeal").
    #[serde(rename = "type")]
    pub entity_type: String,
    /// Entity id, client-generated for CREATE.
    pub id: String,
}

impl TargetRef {
    pub fn new(entity_type: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            entity_type: entity_type.into(),
            id: id.into(),
        }
    }
}

/// Operation kind carried by a change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChangeOp {
    Create,
    Patch,
    Delete,
    Command,
}

/// Concurrency token the client based its edit on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeBase {
    pub version: i64,
}

/// A client-submitted mutation unit.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Change {
    /// Client-generated, stable across retries.
    pub change_id: String,
    pub client_id: String,
    pub actor_id: String,
    pub target: TargetRef,
    pub op: ChangeOp,
    /// Required for PATCH and DELETE.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base: Option<ChangeBase>,
    /// Operation body: entity fields, patch document, or command call.
    #[serde(default)]
    pub body: Value,
    /// Wall-clock time the client observed when making the edit.
    pub client_observed_at: DateTime<Utc>,
    /// Server-assigned resulting version, present on feed records so
    /// clients can adopt the new token without a round trip.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_version: Option<i64>,
}

impl Change {
    /// Build a server-originated feed record for an authoritative state.
    pub fn server_record(
        target: TargetRef,
        op: ChangeOp,
        body: Value,
        result_version: Option<i64>,
        actor_id: impl Into<String>,
    ) -> Self {
        Self {
            change_id: Uuid::new_v4().to_string(),
            client_id: SERVER_CLIENT_ID.to_string(),
            actor_id: actor_id.into(),
            target,
            op,
            base: None,
            body,
            client_observed_at: Utc::now(),
            result_version,
        }
    }

    /// Base version submitted with this change, if any.
    pub fn base_version(&self) -> Option<i64> {
        self.base.map(|b| b.version)
    }

    /// Structural validation, applied before any state is touched.
    pub fn validate(&self) -> Result<(), SyncError> {
        if self.change_id.is_empty() {
            return Err(SyncError::validation("changeId must not be empty"));
        }
        if self.client_id.is_empty() {
            return Err(SyncError::validation("clientId must not be empty"));
        }
        if self.target.entity_type.is_empty() || self.target.id.is_empty() {
            return Err(SyncError::validation("target type and id are required"));
        }
        match self.op {
            ChangeOp::Create => {
                if !self.body.is_object() {
                    return Err(SyncError::validation("CREATE body must be an object"));
                }
            }
            ChangeOp::Patch => {
                if self.base.is_none() {
                    return Err(SyncError::validation("PATCH requires base.version"));
                }
                if !self.body.is_object() {
                    return Err(SyncError::validation("PATCH body must be an object"));
                }
            }
            ChangeOp::Delete => {
                if self.base.is_none() {
                    return Err(SyncError::validation("DELETE requires base.version"));
                }
            }
            ChangeOp::Command => {
                let name = self.body.get("name").and_then(Value::as_str);
                if name.map(str::is_empty).unwrap_or(true) {
                    return Err(SyncError::validation(
                        "COMMAND body must carry a command name",
                    ));
                }
            }
        }
        Ok(())
    }
}

/// Per-change processing states.
///
/// `RECEIVED -> (DUPLICATE | VALIDATING) -> (REJECTED | APPLYING)
///  -> (APPLIED | CONFLICTED)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChangeStatus {
    Received,
    Duplicate,
    Validating,
    Rejected,
    Applying,
    Applied,
    Conflicted,
}

impl ChangeStatus {
    /// Whether `next` is a legal successor state.
    pub fn can_transition_to(self, next: ChangeStatus) -> bool {
        use ChangeStatus::*;
        matches!(
            (self, next),
            (Received, Duplicate)
                | (Received, Validating)
                | (Validating, Rejected)
                | (Validating, Applying)
                | (Applying, Applied)
                | (Applying, Conflicted)
                | (Applying, Rejected)
        )
    }

    /// Terminal states receive no further transitions.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ChangeStatus::Duplicate
                | ChangeStatus::Rejected
                | ChangeStatus::Applied
                | ChangeStatus::Conflicted
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ChangeStatus::Received => "RECEIVED",
            ChangeStatus::Duplicate => "DUPLICATE",
            ChangeStatus::Validating => "VALIDATING",
            ChangeStatus::Rejected => "REJECTED",
            ChangeStatus::Applying => "APPLYING",
            ChangeStatus::Applied => "APPLIED",
            ChangeStatus::Conflicted => "CONFLICTED",
        }
    }
}

/// Durable outcome recorded for a processed change.
///
/// Replays of the same `(clientId, changeId)` return this record
/// verbatim, which is what makes retries safe.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum ChangeOutcome {
    /// Applied; carries the authoritative records the apply produced.
    Applied {
        #[serde(default)]
        server_changes: Vec<Change>,
    },
    /// Could not be applied as submitted; reconciliation required.
    Conflicted { conflict: Conflict },
    /// Terminal rejection; the client must alter the request.
    Rejected { code: String, message: String },
}

impl ChangeOutcome {
    /// The terminal status this outcome corresponds to.
    pub fn status(&self) -> ChangeStatus {
        match self {
            ChangeOutcome::Applied { .. } => ChangeStatus::Applied,
            ChangeOutcome::Conflicted { .. } => ChangeStatus::Conflicted,
            ChangeOutcome::Rejected { .. } => ChangeStatus::Rejected,
        }
    }
}
