//! Conflict objects: changes that need reconciliation, not rejection.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::change::Change;

/// Why a change could not be applied as submitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConflictReason {
    VersionMismatch,
    MissingEntity,
    RuleViolation,
}

/// Machine-actionable resolution a client may submit for a conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResolutionChoice {
    /// Accept the server state; discard the client's edit.
    KeepServer,
    /// Re-apply the client's patch on top of the latest version.
    ApplyClientPatchOnLatest,
    /// Submit an explicit merged patch.
    ManualMerge,
}

/// A change that was rejected as submitted and awaits reconciliation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conflict {
    pub conflict_id: String,
    /// Echo of the submitted change.
    pub change: Change,
    pub reason: ConflictReason,
    /// Current authoritative version, if the entity exists.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_version: Option<i64>,
    /// Current authoritative state, if the entity exists.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_snapshot: Option<Value>,
    /// Resolutions the server will accept for this conflict.
    pub resolution_options: Vec<ResolutionChoice>,
    /// Machine-suggested merge, when the resolver could propose one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggested_patch: Option<Value>,
}

impl Conflict {
    /// Create a conflict with the default options for its reason.
    pub fn new(
        change: Change,
        reason: ConflictReason,
        server_version: Option<i64>,
        server_snapshot: Option<Value>,
    ) -> Self {
        let resolution_options = match reason {
            ConflictReason::VersionMismatch => vec![
                ResolutionChoice::KeepServer,
                ResolutionChoice::ApplyClientPatchOnLatest,
                ResolutionChoice::ManualMerge,
            ],
            // The entity may have been deleted by another device; the
            // only safe resolution is accepting the server's view.
            ConflictReason::MissingEntity => vec![ResolutionChoice::KeepServer],
            ConflictReason::RuleViolation => vec![ResolutionChoice::KeepServer],
        };
        Self {
            conflict_id: Uuid::new_v4().to_string(),
            change,
            reason,
            server_version,
            server_snapshot,
            resolution_options,
            suggested_patch: None,
        }
    }

    pub fn with_suggested_patch(mut self, patch: Value) -> Self {
        self.suggested_patch = Some(patch);
        self
    }

    pub fn with_options(mut self, options: Vec<ResolutionChoice>) -> Self {
        self.resolution_options = options;
        self
    }

    /// Whether a submitted resolution is one the server offered.
    pub fn allows(&self, choice: ResolutionChoice) -> bool {
        self.resolution_options.contains(&choice)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::change::{ChangeOp, TargetRef};
    use chrono::Utc;
    use serde_json::json;

    fn sample_change() -> Change {
        Change {
            change_id: "c1".into(),
            client_id: "device-a".into(),
            actor_id: "user1".into(),
            target: TargetRef::new("mealSlot", "slot1"),
            op: ChangeOp::Patch,
            base: None,
            body: json!({"set": {"title": "Tacos"}}),
            client_observed_at: Utc::now(),
            result_version: None,
        }
    }

    #[test]
    fn test_version_mismatch_offers_all_options() {
        let conflict = Conflict::new(
            sample_change(),
            ConflictReason::VersionMismatch,
            Some(4),
            Some(json!({"title": "Curry"})),
        );
        assert!(conflict.allows(ResolutionChoice::KeepServer));
        assert!(conflict.allows(ResolutionChoice::ApplyClientPatchOnLatest));
        assert!(conflict.allows(ResolutionChoice::ManualMerge));
    }

    #[test]
    fn test_missing_entity_offers_keep_server_only() {
        let conflict = Conflict::new(sample_change(), ConflictReason::MissingEntity, None, None);
        assert_eq!(
            conflict.resolution_options,
            vec![ResolutionChoice::KeepServer]
        );
        assert!(!conflict.allows(ResolutionChoice::ManualMerge));
    }

    #[test]
    fn test_wire_format() {
        let conflict = Conflict::new(
            sample_change(),
            ConflictReason::VersionMismatch,
            Some(2),
            None,
        )
        .with_suggested_patch(json!({"set": {"title": "Tacos"}}));

        let json = serde_json::to_value(&conflict).unwrap();
        assert_eq!(json["reason"], "VERSION_MISMATCH");
        assert_eq!(json["serverVersion"], 2);
        assert_eq!(json["resolutionOptions"][0], "KEEP_SERVER");
        assert!(json["suggestedPatch"]["set"].is_object());

        let back: Conflict = serde_json::from_value(json).unwrap();
        assert_eq!(back.conflict_id, conflict.conflict_id);
        assert_eq!(back.reason, ConflictReason::VersionMismatch);
    }
}
