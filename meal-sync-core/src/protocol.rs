//! Wire types for the push, pull, and resolve endpoints.
//!
//! Push responses categorize every submitted change into exactly one
//! of `accepted`, `conflicts`, or `rejected`; authoritative state
//! produced by the batch rides along in `serverChanges`. Pushes never
//! advance the pull cursor; clients advance it by pulling.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::change::{Change, ChangeStatus};
use crate::conflict::{Conflict, ResolutionChoice};

/// Upper bound on changes per push request.
pub const MAX_PUSH_BATCH: usize = 200;
/// Default and maximum page sizes for pulls.
pub const DEFAULT_PULL_LIMIT: i64 = 100;
pub const MAX_PULL_LIMIT: i64 = 500;

/// A batch of client changes, processed independently in order.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushRequest {
    pub client_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sync_cursor: Option<String>,
    pub changes: Vec<Change>,
}

/// A change that took effect (or already had): APPLIED or DUPLICATE.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AcceptedChange {
    pub change_id: String,
    pub status: ChangeStatus,
}

/// Error detail for a rejected change or request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
}

/// A change that was terminally rejected.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RejectedChange {
    pub change_id: String,
    pub error: ErrorBody,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushResponse {
    /// Echo of the submitted cursor; pulls advance it, pushes do not.
    pub new_sync_cursor: String,
    pub accepted: Vec<AcceptedChange>,
    pub conflicts: Vec<Conflict>,
    pub rejected: Vec<RejectedChange>,
    /// Authoritative records produced by this batch, in apply order.
    pub server_changes: Vec<Change>,
}

/// Pull changes recorded after a cursor position.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PullRequest {
    /// Requesting device; its own pushed changes are not echoed back.
    pub client_id: String,
    /// Opaque cursor from a previous pull; absent for a first pull.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sync_cursor: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<i64>,
}

/// Current state of one entity, used in full-resync responses.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntitySnapshot {
    #[serde(rename = "type")]
    pub entity_type: String,
    pub id: String,
    pub version: i64,
    pub body: Value,
    pub deleted: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PullResponse {
    pub new_sync_cursor: String,
    /// Feed records after the cursor, oldest first. Empty when
    /// `resyncRequired`.
    pub server_changes: Vec<Change>,
    pub has_more: bool,
    /// Set when the cursor predates feed compaction; the client must
    /// replace local state with `snapshot` and restart from
    /// `newSyncCursor`. Never a silent gap.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub resync_required: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub snapshot: Vec<EntitySnapshot>,
}

/// Resolve an open conflict with one of the offered choices.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolveRequest {
    pub client_id: String,
    pub conflict_id: String,
    pub resolution: ResolutionChoice,
    /// Required for MANUAL_MERGE: the explicit merged patch document.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub merged_patch: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolveResponse {
    pub conflict_id: String,
    pub resolved: bool,
    /// Authoritative records produced by the resolution.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub server_changes: Vec<Change>,
    /// Why the resolution was not accepted, when `resolved` is false.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
}
