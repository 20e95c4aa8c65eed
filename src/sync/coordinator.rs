//! The sync coordinator: push, pull, resolve, and the expiry sweep.
//!
//! Every pushed change is processed in its own transaction: dedupe
//! lookup, validation, state writes, feed records, outbox events, and
//! the recorded outcome all commit together or not at all. Replaying a
//! change returns its recorded outcome without a second durable
//! effect.

use chrono::{NaiveDate, Utc};
use serde_json::Value;
use sqlx::{SqliteConnection, SqlitePool};
use uuid::Uuid;

use meal_sync_core::change::{
    Change, ChangeOp, ChangeOutcome, ChangeStatus, TargetRef, SERVER_CLIENT_ID,
};
use meal_sync_core::command::Command;
use meal_sync_core::conflict::{Conflict, ConflictReason, ResolutionChoice};
use meal_sync_core::cursor::Cursor;
use meal_sync_core::error::SyncError;
use meal_sync_core::event::DomainEvent;
use meal_sync_core::patch::{self, PatchDocument};
use meal_sync_core::portion::PortionKind;
use meal_sync_core::protocol::{
    AcceptedChange, EntitySnapshot, ErrorBody, PullRequest, PullResponse, PushRequest,
    PushResponse, RejectedChange, ResolveRequest, ResolveResponse, DEFAULT_PULL_LIMIT,
    MAX_PULL_LIMIT,
};
use meal_sync_core::resolver::{self, MergeInput, Resolution};

use crate::config::AuthUser;
use crate::db::ledger::AppendResult;
use crate::db::{change_log, conflict_store, entity_store, ledger, outbox};
use crate::db::entity_store::StoredEntity;

/// Errors the coordinator can surface to the transport layer. Domain
/// failures (validation, rule violations, conflicts) are outcomes, not
/// errors.
#[derive(Debug)]
pub enum CoordinatorError {
    Database(sqlx::Error),
    BadRequest(String),
}

impl std::fmt::Display for CoordinatorError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CoordinatorError::Database(e) => write!(f, "database error: {}", e),
            CoordinatorError::BadRequest(msg) => write!(f, "bad request: {}", msg),
        }
    }
}

impl std::error::Error for CoordinatorError {}

impl From<sqlx::Error> for CoordinatorError {
    fn from(e: sqlx::Error) -> Self {
        CoordinatorError::Database(e)
    }
}

pub struct SyncCoordinator {
    pool: SqlitePool,
}

/// Per-change processing result, before it is folded into the wire
/// response.
struct ProcessedChange {
    change_id: String,
    duplicate: bool,
    outcome: ChangeOutcome,
}

impl SyncCoordinator {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Apply a batch of client changes in order, grouping the outcomes
    /// into accepted, conflicts, and rejected.
    ///
    /// Pushes do not advance the pull cursor; the feed already skips a
    /// device's own records on pull, so the submitted cursor is echoed
    /// back unchanged.
    pub async fn push(
        &self,
        auth: &AuthUser,
        req: PushRequest,
    ) -> Result<PushResponse, CoordinatorError> {
        let mut response = PushResponse {
            new_sync_cursor: req
                .sync_cursor
                .clone()
                .unwrap_or_else(|| Cursor::start().encode()),
            accepted: Vec::new(),
            conflicts: Vec::new(),
            rejected: Vec::new(),
            server_changes: Vec::new(),
        };
        for change in req.changes {
            let result = self.process_change(auth, &req.client_id, change).await?;
            match result.outcome {
                ChangeOutcome::Applied { server_changes } => {
                    response.accepted.push(AcceptedChange {
                        change_id: result.change_id,
                        status: if result.duplicate {
                            ChangeStatus::Duplicate
                        } else {
                            ChangeStatus::Applied
                        },
                    });
                    response.server_changes.extend(server_changes);
                }
                ChangeOutcome::Conflicted { conflict } => {
                    response.conflicts.push(conflict);
                }
                ChangeOutcome::Rejected { code, message } => {
                    response.rejected.push(RejectedChange {
                        change_id: result.change_id,
                        error: ErrorBody { code, message },
                    });
                }
            }
        }
        Ok(response)
    }

    /// Process one change in its own transaction.
    async fn process_change(
        &self,
        auth: &AuthUser,
        request_client: &str,
        change: Change,
    ) -> Result<ProcessedChange, CoordinatorError> {
        let mut tx = self.pool.begin().await?;

        if let Some(outcome) =
            change_log::get_outcome(&mut tx, &change.client_id, &change.change_id).await?
        {
            tx.commit().await?;
            tracing::debug!(change_id = %change.change_id, "replaying recorded outcome");
            return Ok(ProcessedChange {
                change_id: change.change_id,
                duplicate: true,
                outcome,
            });
        }

        let outcome = if change.client_id != request_client {
            rejected(SyncError::validation(
                "change clientId does not match request clientId",
            ))
        } else {
            match change.validate() {
                Err(e) => rejected(e),
                Ok(()) => self.apply(&mut tx, auth, &change).await?,
            }
        };

        change_log::record_outcome(&mut tx, &change.client_id, &change.change_id, &outcome)
            .await?;
        tx.commit().await?;

        Ok(ProcessedChange {
            change_id: change.change_id,
            duplicate: false,
            outcome,
        })
    }

    async fn apply(
        &self,
        conn: &mut SqliteConnection,
        auth: &AuthUser,
        change: &Change,
    ) -> Result<ChangeOutcome, CoordinatorError> {
        match change.op {
            ChangeOp::Create => self.apply_create(conn, auth, change).await,
            ChangeOp::Patch => self.apply_patch(conn, auth, change).await,
            ChangeOp::Delete => self.apply_delete(conn, auth, change).await,
            ChangeOp::Command => self.apply_command(conn, auth, change).await,
        }
    }

    async fn apply_create(
        &self,
        conn: &mut SqliteConnection,
        auth: &AuthUser,
        change: &Change,
    ) -> Result<ChangeOutcome, CoordinatorError> {
        let entity_type = change.target.entity_type.as_str();
        if let Err(e) = patch::validate_create_body(entity_type, &change.body) {
            return Ok(rejected(e));
        }

        let existing = entity_store::get(
            conn,
            &auth.household_id,
            entity_type,
            &change.target.id,
        )
        .await?;

        match existing {
            None => {
                self.create_fresh(conn, auth, change, entity_type, &change.target.id, &change.body)
                    .await
            }
            Some(e) if e.deleted => {
                // Recreate over a tombstone; the version line continues.
                let body = self
                    .initial_body(conn, change, entity_type, &change.target.id, &change.body)
                    .await?;
                let version = self
                    .write_versioned(conn, auth, change, entity_type, &change.target.id, e.version, &body, false)
                    .await?;
                let record = self
                    .record_feed(conn, auth, &change.client_id, change.target.clone(), ChangeOp::Create, body, version, &change.actor_id)
                    .await?;
                outbox::enqueue(
                    conn,
                    &DomainEvent::entity_created(&auth.household_id, entity_type, &change.target.id, version),
                )
                .await?;
                Ok(ChangeOutcome::Applied {
                    server_changes: vec![record],
                })
            }
            Some(e) => {
                // CREATE race on the same id: reconcile through the
                // same merge machinery as a version mismatch.
                let create_patch = PatchDocument::from_entity_body(&change.body);
                self.resolve_mismatch(conn, auth, change, &e, &create_patch)
                    .await
            }
        }
    }

    /// Stamped initial body for a CREATE, with the ledger opened for
    /// stock-like resources.
    async fn initial_body(
        &self,
        conn: &mut SqliteConnection,
        change: &Change,
        entity_type: &str,
        id: &str,
        raw_body: &Value,
    ) -> Result<Value, CoordinatorError> {
        let mut body = PatchDocument::from_entity_body(raw_body)
            .apply_to(&Value::Object(serde_json::Map::new()), change.client_observed_at);
        if entity_type == "preppedMeal" {
            // Validated as a non-negative integer before we get here.
            let original = raw_body
                .get("originalPortions")
                .and_then(Value::as_i64)
                .unwrap_or(0);
            if ledger::remaining(conn, id).await?.is_none() {
                ledger::init_resource(conn, id, original).await?;
            }
            let (_, remaining) = ledger::remaining(conn, id)
                .await?
                .unwrap_or((original, original));
            if let Some(map) = body.as_object_mut() {
                map.insert("portionsRemaining".to_string(), Value::from(remaining));
            }
        }
        Ok(body)
    }

    async fn create_fresh(
        &self,
        conn: &mut SqliteConnection,
        auth: &AuthUser,
        change: &Change,
        entity_type: &str,
        id: &str,
        raw_body: &Value,
    ) -> Result<ChangeOutcome, CoordinatorError> {
        let body = self
            .initial_body(conn, change, entity_type, id, raw_body)
            .await?;
        entity_store::insert(
            conn,
            &StoredEntity {
                entity_type: entity_type.to_string(),
                id: id.to_string(),
                household_id: auth.household_id.clone(),
                version: 1,
                body: body.clone(),
                updated_at: Utc::now(),
                last_change_id: Some(change.change_id.clone()),
                deleted: false,
            },
        )
        .await?;
        let record = self
            .record_feed(conn, auth, &change.client_id, TargetRef::new(entity_type, id), ChangeOp::Create, body, 1, &change.actor_id)
            .await?;
        outbox::enqueue(
            conn,
            &DomainEvent::entity_created(&auth.household_id, entity_type, id, 1),
        )
        .await?;
        Ok(ChangeOutcome::Applied {
            server_changes: vec![record],
        })
    }

    async fn apply_patch(
        &self,
        conn: &mut SqliteConnection,
        auth: &AuthUser,
        change: &Change,
    ) -> Result<ChangeOutcome, CoordinatorError> {
        let entity_type = change.target.entity_type.as_str();
        let patch = match PatchDocument::parse(&change.body) {
            Ok(p) => p,
            Err(e) => return Ok(rejected(e)),
        };
        if let Err(e) = patch.validate_for(entity_type) {
            return Ok(rejected(e));
        }

        let entity = entity_store::get(
            conn,
            &auth.household_id,
            entity_type,
            &change.target.id,
        )
        .await?;
        let entity = match entity {
            Some(e) if !e.deleted => e,
            Some(e) => {
                return self
                    .conflicted(
                        conn,
                        auth,
                        change,
                        Conflict::new(
                            change.clone(),
                            ConflictReason::MissingEntity,
                            Some(e.version),
                            None,
                        ),
                    )
                    .await
            }
            None => {
                return self
                    .conflicted(
                        conn,
                        auth,
                        change,
                        Conflict::new(change.clone(), ConflictReason::MissingEntity, None, None),
                    )
                    .await
            }
        };

        // base is guaranteed by Change::validate for PATCH.
        let base = change.base_version().unwrap_or(0);
        if base == entity.version {
            let merged = patch.apply_to(&entity.body, change.client_observed_at);
            let version = self
                .write_versioned(conn, auth, change, entity_type, &change.target.id, entity.version, &merged, false)
                .await?;
            let record = self
                .record_feed(conn, auth, &change.client_id, change.target.clone(), ChangeOp::Patch, merged, version, &change.actor_id)
                .await?;
            outbox::enqueue(
                conn,
                &DomainEvent::entity_changed(&auth.household_id, entity_type, &change.target.id, version, false),
            )
            .await?;
            Ok(ChangeOutcome::Applied {
                server_changes: vec![record],
            })
        } else {
            self.resolve_mismatch(conn, auth, change, &entity, &patch)
                .await
        }
    }

    /// Run the entity-class resolution policy for a stale base version
    /// and persist whatever it decides.
    async fn resolve_mismatch(
        &self,
        conn: &mut SqliteConnection,
        auth: &AuthUser,
        change: &Change,
        entity: &StoredEntity,
        patch: &PatchDocument,
    ) -> Result<ChangeOutcome, CoordinatorError> {
        let input = MergeInput {
            entity_type: &entity.entity_type,
            server_body: &entity.body,
            server_version: entity.version,
            server_updated_at: entity.updated_at,
            server_change_id: entity.last_change_id.as_deref(),
            patch,
            client_observed_at: change.client_observed_at,
            change_id: &change.change_id,
        };

        match resolver::resolve(&input) {
            Resolution::AutoMerged {
                merged,
                extra_records,
            } => {
                let mut server_changes = Vec::new();
                if merged != entity.body {
                    let version = self
                        .write_versioned(conn, auth, change, &entity.entity_type, &entity.id, entity.version, &merged, false)
                        .await?;
                    let record = self
                        .record_feed(conn, auth, &change.client_id, change.target.clone(), ChangeOp::Patch, merged, version, &change.actor_id)
                        .await?;
                    outbox::enqueue(
                        conn,
                        &DomainEvent::entity_changed(&auth.household_id, &entity.entity_type, &entity.id, version, false),
                    )
                    .await?;
                    server_changes.push(record);
                }
                for extra in extra_records {
                    let id = Uuid::new_v4().to_string();
                    entity_store::insert(
                        conn,
                        &StoredEntity {
                            entity_type: extra.entity_type.clone(),
                            id: id.clone(),
                            household_id: auth.household_id.clone(),
                            version: 1,
                            body: extra.body.clone(),
                            updated_at: Utc::now(),
                            last_change_id: Some(change.change_id.clone()),
                            deleted: false,
                        },
                    )
                    .await?;
                    let record = self
                        .record_feed(conn, auth, &change.client_id, TargetRef::new(&extra.entity_type, &id), ChangeOp::Create, extra.body, 1, &change.actor_id)
                        .await?;
                    outbox::enqueue(
                        conn,
                        &DomainEvent::entity_created(&auth.household_id, &extra.entity_type, &id, 1),
                    )
                    .await?;
                    server_changes.push(record);
                }
                Ok(ChangeOutcome::Applied { server_changes })
            }
            Resolution::Manual {
                suggested_patch,
                options,
            } => {
                let conflict = Conflict::new(
                    change.clone(),
                    ConflictReason::VersionMismatch,
                    Some(entity.version),
                    Some(entity.body.clone()),
                )
                .with_suggested_patch(suggested_patch)
                .with_options(options);
                self.conflicted(conn, auth, change, conflict).await
            }
        }
    }

    async fn apply_delete(
        &self,
        conn: &mut SqliteConnection,
        auth: &AuthUser,
        change: &Change,
    ) -> Result<ChangeOutcome, CoordinatorError> {
        let entity_type = change.target.entity_type.as_str();
        // History records only ever gain rows; they cannot be
        // tombstoned any more than they can be patched.
        if patch::patchable_fields(entity_type).is_some_and(|fields| fields.is_empty()) {
            return Ok(rejected(SyncError::validation(format!(
                "'{}' records are append-only and cannot be deleted",
                entity_type
            ))));
        }
        let entity = entity_store::get(
            conn,
            &auth.household_id,
            entity_type,
            &change.target.id,
        )
        .await?;
        let entity = match entity {
            None => {
                return self
                    .conflicted(
                        conn,
                        auth,
                        change,
                        Conflict::new(change.clone(), ConflictReason::MissingEntity, None, None),
                    )
                    .await
            }
            // Already deleted: the desired state holds.
            Some(e) if e.deleted => {
                return Ok(ChangeOutcome::Applied {
                    server_changes: vec![],
                })
            }
            Some(e) => e,
        };

        let base = change.base_version().unwrap_or(0);
        if base != entity.version {
            let conflict = Conflict::new(
                change.clone(),
                ConflictReason::VersionMismatch,
                Some(entity.version),
                Some(entity.body.clone()),
            );
            return self.conflicted(conn, auth, change, conflict).await;
        }

        let version = self
            .write_versioned(conn, auth, change, entity_type, &change.target.id, entity.version, &entity.body, true)
            .await?;
        let record = self
            .record_feed(conn, auth, &change.client_id, change.target.clone(), ChangeOp::Delete, Value::Null, version, &change.actor_id)
            .await?;
        outbox::enqueue(
            conn,
            &DomainEvent::entity_changed(&auth.household_id, entity_type, &change.target.id, version, true),
        )
        .await?;
        Ok(ChangeOutcome::Applied {
            server_changes: vec![record],
        })
    }

    async fn apply_command(
        &self,
        conn: &mut SqliteConnection,
        auth: &AuthUser,
        change: &Change,
    ) -> Result<ChangeOutcome, CoordinatorError> {
        let command = match Command::parse(&change.body) {
            Ok(c) => c,
            Err(e) => return Ok(rejected(e)),
        };

        match &command {
            Command::ConsumePortion { resource_id, .. }
            | Command::DiscardPortion { resource_id, .. }
            | Command::AdjustPortions { resource_id, .. } => {
                // ledger_kind_and_delta is total for these variants.
                let Some((kind, delta)) = command.ledger_kind_and_delta() else {
                    return Ok(rejected(SyncError::validation("not a portion command")));
                };
                self.apply_ledger_append(conn, auth, change, resource_id, kind, delta, None)
                    .await
            }
            Command::ExpirePortions { resource_id, date } => {
                self.apply_expiry(conn, auth, change, resource_id, *date).await
            }
            Command::AddListItem {
                list_id,
                item_id,
                fields,
            } => self.apply_add_item(conn, auth, change, list_id, item_id, fields).await,
            Command::RemoveListItem { list_id: _, item_id } => {
                self.apply_remove_item(conn, auth, change, item_id).await
            }
            Command::SetItemChecked {
                item_id,
                checked,
                changed_at,
                ..
            } => {
                self.apply_set_checked(conn, auth, change, item_id, *checked, *changed_at)
                    .await
            }
        }
    }

    async fn apply_ledger_append(
        &self,
        conn: &mut SqliteConnection,
        auth: &AuthUser,
        change: &Change,
        resource_id: &str,
        kind: PortionKind,
        delta: i64,
        idempotency_key: Option<&str>,
    ) -> Result<ChangeOutcome, CoordinatorError> {
        let entity = entity_store::get(conn, &auth.household_id, "preppedMeal", resource_id)
            .await?;
        let entity = match entity {
            Some(e) if !e.deleted => e,
            _ => {
                return self
                    .conflicted(
                        conn,
                        auth,
                        change,
                        Conflict::new(change.clone(), ConflictReason::MissingEntity, None, None),
                    )
                    .await
            }
        };

        let append = ledger::append(
            conn,
            resource_id,
            kind,
            delta,
            change.client_observed_at,
            idempotency_key,
            &change.actor_id,
        )
        .await?;

        match append {
            AppendResult::MissingResource => Ok(rejected(SyncError::rule_violation(format!(
                "no portion ledger for resource '{}'",
                resource_id
            )))),
            AppendResult::Rejected { message, .. } => {
                Ok(rejected(SyncError::rule_violation(message)))
            }
            AppendResult::Replayed { .. } => {
                // The durable effect already happened under this
                // idempotency key; return the current state.
                let record = Change::server_record(
                    TargetRef::new("preppedMeal", resource_id),
                    ChangeOp::Patch,
                    entity.body.clone(),
                    Some(entity.version),
                    &change.actor_id,
                );
                Ok(ChangeOutcome::Applied {
                    server_changes: vec![record],
                })
            }
            AppendResult::Appended { event, remaining } => {
                let mut body = entity.body.clone();
                if let Some(map) = body.as_object_mut() {
                    map.insert("portionsRemaining".to_string(), Value::from(remaining));
                }
                let version = self
                    .write_versioned(conn, auth, change, "preppedMeal", resource_id, entity.version, &body, false)
                    .await?;
                let record = self
                    .record_feed(conn, auth, &change.client_id, TargetRef::new("preppedMeal", resource_id), ChangeOp::Patch, body, version, &change.actor_id)
                    .await?;
                outbox::enqueue(
                    conn,
                    &DomainEvent::portion_recorded(&auth.household_id, &event, remaining),
                )
                .await?;
                Ok(ChangeOutcome::Applied {
                    server_changes: vec![record],
                })
            }
        }
    }

    async fn apply_expiry(
        &self,
        conn: &mut SqliteConnection,
        auth: &AuthUser,
        change: &Change,
        resource_id: &str,
        date: NaiveDate,
    ) -> Result<ChangeOutcome, CoordinatorError> {
        let Some((_, remaining)) = ledger::remaining(conn, resource_id).await? else {
            return self
                .conflicted(
                    conn,
                    auth,
                    change,
                    Conflict::new(change.clone(), ConflictReason::MissingEntity, None, None),
                )
                .await;
        };
        if remaining == 0 {
            // Nothing left to expire.
            return Ok(ChangeOutcome::Applied {
                server_changes: vec![],
            });
        }
        let key = Command::expiry_idempotency_key(resource_id, date);
        self.apply_ledger_append(
            conn,
            auth,
            change,
            resource_id,
            PortionKind::Expired,
            -remaining,
            Some(&key),
        )
        .await
    }

    async fn apply_add_item(
        &self,
        conn: &mut SqliteConnection,
        auth: &AuthUser,
        change: &Change,
        list_id: &str,
        item_id: &str,
        fields: &serde_json::Map<String, Value>,
    ) -> Result<ChangeOutcome, CoordinatorError> {
        let list = entity_store::get(conn, &auth.household_id, "shoppingList", list_id).await?;
        if !matches!(list, Some(ref l) if !l.deleted) {
            return self
                .conflicted(
                    conn,
                    auth,
                    change,
                    Conflict::new(change.clone(), ConflictReason::MissingEntity, None, None),
                )
                .await;
        }

        let existing =
            entity_store::get(conn, &auth.household_id, "shoppingItem", item_id).await?;
        if let Some(e) = existing {
            if !e.deleted {
                // Stable item ids make a repeated add to the same list
                // a no-op. The same id on another list is a real
                // disagreement.
                if e.body.get("listId").and_then(Value::as_str) != Some(list_id) {
                    let conflict = Conflict::new(
                        change.clone(),
                        ConflictReason::RuleViolation,
                        Some(e.version),
                        Some(e.body.clone()),
                    );
                    return self.conflicted(conn, auth, change, conflict).await;
                }
                let record = Change::server_record(
                    TargetRef::new("shoppingItem", item_id),
                    ChangeOp::Create,
                    e.body.clone(),
                    Some(e.version),
                    &change.actor_id,
                );
                return Ok(ChangeOutcome::Applied {
                    server_changes: vec![record],
                });
            }
        }

        let mut raw = fields.clone();
        raw.insert("listId".to_string(), Value::String(list_id.to_string()));
        let body = PatchDocument::from_entity_body(&Value::Object(raw))
            .apply_to(&Value::Object(serde_json::Map::new()), change.client_observed_at);

        match entity_store::get(conn, &auth.household_id, "shoppingItem", item_id).await? {
            Some(tombstone) => {
                let version = self
                    .write_versioned(conn, auth, change, "shoppingItem", item_id, tombstone.version, &body, false)
                    .await?;
                let record = self
                    .record_feed(conn, auth, &change.client_id, TargetRef::new("shoppingItem", item_id), ChangeOp::Create, body, version, &change.actor_id)
                    .await?;
                outbox::enqueue(
                    conn,
                    &DomainEvent::entity_created(&auth.household_id, "shoppingItem", item_id, version),
                )
                .await?;
                Ok(ChangeOutcome::Applied {
                    server_changes: vec![record],
                })
            }
            None => {
                entity_store::insert(
                    conn,
                    &StoredEntity {
                        entity_type: "shoppingItem".to_string(),
                        id: item_id.to_string(),
                        household_id: auth.household_id.clone(),
                        version: 1,
                        body: body.clone(),
                        updated_at: Utc::now(),
                        last_change_id: Some(change.change_id.clone()),
                        deleted: false,
                    },
                )
                .await?;
                let record = self
                    .record_feed(conn, auth, &change.client_id, TargetRef::new("shoppingItem", item_id), ChangeOp::Create, body, 1, &change.actor_id)
                    .await?;
                outbox::enqueue(
                    conn,
                    &DomainEvent::entity_created(&auth.household_id, "shoppingItem", item_id, 1),
                )
                .await?;
                Ok(ChangeOutcome::Applied {
                    server_changes: vec![record],
                })
            }
        }
    }

    async fn apply_remove_item(
        &self,
        conn: &mut SqliteConnection,
        auth: &AuthUser,
        change: &Change,
        item_id: &str,
    ) -> Result<ChangeOutcome, CoordinatorError> {
        let item = entity_store::get(conn, &auth.household_id, "shoppingItem", item_id).await?;
        let item = match item {
            Some(e) if !e.deleted => e,
            // Removing an absent item is already the desired state.
            _ => {
                return Ok(ChangeOutcome::Applied {
                    server_changes: vec![],
                })
            }
        };

        let version = self
            .write_versioned(conn, auth, change, "shoppingItem", item_id, item.version, &item.body, true)
            .await?;
        let record = self
            .record_feed(conn, auth, &change.client_id, TargetRef::new("shoppingItem", item_id), ChangeOp::Delete, Value::Null, version, &change.actor_id)
            .await?;
        outbox::enqueue(
            conn,
            &DomainEvent::entity_changed(&auth.household_id, "shoppingItem", item_id, version, true),
        )
        .await?;
        Ok(ChangeOutcome::Applied {
            server_changes: vec![record],
        })
    }

    async fn apply_set_checked(
        &self,
        conn: &mut SqliteConnection,
        auth: &AuthUser,
        change: &Change,
        item_id: &str,
        checked: bool,
        changed_at: chrono::DateTime<Utc>,
    ) -> Result<ChangeOutcome, CoordinatorError> {
        let item = entity_store::get(conn, &auth.household_id, "shoppingItem", item_id).await?;
        let item = match item {
            Some(e) if !e.deleted => e,
            _ => {
                return self
                    .conflicted(
                        conn,
                        auth,
                        change,
                        Conflict::new(change.clone(), ConflictReason::MissingEntity, None, None),
                    )
                    .await
            }
        };

        // Route through the checkable-item policy so stale toggles
        // lose the same way they do in patch merges.
        let mut set = std::collections::BTreeMap::new();
        set.insert("checked".to_string(), Value::Bool(checked));
        set.insert(
            "checkedAt".to_string(),
            Value::String(changed_at.to_rfc3339()),
        );
        let mut field_observed_at = std::collections::BTreeMap::new();
        field_observed_at.insert("checked".to_string(), changed_at);
        field_observed_at.insert("checkedAt".to_string(), changed_at);
        let toggle = PatchDocument {
            set,
            field_observed_at,
        };

        let input = MergeInput {
            entity_type: "shoppingItem",
            server_body: &item.body,
            server_version: item.version,
            server_updated_at: item.updated_at,
            server_change_id: item.last_change_id.as_deref(),
            patch: &toggle,
            client_observed_at: changed_at,
            change_id: &change.change_id,
        };
        match resolver::resolve(&input) {
            Resolution::AutoMerged { merged, .. } if merged != item.body => {
                let version = self
                    .write_versioned(conn, auth, change, "shoppingItem", item_id, item.version, &merged, false)
                    .await?;
                let record = self
                    .record_feed(conn, auth, &change.client_id, TargetRef::new("shoppingItem", item_id), ChangeOp::Patch, merged, version, &change.actor_id)
                    .await?;
                outbox::enqueue(
                    conn,
                    &DomainEvent::entity_changed(&auth.household_id, "shoppingItem", item_id, version, false),
                )
                .await?;
                Ok(ChangeOutcome::Applied {
                    server_changes: vec![record],
                })
            }
            // Stale toggle: the stored state already reflects a newer
            // transition.
            _ => Ok(ChangeOutcome::Applied {
                server_changes: vec![],
            }),
        }
    }

    /// Version-gated entity write. A miss here means the row moved
    /// inside our own transaction, which cannot happen; surface it as
    /// a database error rather than corrupting state.
    #[allow(clippy::too_many_arguments)]
    async fn write_versioned(
        &self,
        conn: &mut SqliteConnection,
        auth: &AuthUser,
        change: &Change,
        entity_type: &str,
        id: &str,
        expected_version: i64,
        body: &Value,
        deleted: bool,
    ) -> Result<i64, CoordinatorError> {
        let wrote = entity_store::update_versioned(
            conn,
            &auth.household_id,
            entity_type,
            id,
            expected_version,
            body,
            &change.change_id,
            deleted,
        )
        .await?;
        if !wrote {
            return Err(CoordinatorError::Database(sqlx::Error::RowNotFound));
        }
        Ok(expected_version + 1)
    }

    /// Build the authoritative feed record for a write and append it.
    #[allow(clippy::too_many_arguments)]
    async fn record_feed(
        &self,
        conn: &mut SqliteConnection,
        auth: &AuthUser,
        origin_client: &str,
        target: TargetRef,
        op: ChangeOp,
        body: Value,
        result_version: i64,
        actor_id: &str,
    ) -> Result<Change, CoordinatorError> {
        let record = Change::server_record(target, op, body, Some(result_version), actor_id);
        change_log::append_feed(conn, &auth.household_id, origin_client, &record).await?;
        Ok(record)
    }

    async fn conflicted(
        &self,
        conn: &mut SqliteConnection,
        auth: &AuthUser,
        change: &Change,
        conflict: Conflict,
    ) -> Result<ChangeOutcome, CoordinatorError> {
        conflict_store::insert_open(conn, &auth.household_id, &change.client_id, &conflict)
            .await?;
        outbox::enqueue(
            conn,
            &DomainEvent::conflict_detected(&auth.household_id, &conflict),
        )
        .await?;
        tracing::info!(
            conflict_id = %conflict.conflict_id,
            entity = %conflict.change.target.id,
            reason = ?conflict.reason,
            "change conflicted"
        );
        Ok(ChangeOutcome::Conflicted { conflict })
    }

    /// Serve feed records after the client's cursor, or a full resync
    /// when the cursor predates feed compaction.
    pub async fn pull(
        &self,
        auth: &AuthUser,
        req: PullRequest,
    ) -> Result<PullResponse, CoordinatorError> {
        let cursor = match &req.sync_cursor {
            Some(token) => Cursor::decode(token)
                .map_err(|e| CoordinatorError::BadRequest(e.to_string()))?,
            None => Cursor::start(),
        };
        let limit = req
            .limit
            .unwrap_or(DEFAULT_PULL_LIMIT)
            .clamp(1, MAX_PULL_LIMIT);

        let mut conn = self.pool.acquire().await?;
        let floor = change_log::retention_floor(&mut conn).await?;
        if cursor.feed_seq < floor {
            let entities = entity_store::snapshot_household(&mut conn, &auth.household_id).await?;
            let next = change_log::max_feed_seq(&mut conn).await?;
            tracing::info!(client_id = %req.client_id, "cursor predates compaction, full resync");
            return Ok(PullResponse {
                server_changes: vec![],
                new_sync_cursor: Cursor::new(next).encode(),
                has_more: false,
                resync_required: true,
                snapshot: entities
                    .into_iter()
                    .map(|e| EntitySnapshot {
                        entity_type: e.entity_type,
                        id: e.id,
                        version: e.version,
                        body: e.body,
                        deleted: e.deleted,
                    })
                    .collect(),
            });
        }

        let mut rows = change_log::feed_after(
            &mut conn,
            &auth.household_id,
            cursor.feed_seq,
            &req.client_id,
            limit + 1,
        )
        .await?;
        let has_more = rows.len() as i64 > limit;
        rows.truncate(limit as usize);
        let next_seq = rows.last().map(|(seq, _)| *seq).unwrap_or(cursor.feed_seq);

        Ok(PullResponse {
            server_changes: rows.into_iter().map(|(_, change)| change).collect(),
            new_sync_cursor: Cursor::new(next_seq).encode(),
            has_more,
            resync_required: false,
            snapshot: vec![],
        })
    }

    /// Resolve an open conflict with one of the offered choices.
    pub async fn resolve(
        &self,
        auth: &AuthUser,
        req: ResolveRequest,
    ) -> Result<ResolveResponse, CoordinatorError> {
        let mut tx = self.pool.begin().await?;
        let dedupe_id = format!("resolve:{}", req.conflict_id);

        if let Some(outcome) =
            change_log::get_outcome(&mut tx, &req.client_id, &dedupe_id).await?
        {
            tx.commit().await?;
            return Ok(resolve_response(req.conflict_id, outcome));
        }

        let conflict =
            conflict_store::get_open(&mut tx, &auth.household_id, &req.conflict_id).await?;
        let outcome = match conflict {
            None => rejected(SyncError::validation(
                "unknown or already resolved conflict",
            )),
            Some(c) if !c.allows(req.resolution) => rejected(SyncError::validation(
                "resolution choice was not offered for this conflict",
            )),
            Some(c) => {
                let outcome = match req.resolution {
                    ResolutionChoice::KeepServer => self.keep_server(&mut tx, auth, &c).await?,
                    ResolutionChoice::ApplyClientPatchOnLatest => {
                        self.reapply_on_latest(&mut tx, auth, &c, None).await?
                    }
                    ResolutionChoice::ManualMerge => match &req.merged_patch {
                        None => rejected(SyncError::validation(
                            "mergedPatch is required for MANUAL_MERGE",
                        )),
                        Some(p) => self.reapply_on_latest(&mut tx, auth, &c, Some(p)).await?,
                    },
                };
                if matches!(outcome, ChangeOutcome::Applied { .. }) {
                    conflict_store::mark_resolved(&mut tx, &auth.household_id, &c.conflict_id)
                        .await?;
                }
                outcome
            }
        };

        // Only a resolution that took effect is recorded for replay. A
        // rejected attempt leaves the conflict open so a corrected
        // request can still close it.
        if matches!(outcome, ChangeOutcome::Applied { .. }) {
            change_log::record_outcome(&mut tx, &req.client_id, &dedupe_id, &outcome).await?;
        }
        tx.commit().await?;

        Ok(resolve_response(req.conflict_id, outcome))
    }

    /// KEEP_SERVER: discard the client's edit; echo authoritative state.
    async fn keep_server(
        &self,
        conn: &mut SqliteConnection,
        auth: &AuthUser,
        conflict: &Conflict,
    ) -> Result<ChangeOutcome, CoordinatorError> {
        let target = &conflict.change.target;
        let entity =
            entity_store::get(conn, &auth.household_id, &target.entity_type, &target.id).await?;
        let server_changes = match entity {
            Some(e) if !e.deleted => vec![Change::server_record(
                target.clone(),
                ChangeOp::Patch,
                e.body.clone(),
                Some(e.version),
                &conflict.change.actor_id,
            )],
            _ => vec![],
        };
        Ok(ChangeOutcome::Applied { server_changes })
    }

    /// Re-apply the conflicted edit (or an explicit merge patch) on top
    /// of the latest version.
    async fn reapply_on_latest(
        &self,
        conn: &mut SqliteConnection,
        auth: &AuthUser,
        conflict: &Conflict,
        override_patch: Option<&Value>,
    ) -> Result<ChangeOutcome, CoordinatorError> {
        let change = &conflict.change;
        let target = &change.target;
        let entity =
            entity_store::get(conn, &auth.household_id, &target.entity_type, &target.id).await?;
        let entity = match entity {
            Some(e) if !e.deleted => e,
            _ => {
                return Ok(rejected(SyncError::rule_violation(
                    "entity no longer exists; only KEEP_SERVER can resolve this conflict",
                )))
            }
        };

        if change.op == ChangeOp::Delete && override_patch.is_none() {
            let version = self
                .write_versioned(conn, auth, change, &target.entity_type, &target.id, entity.version, &entity.body, true)
                .await?;
            let record = self
                .record_feed(conn, auth, &change.client_id, target.clone(), ChangeOp::Delete, Value::Null, version, &change.actor_id)
                .await?;
            outbox::enqueue(
                conn,
                &DomainEvent::entity_changed(&auth.household_id, &target.entity_type, &target.id, version, true),
            )
            .await?;
            return Ok(ChangeOutcome::Applied {
                server_changes: vec![record],
            });
        }

        let patch_value = match override_patch {
            Some(p) => p.clone(),
            None => match change.op {
                ChangeOp::Patch => change.body.clone(),
                // A conflicted CREATE replays as a full-body patch.
                _ => serde_json::to_value(PatchDocument::from_entity_body(&change.body))
                    .unwrap_or(Value::Null),
            },
        };
        let patch = match PatchDocument::parse(&patch_value) {
            Ok(p) => p,
            Err(e) => return Ok(rejected(e)),
        };
        if let Err(e) = patch.validate_for(&target.entity_type) {
            return Ok(rejected(e));
        }

        let merged = patch.apply_to(&entity.body, Utc::now());
        let version = self
            .write_versioned(conn, auth, change, &target.entity_type, &target.id, entity.version, &merged, false)
            .await?;
        let record = self
            .record_feed(conn, auth, &change.client_id, target.clone(), ChangeOp::Patch, merged, version, &change.actor_id)
            .await?;
        outbox::enqueue(
            conn,
            &DomainEvent::entity_changed(&auth.household_id, &target.entity_type, &target.id, version, false),
        )
        .await?;
        Ok(ChangeOutcome::Applied {
            server_changes: vec![record],
        })
    }

    /// Expire remaining portions of every prepped meal whose use-by
    /// date has passed. Idempotent per resource and day.
    pub async fn sweep_expired(&self, today: NaiveDate) -> Result<usize, CoordinatorError> {
        let candidates = {
            let mut conn = self.pool.acquire().await?;
            entity_store::list_live_by_type(&mut conn, "preppedMeal").await?
        };

        let mut expired = 0;
        for entity in candidates {
            let Some(use_by) = entity
                .body
                .get("useBy")
                .and_then(Value::as_str)
                .and_then(|s| s.parse::<NaiveDate>().ok())
            else {
                continue;
            };
            if use_by > today {
                continue;
            }

            let command = Command::ExpirePortions {
                resource_id: entity.id.clone(),
                date: today,
            };
            let body = match serde_json::to_value(&command) {
                Ok(b) => b,
                Err(e) => {
                    tracing::warn!(resource = %entity.id, "skipping sweep entry: {}", e);
                    continue;
                }
            };
            let change = Change {
                // Stable per resource and day, so a repeated sweep
                // replays the recorded outcome.
                change_id: Command::expiry_idempotency_key(&entity.id, today),
                client_id: SERVER_CLIENT_ID.to_string(),
                actor_id: SERVER_CLIENT_ID.to_string(),
                target: TargetRef::new("preppedMeal", &entity.id),
                op: ChangeOp::Command,
                base: None,
                body,
                client_observed_at: Utc::now(),
                result_version: None,
            };
            let auth = AuthUser {
                user_id: SERVER_CLIENT_ID.to_string(),
                household_id: entity.household_id.clone(),
            };
            let result = self
                .process_change(&auth, SERVER_CLIENT_ID, change)
                .await?;
            if !result.duplicate
                && matches!(result.outcome, ChangeOutcome::Applied { ref server_changes } if !server_changes.is_empty())
            {
                expired += 1;
            }
        }
        Ok(expired)
    }

    /// Open conflicts for the caller's household, oldest first.
    pub async fn open_conflicts(
        &self,
        auth: &AuthUser,
    ) -> Result<Vec<Conflict>, CoordinatorError> {
        let mut conn = self.pool.acquire().await?;
        Ok(conflict_store::list_open(&mut conn, &auth.household_id).await?)
    }

    /// Drop feed history while keeping at least `keep_latest` records,
    /// raising the retention floor.
    pub async fn compact_feed(&self, keep_latest: i64) -> Result<u64, CoordinatorError> {
        let mut tx = self.pool.begin().await?;
        let max = change_log::max_feed_seq(&mut tx).await?;
        let up_to = max - keep_latest;
        if up_to <= 0 {
            tx.commit().await?;
            return Ok(0);
        }
        let removed = change_log::compact_feed(&mut tx, up_to).await?;
        tx.commit().await?;
        Ok(removed)
    }
}

fn rejected(e: SyncError) -> ChangeOutcome {
    ChangeOutcome::Rejected {
        code: e.code().to_string(),
        message: e.to_string(),
    }
}

/// Fold a resolution outcome into the wire response.
fn resolve_response(conflict_id: String, outcome: ChangeOutcome) -> ResolveResponse {
    match outcome {
        ChangeOutcome::Applied { server_changes } => ResolveResponse {
            conflict_id,
            resolved: true,
            server_changes,
            error: None,
        },
        ChangeOutcome::Rejected { code, message } => ResolveResponse {
            conflict_id,
            resolved: false,
            server_changes: vec![],
            error: Some(ErrorBody { code, message }),
        },
        ChangeOutcome::Conflicted { .. } => ResolveResponse {
            conflict_id,
            resolved: false,
            server_changes: vec![],
            error: Some(ErrorBody {
                code: meal_sync_core::error::CODE_VERSION_MISMATCH.to_string(),
                message: "resolution did not apply cleanly".to_string(),
            }),
        },
    }
}
