//! Versioned entity storage.
//!
//! Every entity carries a monotonically increasing integer version.
//! Writes are gated on the expected version so concurrent transactions
//! cannot silently overwrite each other. Deletes are tombstones; the
//! row and its version survive so later writes still conflict.

use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::SqliteConnection;

/// A stored entity row.
#[derive(Debug, Clone)]
pub struct StoredEntity {
    pub entity_type: String,
    pub id: String,
    pub household_id: String,
    pub version: i64,
    pub body: Value,
    pub updated_at: DateTime<Utc>,
    /// Change id of the last applied write, used for deterministic
    /// tie-breaking in merges.
    pub last_change_id: Option<String>,
    pub deleted: bool,
}

#[derive(sqlx::FromRow)]
struct EntityRow {
    entity_type: String,
    id: String,
    household_id: String,
    version: i64,
    body: String,
    updated_at: String,
    last_change_id: Option<String>,
    deleted: i64,
}

impl EntityRow {
    fn into_entity(self) -> Result<StoredEntity, sqlx::Error> {
        let body: Value = serde_json::from_str(&self.body)
            .map_err(|e| sqlx::Error::Decode(Box::new(e)))?;
        let updated_at = DateTime::parse_from_rfc3339(&self.updated_at)
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now());
        Ok(StoredEntity {
            entity_type: self.entity_type,
            id: self.id,
            household_id: self.household_id,
            version: self.version,
            body,
            updated_at,
            last_change_id: self.last_change_id,
            deleted: self.deleted != 0,
        })
    }
}

/// Fetch an entity, tombstoned or not.
pub async fn get(
    conn: &mut SqliteConnection,
    household_id: &str,
    entity_type: &str,
    id: &str,
) -> Result<Option<StoredEntity>, sqlx::Error> {
    let row: Option<EntityRow> = sqlx::query_as(
        "SELECT * FROM entities WHERE entity_type = ? AND id = ? AND household_id = ?",
    )
    .bind(entity_type)
    .bind(id)
    .bind(household_id)
    .fetch_optional(&mut *conn)
    .await?;

    row.map(EntityRow::into_entity).transpose()
}

/// Insert a brand-new entity at version 1.
pub async fn insert(
    conn: &mut SqliteConnection,
    entity: &StoredEntity,
) -> Result<(), sqlx::Error> {
    let body = serde_json::to_string(&entity.body)
        .map_err(|e| sqlx::Error::Encode(Box::new(e)))?;
    sqlx::query(
        r#"
        INSERT INTO entities (entity_type, id, household_id, version, body, updated_at, last_change_id, deleted)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&entity.entity_type)
    .bind(&entity.id)
    .bind(&entity.household_id)
    .bind(entity.version)
    .bind(&body)
    .bind(entity.updated_at.to_rfc3339())
    .bind(&entity.last_change_id)
    .bind(entity.deleted as i64)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// Version-gated write. Returns false when the stored version no longer
/// matches `expected_version`, in which case nothing was written.
#[allow(clippy::too_many_arguments)]
pub async fn update_versioned(
    conn: &mut SqliteConnection,
    household_id: &str,
    entity_type: &str,
    id: &str,
    expected_version: i64,
    body: &Value,
    last_change_id: &str,
    deleted: bool,
) -> Result<bool, sqlx::Error> {
    let body = serde_json::to_string(body).map_err(|e| sqlx::Error::Encode(Box::new(e)))?;
    let result = sqlx::query(
        r#"
        UPDATE entities
        SET version = version + 1, body = ?, updated_at = ?, last_change_id = ?, deleted = ?
        WHERE entity_type = ? AND id = ? AND household_id = ? AND version = ?
        "#,
    )
    .bind(&body)
    .bind(Utc::now().to_rfc3339())
    .bind(last_change_id)
    .bind(deleted as i64)
    .bind(entity_type)
    .bind(id)
    .bind(household_id)
    .bind(expected_version)
    .execute(&mut *conn)
    .await?;

    Ok(result.rows_affected() == 1)
}

/// All entities of a household, tombstones included. Used to build
/// full-resync snapshots.
pub async fn snapshot_household(
    conn: &mut SqliteConnection,
    household_id: &str,
) -> Result<Vec<StoredEntity>, sqlx::Error> {
    let rows: Vec<EntityRow> =
        sqlx::query_as("SELECT * FROM entities WHERE household_id = ? ORDER BY entity_type, id")
            .bind(household_id)
            .fetch_all(&mut *conn)
            .await?;

    rows.into_iter().map(EntityRow::into_entity).collect()
}

/// Live entities of one type in a household.
pub async fn list_live(
    conn: &mut SqliteConnection,
    household_id: &str,
    entity_type: &str,
) -> Result<Vec<StoredEntity>, sqlx::Error> {
    let rows: Vec<EntityRow> = sqlx::query_as(
        "SELECT * FROM entities WHERE household_id = ? AND entity_type = ? AND deleted = 0 ORDER BY id",
    )
    .bind(household_id)
    .bind(entity_type)
    .fetch_all(&mut *conn)
    .await?;

    rows.into_iter().map(EntityRow::into_entity).collect()
}

/// Live entities of one type across all households. Used by the
/// expiry sweep.
pub async fn list_live_by_type(
    conn: &mut SqliteConnection,
    entity_type: &str,
) -> Result<Vec<StoredEntity>, sqlx::Error> {
    let rows: Vec<EntityRow> = sqlx::query_as(
        "SELECT * FROM entities WHERE entity_type = ? AND deleted = 0 ORDER BY household_id, id",
    )
    .bind(entity_type)
    .fetch_all(&mut *conn)
    .await?;

    rows.into_iter().map(EntityRow::into_entity).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_pool;
    use serde_json::json;
    use tempfile::TempDir;

    fn entity(id: &str, version: i64, body: Value) -> StoredEntity {
        StoredEntity {
            entity_type: "shoppingItem".into(),
            id: id.into(),
            household_id: "h1".into(),
            version,
            body,
            updated_at: Utc::now(),
            last_change_id: Some("c1".into()),
            deleted: false,
        }
    }

    #[tokio::test]
    async fn test_insert_and_get() {
        let dir = TempDir::new().unwrap();
        let pool = test_pool(&dir).await;
        let mut conn = pool.acquire().await.unwrap();

        insert(&mut conn, &entity("i1", 1, json!({"name": "eggs"})))
            .await
            .unwrap();

        let got = get(&mut conn, "h1", "shoppingItem", "i1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got.version, 1);
        assert_eq!(got.body["name"], "eggs");
        assert!(!got.deleted);

        // Scoped by household.
        assert!(get(&mut conn, "h2", "shoppingItem", "i1")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_same_id_across_households() {
        let dir = TempDir::new().unwrap();
        let pool = test_pool(&dir).await;
        let mut conn = pool.acquire().await.unwrap();

        insert(&mut conn, &entity("i1", 1, json!({"name": "eggs"})))
            .await
            .unwrap();

        // Ids are client-chosen; another household may pick the same
        // one and must get its own row.
        let mut other = entity("i1", 1, json!({"name": "milk"}));
        other.household_id = "h2".into();
        insert(&mut conn, &other).await.unwrap();

        let got = get(&mut conn, "h1", "shoppingItem", "i1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got.body["name"], "eggs");
        let got = get(&mut conn, "h2", "shoppingItem", "i1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got.body["name"], "milk");
    }

    #[tokio::test]
    async fn test_update_versioned_cas() {
        let dir = TempDir::new().unwrap();
        let pool = test_pool(&dir).await;
        let mut conn = pool.acquire().await.unwrap();

        insert(&mut conn, &entity("i1", 1, json!({"name": "eggs"})))
            .await
            .unwrap();

        let wrote = update_versioned(
            &mut conn,
            "h1",
            "shoppingItem",
            "i1",
            1,
            &json!({"name": "free range eggs"}),
            "c2",
            false,
        )
        .await
        .unwrap();
        assert!(wrote);

        let got = get(&mut conn, "h1", "shoppingItem", "i1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got.version, 2);
        assert_eq!(got.last_change_id.as_deref(), Some("c2"));

        // Stale expected version writes nothing.
        let wrote = update_versioned(
            &mut conn,
            "h1",
            "shoppingItem",
            "i1",
            1,
            &json!({"name": "stale"}),
            "c3",
            false,
        )
        .await
        .unwrap();
        assert!(!wrote);

        let got = get(&mut conn, "h1", "shoppingItem", "i1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got.version, 2);
        assert_eq!(got.body["name"], "free range eggs");
    }

    #[tokio::test]
    async fn test_tombstone_keeps_row_and_version() {
        let dir = TempDir::new().unwrap();
        let pool = test_pool(&dir).await;
        let mut conn = pool.acquire().await.unwrap();

        insert(&mut conn, &entity("i1", 1, json!({"name": "eggs"})))
            .await
            .unwrap();
        update_versioned(
            &mut conn,
            "h1",
            "shoppingItem",
            "i1",
            1,
            &json!({"name": "eggs"}),
            "c2",
            true,
        )
        .await
        .unwrap();

        let got = get(&mut conn, "h1", "shoppingItem", "i1")
            .await
            .unwrap()
            .unwrap();
        assert!(got.deleted);
        assert_eq!(got.version, 2);

        assert!(list_live(&mut conn, "h1", "shoppingItem")
            .await
            .unwrap()
            .is_empty());
        assert_eq!(snapshot_household(&mut conn, "h1").await.unwrap().len(), 1);
    }
}
