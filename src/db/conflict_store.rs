//! Persistence for open conflicts awaiting client resolution.

use chrono::Utc;
use sqlx::SqliteConnection;

use meal_sync_core::conflict::Conflict;

/// Persist a newly detected conflict as open.
pub async fn insert_open(
    conn: &mut SqliteConnection,
    household_id: &str,
    client_id: &str,
    conflict: &Conflict,
) -> Result<(), sqlx::Error> {
    let json = serde_json::to_string(conflict).map_err(|e| sqlx::Error::Encode(Box::new(e)))?;
    sqlx::query(
        r#"
        INSERT INTO conflicts (conflict_id, household_id, client_id, conflict, status, created_at)
        VALUES (?, ?, ?, ?, 'open', ?)
        "#,
    )
    .bind(&conflict.conflict_id)
    .bind(household_id)
    .bind(client_id)
    .bind(&json)
    .bind(Utc::now().to_rfc3339())
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// Fetch an open conflict by id within a household.
pub async fn get_open(
    conn: &mut SqliteConnection,
    household_id: &str,
    conflict_id: &str,
) -> Result<Option<Conflict>, sqlx::Error> {
    let row: Option<(String,)> = sqlx::query_as(
        "SELECT conflict FROM conflicts WHERE conflict_id = ? AND household_id = ? AND status = 'open'",
    )
    .bind(conflict_id)
    .bind(household_id)
    .fetch_optional(&mut *conn)
    .await?;

    row.map(|(json,)| serde_json::from_str(&json).map_err(|e| sqlx::Error::Decode(Box::new(e))))
        .transpose()
}

/// Mark a conflict resolved. Returns false when it was not open.
pub async fn mark_resolved(
    conn: &mut SqliteConnection,
    household_id: &str,
    conflict_id: &str,
) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        "UPDATE conflicts SET status = 'resolved', resolved_at = ? WHERE conflict_id = ? AND household_id = ? AND status = 'open'",
    )
    .bind(Utc::now().to_rfc3339())
    .bind(conflict_id)
    .bind(household_id)
    .execute(&mut *conn)
    .await?;
    Ok(result.rows_affected() == 1)
}

/// All open conflicts in a household, oldest first.
pub async fn list_open(
    conn: &mut SqliteConnection,
    household_id: &str,
) -> Result<Vec<Conflict>, sqlx::Error> {
    let rows: Vec<(String,)> = sqlx::query_as(
        "SELECT conflict FROM conflicts WHERE household_id = ? AND status = 'open' ORDER BY created_at",
    )
    .bind(household_id)
    .fetch_all(&mut *conn)
    .await?;

    rows.into_iter()
        .map(|(json,)| serde_json::from_str(&json).map_err(|e| sqlx::Error::Decode(Box::new(e))))
        .collect()
}
