//! Change dedupe log, household change feed, and feed retention.
//!
//! The dedupe log records exactly one terminal outcome per
//! `(client_id, change_id)`; replays read it back instead of touching
//! state again. The feed is the ordered stream pulls page through, and
//! the retention floor marks how far back it has been compacted.

use chrono::Utc;
use sqlx::SqliteConnection;

use meal_sync_core::change::{Change, ChangeOutcome};

/// Recorded outcome for a change, if it was already processed.
pub async fn get_outcome(
    conn: &mut SqliteConnection,
    client_id: &str,
    change_id: &str,
) -> Result<Option<ChangeOutcome>, sqlx::Error> {
    let row: Option<(String,)> =
        sqlx::query_as("SELECT outcome FROM change_log WHERE client_id = ? AND change_id = ?")
            .bind(client_id)
            .bind(change_id)
            .fetch_optional(&mut *conn)
            .await?;

    row.map(|(outcome,)| {
        serde_json::from_str(&outcome).map_err(|e| sqlx::Error::Decode(Box::new(e)))
    })
    .transpose()
}

/// Record the terminal outcome of a change. The primary key makes a
/// second record for the same change a constraint error, never a
/// silent overwrite.
pub async fn record_outcome(
    conn: &mut SqliteConnection,
    client_id: &str,
    change_id: &str,
    outcome: &ChangeOutcome,
) -> Result<(), sqlx::Error> {
    let json = serde_json::to_string(outcome).map_err(|e| sqlx::Error::Encode(Box::new(e)))?;
    sqlx::query(
        "INSERT INTO change_log (client_id, change_id, status, outcome, recorded_at) VALUES (?, ?, ?, ?, ?)",
    )
    .bind(client_id)
    .bind(change_id)
    .bind(outcome.status().as_str())
    .bind(&json)
    .bind(Utc::now().to_rfc3339())
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// Append an authoritative record to the household feed.
pub async fn append_feed(
    conn: &mut SqliteConnection,
    household_id: &str,
    origin_client_id: &str,
    change: &Change,
) -> Result<i64, sqlx::Error> {
    let json = serde_json::to_string(change).map_err(|e| sqlx::Error::Encode(Box::new(e)))?;
    let result = sqlx::query(
        "INSERT INTO change_feed (household_id, origin_client_id, change, recorded_at) VALUES (?, ?, ?, ?)",
    )
    .bind(household_id)
    .bind(origin_client_id)
    .bind(&json)
    .bind(Utc::now().to_rfc3339())
    .execute(&mut *conn)
    .await?;
    Ok(result.last_insert_rowid())
}

/// Feed records after `after_seq`, excluding those the requesting
/// client originated, oldest first.
pub async fn feed_after(
    conn: &mut SqliteConnection,
    household_id: &str,
    after_seq: i64,
    exclude_client: &str,
    limit: i64,
) -> Result<Vec<(i64, Change)>, sqlx::Error> {
    let rows: Vec<(i64, String)> = sqlx::query_as(
        r#"
        SELECT feed_seq, change FROM change_feed
        WHERE household_id = ? AND feed_seq > ? AND origin_client_id != ?
        ORDER BY feed_seq
        LIMIT ?
        "#,
    )
    .bind(household_id)
    .bind(after_seq)
    .bind(exclude_client)
    .bind(limit)
    .fetch_all(&mut *conn)
    .await?;

    rows.into_iter()
        .map(|(seq, json)| {
            serde_json::from_str(&json)
                .map(|change| (seq, change))
                .map_err(|e| sqlx::Error::Decode(Box::new(e)))
        })
        .collect()
}

/// Highest sequence in the feed, across all households. New cursors
/// start here.
pub async fn max_feed_seq(conn: &mut SqliteConnection) -> Result<i64, sqlx::Error> {
    let (max,): (i64,) = sqlx::query_as("SELECT COALESCE(MAX(feed_seq), 0) FROM change_feed")
        .fetch_one(&mut *conn)
        .await?;
    Ok(max)
}

/// Highest sequence ever compacted away. Cursors at or below it can no
/// longer be served incrementally.
pub async fn retention_floor(conn: &mut SqliteConnection) -> Result<i64, sqlx::Error> {
    let (floor,): (i64,) = sqlx::query_as("SELECT floor_seq FROM feed_retention WHERE id = 1")
        .fetch_one(&mut *conn)
        .await?;
    Ok(floor)
}

/// Delete feed records at or below `up_to_seq` and raise the floor.
pub async fn compact_feed(
    conn: &mut SqliteConnection,
    up_to_seq: i64,
) -> Result<u64, sqlx::Error> {
    let result = sqlx::query("DELETE FROM change_feed WHERE feed_seq <= ?")
        .bind(up_to_seq)
        .execute(&mut *conn)
        .await?;
    sqlx::query("UPDATE feed_retention SET floor_seq = MAX(floor_seq, ?) WHERE id = 1")
        .bind(up_to_seq)
        .execute(&mut *conn)
        .await?;
    Ok(result.rows_affected())
}
