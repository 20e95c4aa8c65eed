//! Transactional outbox for domain events.
//!
//! Events are inserted in the same transaction as the state change
//! that produced them and published by a background drain afterwards,
//! so a crash between commit and publish loses nothing.

use chrono::{DateTime, Utc};
use sqlx::SqliteConnection;

use meal_sync_core::event::DomainEvent;

/// Queue an event inside the caller's transaction.
pub async fn enqueue(
    conn: &mut SqliteConnection,
    event: &DomainEvent,
) -> Result<(), sqlx::Error> {
    let json = serde_json::to_string(event).map_err(|e| sqlx::Error::Encode(Box::new(e)))?;
    sqlx::query(
        "INSERT INTO outbox (event_id, household_id, event, recorded_at) VALUES (?, ?, ?, ?)",
    )
    .bind(&event.event_id)
    .bind(&event.household_id)
    .bind(&json)
    .bind(Utc::now().to_rfc3339())
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// Unpublished events, oldest first.
pub async fn pending(
    conn: &mut SqliteConnection,
    limit: i64,
) -> Result<Vec<DomainEvent>, sqlx::Error> {
    let rows: Vec<(String,)> = sqlx::query_as(
        "SELECT event FROM outbox WHERE published_at IS NULL ORDER BY recorded_at LIMIT ?",
    )
    .bind(limit)
    .fetch_all(&mut *conn)
    .await?;

    rows.into_iter()
        .map(|(json,)| serde_json::from_str(&json).map_err(|e| sqlx::Error::Decode(Box::new(e))))
        .collect()
}

/// Mark one event delivered.
pub async fn mark_published(
    conn: &mut SqliteConnection,
    event_id: &str,
) -> Result<(), sqlx::Error> {
    sqlx::query("UPDATE outbox SET published_at = ? WHERE event_id = ?")
        .bind(Utc::now().to_rfc3339())
        .bind(event_id)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

/// Delete published events older than `before`. The pending set is
/// never touched.
pub async fn prune_published(
    conn: &mut SqliteConnection,
    before: DateTime<Utc>,
) -> Result<u64, sqlx::Error> {
    let result = sqlx::query(
        "DELETE FROM outbox WHERE published_at IS NOT NULL AND published_at < ?",
    )
    .bind(before.to_rfc3339())
    .execute(&mut *conn)
    .await?;
    Ok(result.rows_affected())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_pool;
    use serde_json::json;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_enqueue_drain_prune() {
        let dir = TempDir::new().unwrap();
        let pool = test_pool(&dir).await;
        let mut conn = pool.acquire().await.unwrap();

        let a = DomainEvent::new("entity.updated", "h1", json!({"entityId": "i1"}));
        let b = DomainEvent::new("portion.consumed", "h1", json!({"resourceId": "pm1"}));
        enqueue(&mut conn, &a).await.unwrap();
        enqueue(&mut conn, &b).await.unwrap();

        let queued = pending(&mut conn, 10).await.unwrap();
        assert_eq!(queued.len(), 2);

        mark_published(&mut conn, &a.event_id).await.unwrap();
        let queued = pending(&mut conn, 10).await.unwrap();
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].event_id, b.event_id);

        // Prune removes only published events.
        let removed = prune_published(&mut conn, Utc::now() + chrono::Duration::hours(1))
            .await
            .unwrap();
        assert_eq!(removed, 1);
        assert_eq!(pending(&mut conn, 10).await.unwrap().len(), 1);
    }
}
