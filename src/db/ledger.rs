//! Append-only portion ledger.
//!
//! Rows are never updated or deleted; every quantity change is a new
//! row and the remaining count is the original plus the sum of deltas.
//! Appends, the sequence assignment, and the cached remaining count all
//! happen in the caller's transaction, which is what keeps sequences
//! gap-free and the non-negative invariant race-free.

use chrono::{DateTime, Utc};
use sqlx::SqliteConnection;
use uuid::Uuid;

use meal_sync_core::portion::{PortionEvent, PortionKind};

/// Outcome of an append attempt.
#[derive(Debug)]
pub enum AppendResult {
    /// A new row was written.
    Appended { event: PortionEvent, remaining: i64 },
    /// The idempotency key had already been used; the original row is
    /// returned and nothing was written.
    Replayed { event: PortionEvent, remaining: i64 },
    /// The append would violate a ledger rule; nothing was written.
    Rejected { message: String, remaining: i64 },
    /// The resource has no ledger.
    MissingResource,
}

#[derive(sqlx::FromRow)]
struct PortionEventRow {
    portion_event_id: String,
    resource_id: String,
    kind: String,
    delta_portions: i64,
    occurred_at: String,
    recorded_at: String,
    sequence: i64,
    idempotency_key: Option<String>,
}

impl PortionEventRow {
    fn into_event(self) -> Result<PortionEvent, sqlx::Error> {
        let kind: PortionKind = self
            .kind
            .parse()
            .map_err(|e: String| sqlx::Error::Decode(e.into()))?;
        Ok(PortionEvent {
            portion_event_id: self.portion_event_id,
            resource_id: self.resource_id,
            kind,
            delta_portions: self.delta_portions,
            occurred_at: parse_ts(&self.occurred_at),
            recorded_at: parse_ts(&self.recorded_at),
            sequence: self.sequence,
            idempotency_key: self.idempotency_key,
        })
    }
}

fn parse_ts(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

/// Open a ledger for a new resource.
pub async fn init_resource(
    conn: &mut SqliteConnection,
    resource_id: &str,
    original_portions: i64,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO portion_remaining (resource_id, original_portions, remaining) VALUES (?, ?, ?)",
    )
    .bind(resource_id)
    .bind(original_portions)
    .bind(original_portions)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// Current (original, remaining) counts for a resource.
pub async fn remaining(
    conn: &mut SqliteConnection,
    resource_id: &str,
) -> Result<Option<(i64, i64)>, sqlx::Error> {
    sqlx::query_as(
        "SELECT original_portions, remaining FROM portion_remaining WHERE resource_id = ?",
    )
    .bind(resource_id)
    .fetch_optional(&mut *conn)
    .await
}

/// Append one ledger row.
pub async fn append(
    conn: &mut SqliteConnection,
    resource_id: &str,
    kind: PortionKind,
    delta_portions: i64,
    occurred_at: DateTime<Utc>,
    idempotency_key: Option<&str>,
    actor_id: &str,
) -> Result<AppendResult, sqlx::Error> {
    let Some((_, current)) = remaining(conn, resource_id).await? else {
        return Ok(AppendResult::MissingResource);
    };

    if let Some(key) = idempotency_key {
        let existing: Option<PortionEventRow> = sqlx::query_as(
            "SELECT portion_event_id, resource_id, kind, delta_portions, occurred_at, recorded_at, sequence, idempotency_key
             FROM portion_events WHERE resource_id = ? AND idempotency_key = ?",
        )
        .bind(resource_id)
        .bind(key)
        .fetch_optional(&mut *conn)
        .await?;
        if let Some(row) = existing {
            return Ok(AppendResult::Replayed {
                event: row.into_event()?,
                remaining: current,
            });
        }
    }

    if delta_portions == 0 {
        return Ok(AppendResult::Rejected {
            message: "delta must be non-zero".into(),
            remaining: current,
        });
    }
    if delta_portions > 0 && !kind.allows_positive_delta() {
        return Ok(AppendResult::Rejected {
            message: format!("{} deltas must be negative", kind.as_str()),
            remaining: current,
        });
    }
    let new_remaining = match current.checked_add(delta_portions) {
        Some(n) if n >= 0 => n,
        Some(_) => {
            return Ok(AppendResult::Rejected {
                message: format!(
                    "insufficient portions: {} remaining, delta {}",
                    current, delta_portions
                ),
                remaining: current,
            })
        }
        None => {
            return Ok(AppendResult::Rejected {
                message: format!("delta {} overflows the portion count", delta_portions),
                remaining: current,
            })
        }
    };

    let (next_seq,): (i64,) = sqlx::query_as(
        "SELECT COALESCE(MAX(sequence), 0) + 1 FROM portion_events WHERE resource_id = ?",
    )
    .bind(resource_id)
    .fetch_one(&mut *conn)
    .await?;

    let event = PortionEvent {
        portion_event_id: Uuid::new_v4().to_string(),
        resource_id: resource_id.to_string(),
        kind,
        delta_portions,
        occurred_at,
        recorded_at: Utc::now(),
        sequence: next_seq,
        idempotency_key: idempotency_key.map(str::to_string),
    };

    sqlx::query(
        r#"
        INSERT INTO portion_events (portion_event_id, resource_id, kind, delta_portions, occurred_at, recorded_at, sequence, idempotency_key, actor_id)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&event.portion_event_id)
    .bind(&event.resource_id)
    .bind(event.kind.as_str())
    .bind(event.delta_portions)
    .bind(event.occurred_at.to_rfc3339())
    .bind(event.recorded_at.to_rfc3339())
    .bind(event.sequence)
    .bind(&event.idempotency_key)
    .bind(actor_id)
    .execute(&mut *conn)
    .await?;

    sqlx::query("UPDATE portion_remaining SET remaining = ? WHERE resource_id = ?")
        .bind(new_remaining)
        .bind(resource_id)
        .execute(&mut *conn)
        .await?;

    Ok(AppendResult::Appended {
        event,
        remaining: new_remaining,
    })
}

/// Full event history of a resource, in sequence order.
pub async fn events(
    conn: &mut SqliteConnection,
    resource_id: &str,
) -> Result<Vec<PortionEvent>, sqlx::Error> {
    let rows: Vec<PortionEventRow> = sqlx::query_as(
        "SELECT portion_event_id, resource_id, kind, delta_portions, occurred_at, recorded_at, sequence, idempotency_key
         FROM portion_events WHERE resource_id = ? ORDER BY sequence",
    )
    .bind(resource_id)
    .fetch_all(&mut *conn)
    .await?;

    rows.into_iter().map(PortionEventRow::into_event).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_pool;
    use tempfile::TempDir;

    async fn setup() -> (TempDir, sqlx::SqlitePool) {
        let dir = TempDir::new().unwrap();
        let pool = test_pool(&dir).await;
        (dir, pool)
    }

    #[tokio::test]
    async fn test_adjust_overflow_is_rejected() {
        let (_dir, pool) = setup().await;
        let mut conn = pool.acquire().await.unwrap();

        init_resource(&mut conn, "pm1", 1).await.unwrap();
        let result = append(
            &mut conn,
            "pm1",
            PortionKind::Adjusted,
            i64::MAX,
            Utc::now(),
            None,
            "user1",
        )
        .await
        .unwrap();
        match result {
            AppendResult::Rejected { remaining, .. } => assert_eq!(remaining, 1),
            other => panic!("expected rejection, got {:?}", other),
        }
        assert_eq!(remaining(&mut conn, "pm1").await.unwrap(), Some((1, 1)));
    }

    #[tokio::test]
    async fn test_append_and_remaining() {
        let (_dir, pool) = setup().await;
        let mut conn = pool.acquire().await.unwrap();

        init_resource(&mut conn, "pm1", 6).await.unwrap();
        assert_eq!(remaining(&mut conn, "pm1").await.unwrap(), Some((6, 6)));

        let result = append(
            &mut conn,
            "pm1",
            PortionKind::Consumed,
            -2,
            Utc::now(),
            None,
            "user1",
        )
        .await
        .unwrap();
        match result {
            AppendResult::Appended { event, remaining } => {
                assert_eq!(event.sequence, 1);
                assert_eq!(remaining, 4);
            }
            other => panic!("expected append, got {:?}", other),
        }

        let result = append(
            &mut conn,
            "pm1",
            PortionKind::Discarded,
            -1,
            Utc::now(),
            None,
            "user1",
        )
        .await
        .unwrap();
        match result {
            AppendResult::Appended { event, remaining } => {
                assert_eq!(event.sequence, 2);
                assert_eq!(remaining, 3);
            }
            other => panic!("expected append, got {:?}", other),
        }

        assert_eq!(remaining(&mut conn, "pm1").await.unwrap(), Some((6, 3)));
        let history = events(&mut conn, "pm1").await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].kind, PortionKind::Consumed);
    }

    #[tokio::test]
    async fn test_never_goes_negative() {
        let (_dir, pool) = setup().await;
        let mut conn = pool.acquire().await.unwrap();

        init_resource(&mut conn, "pm1", 2).await.unwrap();

        let result = append(
            &mut conn,
            "pm1",
            PortionKind::Consumed,
            -3,
            Utc::now(),
            None,
            "user1",
        )
        .await
        .unwrap();
        match result {
            AppendResult::Rejected { remaining, .. } => assert_eq!(remaining, 2),
            other => panic!("expected rejection, got {:?}", other),
        }

        // Nothing was written.
        assert!(events(&mut conn, "pm1").await.unwrap().is_empty());
        assert_eq!(remaining(&mut conn, "pm1").await.unwrap(), Some((2, 2)));
    }

    #[tokio::test]
    async fn test_positive_delta_only_for_adjusted() {
        let (_dir, pool) = setup().await;
        let mut conn = pool.acquire().await.unwrap();

        init_resource(&mut conn, "pm1", 2).await.unwrap();

        let result = append(
            &mut conn,
            "pm1",
            PortionKind::Consumed,
            1,
            Utc::now(),
            None,
            "user1",
        )
        .await
        .unwrap();
        assert!(matches!(result, AppendResult::Rejected { .. }));

        let result = append(
            &mut conn,
            "pm1",
            PortionKind::Adjusted,
            3,
            Utc::now(),
            None,
            "user1",
        )
        .await
        .unwrap();
        match result {
            AppendResult::Appended { remaining, .. } => assert_eq!(remaining, 5),
            other => panic!("expected append, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_idempotency_key_replays() {
        let (_dir, pool) = setup().await;
        let mut conn = pool.acquire().await.unwrap();

        init_resource(&mut conn, "pm1", 4).await.unwrap();

        let key = "expire:pm1:2026-01-11";
        let first = append(
            &mut conn,
            "pm1",
            PortionKind::Expired,
            -4,
            Utc::now(),
            Some(key),
            "server",
        )
        .await
        .unwrap();
        let first_id = match first {
            AppendResult::Appended { event, remaining } => {
                assert_eq!(remaining, 0);
                event.portion_event_id
            }
            other => panic!("expected append, got {:?}", other),
        };

        let second = append(
            &mut conn,
            "pm1",
            PortionKind::Expired,
            -4,
            Utc::now(),
            Some(key),
            "server",
        )
        .await
        .unwrap();
        match second {
            AppendResult::Replayed { event, remaining } => {
                assert_eq!(event.portion_event_id, first_id);
                assert_eq!(remaining, 0);
            }
            other => panic!("expected replay, got {:?}", other),
        }

        assert_eq!(events(&mut conn, "pm1").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_sequences_are_per_resource() {
        let (_dir, pool) = setup().await;
        let mut conn = pool.acquire().await.unwrap();

        init_resource(&mut conn, "pm1", 4).await.unwrap();
        init_resource(&mut conn, "pm2", 4).await.unwrap();

        for resource in ["pm1", "pm2", "pm1"] {
            append(
                &mut conn,
                resource,
                PortionKind::Consumed,
                -1,
                Utc::now(),
                None,
                "user1",
            )
            .await
            .unwrap();
        }

        let pm1: Vec<i64> = events(&mut conn, "pm1")
            .await
            .unwrap()
            .iter()
            .map(|e| e.sequence)
            .collect();
        let pm2: Vec<i64> = events(&mut conn, "pm2")
            .await
            .unwrap()
            .iter()
            .map(|e| e.sequence)
            .collect();
        assert_eq!(pm1, vec![1, 2]);
        assert_eq!(pm2, vec![1]);
    }

    #[tokio::test]
    async fn test_missing_resource() {
        let (_dir, pool) = setup().await;
        let mut conn = pool.acquire().await.unwrap();

        let result = append(
            &mut conn,
            "ghost",
            PortionKind::Consumed,
            -1,
            Utc::now(),
            None,
            "user1",
        )
        .await
        .unwrap();
        assert!(matches!(result, AppendResult::MissingResource));
    }
}
