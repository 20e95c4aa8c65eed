//! In-process event fan-out and the outbox drain.
//!
//! Domain events are committed to the outbox table alongside the state
//! changes that produced them; `run_outbox_publisher` drains the table
//! and broadcasts each event to hub subscribers for its household.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use sqlx::SqlitePool;
use tokio::sync::{broadcast, RwLock};

use meal_sync_core::event::DomainEvent;

use crate::db::outbox;

const CHANNEL_CAPACITY: usize = 256;
const DRAIN_BATCH: i64 = 100;

/// Broadcast channels per household.
pub struct EventHub {
    channels: RwLock<HashMap<String, broadcast::Sender<DomainEvent>>>,
}

impl EventHub {
    pub fn new() -> Self {
        Self {
            channels: RwLock::new(HashMap::new()),
        }
    }

    /// Subscribe to events for a household.
    pub async fn subscribe(&self, household_id: &str) -> broadcast::Receiver<DomainEvent> {
        let mut channels = self.channels.write().await;
        channels
            .entry(household_id.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe()
    }

    /// Broadcast an event to household subscribers. Events for
    /// households with no subscribers are dropped.
    pub async fn publish(&self, event: DomainEvent) {
        let channels = self.channels.read().await;
        if let Some(sender) = channels.get(&event.household_id) {
            // Send fails only when no receiver is listening.
            let _ = sender.send(event);
        }
    }
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new()
    }
}

/// Drain the outbox forever: publish pending events to the hub and
/// mark them delivered. Runs as a background task.
pub async fn run_outbox_publisher(pool: SqlitePool, hub: Arc<EventHub>) {
    let mut ticker = tokio::time::interval(Duration::from_millis(500));
    loop {
        ticker.tick().await;
        if let Err(e) = drain_once(&pool, &hub).await {
            tracing::warn!("outbox drain failed: {}", e);
        }
    }
}

/// One drain pass. Separated from the loop so tests can call it
/// directly.
pub async fn drain_once(pool: &SqlitePool, hub: &EventHub) -> Result<usize, sqlx::Error> {
    let mut conn = pool.acquire().await?;
    let events = outbox::pending(&mut conn, DRAIN_BATCH).await?;
    let count = events.len();
    for event in events {
        let event_id = event.event_id.clone();
        hub.publish(event).await;
        // Mark after publish; a crash in between re-delivers, which
        // subscribers must tolerate (events carry stable ids).
        outbox::mark_published(&mut conn, &event_id).await?;
    }
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_pool;
    use serde_json::json;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_hub_fanout_is_household_scoped() {
        let hub = EventHub::new();
        let mut rx_h1 = hub.subscribe("h1").await;
        let mut rx_h2 = hub.subscribe("h2").await;

        hub.publish(DomainEvent::new("entity.updated", "h1", json!({})))
            .await;

        let got = rx_h1.recv().await.unwrap();
        assert_eq!(got.event_type, "entity.updated");
        assert!(rx_h2.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_drain_publishes_and_marks() {
        let dir = TempDir::new().unwrap();
        let pool = test_pool(&dir).await;
        let hub = EventHub::new();
        let mut rx = hub.subscribe("h1").await;

        let mut conn = pool.acquire().await.unwrap();
        let event = DomainEvent::new("portion.consumed", "h1", json!({"resourceId": "pm1"}));
        outbox::enqueue(&mut conn, &event).await.unwrap();
        drop(conn);

        assert_eq!(drain_once(&pool, &hub).await.unwrap(), 1);
        let got = rx.recv().await.unwrap();
        assert_eq!(got.event_id, event.event_id);

        // Nothing left to drain.
        assert_eq!(drain_once(&pool, &hub).await.unwrap(), 0);
    }
}
