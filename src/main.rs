//! MealSync Server
//!
//! Offline-first sync server for household meal planning data:
//! versioned entities, an append-only portion ledger, a pullable
//! change feed, and conflict resolution per entity class.
//!
//! # Configuration
//!
//! Environment variables:
//! - `MEALSYNC_PORT`: Port to listen on (default: 8080)
//! - `MEALSYNC_DB`: SQLite database path (default: ~/.local/share/mealsync/sync.db)
//! - `MEALSYNC_CONFIG`: Path to API key file (default: ~/.config/mealsync/config.yaml)

mod config;
mod db;
mod events;
mod server;
mod sync;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::{ApiKeyStore, Config};
use crate::events::EventHub;
use crate::server::AppState;
use crate::sync::SyncCoordinator;

/// Feed records retained past the newest one before compaction.
const FEED_KEEP_LATEST: i64 = 10_000;

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "mealsync=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env();
    tracing::info!("Database: {}", config.db_path.display());
    tracing::info!("Config file: {}", config.config_path.display());

    let pool = match db::init_db(config.db_path.clone()).await {
        Ok(pool) => pool,
        Err(e) => {
            tracing::error!("Failed to initialize database: {}", e);
            std::process::exit(1);
        }
    };

    let api_keys = Arc::new(ApiKeyStore::load(&config.config_path));
    let coordinator = Arc::new(SyncCoordinator::new(pool.clone()));
    let hub = Arc::new(EventHub::new());

    tokio::spawn(events::run_outbox_publisher(pool.clone(), hub));
    tokio::spawn(run_maintenance(coordinator.clone()));

    let state = AppState {
        api_keys,
        coordinator,
    };

    let app = server::router(state).layer(TraceLayer::new_for_http());

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    tracing::info!("Starting server on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await.unwrap();
    axum::serve(listener, app).await.unwrap();
}

/// Hourly maintenance: expire past-use-by portions and compact old
/// feed history.
async fn run_maintenance(coordinator: Arc<SyncCoordinator>) {
    let mut ticker = tokio::time::interval(Duration::from_secs(3600));
    loop {
        ticker.tick().await;
        let today = chrono::Utc::now().date_naive();
        match coordinator.sweep_expired(today).await {
            Ok(0) => {}
            Ok(n) => tracing::info!("expired portions for {} resource(s)", n),
            Err(e) => tracing::warn!("expiry sweep failed: {}", e),
        }
        match coordinator.compact_feed(FEED_KEEP_LATEST).await {
            Ok(0) => {}
            Ok(n) => tracing::info!("compacted {} feed record(s)", n),
            Err(e) => tracing::warn!("feed compaction failed: {}", e),
        }
    }
}
