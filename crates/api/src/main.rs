use std::sync::Arc;
use std::time::Duration;

use sqlx::postgres::PgPoolOptions;

use relaykit_api::app::{build_app, AppState};
use relaykit_relay::{BacklogMonitor, CleanupTask, RecoveryTask, RelayConfig};
use relaykit_store::{OutboxStore, PgOutboxStore};

#[tokio::main]
async fn main() {
    relaykit_observability::init();

    let config = RelayConfig::from_env().expect("invalid OUTBOX_* configuration");

    let database_url = std::env::var("DATABASE_URL").expect("DATABASE_URL not set");
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&database_url)
        .await
        .expect("failed to connect to postgres");

    let store: Arc<dyn OutboxStore> = Arc::new(PgOutboxStore::new(pool));

    // Maintenance loops. Dispatch itself runs inside the services that
    // register handlers; this binary carries the shared recovery,
    // retention, and operator surface.
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    let recovery = RecoveryTask::new(
        store.clone(),
        config.table.clone(),
        Duration::from_millis(config.recovery_interval_ms),
    );
    tokio::spawn(recovery.run(shutdown_rx.clone()));

    let cleanup = CleanupTask::new(store.clone(), config.clone());
    tokio::spawn(cleanup.run(shutdown_rx.clone()));

    let monitor = BacklogMonitor::new(
        store.clone(),
        config.table.clone(),
        config.shard_count,
        Duration::from_millis(config.sweep_interval_ms),
    );
    tokio::spawn(monitor.run(shutdown_rx));

    let state = AppState {
        store,
        table: config.table.clone(),
    };
    let app = build_app(state);

    let addr = std::env::var("OUTBOX_HTTP_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_string());
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .unwrap_or_else(|e| panic!("failed to bind {addr}: {e}"));

    tracing::info!(
        addr = %listener.local_addr().unwrap(),
        table = %config.table,
        shard_count = config.shard_count,
        "outbox relay api listening"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await
        .unwrap();

    let _ = shutdown_tx.send(true);
}
