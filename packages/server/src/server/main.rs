// Main entry point for the larvae monitoring stream server

use std::sync::Arc;

use anyhow::{Context, Result};
use monitor_core::kernel::{
    clients::ClientRegistry, ingest::IngestBridge, reaper, storage::MeasurementStore,
    storage::PgMeasurementStore,
};
use monitor_core::{server::build_app, Config};
use sqlx::postgres::PgPoolOptions;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,monitor_core=debug,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting Larvae Monitoring Stream Server");

    // Load configuration
    let config = Config::from_env().context("Failed to load configuration")?;
    tracing::info!("Configuration loaded");

    // Connect to database
    tracing::info!("Connecting to database...");
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&config.database_url)
        .await
        .context("Failed to connect to database")?;
    tracing::info!("Database connected");

    // Run migrations
    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .context("Failed to run migrations")?;
    tracing::info!("Migrations complete");

    // Shared stream client registry
    let registry = Arc::new(ClientRegistry::new(
        config.max_clients,
        config.max_queue_size,
    ));
    let store: Arc<dyn MeasurementStore> = Arc::new(PgMeasurementStore::new(pool.clone()));

    // Broker bridge: decode, persist, broadcast; reconnects forever
    let bridge = IngestBridge::new(
        store.clone(),
        registry.clone(),
        config.broker_url.clone(),
        config.broker_topic.clone(),
        config.reconnect_backoff,
    );
    tokio::spawn(bridge.run());

    // Idle client reaper (handle must stay alive)
    let _scheduler = reaper::start_reaper(
        registry.clone(),
        config.cleanup_interval,
        config.client_max_age,
    )
    .await
    .context("Failed to start idle client reaper")?;

    // Build application
    let app = build_app(pool, registry, store, config.heartbeat_interval);

    // Start server
    let addr = format!("0.0.0.0:{}", config.port);
    tracing::info!("Starting server on {}", addr);
    tracing::info!("Stream endpoint: http://localhost:{}/stream", config.port);
    tracing::info!("Health check: http://localhost:{}/health", config.port);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("Failed to bind to address")?;

    axum::serve(listener, app).await.context("Server error")?;

    Ok(())
}
