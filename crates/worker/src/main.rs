mod http;
mod pg_events;
mod settings;
mod telemetry;

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use sqlx::migrate::Migrator;
use sqlx::postgres::PgPoolOptions;

use automation_engine::{
    EngineConfig, PostgresEngineStore, VersionDefinitionStore, WorkerPool, WorkerPoolConfig,
    WorkflowEngine,
};

use crate::http::{HttpActionDispatcher, HttpContactStore, ServiceClient};
use crate::pg_events::PgEventBus;
use crate::settings::WorkerSettings;

#[tokio::main]
async fn main() -> Result<()> {
    // A missing .env file is fine; the environment may already be set
    let _ = dotenvy::dotenv();

    telemetry::init(&telemetry::log_filter());
    tracing::info!("automation-worker starting...");

    let settings = WorkerSettings::from_env();
    let mut config = EngineConfig::from_env();
    if let Some(worker_id) = &settings.worker_id {
        config = config.with_worker_id(worker_id.clone());
    }

    let pool = PgPoolOptions::new()
        .max_connections(settings.max_db_connections)
        .connect(&settings.database_url)
        .await
        .context("Failed to connect to PostgreSQL")?;

    Migrator::new(Path::new(&settings.migrations_dir))
        .await
        .with_context(|| format!("Failed to load migrations from {}", settings.migrations_dir))?
        .run(&pool)
        .await
        .context("Failed to apply migrations")?;
    tracing::info!("Database migrations applied");

    let store = Arc::new(PostgresEngineStore::new(pool.clone()));
    let definitions = Arc::new(VersionDefinitionStore::new(store.clone()));
    let dispatcher = Arc::new(HttpActionDispatcher::new(ServiceClient::new(
        &settings.action_service_url,
        settings.http_timeout,
    )?));
    let contacts = Arc::new(HttpContactStore::new(ServiceClient::new(
        &settings.contact_service_url,
        settings.http_timeout,
    )?));
    let events = Arc::new(PgEventBus::new(pool, settings.event_channel.clone()));

    let pool_config = WorkerPoolConfig::new()
        .with_max_concurrency(settings.worker_concurrency)
        .with_queue_capacity(settings.queue_capacity)
        .with_scheduler(&config.scheduler);

    tracing::info!(
        worker_id = %config.worker_id,
        max_concurrency = settings.worker_concurrency,
        event_channel = %settings.event_channel,
        action_service = %settings.action_service_url,
        contact_service = %settings.contact_service_url,
        "Starting worker pool"
    );

    let engine = Arc::new(WorkflowEngine::new(
        store,
        definitions,
        contacts,
        dispatcher,
        config,
    ));
    let workers = WorkerPool::new(engine, pool_config).with_event_bus(events);
    workers.start().await.context("Failed to start worker pool")?;

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    tracing::info!("Received shutdown signal");

    if let Err(e) = workers.shutdown().await {
        tracing::error!(error = %e, "Worker pool did not drain cleanly");
        return Err(e.into());
    }

    tracing::info!("Worker shutdown complete");
    Ok(())
}
