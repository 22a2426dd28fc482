//! Retry sweeper process.
//!
//! Connects to Postgres, makes sure the schema exists and re-attempts due
//! webhook deliveries every `SWEEP_INTERVAL_SECS` until Ctrl-C. Several
//! workers may run against one database; leases keep them from attempting
//! the same delivery.

use std::sync::Arc;

use anyhow::Context;
use sqlx::postgres::PgPoolOptions;

use streamhook_core::SystemClock;
use streamhook_infra::deliveries::PostgresDeliveryRecorder;
use streamhook_infra::event_store::PostgresEventLog;
use streamhook_infra::subscriptions::PostgresWebhookRegistry;
use streamhook_infra::{Config, DeliveryEngine, RetrySweeper, schema};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::from_env().context("failed to load configuration")?;
    streamhook_observability::init_with(config.log_format, &config.log_level);

    let database_url = config.require_database_url()?;
    let pool = PgPoolOptions::new()
        .max_connections(config.db_max_conns)
        .connect(database_url)
        .await
        .context("failed to connect to Postgres")?;
    schema::apply(&pool)
        .await
        .context("failed to apply database schema")?;

    let clock = Arc::new(SystemClock);
    let recorder = Arc::new(PostgresDeliveryRecorder::new(pool.clone()));
    let engine = Arc::new(
        DeliveryEngine::new(recorder.clone(), clock.clone(), config.engine_config())
            .context("failed to build delivery engine")?,
    );
    let sweeper = Arc::new(RetrySweeper::new(
        recorder,
        Arc::new(PostgresEventLog::new(pool.clone())),
        Arc::new(PostgresWebhookRegistry::new(pool.clone())),
        engine,
        clock,
        config.sweeper_config(),
    ));

    let handle = sweeper.spawn();
    tracing::info!("streamhook worker running; press Ctrl-C to stop");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    tracing::info!("shutdown requested, waiting for in-flight sweep");

    handle.shutdown().await;
    pool.close().await;
    Ok(())
}
