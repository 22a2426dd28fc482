//! Database schema bootstrap.

use sqlx::PgPool;
use tracing::info;

/// Idempotent DDL for every table the Postgres backends use.
pub const SCHEMA: &str = include_str!("../migrations/0001_streamhook.sql");

/// Create any missing tables and indexes.
pub async fn apply(pool: &PgPool) -> Result<(), sqlx::Error> {
    sqlx::raw_sql(SCHEMA).execute(pool).await?;
    info!("database schema applied");
    Ok(())
}
