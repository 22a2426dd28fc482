//! Postgres-backed webhook registry.
//!
//! Subscribed event types are stored as a `TEXT[]` column so matching is a
//! single indexed query: `enabled AND $1 = ANY(event_types)`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use tracing::instrument;

use streamhook_core::WebhookId;
use streamhook_webhooks::WebhookEndpoint;

use super::{RegistryError, SubscriptionIndex, WebhookRegistry, prepare};

/// Postgres-backed webhook registry.
#[derive(Debug, Clone)]
pub struct PostgresWebhookRegistry {
    pool: PgPool,
}

impl PostgresWebhookRegistry {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

const ENDPOINT_COLUMNS: &str = "id, name, url, secret, event_types, enabled, max_retries, \
                                timeout_seconds, created_at, updated_at";

#[async_trait]
impl SubscriptionIndex for PostgresWebhookRegistry {
    #[instrument(skip(self), err)]
    async fn matching(&self, event_type: &str) -> Result<Vec<WebhookEndpoint>, RegistryError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {ENDPOINT_COLUMNS}
            FROM webhook_endpoints
            WHERE enabled AND $1 = ANY(event_types)
            ORDER BY name ASC, id ASC
            "#
        ))
        .bind(event_type)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("matching", e))?;

        rows.iter().map(EndpointRow::decode).collect()
    }

    #[instrument(skip(self), fields(webhook_id = %id), err)]
    async fn get(&self, id: WebhookId) -> Result<Option<WebhookEndpoint>, RegistryError> {
        let row = sqlx::query(&format!(
            "SELECT {ENDPOINT_COLUMNS} FROM webhook_endpoints WHERE id = $1"
        ))
        .bind(id.as_uuid())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("get_webhook", e))?;

        row.as_ref().map(EndpointRow::decode).transpose()
    }
}

#[async_trait]
impl WebhookRegistry for PostgresWebhookRegistry {
    #[instrument(skip(self, endpoint), fields(webhook_id = %endpoint.id, name = %endpoint.name), err)]
    async fn register(&self, endpoint: WebhookEndpoint) -> Result<WebhookEndpoint, RegistryError> {
        let endpoint = prepare(endpoint)?;
        let event_types: Vec<&str> = endpoint.event_types.iter().map(String::as_str).collect();

        sqlx::query(
            r#"
            INSERT INTO webhook_endpoints (
                id, name, url, secret, event_types, enabled,
                max_retries, timeout_seconds, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(endpoint.id.as_uuid())
        .bind(&endpoint.name)
        .bind(&endpoint.url)
        .bind(endpoint.secret.as_deref())
        .bind(&event_types)
        .bind(endpoint.enabled)
        .bind(endpoint.max_retries)
        .bind(endpoint.timeout_seconds)
        .bind(endpoint.created_at)
        .bind(endpoint.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                RegistryError::AlreadyExists(endpoint.id)
            } else {
                map_sqlx_error("register_webhook", e)
            }
        })?;

        Ok(endpoint)
    }

    #[instrument(skip(self, endpoint), fields(webhook_id = %endpoint.id), err)]
    async fn update(&self, endpoint: WebhookEndpoint) -> Result<WebhookEndpoint, RegistryError> {
        let endpoint = prepare(endpoint)?;
        let event_types: Vec<&str> = endpoint.event_types.iter().map(String::as_str).collect();

        let row = sqlx::query(&format!(
            r#"
            UPDATE webhook_endpoints SET
                name = $2,
                url = $3,
                secret = $4,
                event_types = $5,
                enabled = $6,
                max_retries = $7,
                timeout_seconds = $8,
                updated_at = NOW()
            WHERE id = $1
            RETURNING {ENDPOINT_COLUMNS}
            "#
        ))
        .bind(endpoint.id.as_uuid())
        .bind(&endpoint.name)
        .bind(&endpoint.url)
        .bind(endpoint.secret.as_deref())
        .bind(&event_types)
        .bind(endpoint.enabled)
        .bind(endpoint.max_retries)
        .bind(endpoint.timeout_seconds)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("update_webhook", e))?;

        match row {
            Some(row) => EndpointRow::decode(&row),
            None => Err(RegistryError::NotFound(endpoint.id)),
        }
    }

    #[instrument(skip(self), fields(webhook_id = %id), err)]
    async fn set_enabled(
        &self,
        id: WebhookId,
        enabled: bool,
    ) -> Result<WebhookEndpoint, RegistryError> {
        let row = sqlx::query(&format!(
            r#"
            UPDATE webhook_endpoints SET enabled = $2, updated_at = NOW()
            WHERE id = $1
            RETURNING {ENDPOINT_COLUMNS}
            "#
        ))
        .bind(id.as_uuid())
        .bind(enabled)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("set_enabled", e))?;

        match row {
            Some(row) => EndpointRow::decode(&row),
            None => Err(RegistryError::NotFound(id)),
        }
    }

    #[instrument(skip(self), fields(webhook_id = %id), err)]
    async fn remove(&self, id: WebhookId) -> Result<(), RegistryError> {
        let result = sqlx::query("DELETE FROM webhook_endpoints WHERE id = $1")
            .bind(id.as_uuid())
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("remove_webhook", e))?;

        if result.rows_affected() == 0 {
            return Err(RegistryError::NotFound(id));
        }
        Ok(())
    }

    #[instrument(skip(self), err)]
    async fn list(&self) -> Result<Vec<WebhookEndpoint>, RegistryError> {
        let rows = sqlx::query(&format!(
            "SELECT {ENDPOINT_COLUMNS} FROM webhook_endpoints ORDER BY name ASC, id ASC"
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_webhooks", e))?;

        rows.iter().map(EndpointRow::decode).collect()
    }
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> RegistryError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code().as_deref() {
                // Check constraint violation
                Some("23514") => RegistryError::Configuration(msg),
                _ => RegistryError::Storage(msg),
            }
        }
        _ => RegistryError::Storage(format!("sqlx error in {operation}: {err}")),
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    if let sqlx::Error::Database(db_err) = err {
        return db_err.code().as_deref() == Some("23505");
    }
    false
}

// SQLx row types

#[derive(Debug)]
struct EndpointRow {
    id: uuid::Uuid,
    name: String,
    url: String,
    secret: Option<String>,
    event_types: Vec<String>,
    enabled: bool,
    max_retries: i32,
    timeout_seconds: i32,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl<'r> sqlx::FromRow<'r, sqlx::postgres::PgRow> for EndpointRow {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        Ok(EndpointRow {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            url: row.try_get("url")?,
            secret: row.try_get("secret")?,
            event_types: row.try_get("event_types")?,
            enabled: row.try_get("enabled")?,
            max_retries: row.try_get("max_retries")?,
            timeout_seconds: row.try_get("timeout_seconds")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

impl EndpointRow {
    fn decode(row: &sqlx::postgres::PgRow) -> Result<WebhookEndpoint, RegistryError> {
        use sqlx::FromRow;
        EndpointRow::from_row(row)
            .map(Into::into)
            .map_err(|e| RegistryError::Storage(format!("failed to decode webhook row: {e}")))
    }
}

impl From<EndpointRow> for WebhookEndpoint {
    fn from(row: EndpointRow) -> Self {
        WebhookEndpoint {
            id: WebhookId::from_uuid(row.id),
            name: row.name,
            url: row.url,
            secret: row.secret,
            event_types: row.event_types.into_iter().collect(),
            enabled: row.enabled,
            max_retries: row.max_retries,
            timeout_seconds: row.timeout_seconds,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}
