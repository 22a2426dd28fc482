//! Postgres-backed delivery recorder.
//!
//! `claim_due` leases rows with `FOR UPDATE SKIP LOCKED`, so several sweepers
//! (in one process or many) can run against the same table without ever
//! handing the same row to two of them. A lease only counts as expired once
//! both the caller's clock and the database's `NOW()` have passed it, so a
//! worker whose clock runs fast cannot take over a live lease.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use tracing::{Span, field, instrument};

use streamhook_core::{DeliveryId, EventId, WebhookId};
use streamhook_webhooks::{DeliveryStatus, WebhookDelivery};

use super::{DeliveryRecorder, DeliveryStats, DeliveryStoreError, history_limit};

/// Postgres-backed delivery recorder.
#[derive(Debug, Clone)]
pub struct PostgresDeliveryRecorder {
    pool: PgPool,
}

impl PostgresDeliveryRecorder {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

const DELIVERY_COLUMNS: &str = "id, webhook_id, event_id, status, attempt_count, last_attempt, \
                                next_retry, response, error_message, created_at, updated_at, \
                                locked_until";

#[async_trait]
impl DeliveryRecorder for PostgresDeliveryRecorder {
    #[instrument(
        skip(self, delivery),
        fields(delivery_id = %delivery.id, webhook_id = %delivery.webhook_id, event_id = %delivery.event_id),
        err
    )]
    async fn create(&self, delivery: &WebhookDelivery) -> Result<(), DeliveryStoreError> {
        sqlx::query(
            r#"
            INSERT INTO webhook_deliveries (
                id, webhook_id, event_id, status, attempt_count, last_attempt,
                next_retry, response, error_message, created_at, updated_at, locked_until
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            "#,
        )
        .bind(delivery.id.as_uuid())
        .bind(delivery.webhook_id.as_uuid())
        .bind(delivery.event_id.as_uuid())
        .bind(delivery.status.as_str())
        .bind(delivery.attempt_count as i32)
        .bind(delivery.last_attempt)
        .bind(delivery.next_retry)
        .bind(delivery.response.as_deref())
        .bind(delivery.error_message.as_deref())
        .bind(delivery.created_at)
        .bind(delivery.updated_at)
        .bind(delivery.locked_until)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                DeliveryStoreError::AlreadyExists(delivery.id)
            } else {
                map_sqlx_error("create_delivery", e)
            }
        })?;

        Ok(())
    }

    #[instrument(
        skip(self, delivery),
        fields(delivery_id = %delivery.id, status = %delivery.status, attempt = delivery.attempt_count),
        err
    )]
    async fn save(
        &self,
        delivery: &WebhookDelivery,
        lease: DateTime<Utc>,
    ) -> Result<(), DeliveryStoreError> {
        let result = sqlx::query(
            r#"
            UPDATE webhook_deliveries SET
                status = $2,
                attempt_count = $3,
                last_attempt = $4,
                next_retry = $5,
                response = $6,
                error_message = $7,
                updated_at = $8,
                locked_until = NULL
            WHERE id = $1 AND status = 'pending' AND locked_until = $9
            "#,
        )
        .bind(delivery.id.as_uuid())
        .bind(delivery.status.as_str())
        .bind(delivery.attempt_count as i32)
        .bind(delivery.last_attempt)
        .bind(delivery.next_retry)
        .bind(delivery.response.as_deref())
        .bind(delivery.error_message.as_deref())
        .bind(delivery.updated_at)
        .bind(lease)
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("save_delivery", e))?;

        if result.rows_affected() == 0 {
            let status: Option<String> =
                sqlx::query_scalar("SELECT status FROM webhook_deliveries WHERE id = $1")
                    .bind(delivery.id.as_uuid())
                    .fetch_optional(&self.pool)
                    .await
                    .map_err(|e| map_sqlx_error("save_delivery_status", e))?;
            return Err(match status.as_deref() {
                None => DeliveryStoreError::NotFound(delivery.id),
                Some("pending") => DeliveryStoreError::LeaseLost(delivery.id),
                Some(_) => DeliveryStoreError::NotPending(delivery.id),
            });
        }
        Ok(())
    }

    #[instrument(skip(self), fields(claimed = field::Empty), err)]
    async fn claim_due(
        &self,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<WebhookDelivery>, DeliveryStoreError> {
        let rows = sqlx::query(&format!(
            r#"
            UPDATE webhook_deliveries
            SET locked_until = $2
            WHERE id IN (
                SELECT id
                FROM webhook_deliveries
                WHERE status = 'pending'
                  AND next_retry <= $1
                  AND (locked_until IS NULL OR locked_until <= LEAST($1, NOW()))
                ORDER BY next_retry ASC
                LIMIT $3
                FOR UPDATE SKIP LOCKED
            )
            RETURNING {DELIVERY_COLUMNS}
            "#
        ))
        .bind(now)
        .bind(lease_until)
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("claim_due", e))?;

        let mut claimed = rows
            .iter()
            .map(DeliveryRow::decode)
            .collect::<Result<Vec<_>, _>>()?;
        // RETURNING does not preserve the subquery order.
        claimed.sort_by(|a, b| a.next_retry.cmp(&b.next_retry).then(a.id.cmp(&b.id)));

        Span::current().record("claimed", claimed.len());
        Ok(claimed)
    }

    #[instrument(skip(self), fields(delivery_id = %id), err)]
    async fn get(&self, id: DeliveryId) -> Result<Option<WebhookDelivery>, DeliveryStoreError> {
        let row = sqlx::query(&format!(
            "SELECT {DELIVERY_COLUMNS} FROM webhook_deliveries WHERE id = $1"
        ))
        .bind(id.as_uuid())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("get_delivery", e))?;

        row.as_ref().map(DeliveryRow::decode).transpose()
    }

    #[instrument(skip(self), fields(webhook_id = %webhook_id), err)]
    async fn list_for_webhook(
        &self,
        webhook_id: WebhookId,
        limit: u32,
    ) -> Result<Vec<WebhookDelivery>, DeliveryStoreError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {DELIVERY_COLUMNS}
            FROM webhook_deliveries
            WHERE webhook_id = $1
            ORDER BY created_at DESC, id DESC
            LIMIT $2
            "#
        ))
        .bind(webhook_id.as_uuid())
        .bind(i64::from(history_limit(limit)))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_for_webhook", e))?;

        rows.iter().map(DeliveryRow::decode).collect()
    }

    #[instrument(skip(self), fields(event_id = %event_id), err)]
    async fn list_for_event(
        &self,
        event_id: EventId,
    ) -> Result<Vec<WebhookDelivery>, DeliveryStoreError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {DELIVERY_COLUMNS}
            FROM webhook_deliveries
            WHERE event_id = $1
            ORDER BY created_at ASC, id ASC
            "#
        ))
        .bind(event_id.as_uuid())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_for_event", e))?;

        rows.iter().map(DeliveryRow::decode).collect()
    }

    #[instrument(skip(self), err)]
    async fn stats(
        &self,
        webhook_id: Option<WebhookId>,
    ) -> Result<DeliveryStats, DeliveryStoreError> {
        let row = sqlx::query(
            r#"
            SELECT
                COUNT(*) FILTER (WHERE status = 'success') AS successful,
                COUNT(*) FILTER (WHERE status = 'failed') AS failed,
                COUNT(*) FILTER (WHERE status = 'pending') AS pending
            FROM webhook_deliveries
            WHERE ($1::uuid IS NULL OR webhook_id = $1)
            "#,
        )
        .bind(webhook_id.map(|id| *id.as_uuid()))
        .fetch_one(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("delivery_stats", e))?;

        let count = |column: &str| -> Result<u64, DeliveryStoreError> {
            let value: i64 = row.try_get(column).map_err(decode_error)?;
            Ok(value as u64)
        };
        Ok(DeliveryStats::from_counts(
            count("successful")?,
            count("failed")?,
            count("pending")?,
        ))
    }
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> DeliveryStoreError {
    match err {
        sqlx::Error::Database(db_err) => DeliveryStoreError::Storage(format!(
            "database error in {}: {}",
            operation,
            db_err.message()
        )),
        sqlx::Error::PoolClosed => {
            DeliveryStoreError::Storage(format!("connection pool closed in {operation}"))
        }
        _ => DeliveryStoreError::Storage(format!("sqlx error in {operation}: {err}")),
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    if let sqlx::Error::Database(db_err) = err {
        return db_err.code().as_deref() == Some("23505");
    }
    false
}

fn decode_error(err: sqlx::Error) -> DeliveryStoreError {
    DeliveryStoreError::Storage(format!("failed to decode delivery row: {err}"))
}

// SQLx row types

#[derive(Debug)]
struct DeliveryRow {
    id: uuid::Uuid,
    webhook_id: uuid::Uuid,
    event_id: uuid::Uuid,
    status: String,
    attempt_count: i32,
    last_attempt: Option<DateTime<Utc>>,
    next_retry: Option<DateTime<Utc>>,
    response: Option<String>,
    error_message: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    locked_until: Option<DateTime<Utc>>,
}

impl<'r> sqlx::FromRow<'r, sqlx::postgres::PgRow> for DeliveryRow {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        Ok(DeliveryRow {
            id: row.try_get("id")?,
            webhook_id: row.try_get("webhook_id")?,
            event_id: row.try_get("event_id")?,
            status: row.try_get("status")?,
            attempt_count: row.try_get("attempt_count")?,
            last_attempt: row.try_get("last_attempt")?,
            next_retry: row.try_get("next_retry")?,
            response: row.try_get("response")?,
            error_message: row.try_get("error_message")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
            locked_until: row.try_get("locked_until")?,
        })
    }
}

impl DeliveryRow {
    fn decode(row: &sqlx::postgres::PgRow) -> Result<WebhookDelivery, DeliveryStoreError> {
        use sqlx::FromRow;
        DeliveryRow::from_row(row).map_err(decode_error)?.try_into()
    }
}

impl TryFrom<DeliveryRow> for WebhookDelivery {
    type Error = DeliveryStoreError;

    fn try_from(row: DeliveryRow) -> Result<Self, Self::Error> {
        let status: DeliveryStatus = row
            .status
            .parse()
            .map_err(|e| DeliveryStoreError::Storage(format!("delivery {}: {e}", row.id)))?;
        Ok(WebhookDelivery {
            id: DeliveryId::from_uuid(row.id),
            webhook_id: WebhookId::from_uuid(row.webhook_id),
            event_id: EventId::from_uuid(row.event_id),
            status,
            attempt_count: row.attempt_count.max(0) as u32,
            last_attempt: row.last_attempt,
            next_retry: row.next_retry,
            response: row.response,
            error_message: row.error_message,
            created_at: row.created_at,
            updated_at: row.updated_at,
            locked_until: row.locked_until,
        })
    }
}
