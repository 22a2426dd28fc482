//! Postgres-backed event log.
//!
//! ## Sequence assignment
//!
//! Each stream has a row in `event_streams` holding its last sequence number.
//! `append` bumps that row with an upsert and inserts the event in the same
//! transaction:
//!
//! ```sql
//! INSERT INTO event_streams (stream_id, last_sequence, last_event_at) VALUES ($1, 1, $2)
//! ON CONFLICT (stream_id) DO UPDATE SET last_sequence = event_streams.last_sequence + 1, ...
//! RETURNING last_sequence
//! ```
//!
//! The upsert takes a row lock that is held until commit, so concurrent appends
//! to the same stream queue up behind each other while other streams proceed.
//! If the event insert fails the whole transaction rolls back, counter
//! included, so no sequence number is lost.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | EventStoreError |
//! |------------|----------------------|-----------------|
//! | Database (check constraint violation) | `23514` | `InvalidAppend` |
//! | Database (invalid text / json) | `22P02` | `InvalidAppend` |
//! | Database (other) | Any other | `Persistence` |
//! | PoolClosed, Io, Tls, ... | N/A | `Persistence` |

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SubsecRound, Utc};
use sqlx::types::Json;
use sqlx::{PgPool, Row};
use tracing::{Span, field, instrument};

use streamhook_core::{Clock, EventId, StreamId, SystemClock};
use streamhook_events::{Event, NewEvent, Payload};

use super::query::{EventQueryResult, Pagination, StreamSummary};
use super::r#trait::{EventLog, EventStoreError, validate_new_event};

/// Postgres-backed append-only event log.
#[derive(Debug, Clone)]
pub struct PostgresEventLog {
    pool: PgPool,
    clock: Arc<dyn Clock>,
}

impl PostgresEventLog {
    pub fn new(pool: PgPool) -> Self {
        Self::with_clock(pool, Arc::new(SystemClock))
    }

    pub fn with_clock(pool: PgPool, clock: Arc<dyn Clock>) -> Self {
        Self { pool, clock }
    }
}

const EVENT_COLUMNS: &str =
    "id, event_type, stream_id, source, data, timestamp, sequence_number";

#[async_trait]
impl EventLog for PostgresEventLog {
    #[instrument(
        skip(self, event),
        fields(
            stream_id = %event.stream_id,
            event_type = %event.event_type,
            sequence_number = field::Empty
        ),
        err
    )]
    async fn append(&self, event: NewEvent) -> Result<Event, EventStoreError> {
        validate_new_event(&event)?;

        let id = EventId::new();
        // timestamptz keeps microseconds; return what a read will return.
        let timestamp = self.clock.now().trunc_subsecs(6);

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        let sequence: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO event_streams (stream_id, last_sequence, last_event_at)
            VALUES ($1, 1, $2)
            ON CONFLICT (stream_id) DO UPDATE SET
                last_sequence = event_streams.last_sequence + 1,
                last_event_at = EXCLUDED.last_event_at
            RETURNING last_sequence
            "#,
        )
        .bind(event.stream_id.as_str())
        .bind(timestamp)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("next_sequence", e))?;

        sqlx::query(
            r#"
            INSERT INTO events (
                id,
                event_type,
                stream_id,
                source,
                data,
                timestamp,
                sequence_number
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(id.as_uuid())
        .bind(&event.event_type)
        .bind(event.stream_id.as_str())
        .bind(&event.source)
        .bind(Json(&event.data))
        .bind(timestamp)
        .bind(sequence)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("insert_event", e))?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;

        Span::current().record("sequence_number", sequence);
        Ok(Event::committed(event, id, timestamp, sequence as u64))
    }

    #[instrument(skip(self), fields(event_id = %id), err)]
    async fn get(&self, id: EventId) -> Result<Option<Event>, EventStoreError> {
        let row = sqlx::query(&format!("SELECT {EVENT_COLUMNS} FROM events WHERE id = $1"))
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("get_event", e))?;

        row.map(|row| EventRow::decode(&row)).transpose()
    }

    #[instrument(skip(self), err)]
    async fn query(
        &self,
        event_type: Option<&str>,
        pagination: Pagination,
    ) -> Result<EventQueryResult, EventStoreError> {
        let total: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM events WHERE ($1::text IS NULL OR event_type = $1)",
        )
        .bind(event_type)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("count_events", e))?;

        let rows = sqlx::query(&format!(
            r#"
            SELECT {EVENT_COLUMNS}
            FROM events
            WHERE ($1::text IS NULL OR event_type = $1)
            ORDER BY timestamp DESC, id DESC
            LIMIT $2 OFFSET $3
            "#
        ))
        .bind(event_type)
        .bind(i64::from(pagination.limit))
        .bind(i64::from(pagination.offset))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("query_events", e))?;

        let events = rows
            .iter()
            .map(EventRow::decode)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(EventQueryResult::new(events, total as u64, pagination))
    }

    #[instrument(skip(self), fields(stream_id = %stream_id), err)]
    async fn query_by_stream(
        &self,
        stream_id: &StreamId,
        pagination: Pagination,
    ) -> Result<EventQueryResult, EventStoreError> {
        // Sequences are dense, so the counter row doubles as the event count.
        let total: Option<i64> =
            sqlx::query_scalar("SELECT last_sequence FROM event_streams WHERE stream_id = $1")
                .bind(stream_id.as_str())
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| map_sqlx_error("count_stream", e))?;

        let rows = sqlx::query(&format!(
            r#"
            SELECT {EVENT_COLUMNS}
            FROM events
            WHERE stream_id = $1
            ORDER BY sequence_number ASC
            LIMIT $2 OFFSET $3
            "#
        ))
        .bind(stream_id.as_str())
        .bind(i64::from(pagination.limit))
        .bind(i64::from(pagination.offset))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("query_stream", e))?;

        let events = rows
            .iter()
            .map(EventRow::decode)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(EventQueryResult::new(
            events,
            total.unwrap_or(0) as u64,
            pagination,
        ))
    }

    #[instrument(skip(self), err)]
    async fn list_streams(&self, limit: u32) -> Result<Vec<StreamSummary>, EventStoreError> {
        let limit = Pagination::first(limit).limit;
        let rows = sqlx::query(
            r#"
            SELECT stream_id, last_sequence, last_event_at
            FROM event_streams
            ORDER BY last_event_at DESC, stream_id ASC
            LIMIT $1
            "#,
        )
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_streams", e))?;

        rows.iter()
            .map(|row| {
                let stream_id: String = row.try_get("stream_id").map_err(decode_error)?;
                let last_sequence: i64 = row.try_get("last_sequence").map_err(decode_error)?;
                let last_event_at: DateTime<Utc> =
                    row.try_get("last_event_at").map_err(decode_error)?;
                Ok(StreamSummary {
                    stream_id: StreamId::new(stream_id)
                        .map_err(|e| EventStoreError::Persistence(e.to_string()))?,
                    event_count: last_sequence as u64,
                    last_sequence: last_sequence as u64,
                    last_event_at,
                })
            })
            .collect()
    }

    #[instrument(skip(self), err)]
    async fn count_by_type(&self) -> Result<BTreeMap<String, u64>, EventStoreError> {
        let rows = sqlx::query(
            "SELECT event_type, COUNT(*) AS count FROM events GROUP BY event_type",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("count_by_type", e))?;

        rows.iter()
            .map(|row| {
                let event_type: String = row.try_get("event_type").map_err(decode_error)?;
                let count: i64 = row.try_get("count").map_err(decode_error)?;
                Ok((event_type, count as u64))
            })
            .collect()
    }
}

/// Map SQLx errors to EventStoreError.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> EventStoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code().as_deref() {
                // Check constraint violation / invalid text representation
                Some("23514") | Some("22P02") => EventStoreError::InvalidAppend(msg),
                _ => EventStoreError::Persistence(msg),
            }
        }
        sqlx::Error::PoolClosed => {
            EventStoreError::Persistence(format!("connection pool closed in {operation}"))
        }
        _ => EventStoreError::Persistence(format!("sqlx error in {operation}: {err}")),
    }
}

fn decode_error(err: sqlx::Error) -> EventStoreError {
    EventStoreError::Persistence(format!("failed to decode event row: {err}"))
}

// SQLx row types

#[derive(Debug)]
struct EventRow {
    id: uuid::Uuid,
    event_type: String,
    stream_id: String,
    source: String,
    data: Json<Payload>,
    timestamp: DateTime<Utc>,
    sequence_number: i64,
}

impl<'r> sqlx::FromRow<'r, sqlx::postgres::PgRow> for EventRow {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        Ok(EventRow {
            id: row.try_get("id")?,
            event_type: row.try_get("event_type")?,
            stream_id: row.try_get("stream_id")?,
            source: row.try_get("source")?,
            data: row.try_get("data")?,
            timestamp: row.try_get("timestamp")?,
            sequence_number: row.try_get("sequence_number")?,
        })
    }
}

impl EventRow {
    fn decode(row: &sqlx::postgres::PgRow) -> Result<Event, EventStoreError> {
        use sqlx::FromRow;
        let row = EventRow::from_row(row).map_err(decode_error)?;
        row.try_into()
    }
}

impl TryFrom<EventRow> for Event {
    type Error = EventStoreError;

    fn try_from(row: EventRow) -> Result<Self, Self::Error> {
        Ok(Event {
            id: EventId::from_uuid(row.id),
            event_type: row.event_type,
            stream_id: StreamId::new(row.stream_id)
                .map_err(|e| EventStoreError::Persistence(e.to_string()))?,
            source: row.source,
            data: row.data.0,
            timestamp: row.timestamp,
            sequence_number: row.sequence_number as u64,
        })
    }
}
