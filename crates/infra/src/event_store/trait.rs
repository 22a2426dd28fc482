use std::collections::BTreeMap;

use async_trait::async_trait;
use thiserror::Error;

use streamhook_core::{EventId, StreamId};
use streamhook_events::{Event, NewEvent};

use super::query::{EventQueryResult, Pagination, StreamSummary};

/// Event log operation error.
///
/// Both variants are surfaced to the caller of `append`. A failed append never
/// consumes a sequence number.
#[derive(Debug, Error)]
pub enum EventStoreError {
    /// The event was rejected before touching storage (blank type, bad data).
    #[error("invalid append: {0}")]
    InvalidAppend(String),

    /// Storage was unreachable or refused the write/read.
    #[error("persistence failure: {0}")]
    Persistence(String),
}

/// Durable, append-only store of events grouped into streams.
///
/// ## Sequence numbers
///
/// `append` assigns `1 + (last sequence of the stream)`, or 1 for a new stream.
/// The read-then-write is atomic per stream, so N concurrent appends to one
/// stream yield exactly `{1..=N}`. Appends to different streams never wait on
/// each other.
///
/// ## Reads
///
/// Query methods only ever observe fully committed appends.
#[async_trait]
pub trait EventLog: Send + Sync {
    /// Persist `event` as the next event of its stream.
    async fn append(&self, event: NewEvent) -> Result<Event, EventStoreError>;

    async fn get(&self, id: EventId) -> Result<Option<Event>, EventStoreError>;

    /// Events across all streams, newest first, optionally of one type.
    async fn query(
        &self,
        event_type: Option<&str>,
        pagination: Pagination,
    ) -> Result<EventQueryResult, EventStoreError>;

    /// Events of one stream in sequence order.
    async fn query_by_stream(
        &self,
        stream_id: &StreamId,
        pagination: Pagination,
    ) -> Result<EventQueryResult, EventStoreError>;

    /// Streams, most recently appended to first.
    async fn list_streams(&self, limit: u32) -> Result<Vec<StreamSummary>, EventStoreError>;

    /// Number of stored events per event type.
    async fn count_by_type(&self) -> Result<BTreeMap<String, u64>, EventStoreError>;
}

pub(crate) fn validate_new_event(event: &NewEvent) -> Result<(), EventStoreError> {
    if event.event_type.trim().is_empty() {
        return Err(EventStoreError::InvalidAppend(
            "event type must not be blank".to_string(),
        ));
    }
    Ok(())
}
