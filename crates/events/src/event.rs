use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use streamhook_core::{EventId, StreamId};

/// JSON object carried by an event.
pub type Payload = serde_json::Map<String, serde_json::Value>;

/// An event that has not been appended yet (no id, timestamp or sequence number).
///
/// The event log turns this into an [`Event`] during append. Keeping the two
/// types apart means a caller can never pick its own sequence number.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewEvent {
    pub stream_id: StreamId,
    pub event_type: String,
    pub source: String,
    pub data: Payload,
}

impl NewEvent {
    pub fn new(
        stream_id: StreamId,
        event_type: impl Into<String>,
        source: impl Into<String>,
        data: Payload,
    ) -> Self {
        Self {
            stream_id,
            event_type: event_type.into(),
            source: source.into(),
            data,
        }
    }
}

/// A persisted event.
///
/// Immutable once created. Within one stream, `sequence_number`s are dense and
/// start at 1, strictly increasing in append order. No ordering holds across
/// streams.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: EventId,
    #[serde(rename = "type")]
    pub event_type: String,
    pub stream_id: StreamId,
    pub source: String,
    pub data: Payload,
    pub timestamp: DateTime<Utc>,
    pub sequence_number: u64,
}

impl Event {
    /// Assemble an event from a pending one plus the values the log assigns.
    pub fn committed(
        new: NewEvent,
        id: EventId,
        timestamp: DateTime<Utc>,
        sequence_number: u64,
    ) -> Self {
        Self {
            id,
            event_type: new.event_type,
            stream_id: new.stream_id,
            source: new.source,
            data: new.data,
            timestamp,
            sequence_number,
        }
    }
}
