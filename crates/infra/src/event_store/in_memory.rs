use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, RwLock};

use async_trait::async_trait;

use streamhook_core::{Clock, EventId, StreamId, SystemClock};
use streamhook_events::{Event, NewEvent};

use super::query::{EventQueryResult, Pagination, StreamSummary};
use super::r#trait::{EventLog, EventStoreError, validate_new_event};

type Stream = Arc<Mutex<Vec<Event>>>;

/// In-memory append-only event log.
///
/// Intended for tests/dev. The outer lock is only held long enough to find or
/// create a stream; sequence assignment happens under that stream's own mutex,
/// so different streams never contend.
#[derive(Debug)]
pub struct InMemoryEventLog {
    clock: Arc<dyn Clock>,
    streams: RwLock<HashMap<StreamId, Stream>>,
}

impl Default for InMemoryEventLog {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryEventLog {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            streams: RwLock::new(HashMap::new()),
        }
    }

    fn stream(&self, stream_id: &StreamId) -> Result<Stream, EventStoreError> {
        if let Some(stream) = self
            .streams
            .read()
            .map_err(|_| poisoned())?
            .get(stream_id)
        {
            return Ok(stream.clone());
        }

        let mut streams = self.streams.write().map_err(|_| poisoned())?;
        Ok(streams.entry(stream_id.clone()).or_default().clone())
    }

    fn snapshot(&self) -> Result<Vec<(StreamId, Vec<Event>)>, EventStoreError> {
        let streams: Vec<(StreamId, Stream)> = self
            .streams
            .read()
            .map_err(|_| poisoned())?
            .iter()
            .map(|(id, stream)| (id.clone(), stream.clone()))
            .collect();

        streams
            .into_iter()
            .map(|(id, stream)| {
                let events = stream.lock().map_err(|_| poisoned())?.clone();
                Ok((id, events))
            })
            .collect()
    }
}

fn poisoned() -> EventStoreError {
    EventStoreError::Persistence("lock poisoned".to_string())
}

#[async_trait]
impl EventLog for InMemoryEventLog {
    async fn append(&self, event: NewEvent) -> Result<Event, EventStoreError> {
        validate_new_event(&event)?;

        let stream = self.stream(&event.stream_id)?;
        let mut events = stream.lock().map_err(|_| poisoned())?;

        let next = events.last().map_or(0, |e| e.sequence_number) + 1;
        let committed = Event::committed(event, EventId::new(), self.clock.now(), next);
        events.push(committed.clone());

        Ok(committed)
    }

    async fn get(&self, id: EventId) -> Result<Option<Event>, EventStoreError> {
        Ok(self
            .snapshot()?
            .into_iter()
            .flat_map(|(_, events)| events)
            .find(|e| e.id == id))
    }

    async fn query(
        &self,
        event_type: Option<&str>,
        pagination: Pagination,
    ) -> Result<EventQueryResult, EventStoreError> {
        let mut matching: Vec<Event> = self
            .snapshot()?
            .into_iter()
            .flat_map(|(_, events)| events)
            .filter(|e| event_type.is_none_or(|t| e.event_type == t))
            .collect();
        matching.sort_by(|a, b| b.timestamp.cmp(&a.timestamp).then(b.id.cmp(&a.id)));

        let total = matching.len() as u64;
        Ok(EventQueryResult::new(pagination.window(&matching), total, pagination))
    }

    async fn query_by_stream(
        &self,
        stream_id: &StreamId,
        pagination: Pagination,
    ) -> Result<EventQueryResult, EventStoreError> {
        let stream = self
            .streams
            .read()
            .map_err(|_| poisoned())?
            .get(stream_id)
            .cloned();

        let events = match stream {
            Some(stream) => stream.lock().map_err(|_| poisoned())?.clone(),
            None => Vec::new(),
        };

        let total = events.len() as u64;
        Ok(EventQueryResult::new(pagination.window(&events), total, pagination))
    }

    async fn list_streams(&self, limit: u32) -> Result<Vec<StreamSummary>, EventStoreError> {
        let mut summaries: Vec<StreamSummary> = self
            .snapshot()?
            .into_iter()
            .filter_map(|(stream_id, events)| {
                let last = events.last()?;
                Some(StreamSummary {
                    stream_id,
                    event_count: events.len() as u64,
                    last_sequence: last.sequence_number,
                    last_event_at: last.timestamp,
                })
            })
            .collect();
        summaries.sort_by(|a, b| {
            b.last_event_at
                .cmp(&a.last_event_at)
                .then_with(|| a.stream_id.cmp(&b.stream_id))
        });
        summaries.truncate(Pagination::first(limit).limit as usize);
        Ok(summaries)
    }

    async fn count_by_type(&self) -> Result<BTreeMap<String, u64>, EventStoreError> {
        let mut counts = BTreeMap::new();
        for (_, events) in self.snapshot()? {
            for event in events {
                *counts.entry(event.event_type).or_insert(0) += 1;
            }
        }
        Ok(counts)
    }
}
