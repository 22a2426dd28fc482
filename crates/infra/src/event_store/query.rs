//! Read-side types for event queries.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use streamhook_core::StreamId;
use streamhook_events::Event;

/// Default page size.
pub const DEFAULT_LIMIT: u32 = 50;
/// Hard cap on any page size.
pub const MAX_LIMIT: u32 = 1000;

/// Pagination parameters for event queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pagination {
    /// Maximum number of events to return.
    pub limit: u32,
    /// Offset for pagination (0-based).
    pub offset: u32,
}

impl Default for Pagination {
    fn default() -> Self {
        Self {
            limit: DEFAULT_LIMIT,
            offset: 0,
        }
    }
}

impl Pagination {
    /// Missing limits default to 50; limits are clamped to `1..=1000`.
    pub fn new(limit: Option<u32>, offset: Option<u32>) -> Self {
        Self {
            limit: limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT),
            offset: offset.unwrap_or(0),
        }
    }

    /// First page of `limit` items.
    pub fn first(limit: u32) -> Self {
        Self::new(Some(limit), None)
    }

    pub(crate) fn window<T: Clone>(&self, items: &[T]) -> Vec<T> {
        items
            .iter()
            .skip(self.offset as usize)
            .take(self.limit as usize)
            .cloned()
            .collect()
    }
}

/// Paginated event query result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventQueryResult {
    /// The events on this page.
    pub events: Vec<Event>,
    /// Total number of events matching the query (across all pages).
    pub total: u64,
    /// Pagination parameters used.
    pub pagination: Pagination,
    /// Whether there are more events after this page.
    pub has_more: bool,
}

impl EventQueryResult {
    pub fn new(events: Vec<Event>, total: u64, pagination: Pagination) -> Self {
        let seen = u64::from(pagination.offset) + events.len() as u64;
        Self {
            events,
            total,
            pagination,
            has_more: seen < total,
        }
    }
}

/// One stream as seen by `list_streams`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamSummary {
    pub stream_id: StreamId,
    /// Number of events; equal to the last sequence number since sequences are dense.
    pub event_count: u64,
    pub last_sequence: u64,
    pub last_event_at: DateTime<Utc>,
}
