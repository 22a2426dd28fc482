//! Append-only event log.
//!
//! Two backends share the [`EventLog`] contract: [`InMemoryEventLog`] for tests
//! and single-process use, and [`PostgresEventLog`] for durable deployments.

pub mod in_memory;
pub mod postgres;
pub mod query;
pub mod r#trait;

pub use in_memory::InMemoryEventLog;
pub use postgres::PostgresEventLog;
pub use query::{EventQueryResult, Pagination, StreamSummary};
pub use r#trait::{EventLog, EventStoreError};
