//! `streamhook-core`: identifiers, errors and time shared by every crate.
//!
//! This crate contains **pure** primitives (no IO).

pub mod error;
pub mod id;
pub mod time;

pub use error::{DomainError, DomainResult};
pub use id::{DeliveryId, EventId, StreamId, WebhookId};
pub use time::{Clock, ManualClock, SystemClock};
