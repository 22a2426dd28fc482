//! Events and the in-process event bus.

pub mod bus;
pub mod event;

pub use bus::{DispatchReport, Dispatched, EventBus, EventHandler, HandlerOutcome};
pub use event::{Event, NewEvent, Payload};
