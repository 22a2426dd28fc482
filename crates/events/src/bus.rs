//! In-process event bus.
//!
//! Local handlers register for an event type and are invoked for every published
//! event of that type. This is a side channel next to webhook delivery:
//!
//! ```text
//! append → EventLog ──┬─→ EventBus → local handlers
//!                     └─→ SubscriptionIndex → DeliveryEngine → webhooks
//! ```
//!
//! ## Isolation
//!
//! Each handler runs on its own task. A handler that returns an error or panics
//! is logged and counted; it never affects other handlers, the append that
//! produced the event, or webhook delivery.
//!
//! ## Completion
//!
//! [`EventBus::publish`] returns a [`Dispatched`] handle. Dropping it detaches
//! the handlers (they still run to completion). Awaiting [`Dispatched::wait`]
//! blocks until every handler has finished, which is what tests use instead of
//! sleeping.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tracing::{debug, error};

use streamhook_core::EventId;

use crate::event::Event;

/// A local consumer of published events.
///
/// Implemented for any `Fn(Event) -> impl Future<Output = anyhow::Result<()>>`,
/// so plain async closures can be subscribed directly.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: Event) -> anyhow::Result<()>;
}

#[async_trait]
impl<F, Fut> EventHandler for F
where
    F: Fn(Event) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn handle(&self, event: Event) -> anyhow::Result<()> {
        (self)(event).await
    }
}

/// How a single handler invocation ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerOutcome {
    Completed,
    Failed,
    Panicked,
}

/// Summary of one publish, available once every handler has finished.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub completed: usize,
    pub failed: usize,
    pub panicked: usize,
}

impl DispatchReport {
    pub fn total(&self) -> usize {
        self.completed + self.failed + self.panicked
    }
}

/// Handle to the handler tasks spawned by one publish.
#[derive(Debug)]
pub struct Dispatched {
    event_id: EventId,
    tasks: Vec<JoinHandle<HandlerOutcome>>,
}

impl Dispatched {
    pub fn event_id(&self) -> EventId {
        self.event_id
    }

    /// Number of handlers the event was handed to.
    pub fn handler_count(&self) -> usize {
        self.tasks.len()
    }

    /// Wait for every handler to finish.
    pub async fn wait(self) -> DispatchReport {
        let mut report = DispatchReport::default();
        for task in self.tasks {
            match task.await.unwrap_or(HandlerOutcome::Panicked) {
                HandlerOutcome::Completed => report.completed += 1,
                HandlerOutcome::Failed => report.failed += 1,
                HandlerOutcome::Panicked => report.panicked += 1,
            }
        }
        report
    }
}

/// Registry of local handlers keyed by event type.
///
/// Constructed and owned explicitly (usually behind an `Arc`); there is no
/// global instance.
#[derive(Default)]
pub struct EventBus {
    handlers: RwLock<HashMap<String, Vec<Arc<dyn EventHandler>>>>,
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let handlers = self.handlers.read().unwrap_or_else(|poisoned| poisoned.into_inner());
        let counts: HashMap<&str, usize> = handlers
            .iter()
            .map(|(event_type, list)| (event_type.as_str(), list.len()))
            .collect();
        f.debug_struct("EventBus").field("handlers", &counts).finish()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for events of `event_type`.
    pub fn subscribe<H>(&self, event_type: impl Into<String>, handler: H)
    where
        H: EventHandler + 'static,
    {
        let event_type = event_type.into();
        debug!(event_type = %event_type, "event handler subscribed");
        self.handlers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .entry(event_type)
            .or_default()
            .push(Arc::new(handler));
    }

    pub fn handler_count(&self, event_type: &str) -> usize {
        self.handlers
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(event_type)
            .map_or(0, Vec::len)
    }

    /// Hand `event` to every handler registered for its type.
    ///
    /// Must be called from within a Tokio runtime. Returns immediately; the
    /// handlers run on their own tasks.
    pub fn publish(&self, event: &Event) -> Dispatched {
        // Snapshot under the read lock so handlers never run while it is held.
        let handlers: Vec<Arc<dyn EventHandler>> = self
            .handlers
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(&event.event_type)
            .cloned()
            .unwrap_or_default();

        let tasks = handlers
            .into_iter()
            .map(|handler| spawn_isolated(handler, event.clone()))
            .collect();

        Dispatched {
            event_id: event.id,
            tasks,
        }
    }
}

/// Run one handler on its own task and translate its ending into an outcome.
///
/// The inner task absorbs panics; the outer one only logs, so it cannot panic.
fn spawn_isolated(handler: Arc<dyn EventHandler>, event: Event) -> JoinHandle<HandlerOutcome> {
    let event_id = event.id;
    let event_type = event.event_type.clone();
    let inner = tokio::spawn(async move { handler.handle(event).await });

    tokio::spawn(async move {
        match inner.await {
            Ok(Ok(())) => HandlerOutcome::Completed,
            Ok(Err(err)) => {
                error!(%event_id, event_type = %event_type, error = %err, "event handler failed");
                HandlerOutcome::Failed
            }
            Err(join_err) => {
                error!(%event_id, event_type = %event_type, error = %join_err, "event handler panicked");
                HandlerOutcome::Panicked
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::event::{NewEvent, Payload};
    use streamhook_core::StreamId;

    fn event(event_type: &str) -> Event {
        let new = NewEvent::new(StreamId::new("s").unwrap(), event_type, "test", Payload::new());
        Event::committed(new, EventId::new(), Utc::now(), 1)
    }

    async fn panicking_handler(_event: Event) -> anyhow::Result<()> {
        panic!("handler bug")
    }

    #[tokio::test]
    async fn handlers_only_receive_their_event_type() {
        let bus = EventBus::new();
        let created = Arc::new(AtomicUsize::new(0));
        let deleted = Arc::new(AtomicUsize::new(0));

        let c = created.clone();
        bus.subscribe("user.created", move |_event: Event| {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                anyhow::Ok(())
            }
        });
        let d = deleted.clone();
        bus.subscribe("user.deleted", move |_event: Event| {
            let d = d.clone();
            async move {
                d.fetch_add(1, Ordering::SeqCst);
                anyhow::Ok(())
            }
        });

        let report = bus.publish(&event("user.created")).wait().await;

        assert_eq!(report.completed, 1);
        assert_eq!(created.load(Ordering::SeqCst), 1);
        assert_eq!(deleted.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn publish_without_handlers_is_a_no_op() {
        let bus = EventBus::new();
        let dispatched = bus.publish(&event("nobody.listens"));
        assert_eq!(dispatched.handler_count(), 0);
        assert_eq!(dispatched.wait().await, DispatchReport::default());
    }

    #[tokio::test]
    async fn failing_and_panicking_handlers_do_not_affect_others() {
        let bus = EventBus::new();
        let seen = Arc::new(AtomicUsize::new(0));

        bus.subscribe("order.placed", |_event: Event| async move {
            Err::<(), _>(anyhow::anyhow!("downstream unavailable"))
        });
        bus.subscribe("order.placed", panicking_handler);
        let s = seen.clone();
        bus.subscribe("order.placed", move |event: Event| {
            let s = s.clone();
            async move {
                assert_eq!(event.event_type, "order.placed");
                s.fetch_add(1, Ordering::SeqCst);
                anyhow::Ok(())
            }
        });

        let report = bus.publish(&event("order.placed")).wait().await;

        assert_eq!(
            report,
            DispatchReport {
                completed: 1,
                failed: 1,
                panicked: 1
            }
        );
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn dropped_dispatch_handle_still_runs_handlers() {
        let bus = EventBus::new();
        let (tx, rx) = tokio::sync::oneshot::channel::<EventId>();
        let tx = Arc::new(std::sync::Mutex::new(Some(tx)));

        bus.subscribe("ping", move |event: Event| {
            let tx = tx.clone();
            async move {
                if let Some(tx) = tx.lock().unwrap().take() {
                    let _ = tx.send(event.id);
                }
                anyhow::Ok(())
            }
        });

        let published = event("ping");
        drop(bus.publish(&published));

        assert_eq!(rx.await.unwrap(), published.id);
    }

    #[test]
    fn handler_count_tracks_subscriptions() {
        let bus = EventBus::new();
        assert_eq!(bus.handler_count("a"), 0);
        bus.subscribe("a", |_event: Event| async { anyhow::Ok(()) });
        bus.subscribe("a", |_event: Event| async { anyhow::Ok(()) });
        assert_eq!(bus.handler_count("a"), 2);
    }
}
