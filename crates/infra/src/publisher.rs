//! Append-then-fan-out entry point for producers.
//!
//! Only the append can fail the caller. Local handlers and webhook deliveries
//! run on their own tasks after the event is committed; their failures are
//! logged and recorded but never returned.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{debug, error, instrument};

use streamhook_events::{DispatchReport, Dispatched, Event, EventBus, NewEvent};

use crate::delivery::{DeliveryEngine, DeliveryReport};
use crate::event_store::{EventLog, EventStoreError};
use crate::subscriptions::SubscriptionIndex;

pub struct EventPublisher {
    log: Arc<dyn EventLog>,
    subscriptions: Arc<dyn SubscriptionIndex>,
    engine: Arc<DeliveryEngine>,
    bus: Arc<EventBus>,
}

impl std::fmt::Debug for EventPublisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventPublisher")
            .field("engine", &self.engine)
            .field("bus", &self.bus)
            .finish_non_exhaustive()
    }
}

/// A committed event plus handles to its fan-out.
///
/// Dropping it detaches the fan-out; handlers and deliveries still complete.
#[derive(Debug)]
pub struct Published {
    pub event: Event,
    handlers: Dispatched,
    deliveries: JoinHandle<DeliveryReport>,
}

/// Outcome of a publish once every handler and first delivery attempt is done.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublishReport {
    pub handlers: DispatchReport,
    pub deliveries: DeliveryReport,
}

impl Published {
    /// Wait for the local handlers and the first attempt of every delivery.
    pub async fn wait(self) -> PublishReport {
        let handlers = self.handlers.wait().await;
        let deliveries = self.deliveries.await.unwrap_or_else(|join_err| {
            error!(event_id = %self.event.id, error = %join_err, "delivery fan-out panicked");
            DeliveryReport::default()
        });
        PublishReport {
            handlers,
            deliveries,
        }
    }
}

impl EventPublisher {
    pub fn new(
        log: Arc<dyn EventLog>,
        subscriptions: Arc<dyn SubscriptionIndex>,
        engine: Arc<DeliveryEngine>,
        bus: Arc<EventBus>,
    ) -> Self {
        Self {
            log,
            subscriptions,
            engine,
            bus,
        }
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    /// Append `new` and start its fan-out.
    ///
    /// Returns as soon as the event is committed. The only error is a failed
    /// append, in which case nothing is handed to handlers or endpoints.
    #[instrument(skip(self, new), fields(stream_id = %new.stream_id, event_type = %new.event_type), err)]
    pub async fn publish(&self, new: NewEvent) -> Result<Published, EventStoreError> {
        let event = self.log.append(new).await?;
        debug!(event_id = %event.id, sequence_number = event.sequence_number, "event appended");

        let handlers = self.bus.publish(&event);
        let deliveries = tokio::spawn(fan_out(
            Arc::clone(&self.subscriptions),
            Arc::clone(&self.engine),
            event.clone(),
        ));

        Ok(Published {
            event,
            handlers,
            deliveries,
        })
    }

    /// Publish from a background task; an append failure is logged, not returned.
    ///
    /// The handle yields the [`Published`] event, or `None` if the append failed.
    /// It can be dropped without affecting the publish.
    pub fn publish_detached(self: &Arc<Self>, new: NewEvent) -> JoinHandle<Option<Published>> {
        let publisher = Arc::clone(self);
        tokio::spawn(async move {
            let stream_id = new.stream_id.clone();
            let event_type = new.event_type.clone();
            publisher
                .publish(new)
                .await
                .inspect_err(|err| {
                    error!(%stream_id, %event_type, error = %err, "detached publish failed");
                })
                .ok()
        })
    }
}

async fn fan_out(
    subscriptions: Arc<dyn SubscriptionIndex>,
    engine: Arc<DeliveryEngine>,
    event: Event,
) -> DeliveryReport {
    let endpoints = match subscriptions.matching(&event.event_type).await {
        Ok(endpoints) => endpoints,
        Err(err) => {
            error!(event_id = %event.id, error = %err, "failed to resolve webhook subscriptions");
            return DeliveryReport::default();
        }
    };
    if endpoints.is_empty() {
        debug!(event_id = %event.id, event_type = %event.event_type, "no webhooks subscribed");
        return DeliveryReport::default();
    }
    engine.dispatch_all(endpoints, &event).await
}
