//! Infrastructure layer: storage backends, webhook HTTP delivery, retry
//! sweeping and configuration.
//!
//! Every store comes in two flavours behind one trait: in-memory for tests and
//! single-process use, Postgres for durable deployments.

pub mod config;
pub mod deliveries;
pub mod delivery;
pub mod event_store;
pub mod publisher;
pub mod schema;
pub mod subscriptions;
pub mod sweeper;

pub use config::{Config, ConfigError};
pub use deliveries::{DeliveryRecorder, DeliveryStats, DeliveryStoreError};
pub use delivery::{DeliveryEngine, DeliveryError, DeliveryReport, EngineConfig};
pub use event_store::{EventLog, EventStoreError};
pub use publisher::{EventPublisher, PublishReport, Published};
pub use subscriptions::{RegistryError, SubscriptionIndex, WebhookRegistry};
pub use sweeper::{RetrySweeper, SweepReport, SweeperConfig, SweeperHandle};
