use thiserror::Error;

use streamhook_core::{DeliveryId, DomainError};

use crate::deliveries::DeliveryStoreError;
use crate::event_store::EventStoreError;
use crate::subscriptions::RegistryError;

/// Failure of the delivery machinery itself.
///
/// Unsuccessful webhook calls are not errors at this level: they are recorded
/// on the delivery as an [`AttemptFailure`](streamhook_webhooks::AttemptFailure)
/// and retried. A `DeliveryError` means a record could not be created, loaded
/// or persisted.
#[derive(Debug, Error)]
pub enum DeliveryError {
    /// The HTTP client could not be built.
    #[error("invalid delivery configuration: {0}")]
    Configuration(String),

    #[error(transparent)]
    Store(#[from] DeliveryStoreError),

    #[error(transparent)]
    Events(#[from] EventStoreError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    /// The record refused the state change (it is already terminal).
    #[error("delivery {id}: {source}")]
    InvalidTransition {
        id: DeliveryId,
        #[source]
        source: DomainError,
    },
}

impl DeliveryError {
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    pub(crate) fn transition(id: DeliveryId, source: DomainError) -> Self {
        Self::InvalidTransition { id, source }
    }
}
