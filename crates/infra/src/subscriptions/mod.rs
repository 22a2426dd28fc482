//! Webhook endpoint registrations.
//!
//! The delivery path only needs [`SubscriptionIndex`]: "which enabled endpoints
//! want this event type". [`WebhookRegistry`] adds the write operations used by
//! the management surface.

pub mod in_memory;
pub mod postgres;

use async_trait::async_trait;
use thiserror::Error;

use streamhook_core::WebhookId;
use streamhook_webhooks::WebhookEndpoint;

pub use in_memory::InMemoryWebhookRegistry;
pub use postgres::PostgresWebhookRegistry;

/// Webhook registry error.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// The endpoint definition is unusable (bad URL, no event types, ...).
    #[error("invalid webhook configuration: {0}")]
    Configuration(String),

    #[error("webhook not found: {0}")]
    NotFound(WebhookId),

    #[error("webhook already exists: {0}")]
    AlreadyExists(WebhookId),

    #[error("storage error: {0}")]
    Storage(String),
}

/// Read side used at dispatch time.
#[async_trait]
pub trait SubscriptionIndex: Send + Sync {
    /// Every enabled endpoint subscribed to `event_type`, ordered by name.
    ///
    /// The result is a snapshot: later registry changes do not affect it.
    async fn matching(&self, event_type: &str) -> Result<Vec<WebhookEndpoint>, RegistryError>;

    /// Look up one endpoint regardless of its enabled flag.
    async fn get(&self, id: WebhookId) -> Result<Option<WebhookEndpoint>, RegistryError>;
}

/// Write side for the management surface.
#[async_trait]
pub trait WebhookRegistry: SubscriptionIndex {
    /// Validate and store a new endpoint. Non-positive limits are replaced by
    /// the defaults before storing.
    async fn register(&self, endpoint: WebhookEndpoint) -> Result<WebhookEndpoint, RegistryError>;

    /// Replace an existing endpoint's definition.
    async fn update(&self, endpoint: WebhookEndpoint) -> Result<WebhookEndpoint, RegistryError>;

    async fn set_enabled(
        &self,
        id: WebhookId,
        enabled: bool,
    ) -> Result<WebhookEndpoint, RegistryError>;

    async fn remove(&self, id: WebhookId) -> Result<(), RegistryError>;

    /// All endpoints, ordered by name.
    async fn list(&self) -> Result<Vec<WebhookEndpoint>, RegistryError>;
}

/// Validate an endpoint definition and fill in defaults.
pub fn prepare(endpoint: WebhookEndpoint) -> Result<WebhookEndpoint, RegistryError> {
    endpoint
        .validate()
        .map_err(|e| RegistryError::Configuration(e.to_string()))?;

    let url = reqwest::Url::parse(&endpoint.url)
        .map_err(|e| RegistryError::Configuration(format!("invalid url {:?}: {e}", endpoint.url)))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(RegistryError::Configuration(format!(
            "unsupported url scheme {:?}",
            url.scheme()
        )));
    }

    Ok(endpoint.with_defaults_applied())
}

fn sort_by_name(endpoints: &mut [WebhookEndpoint]) {
    endpoints.sort_by(|a, b| a.name.cmp(&b.name).then(a.id.cmp(&b.id)));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prepare_rejects_bad_urls() {
        let ep = WebhookEndpoint::new("x", "not a url").with_event_types(["a"]);
        assert!(matches!(prepare(ep), Err(RegistryError::Configuration(_))));

        let ep = WebhookEndpoint::new("x", "ftp://example.com").with_event_types(["a"]);
        assert!(matches!(prepare(ep), Err(RegistryError::Configuration(_))));
    }

    #[test]
    fn prepare_applies_defaults() {
        let ep = WebhookEndpoint::new("x", "https://example.com/hook")
            .with_event_types(["a"])
            .with_max_retries(0)
            .with_timeout_seconds(0);
        let ep = prepare(ep).unwrap();
        assert_eq!((ep.max_retries, ep.timeout_seconds), (3, 30));
    }
}
