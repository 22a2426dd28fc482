use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::Utc;

use streamhook_core::WebhookId;
use streamhook_webhooks::WebhookEndpoint;

use super::{RegistryError, SubscriptionIndex, WebhookRegistry, prepare, sort_by_name};

/// In-memory webhook registry for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryWebhookRegistry {
    endpoints: RwLock<HashMap<WebhookId, WebhookEndpoint>>,
}

impl InMemoryWebhookRegistry {
    pub fn new() -> Self {
        Self::default()
    }
}

fn poisoned() -> RegistryError {
    RegistryError::Storage("lock poisoned".to_string())
}

#[async_trait]
impl SubscriptionIndex for InMemoryWebhookRegistry {
    async fn matching(&self, event_type: &str) -> Result<Vec<WebhookEndpoint>, RegistryError> {
        let mut matches: Vec<WebhookEndpoint> = self
            .endpoints
            .read()
            .map_err(|_| poisoned())?
            .values()
            .filter(|ep| ep.accepts(event_type))
            .cloned()
            .collect();
        sort_by_name(&mut matches);
        Ok(matches)
    }

    async fn get(&self, id: WebhookId) -> Result<Option<WebhookEndpoint>, RegistryError> {
        Ok(self.endpoints.read().map_err(|_| poisoned())?.get(&id).cloned())
    }
}

#[async_trait]
impl WebhookRegistry for InMemoryWebhookRegistry {
    async fn register(&self, endpoint: WebhookEndpoint) -> Result<WebhookEndpoint, RegistryError> {
        let endpoint = prepare(endpoint)?;
        let mut endpoints = self.endpoints.write().map_err(|_| poisoned())?;
        if endpoints.contains_key(&endpoint.id) {
            return Err(RegistryError::AlreadyExists(endpoint.id));
        }
        endpoints.insert(endpoint.id, endpoint.clone());
        Ok(endpoint)
    }

    async fn update(&self, endpoint: WebhookEndpoint) -> Result<WebhookEndpoint, RegistryError> {
        let mut endpoint = prepare(endpoint)?;
        let mut endpoints = self.endpoints.write().map_err(|_| poisoned())?;
        let existing = endpoints
            .get_mut(&endpoint.id)
            .ok_or(RegistryError::NotFound(endpoint.id))?;
        endpoint.created_at = existing.created_at;
        endpoint.updated_at = Utc::now();
        *existing = endpoint.clone();
        Ok(endpoint)
    }

    async fn set_enabled(
        &self,
        id: WebhookId,
        enabled: bool,
    ) -> Result<WebhookEndpoint, RegistryError> {
        let mut endpoints = self.endpoints.write().map_err(|_| poisoned())?;
        let existing = endpoints.get_mut(&id).ok_or(RegistryError::NotFound(id))?;
        existing.enabled = enabled;
        existing.updated_at = Utc::now();
        Ok(existing.clone())
    }

    async fn remove(&self, id: WebhookId) -> Result<(), RegistryError> {
        self.endpoints
            .write()
            .map_err(|_| poisoned())?
            .remove(&id)
            .map(|_| ())
            .ok_or(RegistryError::NotFound(id))
    }

    async fn list(&self) -> Result<Vec<WebhookEndpoint>, RegistryError> {
        let mut all: Vec<WebhookEndpoint> = self
            .endpoints
            .read()
            .map_err(|_| poisoned())?
            .values()
            .cloned()
            .collect();
        sort_by_name(&mut all);
        Ok(all)
    }
}
