use std::collections::BTreeSet;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use streamhook_core::{DomainError, DomainResult, WebhookId};

/// Attempts made before a delivery is given up when the endpoint does not say.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Per-attempt timeout when the endpoint does not say.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// A registered webhook receiver.
///
/// Managed by an external surface; the delivery engine only reads it.
/// `max_retries` and `timeout_seconds` are stored as given. Values that are
/// zero or negative mean "use the default" (see [`Self::max_attempts`] and
/// [`Self::timeout`]).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebhookEndpoint {
    pub id: WebhookId,
    pub name: String,
    pub url: String,
    #[serde(default, skip_serializing)]
    pub secret: Option<String>,
    pub event_types: BTreeSet<String>,
    pub enabled: bool,
    pub max_retries: i32,
    pub timeout_seconds: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WebhookEndpoint {
    /// An enabled endpoint with no subscriptions, no secret and default limits.
    pub fn new(name: impl Into<String>, url: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: WebhookId::new(),
            name: name.into(),
            url: url.into(),
            secret: None,
            event_types: BTreeSet::new(),
            enabled: true,
            max_retries: DEFAULT_MAX_RETRIES as i32,
            timeout_seconds: DEFAULT_TIMEOUT.as_secs() as i32,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_secret(mut self, secret: impl Into<String>) -> Self {
        self.secret = Some(secret.into());
        self
    }

    pub fn with_event_types<I, S>(mut self, event_types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.event_types = event_types.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_max_retries(mut self, max_retries: i32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_timeout_seconds(mut self, timeout_seconds: i32) -> Self {
        self.timeout_seconds = timeout_seconds;
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    /// Secret used to sign deliveries. An empty secret counts as none.
    pub fn signing_secret(&self) -> Option<&str> {
        self.secret.as_deref().filter(|s| !s.is_empty())
    }

    pub fn subscribes_to(&self, event_type: &str) -> bool {
        self.event_types.contains(event_type)
    }

    /// Whether an event of `event_type` should be delivered here right now.
    pub fn accepts(&self, event_type: &str) -> bool {
        self.enabled && self.subscribes_to(event_type)
    }

    /// Total attempts allowed for one delivery, including the first.
    pub fn max_attempts(&self) -> u32 {
        u32::try_from(self.max_retries)
            .ok()
            .filter(|n| *n > 0)
            .unwrap_or(DEFAULT_MAX_RETRIES)
    }

    /// Timeout for a single attempt.
    pub fn timeout(&self) -> Duration {
        u64::try_from(self.timeout_seconds)
            .ok()
            .filter(|n| *n > 0)
            .map_or(DEFAULT_TIMEOUT, Duration::from_secs)
    }

    /// Check the fields a delivery depends on.
    ///
    /// URL syntax is checked by the registry, which owns an HTTP URL parser.
    pub fn validate(&self) -> DomainResult<()> {
        if self.name.trim().is_empty() {
            return Err(DomainError::validation("webhook name must not be blank"));
        }
        if self.url.trim().is_empty() {
            return Err(DomainError::validation("webhook url must not be blank"));
        }
        if self.event_types.is_empty() {
            return Err(DomainError::validation(
                "webhook must subscribe to at least one event type",
            ));
        }
        if let Some(blank) = self.event_types.iter().find(|t| t.trim().is_empty()) {
            return Err(DomainError::validation(format!(
                "webhook event type {blank:?} is blank"
            )));
        }
        Ok(())
    }

    /// Replace non-positive limits with the defaults, so stored rows read back
    /// exactly as they are applied.
    pub fn with_defaults_applied(mut self) -> Self {
        self.max_retries = self.max_attempts() as i32;
        self.timeout_seconds = self.timeout().as_secs() as i32;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoint() -> WebhookEndpoint {
        WebhookEndpoint::new("crm", "https://crm.example.com/hooks")
            .with_event_types(["user.created", "user.deleted"])
    }

    #[test]
    fn accepts_only_subscribed_types_while_enabled() {
        let ep = endpoint();
        assert!(ep.accepts("user.created"));
        assert!(!ep.accepts("payment.processed"));
        assert!(!ep.disabled().accepts("user.created"));
    }

    #[test]
    fn non_positive_limits_fall_back_to_defaults() {
        let ep = endpoint().with_max_retries(0).with_timeout_seconds(-5);
        assert_eq!(ep.max_attempts(), 3);
        assert_eq!(ep.timeout(), Duration::from_secs(30));

        let ep = endpoint().with_max_retries(7).with_timeout_seconds(2);
        assert_eq!(ep.max_attempts(), 7);
        assert_eq!(ep.timeout(), Duration::from_secs(2));
    }

    #[test]
    fn empty_secret_disables_signing() {
        assert_eq!(endpoint().signing_secret(), None);
        assert_eq!(endpoint().with_secret("").signing_secret(), None);
        assert_eq!(endpoint().with_secret("k").signing_secret(), Some("k"));
    }

    #[test]
    fn validate_requires_subscriptions() {
        assert!(endpoint().validate().is_ok());
        let none = WebhookEndpoint::new("crm", "https://crm.example.com/hooks");
        assert!(matches!(none.validate(), Err(DomainError::Validation(_))));
        let blank = endpoint().with_event_types([" "]);
        assert!(blank.validate().is_err());
    }

    #[test]
    fn defaults_are_materialized() {
        let ep = endpoint().with_max_retries(-1).with_timeout_seconds(0).with_defaults_applied();
        assert_eq!(ep.max_retries, 3);
        assert_eq!(ep.timeout_seconds, 30);
    }

    #[test]
    fn secret_is_never_serialized() {
        let value = serde_json::to_value(endpoint().with_secret("hidden")).unwrap();
        assert!(value.get("secret").is_none());
    }
}
