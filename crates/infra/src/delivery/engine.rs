//! Webhook delivery engine.
//!
//! Owns the attempt cycle for a single delivery record:
//!
//! ```text
//! create (pending, leased) → encode + sign → POST → record outcome → save
//! ```
//!
//! The engine never retries inline. A failed attempt is saved with its
//! `next_retry` and left for the [`RetrySweeper`](crate::sweeper::RetrySweeper)
//! to claim, so a crash between attempts loses nothing.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{Instrument, error, info, info_span, warn};

use streamhook_core::{Clock, DomainError};
use streamhook_events::Event;
use streamhook_webhooks::payload::delivery_headers;
use streamhook_webhooks::{
    AttemptFailure, DeliveryStatus, RetryPolicy, WebhookDelivery, WebhookEndpoint, WebhookPayload,
    sign,
};

use super::client::{ClientConfig, DeliveryClient, DeliveryRequest};
use super::error::DeliveryError;
use crate::deliveries::{DeliveryRecorder, DeliveryStoreError};

/// Upper bound on a single attempt, whatever the endpoint asks for.
pub const DEFAULT_MAX_ATTEMPT_TIMEOUT: Duration = Duration::from_secs(300);

/// Extra lease time on top of the longest possible attempt.
pub const DEFAULT_LEASE_MARGIN: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub retry_policy: RetryPolicy,
    pub max_attempt_timeout: Duration,
    pub lease_margin: Duration,
    pub client: ClientConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            retry_policy: RetryPolicy::default(),
            max_attempt_timeout: DEFAULT_MAX_ATTEMPT_TIMEOUT,
            lease_margin: DEFAULT_LEASE_MARGIN,
            client: ClientConfig::default(),
        }
    }
}

/// Where a record stands after one attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptOutcome {
    Succeeded,
    /// Failed, another attempt is scheduled.
    Retrying,
    /// Failed for the last time.
    Failed,
}

impl AttemptOutcome {
    pub fn of(delivery: &WebhookDelivery) -> Self {
        match delivery.status {
            DeliveryStatus::Success => AttemptOutcome::Succeeded,
            DeliveryStatus::Failed => AttemptOutcome::Failed,
            DeliveryStatus::Pending => AttemptOutcome::Retrying,
        }
    }
}

/// Summary of fanning one event out to its endpoints.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeliveryReport {
    pub attempted: usize,
    pub succeeded: usize,
    pub retrying: usize,
    pub failed: usize,
    /// Records that could not be created or saved.
    pub errored: usize,
}

impl DeliveryReport {
    fn record(&mut self, result: Result<AttemptOutcome, ()>) {
        self.attempted += 1;
        match result {
            Ok(AttemptOutcome::Succeeded) => self.succeeded += 1,
            Ok(AttemptOutcome::Retrying) => self.retrying += 1,
            Ok(AttemptOutcome::Failed) => self.failed += 1,
            Err(()) => self.errored += 1,
        }
    }
}

pub struct DeliveryEngine {
    recorder: Arc<dyn DeliveryRecorder>,
    clock: Arc<dyn Clock>,
    client: DeliveryClient,
    config: EngineConfig,
}

impl std::fmt::Debug for DeliveryEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeliveryEngine")
            .field("clock", &self.clock)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl DeliveryEngine {
    pub fn new(
        recorder: Arc<dyn DeliveryRecorder>,
        clock: Arc<dyn Clock>,
        config: EngineConfig,
    ) -> Result<Self, DeliveryError> {
        let client = DeliveryClient::new(&config.client)?;
        Ok(Self {
            recorder,
            clock,
            client,
            config,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// End of a lease taken at `now`: long enough to outlive any attempt.
    pub fn lease_until(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        chrono::Duration::from_std(self.config.max_attempt_timeout + self.config.lease_margin)
            .ok()
            .and_then(|lease| now.checked_add_signed(lease))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    /// Timeout for one attempt against `endpoint`.
    pub fn attempt_timeout(&self, endpoint: &WebhookEndpoint) -> Duration {
        endpoint.timeout().min(self.config.max_attempt_timeout)
    }

    /// The lease `delivery` was handed out with, if it has not yet expired.
    ///
    /// Once it expires the record may already belong to another worker, so
    /// nothing more may be sent or saved under it.
    fn live_lease(&self, delivery: &WebhookDelivery) -> Result<DateTime<Utc>, DeliveryError> {
        match delivery.locked_until {
            Some(lease) if self.clock.now() < lease => Ok(lease),
            _ => {
                warn!(
                    delivery_id = %delivery.id,
                    locked_until = ?delivery.locked_until,
                    "lease expired before attempt"
                );
                Err(DeliveryStoreError::LeaseLost(delivery.id).into())
            }
        }
    }

    /// Create a delivery record for `event` → `endpoint` and make the first attempt.
    ///
    /// Returns the record as saved after that attempt.
    pub async fn dispatch(
        &self,
        endpoint: &WebhookEndpoint,
        event: &Event,
    ) -> Result<WebhookDelivery, DeliveryError> {
        let now = self.clock.now();
        let delivery = WebhookDelivery::new(endpoint.id, event.id, now, self.lease_until(now));
        self.recorder.create(&delivery).await?;
        self.attempt(delivery, endpoint, event).await
    }

    /// Make one attempt on a record the caller holds the lease for, then save it.
    pub async fn attempt(
        &self,
        mut delivery: WebhookDelivery,
        endpoint: &WebhookEndpoint,
        event: &Event,
    ) -> Result<WebhookDelivery, DeliveryError> {
        if delivery.status.is_terminal() {
            return Err(DeliveryError::transition(
                delivery.id,
                DomainError::invariant(format!("delivery is already {}", delivery.status)),
            ));
        }
        let lease = self.live_lease(&delivery)?;

        let attempt = delivery.attempt_count + 1;
        let span = info_span!(
            "delivery_attempt",
            delivery_id = %delivery.id,
            webhook_id = %delivery.webhook_id,
            event_id = %delivery.event_id,
            attempt
        );

        async move {
            let result = async {
                let (body, signature) = encode_and_sign(endpoint, event)?;
                let request = DeliveryRequest {
                    delivery_id: delivery.id,
                    attempt,
                    url: &endpoint.url,
                    body,
                    headers: delivery_headers(event, signature),
                    timeout: self.attempt_timeout(endpoint),
                };
                self.client.send(request).await
            }
            .await;

            let now = self.clock.now();
            match &result {
                Ok(response) => delivery.record_success(&response.body, now),
                Err(failure) => delivery.record_failure(
                    failure,
                    endpoint.max_attempts(),
                    &self.config.retry_policy,
                    now,
                ),
            }
            .map_err(|e| DeliveryError::transition(delivery.id, e))?;

            self.recorder.save(&delivery, lease).await?;

            let outcome = AttemptOutcome::of(&delivery);
            match (&result, outcome) {
                (Ok(response), _) => info!(status = response.status, "webhook delivered"),
                (Err(failure), AttemptOutcome::Retrying) => warn!(
                    error = %failure,
                    next_retry = ?delivery.next_retry,
                    "webhook delivery failed, retry scheduled"
                ),
                (Err(failure), _) => warn!(
                    error = %failure,
                    max_attempts = endpoint.max_attempts(),
                    "webhook delivery failed permanently"
                ),
            }
            Ok(delivery)
        }
        .instrument(span)
        .await
    }

    /// Mark a leased record failed without attempting it.
    pub async fn abandon(
        &self,
        mut delivery: WebhookDelivery,
        reason: &str,
    ) -> Result<(), DeliveryError> {
        let lease = self.live_lease(&delivery)?;
        delivery
            .abandon(reason, self.clock.now())
            .map_err(|e| DeliveryError::transition(delivery.id, e))?;
        self.recorder.save(&delivery, lease).await?;
        warn!(
            delivery_id = %delivery.id,
            webhook_id = %delivery.webhook_id,
            event_id = %delivery.event_id,
            reason,
            "delivery abandoned"
        );
        Ok(())
    }

    /// Deliver `event` to every endpoint concurrently, one task per endpoint.
    ///
    /// A failing endpoint never delays or affects the others.
    pub async fn dispatch_all(
        self: &Arc<Self>,
        endpoints: Vec<WebhookEndpoint>,
        event: &Event,
    ) -> DeliveryReport {
        let event = Arc::new(event.clone());
        let tasks: Vec<_> = endpoints
            .into_iter()
            .map(|endpoint| {
                let engine = Arc::clone(self);
                let event = Arc::clone(&event);
                tokio::spawn(async move {
                    engine
                        .dispatch(&endpoint, &event)
                        .await
                        .map(|delivery| AttemptOutcome::of(&delivery))
                        .map_err(|err| {
                            error!(
                                webhook_id = %endpoint.id,
                                event_id = %event.id,
                                error = %err,
                                "failed to dispatch webhook"
                            );
                        })
                })
            })
            .collect();

        let mut report = DeliveryReport::default();
        for task in tasks {
            match task.await {
                Ok(result) => report.record(result),
                Err(join_err) => {
                    error!(event_id = %event.id, error = %join_err, "delivery task panicked");
                    report.record(Err(()));
                }
            }
        }
        report
    }
}

/// Payload bytes and, when the endpoint has a secret, their signature.
fn encode_and_sign(
    endpoint: &WebhookEndpoint,
    event: &Event,
) -> Result<(Vec<u8>, Option<String>), AttemptFailure> {
    let encoding_failed = |message: String| AttemptFailure::Encoding { message };
    let body = WebhookPayload::from_event(event)
        .to_bytes()
        .map_err(|e| encoding_failed(e.to_string()))?;
    let signature = endpoint
        .signing_secret()
        .map(|secret| sign(&body, secret))
        .transpose()
        .map_err(|e| encoding_failed(e.to_string()))?;
    Ok((body, signature))
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use streamhook_core::{EventId, ManualClock, StreamId};
    use streamhook_events::NewEvent;
    use streamhook_webhooks::payload::SIGNATURE_HEADER;
    use wiremock::{Mock, MockServer, ResponseTemplate, matchers};

    use super::*;
    use crate::deliveries::InMemoryDeliveryRecorder;

    fn event() -> Event {
        let data = json!({"order_id": 7}).as_object().cloned().unwrap_or_default();
        let new = NewEvent::new(StreamId::new("orders-7").unwrap(), "order.created", "shop", data);
        Event::committed(new, EventId::new(), Utc::now(), 1)
    }

    fn setup() -> (Arc<DeliveryEngine>, Arc<InMemoryDeliveryRecorder>, Arc<ManualClock>) {
        let recorder = Arc::new(InMemoryDeliveryRecorder::new());
        let clock = Arc::new(ManualClock::starting_now());
        let engine =
            DeliveryEngine::new(recorder.clone(), clock.clone(), EngineConfig::default()).unwrap();
        (Arc::new(engine), recorder, clock)
    }

    #[tokio::test]
    async fn successful_dispatch_is_saved_and_signed() {
        let server = MockServer::start().await;
        Mock::given(matchers::method("POST"))
            .and(matchers::header_exists(SIGNATURE_HEADER))
            .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
            .expect(1)
            .mount(&server)
            .await;

        let (engine, recorder, _) = setup();
        let endpoint = WebhookEndpoint::new("orders", server.uri()).with_secret("s3cret");
        let delivery = engine.dispatch(&endpoint, &event()).await.unwrap();

        assert_eq!(AttemptOutcome::of(&delivery), AttemptOutcome::Succeeded);
        let stored = recorder.all().unwrap();
        assert_eq!(stored, vec![delivery]);
        assert_eq!(stored[0].status, DeliveryStatus::Success);
        assert_eq!(stored[0].attempt_count, 1);
        assert_eq!(stored[0].response.as_deref(), Some("ok"));
        assert_eq!(stored[0].locked_until, None);
    }

    #[tokio::test]
    async fn failed_dispatch_schedules_retry_after_backoff() {
        let server = MockServer::start().await;
        Mock::given(matchers::method("POST"))
            .respond_with(ResponseTemplate::new(503).set_body_string("busy"))
            .mount(&server)
            .await;

        let (engine, recorder, clock) = setup();
        let endpoint = WebhookEndpoint::new("orders", server.uri());
        let delivery = engine.dispatch(&endpoint, &event()).await.unwrap();

        assert_eq!(AttemptOutcome::of(&delivery), AttemptOutcome::Retrying);
        let stored = &recorder.all().unwrap()[0];
        assert_eq!(stored.status, DeliveryStatus::Pending);
        assert_eq!(stored.next_retry, Some(clock.now() + chrono::Duration::seconds(1)));
        assert_eq!(stored.response.as_deref(), Some("busy"));
        assert_eq!(stored.error_message.as_deref(), Some("webhook returned status 503"));
    }

    #[tokio::test]
    async fn terminal_records_are_not_attempted() {
        let server = MockServer::start().await;
        Mock::given(matchers::method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let (engine, _, clock) = setup();
        let endpoint = WebhookEndpoint::new("orders", server.uri());
        let event = event();
        let mut done = WebhookDelivery::new(endpoint.id, event.id, clock.now(), clock.now());
        done.record_success("ok", clock.now()).unwrap();

        let err = engine.attempt(done, &endpoint, &event).await.unwrap_err();
        assert!(matches!(err, DeliveryError::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn overrun_lease_is_not_attempted_or_saved() {
        let server = MockServer::start().await;
        Mock::given(matchers::method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .expect(1)
            .mount(&server)
            .await;

        let (engine, recorder, clock) = setup();
        let endpoint = WebhookEndpoint::new("orders", server.uri());
        let event = event();
        let start = clock.now();
        let creator_copy =
            WebhookDelivery::new(endpoint.id, event.id, start, start + chrono::Duration::seconds(30));
        recorder.create(&creator_copy).await.unwrap();

        clock.advance(Duration::from_secs(31));
        let now = clock.now();
        let mut claimed = recorder.claim_due(now, engine.lease_until(now), 10).await.unwrap();
        assert_eq!(claimed.len(), 1);

        let err = engine.attempt(creator_copy, &endpoint, &event).await.unwrap_err();
        assert!(matches!(err, DeliveryError::Store(DeliveryStoreError::LeaseLost(_))));

        let retried = engine.attempt(claimed.remove(0), &endpoint, &event).await.unwrap();
        assert_eq!(retried.attempt_count, 1);
        assert_eq!(recorder.all().unwrap(), vec![retried]);
    }

    #[tokio::test]
    async fn dispatch_all_isolates_endpoints() {
        let healthy = MockServer::start().await;
        Mock::given(matchers::method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&healthy)
            .await;
        let broken = MockServer::start().await;
        Mock::given(matchers::method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&broken)
            .await;

        let (engine, recorder, _) = setup();
        let endpoints = vec![
            WebhookEndpoint::new("healthy", healthy.uri()),
            WebhookEndpoint::new("broken", broken.uri()).with_max_retries(1),
        ];
        let report = engine.dispatch_all(endpoints, &event()).await;

        assert_eq!(
            report,
            DeliveryReport {
                attempted: 2,
                succeeded: 1,
                retrying: 0,
                failed: 1,
                errored: 0,
            }
        );
        assert_eq!(recorder.all().unwrap().len(), 2);
    }

    #[test]
    fn attempt_timeout_and_lease_are_bounded() {
        let (engine, _, clock) = setup();
        let slow = WebhookEndpoint::new("slow", "http://localhost").with_timeout_seconds(10_000);
        let quick = WebhookEndpoint::new("quick", "http://localhost").with_timeout_seconds(5);

        assert_eq!(engine.attempt_timeout(&slow), DEFAULT_MAX_ATTEMPT_TIMEOUT);
        assert_eq!(engine.attempt_timeout(&quick), Duration::from_secs(5));

        let now = clock.now();
        assert_eq!(engine.lease_until(now), now + chrono::Duration::seconds(330));
    }
}
