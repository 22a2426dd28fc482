//! HTTP client for webhook calls.
//!
//! Sends one signed POST per attempt and classifies the result:
//! 2xx is success, any other status is a rejection, and connection errors or
//! timeouts are transport failures. All three failure kinds are retried by
//! the engine the same way.

use std::time::{Duration, Instant};

use reqwest::Response;
use reqwest::header::CONTENT_TYPE;
use tracing::{Instrument, debug, info_span, warn};

use streamhook_core::DeliveryId;
use streamhook_webhooks::delivery::MAX_RESPONSE_CHARS;
use streamhook_webhooks::payload::USER_AGENT;
use streamhook_webhooks::{AttemptFailure, truncate_response};

use super::error::DeliveryError;

/// Bytes read from a response body before giving up on the rest.
/// Four bytes per character covers any UTF-8 text.
const MAX_BODY_BYTES: usize = MAX_RESPONSE_CHARS * 4;

/// Configuration for the webhook HTTP client.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub user_agent: String,
    pub max_redirects: usize,
    /// Timeout for establishing a connection; the per-attempt timeout still
    /// bounds the whole request.
    pub connect_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            user_agent: USER_AGENT.to_string(),
            max_redirects: 3,
            connect_timeout: Duration::from_secs(10),
        }
    }
}

/// One outbound webhook call.
#[derive(Debug, Clone)]
pub struct DeliveryRequest<'a> {
    pub delivery_id: DeliveryId,
    pub attempt: u32,
    pub url: &'a str,
    /// Exact bytes that were signed.
    pub body: Vec<u8>,
    pub headers: Vec<(&'static str, String)>,
    pub timeout: Duration,
}

/// A 2xx response.
#[derive(Debug, Clone)]
pub struct DeliveryResponse {
    pub status: u16,
    /// Response body, truncated to the stored length.
    pub body: String,
    pub duration: Duration,
}

/// Pooled HTTP client shared by every delivery.
#[derive(Debug, Clone)]
pub struct DeliveryClient {
    client: reqwest::Client,
}

impl DeliveryClient {
    pub fn new(config: &ClientConfig) -> Result<Self, DeliveryError> {
        let client = reqwest::Client::builder()
            .user_agent(&config.user_agent)
            .connect_timeout(config.connect_timeout)
            .redirect(reqwest::redirect::Policy::limited(config.max_redirects))
            .build()
            .map_err(|e| DeliveryError::configuration(format!("failed to build HTTP client: {e}")))?;

        Ok(Self { client })
    }

    /// POST the request and classify the outcome.
    pub async fn send(&self, request: DeliveryRequest<'_>) -> Result<DeliveryResponse, AttemptFailure> {
        let span = info_span!(
            "webhook_call",
            delivery_id = %request.delivery_id,
            attempt = request.attempt,
            url = %request.url
        );

        async move {
            let started = Instant::now();
            let timeout_secs = request.timeout.as_secs();

            let mut http_request = self
                .client
                .post(request.url)
                .timeout(request.timeout)
                .header(CONTENT_TYPE, "application/json")
                .body(request.body);
            for (name, value) in request.headers {
                http_request = http_request.header(name, value);
            }

            let response = http_request
                .send()
                .await
                .map_err(|e| classify(e, timeout_secs))?;

            let status = response.status();
            let body = read_body(response)
                .await
                .map_err(|e| classify(e, timeout_secs))?;
            let duration = started.elapsed();

            debug!(
                status = status.as_u16(),
                duration_ms = duration.as_millis() as u64,
                "received response"
            );

            if status.is_success() {
                Ok(DeliveryResponse {
                    status: status.as_u16(),
                    body,
                    duration,
                })
            } else {
                Err(AttemptFailure::rejected(status.as_u16(), body))
            }
        }
        .instrument(span)
        .await
    }
}

fn classify(err: reqwest::Error, timeout_secs: u64) -> AttemptFailure {
    warn!(error = %err, "webhook request failed");
    if err.is_timeout() {
        AttemptFailure::Timeout { timeout_secs }
    } else if err.is_connect() {
        AttemptFailure::transport(format!("connection failed: {err}"))
    } else {
        AttemptFailure::transport(err.to_string())
    }
}

/// Read at most [`MAX_BODY_BYTES`] of the body and keep the stored prefix.
async fn read_body(mut response: Response) -> Result<String, reqwest::Error> {
    let mut buf = Vec::new();
    while let Some(chunk) = response.chunk().await? {
        buf.extend_from_slice(&chunk);
        if buf.len() >= MAX_BODY_BYTES {
            break;
        }
    }
    Ok(truncate_response(&String::from_utf8_lossy(&buf)))
}
