//! Delivery records and their state machine.
//!
//! One [`WebhookDelivery`] exists per (endpoint, event) pair. Its status only
//! ever moves forward:
//!
//! ```text
//! pending ──attempt──▶ pending   (failed, attempts remain, next_retry set)
//!    │
//!    ├──attempt──▶ success       (2xx)
//!    └──attempt──▶ failed        (attempts exhausted)
//! ```
//!
//! `next_retry` is `Some` exactly while the record is `pending`. Terminal
//! records reject further attempts.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use streamhook_core::{DeliveryId, DomainError, DomainResult, EventId, WebhookId};

use crate::retry::RetryPolicy;

/// Stored response bodies are cut to this many characters.
pub const MAX_RESPONSE_CHARS: usize = 1000;

/// Delivery status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    /// Not yet delivered; another attempt is scheduled.
    Pending,
    /// An attempt got a 2xx response.
    Success,
    /// Attempts exhausted.
    Failed,
}

impl DeliveryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryStatus::Pending => "pending",
            DeliveryStatus::Success => "success",
            DeliveryStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, DeliveryStatus::Pending)
    }
}

impl fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeliveryStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(DeliveryStatus::Pending),
            "success" => Ok(DeliveryStatus::Success),
            "failed" => Ok(DeliveryStatus::Failed),
            other => Err(DomainError::validation(format!(
                "unknown delivery status {other:?}"
            ))),
        }
    }
}

/// Why an attempt did not succeed.
///
/// Recorded on the delivery and retried; never raised to the publisher.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AttemptFailure {
    /// The payload could not be encoded.
    #[error("failed to encode payload: {message}")]
    Encoding { message: String },

    /// Connection error, DNS failure, TLS failure and the like.
    #[error("request failed: {message}")]
    Transport { message: String },

    /// No complete response within the endpoint timeout.
    #[error("request timed out after {timeout_secs}s")]
    Timeout { timeout_secs: u64 },

    /// The endpoint answered with a non-2xx status.
    #[error("webhook returned status {status}")]
    Rejected { status: u16, body: String },
}

impl AttemptFailure {
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
        }
    }

    pub fn rejected(status: u16, body: impl Into<String>) -> Self {
        Self::Rejected {
            status,
            body: body.into(),
        }
    }

    /// Response body worth keeping for diagnostics, if the endpoint sent one.
    pub fn response_body(&self) -> Option<&str> {
        match self {
            AttemptFailure::Rejected { body, .. } => Some(body),
            _ => None,
        }
    }
}

/// Cut `body` to at most [`MAX_RESPONSE_CHARS`] characters.
pub fn truncate_response(body: &str) -> String {
    match body.char_indices().nth(MAX_RESPONSE_CHARS) {
        Some((byte_idx, _)) => body[..byte_idx].to_string(),
        None => body.to_string(),
    }
}

/// Durable record of delivering one event to one endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebhookDelivery {
    pub id: DeliveryId,
    pub webhook_id: WebhookId,
    pub event_id: EventId,
    pub status: DeliveryStatus,
    pub attempt_count: u32,
    pub last_attempt: Option<DateTime<Utc>>,
    pub next_retry: Option<DateTime<Utc>>,
    pub response: Option<String>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// While set and in the future, some worker owns this record and no one
    /// else may attempt it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locked_until: Option<DateTime<Utc>>,
}

impl WebhookDelivery {
    /// A fresh record, due immediately and leased to the creator until `lease_until`.
    pub fn new(
        webhook_id: WebhookId,
        event_id: EventId,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
    ) -> Self {
        Self {
            id: DeliveryId::new(),
            webhook_id,
            event_id,
            status: DeliveryStatus::Pending,
            attempt_count: 0,
            last_attempt: None,
            next_retry: Some(now),
            response: None,
            error_message: None,
            created_at: now,
            updated_at: now,
            locked_until: Some(lease_until),
        }
    }

    /// Due for an attempt and not leased by anyone.
    pub fn is_claimable(&self, now: DateTime<Utc>) -> bool {
        self.status == DeliveryStatus::Pending
            && self.next_retry.is_some_and(|at| at <= now)
            && self.locked_until.is_none_or(|until| until <= now)
    }

    fn ensure_pending(&self) -> DomainResult<()> {
        if self.status.is_terminal() {
            return Err(DomainError::invariant(format!(
                "delivery {} is already {}",
                self.id, self.status
            )));
        }
        Ok(())
    }

    /// Record a 2xx response.
    pub fn record_success(&mut self, response_body: &str, now: DateTime<Utc>) -> DomainResult<()> {
        self.ensure_pending()?;
        self.attempt_count += 1;
        self.status = DeliveryStatus::Success;
        self.last_attempt = Some(now);
        self.next_retry = None;
        self.response = Some(truncate_response(response_body));
        self.error_message = None;
        self.updated_at = now;
        self.locked_until = None;
        Ok(())
    }

    /// Record a failed attempt and either schedule the next one or give up.
    pub fn record_failure(
        &mut self,
        failure: &AttemptFailure,
        max_attempts: u32,
        policy: &RetryPolicy,
        now: DateTime<Utc>,
    ) -> DomainResult<()> {
        self.ensure_pending()?;
        self.attempt_count += 1;
        self.last_attempt = Some(now);
        self.error_message = Some(failure.to_string());
        if let Some(body) = failure.response_body() {
            self.response = Some(truncate_response(body));
        }
        self.updated_at = now;
        self.locked_until = None;

        if self.attempt_count >= max_attempts {
            self.status = DeliveryStatus::Failed;
            self.next_retry = None;
        } else {
            let delay = policy.delay_for_attempt(self.attempt_count);
            let delay = chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::zero());
            self.next_retry = Some(now + delay);
        }
        Ok(())
    }

    /// Give up without another attempt (endpoint or event vanished).
    pub fn abandon(&mut self, reason: impl Into<String>, now: DateTime<Utc>) -> DomainResult<()> {
        self.ensure_pending()?;
        self.status = DeliveryStatus::Failed;
        self.next_retry = None;
        self.error_message = Some(reason.into());
        self.updated_at = now;
        self.locked_until = None;
        Ok(())
    }
}
