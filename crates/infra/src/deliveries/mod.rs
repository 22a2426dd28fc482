//! Durable delivery records.
//!
//! ## Leases
//!
//! A record may only be attempted by the worker holding its lease
//! (`locked_until` in the future). `create` hands the lease to the dispatcher
//! that made the record; `claim_due` hands leases to the retry sweeper;
//! `save` persists the attempt result and releases the lease. Together these
//! guarantee that dispatch and sweep never attempt the same row at once, while
//! a crashed worker's rows become claimable again once its lease expires.
//!
//! The lease value doubles as a fencing token. A claim only succeeds once the
//! old lease has expired and always sets a later one, so `save` checks that
//! the stored `locked_until` still equals the lease the caller was given. A
//! holder that overran its lease gets [`DeliveryStoreError::LeaseLost`] and
//! cannot overwrite the new holder's result.

pub mod in_memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

use streamhook_core::{DeliveryId, EventId, WebhookId};
use streamhook_webhooks::{DeliveryStatus, WebhookDelivery};

pub use in_memory::InMemoryDeliveryRecorder;
pub use postgres::PostgresDeliveryRecorder;

/// Default number of records returned by history queries.
pub const DEFAULT_HISTORY_LIMIT: u32 = 50;

/// Delivery store error.
#[derive(Debug, Error)]
pub enum DeliveryStoreError {
    #[error("delivery not found: {0}")]
    NotFound(DeliveryId),

    #[error("delivery already exists: {0}")]
    AlreadyExists(DeliveryId),

    /// The stored record is already terminal; the write was discarded.
    #[error("delivery {0} is no longer pending")]
    NotPending(DeliveryId),

    /// The lease expired and the record was claimed again; the write was discarded.
    #[error("lease on delivery {0} was lost")]
    LeaseLost(DeliveryId),

    #[error("storage error: {0}")]
    Storage(String),
}

/// Delivery counts by status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct DeliveryStats {
    pub total: u64,
    pub successful: u64,
    pub failed: u64,
    pub pending: u64,
    /// `successful / total * 100`, or 0 when there are no deliveries.
    pub success_rate: f64,
}

impl DeliveryStats {
    pub fn from_counts(successful: u64, failed: u64, pending: u64) -> Self {
        let total = successful + failed + pending;
        let success_rate = if total == 0 {
            0.0
        } else {
            successful as f64 / total as f64 * 100.0
        };
        Self {
            total,
            successful,
            failed,
            pending,
            success_rate,
        }
    }

    fn count(&mut self, status: DeliveryStatus) {
        match status {
            DeliveryStatus::Pending => self.pending += 1,
            DeliveryStatus::Success => self.successful += 1,
            DeliveryStatus::Failed => self.failed += 1,
        }
    }
}

/// Storage of delivery records.
#[async_trait]
pub trait DeliveryRecorder: Send + Sync {
    /// Insert a new record (normally pending, leased to the caller).
    async fn create(&self, delivery: &WebhookDelivery) -> Result<(), DeliveryStoreError>;

    /// Persist the outcome of an attempt and release `lease`.
    ///
    /// Fails with [`DeliveryStoreError::NotPending`] if the stored record is
    /// already terminal, and with [`DeliveryStoreError::LeaseLost`] if its
    /// `locked_until` is no longer `lease`.
    async fn save(
        &self,
        delivery: &WebhookDelivery,
        lease: DateTime<Utc>,
    ) -> Result<(), DeliveryStoreError>;

    /// Lease up to `limit` pending records whose `next_retry <= now` and whose
    /// lease has expired, oldest due first. Each returned record carries
    /// `locked_until = lease_until`.
    async fn claim_due(
        &self,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<WebhookDelivery>, DeliveryStoreError>;

    async fn get(&self, id: DeliveryId) -> Result<Option<WebhookDelivery>, DeliveryStoreError>;

    /// Most recent deliveries to one endpoint, newest first.
    async fn list_for_webhook(
        &self,
        webhook_id: WebhookId,
        limit: u32,
    ) -> Result<Vec<WebhookDelivery>, DeliveryStoreError>;

    /// All deliveries of one event, oldest first.
    async fn list_for_event(
        &self,
        event_id: EventId,
    ) -> Result<Vec<WebhookDelivery>, DeliveryStoreError>;

    /// Counts by status, for one endpoint or across all of them.
    async fn stats(&self, webhook_id: Option<WebhookId>)
    -> Result<DeliveryStats, DeliveryStoreError>;
}

fn history_limit(limit: u32) -> u32 {
    if limit == 0 {
        DEFAULT_HISTORY_LIMIT
    } else {
        limit.min(crate::event_store::query::MAX_LIMIT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn success_rate_is_a_percentage() {
        let stats = DeliveryStats::from_counts(3, 1, 0);
        assert_eq!(stats.total, 4);
        assert!((stats.success_rate - 75.0).abs() < f64::EPSILON);
        assert_eq!(DeliveryStats::default().success_rate, 0.0);
        assert_eq!(DeliveryStats::from_counts(0, 0, 0).success_rate, 0.0);
    }

    #[test]
    fn history_limit_defaults_and_caps() {
        assert_eq!(history_limit(0), 50);
        assert_eq!(history_limit(10), 10);
        assert_eq!(history_limit(50_000), 1000);
    }
}
