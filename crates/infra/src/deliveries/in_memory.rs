use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use streamhook_core::{DeliveryId, EventId, WebhookId};
use streamhook_webhooks::WebhookDelivery;

use super::{DeliveryRecorder, DeliveryStats, DeliveryStoreError, history_limit};

/// In-memory delivery recorder for tests/dev.
///
/// Claims take the write lock, so a record can never be leased twice.
#[derive(Debug, Default)]
pub struct InMemoryDeliveryRecorder {
    deliveries: RwLock<HashMap<DeliveryId, WebhookDelivery>>,
}

impl InMemoryDeliveryRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every stored record, oldest first.
    pub fn all(&self) -> Result<Vec<WebhookDelivery>, DeliveryStoreError> {
        let mut all: Vec<_> = self
            .deliveries
            .read()
            .map_err(|_| poisoned())?
            .values()
            .cloned()
            .collect();
        all.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(all)
    }
}

fn poisoned() -> DeliveryStoreError {
    DeliveryStoreError::Storage("lock poisoned".to_string())
}

#[async_trait]
impl DeliveryRecorder for InMemoryDeliveryRecorder {
    async fn create(&self, delivery: &WebhookDelivery) -> Result<(), DeliveryStoreError> {
        let mut deliveries = self.deliveries.write().map_err(|_| poisoned())?;
        if deliveries.contains_key(&delivery.id) {
            return Err(DeliveryStoreError::AlreadyExists(delivery.id));
        }
        deliveries.insert(delivery.id, delivery.clone());
        Ok(())
    }

    async fn save(
        &self,
        delivery: &WebhookDelivery,
        lease: DateTime<Utc>,
    ) -> Result<(), DeliveryStoreError> {
        let mut deliveries = self.deliveries.write().map_err(|_| poisoned())?;
        let stored = deliveries
            .get_mut(&delivery.id)
            .ok_or(DeliveryStoreError::NotFound(delivery.id))?;
        if stored.status.is_terminal() {
            return Err(DeliveryStoreError::NotPending(delivery.id));
        }
        if stored.locked_until != Some(lease) {
            return Err(DeliveryStoreError::LeaseLost(delivery.id));
        }
        *stored = WebhookDelivery {
            locked_until: None,
            ..delivery.clone()
        };
        Ok(())
    }

    async fn claim_due(
        &self,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<WebhookDelivery>, DeliveryStoreError> {
        let mut deliveries = self.deliveries.write().map_err(|_| poisoned())?;

        let mut due: Vec<&mut WebhookDelivery> = deliveries
            .values_mut()
            .filter(|d| d.is_claimable(now))
            .collect();
        due.sort_by(|a, b| a.next_retry.cmp(&b.next_retry).then(a.id.cmp(&b.id)));

        Ok(due
            .into_iter()
            .take(limit as usize)
            .map(|d| {
                d.locked_until = Some(lease_until);
                d.clone()
            })
            .collect())
    }

    async fn get(&self, id: DeliveryId) -> Result<Option<WebhookDelivery>, DeliveryStoreError> {
        Ok(self.deliveries.read().map_err(|_| poisoned())?.get(&id).cloned())
    }

    async fn list_for_webhook(
        &self,
        webhook_id: WebhookId,
        limit: u32,
    ) -> Result<Vec<WebhookDelivery>, DeliveryStoreError> {
        let mut matching: Vec<_> = self
            .all()?
            .into_iter()
            .filter(|d| d.webhook_id == webhook_id)
            .collect();
        matching.reverse();
        matching.truncate(history_limit(limit) as usize);
        Ok(matching)
    }

    async fn list_for_event(
        &self,
        event_id: EventId,
    ) -> Result<Vec<WebhookDelivery>, DeliveryStoreError> {
        Ok(self
            .all()?
            .into_iter()
            .filter(|d| d.event_id == event_id)
            .collect())
    }

    async fn stats(
        &self,
        webhook_id: Option<WebhookId>,
    ) -> Result<DeliveryStats, DeliveryStoreError> {
        let mut stats = DeliveryStats::default();
        for delivery in self.deliveries.read().map_err(|_| poisoned())?.values() {
            if webhook_id.is_none_or(|id| delivery.webhook_id == id) {
                stats.count(delivery.status);
            }
        }
        Ok(DeliveryStats::from_counts(
            stats.successful,
            stats.failed,
            stats.pending,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use streamhook_webhooks::{AttemptFailure, DeliveryStatus, RetryPolicy};

    fn lease_of(now: DateTime<Utc>) -> DateTime<Utc> {
        now + Duration::seconds(60)
    }

    fn leased(now: DateTime<Utc>) -> WebhookDelivery {
        WebhookDelivery::new(WebhookId::new(), EventId::new(), now, lease_of(now))
    }

    #[tokio::test]
    async fn claim_skips_leased_terminal_and_future_rows() {
        let store = InMemoryDeliveryRecorder::new();
        let now = Utc::now();

        // Leased by its creator.
        let in_flight = leased(now);
        store.create(&in_flight).await.unwrap();

        // Failed once, retry due in 1s.
        let mut scheduled = leased(now);
        store.create(&scheduled).await.unwrap();
        scheduled
            .record_failure(&AttemptFailure::transport("down"), 3, &RetryPolicy::default(), now)
            .unwrap();
        store.save(&scheduled, lease_of(now)).await.unwrap();

        // Delivered.
        let mut done = leased(now);
        store.create(&done).await.unwrap();
        done.record_success("ok", now).unwrap();
        store.save(&done, lease_of(now)).await.unwrap();

        let lease = now + Duration::seconds(90);
        assert!(store.claim_due(now, lease, 10).await.unwrap().is_empty());

        let later = now + Duration::seconds(2);
        let claimed = store.claim_due(later, lease, 10).await.unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].id, scheduled.id);
        assert_eq!(claimed[0].locked_until, Some(lease));

        // Already leased: a second sweep gets nothing.
        assert!(store.claim_due(later, lease, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn expired_leases_are_reclaimable() {
        let store = InMemoryDeliveryRecorder::new();
        let now = Utc::now();
        let orphan = leased(now);
        store.create(&orphan).await.unwrap();

        let after_lease = now + Duration::seconds(61);
        let claimed = store
            .claim_due(after_lease, after_lease + Duration::seconds(60), 10)
            .await
            .unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].attempt_count, 0);
    }

    #[tokio::test]
    async fn claim_respects_limit_and_due_order() {
        let store = InMemoryDeliveryRecorder::new();
        let now = Utc::now();
        let mut ids = Vec::new();
        for offset in [3, 1, 2] {
            let mut d = leased(now - Duration::seconds(offset));
            d.locked_until = None;
            ids.push((offset, d.id));
            store.create(&d).await.unwrap();
        }

        let claimed = store.claim_due(now, now + Duration::seconds(30), 2).await.unwrap();
        let claimed_ids: Vec<_> = claimed.iter().map(|d| d.id).collect();
        let oldest = ids.iter().find(|(o, _)| *o == 3).unwrap().1;
        let middle = ids.iter().find(|(o, _)| *o == 2).unwrap().1;
        assert_eq!(claimed_ids, vec![oldest, middle]);
    }

    #[tokio::test]
    async fn save_releases_lease_and_rejects_terminal_rows() {
        let store = InMemoryDeliveryRecorder::new();
        let now = Utc::now();
        let mut d = leased(now);
        store.create(&d).await.unwrap();

        d.record_success("ok", now).unwrap();
        store.save(&d, lease_of(now)).await.unwrap();
        let stored = store.get(d.id).await.unwrap().unwrap();
        assert_eq!(stored.status, DeliveryStatus::Success);
        assert_eq!(stored.locked_until, None);

        assert!(matches!(
            store.save(&d, lease_of(now)).await,
            Err(DeliveryStoreError::NotPending(_))
        ));
    }

    #[tokio::test]
    async fn overrun_holder_cannot_overwrite_the_new_holder() {
        let store = InMemoryDeliveryRecorder::new();
        let now = Utc::now();
        let mut creator_copy = leased(now);
        store.create(&creator_copy).await.unwrap();

        // The creator overruns its lease and the record is claimed again.
        let after_lease = lease_of(now) + Duration::seconds(1);
        let new_lease = after_lease + Duration::seconds(60);
        let mut sweeper_copy = store.claim_due(after_lease, new_lease, 10).await.unwrap().remove(0);

        let policy = RetryPolicy::default();
        let failure = AttemptFailure::rejected(500, "down");
        creator_copy.record_failure(&failure, 5, &policy, after_lease).unwrap();
        sweeper_copy.record_failure(&failure, 5, &policy, after_lease).unwrap();

        assert!(matches!(
            store.save(&creator_copy, lease_of(now)).await,
            Err(DeliveryStoreError::LeaseLost(_))
        ));
        store.save(&sweeper_copy, new_lease).await.unwrap();
        assert!(matches!(
            store.save(&creator_copy, lease_of(now)).await,
            Err(DeliveryStoreError::LeaseLost(_))
        ));

        let stored = store.get(sweeper_copy.id).await.unwrap().unwrap();
        assert_eq!(stored.attempt_count, 1);
        assert_eq!(stored, WebhookDelivery { locked_until: None, ..sweeper_copy });
    }

    #[tokio::test]
    async fn history_and_stats_per_webhook() {
        let store = InMemoryDeliveryRecorder::new();
        let webhook = WebhookId::new();
        let now = Utc::now();

        for i in 0..4 {
            let created = now + Duration::seconds(i);
            let mut d = WebhookDelivery::new(webhook, EventId::new(), created, created);
            store.create(&d).await.unwrap();
            if i < 3 {
                d.record_success("ok", created).unwrap();
                store.save(&d, created).await.unwrap();
            }
        }
        store.create(&leased(now)).await.unwrap();

        let history = store.list_for_webhook(webhook, 2).await.unwrap();
        assert_eq!(history.len(), 2);
        assert!(history[0].created_at > history[1].created_at);

        let stats = store.stats(Some(webhook)).await.unwrap();
        assert_eq!((stats.total, stats.successful, stats.pending), (4, 3, 1));
        assert!((stats.success_rate - 75.0).abs() < 1e-9);

        assert_eq!(store.stats(None).await.unwrap().total, 5);
    }
}
