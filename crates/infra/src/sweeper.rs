//! Background retry of due deliveries.
//!
//! Every `interval` (or on [`SweeperHandle::trigger`]) the sweeper leases up to
//! `batch_size` pending records whose `next_retry` has passed, re-resolves the
//! endpoint and event for each, and makes one more attempt. Records whose
//! endpoint or event no longer exists are marked failed.
//!
//! Leases make sweeping safe to run next to live dispatch and in several
//! processes at once: a record is only ever attempted by the holder of its
//! lease.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Notify, watch};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use streamhook_core::Clock;
use streamhook_webhooks::WebhookDelivery;

use crate::deliveries::DeliveryRecorder;
use crate::delivery::{AttemptOutcome, DeliveryEngine, DeliveryError};
use crate::event_store::EventLog;
use crate::subscriptions::SubscriptionIndex;

pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(60);
pub const DEFAULT_SWEEP_BATCH_SIZE: u32 = 100;

#[derive(Debug, Clone, Copy)]
pub struct SweeperConfig {
    pub interval: Duration,
    /// Maximum records claimed per sweep.
    pub batch_size: u32,
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            interval: DEFAULT_SWEEP_INTERVAL,
            batch_size: DEFAULT_SWEEP_BATCH_SIZE,
        }
    }
}

/// Result of one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub claimed: usize,
    pub succeeded: usize,
    pub rescheduled: usize,
    pub failed: usize,
    /// Endpoint or event was gone; marked failed without an attempt.
    pub abandoned: usize,
    pub errored: usize,
}

enum Retried {
    Attempted(AttemptOutcome),
    Abandoned,
}

impl SweepReport {
    fn record(&mut self, result: Result<Retried, DeliveryError>) {
        match result {
            Ok(Retried::Attempted(AttemptOutcome::Succeeded)) => self.succeeded += 1,
            Ok(Retried::Attempted(AttemptOutcome::Retrying)) => self.rescheduled += 1,
            Ok(Retried::Attempted(AttemptOutcome::Failed)) => self.failed += 1,
            Ok(Retried::Abandoned) => self.abandoned += 1,
            Err(err) => {
                error!(error = %err, "retry attempt errored");
                self.errored += 1;
            }
        }
    }
}

pub struct RetrySweeper {
    recorder: Arc<dyn DeliveryRecorder>,
    log: Arc<dyn EventLog>,
    subscriptions: Arc<dyn SubscriptionIndex>,
    engine: Arc<DeliveryEngine>,
    clock: Arc<dyn Clock>,
    config: SweeperConfig,
}

impl std::fmt::Debug for RetrySweeper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetrySweeper")
            .field("engine", &self.engine)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl RetrySweeper {
    pub fn new(
        recorder: Arc<dyn DeliveryRecorder>,
        log: Arc<dyn EventLog>,
        subscriptions: Arc<dyn SubscriptionIndex>,
        engine: Arc<DeliveryEngine>,
        clock: Arc<dyn Clock>,
        config: SweeperConfig,
    ) -> Self {
        Self {
            recorder,
            log,
            subscriptions,
            engine,
            clock,
            config,
        }
    }

    /// Claim and attempt every due delivery, up to one batch.
    ///
    /// Attempts run concurrently. Also the entry point for a manual retry.
    pub async fn retry_due(self: &Arc<Self>) -> Result<SweepReport, DeliveryError> {
        let now = self.clock.now();
        let claimed = self
            .recorder
            .claim_due(now, self.engine.lease_until(now), self.config.batch_size)
            .await?;

        let mut report = SweepReport {
            claimed: claimed.len(),
            ..SweepReport::default()
        };
        if claimed.is_empty() {
            return Ok(report);
        }
        debug!(claimed = claimed.len(), "retrying due deliveries");

        let mut tasks = JoinSet::new();
        for delivery in claimed {
            let sweeper = Arc::clone(self);
            tasks.spawn(async move { sweeper.retry_one(delivery).await });
        }
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(result) => report.record(result),
                Err(join_err) => {
                    error!(error = %join_err, "retry task panicked");
                    report.errored += 1;
                }
            }
        }
        Ok(report)
    }

    async fn retry_one(&self, delivery: WebhookDelivery) -> Result<Retried, DeliveryError> {
        let Some(endpoint) = self.subscriptions.get(delivery.webhook_id).await? else {
            self.engine
                .abandon(delivery, "webhook endpoint no longer exists")
                .await?;
            return Ok(Retried::Abandoned);
        };
        let Some(event) = self.log.get(delivery.event_id).await? else {
            self.engine.abandon(delivery, "event no longer exists").await?;
            return Ok(Retried::Abandoned);
        };

        self.engine
            .attempt(delivery, &endpoint, &event)
            .await
            .map(|delivery| Retried::Attempted(AttemptOutcome::of(&delivery)))
    }

    /// Run sweeps in the background until the handle is shut down.
    ///
    /// The first sweep runs immediately, which picks up records orphaned by a
    /// previous process once their leases have expired.
    pub fn spawn(self: Arc<Self>) -> SweeperHandle {
        let cancel = CancellationToken::new();
        let trigger = Arc::new(Notify::new());
        let (reports_tx, reports) = watch::channel(SweepReport::default());

        let join = tokio::spawn(self.run(cancel.clone(), Arc::clone(&trigger), reports_tx));

        SweeperHandle {
            cancel,
            trigger,
            join,
            reports,
        }
    }

    async fn run(
        self: Arc<Self>,
        cancel: CancellationToken,
        trigger: Arc<Notify>,
        reports: watch::Sender<SweepReport>,
    ) {
        info!(
            interval_secs = self.config.interval.as_secs(),
            batch_size = self.config.batch_size,
            "retry sweeper started"
        );

        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = trigger.notified() => {}
                _ = ticker.tick() => {}
            }

            match self.retry_due().await {
                Ok(report) => {
                    if report.claimed > 0 {
                        info!(
                            claimed = report.claimed,
                            succeeded = report.succeeded,
                            rescheduled = report.rescheduled,
                            failed = report.failed,
                            abandoned = report.abandoned,
                            errored = report.errored,
                            "retry sweep finished"
                        );
                    }
                    reports.send_replace(report);
                }
                Err(err) => error!(error = %err, "retry sweep failed"),
            }
        }

        info!("retry sweeper stopped");
    }
}

/// Control handle for a spawned [`RetrySweeper`].
#[derive(Debug)]
pub struct SweeperHandle {
    cancel: CancellationToken,
    trigger: Arc<Notify>,
    join: JoinHandle<()>,
    reports: watch::Receiver<SweepReport>,
}

impl SweeperHandle {
    /// Run a sweep now instead of waiting for the next tick.
    pub fn trigger(&self) {
        self.trigger.notify_one();
    }

    /// Receiver that observes the report of every completed sweep.
    pub fn reports(&self) -> watch::Receiver<SweepReport> {
        self.reports.clone()
    }

    /// Stop sweeping. A sweep in progress finishes first.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        if let Err(err) = self.join.await {
            error!(error = %err, "retry sweeper task failed");
        }
    }
}
