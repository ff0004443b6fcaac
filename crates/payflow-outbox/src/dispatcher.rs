//! `OutboxDispatcher`: claim, publish, mark.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use payflow_core::broker::MessagePublisher;
use payflow_core::claim::Claimed;
use payflow_core::clock::{self, Clock};
use payflow_core::error::DomainError;
use payflow_core::outbox::{OutboxRecord, OutboxStore};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Dispatcher tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatcherConfig {
    /// Records claimed per run.
    pub batch_size: usize,
    /// Delivery attempts before a record is dead-lettered.
    pub max_attempts: u32,
    /// How long a claim is exclusive before another dispatcher may take it.
    /// Must cover a whole batch of broker calls.
    pub claim_lease: Duration,
    /// How long dispatched records are kept.
    pub retention: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            batch_size: 50,
            max_attempts: 5,
            claim_lease: Duration::from_secs(300),
            retention: Duration::from_secs(72 * 3600),
        }
    }
}

/// What one dispatcher run did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchReport {
    /// Records claimed.
    pub claimed: usize,
    /// Records delivered.
    pub dispatched: usize,
    /// Records whose delivery failed.
    pub failed: usize,
    /// Records handed back untouched because an earlier record of their
    /// aggregate failed in the same batch.
    pub released: usize,
    /// Records another dispatcher reclaimed after this run's lease elapsed.
    /// Their outcome belongs to the newer claim and is left alone.
    pub lost: usize,
    /// Store errors while recording results.
    pub errors: usize,
}

/// Folds the result of a finishing write into `tally`, logging what did not
/// land. Returns whether the write applied.
fn settled(
    result: Result<(), DomainError>,
    outbox_id: i64,
    action: &'static str,
    tally: &mut usize,
    report_lost: &mut usize,
    report_errors: &mut usize,
) -> bool {
    match result {
        Ok(()) => {
            *tally += 1;
            true
        }
        Err(DomainError::Conflict(reason)) => {
            warn!(outbox_id, action, %reason, "outbox claim lost to a newer dispatcher");
            *report_lost += 1;
            false
        }
        Err(e) => {
            error!(outbox_id, action, error = %e, "failed to finish outbox record");
            *report_errors += 1;
            false
        }
    }
}

/// Moves outbox records to the broker.
pub struct OutboxDispatcher {
    store: Arc<dyn OutboxStore>,
    publisher: Arc<dyn MessagePublisher>,
    clock: Arc<dyn Clock>,
    config: DispatcherConfig,
    last_dead_letters: AtomicU64,
}

impl OutboxDispatcher {
    /// Creates a dispatcher.
    #[must_use]
    pub fn new(
        store: Arc<dyn OutboxStore>,
        publisher: Arc<dyn MessagePublisher>,
        clock: Arc<dyn Clock>,
        config: DispatcherConfig,
    ) -> Self {
        Self {
            store,
            publisher,
            clock,
            config,
            last_dead_letters: AtomicU64::new(0),
        }
    }

    /// Delivers a batch of records awaiting their first attempt.
    ///
    /// # Errors
    ///
    /// Returns `DomainError` if the batch cannot be claimed. Failures on
    /// individual records are counted in the report instead.
    pub async fn dispatch_pending(&self) -> Result<DispatchReport, DomainError> {
        let records = self
            .store
            .claim_pending(
                self.config.batch_size,
                self.config.max_attempts,
                self.clock.now(),
                self.config.claim_lease,
            )
            .await?;
        Ok(self.deliver(records).await)
    }

    /// Redelivers a batch of failed records that still have attempts left.
    ///
    /// # Errors
    ///
    /// Returns `DomainError` if the batch cannot be claimed.
    pub async fn retry_failed(&self) -> Result<DispatchReport, DomainError> {
        let records = self
            .store
            .claim_retryable(
                self.config.batch_size,
                self.config.max_attempts,
                self.clock.now(),
                self.config.claim_lease,
            )
            .await?;
        Ok(self.deliver(records).await)
    }

    /// Deletes dispatched records older than the retention window.
    ///
    /// # Errors
    ///
    /// Returns `DomainError` if the store fails.
    pub async fn purge_dispatched(&self) -> Result<u64, DomainError> {
        let cutoff = clock::before(self.clock.now(), self.config.retention);
        let purged = self.store.purge_dispatched(cutoff).await?;
        if purged > 0 {
            info!(purged, %cutoff, "purged dispatched outbox records");
        }
        Ok(purged)
    }

    /// Exports the dead-letter population and raises an alert when it grew
    /// since the previous observation.
    ///
    /// # Errors
    ///
    /// Returns `DomainError` if the store fails.
    pub async fn report_dead_letters(&self) -> Result<u64, DomainError> {
        let count = self
            .store
            .count_dead_lettered(self.config.max_attempts)
            .await?;
        #[allow(clippy::cast_precision_loss)]
        metrics::gauge!("payflow_outbox_dead_letter_records").set(count as f64);

        let previous = self.last_dead_letters.swap(count, Ordering::SeqCst);
        if count > previous {
            error!(
                dead_letters = count,
                previous,
                max_attempts = self.config.max_attempts,
                "outbox dead-letter population grew"
            );
        }
        Ok(count)
    }

    async fn deliver(&self, records: Vec<Claimed<OutboxRecord>>) -> DispatchReport {
        let mut report = DispatchReport {
            claimed: records.len(),
            ..DispatchReport::default()
        };
        let mut failed_aggregates: HashSet<Uuid> = HashSet::new();

        for Claimed { record, token } in records {
            if failed_aggregates.contains(&record.aggregate_id) {
                settled(
                    self.store.release(record.id, token).await,
                    record.id,
                    "release",
                    &mut report.released,
                    &mut report.lost,
                    &mut report.errors,
                );
                continue;
            }

            let envelope = record.envelope();
            let partition_key = record.aggregate_id.to_string();
            match self
                .publisher
                .publish(&record.destination, &partition_key, &envelope)
                .await
            {
                Ok(()) => {
                    let marked = settled(
                        self.store
                            .mark_dispatched(record.id, token, self.clock.now())
                            .await,
                        record.id,
                        "mark_dispatched",
                        &mut report.dispatched,
                        &mut report.lost,
                        &mut report.errors,
                    );
                    if marked {
                        debug!(
                            outbox_id = record.id,
                            event_id = %record.event_id,
                            event_type = %record.event_type,
                            destination = %record.destination,
                            "outbox record dispatched"
                        );
                    }
                }
                Err(publish_error) => {
                    failed_aggregates.insert(record.aggregate_id);
                    warn!(
                        outbox_id = record.id,
                        aggregate_id = %record.aggregate_id,
                        attempt = record.attempts + 1,
                        error = %publish_error,
                        "outbox delivery failed"
                    );
                    settled(
                        self.store
                            .mark_failed(record.id, token, &publish_error.to_string())
                            .await,
                        record.id,
                        "mark_failed",
                        &mut report.failed,
                        &mut report.lost,
                        &mut report.errors,
                    );
                }
            }
        }

        metrics::counter!("payflow_outbox_dispatched_total").increment(report.dispatched as u64);
        metrics::counter!("payflow_outbox_failed_total").increment(report.failed as u64);
        if report.claimed > 0 {
            info!(
                claimed = report.claimed,
                dispatched = report.dispatched,
                failed = report.failed,
                released = report.released,
                lost = report.lost,
                errors = report.errors,
                "outbox batch processed"
            );
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use payflow_core::broker::PublishError;
    use payflow_core::event::{EventEnvelope, NewOutboxEvent};
    use payflow_core::outbox::OutboxStatus;
    use payflow_store::InMemoryStore;
    use payflow_test_support::{ManualClock, RecordingPublisher, fixed_now};

    struct Harness {
        store: Arc<InMemoryStore>,
        publisher: Arc<RecordingPublisher>,
        clock: Arc<ManualClock>,
        dispatcher: OutboxDispatcher,
    }

    fn harness(config: DispatcherConfig) -> Harness {
        let store = Arc::new(InMemoryStore::new());
        let publisher = Arc::new(RecordingPublisher::new());
        let clock = Arc::new(ManualClock::default());
        let dispatcher = OutboxDispatcher::new(
            store.clone(),
            publisher.clone(),
            clock.clone(),
            config,
        );
        Harness {
            store,
            publisher,
            clock,
            dispatcher,
        }
    }

    fn event(aggregate_id: Uuid, event_type: &str) -> NewOutboxEvent {
        NewOutboxEvent {
            event_id: Uuid::new_v4(),
            aggregate_id,
            aggregate_type: "payment".into(),
            event_type: event_type.into(),
            destination: "payments.events".into(),
            payload: serde_json::json!({ "amount_cents": 100 }),
            occurred_at: fixed_now(),
        }
    }

    #[tokio::test]
    async fn test_dispatch_pending_publishes_in_order_with_partition_key() {
        // Arrange
        let h = harness(DispatcherConfig::default());
        let aggregate = Uuid::new_v4();
        h.store
            .append_events(&[
                event(aggregate, "payment.created"),
                event(aggregate, "payment.authorized"),
            ])
            .unwrap();

        // Act
        let report = h.dispatcher.dispatch_pending().await.unwrap();

        // Assert
        assert_eq!(report.claimed, 2);
        assert_eq!(report.dispatched, 2);
        assert_eq!(
            h.publisher.event_types_for(aggregate),
            vec!["payment.created", "payment.authorized"]
        );
        let published = h.publisher.published();
        assert!(
            published
                .iter()
                .all(|p| p.partition_key == aggregate.to_string())
        );
        assert!(
            h.store
                .outbox_records()
                .unwrap()
                .iter()
                .all(|r| r.status == OutboxStatus::Dispatched && r.dispatched_at.is_some())
        );
    }

    #[tokio::test]
    async fn test_failure_isolated_per_aggregate_and_later_records_released() {
        // Arrange
        let h = harness(DispatcherConfig::default());
        let broken = Uuid::new_v4();
        let healthy = Uuid::new_v4();
        h.store
            .append_events(&[
                event(broken, "payment.created"),
                event(healthy, "payment.created"),
                event(broken, "payment.authorized"),
            ])
            .unwrap();
        h.publisher.fail_aggregate(broken);

        // Act
        let report = h.dispatcher.dispatch_pending().await.unwrap();

        // Assert
        assert_eq!(report.dispatched, 1);
        assert_eq!(report.failed, 1);
        assert_eq!(report.released, 1);
        let records = h.store.outbox_records().unwrap();
        assert_eq!(records[0].status, OutboxStatus::Failed);
        assert_eq!(records[0].attempts, 1);
        assert!(records[0].last_error.as_deref().unwrap().contains("unavailable"));
        assert_eq!(records[1].status, OutboxStatus::Dispatched);
        assert_eq!(records[2].status, OutboxStatus::Pending);
        assert_eq!(records[2].attempts, 0);
    }

    #[tokio::test]
    async fn test_retry_delivers_failed_record_before_later_ones() {
        // Arrange
        let h = harness(DispatcherConfig::default());
        let aggregate = Uuid::new_v4();
        h.store
            .append_events(&[
                event(aggregate, "payment.created"),
                event(aggregate, "payment.authorized"),
            ])
            .unwrap();
        h.publisher.fail_aggregate(aggregate);
        h.dispatcher.dispatch_pending().await.unwrap();
        h.publisher.heal();

        // Act: the pending run must not overtake the failed record.
        let pending = h.dispatcher.dispatch_pending().await.unwrap();
        let retried = h.dispatcher.retry_failed().await.unwrap();
        let rest = h.dispatcher.dispatch_pending().await.unwrap();

        // Assert
        assert_eq!(pending.claimed, 0);
        assert_eq!(retried.dispatched, 1);
        assert_eq!(rest.dispatched, 1);
        assert_eq!(
            h.publisher.event_types_for(aggregate),
            vec!["payment.created", "payment.authorized"]
        );
    }

    #[tokio::test]
    async fn test_broker_outage_then_recovery_delivers_everything_once_healthy() {
        // Arrange
        let h = harness(DispatcherConfig {
            max_attempts: 3,
            ..DispatcherConfig::default()
        });
        let ids: Vec<Uuid> = (0..3).map(|_| Uuid::new_v4()).collect();
        let events: Vec<NewOutboxEvent> = ids.iter().map(|id| event(*id, "payment.created")).collect();
        h.store.append_events(&events).unwrap();
        h.publisher.set_down(true);

        // Act
        let outage = h.dispatcher.dispatch_pending().await.unwrap();
        h.publisher.set_down(false);
        let recovery = h.dispatcher.retry_failed().await.unwrap();

        // Assert
        assert_eq!(outage.failed, 3);
        assert_eq!(recovery.dispatched, 3);
        assert_eq!(h.publisher.published().len(), 3);
        assert_eq!(h.dispatcher.report_dead_letters().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_exhausted_records_are_dead_lettered_and_never_retried() {
        // Arrange
        let h = harness(DispatcherConfig {
            max_attempts: 2,
            ..DispatcherConfig::default()
        });
        let aggregate = Uuid::new_v4();
        h.store
            .append_events(&[event(aggregate, "payment.created")])
            .unwrap();
        h.publisher.fail_aggregate(aggregate);

        // Act
        h.dispatcher.dispatch_pending().await.unwrap();
        h.dispatcher.retry_failed().await.unwrap();
        let after_budget = h.dispatcher.retry_failed().await.unwrap();
        let dead = h.dispatcher.report_dead_letters().await.unwrap();

        // Assert
        assert_eq!(after_budget.claimed, 0);
        assert_eq!(dead, 1);
        let records = h.store.outbox_records().unwrap();
        assert!(records[0].is_dead_lettered(2));
    }

    #[tokio::test]
    async fn test_abandoned_claim_is_redelivered_after_lease() {
        // Arrange
        let h = harness(DispatcherConfig::default());
        let aggregate = Uuid::new_v4();
        h.store
            .append_events(&[event(aggregate, "payment.created")])
            .unwrap();
        let lease = DispatcherConfig::default().claim_lease;
        // A dispatcher that crashed after claiming.
        OutboxStore::claim_pending(h.store.as_ref(), 10, 5, h.clock.now(), lease)
            .await
            .unwrap();

        // Act
        let during_lease = h.dispatcher.dispatch_pending().await.unwrap();
        h.clock.advance(lease);
        let after_lease = h.dispatcher.dispatch_pending().await.unwrap();

        // Assert
        assert_eq!(during_lease.claimed, 0);
        assert_eq!(after_lease.dispatched, 1);
        assert_eq!(h.publisher.event_types_for(aggregate), vec!["payment.created"]);
    }

    /// A broker call that stalls past the claim lease: meanwhile a second
    /// dispatcher reclaims the records and delivers them, then the stalled
    /// call times out.
    struct StalledPastLease {
        store: Arc<InMemoryStore>,
        clock: Arc<ManualClock>,
        lease: Duration,
    }

    #[async_trait]
    impl MessagePublisher for StalledPastLease {
        async fn publish(
            &self,
            _destination: &str,
            _partition_key: &str,
            _envelope: &EventEnvelope,
        ) -> Result<(), PublishError> {
            self.clock.advance(self.lease);
            let now = self.clock.now();
            let reclaimed = OutboxStore::claim_pending(self.store.as_ref(), 10, 5, now, self.lease)
                .await
                .unwrap();
            for Claimed { record, token } in reclaimed {
                self.store.mark_dispatched(record.id, token, now).await.unwrap();
            }
            Err(PublishError::Transport("timed out".into()))
        }
    }

    #[tokio::test]
    async fn test_stale_dispatcher_does_not_fail_a_record_delivered_by_another() {
        // Arrange
        let store = Arc::new(InMemoryStore::new());
        let clock = Arc::new(ManualClock::default());
        let config = DispatcherConfig::default();
        let publisher = Arc::new(StalledPastLease {
            store: store.clone(),
            clock: clock.clone(),
            lease: config.claim_lease,
        });
        let dispatcher = OutboxDispatcher::new(store.clone(), publisher, clock, config);
        store
            .append_events(&[event(Uuid::new_v4(), "payment.created")])
            .unwrap();

        // Act
        let report = dispatcher.dispatch_pending().await.unwrap();

        // Assert: the stale failure is dropped, not recorded.
        assert_eq!(report.claimed, 1);
        assert_eq!(report.failed, 0);
        assert_eq!(report.lost, 1);
        assert_eq!(report.errors, 0);
        let records = store.outbox_records().unwrap();
        assert_eq!(records[0].status, OutboxStatus::Dispatched);
        assert_eq!(records[0].attempts, 0);
        assert!(records[0].last_error.is_none());
    }

    #[tokio::test]
    async fn test_purge_respects_retention_window() {
        // Arrange
        let h = harness(DispatcherConfig {
            retention: Duration::from_secs(3600),
            ..DispatcherConfig::default()
        });
        h.store
            .append_events(&[event(Uuid::new_v4(), "payment.created")])
            .unwrap();
        h.dispatcher.dispatch_pending().await.unwrap();

        // Act
        let early = h.dispatcher.purge_dispatched().await.unwrap();
        h.clock.advance(Duration::from_secs(3601));
        let late = h.dispatcher.purge_dispatched().await.unwrap();

        // Assert
        assert_eq!(early, 0);
        assert_eq!(late, 1);
        assert!(h.store.outbox_records().unwrap().is_empty());
    }
}
