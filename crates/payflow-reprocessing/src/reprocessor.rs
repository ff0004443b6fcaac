//! `Reprocessor`: one scheduler pass over pending records of one kind.

use std::sync::Arc;
use std::time::Duration;

use payflow_core::authorizer::{AuthorizationGateway, AuthorizationStatus};
use payflow_core::claim::Claimed;
use payflow_core::clock::Clock;
use payflow_core::error::DomainError;
use payflow_core::event::NewOutboxEvent;
use payflow_core::reprocess::{Reprocessable, ReprocessingStore};
use tracing::{error, info, warn};

/// Scheduler tuning for one record kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReprocessorConfig {
    /// Records claimed per run.
    pub batch_size: usize,
    /// Attempts after which a pending record is left alone. The attempt made
    /// when the record was created counts toward it.
    pub max_attempts: u32,
    /// How long a claimed record is hidden from other schedulers. Must cover
    /// a whole batch of gateway calls; a save after the lease was taken over
    /// is rejected.
    pub claim_lease: Duration,
    /// Topic that status-changed events are addressed to.
    pub destination: String,
}

/// What one run did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReprocessReport {
    /// Records claimed.
    pub claimed: usize,
    /// Records that became authorized.
    pub authorized: usize,
    /// Records that were denied.
    pub denied: usize,
    /// Records that are still pending after this attempt.
    pub still_pending: usize,
    /// Records another scheduler reclaimed before this run saved them. Their
    /// attempt is discarded.
    pub lost: usize,
    /// Records whose attempt could not be saved.
    pub errors: usize,
    /// Pending records that exhausted their attempts.
    pub dead_lettered: u64,
}

/// Re-drives pending records of kind `R` through the gateway.
pub struct Reprocessor<R: Reprocessable> {
    store: Arc<dyn ReprocessingStore<R>>,
    gateway: Arc<dyn AuthorizationGateway>,
    clock: Arc<dyn Clock>,
    config: ReprocessorConfig,
}

impl<R: Reprocessable> Reprocessor<R> {
    /// Creates a scheduler for `R`.
    #[must_use]
    pub fn new(
        store: Arc<dyn ReprocessingStore<R>>,
        gateway: Arc<dyn AuthorizationGateway>,
        clock: Arc<dyn Clock>,
        config: ReprocessorConfig,
    ) -> Self {
        Self {
            store,
            gateway,
            clock,
            config,
        }
    }

    /// Runs one pass.
    ///
    /// # Errors
    ///
    /// Returns `DomainError` if the dead-letter count or the claim fails.
    /// Failures on individual records are counted in the report.
    pub async fn run_once(&self) -> Result<ReprocessReport, DomainError> {
        let dead_lettered = self.store.count_exhausted(self.config.max_attempts).await?;
        #[allow(clippy::cast_precision_loss)]
        metrics::gauge!("payflow_reprocessing_dead_letter_records", "kind" => R::KIND)
            .set(dead_lettered as f64);
        if dead_lettered > 0 {
            warn!(
                kind = R::KIND,
                dead_lettered,
                max_attempts = self.config.max_attempts,
                "pending records exhausted their attempts"
            );
        }

        let claimed = self
            .store
            .claim_pending(
                self.config.batch_size,
                self.config.max_attempts,
                self.clock.now(),
                self.config.claim_lease,
            )
            .await?;

        let mut report = ReprocessReport {
            claimed: claimed.len(),
            dead_lettered,
            ..ReprocessReport::default()
        };

        for Claimed { mut record, token } in claimed {
            let outcome = self
                .gateway
                .authorize(&record.authorization_request())
                .await;
            let now = self.clock.now();
            let event = record
                .record_attempt(&outcome, now)
                .map(|event| NewOutboxEvent::from_event(&event, &self.config.destination, now));

            match self.store.save_attempt(&record, token, event).await {
                Ok(()) => {}
                Err(DomainError::Conflict(reason)) => {
                    warn!(
                        kind = R::KIND,
                        id = %record.id(),
                        %reason,
                        "claim lapsed before the attempt was saved, discarding it"
                    );
                    report.lost += 1;
                    continue;
                }
                Err(e) => {
                    error!(
                        kind = R::KIND,
                        id = %record.id(),
                        error = %e,
                        "failed to save reprocessing attempt"
                    );
                    report.errors += 1;
                    continue;
                }
            }

            match record.status() {
                AuthorizationStatus::Authorized => report.authorized += 1,
                AuthorizationStatus::Denied => report.denied += 1,
                AuthorizationStatus::Pending => report.still_pending += 1,
            }
            info!(
                kind = R::KIND,
                id = %record.id(),
                status = %record.status(),
                attempts = record.attempts(),
                "reprocessing attempt recorded"
            );
        }

        metrics::counter!("payflow_reprocessing_attempts_total", "kind" => R::KIND)
            .increment(report.claimed as u64);
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use payflow_core::authorizer::{AuthorizationOutcome, AuthorizationRequest};
    use payflow_core::outbox::OutboxRecord;
    use payflow_payments::domain::aggregates::{Payment, Refund};
    use payflow_payments::domain::commands::{CreatePayment, CreateRefund};
    use payflow_payments::domain::repository::{PaymentRepository, RefundRepository};
    use payflow_store::InMemoryStore;
    use payflow_test_support::{ManualClock, StaticGateway, fixed_now};
    use uuid::Uuid;

    fn config() -> ReprocessorConfig {
        ReprocessorConfig {
            batch_size: 10,
            max_attempts: 3,
            claim_lease: Duration::from_secs(120),
            destination: "payments.events".into(),
        }
    }

    fn approved() -> AuthorizationOutcome {
        AuthorizationOutcome::Authorized {
            nsu: "000042".into(),
            authorization_code: "AUTH42".into(),
        }
    }

    fn pending_payment(order_id: &str, attempts: u32) -> Payment {
        let mut payment = Payment::new(
            Uuid::new_v4(),
            &CreatePayment {
                order_id: order_id.into(),
                card_token: "tok_visa_4242".into(),
                amount_cents: 10_000,
                currency: "BRL".into(),
                description: "order".into(),
            },
            fixed_now(),
        );
        for _ in 0..attempts {
            payment.record_attempt(&AuthorizationOutcome::Pending, fixed_now());
        }
        payment
    }

    fn payment_reprocessor(
        store: &Arc<InMemoryStore>,
        gateway: &Arc<StaticGateway>,
        clock: &Arc<ManualClock>,
    ) -> Reprocessor<Payment> {
        Reprocessor::new(store.clone(), gateway.clone(), clock.clone(), config())
    }

    fn outbox_types(store: &InMemoryStore) -> Vec<String> {
        store
            .outbox_records()
            .unwrap()
            .into_iter()
            .map(|r: OutboxRecord| r.event_type)
            .collect()
    }

    #[tokio::test]
    async fn test_pending_payment_is_authorized_and_event_emitted() {
        // Arrange
        let store = Arc::new(InMemoryStore::new());
        let gateway = Arc::new(StaticGateway::new(approved()));
        let clock = Arc::new(ManualClock::default());
        let payment = pending_payment("order-1", 1);
        store.insert_payment(&payment, &[]).await.unwrap();
        let reprocessor = payment_reprocessor(&store, &gateway, &clock);

        // Act
        let report = reprocessor.run_once().await.unwrap();

        // Assert
        assert_eq!(report.claimed, 1);
        assert_eq!(report.authorized, 1);
        let loaded = store.find_payment(payment.id).await.unwrap().unwrap();
        assert_eq!(loaded.authorization.status, AuthorizationStatus::Authorized);
        assert_eq!(loaded.authorization.attempts, 2);
        assert_eq!(loaded.authorization.nsu.as_deref(), Some("000042"));
        assert_eq!(outbox_types(&store), vec!["payment.authorized"]);
        let records = store.outbox_records().unwrap();
        assert_eq!(records[0].destination, "payments.events");
        assert_eq!(records[0].aggregate_id, payment.id);
    }

    #[tokio::test]
    async fn test_still_pending_counts_attempt_without_event() {
        // Arrange
        let store = Arc::new(InMemoryStore::new());
        let gateway = Arc::new(StaticGateway::new(AuthorizationOutcome::Pending));
        let clock = Arc::new(ManualClock::default());
        let payment = pending_payment("order-1", 1);
        store.insert_payment(&payment, &[]).await.unwrap();
        let reprocessor = payment_reprocessor(&store, &gateway, &clock);

        // Act
        let report = reprocessor.run_once().await.unwrap();

        // Assert
        assert_eq!(report.still_pending, 1);
        let loaded = store.find_payment(payment.id).await.unwrap().unwrap();
        assert_eq!(loaded.authorization.status, AuthorizationStatus::Pending);
        assert_eq!(loaded.authorization.attempts, 2);
        assert!(outbox_types(&store).is_empty());
    }

    #[tokio::test]
    async fn test_denial_is_terminal() {
        // Arrange
        let store = Arc::new(InMemoryStore::new());
        let gateway = Arc::new(StaticGateway::new(AuthorizationOutcome::Denied {
            reason: "insufficient funds".into(),
        }));
        let clock = Arc::new(ManualClock::default());
        store
            .insert_payment(&pending_payment("order-1", 1), &[])
            .await
            .unwrap();
        let reprocessor = payment_reprocessor(&store, &gateway, &clock);

        // Act
        let first = reprocessor.run_once().await.unwrap();
        let second = reprocessor.run_once().await.unwrap();

        // Assert
        assert_eq!(first.denied, 1);
        assert_eq!(second.claimed, 0);
        assert_eq!(outbox_types(&store), vec!["payment.denied"]);
        assert_eq!(gateway.requests().len(), 1);
    }

    #[tokio::test]
    async fn test_attempts_are_bounded_and_exhausted_records_left_alone() {
        // Arrange
        let store = Arc::new(InMemoryStore::new());
        let gateway = Arc::new(StaticGateway::new(AuthorizationOutcome::Pending));
        let clock = Arc::new(ManualClock::default());
        let payment = pending_payment("order-1", 1);
        store.insert_payment(&payment, &[]).await.unwrap();
        let reprocessor = payment_reprocessor(&store, &gateway, &clock);

        // Act
        let mut reports = Vec::new();
        for _ in 0..4 {
            reports.push(reprocessor.run_once().await.unwrap());
        }

        // Assert: attempts go 1 -> 2 -> 3, then the record is exhausted.
        assert_eq!(reports[0].claimed, 1);
        assert_eq!(reports[1].claimed, 1);
        assert_eq!(reports[2].claimed, 0);
        assert_eq!(reports[2].dead_lettered, 1);
        assert_eq!(reports[3].claimed, 0);
        assert_eq!(gateway.requests().len(), 2);
        let loaded = store.find_payment(payment.id).await.unwrap().unwrap();
        assert_eq!(loaded.authorization.attempts, 3);
        assert_eq!(loaded.authorization.status, AuthorizationStatus::Pending);
    }

    /// An acquirer call that outlives the claim lease: while it hangs, a
    /// second scheduler reclaims the record and gets it authorized. The slow
    /// call itself then times out as pending.
    struct OutlivesLease {
        store: Arc<InMemoryStore>,
        clock: Arc<ManualClock>,
    }

    #[async_trait]
    impl AuthorizationGateway for OutlivesLease {
        async fn authorize(&self, _request: &AuthorizationRequest) -> AuthorizationOutcome {
            self.clock.advance(config().claim_lease + Duration::from_secs(1));
            let now = self.clock.now();
            let reclaimed = ReprocessingStore::<Payment>::claim_pending(
                self.store.as_ref(),
                10,
                3,
                now,
                config().claim_lease,
            )
            .await
            .unwrap();
            for Claimed { mut record, token } in reclaimed {
                record.record_attempt(&approved(), now);
                ReprocessingStore::<Payment>::save_attempt(self.store.as_ref(), &record, token, None)
                    .await
                    .unwrap();
            }
            AuthorizationOutcome::Pending
        }
    }

    #[tokio::test]
    async fn test_attempt_saved_after_lease_takeover_is_discarded() {
        // Arrange
        let store = Arc::new(InMemoryStore::new());
        let clock = Arc::new(ManualClock::default());
        let gateway = Arc::new(OutlivesLease {
            store: store.clone(),
            clock: clock.clone(),
        });
        let payment = pending_payment("order-1", 1);
        store.insert_payment(&payment, &[]).await.unwrap();
        let reprocessor = Reprocessor::<Payment>::new(store.clone(), gateway, clock, config());

        // Act
        let report = reprocessor.run_once().await.unwrap();

        // Assert: the newer authorization stands.
        assert_eq!(report.claimed, 1);
        assert_eq!(report.lost, 1);
        assert_eq!(report.still_pending, 0);
        assert_eq!(report.errors, 0);
        let loaded = store.find_payment(payment.id).await.unwrap().unwrap();
        assert_eq!(loaded.authorization.status, AuthorizationStatus::Authorized);
        assert_eq!(loaded.authorization.attempts, 2);
    }

    #[tokio::test]
    async fn test_only_pending_records_are_claimed() {
        // Arrange
        let store = Arc::new(InMemoryStore::new());
        let gateway = Arc::new(StaticGateway::new(approved()));
        let clock = Arc::new(ManualClock::default());
        let mut settled = pending_payment("order-1", 0);
        settled.record_attempt(&approved(), fixed_now());
        store.insert_payment(&settled, &[]).await.unwrap();
        let reprocessor = payment_reprocessor(&store, &gateway, &clock);

        // Act
        let report = reprocessor.run_once().await.unwrap();

        // Assert
        assert_eq!(report.claimed, 0);
        assert!(gateway.requests().is_empty());
    }

    #[tokio::test]
    async fn test_authorized_refund_updates_payment_refunded_total() {
        // Arrange
        let store = Arc::new(InMemoryStore::new());
        let gateway = Arc::new(StaticGateway::new(approved()));
        let clock = Arc::new(ManualClock::default());
        let mut payment = pending_payment("order-1", 0);
        payment.record_attempt(&approved(), fixed_now());
        store.insert_payment(&payment, &[]).await.unwrap();
        let mut refund = Refund::new(
            Uuid::new_v4(),
            &payment,
            &CreateRefund {
                payment_id: payment.id,
                amount_cents: 2_500,
                reason: "damaged".into(),
            },
            fixed_now(),
        );
        refund.record_attempt(&AuthorizationOutcome::Pending, fixed_now());
        store.insert_refund(&refund, &[]).await.unwrap();
        let reprocessor: Reprocessor<Refund> = Reprocessor::new(
            store.clone(),
            gateway.clone(),
            clock.clone(),
            ReprocessorConfig {
                destination: "refunds.events".into(),
                ..config()
            },
        );

        // Act
        let report = reprocessor.run_once().await.unwrap();

        // Assert
        assert_eq!(report.authorized, 1);
        let loaded = store.find_payment(payment.id).await.unwrap().unwrap();
        assert_eq!(loaded.refunded_cents, 2_500);
        assert_eq!(store.pending_refund_cents(payment.id).await.unwrap(), 0);
        let records = store.outbox_records().unwrap();
        assert_eq!(records[0].event_type, "refund.authorized");
        assert_eq!(records[0].destination, "refunds.events");
    }
}
