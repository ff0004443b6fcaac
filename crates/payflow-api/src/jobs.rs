//! Background jobs: outbox dispatch and housekeeping, idempotency expiry and
//! the reprocessing schedulers.
//!
//! Each job is a tokio task ticking at a fixed period. A tick runs one pass
//! to completion; ticks missed while a pass was running are delayed rather
//! than replayed in a burst. All jobs stop on the shared [`Shutdown`]
//! signal.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use payflow_core::error::DomainError;
use payflow_idempotency::IdempotencyCache;
use payflow_outbox::OutboxDispatcher;
use payflow_payments::domain::aggregates::{Payment, Refund};
use payflow_reprocessing::Reprocessor;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tracing::{Instrument, error, info, info_span};

/// Coordinator for graceful shutdown of the background jobs.
pub struct Shutdown {
    tx: broadcast::Sender<()>,
}

impl Shutdown {
    /// Creates a coordinator.
    #[must_use]
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(1);
        Self { tx }
    }

    /// Subscribes to the shutdown signal.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.tx.subscribe()
    }

    /// Signals every subscriber.
    pub fn trigger(&self) {
        let _ = self.tx.send(());
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

/// Runs `job` every `period` until `shutdown` fires. Errors are logged and
/// the job keeps its schedule.
pub fn spawn_periodic<F, Fut>(
    name: &'static str,
    period: Duration,
    mut shutdown: broadcast::Receiver<()>,
    job: F,
) -> JoinHandle<()>
where
    F: Fn() -> Fut + Send + 'static,
    Fut: Future<Output = Result<(), DomainError>> + Send + 'static,
{
    tokio::spawn(async move {
        let mut ticker = time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(job = name, period_ms = period.as_millis(), "job started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let run = job().instrument(info_span!("job", job = name));
                    if let Err(e) = run.await {
                        metrics::counter!("payflow_job_failures_total", "job" => name).increment(1);
                        error!(job = name, error = %e, "job run failed");
                    }
                }
                _ = shutdown.recv() => {
                    info!(job = name, "job received shutdown signal, exiting loop");
                    break;
                }
            }
        }
    })
}

/// Everything the background jobs drive.
pub struct Workers {
    /// Outbox dispatcher.
    pub dispatcher: Arc<OutboxDispatcher>,
    /// Idempotency cache, for the expiry sweep.
    pub idempotency: Arc<IdempotencyCache>,
    /// Payment scheduler.
    pub payments: Arc<Reprocessor<Payment>>,
    /// Refund scheduler.
    pub refunds: Arc<Reprocessor<Refund>>,
}

/// Job periods.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Schedule {
    /// First-delivery dispatch.
    pub dispatch: Duration,
    /// Redelivery of failed records.
    pub retry: Duration,
    /// Purge of dispatched records and dead-letter report.
    pub housekeeping: Duration,
    /// Idempotency expiry sweep.
    pub idempotency_expiry: Duration,
    /// Both reprocessing schedulers.
    pub reprocessing: Duration,
}

/// Spawns every background job.
pub fn spawn_all(workers: &Workers, schedule: Schedule, shutdown: &Shutdown) -> Vec<JoinHandle<()>> {
    let dispatcher = workers.dispatcher.clone();
    let dispatch = spawn_periodic("outbox-dispatch", schedule.dispatch, shutdown.subscribe(), move || {
        let dispatcher = dispatcher.clone();
        async move { dispatcher.dispatch_pending().await.map(|_| ()) }
    });

    let dispatcher = workers.dispatcher.clone();
    let retry = spawn_periodic("outbox-retry", schedule.retry, shutdown.subscribe(), move || {
        let dispatcher = dispatcher.clone();
        async move { dispatcher.retry_failed().await.map(|_| ()) }
    });

    let dispatcher = workers.dispatcher.clone();
    let housekeeping = spawn_periodic(
        "outbox-housekeeping",
        schedule.housekeeping,
        shutdown.subscribe(),
        move || {
            let dispatcher = dispatcher.clone();
            async move {
                dispatcher.purge_dispatched().await?;
                dispatcher.report_dead_letters().await.map(|_| ())
            }
        },
    );

    let idempotency = workers.idempotency.clone();
    let expiry = spawn_periodic(
        "idempotency-expiry",
        schedule.idempotency_expiry,
        shutdown.subscribe(),
        move || {
            let idempotency = idempotency.clone();
            async move {
                let purged = idempotency.purge_expired().await?;
                if purged > 0 {
                    info!(purged, "purged expired idempotency records");
                }
                Ok(())
            }
        },
    );

    let payments = workers.payments.clone();
    let payment_reprocessing = spawn_periodic(
        "payment-reprocessing",
        schedule.reprocessing,
        shutdown.subscribe(),
        move || {
            let payments = payments.clone();
            async move { payments.run_once().await.map(|_| ()) }
        },
    );

    let refunds = workers.refunds.clone();
    let refund_reprocessing = spawn_periodic(
        "refund-reprocessing",
        schedule.reprocessing,
        shutdown.subscribe(),
        move || {
            let refunds = refunds.clone();
            async move { refunds.run_once().await.map(|_| ()) }
        },
    );

    vec![
        dispatch,
        retry,
        housekeeping,
        expiry,
        payment_reprocessing,
        refund_reprocessing,
    ]
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_periodic_job_runs_each_period_until_shutdown() {
        // Arrange
        let shutdown = Shutdown::new();
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = runs.clone();
        let handle = spawn_periodic(
            "test",
            Duration::from_secs(10),
            shutdown.subscribe(),
            move || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            },
        );

        // Act: first tick is immediate, then one every 10s.
        time::sleep(Duration::from_secs(25)).await;
        shutdown.trigger();
        handle.await.unwrap();

        // Assert
        assert_eq!(runs.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failing_job_keeps_its_schedule() {
        // Arrange
        let shutdown = Shutdown::new();
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = runs.clone();
        let handle = spawn_periodic(
            "failing",
            Duration::from_secs(1),
            shutdown.subscribe(),
            move || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(DomainError::Infrastructure("db down".into()))
                }
            },
        );

        // Act
        time::sleep(Duration::from_millis(2500)).await;
        shutdown.trigger();
        handle.await.unwrap();

        // Assert
        assert_eq!(runs.load(Ordering::SeqCst), 3);
    }
}
