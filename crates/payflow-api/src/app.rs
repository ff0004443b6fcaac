//! Wiring: builds the router, the shared state and the background workers
//! from an `AppConfig`.

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::middleware;
use payflow_core::authorizer::{AuthorizationGateway, Authorizer};
use payflow_core::broker::MessagePublisher;
use payflow_core::clock::{Clock, SystemClock};
use payflow_core::idempotency::{FastTier, IdempotencyStore};
use payflow_core::outbox::OutboxStore;
use payflow_core::reprocess::ReprocessingStore;
use payflow_idempotency::{IdempotencyCache, MemoryFastTier, RedisFastTier};
use payflow_outbox::{HttpBrokerPublisher, LogPublisher, OutboxDispatcher};
use payflow_payments::domain::aggregates::{Payment, Refund};
use payflow_payments::domain::repository::{PaymentRepository, RefundRepository};
use payflow_reprocessing::{Reprocessor, ReprocessorConfig};
use payflow_resilience::{BreakerRegistry, ResilientAuthorizer};
use payflow_store::{InMemoryStore, PgStore};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::acquirer::HttpAcquirer;
use crate::config::{AppConfig, FastTierKind};
use crate::error::AppError;
use crate::idempotency::idempotency_gate;
use crate::jobs::{Schedule, Workers};
use crate::routes;
use crate::state::AppState;

/// Name of the acquirer dependency in breaker metrics and logs.
pub const ACQUIRER: &str = "acquirer";

/// Every storage trait the service needs, implemented by one backend.
pub trait Store:
    PaymentRepository
    + RefundRepository
    + OutboxStore
    + IdempotencyStore
    + ReprocessingStore<Payment>
    + ReprocessingStore<Refund>
    + 'static
{
}

impl<T> Store for T where
    T: PaymentRepository
        + RefundRepository
        + OutboxStore
        + IdempotencyStore
        + ReprocessingStore<Payment>
        + ReprocessingStore<Refund>
        + 'static
{
}

/// External collaborators, injected so tests can substitute them.
pub struct Collaborators {
    /// Time source.
    pub clock: Arc<dyn Clock>,
    /// The raw acquirer client, before resilience.
    pub acquirer: Arc<dyn Authorizer>,
    /// Broker producer.
    pub publisher: Arc<dyn MessagePublisher>,
    /// Idempotency fast tier.
    pub fast_tier: Arc<dyn FastTier>,
}

/// A fully wired service.
pub struct Services {
    /// Request handler state.
    pub state: AppState,
    /// Background workers.
    pub workers: Workers,
    /// Breakers by dependency name.
    pub breakers: Arc<BreakerRegistry>,
}

/// Builds the HTTP router. The idempotency gate wraps only the mutating
/// routes.
pub fn router(state: AppState) -> Router {
    let idempotent = Router::new()
        .merge(routes::payments::idempotent_router())
        .merge(routes::refunds::idempotent_router())
        .route_layer(middleware::from_fn_with_state(state.clone(), idempotency_gate));

    Router::new()
        .merge(routes::health::router())
        .merge(routes::payments::router())
        .merge(routes::refunds::router())
        .merge(idempotent)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Job periods from `config`.
#[must_use]
pub fn schedule(config: &AppConfig) -> Schedule {
    Schedule {
        dispatch: Duration::from_millis(config.outbox.dispatch_period_ms),
        retry: Duration::from_millis(config.outbox.retry_period_ms),
        housekeeping: Duration::from_secs(config.outbox.housekeeping_period_secs),
        idempotency_expiry: Duration::from_secs(config.idempotency.purge_period_secs),
        reprocessing: Duration::from_millis(config.reprocessing.period_ms),
    }
}

/// Wires handlers and workers over `store`.
pub fn assemble<S: Store>(store: Arc<S>, collaborators: Collaborators, config: &AppConfig) -> Services {
    let Collaborators {
        clock,
        acquirer,
        publisher,
        fast_tier,
    } = collaborators;

    let breakers = Arc::new(BreakerRegistry::new(config.breaker()));
    let gateway: Arc<dyn AuthorizationGateway> = Arc::new(ResilientAuthorizer::new(
        acquirer,
        breakers.breaker(ACQUIRER),
        &config.resilience_settings(),
        clock.clone(),
    ));

    let idempotency = Arc::new(IdempotencyCache::new(
        store.clone(),
        fast_tier,
        clock.clone(),
        config.idempotency_cache(),
    ));

    let dispatcher = Arc::new(OutboxDispatcher::new(
        store.clone(),
        publisher,
        clock.clone(),
        config.dispatcher(),
    ));

    let reprocessor_config = |destination: &str| ReprocessorConfig {
        batch_size: config.reprocessing.batch_size,
        max_attempts: config.reprocessing.max_attempts,
        claim_lease: Duration::from_secs(config.reprocessing.claim_lease_secs),
        destination: destination.to_owned(),
    };
    let payment_store: Arc<dyn ReprocessingStore<Payment>> = store.clone();
    let refund_store: Arc<dyn ReprocessingStore<Refund>> = store.clone();
    let payments = Arc::new(Reprocessor::new(
        payment_store,
        gateway.clone(),
        clock.clone(),
        reprocessor_config(&config.outbox.payment_topic),
    ));
    let refunds = Arc::new(Reprocessor::new(
        refund_store,
        gateway.clone(),
        clock.clone(),
        reprocessor_config(&config.outbox.refund_topic),
    ));

    let state = AppState {
        clock,
        gateway,
        payments: store.clone(),
        refunds: store,
        breakers: breakers.clone(),
        idempotency: idempotency.clone(),
        payment_topic: config.outbox.payment_topic.clone(),
        refund_topic: config.outbox.refund_topic.clone(),
    };

    Services {
        state,
        workers: Workers {
            dispatcher,
            idempotency,
            payments,
            refunds,
        },
        breakers,
    }
}

/// Connects the configured infrastructure and wires the service.
///
/// # Errors
///
/// Returns `AppError` if the database, Redis or an HTTP client cannot be set
/// up.
pub async fn build(config: &AppConfig) -> Result<Services, AppError> {
    let acquirer: Arc<dyn Authorizer> = Arc::new(HttpAcquirer::new(
        config.acquirer.base_url.clone(),
        Duration::from_millis(config.acquirer.call_timeout_ms),
    )?);

    let publisher: Arc<dyn MessagePublisher> = if config.outbox.broker_url.trim().is_empty() {
        info!("no broker configured, events will be logged");
        Arc::new(LogPublisher)
    } else {
        Arc::new(HttpBrokerPublisher::new(
            config.outbox.broker_url.clone(),
            Duration::from_millis(config.outbox.broker_timeout_ms),
        )?)
    };

    let fast_tier: Arc<dyn FastTier> = match config.idempotency.fast_tier {
        FastTierKind::Memory => Arc::new(MemoryFastTier::new()),
        FastTierKind::Redis => Arc::new(RedisFastTier::connect(&config.idempotency.redis_url).await?),
    };

    let collaborators = Collaborators {
        clock: Arc::new(SystemClock),
        acquirer,
        publisher,
        fast_tier,
    };

    if config.database.url.trim().is_empty() {
        info!("no database configured, using the in-memory store");
        return Ok(assemble(Arc::new(InMemoryStore::new()), collaborators, config));
    }

    let store = PgStore::connect(&config.database.url, config.database.max_connections).await?;
    store.migrate().await?;
    info!("database migrations applied");
    Ok(assemble(Arc::new(store), collaborators, config))
}
