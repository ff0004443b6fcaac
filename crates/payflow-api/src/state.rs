//! Shared application state.

use std::sync::Arc;

use payflow_core::authorizer::AuthorizationGateway;
use payflow_core::clock::Clock;
use payflow_idempotency::IdempotencyCache;
use payflow_payments::domain::repository::{PaymentRepository, RefundRepository};
use payflow_resilience::BreakerRegistry;

/// Application state shared across all request handlers.
#[derive(Clone)]
pub struct AppState {
    /// Time source.
    pub clock: Arc<dyn Clock>,
    /// Acquirer behind the resilience wrapper.
    pub gateway: Arc<dyn AuthorizationGateway>,
    /// Payment persistence.
    pub payments: Arc<dyn PaymentRepository>,
    /// Refund persistence.
    pub refunds: Arc<dyn RefundRepository>,
    /// Breakers by dependency name, reported by the health check.
    pub breakers: Arc<BreakerRegistry>,
    /// Idempotency cache guarding the mutating routes.
    pub idempotency: Arc<IdempotencyCache>,
    /// Topic for payment events.
    pub payment_topic: String,
    /// Topic for refund events.
    pub refund_topic: String,
}
