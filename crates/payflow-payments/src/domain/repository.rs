//! Repository contracts for payments and refunds.
//!
//! Every write takes the outbox events produced by the state change and
//! persists them in the same transaction as the record itself.

use async_trait::async_trait;
use payflow_core::error::DomainError;
use payflow_core::event::NewOutboxEvent;
use uuid::Uuid;

use super::aggregates::{Payment, Refund};

/// Persistence for payments.
#[async_trait]
pub trait PaymentRepository: Send + Sync {
    /// Inserts a new payment together with its outbox events.
    ///
    /// Returns `DomainError::Conflict` if the order id is already taken.
    async fn insert_payment(
        &self,
        payment: &Payment,
        events: &[NewOutboxEvent],
    ) -> Result<(), DomainError>;

    /// Loads a payment by id.
    async fn find_payment(&self, id: Uuid) -> Result<Option<Payment>, DomainError>;

    /// Loads a payment by merchant order id.
    async fn find_payment_by_order(&self, order_id: &str) -> Result<Option<Payment>, DomainError>;
}

/// Persistence for refunds.
#[async_trait]
pub trait RefundRepository: Send + Sync {
    /// Inserts a new refund together with its outbox events. An authorized
    /// refund also adds its amount to the payment's refunded total.
    ///
    /// Returns `DomainError::Conflict` if, with the payment row locked, the
    /// refund no longer fits in the refundable amount.
    async fn insert_refund(&self, refund: &Refund, events: &[NewOutboxEvent])
    -> Result<(), DomainError>;

    /// Loads a refund by id.
    async fn find_refund(&self, id: Uuid) -> Result<Option<Refund>, DomainError>;

    /// Sum of refunds of `payment_id` that are still pending. They reserve
    /// part of the refundable amount until they settle.
    async fn pending_refund_cents(&self, payment_id: Uuid) -> Result<i64, DomainError>;
}
