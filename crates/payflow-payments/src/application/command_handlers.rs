//! Command handlers for payments and refunds.
//!
//! Each handler validates the command, makes one authorization attempt
//! through the gateway (outside any transaction), applies the outcome and
//! persists the record with its outbox events in a single repository call.
//! A pending outcome is a success: the record is stored as `PENDING` and
//! left to the reprocessing scheduler.

use payflow_core::authorizer::{AuthorizationGateway, AuthorizationStatus};
use payflow_core::clock::Clock;
use payflow_core::error::DomainError;
use payflow_core::event::NewOutboxEvent;
use payflow_core::reprocess::Reprocessable;
use tracing::info;
use uuid::Uuid;

use crate::domain::aggregates::{Payment, Refund};
use crate::domain::commands::{CreatePayment, CreateRefund};
use crate::domain::repository::{PaymentRepository, RefundRepository};

/// Handles the `CreatePayment` command.
///
/// # Errors
///
/// Returns `DomainError::Validation` for invalid input,
/// `DomainError::Conflict` if the order id is already used, and
/// `DomainError::Infrastructure` if persistence fails.
pub async fn handle_create_payment(
    command: &CreatePayment,
    destination: &str,
    gateway: &dyn AuthorizationGateway,
    clock: &dyn Clock,
    repo: &dyn PaymentRepository,
) -> Result<Payment, DomainError> {
    command.validate()?;
    if repo.find_payment_by_order(&command.order_id).await?.is_some() {
        return Err(DomainError::Conflict(format!(
            "order {} already has a payment",
            command.order_id
        )));
    }

    let mut payment = Payment::new(Uuid::new_v4(), command, clock.now());
    let mut events = vec![NewOutboxEvent::from_event(
        &payment.created_event(),
        destination,
        payment.created_at,
    )];

    let outcome = gateway.authorize(&payment.authorization_request()).await;
    let now = clock.now();
    if let Some(changed) = payment.record_attempt(&outcome, now) {
        events.push(NewOutboxEvent::from_event(&changed, destination, now));
    }

    repo.insert_payment(&payment, &events).await?;
    info!(
        payment_id = %payment.id,
        order_id = %payment.order_id,
        status = %payment.authorization.status,
        "payment created"
    );
    Ok(payment)
}

/// Handles the `CreateRefund` command.
///
/// # Errors
///
/// Returns `DomainError::NotFound` if the payment does not exist,
/// `DomainError::Conflict` if it is not authorized,
/// `DomainError::Validation` if the amount is invalid or exceeds what is
/// still refundable, and `DomainError::Infrastructure` if persistence fails.
pub async fn handle_create_refund(
    command: &CreateRefund,
    destination: &str,
    gateway: &dyn AuthorizationGateway,
    clock: &dyn Clock,
    payments: &dyn PaymentRepository,
    refunds: &dyn RefundRepository,
) -> Result<Refund, DomainError> {
    command.validate()?;
    let payment = payments
        .find_payment(command.payment_id)
        .await?
        .ok_or(DomainError::NotFound(command.payment_id))?;

    if payment.authorization.status != AuthorizationStatus::Authorized {
        return Err(DomainError::Conflict(format!(
            "payment {} is {}, only authorized payments can be refunded",
            payment.id, payment.authorization.status
        )));
    }
    let reserved = refunds.pending_refund_cents(payment.id).await?;
    let available = payment.refundable_cents() - reserved;
    if command.amount_cents > available {
        return Err(DomainError::Validation(format!(
            "refund of {} exceeds refundable amount {available}",
            command.amount_cents
        )));
    }

    let mut refund = Refund::new(Uuid::new_v4(), &payment, command, clock.now());
    let mut events = vec![NewOutboxEvent::from_event(
        &refund.created_event(),
        destination,
        refund.created_at,
    )];

    let outcome = gateway.authorize(&refund.authorization_request()).await;
    let now = clock.now();
    if let Some(changed) = refund.record_attempt(&outcome, now) {
        events.push(NewOutboxEvent::from_event(&changed, destination, now));
    }

    refunds.insert_refund(&refund, &events).await?;
    info!(
        refund_id = %refund.id,
        payment_id = %refund.payment_id,
        status = %refund.authorization.status,
        "refund created"
    );
    Ok(refund)
}
