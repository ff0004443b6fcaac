//! Query handlers returning read-only views of payments and refunds.

use chrono::{DateTime, Utc};
use payflow_core::authorizer::AuthorizationStatus;
use payflow_core::error::DomainError;
use serde::Serialize;
use uuid::Uuid;

use crate::domain::aggregates::{Payment, Refund};
use crate::domain::repository::{PaymentRepository, RefundRepository};

/// Read-only view of a payment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PaymentView {
    /// Payment identifier.
    pub id: Uuid,
    /// Merchant order reference.
    pub order_id: String,
    /// Amount in minor units.
    pub amount_cents: i64,
    /// ISO-4217 currency code.
    pub currency: String,
    /// Statement description.
    pub description: String,
    /// Authorization status.
    pub status: AuthorizationStatus,
    /// Authorization attempts made so far.
    pub attempts: u32,
    /// Sequential number issued on approval.
    pub nsu: Option<String>,
    /// Authorization code issued on approval.
    pub authorization_code: Option<String>,
    /// Reason given on denial.
    pub denial_reason: Option<String>,
    /// Sum of authorized refunds.
    pub refunded_cents: i64,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last modification time.
    pub updated_at: DateTime<Utc>,
}

impl From<Payment> for PaymentView {
    fn from(payment: Payment) -> Self {
        Self {
            id: payment.id,
            order_id: payment.order_id,
            amount_cents: payment.amount_cents,
            currency: payment.currency,
            description: payment.description,
            status: payment.authorization.status,
            attempts: payment.authorization.attempts,
            nsu: payment.authorization.nsu,
            authorization_code: payment.authorization.authorization_code,
            denial_reason: payment.authorization.denial_reason,
            refunded_cents: payment.refunded_cents,
            created_at: payment.created_at,
            updated_at: payment.updated_at,
        }
    }
}

/// Read-only view of a refund.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RefundView {
    /// Refund identifier.
    pub id: Uuid,
    /// The refunded payment.
    pub payment_id: Uuid,
    /// Amount in minor units.
    pub amount_cents: i64,
    /// ISO-4217 currency code.
    pub currency: String,
    /// Free-text reason.
    pub reason: String,
    /// Authorization status.
    pub status: AuthorizationStatus,
    /// Authorization attempts made so far.
    pub attempts: u32,
    /// Sequential number issued on approval.
    pub nsu: Option<String>,
    /// Authorization code issued on approval.
    pub authorization_code: Option<String>,
    /// Reason given on denial.
    pub denial_reason: Option<String>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last modification time.
    pub updated_at: DateTime<Utc>,
}

impl From<Refund> for RefundView {
    fn from(refund: Refund) -> Self {
        Self {
            id: refund.id,
            payment_id: refund.payment_id,
            amount_cents: refund.amount_cents,
            currency: refund.currency,
            reason: refund.reason,
            status: refund.authorization.status,
            attempts: refund.authorization.attempts,
            nsu: refund.authorization.nsu,
            authorization_code: refund.authorization.authorization_code,
            denial_reason: refund.authorization.denial_reason,
            created_at: refund.created_at,
            updated_at: refund.updated_at,
        }
    }
}

/// Retrieves a payment by id.
///
/// # Errors
///
/// Returns `DomainError::NotFound` if no payment has the id.
pub async fn get_payment_by_id(
    id: Uuid,
    repo: &dyn PaymentRepository,
) -> Result<PaymentView, DomainError> {
    repo.find_payment(id)
        .await?
        .map(PaymentView::from)
        .ok_or(DomainError::NotFound(id))
}

/// Retrieves a refund by id.
///
/// # Errors
///
/// Returns `DomainError::NotFound` if no refund has the id.
pub async fn get_refund_by_id(
    id: Uuid,
    repo: &dyn RefundRepository,
) -> Result<RefundView, DomainError> {
    repo.find_refund(id)
        .await?
        .map(RefundView::from)
        .ok_or(DomainError::NotFound(id))
}
