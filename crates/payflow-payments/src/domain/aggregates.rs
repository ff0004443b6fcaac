//! Payment and refund entities.
//!
//! Both carry an [`AuthorizationState`]: a pending record moves to
//! `AUTHORIZED` or `DENIED` exactly once, and every attempt (including one
//! that leaves the record pending) is counted so the reprocessing scheduler
//! can stop at its bound.

use chrono::{DateTime, Utc};
use payflow_core::authorizer::{AuthorizationOutcome, AuthorizationRequest, AuthorizationStatus};
use payflow_core::reprocess::Reprocessable;
use uuid::Uuid;

use super::commands::{CreatePayment, CreateRefund};
use super::events::{
    Authorized, Denied, PaymentCreated, PaymentEvent, PaymentEventKind, RefundCreated,
    RefundEvent, RefundEventKind,
};

/// Authorization progress shared by payments and refunds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthorizationState {
    /// Current status.
    pub status: AuthorizationStatus,
    /// Attempts made so far.
    pub attempts: u32,
    /// Sequential number issued on approval.
    pub nsu: Option<String>,
    /// Authorization code issued on approval.
    pub authorization_code: Option<String>,
    /// Reason given on denial.
    pub denial_reason: Option<String>,
}

/// A status transition produced by an attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusChange {
    /// The record was approved.
    Authorized(Authorized),
    /// The record was declined.
    Denied(Denied),
}

impl AuthorizationState {
    /// A record that has not been attempted yet.
    #[must_use]
    pub fn pending() -> Self {
        Self {
            status: AuthorizationStatus::Pending,
            attempts: 0,
            nsu: None,
            authorization_code: None,
            denial_reason: None,
        }
    }

    /// Applies the outcome of one attempt. Settled records are left alone.
    fn apply(&mut self, outcome: &AuthorizationOutcome) -> Option<StatusChange> {
        if self.status != AuthorizationStatus::Pending {
            return None;
        }
        self.attempts += 1;
        let previous_status = self.status;
        match outcome {
            AuthorizationOutcome::Authorized {
                nsu,
                authorization_code,
            } => {
                self.status = AuthorizationStatus::Authorized;
                self.nsu = Some(nsu.clone());
                self.authorization_code = Some(authorization_code.clone());
                Some(StatusChange::Authorized(Authorized {
                    previous_status,
                    nsu: nsu.clone(),
                    authorization_code: authorization_code.clone(),
                    attempt: self.attempts,
                }))
            }
            AuthorizationOutcome::Denied { reason } => {
                self.status = AuthorizationStatus::Denied;
                self.denial_reason = Some(reason.clone());
                Some(StatusChange::Denied(Denied {
                    previous_status,
                    reason: reason.clone(),
                    attempt: self.attempts,
                }))
            }
            AuthorizationOutcome::Pending => None,
        }
    }
}

impl Default for AuthorizationState {
    fn default() -> Self {
        Self::pending()
    }
}

/// A card payment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Payment {
    /// Payment identifier.
    pub id: Uuid,
    /// Merchant order reference; unique.
    pub order_id: String,
    /// Tokenized card reference.
    pub card_token: String,
    /// Amount in minor units.
    pub amount_cents: i64,
    /// ISO-4217 currency code.
    pub currency: String,
    /// Statement description.
    pub description: String,
    /// Authorization progress.
    pub authorization: AuthorizationState,
    /// Sum of authorized refunds.
    pub refunded_cents: i64,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last modification time.
    pub updated_at: DateTime<Utc>,
}

impl Payment {
    /// Creates a pending payment from a validated command.
    #[must_use]
    pub fn new(id: Uuid, command: &CreatePayment, now: DateTime<Utc>) -> Self {
        Self {
            id,
            order_id: command.order_id.clone(),
            card_token: command.card_token.clone(),
            amount_cents: command.amount_cents,
            currency: command.currency.clone(),
            description: command.description.clone(),
            authorization: AuthorizationState::pending(),
            refunded_cents: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// The `payment.created` event for this payment.
    #[must_use]
    pub fn created_event(&self) -> PaymentEvent {
        PaymentEvent {
            payment_id: self.id,
            kind: PaymentEventKind::Created(PaymentCreated {
                payment_id: self.id,
                order_id: self.order_id.clone(),
                amount_cents: self.amount_cents,
                currency: self.currency.clone(),
            }),
        }
    }

    /// Amount that can still be refunded. Zero unless authorized.
    #[must_use]
    pub fn refundable_cents(&self) -> i64 {
        if self.authorization.status == AuthorizationStatus::Authorized {
            self.amount_cents - self.refunded_cents
        } else {
            0
        }
    }
}

impl Reprocessable for Payment {
    const KIND: &'static str = "payment";

    type Event = PaymentEvent;

    fn id(&self) -> Uuid {
        self.id
    }

    fn status(&self) -> AuthorizationStatus {
        self.authorization.status
    }

    fn attempts(&self) -> u32 {
        self.authorization.attempts
    }

    fn authorization_request(&self) -> AuthorizationRequest {
        AuthorizationRequest {
            card_token: self.card_token.clone(),
            amount_cents: self.amount_cents,
            currency: self.currency.clone(),
            description: self.description.clone(),
        }
    }

    fn record_attempt(
        &mut self,
        outcome: &AuthorizationOutcome,
        now: DateTime<Utc>,
    ) -> Option<PaymentEvent> {
        let change = self.authorization.apply(outcome);
        self.updated_at = now;
        change.map(|change| PaymentEvent {
            payment_id: self.id,
            kind: match change {
                StatusChange::Authorized(authorized) => PaymentEventKind::Authorized(authorized),
                StatusChange::Denied(denied) => PaymentEventKind::Denied(denied),
            },
        })
    }
}

/// A refund against an authorized payment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Refund {
    /// Refund identifier.
    pub id: Uuid,
    /// The refunded payment.
    pub payment_id: Uuid,
    /// Amount in minor units.
    pub amount_cents: i64,
    /// Free-text reason.
    pub reason: String,
    /// Card token copied from the payment.
    pub card_token: String,
    /// Currency copied from the payment.
    pub currency: String,
    /// Authorization progress.
    pub authorization: AuthorizationState,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last modification time.
    pub updated_at: DateTime<Utc>,
}

impl Refund {
    /// Creates a pending refund of `payment`.
    #[must_use]
    pub fn new(id: Uuid, payment: &Payment, command: &CreateRefund, now: DateTime<Utc>) -> Self {
        Self {
            id,
            payment_id: payment.id,
            amount_cents: command.amount_cents,
            reason: command.reason.clone(),
            card_token: payment.card_token.clone(),
            currency: payment.currency.clone(),
            authorization: AuthorizationState::pending(),
            created_at: now,
            updated_at: now,
        }
    }

    /// The `refund.created` event for this refund.
    #[must_use]
    pub fn created_event(&self) -> RefundEvent {
        RefundEvent {
            refund_id: self.id,
            kind: RefundEventKind::Created(RefundCreated {
                refund_id: self.id,
                payment_id: self.payment_id,
                amount_cents: self.amount_cents,
                currency: self.currency.clone(),
            }),
        }
    }
}

impl Reprocessable for Refund {
    const KIND: &'static str = "refund";

    type Event = RefundEvent;

    fn id(&self) -> Uuid {
        self.id
    }

    fn status(&self) -> AuthorizationStatus {
        self.authorization.status
    }

    fn attempts(&self) -> u32 {
        self.authorization.attempts
    }

    fn authorization_request(&self) -> AuthorizationRequest {
        AuthorizationRequest {
            card_token: self.card_token.clone(),
            amount_cents: self.amount_cents,
            currency: self.currency.clone(),
            description: format!("refund of payment {}", self.payment_id),
        }
    }

    fn record_attempt(
        &mut self,
        outcome: &AuthorizationOutcome,
        now: DateTime<Utc>,
    ) -> Option<RefundEvent> {
        let change = self.authorization.apply(outcome);
        self.updated_at = now;
        change.map(|change| RefundEvent {
            refund_id: self.id,
            kind: match change {
                StatusChange::Authorized(authorized) => RefundEventKind::Authorized(authorized),
                StatusChange::Denied(denied) => RefundEventKind::Denied(denied),
            },
        })
    }
}
