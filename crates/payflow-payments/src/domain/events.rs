//! Domain events for payments and refunds.

use payflow_core::authorizer::AuthorizationStatus;
use payflow_core::event::DomainEvent;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Aggregate type name for payments.
pub const PAYMENT_AGGREGATE: &str = "payment";

/// Aggregate type name for refunds.
pub const REFUND_AGGREGATE: &str = "refund";

/// Event type identifier for [`PaymentEventKind::Created`].
pub const PAYMENT_CREATED_EVENT_TYPE: &str = "payment.created";

/// Event type identifier for [`PaymentEventKind::Authorized`].
pub const PAYMENT_AUTHORIZED_EVENT_TYPE: &str = "payment.authorized";

/// Event type identifier for [`PaymentEventKind::Denied`].
pub const PAYMENT_DENIED_EVENT_TYPE: &str = "payment.denied";

/// Event type identifier for [`RefundEventKind::Created`].
pub const REFUND_CREATED_EVENT_TYPE: &str = "refund.created";

/// Event type identifier for [`RefundEventKind::Authorized`].
pub const REFUND_AUTHORIZED_EVENT_TYPE: &str = "refund.authorized";

/// Event type identifier for [`RefundEventKind::Denied`].
pub const REFUND_DENIED_EVENT_TYPE: &str = "refund.denied";

/// Emitted when a payment is accepted, before its first authorization
/// attempt resolves.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentCreated {
    /// The payment identifier.
    pub payment_id: Uuid,
    /// Merchant order reference.
    pub order_id: String,
    /// Amount in minor units.
    pub amount_cents: i64,
    /// ISO-4217 currency code.
    pub currency: String,
}

/// Emitted when the acquirer approves a payment or refund.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Authorized {
    /// Status before the change.
    pub previous_status: AuthorizationStatus,
    /// Sequential number issued by the acquirer.
    pub nsu: String,
    /// Authorization code issued by the acquirer.
    pub authorization_code: String,
    /// Attempt on which the approval was obtained.
    pub attempt: u32,
}

/// Emitted when the acquirer declines a payment or refund.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Denied {
    /// Status before the change.
    pub previous_status: AuthorizationStatus,
    /// Reason given by the acquirer.
    pub reason: String,
    /// Attempt on which the denial was obtained.
    pub attempt: u32,
}

/// Emitted when a refund is accepted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefundCreated {
    /// The refund identifier.
    pub refund_id: Uuid,
    /// The refunded payment.
    pub payment_id: Uuid,
    /// Amount in minor units.
    pub amount_cents: i64,
    /// ISO-4217 currency code.
    pub currency: String,
}

/// Event payload variants for payments.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PaymentEventKind {
    /// A payment was accepted.
    Created(PaymentCreated),
    /// A payment was approved.
    Authorized(Authorized),
    /// A payment was declined.
    Denied(Denied),
}

/// A payment domain event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentEvent {
    /// The payment the event describes.
    pub payment_id: Uuid,
    /// Event-specific payload.
    pub kind: PaymentEventKind,
}

impl DomainEvent for PaymentEvent {
    fn event_type(&self) -> &'static str {
        match &self.kind {
            PaymentEventKind::Created(_) => PAYMENT_CREATED_EVENT_TYPE,
            PaymentEventKind::Authorized(_) => PAYMENT_AUTHORIZED_EVENT_TYPE,
            PaymentEventKind::Denied(_) => PAYMENT_DENIED_EVENT_TYPE,
        }
    }

    fn aggregate_id(&self) -> Uuid {
        self.payment_id
    }

    fn aggregate_type(&self) -> &'static str {
        PAYMENT_AGGREGATE
    }

    fn to_payload(&self) -> serde_json::Value {
        // Serialization of derived Serialize types to Value is infallible.
        serde_json::to_value(&self.kind).expect("PaymentEventKind serialization is infallible")
    }
}

/// Event payload variants for refunds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RefundEventKind {
    /// A refund was accepted.
    Created(RefundCreated),
    /// A refund was approved.
    Authorized(Authorized),
    /// A refund was declined.
    Denied(Denied),
}

/// A refund domain event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefundEvent {
    /// The refund the event describes.
    pub refund_id: Uuid,
    /// Event-specific payload.
    pub kind: RefundEventKind,
}

impl DomainEvent for RefundEvent {
    fn event_type(&self) -> &'static str {
        match &self.kind {
            RefundEventKind::Created(_) => REFUND_CREATED_EVENT_TYPE,
            RefundEventKind::Authorized(_) => REFUND_AUTHORIZED_EVENT_TYPE,
            RefundEventKind::Denied(_) => REFUND_DENIED_EVENT_TYPE,
        }
    }

    fn aggregate_id(&self) -> Uuid {
        self.refund_id
    }

    fn aggregate_type(&self) -> &'static str {
        REFUND_AGGREGATE
    }

    fn to_payload(&self) -> serde_json::Value {
        // Serialization of derived Serialize types to Value is infallible.
        serde_json::to_value(&self.kind).expect("RefundEventKind serialization is infallible")
    }
}
