//! Domain event abstractions and the broker message envelope.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Trait that all domain events implement.
pub trait DomainEvent: Send + Sync + std::fmt::Debug {
    /// Returns the event type name (used for routing by consumers).
    fn event_type(&self) -> &'static str;

    /// Returns the identifier of the aggregate the event describes.
    fn aggregate_id(&self) -> Uuid;

    /// Returns the aggregate type name ("payment", "refund").
    fn aggregate_type(&self) -> &'static str;

    /// Serializes the event payload to JSON.
    fn to_payload(&self) -> serde_json::Value;
}

/// An event about to be appended to the outbox, inside the same transaction
/// as the state change that produced it.
#[derive(Debug, Clone, PartialEq)]
pub struct NewOutboxEvent {
    /// Unique event identifier, stable across delivery attempts.
    pub event_id: Uuid,
    /// Aggregate the event belongs to; used as the partition key.
    pub aggregate_id: Uuid,
    /// Aggregate type name.
    pub aggregate_type: String,
    /// Event type name.
    pub event_type: String,
    /// Topic or queue the event is delivered to.
    pub destination: String,
    /// Event payload.
    pub payload: serde_json::Value,
    /// When the state change happened.
    pub occurred_at: DateTime<Utc>,
}

impl NewOutboxEvent {
    /// Builds an outbox entry for `event`, addressed to `destination`.
    #[must_use]
    pub fn from_event(
        event: &dyn DomainEvent,
        destination: impl Into<String>,
        occurred_at: DateTime<Utc>,
    ) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            aggregate_id: event.aggregate_id(),
            aggregate_type: event.aggregate_type().to_owned(),
            event_type: event.event_type().to_owned(),
            destination: destination.into(),
            payload: event.to_payload(),
            occurred_at,
        }
    }
}

/// Message published to the broker for every outbox record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventEnvelope {
    /// Unique event identifier; consumers deduplicate on it.
    pub event_id: Uuid,
    /// Event type name.
    pub event_type: String,
    /// Aggregate identifier, also the partition key.
    pub aggregate_id: Uuid,
    /// Aggregate type name.
    pub aggregate_type: String,
    /// When the state change happened.
    pub timestamp: DateTime<Utc>,
    /// Event payload.
    pub payload: serde_json::Value,
}
