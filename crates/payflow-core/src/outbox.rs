//! Transactional outbox records and the storage contract the dispatcher
//! drives.
//!
//! Records are appended by business repositories inside the transaction
//! that changes business state (see `NewOutboxEvent`); this trait only
//! covers what happens afterwards.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::claim::{ClaimToken, Claimed};
use crate::error::DomainError;
use crate::event::{EventEnvelope, NewOutboxEvent};

/// Longest error message kept on a failed record.
pub const MAX_ERROR_LEN: usize = 1000;

/// Delivery status of an outbox record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OutboxStatus {
    /// Waiting for its first delivery attempt.
    Pending,
    /// Claimed by a dispatcher; not visible to other dispatchers until the
    /// claim lease elapses.
    InFlight,
    /// Delivered to the broker. Terminal.
    Dispatched,
    /// Last delivery attempt failed. Retried while `attempts` is below the
    /// configured maximum, dead-lettered beyond it.
    Failed,
}

impl OutboxStatus {
    /// Column representation.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::InFlight => "IN_FLIGHT",
            Self::Dispatched => "DISPATCHED",
            Self::Failed => "FAILED",
        }
    }

    /// Parses the column representation.
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "PENDING" => Some(Self::Pending),
            "IN_FLIGHT" => Some(Self::InFlight),
            "DISPATCHED" => Some(Self::Dispatched),
            "FAILED" => Some(Self::Failed),
            _ => None,
        }
    }
}

impl fmt::Display for OutboxStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The two claim paths of the dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimKind {
    /// First delivery attempts.
    Pending,
    /// Redelivery of failed records.
    Retry,
}

/// A stored outbox record.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboxRecord {
    /// Monotonic surrogate key; defines FIFO order.
    pub id: i64,
    /// Event identifier carried in the envelope.
    pub event_id: Uuid,
    /// Aggregate the event belongs to.
    pub aggregate_id: Uuid,
    /// Aggregate type name.
    pub aggregate_type: String,
    /// Event type name.
    pub event_type: String,
    /// Event payload, opaque to the outbox.
    pub payload: serde_json::Value,
    /// Topic or queue name.
    pub destination: String,
    /// Delivery status.
    pub status: OutboxStatus,
    /// Number of failed delivery attempts.
    pub attempts: u32,
    /// Error from the most recent failed attempt.
    pub last_error: Option<String>,
    /// When the record was appended.
    pub created_at: DateTime<Utc>,
    /// When the current claim was taken, if in flight.
    pub claimed_at: Option<DateTime<Utc>>,
    /// When the record was delivered.
    pub dispatched_at: Option<DateTime<Utc>>,
}

impl OutboxRecord {
    /// Materializes a freshly appended record.
    #[must_use]
    pub fn new_pending(id: i64, event: NewOutboxEvent) -> Self {
        Self {
            id,
            event_id: event.event_id,
            aggregate_id: event.aggregate_id,
            aggregate_type: event.aggregate_type,
            event_type: event.event_type,
            payload: event.payload,
            destination: event.destination,
            status: OutboxStatus::Pending,
            attempts: 0,
            last_error: None,
            created_at: event.occurred_at,
            claimed_at: None,
            dispatched_at: None,
        }
    }

    /// Builds the broker message for this record.
    #[must_use]
    pub fn envelope(&self) -> EventEnvelope {
        EventEnvelope {
            event_id: self.event_id,
            event_type: self.event_type.clone(),
            aggregate_id: self.aggregate_id,
            aggregate_type: self.aggregate_type.clone(),
            timestamp: self.created_at,
            payload: self.payload.clone(),
        }
    }

    /// Whether the record exhausted its delivery budget.
    #[must_use]
    pub fn is_dead_lettered(&self, max_attempts: u32) -> bool {
        self.status == OutboxStatus::Failed && self.attempts >= max_attempts
    }

    /// Whether the record still has to be delivered: neither dispatched nor
    /// dead-lettered.
    #[must_use]
    pub fn is_open(&self, max_attempts: u32) -> bool {
        self.status != OutboxStatus::Dispatched && !self.is_dead_lettered(max_attempts)
    }

    /// Whether a claim of `kind` may take the record. In-flight records are
    /// only claimable once their claim was taken before `stale_before`.
    #[must_use]
    pub fn is_claimable(
        &self,
        kind: ClaimKind,
        max_attempts: u32,
        stale_before: DateTime<Utc>,
    ) -> bool {
        let stale = self.status == OutboxStatus::InFlight
            && self.claimed_at.is_none_or(|claimed_at| claimed_at <= stale_before);
        match kind {
            ClaimKind::Pending => {
                self.status == OutboxStatus::Pending || (stale && self.attempts == 0)
            }
            ClaimKind::Retry => {
                (self.status == OutboxStatus::Failed && self.attempts < max_attempts)
                    || (stale && self.attempts > 0)
            }
        }
    }

    /// Status an unattempted claim returns to when released.
    #[must_use]
    pub fn released_status(&self) -> OutboxStatus {
        if self.attempts == 0 {
            OutboxStatus::Pending
        } else {
            OutboxStatus::Failed
        }
    }
}

/// Truncates an error message to [`MAX_ERROR_LEN`] characters.
#[must_use]
pub fn truncate_error(message: &str) -> String {
    message.chars().take(MAX_ERROR_LEN).collect()
}

/// Storage operations the outbox dispatcher relies on.
///
/// Claims must be exclusive across concurrent dispatchers: a record returned
/// by one claim is not returned by another until it is finished, released,
/// or its lease elapses. Every claim stamps its records with a fresh token;
/// finishing a record requires the token and only applies while the record
/// is still in flight under it. A dispatcher whose lease elapsed and whose
/// records were reclaimed gets `DomainError::Conflict` instead of
/// overwriting the newer outcome.
#[async_trait]
pub trait OutboxStore: Send + Sync {
    /// Claims up to `limit` records awaiting their first delivery (and
    /// unattempted claims whose lease elapsed before `now - lease`), oldest
    /// first.
    ///
    /// A record is only claimed if every earlier open record of its
    /// aggregate is claimed in the same batch. Open means neither dispatched
    /// nor dead-lettered under `max_attempts`; an earlier record that is in
    /// flight elsewhere or awaiting retry therefore holds back the rest of
    /// its aggregate.
    async fn claim_pending(
        &self,
        limit: usize,
        max_attempts: u32,
        now: DateTime<Utc>,
        lease: Duration,
    ) -> Result<Vec<Claimed<OutboxRecord>>, DomainError>;

    /// Claims up to `limit` failed records with `attempts < max_attempts`
    /// (and attempted claims whose lease elapsed), oldest first, under the
    /// same ordering rule.
    async fn claim_retryable(
        &self,
        limit: usize,
        max_attempts: u32,
        now: DateTime<Utc>,
        lease: Duration,
    ) -> Result<Vec<Claimed<OutboxRecord>>, DomainError>;

    /// Marks a claimed record as delivered.
    ///
    /// # Errors
    ///
    /// `DomainError::Conflict` when the record is no longer in flight under
    /// `token`.
    async fn mark_dispatched(
        &self,
        id: i64,
        token: ClaimToken,
        now: DateTime<Utc>,
    ) -> Result<(), DomainError>;

    /// Marks a claimed record as failed, incrementing its attempt count.
    ///
    /// # Errors
    ///
    /// `DomainError::Conflict` when the record is no longer in flight under
    /// `token`.
    async fn mark_failed(&self, id: i64, token: ClaimToken, error: &str)
    -> Result<(), DomainError>;

    /// Returns a claimed record to its previous state without counting an
    /// attempt.
    ///
    /// # Errors
    ///
    /// `DomainError::Conflict` when the record is no longer in flight under
    /// `token`.
    async fn release(&self, id: i64, token: ClaimToken) -> Result<(), DomainError>;

    /// Counts failed records that exhausted their delivery budget.
    async fn count_dead_lettered(&self, max_attempts: u32) -> Result<u64, DomainError>;

    /// Deletes dispatched records created before `older_than`.
    async fn purge_dispatched(&self, older_than: DateTime<Utc>) -> Result<u64, DomainError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn record(attempts: u32, status: OutboxStatus) -> OutboxRecord {
        let mut record = OutboxRecord::new_pending(
            7,
            NewOutboxEvent {
                event_id: Uuid::new_v4(),
                aggregate_id: Uuid::new_v4(),
                aggregate_type: "payment".into(),
                event_type: "payment.created".into(),
                destination: "payments.events".into(),
                payload: serde_json::json!({ "amount_cents": 15000 }),
                occurred_at: Utc.with_ymd_and_hms(2026, 1, 15, 10, 0, 0).unwrap(),
            },
        );
        record.attempts = attempts;
        record.status = status;
        record
    }

    #[test]
    fn test_envelope_carries_record_identity() {
        let record = record(0, OutboxStatus::Pending);

        let envelope = record.envelope();

        assert_eq!(envelope.event_id, record.event_id);
        assert_eq!(envelope.aggregate_id, record.aggregate_id);
        assert_eq!(envelope.timestamp, record.created_at);
        assert_eq!(envelope.payload["amount_cents"], 15000);
    }

    #[test]
    fn test_dead_letter_requires_failed_status_and_exhausted_budget() {
        assert!(record(5, OutboxStatus::Failed).is_dead_lettered(5));
        assert!(!record(4, OutboxStatus::Failed).is_dead_lettered(5));
        assert!(!record(5, OutboxStatus::InFlight).is_dead_lettered(5));
    }

    #[test]
    fn test_released_status_depends_on_attempts() {
        assert_eq!(
            record(0, OutboxStatus::InFlight).released_status(),
            OutboxStatus::Pending
        );
        assert_eq!(
            record(2, OutboxStatus::InFlight).released_status(),
            OutboxStatus::Failed
        );
    }

    #[test]
    fn test_claimable_depends_on_claim_kind() {
        let stale_before = Utc.with_ymd_and_hms(2026, 1, 15, 10, 0, 0).unwrap();

        assert!(record(0, OutboxStatus::Pending).is_claimable(ClaimKind::Pending, 5, stale_before));
        assert!(!record(0, OutboxStatus::Pending).is_claimable(ClaimKind::Retry, 5, stale_before));
        assert!(record(2, OutboxStatus::Failed).is_claimable(ClaimKind::Retry, 5, stale_before));
        assert!(!record(5, OutboxStatus::Failed).is_claimable(ClaimKind::Retry, 5, stale_before));
    }

    #[test]
    fn test_in_flight_record_is_claimable_only_after_lease() {
        let claimed_at = Utc.with_ymd_and_hms(2026, 1, 15, 10, 0, 0).unwrap();
        let mut in_flight = record(0, OutboxStatus::InFlight);
        in_flight.claimed_at = Some(claimed_at);

        assert!(!in_flight.is_claimable(
            ClaimKind::Pending,
            5,
            claimed_at - chrono::TimeDelta::seconds(1)
        ));
        assert!(in_flight.is_claimable(ClaimKind::Pending, 5, claimed_at));
        assert!(!in_flight.is_claimable(ClaimKind::Retry, 5, claimed_at));
    }

    #[test]
    fn test_dead_lettered_and_dispatched_records_are_closed() {
        assert!(record(0, OutboxStatus::Pending).is_open(5));
        assert!(record(4, OutboxStatus::Failed).is_open(5));
        assert!(!record(5, OutboxStatus::Failed).is_open(5));
        assert!(!record(0, OutboxStatus::Dispatched).is_open(5));
    }

    #[test]
    fn test_truncate_error_limits_length() {
        let long = "x".repeat(MAX_ERROR_LEN + 50);

        assert_eq!(truncate_error(&long).len(), MAX_ERROR_LEN);
        assert_eq!(truncate_error("broker down"), "broker down");
    }
}
