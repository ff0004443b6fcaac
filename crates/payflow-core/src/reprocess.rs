//! Records that can be re-driven through the authorizer after being left
//! pending, and the storage contract the reprocessing scheduler uses.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::authorizer::{AuthorizationOutcome, AuthorizationRequest, AuthorizationStatus};
use crate::claim::{ClaimToken, Claimed};
use crate::error::DomainError;
use crate::event::{DomainEvent, NewOutboxEvent};

/// A business record whose authorization may be retried.
pub trait Reprocessable: Send + Sync + std::fmt::Debug {
    /// Short name used in logs and metric labels ("payment", "refund").
    const KIND: &'static str;

    /// Event emitted when an attempt changes the status.
    type Event: DomainEvent;

    /// Record identifier.
    fn id(&self) -> Uuid;

    /// Current status.
    fn status(&self) -> AuthorizationStatus;

    /// Number of authorization attempts made so far, the one made at
    /// creation included.
    fn attempts(&self) -> u32;

    /// Rebuilds the request that is sent to the acquirer.
    fn authorization_request(&self) -> AuthorizationRequest;

    /// Applies the outcome of one attempt: updates the status when the
    /// outcome is final, increments the attempt count, and returns the
    /// status-changed event when (and only when) the status changed.
    fn record_attempt(
        &mut self,
        outcome: &AuthorizationOutcome,
        now: DateTime<Utc>,
    ) -> Option<Self::Event>;

    /// Whether the record may still be reprocessed. `max_attempts` budgets
    /// every attempt, the first one at creation included.
    fn is_eligible(&self, max_attempts: u32) -> bool {
        self.status() == AuthorizationStatus::Pending && self.attempts() < max_attempts
    }
}

/// Storage operations for one kind of reprocessable record.
#[async_trait]
pub trait ReprocessingStore<R: Reprocessable>: Send + Sync {
    /// Claims up to `limit` pending records with `attempts < max_attempts`,
    /// oldest first, for `lease`. Claimed records are invisible to other
    /// schedulers until saved or until the lease elapses, and carry the
    /// token their save must present.
    async fn claim_pending(
        &self,
        limit: usize,
        max_attempts: u32,
        now: DateTime<Utc>,
        lease: Duration,
    ) -> Result<Vec<Claimed<R>>, DomainError>;

    /// Counts pending records that reached `max_attempts`.
    async fn count_exhausted(&self, max_attempts: u32) -> Result<u64, DomainError>;

    /// Persists the record after an attempt and appends `event` to the outbox
    /// in the same transaction, clearing the claim.
    ///
    /// # Errors
    ///
    /// `DomainError::Conflict` when the stored record is no longer pending
    /// under `token`: the lease elapsed and a newer claim took the record
    /// over. Nothing is written in that case.
    async fn save_attempt(
        &self,
        record: &R,
        token: ClaimToken,
        event: Option<NewOutboxEvent>,
    ) -> Result<(), DomainError>;
}
