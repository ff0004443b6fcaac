//! In-memory implementation of every Payflow storage trait.
//!
//! One mutex guards all tables, so each trait call behaves like a
//! serializable transaction: a business write and its outbox events become
//! visible together, and claims are exclusive.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use payflow_core::authorizer::AuthorizationStatus;
use payflow_core::claim::{ClaimToken, Claimed};
use payflow_core::clock;
use payflow_core::error::DomainError;
use payflow_core::event::NewOutboxEvent;
use payflow_core::idempotency::{ClaimOutcome, IdempotencyRecord, IdempotencyStore};
use payflow_core::outbox::{ClaimKind, OutboxRecord, OutboxStatus, OutboxStore, truncate_error};
use payflow_core::reprocess::{Reprocessable, ReprocessingStore};
use payflow_payments::domain::aggregates::{Payment, Refund};
use payflow_payments::domain::repository::{PaymentRepository, RefundRepository};
use uuid::Uuid;

#[derive(Debug, Clone)]
enum IdempotencyEntry {
    InProgress {
        locked_until: DateTime<Utc>,
        token: ClaimToken,
    },
    Completed(IdempotencyRecord),
}

#[derive(Debug, Clone)]
struct Leased<T> {
    record: T,
    locked_until: Option<DateTime<Utc>>,
    claim: Option<ClaimToken>,
}

impl<T> Leased<T> {
    fn new(record: T) -> Self {
        Self {
            record,
            locked_until: None,
            claim: None,
        }
    }

    fn is_free(&self, now: DateTime<Utc>) -> bool {
        self.locked_until.is_none_or(|until| until <= now)
    }
}

impl<T: Reprocessable> Leased<T> {
    /// Checks that the record is still pending under `token`, then clears
    /// the claim.
    fn settle(&mut self, token: ClaimToken) -> Result<(), DomainError> {
        if self.claim != Some(token) || self.record.status() != AuthorizationStatus::Pending {
            return Err(DomainError::Conflict(format!(
                "{} {} is no longer claimed by {token}",
                T::KIND,
                self.record.id()
            )));
        }
        self.locked_until = None;
        self.claim = None;
        Ok(())
    }
}

#[derive(Debug, Default)]
struct State {
    last_outbox_id: i64,
    outbox: BTreeMap<i64, OutboxRecord>,
    outbox_claims: HashMap<i64, ClaimToken>,
    idempotency: HashMap<String, IdempotencyEntry>,
    payments: HashMap<Uuid, Leased<Payment>>,
    refunds: HashMap<Uuid, Leased<Refund>>,
}

impl State {
    fn append(&mut self, events: &[NewOutboxEvent]) {
        for event in events {
            self.last_outbox_id += 1;
            let id = self.last_outbox_id;
            self.outbox
                .insert(id, OutboxRecord::new_pending(id, event.clone()));
        }
    }

    fn claim(
        &mut self,
        kind: ClaimKind,
        limit: usize,
        max_attempts: u32,
        now: DateTime<Utc>,
        lease: Duration,
    ) -> Vec<Claimed<OutboxRecord>> {
        let stale_before = clock::before(now, lease);
        let token = ClaimToken::generate();
        let mut held_back: HashSet<Uuid> = HashSet::new();
        let mut claimed = Vec::new();

        for record in self.outbox.values_mut() {
            if claimed.len() >= limit {
                break;
            }
            if !record.is_open(max_attempts) || held_back.contains(&record.aggregate_id) {
                continue;
            }
            if record.is_claimable(kind, max_attempts, stale_before) {
                record.status = OutboxStatus::InFlight;
                record.claimed_at = Some(now);
                self.outbox_claims.insert(record.id, token);
                claimed.push(Claimed::new(record.clone(), token));
            } else {
                held_back.insert(record.aggregate_id);
            }
        }
        claimed
    }

    /// Ends the claim `token` holds on record `id` and returns the record
    /// for its final write.
    fn settle_outbox(
        &mut self,
        id: i64,
        token: ClaimToken,
    ) -> Result<&mut OutboxRecord, DomainError> {
        let record = self
            .outbox
            .get_mut(&id)
            .ok_or_else(|| DomainError::Infrastructure(format!("outbox record {id} not found")))?;
        if record.status != OutboxStatus::InFlight || self.outbox_claims.get(&id) != Some(&token) {
            return Err(DomainError::Conflict(format!(
                "outbox record {id} is no longer claimed by {token}"
            )));
        }
        self.outbox_claims.remove(&id);
        record.claimed_at = None;
        Ok(record)
    }

    fn pending_refund_cents(&self, payment_id: Uuid) -> i64 {
        self.refunds
            .values()
            .map(|leased| &leased.record)
            .filter(|refund| {
                refund.payment_id == payment_id
                    && refund.authorization.status == AuthorizationStatus::Pending
            })
            .map(|refund| refund.amount_cents)
            .sum()
    }
}

/// In-memory store for local runs and tests.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    state: Mutex<State>,
}

impl InMemoryStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> Result<MutexGuard<'_, State>, DomainError> {
        self.state
            .lock()
            .map_err(|_| DomainError::Infrastructure("in-memory store lock poisoned".into()))
    }

    /// Appends outbox events without a business write. Used to seed
    /// fixtures.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Infrastructure` if the store lock is poisoned.
    pub fn append_events(&self, events: &[NewOutboxEvent]) -> Result<(), DomainError> {
        self.state()?.append(events);
        Ok(())
    }

    /// Snapshot of the outbox, in id order.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Infrastructure` if the store lock is poisoned.
    pub fn outbox_records(&self) -> Result<Vec<OutboxRecord>, DomainError> {
        Ok(self.state()?.outbox.values().cloned().collect())
    }

    /// Number of stored payments.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Infrastructure` if the store lock is poisoned.
    pub fn payment_count(&self) -> Result<usize, DomainError> {
        Ok(self.state()?.payments.len())
    }

    /// Number of stored refunds.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Infrastructure` if the store lock is poisoned.
    pub fn refund_count(&self) -> Result<usize, DomainError> {
        Ok(self.state()?.refunds.len())
    }
}

#[async_trait]
impl PaymentRepository for InMemoryStore {
    async fn insert_payment(
        &self,
        payment: &Payment,
        events: &[NewOutboxEvent],
    ) -> Result<(), DomainError> {
        let mut state = self.state()?;
        if state
            .payments
            .values()
            .any(|leased| leased.record.order_id == payment.order_id)
        {
            return Err(DomainError::Conflict(format!(
                "order {} already has a payment",
                payment.order_id
            )));
        }
        state
            .payments
            .insert(payment.id, Leased::new(payment.clone()));
        state.append(events);
        Ok(())
    }

    async fn find_payment(&self, id: Uuid) -> Result<Option<Payment>, DomainError> {
        Ok(self
            .state()?
            .payments
            .get(&id)
            .map(|leased| leased.record.clone()))
    }

    async fn find_payment_by_order(&self, order_id: &str) -> Result<Option<Payment>, DomainError> {
        Ok(self
            .state()?
            .payments
            .values()
            .find(|leased| leased.record.order_id == order_id)
            .map(|leased| leased.record.clone()))
    }
}

#[async_trait]
impl RefundRepository for InMemoryStore {
    async fn insert_refund(
        &self,
        refund: &Refund,
        events: &[NewOutboxEvent],
    ) -> Result<(), DomainError> {
        let mut state = self.state()?;
        let reserved = state.pending_refund_cents(refund.payment_id);
        let payment = state
            .payments
            .get_mut(&refund.payment_id)
            .ok_or(DomainError::NotFound(refund.payment_id))?;

        if refund.authorization.status != AuthorizationStatus::Denied
            && payment.record.refunded_cents + reserved + refund.amount_cents
                > payment.record.amount_cents
        {
            return Err(DomainError::Conflict(format!(
                "refund {} exceeds the refundable amount of payment {}",
                refund.id, refund.payment_id
            )));
        }
        if refund.authorization.status == AuthorizationStatus::Authorized {
            payment.record.refunded_cents += refund.amount_cents;
            payment.record.updated_at = refund.updated_at;
        }
        state.refunds.insert(refund.id, Leased::new(refund.clone()));
        state.append(events);
        Ok(())
    }

    async fn find_refund(&self, id: Uuid) -> Result<Option<Refund>, DomainError> {
        Ok(self
            .state()?
            .refunds
            .get(&id)
            .map(|leased| leased.record.clone()))
    }

    async fn pending_refund_cents(&self, payment_id: Uuid) -> Result<i64, DomainError> {
        Ok(self.state()?.pending_refund_cents(payment_id))
    }
}

#[async_trait]
impl OutboxStore for InMemoryStore {
    async fn claim_pending(
        &self,
        limit: usize,
        max_attempts: u32,
        now: DateTime<Utc>,
        lease: Duration,
    ) -> Result<Vec<Claimed<OutboxRecord>>, DomainError> {
        Ok(self
            .state()?
            .claim(ClaimKind::Pending, limit, max_attempts, now, lease))
    }

    async fn claim_retryable(
        &self,
        limit: usize,
        max_attempts: u32,
        now: DateTime<Utc>,
        lease: Duration,
    ) -> Result<Vec<Claimed<OutboxRecord>>, DomainError> {
        Ok(self
            .state()?
            .claim(ClaimKind::Retry, limit, max_attempts, now, lease))
    }

    async fn mark_dispatched(
        &self,
        id: i64,
        token: ClaimToken,
        now: DateTime<Utc>,
    ) -> Result<(), DomainError> {
        let mut state = self.state()?;
        let record = state.settle_outbox(id, token)?;
        record.status = OutboxStatus::Dispatched;
        record.dispatched_at = Some(now);
        Ok(())
    }

    async fn mark_failed(
        &self,
        id: i64,
        token: ClaimToken,
        error: &str,
    ) -> Result<(), DomainError> {
        let mut state = self.state()?;
        let record = state.settle_outbox(id, token)?;
        record.status = OutboxStatus::Failed;
        record.attempts += 1;
        record.last_error = Some(truncate_error(error));
        Ok(())
    }

    async fn release(&self, id: i64, token: ClaimToken) -> Result<(), DomainError> {
        let mut state = self.state()?;
        let record = state.settle_outbox(id, token)?;
        record.status = record.released_status();
        Ok(())
    }

    async fn count_dead_lettered(&self, max_attempts: u32) -> Result<u64, DomainError> {
        let count = self
            .state()?
            .outbox
            .values()
            .filter(|record| record.is_dead_lettered(max_attempts))
            .count();
        Ok(count as u64)
    }

    async fn purge_dispatched(&self, older_than: DateTime<Utc>) -> Result<u64, DomainError> {
        let mut state = self.state()?;
        let before = state.outbox.len();
        state.outbox.retain(|_, record| {
            !(record.status == OutboxStatus::Dispatched && record.created_at < older_than)
        });
        let State {
            outbox,
            outbox_claims,
            ..
        } = &mut *state;
        outbox_claims.retain(|id, _| outbox.contains_key(id));
        Ok((before - state.outbox.len()) as u64)
    }
}

#[async_trait]
impl IdempotencyStore for InMemoryStore {
    async fn find(
        &self,
        key: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<IdempotencyRecord>, DomainError> {
        Ok(match self.state()?.idempotency.get(key) {
            Some(IdempotencyEntry::Completed(record)) if record.is_live(now) => {
                Some(record.clone())
            }
            _ => None,
        })
    }

    async fn try_claim(
        &self,
        key: &str,
        _endpoint: &str,
        now: DateTime<Utc>,
        lease: Duration,
    ) -> Result<ClaimOutcome, DomainError> {
        let mut state = self.state()?;
        match state.idempotency.get(key) {
            Some(IdempotencyEntry::Completed(record)) if record.is_live(now) => {
                return Ok(ClaimOutcome::Completed(record.clone()));
            }
            Some(IdempotencyEntry::InProgress { locked_until, .. }) if *locked_until > now => {
                return Ok(ClaimOutcome::Held {
                    locked_until: *locked_until,
                });
            }
            _ => {}
        }
        let token = ClaimToken::generate();
        state.idempotency.insert(
            key.to_owned(),
            IdempotencyEntry::InProgress {
                locked_until: clock::after(now, lease),
                token,
            },
        );
        Ok(ClaimOutcome::Acquired(token))
    }

    async fn complete(&self, record: &IdempotencyRecord) -> Result<IdempotencyRecord, DomainError> {
        let mut state = self.state()?;
        if let Some(IdempotencyEntry::Completed(existing)) = state.idempotency.get(&record.key) {
            if existing.is_live(record.created_at) {
                return Ok(existing.clone());
            }
        }
        state.idempotency.insert(
            record.key.clone(),
            IdempotencyEntry::Completed(record.clone()),
        );
        Ok(record.clone())
    }

    async fn release(&self, key: &str, token: ClaimToken) -> Result<(), DomainError> {
        let mut state = self.state()?;
        match state.idempotency.get(key) {
            Some(IdempotencyEntry::InProgress { token: held, .. }) if *held == token => {
                state.idempotency.remove(key);
                Ok(())
            }
            _ => Err(DomainError::Conflict(format!(
                "idempotency key {key} is no longer claimed by {token}"
            ))),
        }
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64, DomainError> {
        let mut state = self.state()?;
        let before = state.idempotency.len();
        state.idempotency.retain(|_, entry| match entry {
            IdempotencyEntry::Completed(record) => record.is_live(now),
            IdempotencyEntry::InProgress { locked_until, .. } => *locked_until > now,
        });
        Ok((before - state.idempotency.len()) as u64)
    }
}

fn claim_leased<T: Reprocessable + Clone>(
    table: &mut HashMap<Uuid, Leased<T>>,
    created_at: impl Fn(&T) -> DateTime<Utc>,
    limit: usize,
    max_attempts: u32,
    now: DateTime<Utc>,
    lease: Duration,
) -> Vec<Claimed<T>> {
    let mut eligible: Vec<&mut Leased<T>> = table
        .values_mut()
        .filter(|leased| leased.record.is_eligible(max_attempts) && leased.is_free(now))
        .collect();
    eligible.sort_by_key(|leased| created_at(&leased.record));

    let locked_until = clock::after(now, lease);
    let token = ClaimToken::generate();
    eligible
        .into_iter()
        .take(limit)
        .map(|leased| {
            leased.locked_until = Some(locked_until);
            leased.claim = Some(token);
            Claimed::new(leased.record.clone(), token)
        })
        .collect()
}

fn count_exhausted<T: Reprocessable>(table: &HashMap<Uuid, Leased<T>>, max_attempts: u32) -> u64 {
    table
        .values()
        .filter(|leased| {
            leased.record.status() == AuthorizationStatus::Pending
                && leased.record.attempts() >= max_attempts
        })
        .count() as u64
}

#[async_trait]
impl ReprocessingStore<Payment> for InMemoryStore {
    async fn claim_pending(
        &self,
        limit: usize,
        max_attempts: u32,
        now: DateTime<Utc>,
        lease: Duration,
    ) -> Result<Vec<Claimed<Payment>>, DomainError> {
        let mut state = self.state()?;
        Ok(claim_leased(
            &mut state.payments,
            |payment| payment.created_at,
            limit,
            max_attempts,
            now,
            lease,
        ))
    }

    async fn count_exhausted(&self, max_attempts: u32) -> Result<u64, DomainError> {
        Ok(count_exhausted(&self.state()?.payments, max_attempts))
    }

    async fn save_attempt(
        &self,
        record: &Payment,
        token: ClaimToken,
        event: Option<NewOutboxEvent>,
    ) -> Result<(), DomainError> {
        let mut state = self.state()?;
        let stored = state
            .payments
            .get_mut(&record.id)
            .ok_or(DomainError::NotFound(record.id))?;
        stored.settle(token)?;
        let refunded_cents = stored.record.refunded_cents;
        stored.record = record.clone();
        stored.record.refunded_cents = refunded_cents;
        state.append(event.as_slice());
        Ok(())
    }
}

#[async_trait]
impl ReprocessingStore<Refund> for InMemoryStore {
    async fn claim_pending(
        &self,
        limit: usize,
        max_attempts: u32,
        now: DateTime<Utc>,
        lease: Duration,
    ) -> Result<Vec<Claimed<Refund>>, DomainError> {
        let mut state = self.state()?;
        Ok(claim_leased(
            &mut state.refunds,
            |refund| refund.created_at,
            limit,
            max_attempts,
            now,
            lease,
        ))
    }

    async fn count_exhausted(&self, max_attempts: u32) -> Result<u64, DomainError> {
        Ok(count_exhausted(&self.state()?.refunds, max_attempts))
    }

    async fn save_attempt(
        &self,
        record: &Refund,
        token: ClaimToken,
        event: Option<NewOutboxEvent>,
    ) -> Result<(), DomainError> {
        let mut state = self.state()?;
        let stored = state
            .refunds
            .get_mut(&record.id)
            .ok_or(DomainError::NotFound(record.id))?;
        stored.settle(token)?;
        let newly_authorized = record.authorization.status == AuthorizationStatus::Authorized;
        stored.record = record.clone();

        if newly_authorized {
            let payment = state
                .payments
                .get_mut(&record.payment_id)
                .ok_or(DomainError::NotFound(record.payment_id))?;
            payment.record.refunded_cents += record.amount_cents;
            payment.record.updated_at = record.updated_at;
        }
        state.append(event.as_slice());
        Ok(())
    }
}
