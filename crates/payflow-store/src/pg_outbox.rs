//! `PostgreSQL` implementation of the `OutboxStore` trait.
//!
//! Claims lock candidate rows with `FOR UPDATE SKIP LOCKED`, so concurrent
//! dispatchers never take the same row. A skipped row may still be an
//! earlier record of some aggregate, so every candidate also carries the
//! ids of the open records before it; a candidate is kept only when all of
//! those were locked by this claim too.
//!
//! Claimed rows carry the claim's token in `claim_token`; the finishing
//! updates match on it and on `IN_FLIGHT`, so a dispatcher whose lease
//! elapsed cannot overwrite what the next claim did.

use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use payflow_core::claim::{ClaimToken, Claimed};
use payflow_core::clock;
use payflow_core::error::DomainError;
use payflow_core::event::NewOutboxEvent;
use payflow_core::outbox::{ClaimKind, OutboxRecord, OutboxStatus, OutboxStore, truncate_error};
use sqlx::postgres::PgRow;
use sqlx::{Postgres, Row, Transaction};

use crate::pg_store::{PgStore, db_error, to_i32, to_i64, to_u32, to_u64};

const OUTBOX_COLUMNS: &str = "id, event_id, aggregate_id, aggregate_type, event_type, payload, \
     destination, status, attempts, last_error, created_at, claimed_at, dispatched_at";

/// Appends `events` to the outbox inside the caller's transaction.
pub(crate) async fn insert_outbox_events(
    tx: &mut Transaction<'_, Postgres>,
    events: &[NewOutboxEvent],
) -> Result<(), DomainError> {
    for event in events {
        sqlx::query(
            "INSERT INTO outbox (event_id, aggregate_id, aggregate_type, event_type, payload, \
             destination, status, attempts, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6, 'PENDING', 0, $7)",
        )
        .bind(event.event_id)
        .bind(event.aggregate_id)
        .bind(&event.aggregate_type)
        .bind(&event.event_type)
        .bind(&event.payload)
        .bind(&event.destination)
        .bind(event.occurred_at)
        .execute(&mut **tx)
        .await
        .map_err(db_error)?;
    }
    Ok(())
}

fn record_from_row(row: &PgRow) -> Result<OutboxRecord, DomainError> {
    let status: String = row.try_get("status").map_err(db_error)?;
    Ok(OutboxRecord {
        id: row.try_get("id").map_err(db_error)?,
        event_id: row.try_get("event_id").map_err(db_error)?,
        aggregate_id: row.try_get("aggregate_id").map_err(db_error)?,
        aggregate_type: row.try_get("aggregate_type").map_err(db_error)?,
        event_type: row.try_get("event_type").map_err(db_error)?,
        payload: row.try_get("payload").map_err(db_error)?,
        destination: row.try_get("destination").map_err(db_error)?,
        status: OutboxStatus::parse(&status)
            .ok_or_else(|| DomainError::Infrastructure(format!("unknown outbox status {status}")))?,
        attempts: to_u32(row.try_get("attempts").map_err(db_error)?, "attempts")?,
        last_error: row.try_get("last_error").map_err(db_error)?,
        created_at: row.try_get("created_at").map_err(db_error)?,
        claimed_at: row.try_get("claimed_at").map_err(db_error)?,
        dispatched_at: row.try_get("dispatched_at").map_err(db_error)?,
    })
}

/// SQL predicate selecting records a claim of `kind` may take, for the
/// table alias `t`. `$2` is `max_attempts`, `$3` the stale-claim cutoff.
fn claimable(kind: ClaimKind, t: &str) -> String {
    match kind {
        ClaimKind::Pending => format!(
            "({t}.status = 'PENDING' OR ({t}.status = 'IN_FLIGHT' AND {t}.attempts = 0 \
             AND {t}.claimed_at <= $3))"
        ),
        ClaimKind::Retry => format!(
            "(({t}.status = 'FAILED' AND {t}.attempts < $2) OR ({t}.status = 'IN_FLIGHT' \
             AND {t}.attempts > 0 AND {t}.claimed_at <= $3))"
        ),
    }
}

/// SQL predicate for records that are neither dispatched nor dead-lettered.
fn open(t: &str) -> String {
    format!("({t}.status <> 'DISPATCHED' AND NOT ({t}.status = 'FAILED' AND {t}.attempts >= $2))")
}

fn candidates_sql(kind: ClaimKind) -> String {
    let claimable_o = claimable(kind, "o");
    let claimable_e = claimable(kind, "e");
    let open_e = open("e");
    format!(
        "SELECT o.id, ARRAY( \
             SELECT e.id FROM outbox e \
             WHERE e.aggregate_id = o.aggregate_id AND e.id < o.id AND {open_e} \
             ORDER BY e.id) AS earlier_open \
         FROM outbox o \
         WHERE {claimable_o} \
           AND NOT EXISTS ( \
               SELECT 1 FROM outbox e \
               WHERE e.aggregate_id = o.aggregate_id AND e.id < o.id AND {open_e} \
                 AND NOT {claimable_e}) \
         ORDER BY o.id \
         LIMIT $1 \
         FOR UPDATE OF o SKIP LOCKED"
    )
}

impl PgStore {
    async fn claim(
        &self,
        kind: ClaimKind,
        limit: usize,
        max_attempts: u32,
        now: DateTime<Utc>,
        lease: Duration,
    ) -> Result<Vec<Claimed<OutboxRecord>>, DomainError> {
        let mut tx = self.pool.begin().await.map_err(db_error)?;

        let sql = candidates_sql(kind);
        let candidates = sqlx::query(&sql)
            .bind(to_i64(limit))
            .bind(to_i32(max_attempts))
            .bind(clock::before(now, lease))
            .fetch_all(&mut *tx)
            .await
            .map_err(db_error)?;

        let mut kept: HashSet<i64> = HashSet::new();
        let mut ids = Vec::new();
        for row in &candidates {
            let id: i64 = row.try_get("id").map_err(db_error)?;
            let earlier_open: Vec<i64> = row.try_get("earlier_open").map_err(db_error)?;
            if earlier_open.iter().all(|earlier| kept.contains(earlier)) {
                kept.insert(id);
                ids.push(id);
            }
        }
        if ids.is_empty() {
            tx.commit().await.map_err(db_error)?;
            return Ok(Vec::new());
        }

        let token = ClaimToken::generate();
        let sql = format!(
            "UPDATE outbox SET status = 'IN_FLIGHT', claimed_at = $2, claim_token = $3 \
             WHERE id = ANY($1) RETURNING {OUTBOX_COLUMNS}"
        );
        let rows = sqlx::query(&sql)
            .bind(&ids)
            .bind(now)
            .bind(token.as_uuid())
            .fetch_all(&mut *tx)
            .await
            .map_err(db_error)?;
        tx.commit().await.map_err(db_error)?;

        let mut records = rows
            .iter()
            .map(record_from_row)
            .collect::<Result<Vec<_>, _>>()?;
        records.sort_by_key(|record| record.id);
        Ok(records
            .into_iter()
            .map(|record| Claimed::new(record, token))
            .collect())
    }
}

/// Maps a fenced update that matched no row to a lost claim.
fn fenced(rows_affected: u64, id: i64, token: ClaimToken) -> Result<(), DomainError> {
    if rows_affected == 0 {
        return Err(DomainError::Conflict(format!(
            "outbox record {id} is no longer claimed by {token}"
        )));
    }
    Ok(())
}

#[async_trait]
impl OutboxStore for PgStore {
    async fn claim_pending(
        &self,
        limit: usize,
        max_attempts: u32,
        now: DateTime<Utc>,
        lease: Duration,
    ) -> Result<Vec<Claimed<OutboxRecord>>, DomainError> {
        self.claim(ClaimKind::Pending, limit, max_attempts, now, lease)
            .await
    }

    async fn claim_retryable(
        &self,
        limit: usize,
        max_attempts: u32,
        now: DateTime<Utc>,
        lease: Duration,
    ) -> Result<Vec<Claimed<OutboxRecord>>, DomainError> {
        self.claim(ClaimKind::Retry, limit, max_attempts, now, lease)
            .await
    }

    async fn mark_dispatched(
        &self,
        id: i64,
        token: ClaimToken,
        now: DateTime<Utc>,
    ) -> Result<(), DomainError> {
        let result = sqlx::query(
            "UPDATE outbox SET status = 'DISPATCHED', dispatched_at = $3, claimed_at = NULL, \
             claim_token = NULL \
             WHERE id = $1 AND status = 'IN_FLIGHT' AND claim_token = $2",
        )
        .bind(id)
        .bind(token.as_uuid())
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(db_error)?;
        fenced(result.rows_affected(), id, token)
    }

    async fn mark_failed(
        &self,
        id: i64,
        token: ClaimToken,
        error: &str,
    ) -> Result<(), DomainError> {
        let result = sqlx::query(
            "UPDATE outbox SET status = 'FAILED', attempts = attempts + 1, last_error = $3, \
             claimed_at = NULL, claim_token = NULL \
             WHERE id = $1 AND status = 'IN_FLIGHT' AND claim_token = $2",
        )
        .bind(id)
        .bind(token.as_uuid())
        .bind(truncate_error(error))
        .execute(&self.pool)
        .await
        .map_err(db_error)?;
        fenced(result.rows_affected(), id, token)
    }

    async fn release(&self, id: i64, token: ClaimToken) -> Result<(), DomainError> {
        let result = sqlx::query(
            "UPDATE outbox \
             SET status = CASE WHEN attempts = 0 THEN 'PENDING' ELSE 'FAILED' END, \
                 claimed_at = NULL, claim_token = NULL \
             WHERE id = $1 AND status = 'IN_FLIGHT' AND claim_token = $2",
        )
        .bind(id)
        .bind(token.as_uuid())
        .execute(&self.pool)
        .await
        .map_err(db_error)?;
        fenced(result.rows_affected(), id, token)
    }

    async fn count_dead_lettered(&self, max_attempts: u32) -> Result<u64, DomainError> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM outbox WHERE status = 'FAILED' AND attempts >= $1",
        )
        .bind(to_i32(max_attempts))
        .fetch_one(&self.pool)
        .await
        .map_err(db_error)?;
        Ok(to_u64(count))
    }

    async fn purge_dispatched(&self, older_than: DateTime<Utc>) -> Result<u64, DomainError> {
        let result =
            sqlx::query("DELETE FROM outbox WHERE status = 'DISPATCHED' AND created_at < $1")
                .bind(older_than)
                .execute(&self.pool)
                .await
                .map_err(db_error)?;
        Ok(result.rows_affected())
    }
}
