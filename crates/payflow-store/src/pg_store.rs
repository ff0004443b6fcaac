//! `PostgreSQL` store for payments and refunds.
//!
//! Outbox and idempotency operations live in [`crate::pg_outbox`] and
//! [`crate::pg_idempotency`]; they share this struct and its error mapping.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use payflow_core::authorizer::AuthorizationStatus;
use payflow_core::claim::{ClaimToken, Claimed};
use payflow_core::clock;
use payflow_core::error::DomainError;
use payflow_core::event::NewOutboxEvent;
use payflow_core::reprocess::{Reprocessable, ReprocessingStore};
use payflow_payments::domain::aggregates::{AuthorizationState, Payment, Refund};
use payflow_payments::domain::repository::{PaymentRepository, RefundRepository};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Row};
use tracing::info;
use uuid::Uuid;

use crate::pg_outbox::insert_outbox_events;

const PAYMENT_COLUMNS: &str = "id, order_id, card_token, amount_cents, currency, description, \
     status, attempts, nsu, authorization_code, denial_reason, refunded_cents, created_at, \
     updated_at";

const REFUND_COLUMNS: &str = "id, payment_id, amount_cents, reason, card_token, currency, \
     status, attempts, nsu, authorization_code, denial_reason, created_at, updated_at";

/// PostgreSQL-backed implementation of every Payflow storage trait.
#[derive(Debug, Clone)]
pub struct PgStore {
    pub(crate) pool: PgPool,
}

impl PgStore {
    /// Creates a new `PgStore` over an existing pool.
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connects a pool of at most `max_connections` to `url`.
    ///
    /// # Errors
    ///
    /// Returns `sqlx::Error` if the database is unreachable.
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self, sqlx::Error> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await?;
        Ok(Self::new(pool))
    }

    /// Applies the embedded migrations.
    ///
    /// # Errors
    ///
    /// Returns `sqlx::migrate::MigrateError` if a migration fails.
    pub async fn migrate(&self) -> Result<(), sqlx::migrate::MigrateError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        info!("database migrations applied");
        Ok(())
    }

    /// The underlying pool.
    #[must_use]
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

/// Maps a sqlx error to the domain taxonomy. Unique violations become
/// conflicts; everything else is an infrastructure failure.
pub(crate) fn db_error(error: sqlx::Error) -> DomainError {
    if let sqlx::Error::Database(db) = &error {
        if db.is_unique_violation() {
            return DomainError::Conflict(db.message().to_owned());
        }
    }
    DomainError::Infrastructure(error.to_string())
}

pub(crate) fn to_u32(value: i32, column: &str) -> Result<u32, DomainError> {
    u32::try_from(value)
        .map_err(|_| DomainError::Infrastructure(format!("negative {column}: {value}")))
}

pub(crate) fn to_i32(value: u32) -> i32 {
    i32::try_from(value).unwrap_or(i32::MAX)
}

pub(crate) fn to_i64(value: usize) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

pub(crate) fn to_u64(value: i64) -> u64 {
    u64::try_from(value).unwrap_or_default()
}

fn authorization_from_row(row: &PgRow) -> Result<AuthorizationState, DomainError> {
    let status: String = row.try_get("status").map_err(db_error)?;
    Ok(AuthorizationState {
        status: AuthorizationStatus::parse(&status)
            .ok_or_else(|| DomainError::Infrastructure(format!("unknown status {status}")))?,
        attempts: to_u32(row.try_get("attempts").map_err(db_error)?, "attempts")?,
        nsu: row.try_get("nsu").map_err(db_error)?,
        authorization_code: row.try_get("authorization_code").map_err(db_error)?,
        denial_reason: row.try_get("denial_reason").map_err(db_error)?,
    })
}

fn payment_from_row(row: &PgRow) -> Result<Payment, DomainError> {
    Ok(Payment {
        id: row.try_get("id").map_err(db_error)?,
        order_id: row.try_get("order_id").map_err(db_error)?,
        card_token: row.try_get("card_token").map_err(db_error)?,
        amount_cents: row.try_get("amount_cents").map_err(db_error)?,
        currency: row.try_get("currency").map_err(db_error)?,
        description: row.try_get("description").map_err(db_error)?,
        authorization: authorization_from_row(row)?,
        refunded_cents: row.try_get("refunded_cents").map_err(db_error)?,
        created_at: row.try_get("created_at").map_err(db_error)?,
        updated_at: row.try_get("updated_at").map_err(db_error)?,
    })
}

fn refund_from_row(row: &PgRow) -> Result<Refund, DomainError> {
    Ok(Refund {
        id: row.try_get("id").map_err(db_error)?,
        payment_id: row.try_get("payment_id").map_err(db_error)?,
        amount_cents: row.try_get("amount_cents").map_err(db_error)?,
        reason: row.try_get("reason").map_err(db_error)?,
        card_token: row.try_get("card_token").map_err(db_error)?,
        currency: row.try_get("currency").map_err(db_error)?,
        authorization: authorization_from_row(row)?,
        created_at: row.try_get("created_at").map_err(db_error)?,
        updated_at: row.try_get("updated_at").map_err(db_error)?,
    })
}

impl PgStore {
    async fn pending_refund_total<'e, E>(executor: E, payment_id: Uuid) -> Result<i64, DomainError>
    where
        E: sqlx::PgExecutor<'e>,
    {
        sqlx::query_scalar(
            "SELECT COALESCE(SUM(amount_cents), 0)::BIGINT FROM refunds \
             WHERE payment_id = $1 AND status = 'PENDING'",
        )
        .bind(payment_id)
        .fetch_one(executor)
        .await
        .map_err(db_error)
    }
}

#[async_trait]
impl PaymentRepository for PgStore {
    async fn insert_payment(
        &self,
        payment: &Payment,
        events: &[NewOutboxEvent],
    ) -> Result<(), DomainError> {
        let mut tx = self.pool.begin().await.map_err(db_error)?;
        let auth = &payment.authorization;
        sqlx::query(
            "INSERT INTO payments (id, order_id, card_token, amount_cents, currency, description, \
             status, attempts, nsu, authorization_code, denial_reason, refunded_cents, \
             created_at, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)",
        )
        .bind(payment.id)
        .bind(&payment.order_id)
        .bind(&payment.card_token)
        .bind(payment.amount_cents)
        .bind(&payment.currency)
        .bind(&payment.description)
        .bind(auth.status.as_str())
        .bind(to_i32(auth.attempts))
        .bind(&auth.nsu)
        .bind(&auth.authorization_code)
        .bind(&auth.denial_reason)
        .bind(payment.refunded_cents)
        .bind(payment.created_at)
        .bind(payment.updated_at)
        .execute(&mut *tx)
        .await
        .map_err(db_error)?;

        insert_outbox_events(&mut tx, events).await?;
        tx.commit().await.map_err(db_error)
    }

    async fn find_payment(&self, id: Uuid) -> Result<Option<Payment>, DomainError> {
        let sql = format!("SELECT {PAYMENT_COLUMNS} FROM payments WHERE id = $1");
        sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_error)?
            .as_ref()
            .map(payment_from_row)
            .transpose()
    }

    async fn find_payment_by_order(&self, order_id: &str) -> Result<Option<Payment>, DomainError> {
        let sql = format!("SELECT {PAYMENT_COLUMNS} FROM payments WHERE order_id = $1");
        sqlx::query(&sql)
            .bind(order_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_error)?
            .as_ref()
            .map(payment_from_row)
            .transpose()
    }
}

#[async_trait]
impl RefundRepository for PgStore {
    async fn insert_refund(
        &self,
        refund: &Refund,
        events: &[NewOutboxEvent],
    ) -> Result<(), DomainError> {
        let mut tx = self.pool.begin().await.map_err(db_error)?;

        let payment = sqlx::query(
            "SELECT amount_cents, refunded_cents FROM payments WHERE id = $1 FOR UPDATE",
        )
        .bind(refund.payment_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_error)?
        .ok_or(DomainError::NotFound(refund.payment_id))?;
        let amount_cents: i64 = payment.try_get("amount_cents").map_err(db_error)?;
        let refunded_cents: i64 = payment.try_get("refunded_cents").map_err(db_error)?;
        let reserved = Self::pending_refund_total(&mut *tx, refund.payment_id).await?;

        let auth = &refund.authorization;
        if auth.status != AuthorizationStatus::Denied
            && refunded_cents + reserved + refund.amount_cents > amount_cents
        {
            return Err(DomainError::Conflict(format!(
                "refund {} exceeds the refundable amount of payment {}",
                refund.id, refund.payment_id
            )));
        }

        sqlx::query(
            "INSERT INTO refunds (id, payment_id, amount_cents, reason, card_token, currency, \
             status, attempts, nsu, authorization_code, denial_reason, created_at, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)",
        )
        .bind(refund.id)
        .bind(refund.payment_id)
        .bind(refund.amount_cents)
        .bind(&refund.reason)
        .bind(&refund.card_token)
        .bind(&refund.currency)
        .bind(auth.status.as_str())
        .bind(to_i32(auth.attempts))
        .bind(&auth.nsu)
        .bind(&auth.authorization_code)
        .bind(&auth.denial_reason)
        .bind(refund.created_at)
        .bind(refund.updated_at)
        .execute(&mut *tx)
        .await
        .map_err(db_error)?;

        if auth.status == AuthorizationStatus::Authorized {
            add_refunded(&mut tx, refund).await?;
        }
        insert_outbox_events(&mut tx, events).await?;
        tx.commit().await.map_err(db_error)
    }

    async fn find_refund(&self, id: Uuid) -> Result<Option<Refund>, DomainError> {
        let sql = format!("SELECT {REFUND_COLUMNS} FROM refunds WHERE id = $1");
        sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_error)?
            .as_ref()
            .map(refund_from_row)
            .transpose()
    }

    async fn pending_refund_cents(&self, payment_id: Uuid) -> Result<i64, DomainError> {
        Self::pending_refund_total(&self.pool, payment_id).await
    }
}

async fn add_refunded(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    refund: &Refund,
) -> Result<(), DomainError> {
    sqlx::query(
        "UPDATE payments SET refunded_cents = refunded_cents + $2, updated_at = $3 WHERE id = $1",
    )
    .bind(refund.payment_id)
    .bind(refund.amount_cents)
    .bind(refund.updated_at)
    .execute(&mut **tx)
    .await
    .map_err(db_error)?;
    Ok(())
}

fn claim_sql(table: &str, columns: &str) -> String {
    format!(
        "UPDATE {table} SET locked_until = $4, claim_token = $5 \
         WHERE id IN ( \
             SELECT id FROM {table} \
             WHERE status = 'PENDING' AND attempts < $2 \
               AND (locked_until IS NULL OR locked_until <= $3) \
             ORDER BY created_at \
             LIMIT $1 \
             FOR UPDATE SKIP LOCKED) \
         RETURNING {columns}"
    )
}

async fn count_exhausted_in(
    pool: &PgPool,
    table: &str,
    max_attempts: u32,
) -> Result<u64, DomainError> {
    let sql =
        format!("SELECT COUNT(*) FROM {table} WHERE status = 'PENDING' AND attempts >= $1");
    let count: i64 = sqlx::query_scalar(&sql)
        .bind(to_i32(max_attempts))
        .fetch_one(pool)
        .await
        .map_err(db_error)?;
    Ok(to_u64(count))
}

fn lease_until(now: DateTime<Utc>, lease: Duration) -> DateTime<Utc> {
    clock::after(now, lease)
}

/// Writes an attempt's authorization state, but only while the row is still
/// pending under `token`; the claim is cleared in the same statement.
async fn save_fenced<R: Reprocessable>(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    table: &str,
    record: &R,
    auth: &AuthorizationState,
    updated_at: DateTime<Utc>,
    token: ClaimToken,
) -> Result<(), DomainError> {
    let sql = format!(
        "UPDATE {table} SET status = $2, attempts = $3, nsu = $4, authorization_code = $5, \
         denial_reason = $6, updated_at = $7, locked_until = NULL, claim_token = NULL \
         WHERE id = $1 AND status = 'PENDING' AND claim_token = $8"
    );
    let result = sqlx::query(&sql)
        .bind(record.id())
        .bind(auth.status.as_str())
        .bind(to_i32(auth.attempts))
        .bind(&auth.nsu)
        .bind(&auth.authorization_code)
        .bind(&auth.denial_reason)
        .bind(updated_at)
        .bind(token.as_uuid())
        .execute(&mut **tx)
        .await
        .map_err(db_error)?;
    if result.rows_affected() == 0 {
        return Err(DomainError::Conflict(format!(
            "{} {} is no longer claimed by {token}",
            R::KIND,
            record.id()
        )));
    }
    Ok(())
}

#[async_trait]
impl ReprocessingStore<Payment> for PgStore {
    async fn claim_pending(
        &self,
        limit: usize,
        max_attempts: u32,
        now: DateTime<Utc>,
        lease: Duration,
    ) -> Result<Vec<Claimed<Payment>>, DomainError> {
        let token = ClaimToken::generate();
        let sql = claim_sql("payments", PAYMENT_COLUMNS);
        let rows = sqlx::query(&sql)
            .bind(to_i64(limit))
            .bind(to_i32(max_attempts))
            .bind(now)
            .bind(lease_until(now, lease))
            .bind(token.as_uuid())
            .fetch_all(&self.pool)
            .await
            .map_err(db_error)?;
        let mut payments = rows
            .iter()
            .map(payment_from_row)
            .collect::<Result<Vec<_>, _>>()?;
        payments.sort_by_key(|payment| payment.created_at);
        Ok(payments
            .into_iter()
            .map(|payment| Claimed::new(payment, token))
            .collect())
    }

    async fn count_exhausted(&self, max_attempts: u32) -> Result<u64, DomainError> {
        count_exhausted_in(&self.pool, "payments", max_attempts).await
    }

    async fn save_attempt(
        &self,
        record: &Payment,
        token: ClaimToken,
        event: Option<NewOutboxEvent>,
    ) -> Result<(), DomainError> {
        let mut tx = self.pool.begin().await.map_err(db_error)?;
        save_fenced(
            &mut tx,
            "payments",
            record,
            &record.authorization,
            record.updated_at,
            token,
        )
        .await?;
        insert_outbox_events(&mut tx, event.as_slice()).await?;
        tx.commit().await.map_err(db_error)
    }
}

#[async_trait]
impl ReprocessingStore<Refund> for PgStore {
    async fn claim_pending(
        &self,
        limit: usize,
        max_attempts: u32,
        now: DateTime<Utc>,
        lease: Duration,
    ) -> Result<Vec<Claimed<Refund>>, DomainError> {
        let token = ClaimToken::generate();
        let sql = claim_sql("refunds", REFUND_COLUMNS);
        let rows = sqlx::query(&sql)
            .bind(to_i64(limit))
            .bind(to_i32(max_attempts))
            .bind(now)
            .bind(lease_until(now, lease))
            .bind(token.as_uuid())
            .fetch_all(&self.pool)
            .await
            .map_err(db_error)?;
        let mut refunds = rows
            .iter()
            .map(refund_from_row)
            .collect::<Result<Vec<_>, _>>()?;
        refunds.sort_by_key(|refund| refund.created_at);
        Ok(refunds
            .into_iter()
            .map(|refund| Claimed::new(refund, token))
            .collect())
    }

    async fn count_exhausted(&self, max_attempts: u32) -> Result<u64, DomainError> {
        count_exhausted_in(&self.pool, "refunds", max_attempts).await
    }

    async fn save_attempt(
        &self,
        record: &Refund,
        token: ClaimToken,
        event: Option<NewOutboxEvent>,
    ) -> Result<(), DomainError> {
        let mut tx = self.pool.begin().await.map_err(db_error)?;
        // The fenced update only matches a pending row, so an authorized
        // outcome here is always a transition out of pending.
        save_fenced(
            &mut tx,
            "refunds",
            record,
            &record.authorization,
            record.updated_at,
            token,
        )
        .await?;
        if record.authorization.status == AuthorizationStatus::Authorized {
            add_refunded(&mut tx, record).await?;
        }
        insert_outbox_events(&mut tx, event.as_slice()).await?;
        tx.commit().await.map_err(db_error)
    }
}
