//! `PostgreSQL` implementation of the `IdempotencyStore` trait.
//!
//! The primary key on `idempotency_keys.key` is the serialization point for
//! concurrent first-time requests: only one `INSERT .. ON CONFLICT` can
//! create or take over the row. The winner stamps it with a fresh claim
//! token, and only that token can release it again.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use payflow_core::claim::ClaimToken;
use payflow_core::clock;
use payflow_core::error::DomainError;
use payflow_core::idempotency::{ClaimOutcome, IdempotencyRecord, IdempotencyStore, StoredResponse};
use sqlx::Row;
use sqlx::postgres::PgRow;

use crate::pg_store::{PgStore, db_error};

const IN_PROGRESS: &str = "IN_PROGRESS";
const COMPLETED: &str = "COMPLETED";

/// Attempts at resolving a claim whose competing row vanished between the
/// insert and the read.
const CLAIM_ROUNDS: usize = 3;

fn record_from_row(row: &PgRow) -> Result<IdempotencyRecord, DomainError> {
    let status: i32 = row.try_get("http_status").map_err(db_error)?;
    Ok(IdempotencyRecord {
        key: row.try_get("key").map_err(db_error)?,
        operation_id: row.try_get("operation_id").map_err(db_error)?,
        endpoint: row.try_get("endpoint").map_err(db_error)?,
        response: StoredResponse {
            status: u16::try_from(status).map_err(|_| {
                DomainError::Infrastructure(format!("invalid stored http status {status}"))
            })?,
            content_type: row.try_get("content_type").map_err(db_error)?,
            body: row.try_get("response_body").map_err(db_error)?,
            location: row.try_get("location").map_err(db_error)?,
        },
        created_at: row.try_get("created_at").map_err(db_error)?,
        expires_at: row.try_get("expires_at").map_err(db_error)?,
    })
}

const RECORD_COLUMNS: &str = "key, state, endpoint, operation_id, http_status, content_type, \
     location, response_body, created_at, expires_at, locked_until";

#[async_trait]
impl IdempotencyStore for PgStore {
    async fn find(
        &self,
        key: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<IdempotencyRecord>, DomainError> {
        let sql = format!(
            "SELECT {RECORD_COLUMNS} FROM idempotency_keys \
             WHERE key = $1 AND state = 'COMPLETED' AND expires_at > $2"
        );
        sqlx::query(&sql)
            .bind(key)
            .bind(now)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_error)?
            .as_ref()
            .map(record_from_row)
            .transpose()
    }

    async fn try_claim(
        &self,
        key: &str,
        endpoint: &str,
        now: DateTime<Utc>,
        lease: Duration,
    ) -> Result<ClaimOutcome, DomainError> {
        let locked_until = clock::after(now, lease);
        let token = ClaimToken::generate();
        for _ in 0..CLAIM_ROUNDS {
            let acquired = sqlx::query(
                "INSERT INTO idempotency_keys (key, state, endpoint, created_at, expires_at, \
                 locked_until, claim_token) VALUES ($1, 'IN_PROGRESS', $2, $3, $4, $4, $5) \
                 ON CONFLICT (key) DO UPDATE SET state = 'IN_PROGRESS', \
                     endpoint = EXCLUDED.endpoint, operation_id = NULL, http_status = NULL, \
                     content_type = NULL, location = NULL, response_body = NULL, \
                     created_at = EXCLUDED.created_at, expires_at = EXCLUDED.expires_at, \
                     locked_until = EXCLUDED.locked_until, claim_token = EXCLUDED.claim_token \
                 WHERE (idempotency_keys.state = 'COMPLETED' AND idempotency_keys.expires_at <= $3) \
                    OR (idempotency_keys.state = 'IN_PROGRESS' AND idempotency_keys.locked_until <= $3) \
                 RETURNING key",
            )
            .bind(key)
            .bind(endpoint)
            .bind(now)
            .bind(locked_until)
            .bind(token.as_uuid())
            .fetch_optional(&self.pool)
            .await
            .map_err(db_error)?;
            if acquired.is_some() {
                return Ok(ClaimOutcome::Acquired(token));
            }

            let sql = format!("SELECT {RECORD_COLUMNS} FROM idempotency_keys WHERE key = $1");
            let Some(row) = sqlx::query(&sql)
                .bind(key)
                .fetch_optional(&self.pool)
                .await
                .map_err(db_error)?
            else {
                continue;
            };
            let state: String = row.try_get("state").map_err(db_error)?;
            if state == COMPLETED {
                return Ok(ClaimOutcome::Completed(record_from_row(&row)?));
            }
            let held_until: Option<DateTime<Utc>> =
                row.try_get("locked_until").map_err(db_error)?;
            return Ok(ClaimOutcome::Held {
                locked_until: held_until.unwrap_or(locked_until),
            });
        }
        Ok(ClaimOutcome::Held {
            locked_until: now,
        })
    }

    async fn complete(&self, record: &IdempotencyRecord) -> Result<IdempotencyRecord, DomainError> {
        let response = &record.response;
        sqlx::query(
            "INSERT INTO idempotency_keys (key, state, endpoint, operation_id, http_status, \
             content_type, location, response_body, created_at, expires_at, locked_until, \
             claim_token) \
             VALUES ($1, 'COMPLETED', $2, $3, $4, $5, $9, $6, $7, $8, NULL, NULL) \
             ON CONFLICT (key) DO UPDATE SET state = 'COMPLETED', \
                 endpoint = EXCLUDED.endpoint, operation_id = EXCLUDED.operation_id, \
                 http_status = EXCLUDED.http_status, content_type = EXCLUDED.content_type, \
                 location = EXCLUDED.location, response_body = EXCLUDED.response_body, \
                 created_at = EXCLUDED.created_at, expires_at = EXCLUDED.expires_at, \
                 locked_until = NULL, claim_token = NULL \
             WHERE idempotency_keys.state = 'IN_PROGRESS' \
                OR idempotency_keys.expires_at <= EXCLUDED.created_at",
        )
        .bind(&record.key)
        .bind(&record.endpoint)
        .bind(&record.operation_id)
        .bind(i32::from(response.status))
        .bind(&response.content_type)
        .bind(&response.body)
        .bind(record.created_at)
        .bind(record.expires_at)
        .bind(&response.location)
        .execute(&self.pool)
        .await
        .map_err(db_error)?;

        let sql = format!(
            "SELECT {RECORD_COLUMNS} FROM idempotency_keys WHERE key = $1 AND state = $2"
        );
        let row = sqlx::query(&sql)
            .bind(&record.key)
            .bind(COMPLETED)
            .fetch_one(&self.pool)
            .await
            .map_err(db_error)?;
        record_from_row(&row)
    }

    async fn release(&self, key: &str, token: ClaimToken) -> Result<(), DomainError> {
        let result = sqlx::query(
            "DELETE FROM idempotency_keys WHERE key = $1 AND state = $2 AND claim_token = $3",
        )
        .bind(key)
        .bind(IN_PROGRESS)
        .bind(token.as_uuid())
        .execute(&self.pool)
        .await
        .map_err(db_error)?;
        if result.rows_affected() == 0 {
            return Err(DomainError::Conflict(format!(
                "idempotency key {key} is no longer claimed by {token}"
            )));
        }
        Ok(())
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64, DomainError> {
        let result = sqlx::query("DELETE FROM idempotency_keys WHERE expires_at <= $1")
            .bind(now)
            .execute(&self.pool)
            .await
            .map_err(db_error)?;
        Ok(result.rows_affected())
    }
}
