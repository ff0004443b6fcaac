//! Idempotency records and the durable-tier storage contract.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::claim::ClaimToken;
use crate::error::DomainError;

/// A captured HTTP response, replayed verbatim for repeated keys.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredResponse {
    /// HTTP status code.
    pub status: u16,
    /// `Content-Type` of the original response, if any.
    pub content_type: Option<String>,
    /// Exact response body.
    pub body: String,
    /// `Location` of a redirect or created resource, if the original set one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
}

/// A completed idempotency entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdempotencyRecord {
    /// Client-supplied key.
    pub key: String,
    /// Business identifier produced by the handler, for traceability.
    pub operation_id: Option<String>,
    /// `METHOD /path` the key was first used on.
    pub endpoint: String,
    /// The captured response.
    pub response: StoredResponse,
    /// When the response was captured.
    pub created_at: DateTime<Utc>,
    /// When the entry stops being replayed.
    pub expires_at: DateTime<Utc>,
}

impl IdempotencyRecord {
    /// Whether the record is still replayable at `now`.
    #[must_use]
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.expires_at > now
    }
}

/// Result of trying to claim a key before running the guarded handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimOutcome {
    /// The caller owns the key and must run the handler, then complete or
    /// release the claim. Releasing requires the token.
    Acquired(ClaimToken),
    /// A live response already exists for the key.
    Completed(IdempotencyRecord),
    /// Another request holds the key until `locked_until`.
    Held {
        /// When the other holder's claim lapses.
        locked_until: DateTime<Utc>,
    },
}

/// Durable tier of the idempotency cache. Authoritative; its unique key is
/// the serialization point for concurrent first-time requests.
#[async_trait]
pub trait IdempotencyStore: Send + Sync {
    /// Returns the completed record for `key` if it has not expired.
    async fn find(
        &self,
        key: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<IdempotencyRecord>, DomainError>;

    /// Inserts an in-progress claim for `key` unless a live record or a live
    /// claim already exists. Expired records and lapsed claims are taken over.
    async fn try_claim(
        &self,
        key: &str,
        endpoint: &str,
        now: DateTime<Utc>,
        lease: Duration,
    ) -> Result<ClaimOutcome, DomainError>;

    /// Writes the completed record. The first completion wins: if the key is
    /// already completed, the existing record is returned unchanged.
    async fn complete(&self, record: &IdempotencyRecord) -> Result<IdempotencyRecord, DomainError>;

    /// Drops the in-progress claim stamped with `token` so the key can be
    /// retried. Completed records are left untouched.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::Conflict` when the key is no longer held under
    /// `token`: the claim lapsed and another request took it over, or it was
    /// completed.
    async fn release(&self, key: &str, token: ClaimToken) -> Result<(), DomainError>;

    /// Deletes records that expired at or before `now`.
    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64, DomainError>;
}

/// Failure of the volatile tier. Never surfaced to clients.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FastTierError {
    /// The backing service could not be reached.
    #[error("fast tier unavailable: {0}")]
    Unavailable(String),

    /// A cached value could not be encoded or decoded.
    #[error("fast tier codec error: {0}")]
    Codec(String),
}

/// Volatile tier of the idempotency cache. Best effort: misses and errors
/// fall back to the durable tier.
#[async_trait]
pub trait FastTier: Send + Sync {
    /// Returns the cached record for `key`, if present and not expired.
    async fn get(&self, key: &str) -> Result<Option<IdempotencyRecord>, FastTierError>;

    /// Caches `record` for `ttl`.
    async fn put(&self, record: &IdempotencyRecord, ttl: Duration) -> Result<(), FastTierError>;
}
