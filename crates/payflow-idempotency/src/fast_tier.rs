//! Fast-tier implementations.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use payflow_core::idempotency::{FastTier, FastTierError, IdempotencyRecord};
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, RedisError};

/// In-process fast tier. Entries disappear after their TTL.
#[derive(Debug, Default)]
pub struct MemoryFastTier {
    entries: DashMap<String, (IdempotencyRecord, Instant)>,
}

impl MemoryFastTier {
    /// Creates an empty tier.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of entries, expired ones included until they are next read.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the tier holds no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl FastTier for MemoryFastTier {
    async fn get(&self, key: &str) -> Result<Option<IdempotencyRecord>, FastTierError> {
        let now = Instant::now();
        if let Some(entry) = self.entries.get(key) {
            let (record, deadline) = entry.value();
            if *deadline > now {
                return Ok(Some(record.clone()));
            }
        }
        self.entries.remove_if(key, |_, (_, deadline)| *deadline <= now);
        Ok(None)
    }

    async fn put(&self, record: &IdempotencyRecord, ttl: Duration) -> Result<(), FastTierError> {
        self.entries
            .insert(record.key.clone(), (record.clone(), Instant::now() + ttl));
        Ok(())
    }
}

const KEY_PREFIX: &str = "payflow:idempotency:";

/// Redis fast tier. Records are stored as JSON under
/// `payflow:idempotency:{key}` with a Redis-side expiry.
#[derive(Clone)]
pub struct RedisFastTier {
    connection: Arc<ConnectionManager>,
}

impl RedisFastTier {
    /// Connects to the Redis server at `redis_url`.
    ///
    /// # Errors
    ///
    /// Returns `RedisError` if the URL is invalid or the server cannot be
    /// reached.
    pub async fn connect(redis_url: &str) -> Result<Self, RedisError> {
        let client = redis::Client::open(redis_url)?;
        let connection = ConnectionManager::new(client).await?;
        Ok(Self {
            connection: Arc::new(connection),
        })
    }

    fn redis_key(key: &str) -> String {
        format!("{KEY_PREFIX}{key}")
    }
}

fn unavailable(e: &RedisError) -> FastTierError {
    FastTierError::Unavailable(e.to_string())
}

#[async_trait]
impl FastTier for RedisFastTier {
    async fn get(&self, key: &str) -> Result<Option<IdempotencyRecord>, FastTierError> {
        let mut conn = (*self.connection).clone();
        let value: Option<String> = conn
            .get(Self::redis_key(key))
            .await
            .map_err(|e| unavailable(&e))?;
        value
            .map(|json| {
                serde_json::from_str(&json).map_err(|e| FastTierError::Codec(e.to_string()))
            })
            .transpose()
    }

    async fn put(&self, record: &IdempotencyRecord, ttl: Duration) -> Result<(), FastTierError> {
        let json =
            serde_json::to_string(record).map_err(|e| FastTierError::Codec(e.to_string()))?;
        let mut conn = (*self.connection).clone();
        let _: () = conn
            .set_ex(Self::redis_key(&record.key), json, ttl.as_secs().max(1))
            .await
            .map_err(|e| unavailable(&e))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use payflow_core::idempotency::StoredResponse;
    use payflow_test_support::fixed_now;

    fn record(key: &str) -> IdempotencyRecord {
        IdempotencyRecord {
            key: key.into(),
            operation_id: None,
            endpoint: "POST /api/v1/payments".into(),
            response: StoredResponse {
                status: 201,
                content_type: None,
                body: "{}".into(),
                location: None,
            },
            created_at: fixed_now(),
            expires_at: fixed_now(),
        }
    }

    #[tokio::test]
    async fn test_memory_tier_returns_live_entries() {
        let tier = MemoryFastTier::new();

        tier.put(&record("k"), Duration::from_secs(60)).await.unwrap();

        assert_eq!(tier.get("k").await.unwrap(), Some(record("k")));
        assert_eq!(tier.get("other").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_memory_tier_drops_entries_after_ttl() {
        // Arrange
        let tier = MemoryFastTier::new();
        tier.put(&record("k"), Duration::ZERO).await.unwrap();

        // Act
        let found = tier.get("k").await.unwrap();

        // Assert
        assert_eq!(found, None);
        assert!(tier.is_empty());
    }

    #[test]
    fn test_redis_keys_are_namespaced() {
        assert_eq!(RedisFastTier::redis_key("abc"), "payflow:idempotency:abc");
    }
}
