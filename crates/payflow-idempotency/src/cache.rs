//! `IdempotencyCache`: the two-tier lookup, capture and claim protocol.

use std::sync::Arc;
use std::time::Duration;

use payflow_core::claim::ClaimToken;
use payflow_core::clock::{self, Clock};
use payflow_core::error::DomainError;
use payflow_core::idempotency::{
    ClaimOutcome, FastTier, IdempotencyRecord, IdempotencyStore, StoredResponse,
};
use tokio::time::Instant;
use tracing::{debug, warn};

/// Cache tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdempotencyConfig {
    /// How long a captured response is replayed.
    pub ttl: Duration,
    /// How long an in-progress claim is exclusive. A claim older than this
    /// belongs to a crashed request and may be taken over.
    pub lock_lease: Duration,
    /// How long a request waits for a concurrent holder of its key.
    pub wait_timeout: Duration,
    /// Delay between checks while waiting.
    pub poll_interval: Duration,
}

impl Default for IdempotencyConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(24 * 3600),
            lock_lease: Duration::from_secs(30),
            wait_timeout: Duration::from_secs(5),
            poll_interval: Duration::from_millis(100),
        }
    }
}

/// What the caller of [`IdempotencyCache::begin`] must do next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Begin {
    /// The key is claimed by this request: run the handler, then `store` or
    /// `abandon` with the token.
    Execute(ClaimToken),
    /// The key already has a response; send it back unchanged.
    Replay(StoredResponse),
    /// Another request still holds the key after the wait timeout.
    InProgress,
    /// The key was first used on a different endpoint.
    EndpointMismatch {
        /// Endpoint of the original request.
        original: String,
    },
}

/// Two-tier idempotency cache.
pub struct IdempotencyCache {
    durable: Arc<dyn IdempotencyStore>,
    fast: Arc<dyn FastTier>,
    clock: Arc<dyn Clock>,
    config: IdempotencyConfig,
}

impl IdempotencyCache {
    /// Creates a cache over the given tiers.
    #[must_use]
    pub fn new(
        durable: Arc<dyn IdempotencyStore>,
        fast: Arc<dyn FastTier>,
        clock: Arc<dyn Clock>,
        config: IdempotencyConfig,
    ) -> Self {
        Self {
            durable,
            fast,
            clock,
            config,
        }
    }

    /// Replay window for captured responses.
    #[must_use]
    pub fn ttl(&self) -> Duration {
        self.config.ttl
    }

    /// Returns the live response stored for `key`, if any.
    ///
    /// # Errors
    ///
    /// Returns `DomainError` if the durable tier fails. Fast-tier failures
    /// only cost a durable read.
    pub async fn lookup(&self, key: &str) -> Result<Option<StoredResponse>, DomainError> {
        Ok(self.lookup_record(key).await?.map(|record| record.response))
    }

    /// Captures the response for `key`. The durable tier decides: when a
    /// response was already captured for the key, that one is kept and
    /// returned.
    ///
    /// # Errors
    ///
    /// Returns `DomainError` if the durable tier fails.
    pub async fn store(
        &self,
        key: &str,
        operation_id: Option<String>,
        endpoint: &str,
        response: StoredResponse,
        ttl: Duration,
    ) -> Result<IdempotencyRecord, DomainError> {
        let now = self.clock.now();
        let record = IdempotencyRecord {
            key: key.to_owned(),
            operation_id,
            endpoint: endpoint.to_owned(),
            response,
            created_at: now,
            expires_at: clock::after(now, ttl),
        };
        let stored = self.durable.complete(&record).await?;
        if stored != record {
            debug!(key, "response already captured for key, keeping the first");
        }
        self.warm(&stored).await;
        Ok(stored)
    }

    /// Resolves `key` before the guarded handler runs.
    ///
    /// Replays a captured response, or claims the key for this request. While
    /// another request holds the claim, polls until it completes, is
    /// abandoned, or the wait timeout elapses.
    ///
    /// # Errors
    ///
    /// Returns `DomainError` if the durable tier fails.
    pub async fn begin(&self, key: &str, endpoint: &str) -> Result<Begin, DomainError> {
        let deadline = Instant::now() + self.config.wait_timeout;
        loop {
            if let Some(record) = self.lookup_record(key).await? {
                return Ok(Self::resolve(record, endpoint));
            }

            let outcome = self
                .durable
                .try_claim(key, endpoint, self.clock.now(), self.config.lock_lease)
                .await?;
            match outcome {
                ClaimOutcome::Acquired(token) => {
                    debug!(key, endpoint, %token, "idempotency key claimed");
                    return Ok(Begin::Execute(token));
                }
                ClaimOutcome::Completed(record) => {
                    self.warm(&record).await;
                    return Ok(Self::resolve(record, endpoint));
                }
                ClaimOutcome::Held { locked_until } => {
                    if Instant::now() >= deadline {
                        warn!(key, %locked_until, "gave up waiting for concurrent request");
                        return Ok(Begin::InProgress);
                    }
                    tokio::time::sleep(self.config.poll_interval).await;
                }
            }
        }
    }

    /// Drops this request's claim on `key` so a retry can run the handler.
    /// A claim that lapsed and was taken over by another request is left to
    /// its new holder.
    ///
    /// # Errors
    ///
    /// Returns `DomainError` if the durable tier fails.
    pub async fn abandon(&self, key: &str, token: ClaimToken) -> Result<(), DomainError> {
        match self.durable.release(key, token).await {
            Err(DomainError::Conflict(reason)) => {
                warn!(key, %reason, "idempotency claim was taken over, not releasing it");
                Ok(())
            }
            other => other,
        }
    }

    /// Deletes expired durable records.
    ///
    /// # Errors
    ///
    /// Returns `DomainError` if the durable tier fails.
    pub async fn purge_expired(&self) -> Result<u64, DomainError> {
        self.durable.purge_expired(self.clock.now()).await
    }

    fn resolve(record: IdempotencyRecord, endpoint: &str) -> Begin {
        if record.endpoint == endpoint {
            Begin::Replay(record.response)
        } else {
            Begin::EndpointMismatch {
                original: record.endpoint,
            }
        }
    }

    async fn lookup_record(&self, key: &str) -> Result<Option<IdempotencyRecord>, DomainError> {
        let now = self.clock.now();
        match self.fast.get(key).await {
            Ok(Some(record)) if record.is_live(now) => return Ok(Some(record)),
            Ok(_) => {}
            Err(e) => {
                metrics::counter!("payflow_idempotency_fast_tier_errors_total", "operation" => "get")
                    .increment(1);
                warn!(key, error = %e, "fast tier read failed");
            }
        }

        let record = self.durable.find(key, now).await?;
        if let Some(record) = &record {
            self.warm(record).await;
        }
        Ok(record)
    }

    async fn warm(&self, record: &IdempotencyRecord) {
        let Some(ttl) = clock::remaining(self.clock.now(), record.expires_at) else {
            return;
        };
        if let Err(e) = self.fast.put(record, ttl).await {
            metrics::counter!("payflow_idempotency_fast_tier_errors_total", "operation" => "put")
                .increment(1);
            warn!(key = %record.key, error = %e, "fast tier write failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fast_tier::MemoryFastTier;
    use payflow_store::InMemoryStore;
    use payflow_test_support::{FailingFastTier, ManualClock};

    const ENDPOINT: &str = "POST /api/v1/payments";

    fn response(body: &str) -> StoredResponse {
        StoredResponse {
            status: 201,
            content_type: Some("application/json".into()),
            body: body.into(),
            location: None,
        }
    }

    struct Harness {
        durable: Arc<InMemoryStore>,
        clock: Arc<ManualClock>,
        cache: Arc<IdempotencyCache>,
    }

    fn harness_with(fast: Arc<dyn FastTier>) -> Harness {
        let durable = Arc::new(InMemoryStore::new());
        let clock = Arc::new(ManualClock::default());
        let cache = Arc::new(IdempotencyCache::new(
            durable.clone(),
            fast,
            clock.clone(),
            IdempotencyConfig::default(),
        ));
        Harness {
            durable,
            clock,
            cache,
        }
    }

    fn harness() -> Harness {
        harness_with(Arc::new(MemoryFastTier::new()))
    }

    #[tokio::test]
    async fn test_begin_on_fresh_key_executes() {
        let h = harness();

        let begin = h.cache.begin("key-1", ENDPOINT).await.unwrap();

        assert!(matches!(begin, Begin::Execute(_)));
    }

    #[tokio::test]
    async fn test_stored_response_is_replayed_byte_for_byte() {
        // Arrange
        let h = harness();
        h.cache.begin("key-1", ENDPOINT).await.unwrap();
        h.cache
            .store("key-1", Some("pay-1".into()), ENDPOINT, response("{\"id\":\"pay-1\"}"), h.cache.ttl())
            .await
            .unwrap();

        // Act
        let begin = h.cache.begin("key-1", ENDPOINT).await.unwrap();
        let looked_up = h.cache.lookup("key-1").await.unwrap();

        // Assert
        assert_eq!(begin, Begin::Replay(response("{\"id\":\"pay-1\"}")));
        assert_eq!(looked_up, Some(response("{\"id\":\"pay-1\"}")));
    }

    #[tokio::test]
    async fn test_first_captured_response_wins() {
        // Arrange
        let h = harness();
        h.cache.begin("key-1", ENDPOINT).await.unwrap();
        h.cache
            .store("key-1", None, ENDPOINT, response("first"), h.cache.ttl())
            .await
            .unwrap();

        // Act
        let second = h
            .cache
            .store("key-1", None, ENDPOINT, response("second"), h.cache.ttl())
            .await
            .unwrap();

        // Assert
        assert_eq!(second.response.body, "first");
        assert_eq!(h.cache.lookup("key-1").await.unwrap(), Some(response("first")));
    }

    #[tokio::test]
    async fn test_durable_hit_repopulates_fast_tier() {
        // Arrange
        let fast = Arc::new(MemoryFastTier::new());
        let h = harness_with(fast.clone());
        let now = h.clock.now();
        h.durable
            .complete(&IdempotencyRecord {
                key: "key-1".into(),
                operation_id: None,
                endpoint: ENDPOINT.into(),
                response: response("durable"),
                created_at: now,
                expires_at: clock::after(now, Duration::from_secs(60)),
            })
            .await
            .unwrap();

        // Act
        let found = h.cache.lookup("key-1").await.unwrap();

        // Assert
        assert_eq!(found, Some(response("durable")));
        let cached = fast.get("key-1").await.unwrap().unwrap();
        assert_eq!(cached.response.body, "durable");
    }

    #[tokio::test]
    async fn test_fast_tier_outage_is_invisible_to_callers() {
        // Arrange
        let fast = Arc::new(FailingFastTier::default());
        let h = harness_with(fast.clone());

        // Act
        let begin = h.cache.begin("key-1", ENDPOINT).await.unwrap();
        h.cache
            .store("key-1", None, ENDPOINT, response("ok"), h.cache.ttl())
            .await
            .unwrap();
        let replay = h.cache.begin("key-1", ENDPOINT).await.unwrap();

        // Assert
        assert!(matches!(begin, Begin::Execute(_)));
        assert_eq!(replay, Begin::Replay(response("ok")));
        assert!(fast.calls() >= 3);
    }

    #[tokio::test]
    async fn test_key_reused_on_another_endpoint_is_reported() {
        // Arrange
        let h = harness();
        h.cache.begin("key-1", ENDPOINT).await.unwrap();
        h.cache
            .store("key-1", None, ENDPOINT, response("ok"), h.cache.ttl())
            .await
            .unwrap();

        // Act
        let begin = h
            .cache
            .begin("key-1", "POST /api/v1/payments/abc/refunds")
            .await
            .unwrap();

        // Assert
        assert_eq!(
            begin,
            Begin::EndpointMismatch {
                original: ENDPOINT.into()
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_request_times_out_while_key_is_held() {
        // Arrange
        let h = harness();
        h.cache.begin("key-1", ENDPOINT).await.unwrap();

        // Act
        let begin = h.cache.begin("key-1", ENDPOINT).await.unwrap();

        // Assert
        assert_eq!(begin, Begin::InProgress);
    }

    #[tokio::test(start_paused = true)]
    async fn test_waiting_request_replays_once_holder_completes() {
        // Arrange
        let h = harness();
        h.cache.begin("key-1", ENDPOINT).await.unwrap();
        let holder = h.cache.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(350)).await;
            holder
                .store("key-1", None, ENDPOINT, response("done"), holder.ttl())
                .await
                .unwrap();
        });

        // Act
        let begin = h.cache.begin("key-1", ENDPOINT).await.unwrap();

        // Assert
        assert_eq!(begin, Begin::Replay(response("done")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_waiting_request_executes_once_holder_abandons() {
        // Arrange
        let h = harness();
        let Begin::Execute(token) = h.cache.begin("key-1", ENDPOINT).await.unwrap() else {
            panic!("expected the first request to execute");
        };
        let holder = h.cache.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(250)).await;
            holder.abandon("key-1", token).await.unwrap();
        });

        // Act
        let begin = h.cache.begin("key-1", ENDPOINT).await.unwrap();

        // Assert
        assert!(matches!(begin, Begin::Execute(next) if next != token));
    }

    #[tokio::test]
    async fn test_stale_claim_is_taken_over_after_lease() {
        // Arrange
        let h = harness();
        h.cache.begin("key-1", ENDPOINT).await.unwrap();
        h.clock.advance(IdempotencyConfig::default().lock_lease);

        // Act
        let begin = h.cache.begin("key-1", ENDPOINT).await.unwrap();

        // Assert
        assert!(matches!(begin, Begin::Execute(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandon_after_takeover_leaves_the_new_claim() {
        // Arrange: the first request outlives its lease and a retry takes
        // the key over.
        let h = harness();
        let Begin::Execute(stale) = h.cache.begin("key-1", ENDPOINT).await.unwrap() else {
            panic!("expected the first request to execute");
        };
        h.clock
            .advance(IdempotencyConfig::default().lock_lease + Duration::from_secs(1));
        let takeover = h.cache.begin("key-1", ENDPOINT).await.unwrap();

        // Act: the first request's handler fails and it abandons the key.
        h.cache.abandon("key-1", stale).await.unwrap();
        let third = h.cache.begin("key-1", ENDPOINT).await.unwrap();

        // Assert: the retry still owns the key.
        assert!(matches!(takeover, Begin::Execute(token) if token != stale));
        assert_eq!(third, Begin::InProgress);
    }

    #[tokio::test]
    async fn test_expired_response_is_not_replayed_and_is_purged() {
        // Arrange
        let h = harness();
        h.cache.begin("key-1", ENDPOINT).await.unwrap();
        h.cache
            .store("key-1", None, ENDPOINT, response("old"), Duration::from_secs(60))
            .await
            .unwrap();
        h.clock.advance(Duration::from_secs(61));

        // Act
        let lookup = h.cache.lookup("key-1").await.unwrap();
        let purged = h.cache.purge_expired().await.unwrap();
        let begin = h.cache.begin("key-1", ENDPOINT).await.unwrap();

        // Assert
        assert_eq!(lookup, None);
        assert_eq!(purged, 1);
        assert!(matches!(begin, Begin::Execute(_)));
    }
}
