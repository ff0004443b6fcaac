//! Fast tier that is always down, for exercising the best-effort paths.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use payflow_core::idempotency::{FastTier, FastTierError, IdempotencyRecord};

/// A fast tier whose every call fails. Counts the calls it rejected.
#[derive(Debug, Default)]
pub struct FailingFastTier {
    calls: AtomicUsize,
}

impl FailingFastTier {
    /// Number of `get`/`put` calls received.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl FastTier for FailingFastTier {
    async fn get(&self, _key: &str) -> Result<Option<IdempotencyRecord>, FastTierError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(FastTierError::Unavailable("connection refused".into()))
    }

    async fn put(&self, _record: &IdempotencyRecord, _ttl: Duration) -> Result<(), FastTierError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(FastTierError::Unavailable("connection refused".into()))
    }
}
