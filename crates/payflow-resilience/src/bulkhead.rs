//! Bulkhead: a bound on concurrent in-flight calls to one dependency.
//!
//! Callers beyond the bound are not queued; they get `None` and fall back
//! immediately so request latency stays bounded.

use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Concurrency limiter backed by a semaphore.
#[derive(Debug, Clone)]
pub struct Bulkhead {
    name: String,
    permits: Arc<Semaphore>,
    max_concurrent: usize,
}

impl Bulkhead {
    /// Allows at most `max_concurrent` simultaneous calls.
    #[must_use]
    pub fn new(name: impl Into<String>, max_concurrent: usize) -> Self {
        Self {
            name: name.into(),
            permits: Arc::new(Semaphore::new(max_concurrent)),
            max_concurrent,
        }
    }

    /// Takes a slot if one is free. The slot is returned when the permit is
    /// dropped.
    #[must_use]
    pub fn try_enter(&self) -> Option<OwnedSemaphorePermit> {
        let permit = Arc::clone(&self.permits).try_acquire_owned().ok();
        if permit.is_none() {
            tracing::debug!(
                dependency = %self.name,
                max_concurrent = self.max_concurrent,
                "bulkhead full"
            );
        }
        permit
    }

    /// Slots currently free.
    #[must_use]
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }
}
