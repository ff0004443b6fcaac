//! Owned, injectable registry of circuit breakers keyed by dependency name.

use std::sync::Arc;

use dashmap::DashMap;

use crate::breaker::{BreakerConfig, CircuitBreaker};

/// Hands out one shared breaker per dependency name.
#[derive(Debug, Default)]
pub struct BreakerRegistry {
    defaults: BreakerConfig,
    breakers: DashMap<String, Arc<CircuitBreaker>>,
}

impl BreakerRegistry {
    /// Creates a registry whose breakers use `defaults` unless configured
    /// otherwise.
    #[must_use]
    pub fn new(defaults: BreakerConfig) -> Self {
        Self {
            defaults,
            breakers: DashMap::new(),
        }
    }

    /// Returns the breaker for `name`, creating it with the default config on
    /// first use.
    pub fn breaker(&self, name: &str) -> Arc<CircuitBreaker> {
        if let Some(existing) = self.breakers.get(name) {
            return Arc::clone(existing.value());
        }
        self.breaker_with(name, self.defaults.clone())
    }

    /// Returns the breaker for `name`, creating it with `config` if it does
    /// not exist yet. An existing breaker keeps its original config.
    pub fn breaker_with(&self, name: &str, config: BreakerConfig) -> Arc<CircuitBreaker> {
        let entry = self
            .breakers
            .entry(name.to_owned())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(name, config)));
        Arc::clone(entry.value())
    }

    /// Names of all registered dependencies.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        self.breakers.iter().map(|entry| entry.key().clone()).collect()
    }
}
