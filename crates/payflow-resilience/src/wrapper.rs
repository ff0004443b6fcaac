//! `ResilientAuthorizer`: the acquirer wrapped in bulkhead, circuit breaker,
//! retry and a hard per-call timeout, degrading to a pending outcome.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use payflow_core::authorizer::{
    AuthorizationGateway, AuthorizationOutcome, AuthorizationRequest, Authorizer,
    AuthorizerDecision, AuthorizerError,
};
use payflow_core::clock::Clock;
use tracing::{debug, warn};

use crate::breaker::CircuitBreaker;
use crate::bulkhead::Bulkhead;
use crate::retry::RetryPolicy;

/// Knobs for everything except the breaker, which is injected already built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResilienceSettings {
    /// Maximum concurrent calls to the acquirer.
    pub bulkhead_max_concurrent: usize,
    /// Retry behavior for transient failures.
    pub retry: RetryPolicy,
    /// Hard deadline for each individual call.
    pub call_timeout: Duration,
}

impl Default for ResilienceSettings {
    fn default() -> Self {
        Self {
            bulkhead_max_concurrent: 25,
            retry: RetryPolicy::default(),
            call_timeout: Duration::from_secs(2),
        }
    }
}

/// The acquirer behind the full resilience stack.
pub struct ResilientAuthorizer {
    inner: Arc<dyn Authorizer>,
    breaker: Arc<CircuitBreaker>,
    bulkhead: Bulkhead,
    retry: RetryPolicy,
    call_timeout: Duration,
    clock: Arc<dyn Clock>,
}

impl ResilientAuthorizer {
    /// Wraps `inner`, sharing `breaker` with any other wrapper of the same
    /// dependency.
    #[must_use]
    pub fn new(
        inner: Arc<dyn Authorizer>,
        breaker: Arc<CircuitBreaker>,
        settings: &ResilienceSettings,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            bulkhead: Bulkhead::new(breaker.name(), settings.bulkhead_max_concurrent),
            inner,
            breaker,
            retry: settings.retry,
            call_timeout: settings.call_timeout,
            clock,
        }
    }

    /// The breaker guarding the acquirer.
    #[must_use]
    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    async fn attempt(
        &self,
        request: &AuthorizationRequest,
        attempt: u32,
    ) -> Result<AuthorizerDecision, AuthorizerError> {
        debug!(dependency = %self.breaker.name(), attempt, "calling acquirer");
        match tokio::time::timeout(self.call_timeout, self.inner.authorize(request)).await {
            Ok(result) => result,
            Err(_elapsed) => Err(AuthorizerError::Timeout),
        }
    }

    fn fallback(&self, reason: &'static str) -> AuthorizationOutcome {
        metrics::counter!(
            "payflow_authorizer_calls_total",
            "dependency" => self.breaker.name().to_owned(),
            "outcome" => reason
        )
        .increment(1);
        AuthorizationOutcome::Pending
    }
}

#[async_trait]
impl AuthorizationGateway for ResilientAuthorizer {
    async fn authorize(&self, request: &AuthorizationRequest) -> AuthorizationOutcome {
        let Some(_slot) = self.bulkhead.try_enter() else {
            warn!(dependency = %self.breaker.name(), "bulkhead full, falling back to pending");
            return self.fallback("bulkhead_full");
        };

        let Some(permit) = self.breaker.try_acquire(self.clock.now()) else {
            debug!(dependency = %self.breaker.name(), "circuit open, falling back to pending");
            return self.fallback("circuit_open");
        };

        let result = self
            .retry
            .run(
                |attempt| self.attempt(request, attempt),
                AuthorizerError::is_transient,
            )
            .await;

        match result {
            Ok(decision) => {
                permit.record_success();
                let outcome = AuthorizationOutcome::from(decision);
                let label = match outcome {
                    AuthorizationOutcome::Authorized { .. } => "authorized",
                    AuthorizationOutcome::Denied { .. } => "denied",
                    AuthorizationOutcome::Pending => "pending",
                };
                metrics::counter!(
                    "payflow_authorizer_calls_total",
                    "dependency" => self.breaker.name().to_owned(),
                    "outcome" => label
                )
                .increment(1);
                outcome
            }
            Err(error) => {
                warn!(
                    dependency = %self.breaker.name(),
                    %error,
                    "acquirer unavailable, falling back to pending"
                );
                permit.record_failure(self.clock.now());
                self.fallback("exhausted")
            }
        }
    }
}
