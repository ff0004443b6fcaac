//! Payflow Resilience: keeps the service responsive when the acquirer is
//! slow, failing or unreachable.
//!
//! # Data flow
//! ```text
//! ResilientAuthorizer::authorize
//!     → bulkhead.rs        (bounded concurrency, immediate fallback when full)
//!     → breaker.rs         (fail fast while open, single half-open trial)
//!     → retry.rs           (fixed delay, transient failures only)
//!         → hard per-call timeout
//!         → Authorizer collaborator
//!     → fallback: AuthorizationOutcome::Pending
//! ```

pub mod breaker;
pub mod bulkhead;
pub mod registry;
pub mod retry;
pub mod wrapper;

pub use breaker::{BreakerConfig, BreakerState, CallPermit, CircuitBreaker};
pub use bulkhead::Bulkhead;
pub use registry::BreakerRegistry;
pub use retry::RetryPolicy;
pub use wrapper::{ResilienceSettings, ResilientAuthorizer};
