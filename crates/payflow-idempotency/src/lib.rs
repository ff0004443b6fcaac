//! Payflow Idempotency: guarantees that a retried mutating request observes
//! exactly the original outcome.
//!
//! [`IdempotencyCache`] layers a volatile [`FastTier`] over the
//! authoritative [`IdempotencyStore`]. The durable tier's unique key is the
//! serialization point: concurrent first-time requests with the same key
//! race for an in-progress claim, and only the winner runs the handler.

pub mod cache;
pub mod fast_tier;

pub use cache::{Begin, IdempotencyCache, IdempotencyConfig};
pub use fast_tier::{MemoryFastTier, RedisFastTier};
pub use payflow_core::idempotency::{
    FastTier, FastTierError, IdempotencyRecord, IdempotencyStore, StoredResponse,
};
