//! Payflow Payments: the business records guarded by the reliability layer.
//!
//! Payments and refunds are authorized through an `AuthorizationGateway`,
//! persisted together with their outbox events, and re-driven by the
//! reprocessing scheduler while they stay pending.

pub mod application;
pub mod domain;
