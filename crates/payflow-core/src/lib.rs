//! Payflow Core: shared abstractions for the payment reliability layer.
//!
//! This crate defines the records, outcome model and storage traits that
//! the outbox, idempotency, resilience and reprocessing crates share. It
//! contains no infrastructure code.

pub mod authorizer;
pub mod broker;
pub mod claim;
pub mod clock;
pub mod error;
pub mod event;
pub mod idempotency;
pub mod outbox;
pub mod reprocess;
