//! Payflow Reprocessing: retries authorizations left `PENDING` when the
//! acquirer could not answer.
//!
//! One [`Reprocessor`] runs per record kind. Each run claims a batch through
//! the kind's `ReprocessingStore`, calls the resilient gateway once per
//! record and saves the attempt together with any status-changed event.

pub mod reprocessor;

pub use reprocessor::{ReprocessReport, Reprocessor, ReprocessorConfig};
