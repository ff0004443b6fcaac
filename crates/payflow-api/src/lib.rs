//! Payflow API: HTTP surface and background jobs of the payment
//! reliability layer.

pub mod acquirer;
pub mod app;
pub mod config;
pub mod error;
pub mod idempotency;
pub mod jobs;
pub mod routes;
pub mod state;
pub mod telemetry;
