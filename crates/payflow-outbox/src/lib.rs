//! Payflow Outbox: delivers events appended by business transactions to
//! the message broker.
//!
//! The [`OutboxDispatcher`] claims batches from an `OutboxStore`, publishes
//! them in order through a `MessagePublisher` and records the result on each
//! row. Delivery is at-least-once: a crash between publish and mark leaves
//! the row claimed, and it is redelivered once its claim lease elapses.

pub mod dispatcher;
pub mod publisher;

pub use dispatcher::{DispatchReport, DispatcherConfig, OutboxDispatcher};
pub use publisher::{HttpBrokerPublisher, LogPublisher};

pub use payflow_core::broker::{MessagePublisher, PublishError};
