//! Message broker seam used by the outbox dispatcher.

use async_trait::async_trait;
use thiserror::Error;

use crate::event::EventEnvelope;

/// Failure to hand a message to the broker.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PublishError {
    /// The broker could not be reached.
    #[error("broker transport error: {0}")]
    Transport(String),

    /// The broker refused the message.
    #[error("broker rejected message: {0}")]
    Rejected(String),

    /// The envelope could not be encoded.
    #[error("envelope serialization failed: {0}")]
    Serialization(String),
}

/// Producer side of a message broker.
#[async_trait]
pub trait MessagePublisher: Send + Sync {
    /// Publishes `envelope` to `destination`, using `partition_key` to keep
    /// messages of one aggregate ordered.
    async fn publish(
        &self,
        destination: &str,
        partition_key: &str,
        envelope: &EventEnvelope,
    ) -> Result<(), PublishError>;
}
