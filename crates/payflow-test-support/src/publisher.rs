//! Recording broker: a `MessagePublisher` that keeps what it was given.

use std::collections::HashSet;
use std::sync::Mutex;

use async_trait::async_trait;
use payflow_core::broker::{MessagePublisher, PublishError};
use payflow_core::event::EventEnvelope;
use uuid::Uuid;

/// One captured publish call.
#[derive(Debug, Clone)]
pub struct Published {
    /// Topic or queue name.
    pub destination: String,
    /// Partition key.
    pub partition_key: String,
    /// The message.
    pub envelope: EventEnvelope,
}

/// A broker that records successful publishes. Individual aggregates can be
/// made to fail, or the whole broker taken down.
#[derive(Debug, Default)]
pub struct RecordingPublisher {
    published: Mutex<Vec<Published>>,
    failing_aggregates: Mutex<HashSet<Uuid>>,
    down: Mutex<bool>,
}

impl RecordingPublisher {
    /// Creates a healthy publisher.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every publish for `aggregate_id` fail until healed.
    ///
    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned.
    pub fn fail_aggregate(&self, aggregate_id: Uuid) {
        self.failing_aggregates.lock().unwrap().insert(aggregate_id);
    }

    /// Takes the whole broker down (`true`) or brings it back (`false`).
    ///
    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned.
    pub fn set_down(&self, down: bool) {
        *self.down.lock().unwrap() = down;
    }

    /// Clears all injected failures.
    ///
    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned.
    pub fn heal(&self) {
        self.failing_aggregates.lock().unwrap().clear();
        *self.down.lock().unwrap() = false;
    }

    /// Snapshot of every successful publish, in order.
    ///
    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned.
    pub fn published(&self) -> Vec<Published> {
        self.published.lock().unwrap().clone()
    }

    /// Event types published for `aggregate_id`, in order.
    ///
    /// # Panics
    ///
    /// Panics if the internal mutex is poisoned.
    pub fn event_types_for(&self, aggregate_id: Uuid) -> Vec<String> {
        self.published
            .lock()
            .unwrap()
            .iter()
            .filter(|p| p.envelope.aggregate_id == aggregate_id)
            .map(|p| p.envelope.event_type.clone())
            .collect()
    }
}

#[async_trait]
impl MessagePublisher for RecordingPublisher {
    async fn publish(
        &self,
        destination: &str,
        partition_key: &str,
        envelope: &EventEnvelope,
    ) -> Result<(), PublishError> {
        if *self.down.lock().unwrap() {
            return Err(PublishError::Transport("broker unreachable".into()));
        }
        if self
            .failing_aggregates
            .lock()
            .unwrap()
            .contains(&envelope.aggregate_id)
        {
            return Err(PublishError::Rejected(format!(
                "partition for {} unavailable",
                envelope.aggregate_id
            )));
        }
        self.published.lock().unwrap().push(Published {
            destination: destination.to_owned(),
            partition_key: partition_key.to_owned(),
            envelope: envelope.clone(),
        });
        Ok(())
    }
}
