//! Broker publishers.
//!
//! `HttpBrokerPublisher` speaks the REST proxy protocol
//! (`POST {base}/topics/{topic}` with a `records` array). `LogPublisher` only
//! writes the envelope to the log and is meant for local runs without a
//! broker.

use std::time::Duration;

use async_trait::async_trait;
use payflow_core::broker::{MessagePublisher, PublishError};
use payflow_core::event::EventEnvelope;
use serde::Serialize;
use tracing::info;

/// Publishes by logging each envelope.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogPublisher;

#[async_trait]
impl MessagePublisher for LogPublisher {
    async fn publish(
        &self,
        destination: &str,
        partition_key: &str,
        envelope: &EventEnvelope,
    ) -> Result<(), PublishError> {
        let body = serde_json::to_string(envelope)
            .map_err(|e| PublishError::Serialization(e.to_string()))?;
        info!(
            destination,
            partition_key,
            event_id = %envelope.event_id,
            event_type = %envelope.event_type,
            envelope = %body,
            "event published"
        );
        Ok(())
    }
}

#[derive(Serialize)]
struct ProduceRequest<'a> {
    records: [ProduceRecord<'a>; 1],
}

#[derive(Serialize)]
struct ProduceRecord<'a> {
    key: &'a str,
    value: &'a EventEnvelope,
}

/// Publishes through a broker REST proxy.
#[derive(Debug, Clone)]
pub struct HttpBrokerPublisher {
    client: reqwest::Client,
    base_url: String,
}

impl HttpBrokerPublisher {
    /// Creates a publisher for the proxy at `base_url`; every request is
    /// bounded by `timeout`.
    ///
    /// # Errors
    ///
    /// Returns `reqwest::Error` if the HTTP client cannot be built.
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_owned(),
        })
    }

    fn topic_url(&self, destination: &str) -> String {
        format!("{}/topics/{destination}", self.base_url)
    }
}

#[async_trait]
impl MessagePublisher for HttpBrokerPublisher {
    async fn publish(
        &self,
        destination: &str,
        partition_key: &str,
        envelope: &EventEnvelope,
    ) -> Result<(), PublishError> {
        let request = ProduceRequest {
            records: [ProduceRecord {
                key: partition_key,
                value: envelope,
            }],
        };
        let response = self
            .client
            .post(self.topic_url(destination))
            .json(&request)
            .send()
            .await
            .map_err(|e| PublishError::Transport(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let detail = response.text().await.unwrap_or_default();
        Err(PublishError::Rejected(format!("{status}: {detail}")))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use axum::extract::{Path, State};
    use axum::http::StatusCode;
    use axum::routing::post;
    use axum::{Json, Router};
    use payflow_test_support::fixed_now;
    use uuid::Uuid;

    use super::*;

    type Captured = Arc<Mutex<Vec<(String, serde_json::Value)>>>;

    async fn produce(
        State(captured): State<Captured>,
        Path(topic): Path<String>,
        Json(body): Json<serde_json::Value>,
    ) -> StatusCode {
        if topic == "closed" {
            return StatusCode::FORBIDDEN;
        }
        captured.lock().unwrap().push((topic, body));
        StatusCode::OK
    }

    async fn spawn_proxy() -> (String, Captured) {
        let captured: Captured = Arc::default();
        let app = Router::new()
            .route("/topics/{topic}", post(produce))
            .with_state(captured.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{addr}"), captured)
    }

    fn envelope() -> EventEnvelope {
        EventEnvelope {
            event_id: Uuid::new_v4(),
            event_type: "payment.created".into(),
            aggregate_id: Uuid::new_v4(),
            aggregate_type: "payment".into(),
            timestamp: fixed_now(),
            payload: serde_json::json!({ "amount_cents": 100 }),
        }
    }

    #[tokio::test]
    async fn test_http_publisher_posts_keyed_record_to_topic() {
        // Arrange
        let (base_url, captured) = spawn_proxy().await;
        let publisher = HttpBrokerPublisher::new(base_url, Duration::from_secs(2)).unwrap();
        let envelope = envelope();

        // Act
        publisher
            .publish("payments.events", "partition-1", &envelope)
            .await
            .unwrap();

        // Assert
        let captured = captured.lock().unwrap();
        assert_eq!(captured.len(), 1);
        let (topic, body) = &captured[0];
        assert_eq!(topic, "payments.events");
        assert_eq!(body["records"][0]["key"], "partition-1");
        assert_eq!(body["records"][0]["value"]["eventType"], "payment.created");
        assert_eq!(
            body["records"][0]["value"]["eventId"],
            envelope.event_id.to_string()
        );
    }

    #[tokio::test]
    async fn test_http_publisher_maps_refusal_to_rejected() {
        // Arrange
        let (base_url, _captured) = spawn_proxy().await;
        let publisher = HttpBrokerPublisher::new(base_url, Duration::from_secs(2)).unwrap();

        // Act
        let result = publisher.publish("closed", "k", &envelope()).await;

        // Assert
        assert!(matches!(result, Err(PublishError::Rejected(msg)) if msg.starts_with("403")));
    }

    #[tokio::test]
    async fn test_http_publisher_maps_unreachable_broker_to_transport() {
        // Arrange: bind then drop to get a port nobody listens on.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let publisher =
            HttpBrokerPublisher::new(format!("http://{addr}"), Duration::from_secs(2)).unwrap();

        // Act
        let result = publisher.publish("payments.events", "k", &envelope()).await;

        // Assert
        assert!(matches!(result, Err(PublishError::Transport(_))));
    }

    #[tokio::test]
    async fn test_log_publisher_accepts_everything() {
        let result = LogPublisher.publish("payments.events", "k", &envelope()).await;

        assert!(result.is_ok());
    }
}
