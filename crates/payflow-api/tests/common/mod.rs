//! Shared test helpers for API integration tests.
#![allow(dead_code)]

use std::sync::Arc;

use axum::Router;
use axum::body::{Body, Bytes};
use axum::http::{HeaderMap, Request, StatusCode};
use http_body_util::BodyExt;
use payflow_api::app::{self, Collaborators, Services};
use payflow_api::config::AppConfig;
use payflow_idempotency::MemoryFastTier;
use payflow_store::{InMemoryStore, PgStore};
use payflow_test_support::{ManualClock, RecordingPublisher, ScriptedAuthorizer};
use sqlx::PgPool;
use tower::ServiceExt;

/// The service wired over in-memory infrastructure, with handles on every
/// double.
pub struct TestApp {
    pub router: Router,
    pub services: Services,
    pub store: Arc<InMemoryStore>,
    pub authorizer: Arc<ScriptedAuthorizer>,
    pub publisher: Arc<RecordingPublisher>,
    pub clock: Arc<ManualClock>,
}

/// Builds the full app with the same wiring as `main.rs`, over an in-memory
/// store, a scripted acquirer and a recording broker.
pub fn build_test_app(authorizer: ScriptedAuthorizer) -> TestApp {
    build_test_app_with(authorizer, AppConfig::default())
}

/// Same as [`build_test_app`] with a custom configuration.
pub fn build_test_app_with(authorizer: ScriptedAuthorizer, config: AppConfig) -> TestApp {
    let store = Arc::new(InMemoryStore::new());
    let authorizer = Arc::new(authorizer);
    let publisher = Arc::new(RecordingPublisher::new());
    let clock = Arc::new(ManualClock::default());

    let services = app::assemble(
        store.clone(),
        Collaborators {
            clock: clock.clone(),
            acquirer: authorizer.clone(),
            publisher: publisher.clone(),
            fast_tier: Arc::new(MemoryFastTier::new()),
        },
        &config,
    );
    let router = app::router(services.state.clone());

    TestApp {
        router,
        services,
        store,
        authorizer,
        publisher,
        clock,
    }
}

/// Builds the app over PostgreSQL, for the tests that exercise the durable
/// store end to end.
pub fn build_pg_app(pool: PgPool, authorizer: ScriptedAuthorizer) -> (Router, Services) {
    let services = app::assemble(
        Arc::new(PgStore::new(pool)),
        Collaborators {
            clock: Arc::new(ManualClock::default()),
            acquirer: Arc::new(authorizer),
            publisher: Arc::new(RecordingPublisher::new()),
            fast_tier: Arc::new(MemoryFastTier::new()),
        },
        &AppConfig::default(),
    );
    (app::router(services.state.clone()), services)
}

/// A response split into what tests look at.
pub struct TestResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl TestResponse {
    /// Body parsed as JSON.
    pub fn json(&self) -> serde_json::Value {
        serde_json::from_slice(&self.body).unwrap()
    }

    /// Value of the `Idempotent-Replayed` header.
    pub fn replayed(&self) -> Option<&str> {
        self.headers
            .get("idempotent-replayed")
            .map(|value| value.to_str().unwrap())
    }
}

/// Sends `request` and buffers the response.
pub async fn send(app: Router, request: Request<Body>) -> TestResponse {
    let response = app.oneshot(request).await.unwrap();
    let status = response.status();
    let headers = response.headers().clone();
    let body = response.into_body().collect().await.unwrap().to_bytes();
    TestResponse {
        status,
        headers,
        body,
    }
}

/// Sends a POST with a JSON body and, when given, an `Idempotency-Key`.
pub async fn post_json(
    app: Router,
    uri: &str,
    key: Option<&str>,
    body: &serde_json::Value,
) -> TestResponse {
    let mut builder = Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json");
    if let Some(key) = key {
        builder = builder.header("idempotency-key", key);
    }
    let request = builder
        .body(Body::from(serde_json::to_vec(body).unwrap()))
        .unwrap();
    send(app, request).await
}

/// Sends a GET.
pub async fn get(app: Router, uri: &str) -> TestResponse {
    let request = Request::builder()
        .method("GET")
        .uri(uri)
        .body(Body::empty())
        .unwrap();
    send(app, request).await
}

/// A valid payment body for `order_id`.
pub fn payment_body(order_id: &str) -> serde_json::Value {
    serde_json::json!({
        "order_id": order_id,
        "card_token": "tok_visa_4242",
        "amount_cents": 15_000,
        "currency": "BRL",
        "description": "order"
    })
}
