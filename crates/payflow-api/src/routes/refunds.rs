//! Routes for refunds.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Extension, Json, Router};
use serde::Deserialize;
use tracing::instrument;
use uuid::Uuid;

use payflow_payments::application::command_handlers;
use payflow_payments::application::query_handlers::{self, RefundView};
use payflow_payments::domain::commands;

use crate::error::ApiError;
use crate::idempotency::OperationId;
use crate::state::AppState;

/// Request body for POST /api/v1/payments/{id}/refunds.
#[derive(Debug, Deserialize)]
pub struct CreateRefundRequest {
    /// Amount in minor units.
    pub amount_cents: i64,
    /// Free-text reason.
    #[serde(default)]
    pub reason: String,
}

/// POST /api/v1/payments/{id}/refunds
#[instrument(skip(state, request))]
async fn create_refund(
    State(state): State<AppState>,
    Path(payment_id): Path<Uuid>,
    Json(request): Json<CreateRefundRequest>,
) -> Result<(StatusCode, Extension<OperationId>, Json<RefundView>), ApiError> {
    let command = commands::CreateRefund {
        payment_id,
        amount_cents: request.amount_cents,
        reason: request.reason,
    };

    let refund = command_handlers::handle_create_refund(
        &command,
        &state.refund_topic,
        state.gateway.as_ref(),
        state.clock.as_ref(),
        state.payments.as_ref(),
        state.refunds.as_ref(),
    )
    .await?;

    Ok((
        StatusCode::CREATED,
        Extension(OperationId(refund.id.to_string())),
        Json(RefundView::from(refund)),
    ))
}

/// GET /api/v1/refunds/{id}
#[instrument(skip(state))]
async fn get_refund(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<RefundView>, ApiError> {
    let view = query_handlers::get_refund_by_id(id, state.refunds.as_ref()).await?;
    Ok(Json(view))
}

/// Read-only refund routes.
pub fn router() -> Router<AppState> {
    Router::new().route("/api/v1/refunds/{id}", get(get_refund))
}

/// Refund routes that must sit behind the idempotency gate.
pub fn idempotent_router() -> Router<AppState> {
    Router::new().route("/api/v1/payments/{id}/refunds", post(create_refund))
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Arc;

    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use payflow_core::authorizer::AuthorizationOutcome;
    use payflow_core::reprocess::Reprocessable;
    use payflow_idempotency::{IdempotencyCache, IdempotencyConfig, MemoryFastTier};
    use payflow_resilience::{BreakerConfig, BreakerRegistry};
    use payflow_payments::domain::aggregates::Payment;
    use payflow_payments::domain::commands::CreatePayment;
    use payflow_payments::domain::repository::PaymentRepository;
    use payflow_store::InMemoryStore;
    use payflow_test_support::{FixedClock, StaticGateway, fixed_now};
    use serde_json::Value;
    use tower::ServiceExt;

    async fn app_state_with_payment(
        gateway: StaticGateway,
        payment_status: AuthorizationOutcome,
    ) -> (AppState, Uuid) {
        let store = Arc::new(InMemoryStore::new());
        let clock = Arc::new(FixedClock(fixed_now()));
        let mut payment = Payment::new(
            Uuid::new_v4(),
            &CreatePayment {
                order_id: "order-1".into(),
                card_token: "tok_visa_4242".into(),
                amount_cents: 10_000,
                currency: "BRL".into(),
                description: "order".into(),
            },
            fixed_now(),
        );
        payment.record_attempt(&payment_status, fixed_now());
        store.insert_payment(&payment, &[]).await.unwrap();

        let state = AppState {
            clock: clock.clone(),
            gateway: Arc::new(gateway),
            payments: store.clone(),
            refunds: store.clone(),
            breakers: Arc::new(BreakerRegistry::new(BreakerConfig::default())),
            idempotency: Arc::new(IdempotencyCache::new(
                store,
                Arc::new(MemoryFastTier::new()),
                clock,
                IdempotencyConfig::default(),
            )),
            payment_topic: "payments.events".into(),
            refund_topic: "refunds.events".into(),
        };
        (state, payment.id)
    }

    fn approved() -> AuthorizationOutcome {
        AuthorizationOutcome::Authorized {
            nsu: "000001".into(),
            authorization_code: "AUTH1".into(),
        }
    }

    fn post_refund(payment_id: Uuid, amount_cents: i64) -> Request<Body> {
        let body = serde_json::json!({ "amount_cents": amount_cents, "reason": "damaged" });
        Request::builder()
            .method("POST")
            .uri(format!("/api/v1/payments/{payment_id}/refunds"))
            .header("content-type", "application/json")
            .body(Body::from(serde_json::to_vec(&body).unwrap()))
            .unwrap()
    }

    async fn json_of(response: axum::response::Response) -> Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_refund_of_authorized_payment_returns_201() {
        // Arrange
        let (state, payment_id) =
            app_state_with_payment(StaticGateway::approving(), approved()).await;
        let app = idempotent_router().merge(router()).with_state(state);

        // Act
        let response = app
            .clone()
            .oneshot(post_refund(payment_id, 4_000))
            .await
            .unwrap();

        // Assert
        assert_eq!(response.status(), StatusCode::CREATED);
        let json = json_of(response).await;
        assert_eq!(json["status"], "AUTHORIZED");
        assert_eq!(json["payment_id"], payment_id.to_string());
        let refund_id = json["id"].as_str().unwrap().to_owned();
        let request = Request::builder()
            .uri(format!("/api/v1/refunds/{refund_id}"))
            .body(Body::empty())
            .unwrap();
        let fetched = app.oneshot(request).await.unwrap();
        assert_eq!(fetched.status(), StatusCode::OK);
        assert_eq!(json_of(fetched).await["amount_cents"], 4_000);
    }

    #[tokio::test]
    async fn test_refund_above_refundable_amount_returns_400() {
        let (state, payment_id) =
            app_state_with_payment(StaticGateway::approving(), approved()).await;
        let app = idempotent_router().with_state(state);

        let response = app.oneshot(post_refund(payment_id, 10_001)).await.unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_refund_of_pending_payment_returns_409() {
        let (state, payment_id) =
            app_state_with_payment(StaticGateway::approving(), AuthorizationOutcome::Pending)
                .await;
        let app = idempotent_router().with_state(state);

        let response = app.oneshot(post_refund(payment_id, 100)).await.unwrap();

        assert_eq!(response.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn test_refund_of_unknown_payment_returns_404() {
        let (state, _) = app_state_with_payment(StaticGateway::approving(), approved()).await;
        let app = idempotent_router().with_state(state);

        let response = app.oneshot(post_refund(Uuid::new_v4(), 100)).await.unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
