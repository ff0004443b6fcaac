//! Routes for payments.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Extension, Json, Router};
use serde::Deserialize;
use tracing::instrument;
use uuid::Uuid;

use payflow_payments::application::query_handlers::{self, PaymentView};
use payflow_payments::application::command_handlers;
use payflow_payments::domain::commands;

use crate::error::ApiError;
use crate::idempotency::OperationId;
use crate::state::AppState;

/// Request body for POST /api/v1/payments.
#[derive(Debug, Deserialize)]
pub struct CreatePaymentRequest {
    /// Merchant order reference; one payment per order.
    pub order_id: String,
    /// Tokenized card reference.
    pub card_token: String,
    /// Amount in minor units.
    pub amount_cents: i64,
    /// ISO-4217 currency code.
    pub currency: String,
    /// Statement description.
    #[serde(default)]
    pub description: String,
}

/// POST /api/v1/payments
#[instrument(skip(state, request), fields(order_id = %request.order_id))]
async fn create_payment(
    State(state): State<AppState>,
    Json(request): Json<CreatePaymentRequest>,
) -> Result<(StatusCode, Extension<OperationId>, Json<PaymentView>), ApiError> {
    let command = commands::CreatePayment {
        order_id: request.order_id,
        card_token: request.card_token,
        amount_cents: request.amount_cents,
        currency: request.currency,
        description: request.description,
    };

    let payment = command_handlers::handle_create_payment(
        &command,
        &state.payment_topic,
        state.gateway.as_ref(),
        state.clock.as_ref(),
        state.payments.as_ref(),
    )
    .await?;

    Ok((
        StatusCode::CREATED,
        Extension(OperationId(payment.id.to_string())),
        Json(PaymentView::from(payment)),
    ))
}

/// GET /api/v1/payments/{id}
#[instrument(skip(state))]
async fn get_payment(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<PaymentView>, ApiError> {
    let view = query_handlers::get_payment_by_id(id, state.payments.as_ref()).await?;
    Ok(Json(view))
}

/// Read-only payment routes.
pub fn router() -> Router<AppState> {
    Router::new().route("/api/v1/payments/{id}", get(get_payment))
}

/// Payment routes that must sit behind the idempotency gate.
pub fn idempotent_router() -> Router<AppState> {
    Router::new().route("/api/v1/payments", post(create_payment))
}
