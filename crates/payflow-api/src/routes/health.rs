//! Liveness endpoint, with the state of every circuit breaker.

use std::collections::BTreeMap;

use axum::extract::State;
use axum::{Json, Router, routing::get};
use serde::Serialize;

use crate::state::AppState;

/// Health check response.
#[derive(Serialize)]
pub struct HealthResponse {
    /// Service status.
    pub status: &'static str,
    /// Service version.
    pub version: &'static str,
    /// Breaker state by dependency name.
    pub breakers: BTreeMap<String, String>,
}

/// GET /health
///
/// The process is alive whenever it answers; an open breaker shows up in
/// `breakers` without failing the check.
async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let breakers = state
        .breakers
        .names()
        .into_iter()
        .map(|name| {
            let breaker_state = state.breakers.breaker(&name).state().to_string();
            (name, breaker_state)
        })
        .collect();

    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        breakers,
    })
}

/// Returns the health check router.
pub fn router() -> Router<AppState> {
    Router::new().route("/health", get(health_check))
}
