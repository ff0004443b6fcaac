//! Idempotency gate for the mutating routes.
//!
//! Every guarded request must carry an `Idempotency-Key`. The first request
//! for a key runs the handler and, when the outcome is 2xx or 3xx, the
//! response is captured. Later requests with the same key get the captured
//! status, body, `Content-Type` and `Location` back unchanged. Failed
//! attempts are not captured, so a retry runs the handler again.

use axum::body::{Body, to_bytes};
use axum::extract::{Request, State};
use axum::http::header::{CONTENT_TYPE, LOCATION};
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use payflow_core::claim::ClaimToken;
use payflow_core::idempotency::StoredResponse;
use payflow_idempotency::Begin;
use tracing::{error, info, warn};

use crate::error::ApiError;
use crate::state::AppState;

/// Request header carrying the client's idempotency key.
pub const IDEMPOTENCY_KEY: &str = "idempotency-key";

/// Response header telling whether the response is a replay.
pub const IDEMPOTENT_REPLAYED: &str = "idempotent-replayed";

/// Captured responses larger than this are not buffered.
const MAX_CAPTURED_BODY: usize = 1024 * 1024;

/// Business identifier a handler attaches to its response for traceability
/// of the captured record.
#[derive(Debug, Clone)]
pub struct OperationId(pub String);

/// Middleware enforcing replay semantics on the routes it wraps.
pub async fn idempotency_gate(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let Some(key) = request
        .headers()
        .get(IDEMPOTENCY_KEY)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|key| !key.is_empty())
        .map(str::to_owned)
    else {
        return ApiError::MissingIdempotencyKey.into_response();
    };
    let endpoint = format!("{} {}", request.method(), request.uri().path());

    let token = match state.idempotency.begin(&key, &endpoint).await {
        Ok(Begin::Execute(token)) => token,
        Ok(Begin::Replay(stored)) => {
            info!(key = %key, endpoint = %endpoint, "replaying captured response");
            metrics::counter!("payflow_idempotency_replays_total").increment(1);
            return replay(stored);
        }
        Ok(Begin::InProgress) => return ApiError::IdempotencyInProgress.into_response(),
        Ok(Begin::EndpointMismatch { original }) => {
            return ApiError::IdempotencyKeyReused { original }.into_response();
        }
        Err(e) => return ApiError::from(e).into_response(),
    };

    let response = next.run(request).await;
    let claim = Claim {
        key: &key,
        endpoint: &endpoint,
        token,
    };
    capture(&state, &claim, response).await
}

/// The key this request holds while its handler runs.
struct Claim<'a> {
    key: &'a str,
    endpoint: &'a str,
    token: ClaimToken,
}

async fn capture(state: &AppState, claim: &Claim<'_>, response: Response) -> Response {
    let key = claim.key;
    let status = response.status();
    if !(status.is_success() || status.is_redirection()) {
        abandon(state, claim).await;
        return mark_replayed(response, false);
    }

    let (parts, body) = response.into_parts();
    let bytes = match to_bytes(body, MAX_CAPTURED_BODY).await {
        Ok(bytes) => bytes,
        Err(e) => {
            error!(key, error = %e, "failed to buffer response for capture");
            abandon(state, claim).await;
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    match String::from_utf8(bytes.to_vec()) {
        Ok(text) => {
            let stored = stored_response(status, &parts.headers, text);
            let operation_id = parts
                .extensions
                .get::<OperationId>()
                .map(|id| id.0.clone());
            if let Err(e) = state
                .idempotency
                .store(
                    key,
                    operation_id,
                    claim.endpoint,
                    stored,
                    state.idempotency.ttl(),
                )
                .await
            {
                error!(key, error = %e, "failed to capture response");
                abandon(state, claim).await;
            }
        }
        Err(_) => {
            warn!(key, "response body is not UTF-8, not capturing");
            abandon(state, claim).await;
        }
    }

    mark_replayed(Response::from_parts(parts, Body::from(bytes)), false)
}

async fn abandon(state: &AppState, claim: &Claim<'_>) {
    if let Err(e) = state.idempotency.abandon(claim.key, claim.token).await {
        error!(key = claim.key, error = %e, "failed to release idempotency claim");
    }
}

fn header_text(headers: &HeaderMap, name: &HeaderName) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::to_owned)
}

fn stored_response(status: StatusCode, headers: &HeaderMap, body: String) -> StoredResponse {
    StoredResponse {
        status: status.as_u16(),
        content_type: header_text(headers, &CONTENT_TYPE),
        body,
        location: header_text(headers, &LOCATION),
    }
}

fn replay(stored: StoredResponse) -> Response {
    let status = StatusCode::from_u16(stored.status).unwrap_or(StatusCode::OK);
    let mut response = (status, stored.body).into_response();
    let headers = response.headers_mut();
    for (name, value) in [(CONTENT_TYPE, stored.content_type), (LOCATION, stored.location)] {
        match value.as_deref().map(HeaderValue::from_str) {
            Some(Ok(value)) => {
                headers.insert(name, value);
            }
            Some(Err(_)) | None => {
                headers.remove(name);
            }
        }
    }
    mark_replayed(response, true)
}

fn mark_replayed(mut response: Response, replayed: bool) -> Response {
    response.headers_mut().insert(
        IDEMPOTENT_REPLAYED,
        HeaderValue::from_static(if replayed { "true" } else { "false" }),
    );
    response
}
