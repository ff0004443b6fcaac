//! HTTP client for the acquirer's authorization API.

use std::time::Duration;

use async_trait::async_trait;
use payflow_core::authorizer::{
    AuthorizationRequest, Authorizer, AuthorizerDecision, AuthorizerError,
};
use serde::Deserialize;

/// Body of a 200 answer from `POST /authorizations`.
#[derive(Debug, Deserialize)]
struct AuthorizationResponse {
    approved: bool,
    nsu: Option<String>,
    authorization_code: Option<String>,
    reason: Option<String>,
}

/// `Authorizer` backed by the acquirer's REST API.
#[derive(Debug, Clone)]
pub struct HttpAcquirer {
    client: reqwest::Client,
    base_url: String,
}

impl HttpAcquirer {
    /// Creates a client for the acquirer at `base_url`. `timeout` bounds the
    /// whole request at the HTTP layer; the resilience wrapper enforces its
    /// own deadline as well.
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
}

fn transport_error(e: &reqwest::Error) -> AuthorizerError {
    if e.is_timeout() {
        AuthorizerError::Timeout
    } else {
        AuthorizerError::Transport(e.to_string())
    }
}

#[async_trait]
impl Authorizer for HttpAcquirer {
    async fn authorize(
        &self,
        request: &AuthorizationRequest,
    ) -> Result<AuthorizerDecision, AuthorizerError> {
        let response = self
            .client
            .post(format!("{}/authorizations", self.base_url))
            .json(request)
            .send()
            .await
            .map_err(|e| transport_error(&e))?;

        let status = response.status();
        if status.is_server_error() {
            return Err(AuthorizerError::Unavailable(format!("acquirer answered {status}")));
        }
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(AuthorizerError::Protocol(format!("{status}: {detail}")));
        }

        let body: AuthorizationResponse = response
            .json()
            .await
            .map_err(|e| AuthorizerError::Protocol(e.to_string()))?;
        if body.approved {
            match (body.nsu, body.authorization_code) {
                (Some(nsu), Some(authorization_code)) => Ok(AuthorizerDecision::Approved {
                    nsu,
                    authorization_code,
                }),
                _ => Err(AuthorizerError::Protocol(
                    "approval without nsu or authorization_code".into(),
                )),
            }
        } else {
            Ok(AuthorizerDecision::Denied {
                reason: body.reason.unwrap_or_else(|| "declined".to_string()),
            })
        }
    }
}
