//! Authorization outcome model and the collaborator traits around it.
//!
//! Two traits live here:
//! - [`Authorizer`] is the raw external acquirer. It can fail.
//! - [`AuthorizationGateway`] is what business code calls. It never fails:
//!   transient trouble becomes [`AuthorizationOutcome::Pending`].

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Everything the acquirer needs to approve or deny a card operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthorizationRequest {
    /// Tokenized card reference.
    pub card_token: String,
    /// Amount in minor currency units.
    pub amount_cents: i64,
    /// ISO-4217 currency code.
    pub currency: String,
    /// Free-text description shown on the statement.
    pub description: String,
}

/// A business answer from the acquirer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthorizerDecision {
    /// The operation was approved.
    Approved {
        /// Sequential number issued by the acquirer.
        nsu: String,
        /// Authorization code issued by the acquirer.
        authorization_code: String,
    },
    /// The operation was declined. Not an error and never retried.
    Denied {
        /// Reason given by the acquirer.
        reason: String,
    },
}

/// Failure talking to the acquirer.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AuthorizerError {
    /// The call did not complete within its deadline.
    #[error("authorizer call timed out")]
    Timeout,

    /// The acquirer answered but is not able to serve (5xx, maintenance).
    #[error("authorizer unavailable: {0}")]
    Unavailable(String),

    /// Connection could not be established or was reset.
    #[error("authorizer transport error: {0}")]
    Transport(String),

    /// The acquirer answered with something we cannot interpret.
    #[error("authorizer protocol error: {0}")]
    Protocol(String),
}

impl AuthorizerError {
    /// Whether retrying the same request may succeed.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        !matches!(self, Self::Protocol(_))
    }
}

/// External acquirer collaborator.
#[async_trait]
pub trait Authorizer: Send + Sync {
    /// Asks the acquirer to authorize the request.
    async fn authorize(
        &self,
        request: &AuthorizationRequest,
    ) -> Result<AuthorizerDecision, AuthorizerError>;
}

/// Tri-state result of an authorization attempt as seen by business code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthorizationOutcome {
    /// Approved by the acquirer.
    Authorized {
        /// Sequential number issued by the acquirer.
        nsu: String,
        /// Authorization code issued by the acquirer.
        authorization_code: String,
    },
    /// Declined by the acquirer.
    Denied {
        /// Reason given by the acquirer.
        reason: String,
    },
    /// No answer could be obtained; valid, retry later.
    Pending,
}

impl AuthorizationOutcome {
    /// Status a record should carry after this outcome.
    #[must_use]
    pub fn status(&self) -> AuthorizationStatus {
        match self {
            Self::Authorized { .. } => AuthorizationStatus::Authorized,
            Self::Denied { .. } => AuthorizationStatus::Denied,
            Self::Pending => AuthorizationStatus::Pending,
        }
    }
}

impl From<AuthorizerDecision> for AuthorizationOutcome {
    fn from(decision: AuthorizerDecision) -> Self {
        match decision {
            AuthorizerDecision::Approved {
                nsu,
                authorization_code,
            } => Self::Authorized {
                nsu,
                authorization_code,
            },
            AuthorizerDecision::Denied { reason } => Self::Denied { reason },
        }
    }
}

/// Infallible authorization entry point used by handlers and the scheduler.
#[async_trait]
pub trait AuthorizationGateway: Send + Sync {
    /// Authorizes the request, degrading to `Pending` on any downstream trouble.
    async fn authorize(&self, request: &AuthorizationRequest) -> AuthorizationOutcome;
}

/// Persisted status of a payment or refund.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuthorizationStatus {
    /// Waiting for an answer from the acquirer.
    Pending,
    /// Approved.
    Authorized,
    /// Declined.
    Denied,
}

impl AuthorizationStatus {
    /// Column representation.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Authorized => "AUTHORIZED",
            Self::Denied => "DENIED",
        }
    }

    /// Parses the column representation.
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "PENDING" => Some(Self::Pending),
            "AUTHORIZED" => Some(Self::Authorized),
            "DENIED" => Some(Self::Denied),
            _ => None,
        }
    }
}

impl fmt::Display for AuthorizationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_protocol_errors_are_permanent() {
        assert!(AuthorizerError::Timeout.is_transient());
        assert!(AuthorizerError::Unavailable("503".into()).is_transient());
        assert!(AuthorizerError::Transport("reset".into()).is_transient());
        assert!(!AuthorizerError::Protocol("bad json".into()).is_transient());
    }

    #[test]
    fn test_decision_maps_to_outcome_status() {
        let approved: AuthorizationOutcome = AuthorizerDecision::Approved {
            nsu: "000123".into(),
            authorization_code: "A1B2C3".into(),
        }
        .into();
        let denied: AuthorizationOutcome = AuthorizerDecision::Denied {
            reason: "insufficient funds".into(),
        }
        .into();

        assert_eq!(approved.status(), AuthorizationStatus::Authorized);
        assert_eq!(denied.status(), AuthorizationStatus::Denied);
        assert_eq!(
            AuthorizationOutcome::Pending.status(),
            AuthorizationStatus::Pending
        );
    }

    #[test]
    fn test_status_column_round_trip_rejects_unknown() {
        assert_eq!(
            AuthorizationStatus::parse("AUTHORIZED"),
            Some(AuthorizationStatus::Authorized)
        );
        assert_eq!(AuthorizationStatus::parse("authorized"), None);
        assert_eq!(AuthorizationStatus::Denied.to_string(), "DENIED");
    }
}
