//! Claim tokens fencing the work a claim-then-process step does.
//!
//! Every claim stamps the rows it takes with a fresh token. Writes that
//! finish the work must present the same token; once the lease lapsed and
//! another worker re-claimed the row, the old token no longer matches and
//! the late write is refused with [`DomainError::Conflict`].
//!
//! [`DomainError::Conflict`]: crate::error::DomainError::Conflict

use std::fmt;

use uuid::Uuid;

/// Identifies one claim.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClaimToken(Uuid);

impl ClaimToken {
    /// Generates a token for a new claim.
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    /// Rebuilds a token read back from storage.
    #[must_use]
    pub fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }

    /// The underlying identifier, for persistence.
    #[must_use]
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl fmt::Display for ClaimToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// A record taken by a claim, with the token that finishes it.
#[derive(Debug, Clone, PartialEq)]
pub struct Claimed<T> {
    /// The claimed record as of the claim.
    pub record: T,
    /// Token to present when saving the result.
    pub token: ClaimToken,
}

impl<T> Claimed<T> {
    /// Pairs `record` with `token`.
    pub fn new(record: T, token: ClaimToken) -> Self {
        Self { record, token }
    }
}
