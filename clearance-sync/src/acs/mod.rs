//! Access-control system (ACS) client boundary.
//!
//! Every response from the ACS is collapsed into a closed set of variants
//! here: [`GrantOutcome`], [`RevokeOutcome`] and [`AcsError`]. Nothing above
//! this module sees raw HTTP or JSON.

pub mod ccure;
pub mod mock;

use async_trait::async_trait;
use service_core::retry::Retryable;
use std::collections::HashSet;
use thiserror::Error;

pub use ccure::{CcureClient, CcureConfig};
pub use mock::{MockAcsClient, MockCall};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AcsError {
    /// Credentials rejected. Retrying will not help.
    #[error("ACS authentication failed: {0}")]
    Auth(String),

    /// Network failure, timeout, rate limit or server-side error.
    #[error("ACS unavailable: {0}")]
    Unavailable(String),

    /// The person is unknown to the ACS.
    #[error("Not found in ACS: {0}")]
    NotFound(String),

    /// The ACS understood the request and refused it.
    #[error("ACS rejected request: {0}")]
    Rejected(String),
}

impl AcsError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Auth(_) => "auth",
            Self::Unavailable(_) => "unavailable",
            Self::NotFound(_) => "not_found",
            Self::Rejected(_) => "rejected",
        }
    }
}

impl Retryable for AcsError {
    fn is_retryable(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GrantOutcome {
    Granted,
    AlreadyGranted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RevokeOutcome {
    Revoked,
    NotGranted,
}

/// Behavioral contract of the remote access-control system.
///
/// Implementations hold the authenticated session internally; after
/// `authenticate` succeeds the client is shared read-only across the
/// reconciler's concurrent per-person chains.
#[async_trait]
pub trait AcsClient: Send + Sync {
    /// Establish (or refresh) the ACS session.
    async fn authenticate(&self) -> Result<(), AcsError>;

    /// Clearance ids currently granted to `person_id`.
    ///
    /// Returns `AcsError::NotFound` when the person is unknown.
    async fn fetch_grants(&self, person_id: &str) -> Result<HashSet<String>, AcsError>;

    async fn grant(&self, person_id: &str, clearance_id: &str) -> Result<GrantOutcome, AcsError>;

    async fn revoke(&self, person_id: &str, clearance_id: &str)
        -> Result<RevokeOutcome, AcsError>;
}
