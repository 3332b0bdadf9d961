use crate::acs::AcsError;
use service_core::error::AppError;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("A sync run is already in progress")]
    ConcurrentRun,

    #[error("Service is shutting down")]
    ShuttingDown,

    #[error("ACS authentication failed: {0}")]
    Auth(AcsError),

    #[error("ACS unavailable: {0}")]
    Acs(AcsError),

    #[error("State store unavailable: {0}")]
    StateStore(AppError),

    #[error("Sync run {0} not found")]
    RunNotFound(Uuid),
}

impl From<AcsError> for SyncError {
    fn from(err: AcsError) -> Self {
        match err {
            AcsError::Auth(_) => SyncError::Auth(err),
            other => SyncError::Acs(other),
        }
    }
}

impl From<SyncError> for AppError {
    fn from(err: SyncError) -> Self {
        match err {
            SyncError::ConcurrentRun => AppError::Conflict(anyhow::anyhow!(err.to_string())),
            SyncError::ShuttingDown => AppError::ServiceUnavailable,
            SyncError::RunNotFound(_) => AppError::NotFound(anyhow::anyhow!(err.to_string())),
            SyncError::Auth(e) => AppError::AuthError(anyhow::anyhow!(e.to_string())),
            SyncError::Acs(e) => AppError::BadGateway(e.to_string()),
            SyncError::StateStore(e) => e,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_concurrent_run_maps_to_conflict() {
        let err: AppError = SyncError::ConcurrentRun.into();
        assert!(matches!(err, AppError::Conflict(_)));

        let err: AppError = SyncError::ShuttingDown.into();
        assert!(matches!(err, AppError::ServiceUnavailable));
    }

    #[test]
    fn test_acs_errors_split_on_auth() {
        assert!(matches!(
            SyncError::from(AcsError::Auth("bad password".into())),
            SyncError::Auth(_)
        ));
        assert!(matches!(
            SyncError::from(AcsError::Unavailable("timeout".into())),
            SyncError::Acs(_)
        ));
    }
}
