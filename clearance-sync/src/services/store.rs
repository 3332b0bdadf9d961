//! Storage seams used by the reconciler and the control surface.
//!
//! [`Database`](super::Database) implements every trait against PostgreSQL;
//! [`memory`](super::memory) provides the same contracts in process.

use crate::models::{
    AuditEntry, AuditFilter, Clearance, ClearanceAssignment, DesiredSnapshot, LiaisonPermission,
    NewAssignment, SyncRun, Watermark,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use service_core::error::AppError;
use uuid::Uuid;

/// Desired clearance state plus the liaison administration that guards it.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Assignments on enabled clearances.
    ///
    /// With a watermark, only rows written at or after its change cursor or
    /// whose activation window opened or closed in `(since, now]` are
    /// returned. Without one, the full snapshot is returned. The snapshot's
    /// cursor is taken before the rows are read, so a write that commits
    /// concurrently is returned again by the next read rather than skipped.
    async fn list_desired_assignments(
        &self,
        since: Option<&Watermark>,
        now: DateTime<Utc>,
    ) -> Result<DesiredSnapshot, AppError>;

    async fn upsert_clearance(&self, clearance: &Clearance) -> Result<(), AppError>;

    async fn grant_liaison_permission(
        &self,
        liaison_id: &str,
        clearance_id: &str,
    ) -> Result<(), AppError>;

    /// Returns false when the liaison did not hold the permission.
    async fn revoke_liaison_permission(
        &self,
        liaison_id: &str,
        clearance_id: &str,
    ) -> Result<bool, AppError>;

    async fn liaison_permissions(&self, liaison_id: &str)
        -> Result<Vec<LiaisonPermission>, AppError>;

    /// Create or update the single assignment row for (person, clearance).
    ///
    /// Fails with `Forbidden` when the liaison may not manage the clearance
    /// and `NotFound` when the clearance does not exist.
    async fn record_assignment(
        &self,
        assignment: &NewAssignment,
    ) -> Result<ClearanceAssignment, AppError>;
}

/// Append-only audit trail.
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn append(&self, entry: &AuditEntry) -> Result<(), AppError>;

    /// Newest first.
    async fn list(&self, filter: &AuditFilter) -> Result<Vec<AuditEntry>, AppError>;
}

/// Persistence for [`SyncRun`] records.
#[async_trait]
pub trait RunRepository: Send + Sync {
    async fn create_run(&self, run: &SyncRun) -> Result<(), AppError>;

    async fn finish_run(&self, run: &SyncRun) -> Result<(), AppError>;

    async fn get_run(&self, run_id: Uuid) -> Result<Option<SyncRun>, AppError>;

    async fn latest_run(&self) -> Result<Option<SyncRun>, AppError>;

    /// Watermark of the run with the highest change cursor among those that
    /// succeeded with nothing abandoned.
    async fn watermark(&self) -> Result<Option<Watermark>, AppError>;

    /// Mark runs left `running` by a previous process as failed. Returns the
    /// number of runs closed.
    async fn fail_interrupted_runs(&self) -> Result<u64, AppError>;
}

pub(crate) const INTERRUPTED_RUN_MESSAGE: &str = "Run interrupted by service restart";

pub(crate) fn forbidden(liaison_id: &str, clearance_id: &str) -> AppError {
    AppError::Forbidden(anyhow::anyhow!(
        "Liaison {} may not manage clearance {}",
        liaison_id,
        clearance_id
    ))
}

pub(crate) fn unknown_clearance(clearance_id: &str) -> AppError {
    AppError::NotFound(anyhow::anyhow!("Clearance {} not found", clearance_id))
}
