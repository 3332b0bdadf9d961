//! In-process stores for tests and local runs without PostgreSQL.

use super::store::{
    forbidden, unknown_clearance, AuditSink, RunRepository, StateStore, INTERRUPTED_RUN_MESSAGE,
};
use crate::models::{
    AuditEntry, AuditFilter, Clearance, ClearanceAssignment, DesiredSnapshot, LiaisonPermission,
    NewAssignment, SyncRun, SyncRunStatus, Watermark,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use service_core::error::AppError;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::RwLock;
use uuid::Uuid;
use validator::Validate;

#[derive(Default)]
struct StateTables {
    clearances: HashMap<String, Clearance>,
    permissions: HashMap<(String, String), DateTime<Utc>>,
    assignments: HashMap<(String, String), ClearanceAssignment>,
    /// Sequence handed to the next assignment write.
    next_change: i64,
}

#[derive(Default)]
pub struct MemoryStateStore {
    tables: RwLock<StateTables>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every assignment regardless of clearance state, ordered by person.
    pub async fn assignments(&self) -> Vec<ClearanceAssignment> {
        let mut rows: Vec<_> = self.tables.read().await.assignments.values().cloned().collect();
        rows.sort_by(|a, b| (&a.person_id, &a.clearance_id).cmp(&(&b.person_id, &b.clearance_id)));
        rows
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn list_desired_assignments(
        &self,
        since: Option<&Watermark>,
        now: DateTime<Utc>,
    ) -> Result<DesiredSnapshot, AppError> {
        let tables = self.tables.read().await;
        let mut rows: Vec<ClearanceAssignment> = tables
            .assignments
            .values()
            .filter(|a| {
                tables
                    .clearances
                    .get(&a.clearance_id)
                    .is_some_and(|c| c.enabled)
            })
            .filter(|a| since.is_none_or(|since| a.changed_since(since, now)))
            .map(|a| {
                let mut a = a.clone();
                if let Some(c) = tables.clearances.get(&a.clearance_id) {
                    a.clearance_name = c.name.clone();
                }
                a
            })
            .collect();

        rows.sort_by(|a, b| (&a.person_id, &a.clearance_id).cmp(&(&b.person_id, &b.clearance_id)));
        Ok(DesiredSnapshot {
            assignments: rows,
            change_cursor: tables.next_change,
        })
    }

    async fn upsert_clearance(&self, clearance: &Clearance) -> Result<(), AppError> {
        self.tables
            .write()
            .await
            .clearances
            .insert(clearance.clearance_id.clone(), clearance.clone());
        Ok(())
    }

    async fn grant_liaison_permission(
        &self,
        liaison_id: &str,
        clearance_id: &str,
    ) -> Result<(), AppError> {
        let mut tables = self.tables.write().await;
        if !tables.clearances.contains_key(clearance_id) {
            return Err(unknown_clearance(clearance_id));
        }
        tables
            .permissions
            .entry((liaison_id.to_string(), clearance_id.to_string()))
            .or_insert_with(Utc::now);
        Ok(())
    }

    async fn revoke_liaison_permission(
        &self,
        liaison_id: &str,
        clearance_id: &str,
    ) -> Result<bool, AppError> {
        Ok(self
            .tables
            .write()
            .await
            .permissions
            .remove(&(liaison_id.to_string(), clearance_id.to_string()))
            .is_some())
    }

    async fn liaison_permissions(
        &self,
        liaison_id: &str,
    ) -> Result<Vec<LiaisonPermission>, AppError> {
        let tables = self.tables.read().await;
        let mut permissions: Vec<LiaisonPermission> = tables
            .permissions
            .iter()
            .filter(|((liaison, _), _)| liaison == liaison_id)
            .map(|((liaison, clearance), granted_utc)| LiaisonPermission {
                liaison_id: liaison.clone(),
                clearance_id: clearance.clone(),
                granted_utc: *granted_utc,
            })
            .collect();
        permissions.sort_by(|a, b| a.clearance_id.cmp(&b.clearance_id));
        Ok(permissions)
    }

    async fn record_assignment(
        &self,
        assignment: &NewAssignment,
    ) -> Result<ClearanceAssignment, AppError> {
        assignment.validate()?;

        let mut tables = self.tables.write().await;
        let clearance_name = tables
            .clearances
            .get(&assignment.clearance_id)
            .map(|c| c.name.clone())
            .ok_or_else(|| unknown_clearance(&assignment.clearance_id))?;

        let key = (
            assignment.liaison_id.clone(),
            assignment.clearance_id.clone(),
        );
        if !tables.permissions.contains_key(&key) {
            return Err(forbidden(&assignment.liaison_id, &assignment.clearance_id));
        }

        let pair = (
            assignment.person_id.clone(),
            assignment.clearance_id.clone(),
        );
        let assignment_id = tables
            .assignments
            .get(&pair)
            .map(|a| a.assignment_id)
            .unwrap_or_else(Uuid::new_v4);
        let change_seq = tables.next_change;
        tables.next_change += 1;

        let row = ClearanceAssignment {
            assignment_id,
            person_id: assignment.person_id.clone(),
            clearance_id: assignment.clearance_id.clone(),
            clearance_name,
            desired_state: assignment.desired_state,
            assigner_id: Some(assignment.liaison_id.clone()),
            start_time: assignment.start_time,
            end_time: assignment.end_time,
            modified_utc: Utc::now(),
            change_seq,
        };
        tables.assignments.insert(pair, row.clone());

        Ok(row)
    }
}

/// Audit sink backed by a vector. Appends can be made to fail for a number of
/// calls to exercise persistence error handling.
#[derive(Default)]
pub struct MemoryAuditSink {
    entries: RwLock<Vec<AuditEntry>>,
    failing_appends: AtomicUsize,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `count` appends with a database error.
    pub fn fail_next_appends(&self, count: usize) {
        self.failing_appends.store(count, Ordering::SeqCst);
    }

    /// Entries in append order.
    pub async fn entries(&self) -> Vec<AuditEntry> {
        self.entries.read().await.clone()
    }
}

#[async_trait]
impl AuditSink for MemoryAuditSink {
    async fn append(&self, entry: &AuditEntry) -> Result<(), AppError> {
        let should_fail = self
            .failing_appends
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if should_fail {
            return Err(AppError::DatabaseError(anyhow::anyhow!(
                "audit store unavailable"
            )));
        }

        self.entries.write().await.push(entry.clone());
        Ok(())
    }

    async fn list(&self, filter: &AuditFilter) -> Result<Vec<AuditEntry>, AppError> {
        let entries = self.entries.read().await;
        Ok(entries
            .iter()
            .rev()
            .filter(|e| filter.matches(e))
            .skip(filter.skip.max(0) as usize)
            .take(filter.effective_limit() as usize)
            .cloned()
            .collect())
    }
}

/// Run records keyed by id. Like the database, at most one run may be
/// `running` at a time, and finishes can be made to fail for a number of
/// calls.
#[derive(Default)]
pub struct MemoryRunRepository {
    runs: RwLock<HashMap<Uuid, SyncRun>>,
    failing_finishes: AtomicUsize,
}

impl MemoryRunRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `count` finishes with a database error.
    pub fn fail_next_finishes(&self, count: usize) {
        self.failing_finishes.store(count, Ordering::SeqCst);
    }
}

#[async_trait]
impl RunRepository for MemoryRunRepository {
    async fn create_run(&self, run: &SyncRun) -> Result<(), AppError> {
        let mut runs = self.runs.write().await;
        if runs.contains_key(&run.run_id) {
            return Err(AppError::Conflict(anyhow::anyhow!(
                "Run {} already exists",
                run.run_id
            )));
        }
        if run.status == SyncRunStatus::Running
            && runs.values().any(|r| r.status == SyncRunStatus::Running)
        {
            return Err(AppError::Conflict(anyhow::anyhow!(
                "A sync run is already in progress"
            )));
        }
        runs.insert(run.run_id, run.clone());
        Ok(())
    }

    async fn finish_run(&self, run: &SyncRun) -> Result<(), AppError> {
        let should_fail = self
            .failing_finishes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if should_fail {
            return Err(AppError::DatabaseError(anyhow::anyhow!(
                "run store unavailable"
            )));
        }

        let mut runs = self.runs.write().await;
        match runs.get_mut(&run.run_id) {
            Some(existing) => {
                *existing = run.clone();
                Ok(())
            }
            None => Err(AppError::NotFound(anyhow::anyhow!(
                "Run {} not found",
                run.run_id
            ))),
        }
    }

    async fn get_run(&self, run_id: Uuid) -> Result<Option<SyncRun>, AppError> {
        Ok(self.runs.read().await.get(&run_id).cloned())
    }

    async fn latest_run(&self) -> Result<Option<SyncRun>, AppError> {
        Ok(self
            .runs
            .read()
            .await
            .values()
            .max_by_key(|r| r.started_utc)
            .cloned())
    }

    async fn watermark(&self) -> Result<Option<Watermark>, AppError> {
        Ok(self
            .runs
            .read()
            .await
            .values()
            .filter_map(SyncRun::watermark)
            .max_by_key(|w| w.change_cursor))
    }

    async fn fail_interrupted_runs(&self) -> Result<u64, AppError> {
        let mut closed = 0;
        for run in self.runs.write().await.values_mut() {
            if run.status == SyncRunStatus::Running {
                let counts = run.counts;
                run.finish(
                    SyncRunStatus::Failed,
                    counts,
                    Some(INTERRUPTED_RUN_MESSAGE.to_string()),
                );
                closed += 1;
            }
        }
        Ok(closed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{DesiredState, RunTrigger, SyncCounts};

    async fn store_with_lab() -> MemoryStateStore {
        let store = MemoryStateStore::new();
        store
            .upsert_clearance(&Clearance::new("badge-lab", "Lab"))
            .await
            .unwrap();
        store
            .grant_liaison_permission("liaison-1", "badge-lab")
            .await
            .unwrap();
        store
    }

    #[tokio::test]
    async fn test_record_assignment_upserts_single_row() {
        let store = store_with_lab().await;

        let first = store
            .record_assignment(&NewAssignment::grant("liaison-1", "alice", "badge-lab"))
            .await
            .unwrap();
        let second = store
            .record_assignment(&NewAssignment::revoke("liaison-1", "alice", "badge-lab"))
            .await
            .unwrap();

        assert_eq!(first.assignment_id, second.assignment_id);
        let rows = store.assignments().await;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].desired_state, DesiredState::Revoked);
    }

    #[tokio::test]
    async fn test_disabled_clearance_is_not_listed() {
        let store = store_with_lab().await;
        store
            .record_assignment(&NewAssignment::grant("liaison-1", "alice", "badge-lab"))
            .await
            .unwrap();

        let mut disabled = Clearance::new("badge-lab", "Lab");
        disabled.enabled = false;
        store.upsert_clearance(&disabled).await.unwrap();

        let snapshot = store
            .list_desired_assignments(None, Utc::now())
            .await
            .unwrap();
        assert!(snapshot.assignments.is_empty());
    }

    #[tokio::test]
    async fn test_audit_list_is_newest_first_and_paginated() {
        let sink = MemoryAuditSink::new();
        let run_id = Uuid::new_v4();
        for person in ["alice", "bob", "carol"] {
            sink.append(&AuditEntry {
                entry_id: Uuid::new_v4(),
                run_id,
                person_id: person.to_string(),
                clearance_id: "badge-lab".to_string(),
                clearance_name: "Lab".to_string(),
                assigner_id: None,
                action: crate::models::SyncAction::Grant,
                outcome: crate::models::AuditOutcome::Success,
                error_detail: None,
                attempts: 1,
                message: crate::models::MSG_ACTIVATING.to_string(),
                recorded_utc: Utc::now(),
            })
            .await
            .unwrap();
        }

        let filter = AuditFilter {
            skip: 1,
            limit: 1,
            ..AuditFilter::for_run(run_id)
        };
        let page = sink.list(&filter).await.unwrap();
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].person_id, "bob");
    }

    #[tokio::test]
    async fn test_change_cursor_advances_with_writes() {
        let store = store_with_lab().await;
        let before = store.list_desired_assignments(None, Utc::now()).await.unwrap();

        let written = store
            .record_assignment(&NewAssignment::grant("liaison-1", "alice", "badge-lab"))
            .await
            .unwrap();
        let after = store.list_desired_assignments(None, Utc::now()).await.unwrap();

        assert_eq!(written.change_seq, before.change_cursor);
        assert!(after.change_cursor > written.change_seq);
    }

    #[tokio::test]
    async fn test_watermark_ignores_unsuccessful_runs() {
        let repo = MemoryRunRepository::new();

        let mut ok = SyncRun::start(RunTrigger::Timer);
        ok.change_cursor = Some(7);
        repo.create_run(&ok).await.unwrap();
        ok.finish(SyncRunStatus::Succeeded, SyncCounts::default(), None);
        repo.finish_run(&ok).await.unwrap();

        let mut failed = SyncRun::start(RunTrigger::Manual);
        failed.change_cursor = Some(9);
        repo.create_run(&failed).await.unwrap();
        failed.finish(
            SyncRunStatus::Failed,
            SyncCounts {
                errors: 1,
                ..Default::default()
            },
            None,
        );
        repo.finish_run(&failed).await.unwrap();

        assert_eq!(
            repo.watermark().await.unwrap(),
            Some(Watermark {
                since: ok.started_utc,
                change_cursor: 7,
            })
        );
        assert_eq!(
            repo.latest_run().await.unwrap().map(|r| r.run_id),
            Some(failed.run_id)
        );
    }

    #[tokio::test]
    async fn test_only_one_running_record() {
        let repo = MemoryRunRepository::new();
        repo.create_run(&SyncRun::start(RunTrigger::Timer))
            .await
            .unwrap();

        let result = repo.create_run(&SyncRun::start(RunTrigger::Manual)).await;
        assert!(matches!(result, Err(AppError::Conflict(_))));
    }
}
