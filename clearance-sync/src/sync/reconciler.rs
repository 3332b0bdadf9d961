//! One reconciliation run: read desired state, compare it with the ACS per
//! person and issue the grants and revokes that close the gap.
//!
//! A person's operations run one after another. Different persons run
//! concurrently up to `max_concurrency`. Every attempted operation is audited
//! before the person's chain moves on.

use super::diff::{group_by_person, plan_person, plan_person_blind, PersonAssignments, PlannedOperation};
use super::error::SyncError;
use crate::acs::{AcsClient, AcsError, GrantOutcome, RevokeOutcome};
use crate::models::{
    AuditEntry, AuditOutcome, SyncAction, SyncCounts, SyncRun, SyncRunStatus,
};
use crate::services::metrics::{
    record_acs_operation, record_audit_write_failure, record_sync_run, ACS_DURATION,
};
use crate::services::{AuditSink, RunRepository, StateStore};
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use service_core::error::AppError;
use service_core::retry::{retry_with_attempts, RetryConfig};
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    /// Upper bound on persons reconciled at the same time.
    pub max_concurrency: usize,
    /// Applied to ACS calls and to audit and run-record writes.
    pub retry: RetryConfig,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 8,
            retry: RetryConfig::default(),
        }
    }
}

pub struct Reconciler {
    state: Arc<dyn StateStore>,
    acs: Arc<dyn AcsClient>,
    audit: Arc<dyn AuditSink>,
    runs: Arc<dyn RunRepository>,
    config: ReconcilerConfig,
    /// Finished runs whose record is still `running` in the store.
    unrecorded: Mutex<Vec<SyncRun>>,
}

/// Stop signal shared by every chain of a run. Cancelled either from outside
/// or by the first chain that hits an authentication failure.
struct RunControl {
    stop: CancellationToken,
    auth_failure: Mutex<Option<AcsError>>,
}

impl RunControl {
    fn new(cancel: &CancellationToken) -> Self {
        Self {
            stop: cancel.child_token(),
            auth_failure: Mutex::new(None),
        }
    }

    fn should_stop(&self) -> bool {
        self.stop.is_cancelled()
    }

    fn abort_on_auth(&self, err: AcsError) {
        let mut failure = self.auth_failure.lock().unwrap_or_else(|e| e.into_inner());
        if failure.is_none() {
            error!(error = %err, "ACS rejected credentials, aborting run");
            *failure = Some(err);
        }
        self.stop.cancel();
    }

    fn auth_failure(&self) -> Option<AcsError> {
        self.auth_failure
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

impl Reconciler {
    pub fn new(
        state: Arc<dyn StateStore>,
        acs: Arc<dyn AcsClient>,
        audit: Arc<dyn AuditSink>,
        runs: Arc<dyn RunRepository>,
        config: ReconcilerConfig,
    ) -> Self {
        Self {
            state,
            acs,
            audit,
            runs,
            config,
            unrecorded: Mutex::new(Vec::new()),
        }
    }

    /// Execute `run` to completion and persist its final state.
    ///
    /// The run record must already exist. The returned run is always
    /// terminal; run-level failures are reported through its status. A final
    /// state that cannot be persisted is kept until
    /// [`record_unrecorded`](Self::record_unrecorded) succeeds.
    #[instrument(skip(self, run, cancel), fields(run_id = %run.run_id, trigger = run.trigger.as_str()))]
    pub async fn run(&self, mut run: SyncRun, cancel: CancellationToken) -> SyncRun {
        info!("Reconciliation run started");

        let (status, counts, error_message) = match self.execute(run.run_id, &cancel).await {
            Ok(executed) => {
                run.change_cursor = Some(executed.change_cursor);
                let status = match executed.auth_failure {
                    Some(_) => SyncRunStatus::Failed,
                    None => SyncRunStatus::from_counts(&executed.counts),
                };
                let message = executed.auth_failure.map(|auth| auth.to_string());
                (status, executed.counts, message)
            }
            Err(e) => {
                error!(error = %e, "Reconciliation run aborted before any operation");
                (SyncRunStatus::Failed, SyncCounts::default(), Some(e.to_string()))
            }
        };

        run.finish(status, counts, error_message);
        self.persist_finished(&run).await;

        record_sync_run(run.trigger.as_str(), run.status.as_str());
        info!(
            status = run.status.as_str(),
            grants_applied = run.counts.grants_applied,
            revokes_applied = run.counts.revokes_applied,
            errors = run.counts.errors,
            not_attempted = run.counts.not_attempted,
            "Reconciliation run finished"
        );

        run
    }

    async fn execute(
        &self,
        run_id: Uuid,
        cancel: &CancellationToken,
    ) -> Result<Executed, SyncError> {
        let auth = retry_with_attempts(&self.config.retry, "acs_authenticate", || {
            self.acs.authenticate()
        })
        .await;
        auth.result.map_err(SyncError::from)?;

        let watermark = retry_with_attempts(&self.config.retry, "read_watermark", || {
            self.runs.watermark()
        })
        .await
        .result
        .map_err(SyncError::StateStore)?;

        let now = Utc::now();
        let desired = retry_with_attempts(&self.config.retry, "list_desired_assignments", || {
            self.state.list_desired_assignments(watermark.as_ref(), now)
        })
        .await
        .result
        .map_err(SyncError::StateStore)?;

        let persons = group_by_person(desired.assignments);
        info!(
            persons = persons.len(),
            incremental = watermark.is_some(),
            change_cursor = desired.change_cursor,
            "Desired state loaded"
        );

        let control = RunControl::new(cancel);
        let concurrency = self.config.max_concurrency.max(1);

        let per_person: Vec<SyncCounts> = stream::iter(persons)
            .map(|person| self.reconcile_person(run_id, person, now, &control))
            .buffer_unordered(concurrency)
            .collect()
            .await;

        let mut counts = SyncCounts::default();
        for c in per_person {
            counts.merge(c);
        }

        Ok(Executed {
            counts,
            auth_failure: control.auth_failure(),
            change_cursor: desired.change_cursor,
        })
    }

    #[instrument(skip_all, fields(person_id = %person.person_id))]
    async fn reconcile_person(
        &self,
        run_id: Uuid,
        person: PersonAssignments,
        now: DateTime<Utc>,
        control: &RunControl,
    ) -> SyncCounts {
        let mut counts = SyncCounts::default();

        if control.should_stop() {
            counts.not_attempted = plan_person_blind(&person, now).len() as i64;
            return counts;
        }

        let fetched = retry_with_attempts(&self.config.retry, "acs_fetch_grants", || {
            self.acs.fetch_grants(&person.person_id)
        })
        .await;

        let plan = match fetched.result {
            Ok(actual) => plan_person(&person, &actual, now),
            Err(AcsError::NotFound(_)) => plan_person(&person, &Default::default(), now),
            Err(err @ AcsError::Auth(_)) => {
                control.abort_on_auth(err);
                counts.not_attempted = plan_person_blind(&person, now).len() as i64;
                return counts;
            }
            Err(err) => {
                warn!(error = %err, "Could not read ACS grants, failing every planned pair");
                for op in plan_person_blind(&person, now) {
                    let entry = audit_entry(
                        run_id,
                        &op,
                        Err(format!("Failed to read ACS grants: {}", err)),
                        fetched.attempts as i32,
                    );
                    record_acs_operation(op.action.as_str(), "failure");
                    self.audit_or_log(&entry).await;
                    counts.errors += 1;
                }
                return counts;
            }
        };

        let total = plan.len();
        for (index, op) in plan.into_iter().enumerate() {
            if control.should_stop() {
                counts.not_attempted += (total - index) as i64;
                break;
            }

            let (result, attempts) = self.apply(&op).await;

            if let Err(err @ AcsError::Auth(_)) = &result {
                control.abort_on_auth(err.clone());
            }

            let succeeded = result.is_ok();
            record_acs_operation(
                op.action.as_str(),
                if succeeded { "success" } else { "failure" },
            );

            let entry = audit_entry(run_id, &op, result.map_err(|e| e.to_string()), attempts);
            let audited = self.audit_or_log(&entry).await;

            match (succeeded && audited, op.action) {
                (true, SyncAction::Grant) => counts.grants_applied += 1,
                (true, SyncAction::Revoke) => counts.revokes_applied += 1,
                (false, _) => counts.errors += 1,
            }
        }

        counts
    }

    /// Issue one operation with retries. Idempotent outcomes collapse to
    /// success.
    async fn apply(&self, op: &PlannedOperation) -> (Result<(), AcsError>, i32) {
        let timer = ACS_DURATION
            .with_label_values(&[op.action.as_str()])
            .start_timer();

        let (result, attempts) = match op.action {
            SyncAction::Grant => {
                let outcome = retry_with_attempts(&self.config.retry, "acs_grant", || {
                    self.acs.grant(&op.person_id, &op.clearance_id)
                })
                .await;
                let result = outcome.result.map(|o| {
                    if o == GrantOutcome::AlreadyGranted {
                        info!(clearance_id = %op.clearance_id, "Clearance was already granted");
                    }
                });
                (result, outcome.attempts)
            }
            SyncAction::Revoke => {
                let outcome = retry_with_attempts(&self.config.retry, "acs_revoke", || {
                    self.acs.revoke(&op.person_id, &op.clearance_id)
                })
                .await;
                let result = match outcome.result {
                    Ok(RevokeOutcome::Revoked) => Ok(()),
                    Ok(RevokeOutcome::NotGranted) | Err(AcsError::NotFound(_)) => {
                        info!(clearance_id = %op.clearance_id, "Clearance was not granted");
                        Ok(())
                    }
                    Err(e) => Err(e),
                };
                (result, outcome.attempts)
            }
        };

        timer.observe_duration();
        (result, attempts as i32)
    }

    /// Append with retries. Returns false when the entry could not be
    /// persisted.
    async fn audit_or_log(&self, entry: &AuditEntry) -> bool {
        let outcome = retry_with_attempts(&self.config.retry, "audit_append", || {
            self.audit.append(entry)
        })
        .await;

        match outcome.result {
            Ok(()) => true,
            Err(e) => {
                record_audit_write_failure(entry.action.as_str());
                error!(
                    error = %e,
                    run_id = %entry.run_id,
                    person_id = %entry.person_id,
                    clearance_id = %entry.clearance_id,
                    action = entry.action.as_str(),
                    outcome = entry.outcome.as_str(),
                    "Unaudited operation: audit entry could not be written"
                );
                false
            }
        }
    }

    async fn persist_finished(&self, run: &SyncRun) {
        let outcome = retry_with_attempts(&self.config.retry, "finish_run", || {
            self.runs.finish_run(run)
        })
        .await;

        if let Err(e) = outcome.result {
            error!(error = %e, run_id = %run.run_id, "Failed to persist finished run");
            self.unrecorded_runs().push(run.clone());
        }
    }

    fn unrecorded_runs(&self) -> std::sync::MutexGuard<'_, Vec<SyncRun>> {
        self.unrecorded.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Persist the final state of runs whose earlier write failed. Until this
    /// succeeds their records stay `running` and block new runs.
    pub async fn record_unrecorded(&self) -> Result<(), AppError> {
        let pending = std::mem::take(&mut *self.unrecorded_runs());

        let mut remaining = pending.into_iter();
        while let Some(run) = remaining.next() {
            let outcome = retry_with_attempts(&self.config.retry, "finish_run", || {
                self.runs.finish_run(&run)
            })
            .await;

            match outcome.result {
                Ok(()) => {}
                Err(AppError::NotFound(_)) => {
                    warn!(run_id = %run.run_id, "Dropping outcome of a run with no record");
                    continue;
                }
                Err(e) => {
                    let mut unrecorded = self.unrecorded_runs();
                    unrecorded.push(run);
                    unrecorded.extend(remaining);
                    return Err(e);
                }
            }
            warn!(
                run_id = %run.run_id,
                status = run.status.as_str(),
                "Recorded outcome of an earlier run"
            );
        }
        Ok(())
    }
}

/// What a run that got as far as reading desired state accomplished.
struct Executed {
    counts: SyncCounts,
    /// Authentication failure that stopped the run early.
    auth_failure: Option<AcsError>,
    change_cursor: i64,
}

fn audit_entry(
    run_id: Uuid,
    op: &PlannedOperation,
    result: Result<(), String>,
    attempts: i32,
) -> AuditEntry {
    let (outcome, error_detail) = match result {
        Ok(()) => (AuditOutcome::Success, None),
        Err(detail) => (AuditOutcome::Failure, Some(detail)),
    };

    AuditEntry {
        entry_id: Uuid::new_v4(),
        run_id,
        person_id: op.person_id.clone(),
        clearance_id: op.clearance_id.clone(),
        clearance_name: op.clearance_name.clone(),
        assigner_id: op.assigner_id.clone(),
        action: op.action,
        outcome,
        error_detail,
        attempts,
        message: op.message.to_string(),
        recorded_utc: Utc::now(),
    }
}
