//! Domain models for clearance-sync.

#![allow(clippy::should_implement_trait)]

use crate::grpc::proto;
use chrono::{DateTime, Utc};
use prost_types::Timestamp;
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::{Validate, ValidationError};

pub const MSG_ACTIVATING: &str = "Activating clearance";
pub const MSG_REVOKING: &str = "Revoking clearance";
pub const MSG_EXPIRED: &str = "Clearance is expired.";

// ============================================================================
// Clearance Models
// ============================================================================

/// A grantable access capability, keyed by its CCURE clearance GUID.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Clearance {
    pub clearance_id: String,
    pub name: String,
    pub enabled: bool,
}

impl Clearance {
    pub fn new(clearance_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            clearance_id: clearance_id.into(),
            name: name.into(),
            enabled: true,
        }
    }
}

/// Clearance a liaison is allowed to assign.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LiaisonPermission {
    pub liaison_id: String,
    pub clearance_id: String,
    pub granted_utc: DateTime<Utc>,
}

// ============================================================================
// Assignment Models
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DesiredState {
    Granted,
    Revoked,
}

impl DesiredState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Granted => "granted",
            Self::Revoked => "revoked",
        }
    }

    /// Unknown values fail closed.
    pub fn from_str(s: &str) -> Self {
        match s {
            "granted" => Self::Granted,
            _ => Self::Revoked,
        }
    }
}

/// Desired state of one (person, clearance) pair.
///
/// There is at most one assignment per pair. Revocation flips
/// `desired_state` rather than deleting the row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClearanceAssignment {
    pub assignment_id: Uuid,
    pub person_id: String,
    pub clearance_id: String,
    pub clearance_name: String,
    pub desired_state: DesiredState,
    /// Liaison who last modified the assignment.
    pub assigner_id: Option<String>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub modified_utc: DateTime<Utc>,
    /// Store-issued position of the last write. Increases with every write
    /// and is comparable only to cursors issued by the same store.
    pub change_seq: i64,
}

/// Where the previous complete run left off.
///
/// `change_cursor` bounds row modifications and comes from the store, so it
/// is immune to skew between the service clock and the database clock.
/// `since` bounds activation windows, which liaisons express in wall time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Watermark {
    pub since: DateTime<Utc>,
    pub change_cursor: i64,
}

/// Result of a desired-state read together with the cursor the next
/// incremental read should resume from.
#[derive(Debug, Clone, Default)]
pub struct DesiredSnapshot {
    pub assignments: Vec<ClearanceAssignment>,
    pub change_cursor: i64,
}

/// Why an assignment currently calls for the clearance to be absent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RevokeReason {
    Revoked,
    Expired,
}

/// What an assignment asks of the ACS at a given instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EffectiveState {
    Granted,
    Absent(RevokeReason),
    /// Granted with a start time that has not arrived yet.
    Pending,
}

impl ClearanceAssignment {
    pub fn effective_state(&self, now: DateTime<Utc>) -> EffectiveState {
        match self.desired_state {
            DesiredState::Revoked => EffectiveState::Absent(RevokeReason::Revoked),
            DesiredState::Granted => {
                if self.end_time.is_some_and(|end| end <= now) {
                    EffectiveState::Absent(RevokeReason::Expired)
                } else if self.start_time.is_some_and(|start| start > now) {
                    EffectiveState::Pending
                } else {
                    EffectiveState::Granted
                }
            }
        }
    }

    /// Whether an incremental read resuming from `watermark` must include
    /// this row: it was written at or after the cursor, or its window opened
    /// or closed in `(since, now]`.
    pub fn changed_since(&self, watermark: &Watermark, now: DateTime<Utc>) -> bool {
        let since = watermark.since;
        let crossed = |t: Option<DateTime<Utc>>| t.is_some_and(|t| t > since && t <= now);
        self.change_seq >= watermark.change_cursor
            || crossed(self.start_time)
            || crossed(self.end_time)
    }
}

/// An assignment write submitted by a liaison.
#[derive(Debug, Clone, Validate)]
#[validate(schema(function = "validate_window"))]
pub struct NewAssignment {
    #[validate(length(min = 1, max = 64))]
    pub liaison_id: String,
    #[validate(length(min = 1, max = 64))]
    pub person_id: String,
    #[validate(length(min = 1, max = 64))]
    pub clearance_id: String,
    pub desired_state: DesiredState,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
}

impl NewAssignment {
    pub fn grant(
        liaison_id: impl Into<String>,
        person_id: impl Into<String>,
        clearance_id: impl Into<String>,
    ) -> Self {
        Self {
            liaison_id: liaison_id.into(),
            person_id: person_id.into(),
            clearance_id: clearance_id.into(),
            desired_state: DesiredState::Granted,
            start_time: None,
            end_time: None,
        }
    }

    pub fn revoke(
        liaison_id: impl Into<String>,
        person_id: impl Into<String>,
        clearance_id: impl Into<String>,
    ) -> Self {
        Self {
            desired_state: DesiredState::Revoked,
            ..Self::grant(liaison_id, person_id, clearance_id)
        }
    }

    pub fn with_window(
        mut self,
        start_time: Option<DateTime<Utc>>,
        end_time: Option<DateTime<Utc>>,
    ) -> Self {
        self.start_time = start_time;
        self.end_time = end_time;
        self
    }
}

fn validate_window(assignment: &NewAssignment) -> Result<(), ValidationError> {
    match (assignment.start_time, assignment.end_time) {
        (Some(start), Some(end)) if end <= start => {
            Err(ValidationError::new("end_time_before_start_time"))
        }
        _ => Ok(()),
    }
}

// ============================================================================
// Audit Models
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncAction {
    Grant,
    Revoke,
}

impl SyncAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Grant => "grant",
            Self::Revoke => "revoke",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "grant" => Self::Grant,
            _ => Self::Revoke,
        }
    }
}

impl From<SyncAction> for proto::AuditAction {
    fn from(a: SyncAction) -> Self {
        match a {
            SyncAction::Grant => Self::Grant,
            SyncAction::Revoke => Self::Revoke,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditOutcome {
    Success,
    Failure,
}

impl AuditOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failure => "failure",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "success" => Self::Success,
            _ => Self::Failure,
        }
    }
}

impl From<AuditOutcome> for proto::AuditOutcome {
    fn from(o: AuditOutcome) -> Self {
        match o {
            AuditOutcome::Success => Self::Success,
            AuditOutcome::Failure => Self::Failure,
        }
    }
}

/// Immutable record of one synchronization operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub entry_id: Uuid,
    pub run_id: Uuid,
    pub person_id: String,
    pub clearance_id: String,
    pub clearance_name: String,
    pub assigner_id: Option<String>,
    pub action: SyncAction,
    pub outcome: AuditOutcome,
    pub error_detail: Option<String>,
    pub attempts: i32,
    pub message: String,
    pub recorded_utc: DateTime<Utc>,
}

impl From<AuditEntry> for proto::AuditEntry {
    fn from(e: AuditEntry) -> Self {
        Self {
            entry_id: e.entry_id.to_string(),
            run_id: e.run_id.to_string(),
            person_id: e.person_id,
            clearance_id: e.clearance_id,
            clearance_name: e.clearance_name,
            assigner_id: e.assigner_id,
            action: proto::AuditAction::from(e.action).into(),
            outcome: proto::AuditOutcome::from(e.outcome).into(),
            error_detail: e.error_detail,
            attempts: e.attempts,
            message: e.message,
            recorded_utc: Some(datetime_to_timestamp(e.recorded_utc)),
        }
    }
}

/// Search criteria for the audit trail. Text fields other than ids match
/// case-insensitive substrings.
#[derive(Debug, Clone, Default)]
pub struct AuditFilter {
    pub person_id: Option<String>,
    pub assigner_id: Option<String>,
    pub clearance_id: Option<String>,
    pub clearance_name: Option<String>,
    pub message: Option<String>,
    pub run_id: Option<Uuid>,
    pub from_utc: Option<DateTime<Utc>>,
    pub to_utc: Option<DateTime<Utc>>,
    pub skip: i64,
    pub limit: i64,
}

impl AuditFilter {
    pub const DEFAULT_LIMIT: i64 = 50;
    pub const MAX_LIMIT: i64 = 500;

    pub fn for_run(run_id: Uuid) -> Self {
        Self {
            run_id: Some(run_id),
            limit: Self::MAX_LIMIT,
            ..Default::default()
        }
    }

    /// Limit clamped to `1..=MAX_LIMIT`, with zero meaning the default.
    pub fn effective_limit(&self) -> i64 {
        if self.limit <= 0 {
            Self::DEFAULT_LIMIT
        } else {
            self.limit.min(Self::MAX_LIMIT)
        }
    }

    pub fn matches(&self, entry: &AuditEntry) -> bool {
        fn contains_ci(haystack: &str, needle: &str) -> bool {
            haystack.to_lowercase().contains(&needle.to_lowercase())
        }

        self.person_id.as_ref().is_none_or(|p| *p == entry.person_id)
            && self
                .assigner_id
                .as_ref()
                .is_none_or(|a| entry.assigner_id.as_ref() == Some(a))
            && self
                .clearance_id
                .as_ref()
                .is_none_or(|c| *c == entry.clearance_id)
            && self
                .clearance_name
                .as_ref()
                .is_none_or(|n| contains_ci(&entry.clearance_name, n))
            && self
                .message
                .as_ref()
                .is_none_or(|m| contains_ci(&entry.message, m))
            && self.run_id.is_none_or(|r| r == entry.run_id)
            && self.from_utc.is_none_or(|from| entry.recorded_utc >= from)
            && self.to_utc.is_none_or(|to| entry.recorded_utc < to)
    }
}

// ============================================================================
// Sync Run Models
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunTrigger {
    Timer,
    Manual,
}

impl RunTrigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Timer => "timer",
            Self::Manual => "manual",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "timer" => Self::Timer,
            _ => Self::Manual,
        }
    }
}

impl From<RunTrigger> for proto::RunTrigger {
    fn from(t: RunTrigger) -> Self {
        match t {
            RunTrigger::Timer => Self::Timer,
            RunTrigger::Manual => Self::Manual,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncRunStatus {
    Running,
    Succeeded,
    PartialFailure,
    Failed,
    Cancelled,
}

impl SyncRunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::PartialFailure => "partial_failure",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "running" => Self::Running,
            "succeeded" => Self::Succeeded,
            "partial_failure" => Self::PartialFailure,
            "cancelled" => Self::Cancelled,
            _ => Self::Failed,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Running)
    }

    /// Status of a run that was not aborted, derived from its counts.
    pub fn from_counts(counts: &SyncCounts) -> Self {
        if counts.not_attempted > 0 {
            Self::Cancelled
        } else if counts.errors == 0 {
            Self::Succeeded
        } else if counts.successes() == 0 {
            Self::Failed
        } else {
            Self::PartialFailure
        }
    }
}

impl From<SyncRunStatus> for proto::SyncRunStatus {
    fn from(s: SyncRunStatus) -> Self {
        match s {
            SyncRunStatus::Running => Self::Running,
            SyncRunStatus::Succeeded => Self::Succeeded,
            SyncRunStatus::PartialFailure => Self::PartialFailure,
            SyncRunStatus::Failed => Self::Failed,
            SyncRunStatus::Cancelled => Self::Cancelled,
        }
    }
}

/// Aggregate operation counts for a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncCounts {
    pub grants_applied: i64,
    pub revokes_applied: i64,
    pub errors: i64,
    pub not_attempted: i64,
}

impl SyncCounts {
    pub fn successes(&self) -> i64 {
        self.grants_applied + self.revokes_applied
    }

    pub fn attempted(&self) -> i64 {
        self.successes() + self.errors
    }

    pub fn merge(&mut self, other: SyncCounts) {
        self.grants_applied += other.grants_applied;
        self.revokes_applied += other.revokes_applied;
        self.errors += other.errors;
        self.not_attempted += other.not_attempted;
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncRun {
    pub run_id: Uuid,
    pub trigger: RunTrigger,
    pub status: SyncRunStatus,
    pub started_utc: DateTime<Utc>,
    pub finished_utc: Option<DateTime<Utc>>,
    pub counts: SyncCounts,
    pub error_message: Option<String>,
    /// Cursor of the desired-state read this run reconciled against.
    pub change_cursor: Option<i64>,
}

impl SyncRun {
    pub fn start(trigger: RunTrigger) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            trigger,
            status: SyncRunStatus::Running,
            started_utc: Utc::now(),
            finished_utc: None,
            counts: SyncCounts::default(),
            error_message: None,
            change_cursor: None,
        }
    }

    pub fn finish(
        &mut self,
        status: SyncRunStatus,
        counts: SyncCounts,
        error_message: Option<String>,
    ) {
        self.status = status;
        self.counts = counts;
        self.error_message = error_message;
        self.finished_utc = Some(Utc::now());
    }

    /// Whether this run may serve as the watermark for incremental reads.
    pub fn advances_watermark(&self) -> bool {
        self.status == SyncRunStatus::Succeeded
            && self.counts.not_attempted == 0
            && self.change_cursor.is_some()
    }

    pub fn watermark(&self) -> Option<Watermark> {
        if !self.advances_watermark() {
            return None;
        }
        self.change_cursor.map(|change_cursor| Watermark {
            since: self.started_utc,
            change_cursor,
        })
    }
}

impl From<SyncRun> for proto::SyncRun {
    fn from(r: SyncRun) -> Self {
        Self {
            run_id: r.run_id.to_string(),
            trigger: proto::RunTrigger::from(r.trigger).into(),
            status: proto::SyncRunStatus::from(r.status).into(),
            started_utc: Some(datetime_to_timestamp(r.started_utc)),
            finished_utc: r.finished_utc.map(datetime_to_timestamp),
            grants_applied: r.counts.grants_applied,
            revokes_applied: r.counts.revokes_applied,
            errors: r.counts.errors,
            not_attempted: r.counts.not_attempted,
            error_message: r.error_message,
        }
    }
}

// ============================================================================
// Helper Functions
// ============================================================================

pub fn datetime_to_timestamp(dt: DateTime<Utc>) -> Timestamp {
    Timestamp {
        seconds: dt.timestamp(),
        nanos: dt.timestamp_subsec_nanos() as i32,
    }
}

pub fn timestamp_to_datetime(ts: &Timestamp) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp(ts.seconds, ts.nanos.max(0) as u32)
}
