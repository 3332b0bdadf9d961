//! Desired-versus-actual comparison.
//!
//! Everything here is pure: the reconciler supplies the desired assignments,
//! the grant set it fetched from the ACS and the evaluation instant.

use crate::models::{
    ClearanceAssignment, EffectiveState, RevokeReason, SyncAction, MSG_ACTIVATING, MSG_EXPIRED,
    MSG_REVOKING,
};
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashSet};

/// One grant or revoke the reconciler intends to issue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedOperation {
    pub action: SyncAction,
    pub person_id: String,
    pub clearance_id: String,
    pub clearance_name: String,
    pub assigner_id: Option<String>,
    pub message: &'static str,
}

impl PlannedOperation {
    fn new(assignment: &ClearanceAssignment, action: SyncAction, message: &'static str) -> Self {
        Self {
            action,
            person_id: assignment.person_id.clone(),
            clearance_id: assignment.clearance_id.clone(),
            clearance_name: assignment.clearance_name.clone(),
            assigner_id: assignment.assigner_id.clone(),
            message,
        }
    }
}

/// Desired assignments of one person, in clearance order.
#[derive(Debug, Clone)]
pub struct PersonAssignments {
    pub person_id: String,
    pub assignments: Vec<ClearanceAssignment>,
}

/// Operation the assignment calls for, ignoring actual state. Pending
/// assignments call for nothing.
pub fn intended_operation(
    assignment: &ClearanceAssignment,
    now: DateTime<Utc>,
) -> Option<PlannedOperation> {
    match assignment.effective_state(now) {
        EffectiveState::Granted => Some(PlannedOperation::new(
            assignment,
            SyncAction::Grant,
            MSG_ACTIVATING,
        )),
        EffectiveState::Absent(RevokeReason::Revoked) => Some(PlannedOperation::new(
            assignment,
            SyncAction::Revoke,
            MSG_REVOKING,
        )),
        EffectiveState::Absent(RevokeReason::Expired) => Some(PlannedOperation::new(
            assignment,
            SyncAction::Revoke,
            MSG_EXPIRED,
        )),
        EffectiveState::Pending => None,
    }
}

/// Group assignments by person, ordered by person id then clearance id.
pub fn group_by_person(assignments: Vec<ClearanceAssignment>) -> Vec<PersonAssignments> {
    let mut grouped: BTreeMap<String, Vec<ClearanceAssignment>> = BTreeMap::new();
    for assignment in assignments {
        grouped
            .entry(assignment.person_id.clone())
            .or_default()
            .push(assignment);
    }

    grouped
        .into_iter()
        .map(|(person_id, mut assignments)| {
            assignments.sort_by(|a, b| a.clearance_id.cmp(&b.clearance_id));
            PersonAssignments {
                person_id,
                assignments,
            }
        })
        .collect()
}

/// Operations that move `actual` towards the person's desired state.
///
/// A grant is planned only when the clearance is missing and a revoke only
/// when it is present, so a converged person yields nothing.
pub fn plan_person(
    person: &PersonAssignments,
    actual: &HashSet<String>,
    now: DateTime<Utc>,
) -> Vec<PlannedOperation> {
    person
        .assignments
        .iter()
        .filter_map(|a| intended_operation(a, now))
        .filter(|op| match op.action {
            SyncAction::Grant => !actual.contains(&op.clearance_id),
            SyncAction::Revoke => actual.contains(&op.clearance_id),
        })
        .collect()
}

/// Everything the person's assignments call for, used when the actual grant
/// set could not be read.
pub fn plan_person_blind(person: &PersonAssignments, now: DateTime<Utc>) -> Vec<PlannedOperation> {
    person
        .assignments
        .iter()
        .filter_map(|a| intended_operation(a, now))
        .collect()
}
