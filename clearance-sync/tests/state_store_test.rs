//! Integration tests for liaison-scoped assignment writes and run records.

mod common;

use chrono::{Duration as ChronoDuration, Utc};
use clearance_sync::models::{
    Clearance, DesiredState, NewAssignment, RunTrigger, SyncRun, SyncRunStatus, Watermark,
};
use clearance_sync::services::{MemoryRunRepository, RunRepository, StateStore};
use common::{harness, LIAISON};
use service_core::error::AppError;
use tokio_test::{assert_err, assert_ok};

#[tokio::test]
async fn liaison_without_permission_cannot_assign() {
    let h = harness();
    h.state
        .upsert_clearance(&Clearance::new("badge-vault", "Vault"))
        .await
        .unwrap();

    let err = assert_err!(
        h.state
            .record_assignment(&NewAssignment::grant(LIAISON, "alice", "badge-vault"))
            .await
    );

    assert!(matches!(err, AppError::Forbidden(_)));
    assert!(h.state.assignments().await.is_empty());
}

#[tokio::test]
async fn unknown_clearance_is_not_found() {
    let h = harness();

    let result = h
        .state
        .record_assignment(&NewAssignment::grant(LIAISON, "alice", "badge-ghost"))
        .await;
    assert!(matches!(result, Err(AppError::NotFound(_))));

    let result = h.state.grant_liaison_permission(LIAISON, "badge-ghost").await;
    assert!(matches!(result, Err(AppError::NotFound(_))));
}

#[tokio::test]
async fn revoked_permission_blocks_further_writes() {
    let h = harness();
    h.add_clearance("badge-lab", "Chemistry Lab").await;
    h.assign("alice", "badge-lab").await;

    assert!(h
        .state
        .revoke_liaison_permission(LIAISON, "badge-lab")
        .await
        .unwrap());
    assert!(!h
        .state
        .revoke_liaison_permission(LIAISON, "badge-lab")
        .await
        .unwrap());

    let result = h
        .state
        .record_assignment(&NewAssignment::revoke(LIAISON, "alice", "badge-lab"))
        .await;
    assert!(matches!(result, Err(AppError::Forbidden(_))));

    // The earlier assignment stands.
    let rows = h.state.assignments().await;
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].desired_state, DesiredState::Granted);
}

#[tokio::test]
async fn inverted_window_is_rejected() {
    let h = harness();
    h.add_clearance("badge-lab", "Chemistry Lab").await;

    let start = Utc::now();
    let result = h
        .state
        .record_assignment(
            &NewAssignment::grant(LIAISON, "alice", "badge-lab")
                .with_window(Some(start), Some(start - ChronoDuration::hours(1))),
        )
        .await;

    assert!(matches!(result, Err(AppError::ValidationError(_))));
}

#[tokio::test]
async fn permissions_are_listed_per_liaison() {
    let h = harness();
    h.add_clearance("badge-lab", "Chemistry Lab").await;
    h.add_clearance("badge-gym", "Gymnasium").await;
    h.state
        .grant_liaison_permission("liaison-2", "badge-gym")
        .await
        .unwrap();

    let mine: Vec<_> = h
        .state
        .liaison_permissions(LIAISON)
        .await
        .unwrap()
        .into_iter()
        .map(|p| p.clearance_id)
        .collect();
    assert_eq!(mine, vec!["badge-gym", "badge-lab"]);

    let theirs = h.state.liaison_permissions("liaison-2").await.unwrap();
    assert_eq!(theirs.len(), 1);
    assert_eq!(theirs[0].liaison_id, "liaison-2");
}

#[tokio::test]
async fn incremental_listing_only_returns_changes() {
    let h = harness();
    h.add_clearance("badge-lab", "Chemistry Lab").await;
    h.assign("alice", "badge-lab").await;

    let first = assert_ok!(h.state.list_desired_assignments(None, Utc::now()).await);
    assert_eq!(first.assignments.len(), 1);
    h.assign("bob", "badge-lab").await;

    let now = Utc::now();
    let full = assert_ok!(h.state.list_desired_assignments(None, now).await);
    assert_eq!(full.assignments.len(), 2);

    let watermark = Watermark {
        since: now,
        change_cursor: first.change_cursor,
    };
    let changed = assert_ok!(
        h.state
            .list_desired_assignments(Some(&watermark), now)
            .await
    );
    assert_eq!(changed.assignments.len(), 1);
    assert_eq!(changed.assignments[0].person_id, "bob");
}

#[tokio::test]
async fn incremental_listing_does_not_depend_on_service_clock() {
    let h = harness();
    h.add_clearance("badge-lab", "Chemistry Lab").await;
    h.assign("alice", "badge-lab").await;

    let snapshot = assert_ok!(h.state.list_desired_assignments(None, Utc::now()).await);
    h.assign("bob", "badge-lab").await;

    // The previous run's clock ran an hour ahead of the store.
    let skewed = Watermark {
        since: Utc::now() + ChronoDuration::hours(1),
        change_cursor: snapshot.change_cursor,
    };
    let changed = assert_ok!(
        h.state
            .list_desired_assignments(Some(&skewed), Utc::now())
            .await
    );

    let people: Vec<_> = changed
        .assignments
        .iter()
        .map(|a| a.person_id.as_str())
        .collect();
    assert_eq!(people, vec!["bob"]);
    assert!(changed.change_cursor > snapshot.change_cursor);
}

#[tokio::test]
async fn interrupted_runs_are_closed_at_startup() {
    let runs = MemoryRunRepository::new();

    let mut done = SyncRun::start(RunTrigger::Manual);
    assert_ok!(runs.create_run(&done).await);
    done.change_cursor = Some(3);
    done.finish(SyncRunStatus::Succeeded, Default::default(), None);
    assert_ok!(runs.finish_run(&done).await);

    let stale = SyncRun::start(RunTrigger::Timer);
    assert_ok!(runs.create_run(&stale).await);

    assert_eq!(assert_ok!(runs.fail_interrupted_runs().await), 1);

    let closed = assert_ok!(runs.get_run(stale.run_id).await).unwrap();
    assert_eq!(closed.status, SyncRunStatus::Failed);
    assert!(closed.finished_utc.is_some());
    assert!(closed.error_message.is_some());

    assert_eq!(
        assert_ok!(runs.watermark().await),
        Some(Watermark {
            since: done.started_utc,
            change_cursor: 3,
        })
    );
    assert_eq!(assert_ok!(runs.fail_interrupted_runs().await), 0);
}

#[tokio::test]
async fn duplicate_run_record_conflicts() {
    let runs = MemoryRunRepository::new();
    let run = SyncRun::start(RunTrigger::Manual);
    assert_ok!(runs.create_run(&run).await);

    let err = assert_err!(runs.create_run(&run).await);
    assert!(matches!(err, AppError::Conflict(_)));
}
