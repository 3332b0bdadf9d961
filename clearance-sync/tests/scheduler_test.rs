//! Integration tests for the run lifecycle.

mod common;

use clearance_sync::acs::MockAcsClient;
use clearance_sync::models::{RunTrigger, SyncRunStatus};
use clearance_sync::sync::SyncError;
use common::{harness, harness_with};
use std::time::Duration;
use tokio_test::{assert_err, assert_ok};
use uuid::Uuid;

fn slow_acs() -> MockAcsClient {
    MockAcsClient::new().with_latency(Duration::from_millis(40))
}

#[tokio::test]
async fn only_one_run_is_active_at_a_time() {
    let h = harness_with(slow_acs(), 1);
    h.add_clearance("badge-lab", "Chemistry Lab").await;
    h.assign("alice", "badge-lab").await;
    h.assign("bob", "badge-lab").await;

    let run_id = h.scheduler.trigger_run(RunTrigger::Manual).await.unwrap();
    assert!(h.scheduler.is_running());

    let second = h.scheduler.trigger_run(RunTrigger::Manual).await;
    assert!(matches!(second, Err(SyncError::ConcurrentRun)));
    let inline = h.scheduler.run_now(RunTrigger::Timer).await;
    assert!(matches!(inline, Err(SyncError::ConcurrentRun)));

    let finished = h.scheduler.wait_for_active().await.unwrap();
    assert_eq!(finished.run_id, run_id);
    assert_eq!(finished.status, SyncRunStatus::Succeeded);
    assert!(!h.scheduler.is_running());

    // The slot is free again once the run has finished.
    let next = h.scheduler.run_now(RunTrigger::Manual).await.unwrap();
    assert_ne!(next.run_id, run_id);
}

#[tokio::test]
async fn run_status_reflects_persisted_run() {
    let h = harness();
    h.add_clearance("badge-lab", "Chemistry Lab").await;
    h.assign("alice", "badge-lab").await;

    let run = h.run().await;

    let stored = h.scheduler.run_status(run.run_id).await.unwrap();
    assert_eq!(stored.status, SyncRunStatus::Succeeded);
    assert_eq!(stored.trigger, RunTrigger::Manual);
    assert_eq!(stored.counts.grants_applied, 1);
    assert!(stored.finished_utc.is_some());

    let latest = h.scheduler.latest_run().await.unwrap().unwrap();
    assert_eq!(latest.run_id, run.run_id);
}

#[tokio::test]
async fn unknown_run_id_is_not_found() {
    let h = harness();

    let missing = Uuid::new_v4();
    let result = h.scheduler.run_status(missing).await;
    assert!(matches!(result, Err(SyncError::RunNotFound(id)) if id == missing));
    assert!(h.scheduler.latest_run().await.unwrap().is_none());
}

#[tokio::test]
async fn cancel_without_active_run_reports_false() {
    let h = harness();
    assert!(!h.scheduler.cancel_active());

    h.run().await;
    assert!(!h.scheduler.cancel_active());
}

#[tokio::test]
async fn drain_waits_for_inline_run() {
    let h = harness_with(slow_acs(), 1);
    h.add_clearance("badge-lab", "Chemistry Lab").await;
    for person in ["p1", "p2", "p3", "p4"] {
        h.assign(person, "badge-lab").await;
    }

    let scheduler = h.scheduler.clone();
    let inline = tokio::spawn(async move { scheduler.run_now(RunTrigger::Manual).await });
    tokio::time::sleep(Duration::from_millis(60)).await;
    assert!(h.scheduler.is_running());

    h.scheduler.shutdown();
    tokio::time::timeout(Duration::from_secs(5), h.scheduler.drain())
        .await
        .unwrap();

    assert!(!h.scheduler.is_running());
    let stored = h.scheduler.latest_run().await.unwrap().unwrap();
    assert_eq!(stored.status, SyncRunStatus::Cancelled);

    let run = assert_ok!(inline.await.unwrap());
    assert_eq!(run.run_id, stored.run_id);
}

#[tokio::test]
async fn no_run_starts_after_shutdown() {
    let h = harness();
    h.scheduler.shutdown();

    let err = assert_err!(h.scheduler.run_now(RunTrigger::Timer).await);
    assert!(matches!(err, SyncError::ShuttingDown));
    let err = assert_err!(h.scheduler.trigger_run(RunTrigger::Manual).await);
    assert!(matches!(err, SyncError::ShuttingDown));
    assert!(!h.scheduler.is_running());

    tokio::time::timeout(Duration::from_secs(1), h.scheduler.drain())
        .await
        .unwrap();
    assert!(h.scheduler.latest_run().await.unwrap().is_none());
}

#[tokio::test]
async fn unrecorded_run_outcome_does_not_block_later_runs() {
    let h = harness();
    h.add_clearance("badge-lab", "Chemistry Lab").await;
    h.assign("alice", "badge-lab").await;

    h.runs.fail_next_finishes(100);
    let first = h.run().await;
    assert_eq!(first.status, SyncRunStatus::Succeeded);
    let stored = h.scheduler.run_status(first.run_id).await.unwrap();
    assert_eq!(stored.status, SyncRunStatus::Running);
    assert!(!h.scheduler.is_running());

    // While the store still refuses the write, no new run is recorded.
    h.assign("bob", "badge-lab").await;
    let err = assert_err!(h.scheduler.run_now(RunTrigger::Manual).await);
    assert!(matches!(err, SyncError::StateStore(_)));

    h.runs.fail_next_finishes(0);
    let second = h.run().await;
    assert_eq!(second.status, SyncRunStatus::Succeeded);
    assert_eq!(second.counts.grants_applied, 1);
    assert_eq!(h.acs.grants_of("bob").len(), 1);

    let recorded = h.scheduler.run_status(first.run_id).await.unwrap();
    assert_eq!(recorded.status, SyncRunStatus::Succeeded);
    assert_eq!(recorded.counts.grants_applied, 1);
    assert!(recorded.finished_utc.is_some());
}

#[tokio::test]
async fn empty_run_succeeds_without_acs_mutations() {
    let h = harness();

    let run = h.run().await;

    assert_eq!(run.status, SyncRunStatus::Succeeded);
    assert_eq!(run.counts.attempted(), 0);
    assert!(h.acs.mutations().is_empty());
    assert!(h.audit.entries().await.is_empty());
}

#[tokio::test]
async fn timer_fires_runs_until_shutdown() {
    let h = harness();
    h.add_clearance("badge-lab", "Chemistry Lab").await;
    h.assign("alice", "badge-lab").await;

    let timer = tokio::spawn(h.scheduler.clone().run_timer(Duration::from_millis(20)));

    let latest = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let Some(run) = h.scheduler.latest_run().await.unwrap() {
                if run.status.is_terminal() {
                    return run;
                }
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    assert_eq!(latest.trigger, RunTrigger::Timer);
    assert_eq!(h.acs.grants_of("alice").len(), 1);

    h.scheduler.shutdown();
    tokio::time::timeout(Duration::from_secs(5), timer)
        .await
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn shutdown_waits_for_timer_run() {
    let h = harness_with(slow_acs(), 1);
    h.add_clearance("badge-lab", "Chemistry Lab").await;
    for person in ["p1", "p2", "p3", "p4"] {
        h.assign(person, "badge-lab").await;
    }

    let timer = tokio::spawn(h.scheduler.clone().run_timer(Duration::from_secs(60)));
    tokio::time::sleep(Duration::from_millis(60)).await;
    assert!(h.scheduler.is_running());

    h.scheduler.shutdown();
    tokio::time::timeout(Duration::from_secs(5), h.scheduler.drain())
        .await
        .unwrap();
    assert!(!h.scheduler.is_running());

    let run = h.scheduler.latest_run().await.unwrap().unwrap();
    assert_eq!(run.trigger, RunTrigger::Timer);
    assert_eq!(run.status, SyncRunStatus::Cancelled);
    assert!(run.counts.not_attempted > 0);
    assert_eq!(run.counts.attempted() + run.counts.not_attempted, 4);

    // Every operation that reached the ACS was audited before exit.
    let audited = h.audit.entries().await.len() as i64;
    assert_eq!(audited, run.counts.attempted());
    assert_eq!(h.acs.mutations().len() as i64, run.counts.attempted());

    tokio::time::timeout(Duration::from_secs(5), timer)
        .await
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn shutdown_cancels_background_run() {
    let h = harness_with(slow_acs(), 1);
    h.add_clearance("badge-lab", "Chemistry Lab").await;
    for person in ["p1", "p2", "p3", "p4"] {
        h.assign(person, "badge-lab").await;
    }

    h.scheduler.trigger_run(RunTrigger::Manual).await.unwrap();
    tokio::time::sleep(Duration::from_millis(60)).await;
    h.scheduler.shutdown();

    let run = h.scheduler.wait_for_active().await.unwrap();
    assert_eq!(run.status, SyncRunStatus::Cancelled);
    assert!(run.counts.not_attempted > 0);
    assert_eq!(run.counts.attempted() + run.counts.not_attempted, 4);
}
