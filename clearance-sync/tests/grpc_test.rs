//! End-to-end tests for the gRPC control surface.

mod common;

use clearance_sync::acs::MockAcsClient;
use clearance_sync::grpc::proto::{
    self, GetLatestRunRequest, GetRunStatusRequest, ListAuditEntriesRequest, TriggerRunRequest,
};
use common::{harness, harness_with, spawn_grpc};
use std::time::Duration;
use tonic::Code;

#[tokio::test]
async fn trigger_run_and_poll_status() {
    let h = harness();
    h.add_clearance("badge-lab", "Chemistry Lab").await;
    h.assign("alice", "badge-lab").await;
    let mut client = spawn_grpc(&h).await;

    let run_id = client
        .trigger_run(TriggerRunRequest {})
        .await
        .unwrap()
        .into_inner()
        .run_id;

    h.scheduler.wait_for_active().await.unwrap();

    let run = client
        .get_run_status(GetRunStatusRequest {
            run_id: run_id.clone(),
        })
        .await
        .unwrap()
        .into_inner()
        .run
        .unwrap();
    assert_eq!(run.run_id, run_id);
    assert_eq!(run.status, proto::SyncRunStatus::Succeeded as i32);
    assert_eq!(run.trigger, proto::RunTrigger::Manual as i32);
    assert_eq!(run.grants_applied, 1);
    assert!(run.finished_utc.is_some());

    let latest = client
        .get_latest_run(GetLatestRunRequest {})
        .await
        .unwrap()
        .into_inner()
        .run
        .unwrap();
    assert_eq!(latest.run_id, run_id);
}

#[tokio::test]
async fn second_trigger_while_running_already_exists() {
    let h = harness_with(MockAcsClient::new().with_latency(Duration::from_millis(50)), 1);
    h.add_clearance("badge-lab", "Chemistry Lab").await;
    h.assign("alice", "badge-lab").await;
    let mut client = spawn_grpc(&h).await;

    client.trigger_run(TriggerRunRequest {}).await.unwrap();
    let err = client.trigger_run(TriggerRunRequest {}).await.unwrap_err();
    assert_eq!(err.code(), Code::AlreadyExists);

    let cancelled = client
        .cancel_run(proto::CancelRunRequest {})
        .await
        .unwrap()
        .into_inner()
        .cancelled;
    assert!(cancelled);

    h.scheduler.wait_for_active().await.unwrap();
    let idle = client
        .cancel_run(proto::CancelRunRequest {})
        .await
        .unwrap()
        .into_inner()
        .cancelled;
    assert!(!idle);
}

#[tokio::test]
async fn run_status_validates_run_id() {
    let h = harness();
    let mut client = spawn_grpc(&h).await;

    let err = client
        .get_run_status(GetRunStatusRequest {
            run_id: "not-a-uuid".to_string(),
        })
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::InvalidArgument);

    let err = client
        .get_run_status(GetRunStatusRequest {
            run_id: uuid::Uuid::new_v4().to_string(),
        })
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::NotFound);

    let latest = client
        .get_latest_run(GetLatestRunRequest {})
        .await
        .unwrap()
        .into_inner();
    assert!(latest.run.is_none());
}

#[tokio::test]
async fn audit_entries_are_searchable() {
    let h = harness();
    h.add_clearance("badge-lab", "Chemistry Lab").await;
    h.add_clearance("badge-gym", "Gymnasium").await;
    h.assign("alice", "badge-lab").await;
    h.assign("alice", "badge-gym").await;
    h.assign("bob", "badge-lab").await;
    h.run().await;
    let mut client = spawn_grpc(&h).await;

    let alice = client
        .list_audit_entries(ListAuditEntriesRequest {
            person_id: Some("alice".to_string()),
            ..Default::default()
        })
        .await
        .unwrap()
        .into_inner()
        .entries;
    assert_eq!(alice.len(), 2);
    assert!(alice.iter().all(|e| e.person_id == "alice"));
    assert!(alice
        .iter()
        .all(|e| e.outcome == proto::AuditOutcome::Success as i32));

    let lab = client
        .list_audit_entries(ListAuditEntriesRequest {
            clearance_name: Some("chemistry".to_string()),
            ..Default::default()
        })
        .await
        .unwrap()
        .into_inner()
        .entries;
    assert_eq!(lab.len(), 2);

    let page = client
        .list_audit_entries(ListAuditEntriesRequest {
            skip: 1,
            limit: 1,
            ..Default::default()
        })
        .await
        .unwrap()
        .into_inner()
        .entries;
    assert_eq!(page.len(), 1);

    let err = client
        .list_audit_entries(ListAuditEntriesRequest {
            limit: -1,
            ..Default::default()
        })
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::InvalidArgument);
}
