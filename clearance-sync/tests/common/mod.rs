//! Common test utilities for clearance-sync integration tests.

#![allow(dead_code)]

use chrono::{DateTime, Utc};
use clearance_sync::acs::MockAcsClient;
use clearance_sync::grpc::proto::clearance_sync_service_client::ClearanceSyncServiceClient;
use clearance_sync::grpc::proto::clearance_sync_service_server::ClearanceSyncServiceServer;
use clearance_sync::grpc::ClearanceSyncServiceImpl;
use clearance_sync::models::{Clearance, NewAssignment, RunTrigger, SyncRun};
use clearance_sync::services::{MemoryAuditSink, MemoryRunRepository, MemoryStateStore, StateStore};
use clearance_sync::sync::{Reconciler, ReconcilerConfig, Scheduler};
use service_core::retry::RetryConfig;
use std::sync::{Arc, Once};
use std::time::Duration;
use tonic::transport::Channel;

static INIT: Once = Once::new();

pub const LIAISON: &str = "liaison-1";

/// Initialize tracing for tests (only once).
pub fn init_tracing() {
    INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter("info,clearance_sync=debug")
            .with_test_writer()
            .try_init()
            .ok();
    });
}

/// Retry policy with millisecond backoffs and no jitter.
pub fn test_retry() -> RetryConfig {
    RetryConfig {
        max_retries: 3,
        initial_backoff: Duration::from_millis(1),
        max_backoff: Duration::from_millis(5),
        backoff_multiplier: 2.0,
        add_jitter: false,
    }
}

/// Engine wired to in-memory stores and a scriptable ACS.
pub struct TestHarness {
    pub state: Arc<MemoryStateStore>,
    pub audit: Arc<MemoryAuditSink>,
    pub runs: Arc<MemoryRunRepository>,
    pub acs: Arc<MockAcsClient>,
    pub scheduler: Arc<Scheduler>,
}

pub fn harness() -> TestHarness {
    harness_with(MockAcsClient::new(), 4)
}

pub fn harness_with(acs: MockAcsClient, max_concurrency: usize) -> TestHarness {
    init_tracing();

    let state = Arc::new(MemoryStateStore::new());
    let audit = Arc::new(MemoryAuditSink::new());
    let runs = Arc::new(MemoryRunRepository::new());
    let acs = Arc::new(acs);

    let reconciler = Arc::new(Reconciler::new(
        state.clone(),
        acs.clone(),
        audit.clone(),
        runs.clone(),
        ReconcilerConfig {
            max_concurrency,
            retry: test_retry(),
        },
    ));
    let scheduler = Arc::new(Scheduler::new(reconciler, runs.clone()));

    TestHarness {
        state,
        audit,
        runs,
        acs,
        scheduler,
    }
}

impl TestHarness {
    /// Register a clearance and let [`LIAISON`] manage it.
    pub async fn add_clearance(&self, clearance_id: &str, name: &str) {
        self.state
            .upsert_clearance(&Clearance::new(clearance_id, name))
            .await
            .unwrap();
        self.state
            .grant_liaison_permission(LIAISON, clearance_id)
            .await
            .unwrap();
    }

    pub async fn assign(&self, person_id: &str, clearance_id: &str) {
        self.state
            .record_assignment(&NewAssignment::grant(LIAISON, person_id, clearance_id))
            .await
            .unwrap();
    }

    pub async fn assign_window(
        &self,
        person_id: &str,
        clearance_id: &str,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) {
        self.state
            .record_assignment(
                &NewAssignment::grant(LIAISON, person_id, clearance_id).with_window(start, end),
            )
            .await
            .unwrap();
    }

    pub async fn unassign(&self, person_id: &str, clearance_id: &str) {
        self.state
            .record_assignment(&NewAssignment::revoke(LIAISON, person_id, clearance_id))
            .await
            .unwrap();
    }

    /// Run a manual reconciliation to completion.
    pub async fn run(&self) -> SyncRun {
        self.scheduler.run_now(RunTrigger::Manual).await.unwrap()
    }
}

/// Serve the control surface for `harness` on an ephemeral port.
pub async fn spawn_grpc(harness: &TestHarness) -> ClearanceSyncServiceClient<Channel> {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let incoming = tokio_stream::wrappers::TcpListenerStream::new(listener);

    let service = ClearanceSyncServiceImpl::new(harness.scheduler.clone(), harness.audit.clone());
    tokio::spawn(
        tonic::transport::Server::builder()
            .add_service(ClearanceSyncServiceServer::new(service))
            .serve_with_incoming(incoming),
    );

    ClearanceSyncServiceClient::connect(format!("http://127.0.0.1:{}", port))
        .await
        .unwrap()
}
