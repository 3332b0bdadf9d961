//! gRPC service implementation for ClearanceSyncService.

use crate::grpc::proto::*;
use crate::models::{timestamp_to_datetime, AuditFilter, RunTrigger};
use crate::services::{record_grpc_request, AuditSink};
use crate::sync::Scheduler;
use service_core::error::AppError;
use service_core::grpc::{GrpcResult, IntoStatus};
use std::str::FromStr;
use std::sync::Arc;
use tonic::{Request, Response};
use uuid::Uuid;

/// ClearanceSyncService gRPC implementation.
pub struct ClearanceSyncServiceImpl {
    scheduler: Arc<Scheduler>,
    audit: Arc<dyn AuditSink>,
}

impl ClearanceSyncServiceImpl {
    pub fn new(scheduler: Arc<Scheduler>, audit: Arc<dyn AuditSink>) -> Self {
        Self { scheduler, audit }
    }
}

/// Count the request under `method` and convert the error side to a status.
fn finish<T>(method: &str, result: Result<T, AppError>) -> GrpcResult<T> {
    match result {
        Ok(body) => {
            record_grpc_request(method, "ok");
            Ok(Response::new(body))
        }
        Err(e) => {
            let status = e.into_status();
            record_grpc_request(method, &format!("{:?}", status.code()));
            Err(status)
        }
    }
}

fn parse_run_id(raw: &str) -> Result<Uuid, AppError> {
    Uuid::from_str(raw).map_err(|_| AppError::BadRequest(anyhow::anyhow!("Invalid run_id")))
}

fn parse_timestamp(
    ts: Option<prost_types::Timestamp>,
    field: &str,
) -> Result<Option<chrono::DateTime<chrono::Utc>>, AppError> {
    ts.map(|t| {
        timestamp_to_datetime(&t)
            .ok_or_else(|| AppError::BadRequest(anyhow::anyhow!("Invalid {}", field)))
    })
    .transpose()
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

impl TryFrom<ListAuditEntriesRequest> for AuditFilter {
    type Error = AppError;

    fn try_from(req: ListAuditEntriesRequest) -> Result<Self, Self::Error> {
        if req.skip < 0 || req.limit < 0 {
            return Err(AppError::BadRequest(anyhow::anyhow!(
                "skip and limit must not be negative"
            )));
        }

        Ok(Self {
            person_id: non_empty(req.person_id),
            assigner_id: non_empty(req.assigner_id),
            clearance_id: non_empty(req.clearance_id),
            clearance_name: non_empty(req.clearance_name),
            message: non_empty(req.message),
            run_id: non_empty(req.run_id)
                .map(|r| parse_run_id(&r))
                .transpose()?,
            from_utc: parse_timestamp(req.from_utc, "from_utc")?,
            to_utc: parse_timestamp(req.to_utc, "to_utc")?,
            skip: req.skip as i64,
            limit: req.limit as i64,
        })
    }
}

#[tonic::async_trait]
impl clearance_sync_service_server::ClearanceSyncService for ClearanceSyncServiceImpl {
    async fn trigger_run(
        &self,
        _request: Request<TriggerRunRequest>,
    ) -> GrpcResult<TriggerRunResponse> {
        tracing::info!("Manual sync run requested");

        let result = self
            .scheduler
            .trigger_run(RunTrigger::Manual)
            .await
            .map(|run_id| TriggerRunResponse {
                run_id: run_id.to_string(),
            })
            .map_err(AppError::from);

        finish("TriggerRun", result)
    }

    async fn cancel_run(
        &self,
        _request: Request<CancelRunRequest>,
    ) -> GrpcResult<CancelRunResponse> {
        let cancelled = self.scheduler.cancel_active();
        finish("CancelRun", Ok(CancelRunResponse { cancelled }))
    }

    async fn get_run_status(
        &self,
        request: Request<GetRunStatusRequest>,
    ) -> GrpcResult<GetRunStatusResponse> {
        let req = request.into_inner();

        let result: Result<_, AppError> = async {
            let run_id = parse_run_id(&req.run_id)?;
            let run = self.scheduler.run_status(run_id).await?;
            Ok(GetRunStatusResponse {
                run: Some(run.into()),
            })
        }
        .await;

        finish("GetRunStatus", result)
    }

    async fn get_latest_run(
        &self,
        _request: Request<GetLatestRunRequest>,
    ) -> GrpcResult<GetLatestRunResponse> {
        let result = self
            .scheduler
            .latest_run()
            .await
            .map(|run| GetLatestRunResponse {
                run: run.map(Into::into),
            })
            .map_err(AppError::from);

        finish("GetLatestRun", result)
    }

    async fn list_audit_entries(
        &self,
        request: Request<ListAuditEntriesRequest>,
    ) -> GrpcResult<ListAuditEntriesResponse> {
        let req = request.into_inner();

        let result: Result<_, AppError> = async {
            let filter = AuditFilter::try_from(req)?;
            let entries = self.audit.list(&filter).await?;
            Ok(ListAuditEntriesResponse {
                entries: entries.into_iter().map(Into::into).collect(),
            })
        }
        .await;

        finish("ListAuditEntries", result)
    }
}
