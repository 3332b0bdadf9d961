//! Services module for clearance-sync.

pub mod database;
pub mod memory;
pub mod metrics;
pub mod store;

pub use database::Database;
pub use memory::{MemoryAuditSink, MemoryRunRepository, MemoryStateStore};
pub use metrics::{
    get_metrics, init_metrics, record_acs_operation, record_audit_write_failure,
    record_grpc_request, record_sync_run,
};
pub use store::{AuditSink, RunRepository, StateStore};
