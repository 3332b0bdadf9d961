//! gRPC utilities shared by the clearance services.
//!
//! This module provides:
//! - Error conversion between `AppError` and `tonic::Status`
//! - Interceptors for trace context propagation

pub mod error;
pub mod interceptors;

pub use error::{GrpcResult, IntoStatus};
pub use interceptors::{
    REQUEST_ID_KEY, TRACEPARENT_KEY, extract_request_id, extract_traceparent,
    trace_context_interceptor,
};

// Re-export commonly used tonic types
pub use tonic::{Code, Request, Response, Status};
