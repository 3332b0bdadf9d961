//! gRPC interceptors for cross-cutting concerns.
//!
//! The control surface of the sync service is called by operators and by the
//! admin API, both of which forward W3C trace context and a request ID. The
//! interceptor records those on the current span so a manual run trigger can
//! be correlated with the caller's trace.

use tonic::{Request, Status};

/// gRPC metadata key for W3C traceparent header.
pub const TRACEPARENT_KEY: &str = "traceparent";

/// gRPC metadata key for request ID.
pub const REQUEST_ID_KEY: &str = "x-request-id";

/// Interceptor that extracts trace context from incoming requests.
///
/// # Example
///
/// ```ignore
/// use service_core::grpc::interceptors::trace_context_interceptor;
///
/// let svc = ClearanceSyncServiceServer::with_interceptor(svc, trace_context_interceptor);
/// ```
#[allow(clippy::result_large_err)]
pub fn trace_context_interceptor(request: Request<()>) -> Result<Request<()>, Status> {
    if let Some(traceparent) = extract_traceparent(&request) {
        tracing::debug!(traceparent = %traceparent, "Received trace context");
    }

    if let Some(request_id) = extract_request_id(&request) {
        tracing::Span::current().record("request_id", request_id.as_str());
    }

    Ok(request)
}

/// Extract trace context from incoming gRPC request metadata.
///
/// Returns the traceparent header value if present.
pub fn extract_traceparent<T>(request: &Request<T>) -> Option<String> {
    request
        .metadata()
        .get(TRACEPARENT_KEY)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
}

/// Extract request ID from incoming gRPC request metadata.
pub fn extract_request_id<T>(request: &Request<T>) -> Option<String> {
    request
        .metadata()
        .get(REQUEST_ID_KEY)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_request_id() {
        let mut request = Request::new(());
        request
            .metadata_mut()
            .insert(REQUEST_ID_KEY, "sync-request-123".parse().unwrap());

        let extracted = extract_request_id(&request);
        assert_eq!(extracted, Some("sync-request-123".to_string()));
    }

    #[test]
    fn test_extract_traceparent_missing() {
        let request = Request::new(());
        assert_eq!(extract_traceparent(&request), None);
    }

    #[test]
    fn test_interceptor_passes_through() {
        let request = Request::new(());
        let result = trace_context_interceptor(request);
        assert!(result.is_ok());
    }
}
