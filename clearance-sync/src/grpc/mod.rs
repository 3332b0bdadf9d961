//! gRPC module for clearance-sync.

mod service;

pub use service::ClearanceSyncServiceImpl;

/// Generated protobuf code.
pub mod proto {
    tonic::include_proto!("clearance.sync.v1");

    pub const FILE_DESCRIPTOR_SET: &[u8] =
        tonic::include_file_descriptor_set!("clearance_sync_descriptor");
}
