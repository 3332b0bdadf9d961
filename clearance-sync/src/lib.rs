//! Clearance Sync - Reconciles clearance assignments with the CCURE access-control system.

pub mod acs;
pub mod config;
pub mod grpc;
pub mod models;
pub mod services;
pub mod startup;
pub mod sync;
