//! Reconciliation engine.

pub mod diff;
pub mod error;
pub mod reconciler;
pub mod scheduler;

pub use error::SyncError;
pub use reconciler::{Reconciler, ReconcilerConfig};
pub use scheduler::Scheduler;
