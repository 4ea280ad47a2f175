pub mod aggregate;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod gateway;
pub mod mutations;
pub mod snapshot;

#[cfg(test)]
mod test_support;

pub use coordinator::{Dashboard, DashboardView, Phase, UploadOutcome};
pub use error::SyncError;
pub use gateway::{ClusterApi, HttpGateway, LocalUpload, QueueFilter};
pub use snapshot::{Snapshot, Source};
