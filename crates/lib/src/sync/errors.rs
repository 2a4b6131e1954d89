//! Error types for the sync workers.

use thiserror::Error;

/// Errors from tree-pair synchronization.
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum SyncError {
    /// One side of the pair does not exist.
    #[error("Tree {tree_id} not found")]
    TreeNotFound { tree_id: i64 },

    /// The sync row backing the pair does not exist.
    #[error("Sync {sync_id} not found")]
    SyncNotFound { sync_id: i64 },

    /// The remote device is unknown.
    #[error("Device {device_id} not found")]
    DeviceNotFound { device_id: i64 },

    /// Every known endpoint of the remote device failed.
    #[error("Device {device_uuid} unreachable")]
    RemoteUnreachable { device_uuid: String },

    /// The peer answered with an error.
    #[error("Peer error: {message}")]
    PeerError { message: String },

    /// The pair was aborted mid-flight.
    #[error("Sync of pair ({local}, {remote}) aborted")]
    Aborted { local: i64, remote: i64 },

    /// The sync queue is closed.
    #[error("Sync pool unavailable")]
    PoolClosed,
}

impl SyncError {
    /// Check if this error is the benign cancellation path.
    pub fn is_aborted(&self) -> bool {
        matches!(self, SyncError::Aborted { .. })
    }

    /// Check if this error means the peer cannot be reached right now.
    pub fn is_unreachable(&self) -> bool {
        matches!(self, SyncError::RemoteUnreachable { .. })
    }

    /// Check if this error indicates a missing entity.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            SyncError::TreeNotFound { .. }
                | SyncError::SyncNotFound { .. }
                | SyncError::DeviceNotFound { .. }
        )
    }
}
