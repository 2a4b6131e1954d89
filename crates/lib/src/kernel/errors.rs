//! Error types for the kernel façade.

use thiserror::Error;

/// Errors surfaced by the public kernel API.
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum KernelError {
    /// The engine has not been started.
    #[error("Engine not started")]
    NotStartup,

    /// A path argument is empty, relative, or outside the allowed prefix.
    #[error("Bad path: {path}")]
    BadPath { path: String },

    /// A directory argument does not exist.
    #[error("No such directory: {path}")]
    DirNoent { path: String },

    /// No such sync.
    #[error("Sync {sync_id} not found")]
    SyncNoent { sync_id: i64 },

    /// The sync already has a creator.
    #[error("Sync {sync_id} already has a creator")]
    SyncCreatorExist { sync_id: i64 },

    /// The operation is reserved to the sync's creator.
    #[error("Not the creator of sync {sync_id}")]
    NotSyncCreator { sync_id: i64 },

    /// No such tree.
    #[error("Tree {tree_id} not found")]
    TreeNoent { tree_id: i64 },

    /// This device already mirrors the sync.
    #[error("Tree for sync {sync_id} already exists on this device")]
    TreeExist { sync_id: i64 },

    /// A backup already has its source tree.
    #[error("Backup {sync_id} already has a source tree")]
    BackupSrcExist { sync_id: i64 },

    /// A backup already has a destination tree on the target.
    #[error("Backup {sync_id} already has a destination on that device")]
    BackupDstExist { sync_id: i64 },

    /// No such device.
    #[error("Device {device_id} not found")]
    DeviceNoent { device_id: i64 },

    /// The favorite path is already covered.
    #[error("Favorite already present: {path}")]
    FavouriteExist { path: String },

    /// No such favorite.
    #[error("Favorite not found: {path}")]
    FavouriteNoent { path: String },

    /// The share has been disconnected by the creator.
    #[error("Share of sync {sync_id} is disconnected")]
    ShareSyncDisconnect { sync_id: i64 },

    /// A sync blob failed to parse.
    #[error("Invalid sync blob")]
    InvalidSyncBlob,

    /// The report host answered outside 2xx.
    #[error("Report host returned {status}")]
    HttpReturnError { status: u16 },
}

impl KernelError {
    /// Check if this error is the not-started gate.
    pub fn is_not_startup(&self) -> bool {
        matches!(self, KernelError::NotStartup)
    }

    /// Check if this error names a missing entity.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            KernelError::SyncNoent { .. }
                | KernelError::TreeNoent { .. }
                | KernelError::DeviceNoent { .. }
                | KernelError::FavouriteNoent { .. }
                | KernelError::DirNoent { .. }
        )
    }

    /// Check if this error names an already-existing entity.
    pub fn is_already_exists(&self) -> bool {
        matches!(
            self,
            KernelError::TreeExist { .. }
                | KernelError::SyncCreatorExist { .. }
                | KernelError::BackupSrcExist { .. }
                | KernelError::BackupDstExist { .. }
                | KernelError::FavouriteExist { .. }
        )
    }
}
