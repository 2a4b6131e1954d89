//! Error types for the refresh workers.

use thiserror::Error;

/// Errors from tree indexing.
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum RefreshError {
    /// The tree does not exist or is disabled.
    #[error("Tree {tree_id} not refreshable")]
    TreeNotRefreshable { tree_id: i64 },

    /// The tree root is missing on disk.
    #[error("Tree root missing: {root}")]
    RootMissing { root: String },

    /// The walk could not start (e.g. permission denied on the root).
    #[error("Failed to walk {root}: {reason}")]
    WalkFailed { root: String, reason: String },

    /// The refresh queue is closed.
    #[error("Refresh pool unavailable")]
    PoolClosed,
}

impl RefreshError {
    /// Check if this error aborts the whole task rather than one entry.
    pub fn is_fatal(&self) -> bool {
        matches!(self, RefreshError::WalkFailed { .. })
    }
}
