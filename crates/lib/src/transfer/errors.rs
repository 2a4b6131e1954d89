//! Error types for the transfer server.

use thiserror::Error;

/// Errors from data-port streaming and task management.
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum TransferError {
    /// The data port is already bound by another process.
    #[error("Data port {port} already in use")]
    AddrInUse { port: u16 },

    /// The listener could not be bound.
    #[error("Failed to bind data port {port}: {reason}")]
    Bind { port: u16, reason: String },

    /// Connecting to the peer's data port failed.
    #[error("Failed to connect to {addr}: {reason}")]
    ConnectFailed { addr: String, reason: String },

    /// A streamed file's digest did not match its header.
    #[error("Digest mismatch for {path}: expected {expected}, got {actual}")]
    DigestMismatch {
        path: String,
        expected: String,
        actual: String,
    },

    /// A file kept failing and ran out of attempts.
    #[error("Transfer of {path} failed after {attempts} attempts")]
    RetriesExhausted { path: String, attempts: u32 },

    /// No such transfer task.
    #[error("Unknown transfer task {task_id}")]
    TaskNotFound { task_id: i64 },

    /// No reachable peer holds the requested content.
    #[error("No reachable source for sync {sync_uuid}")]
    NoSource { sync_uuid: String },

    /// The peer rejected the session.
    #[error("Peer rejected transfer: {reason}")]
    Rejected { reason: String },
}

impl TransferError {
    /// Check if this error is an integrity failure.
    pub fn is_integrity_error(&self) -> bool {
        matches!(self, TransferError::DigestMismatch { .. })
    }

    /// Check if this error is retryable at the file level.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            TransferError::DigestMismatch { .. } | TransferError::ConnectFailed { .. }
        )
    }
}
