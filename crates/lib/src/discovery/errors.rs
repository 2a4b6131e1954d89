//! Error types for the discovery server.

use thiserror::Error;

/// Errors from discovery operations.
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum DiscoveryError {
    /// The requested port is already bound by another process.
    #[error("Discover port {port} already in use")]
    AddrInUse { port: u16 },

    /// The socket could not be bound for another reason.
    #[error("Failed to bind discover port {port}: {reason}")]
    Bind { port: u16, reason: String },

    /// The discovery task has exited.
    #[error("Discovery task gone")]
    TaskGone,

    /// A discovered-device session id does not exist.
    #[error("Unknown discover session {id}")]
    SessionNotFound { id: i64 },

    /// Too many concurrently open discovered-device sessions.
    #[error("Discover session limit reached")]
    SessionLimit,
}

impl DiscoveryError {
    /// Check if this error means the port is taken.
    pub fn is_addr_in_use(&self) -> bool {
        matches!(self, DiscoveryError::AddrInUse { .. })
    }

    /// Check if this error is about a discover session.
    pub fn is_session_error(&self) -> bool {
        matches!(
            self,
            DiscoveryError::SessionNotFound { .. } | DiscoveryError::SessionLimit
        )
    }
}
