//! Error types for the router.

use thiserror::Error;

/// Errors from the route-port server and its worker pools.
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum RouterError {
    /// The route port is already bound by another process.
    #[error("Route port {port} already in use")]
    AddrInUse { port: u16 },

    /// The listener could not be bound.
    #[error("Failed to bind route port {port}: {reason}")]
    Bind { port: u16, reason: String },

    /// The router task has exited.
    #[error("Router task gone")]
    TaskGone,

    /// A worker queue is closed.
    #[error("Worker pool '{pool}' unavailable")]
    PoolClosed { pool: &'static str },
}

impl RouterError {
    /// Check if this error means the port is taken.
    pub fn is_addr_in_use(&self) -> bool {
        matches!(self, RouterError::AddrInUse { .. })
    }
}
