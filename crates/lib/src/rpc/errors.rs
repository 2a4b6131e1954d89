//! Error types for the RPC surface.

use thiserror::Error;

/// Errors from issuing requests to other devices.
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum RpcError {
    /// Could not connect to the endpoint.
    #[error("Failed to connect to {addr}: {reason}")]
    ConnectFailed { addr: String, reason: String },

    /// The bounded response wait expired.
    #[error("Timeout waiting for {addr}")]
    Timeout { addr: String },

    /// The peer returned an error response.
    #[error("Peer returned {code:?}: {message}")]
    Peer { code: crate::proto::WireError, message: String },

    /// The peer answered with an unexpected response type.
    #[error("Unexpected response: expected {expected}")]
    UnexpectedResponse { expected: &'static str },

    /// Every endpoint of the target device failed.
    #[error("All endpoints of device {device_uuid} failed")]
    AllEndpointsFailed { device_uuid: String },
}

impl RpcError {
    /// Check if this error is transient (retry on another endpoint).
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            RpcError::ConnectFailed { .. } | RpcError::Timeout { .. }
        )
    }

    /// Check if the peer denied the request.
    pub fn is_permission_denied(&self) -> bool {
        matches!(
            self,
            RpcError::Peer {
                code: crate::proto::WireError::PermissionDeny,
                ..
            }
        )
    }
}
