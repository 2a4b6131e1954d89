//! Error types for configuration and identity.

use thiserror::Error;

/// Errors from the config service.
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A port value outside 1..=65535.
    #[error("Invalid port: {port}")]
    InvalidPort { port: i64 },

    /// A required path is empty or not absolute.
    #[error("Bad path: {path}")]
    BadPath { path: String },

    /// A stored config value failed to parse.
    #[error("Corrupt config value for '{key}': {value}")]
    CorruptValue { key: String, value: String },

    /// The account has not been initialized yet.
    #[error("Account not initialized")]
    AccountNotInitialized,
}

impl ConfigError {
    /// Check if this error is about a port value.
    pub fn is_port_error(&self) -> bool {
        matches!(self, ConfigError::InvalidPort { .. })
    }

    /// Check if this error is about a filesystem path.
    pub fn is_path_error(&self) -> bool {
        matches!(self, ConfigError::BadPath { .. })
    }
}
