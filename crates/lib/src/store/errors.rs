//! Error types for the metadata store.

use thiserror::Error;

/// Errors that can occur during metadata store operations.
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum StoreError {
    /// Underlying sqlx failure.
    #[error("Store backend error: {reason}")]
    Sqlx {
        /// Description including the failing statement.
        reason: String,
        /// The underlying sqlx error, when available.
        #[source]
        source: Option<sqlx::Error>,
    },

    /// The store could not be opened.
    #[error("Failed to open store at {path}: {reason}")]
    OpenFailed { path: String, reason: String },

    /// A schema migration failed; the store refuses to open.
    #[error("Schema migration v{from} -> v{to} failed: {reason}")]
    MigrationFailed { from: i64, to: i64, reason: String },

    /// A batch was rolled back because one of its operations failed.
    #[error("Batch of {ops} operations rolled back: {reason}")]
    BatchFailed { ops: usize, reason: String },

    /// A URI does not resolve to a known table.
    #[error("Unknown store URI: {uri}")]
    UnknownUri { uri: String },

    /// A queried column was absent or of the wrong type.
    #[error("Column '{column}' missing or mistyped")]
    BadColumn { column: String },

    /// A row that must exist was not found.
    #[error("Row not found in {table}")]
    RowNotFound { table: String },
}

impl StoreError {
    /// Check if this error is an integrity failure (CONTENT in the public
    /// taxonomy).
    pub fn is_integrity_error(&self) -> bool {
        matches!(
            self,
            StoreError::BatchFailed { .. } | StoreError::BadColumn { .. }
        )
    }

    /// Check if this error is fatal for startup.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            StoreError::MigrationFailed { .. } | StoreError::OpenFailed { .. }
        )
    }

    /// Check if this error indicates a missing row.
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::RowNotFound { .. })
    }
}
