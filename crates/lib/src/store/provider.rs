//! The content-provider abstraction over the metadata store.
//!
//! One trait replaces the deep provider hierarchy of a classic content
//! resolver: typed values in, opaque rows out, and a batch operation that
//! commits atomically and notifies each distinct URI exactly once.

use std::collections::HashMap;

use async_trait::async_trait;

use super::errors::StoreError;
use super::observer::ObserverHandle;
use super::uri::Uri;
use crate::Result;

/// A dynamically typed SQL value.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Integer(i64),
    Real(f64),
    Text(String),
    Blob(Vec<u8>),
    Null,
}

impl From<i64> for SqlValue {
    fn from(v: i64) -> Self {
        SqlValue::Integer(v)
    }
}

impl From<bool> for SqlValue {
    fn from(v: bool) -> Self {
        SqlValue::Integer(v as i64)
    }
}

impl From<&str> for SqlValue {
    fn from(v: &str) -> Self {
        SqlValue::Text(v.to_string())
    }
}

impl From<String> for SqlValue {
    fn from(v: String) -> Self {
        SqlValue::Text(v)
    }
}

impl From<Vec<u8>> for SqlValue {
    fn from(v: Vec<u8>) -> Self {
        SqlValue::Blob(v)
    }
}

impl From<Option<i64>> for SqlValue {
    fn from(v: Option<i64>) -> Self {
        v.map(SqlValue::Integer).unwrap_or(SqlValue::Null)
    }
}

impl From<Option<String>> for SqlValue {
    fn from(v: Option<String>) -> Self {
        v.map(SqlValue::Text).unwrap_or(SqlValue::Null)
    }
}

/// Column/value pairs for an insert or update.
#[derive(Debug, Clone, Default)]
pub struct ContentValues(pub(crate) Vec<(String, SqlValue)>);

impl ContentValues {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a column value. Chains for literal row construction.
    pub fn put(mut self, column: &str, value: impl Into<SqlValue>) -> Self {
        self.0.push((column.to_string(), value.into()));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }
}

/// A parameterized WHERE clause; `?` placeholders bind `args` in order.
#[derive(Debug, Clone)]
pub struct Selection {
    pub clause: String,
    pub args: Vec<SqlValue>,
}

impl Selection {
    pub fn new(clause: impl Into<String>) -> Self {
        Self {
            clause: clause.into(),
            args: Vec::new(),
        }
    }

    /// Bind the next `?` placeholder.
    pub fn bind(mut self, value: impl Into<SqlValue>) -> Self {
        self.args.push(value.into());
        self
    }
}

/// Conflict policy for inserts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OnConflict {
    /// Fail the statement (and the enclosing batch).
    #[default]
    Abort,
    /// Silently keep the existing row.
    Ignore,
    /// Replace the existing row.
    Replace,
}

impl OnConflict {
    pub(crate) fn sql(self) -> &'static str {
        match self {
            OnConflict::Abort => "INSERT",
            OnConflict::Ignore => "INSERT OR IGNORE",
            OnConflict::Replace => "INSERT OR REPLACE",
        }
    }
}

/// One operation inside an atomic batch.
#[derive(Debug, Clone)]
pub enum BatchOp {
    Insert {
        uri: Uri,
        values: ContentValues,
        on_conflict: OnConflict,
    },
    Update {
        uri: Uri,
        values: ContentValues,
        selection: Option<Selection>,
    },
    Delete {
        uri: Uri,
        selection: Option<Selection>,
    },
}

impl BatchOp {
    pub(crate) fn uri(&self) -> &Uri {
        match self {
            BatchOp::Insert { uri, .. }
            | BatchOp::Update { uri, .. }
            | BatchOp::Delete { uri, .. } => uri,
        }
    }
}

/// A materialized row with typed column access.
#[derive(Debug, Clone, Default)]
pub struct SqlRow(pub(crate) HashMap<String, SqlValue>);

impl SqlRow {
    pub fn get_i64(&self, column: &str) -> Result<i64> {
        match self.0.get(column) {
            Some(SqlValue::Integer(v)) => Ok(*v),
            _ => Err(StoreError::BadColumn {
                column: column.to_string(),
            }
            .into()),
        }
    }

    pub fn get_opt_i64(&self, column: &str) -> Result<Option<i64>> {
        match self.0.get(column) {
            Some(SqlValue::Integer(v)) => Ok(Some(*v)),
            Some(SqlValue::Null) | None => Ok(None),
            _ => Err(StoreError::BadColumn {
                column: column.to_string(),
            }
            .into()),
        }
    }

    pub fn get_bool(&self, column: &str) -> Result<bool> {
        Ok(self.get_i64(column)? != 0)
    }

    pub fn get_str(&self, column: &str) -> Result<&str> {
        match self.0.get(column) {
            Some(SqlValue::Text(v)) => Ok(v),
            _ => Err(StoreError::BadColumn {
                column: column.to_string(),
            }
            .into()),
        }
    }

    pub fn get_opt_str(&self, column: &str) -> Result<Option<&str>> {
        match self.0.get(column) {
            Some(SqlValue::Text(v)) => Ok(Some(v)),
            Some(SqlValue::Null) | None => Ok(None),
            _ => Err(StoreError::BadColumn {
                column: column.to_string(),
            }
            .into()),
        }
    }

    pub fn get_blob(&self, column: &str) -> Result<&[u8]> {
        match self.0.get(column) {
            Some(SqlValue::Blob(v)) => Ok(v),
            _ => Err(StoreError::BadColumn {
                column: column.to_string(),
            }
            .into()),
        }
    }
}

/// Typed access to the URI-addressed tables of the metadata store.
///
/// Every mutation notifies observers of the changed URI after it commits;
/// `apply_batch` runs its operations under one transaction and notifies each
/// distinct URI exactly once.
#[async_trait]
pub trait ContentProvider: Send + Sync {
    /// Query rows. Empty `projection` selects `*`.
    async fn query(
        &self,
        uri: &Uri,
        projection: &[&str],
        selection: Option<&Selection>,
        order_by: Option<&str>,
    ) -> Result<Vec<SqlRow>>;

    /// Insert one row; returns its rowid.
    async fn insert(&self, uri: &Uri, values: ContentValues, on_conflict: OnConflict)
    -> Result<i64>;

    /// Update matching rows; returns the affected count.
    async fn update(
        &self,
        uri: &Uri,
        values: ContentValues,
        selection: Option<&Selection>,
    ) -> Result<u64>;

    /// Delete matching rows; returns the affected count.
    async fn delete(&self, uri: &Uri, selection: Option<&Selection>) -> Result<u64>;

    /// Execute `ops` atomically; returns total affected rows.
    async fn apply_batch(&self, ops: Vec<BatchOp>) -> Result<u64>;

    /// Subscribe to change notifications for `prefix`.
    fn register_observer(&self, prefix: Uri, recursive: bool) -> ObserverHandle;
}
