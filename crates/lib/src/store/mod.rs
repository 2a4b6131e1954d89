//! Metadata store (content provider over embedded sqlite).
//!
//! One store instance owns the main database: typed tables for devices,
//! syncs, trees, per-tree file tables, selective-sync lists, share grants,
//! discovered peers and config. Mutations go through the
//! [`ContentProvider`] trait; writers serialize on a per-store latch while
//! readers run concurrently on the pool. Observers subscribe by URI prefix
//! and are notified exactly once per changed URI per committed transaction.

mod errors;
mod observer;
mod ops;
mod path;
mod plain;
mod provider;
mod rows;
mod schema;
mod sync_list;
mod uri;

pub use errors::StoreError;
pub use observer::{ObserverHandle, ObserverRegistry};
pub use path::{
    descendants_pattern, escape_like, file_name, fix_path, is_self_or_descendant, parent,
};
pub use plain::{
    HistoryCode, HistoryEntry, MISC_KEY_PASSPHRASE_SEED, PlainStore, StaticPeer,
};
pub use provider::{BatchOp, ContentProvider, ContentValues, OnConflict, Selection, SqlRow, SqlValue};
pub use rows::{
    BackupType, Device, DeviceIp, DeviceStatus, DhtPeer, FileEntry, FileKind, FileStatus,
    RootStatus, ShareSyncEntry, Sync, SyncListEntry, SyncMode, SyncModeEntry, SyncPerm,
    SyncStatus, SyncType, Tree, TreeStatus,
};
pub use sync_list::{PathType, SyncListTrie};
pub use uri::{Uri, file_table_name};

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::{Column, Row, TypeInfo, ValueRef};
use tokio::sync::Mutex;

use crate::Result;

/// The metadata store.
pub struct MetaStore {
    pool: SqlitePool,
    /// Serializes writers; readers run concurrently on the pool.
    write_latch: Mutex<()>,
    observers: Arc<ObserverRegistry>,
}

/// A change to one file row, applied under a single batch.
#[derive(Debug, Clone)]
pub enum FileChange {
    /// New row; the store assigns the next usn.
    Insert(FileEntry),
    /// Replace the row with this path; the store assigns the next usn.
    Update(FileEntry),
    /// Turn the row into a deletion tombstone with a new usn and a bumped
    /// local vclock component.
    Tombstone {
        path: String,
        modifier: String,
        time_stamp: i64,
    },
}

impl MetaStore {
    /// Open (or create) the store at `path`.
    ///
    /// `passphrase` is applied as the sqlite key pragma when the linked
    /// sqlite carries SQLCipher; on a plain build it is a no-op.
    pub async fn open(path: &Path, passphrase: Option<&str>) -> Result<Self> {
        let url = format!("sqlite:{}?mode=rwc", path.display());
        Self::connect(&url, passphrase).await.map_err(|e| {
            StoreError::OpenFailed {
                path: path.display().to_string(),
                reason: e.to_string(),
            }
            .into()
        })
    }

    /// In-memory store for tests.
    pub async fn open_in_memory() -> Result<Self> {
        let unique = uuid::Uuid::new_v4();
        let url = format!("sqlite:file:meta_{unique}?mode=memory&cache=shared");
        Self::connect(&url, None).await
    }

    async fn connect(url: &str, passphrase: Option<&str>) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(url)
            .await
            .map_err(|e| StoreError::Sqlx {
                reason: format!("Failed to connect: {e}"),
                source: Some(e),
            })?;

        if let Some(key) = passphrase {
            let stmt = format!("PRAGMA key = '{}'", key.replace('\'', "''"));
            sqlx::query(&stmt)
                .execute(&pool)
                .await
                .map_err(|e| StoreError::Sqlx {
                    reason: format!("Failed to apply store key: {e}"),
                    source: Some(e),
                })?;
        }

        sqlx::query(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .execute(&pool)
        .await
        .map_err(|e| StoreError::Sqlx {
            reason: format!("Failed to configure sqlite: {e}"),
            source: Some(e),
        })?;

        schema::initialize(&pool).await?;

        Ok(Self {
            pool,
            write_latch: Mutex::new(()),
            observers: Arc::new(ObserverRegistry::new()),
        })
    }

    pub(crate) fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Create the file table backing a tree (idempotent).
    pub async fn ensure_file_table(&self, tree_uuid: &str) -> Result<()> {
        let table = file_table_name(tree_uuid);
        let _guard = self.write_latch.lock().await;
        for stmt in [
            schema::create_file_table_sql(&table),
            schema::create_file_index_sql(&table),
        ] {
            sqlx::query(&stmt)
                .execute(&self.pool)
                .await
                .map_err(|e| StoreError::Sqlx {
                    reason: format!("Failed to create file table {table}: {e}"),
                    source: Some(e),
                })?;
        }
        Ok(())
    }

    /// Drop the file table backing a tree.
    pub async fn drop_file_table(&self, tree_uuid: &str) -> Result<()> {
        let table = file_table_name(tree_uuid);
        let _guard = self.write_latch.lock().await;
        sqlx::query(&format!("DROP TABLE IF EXISTS {table}"))
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Sqlx {
                reason: format!("Failed to drop file table {table}: {e}"),
                source: Some(e),
            })?;
        Ok(())
    }

    /// Highest usn recorded for a tree, 0 when empty.
    pub async fn max_usn(&self, tree_uuid: &str) -> Result<i64> {
        let table = file_table_name(tree_uuid);
        let row: (Option<i64>,) =
            sqlx::query_as(&format!("SELECT MAX(usn) FROM {table}"))
                .fetch_one(&self.pool)
                .await
                .map_err(|e| StoreError::Sqlx {
                    reason: format!("Failed to read max usn of {table}: {e}"),
                    source: Some(e),
                })?;
        Ok(row.0.unwrap_or(0))
    }

    /// Apply file changes atomically, assigning strictly increasing usns in
    /// operation order. Notifies the tree-file URI and the Tree URI once.
    ///
    /// Returns the affected-row count; zero means the batch was empty and
    /// nothing was notified.
    pub async fn apply_file_batch(&self, tree_uuid: &str, changes: Vec<FileChange>) -> Result<u64> {
        if changes.is_empty() {
            return Ok(0);
        }
        let table = file_table_name(tree_uuid);
        let op_count = changes.len();
        let _guard = self.write_latch.lock().await;

        let mut tx = self.pool.begin().await.map_err(|e| StoreError::Sqlx {
            reason: format!("Failed to begin file batch: {e}"),
            source: Some(e),
        })?;

        let result: std::result::Result<u64, sqlx::Error> = async {
            let row: (Option<i64>,) = sqlx::query_as(&format!("SELECT MAX(usn) FROM {table}"))
                .fetch_one(&mut *tx)
                .await?;
            let mut usn = row.0.unwrap_or(0);
            let mut affected = 0u64;

            for change in changes {
                usn += 1;
                match change {
                    FileChange::Insert(entry) => {
                        let res = sqlx::query(&format!(
                            "INSERT INTO {table} (path, type, status, mtime, length, usn, sha1, \
                             modifier, win_attr, unix_attr, local_vclock, remote_vclock, alias, \
                             time_stamp) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"
                        ))
                        .bind(&entry.path)
                        .bind(entry.kind.as_i64())
                        .bind(entry.status.as_i64())
                        .bind(entry.mtime)
                        .bind(entry.length)
                        .bind(usn)
                        .bind(&entry.sha1)
                        .bind(&entry.modifier)
                        .bind(entry.win_attr)
                        .bind(entry.unix_attr)
                        .bind(entry.vclock.local)
                        .bind(entry.vclock.remote)
                        .bind(&entry.alias)
                        .bind(entry.time_stamp)
                        .execute(&mut *tx)
                        .await?;
                        affected += res.rows_affected();
                    }
                    FileChange::Update(entry) => {
                        let res = sqlx::query(&format!(
                            "UPDATE {table} SET type = ?, status = ?, mtime = ?, length = ?, \
                             usn = ?, sha1 = ?, modifier = ?, win_attr = ?, unix_attr = ?, \
                             local_vclock = ?, remote_vclock = ?, alias = ?, time_stamp = ? \
                             WHERE path = ?"
                        ))
                        .bind(entry.kind.as_i64())
                        .bind(entry.status.as_i64())
                        .bind(entry.mtime)
                        .bind(entry.length)
                        .bind(usn)
                        .bind(&entry.sha1)
                        .bind(&entry.modifier)
                        .bind(entry.win_attr)
                        .bind(entry.unix_attr)
                        .bind(entry.vclock.local)
                        .bind(entry.vclock.remote)
                        .bind(&entry.alias)
                        .bind(entry.time_stamp)
                        .bind(&entry.path)
                        .execute(&mut *tx)
                        .await?;
                        if res.rows_affected() == 0 {
                            // Unknown path: give the usn back, no gap.
                            usn -= 1;
                        }
                        affected += res.rows_affected();
                    }
                    FileChange::Tombstone {
                        path,
                        modifier,
                        time_stamp,
                    } => {
                        let res = sqlx::query(&format!(
                            "UPDATE {table} SET status = ?, usn = ?, modifier = ?, \
                             local_vclock = local_vclock + 1, time_stamp = ? \
                             WHERE path = ? AND status = ?"
                        ))
                        .bind(FileStatus::Remove.as_i64())
                        .bind(usn)
                        .bind(&modifier)
                        .bind(time_stamp)
                        .bind(&path)
                        .bind(FileStatus::Normal.as_i64())
                        .execute(&mut *tx)
                        .await?;
                        if res.rows_affected() == 0 {
                            // Already a tombstone (or unknown): no usn burnt.
                            usn -= 1;
                        }
                        affected += res.rows_affected();
                    }
                }
            }
            Ok(affected)
        }
        .await;

        match result {
            Ok(affected) => {
                tx.commit().await.map_err(|e| StoreError::Sqlx {
                    reason: format!("Failed to commit file batch: {e}"),
                    source: Some(e),
                })?;
                if affected > 0 {
                    self.observers.notify(&Uri::tree_file(tree_uuid));
                    self.observers.notify(&Uri::tree());
                }
                Ok(affected)
            }
            Err(e) => {
                let _ = tx.rollback().await;
                Err(StoreError::BatchFailed {
                    ops: op_count,
                    reason: e.to_string(),
                }
                .into())
            }
        }
    }

    /// Mirror a page of remote file stats, keeping the usns the remote
    /// assigned. Upserts by path; notifies the tree-file URI once.
    pub async fn apply_remote_file_batch(
        &self,
        tree_uuid: &str,
        entries: &[FileEntry],
    ) -> Result<u64> {
        if entries.is_empty() {
            return Ok(0);
        }
        let table = file_table_name(tree_uuid);
        let _guard = self.write_latch.lock().await;

        let mut tx = self.pool.begin().await.map_err(|e| StoreError::Sqlx {
            reason: format!("Failed to begin remote batch: {e}"),
            source: Some(e),
        })?;

        let result: std::result::Result<u64, sqlx::Error> = async {
            let mut affected = 0u64;
            for entry in entries {
                let res = sqlx::query(&format!(
                    "INSERT INTO {table} (path, type, status, mtime, length, usn, sha1, \
                     modifier, win_attr, unix_attr, local_vclock, remote_vclock, alias, \
                     time_stamp) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?) \
                     ON CONFLICT(path) DO UPDATE SET type = excluded.type, \
                     status = excluded.status, mtime = excluded.mtime, \
                     length = excluded.length, usn = excluded.usn, sha1 = excluded.sha1, \
                     modifier = excluded.modifier, win_attr = excluded.win_attr, \
                     unix_attr = excluded.unix_attr, local_vclock = excluded.local_vclock, \
                     remote_vclock = excluded.remote_vclock, alias = excluded.alias, \
                     time_stamp = excluded.time_stamp"
                ))
                .bind(&entry.path)
                .bind(entry.kind.as_i64())
                .bind(entry.status.as_i64())
                .bind(entry.mtime)
                .bind(entry.length)
                .bind(entry.usn)
                .bind(&entry.sha1)
                .bind(&entry.modifier)
                .bind(entry.win_attr)
                .bind(entry.unix_attr)
                .bind(entry.vclock.local)
                .bind(entry.vclock.remote)
                .bind(&entry.alias)
                .bind(entry.time_stamp)
                .execute(&mut *tx)
                .await?;
                affected += res.rows_affected();
            }
            Ok(affected)
        }
        .await;

        match result {
            Ok(affected) => {
                tx.commit().await.map_err(|e| StoreError::Sqlx {
                    reason: format!("Failed to commit remote batch: {e}"),
                    source: Some(e),
                })?;
                if affected > 0 {
                    self.observers.notify(&Uri::tree_file(tree_uuid));
                }
                Ok(affected)
            }
            Err(e) => {
                let _ = tx.rollback().await;
                Err(StoreError::BatchFailed {
                    ops: entries.len(),
                    reason: e.to_string(),
                }
                .into())
            }
        }
    }

    fn decode_row(row: &SqliteRow) -> Result<SqlRow> {
        let mut out = std::collections::HashMap::with_capacity(row.len());
        for (i, column) in row.columns().iter().enumerate() {
            let raw = row.try_get_raw(i).map_err(|e| StoreError::Sqlx {
                reason: format!("Failed to read column {}: {e}", column.name()),
                source: Some(e),
            })?;
            let value = if raw.is_null() {
                SqlValue::Null
            } else {
                match raw.type_info().name() {
                    "INTEGER" | "BOOLEAN" => SqlValue::Integer(row.try_get::<i64, _>(i).map_err(
                        |e| StoreError::Sqlx {
                            reason: format!("Column {} not an integer: {e}", column.name()),
                            source: Some(e),
                        },
                    )?),
                    "REAL" => SqlValue::Real(row.try_get::<f64, _>(i).map_err(|e| {
                        StoreError::Sqlx {
                            reason: format!("Column {} not a real: {e}", column.name()),
                            source: Some(e),
                        }
                    })?),
                    "BLOB" => SqlValue::Blob(row.try_get::<Vec<u8>, _>(i).map_err(|e| {
                        StoreError::Sqlx {
                            reason: format!("Column {} not a blob: {e}", column.name()),
                            source: Some(e),
                        }
                    })?),
                    _ => SqlValue::Text(row.try_get::<String, _>(i).map_err(|e| {
                        StoreError::Sqlx {
                            reason: format!("Column {} not text: {e}", column.name()),
                            source: Some(e),
                        }
                    })?),
                }
            };
            out.insert(column.name().to_string(), value);
        }
        Ok(SqlRow(out))
    }

    fn bind_values<'q>(
        mut query: sqlx::query::Query<'q, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'q>>,
        values: &'q [SqlValue],
    ) -> sqlx::query::Query<'q, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'q>> {
        for value in values {
            query = match value {
                SqlValue::Integer(v) => query.bind(*v),
                SqlValue::Real(v) => query.bind(*v),
                SqlValue::Text(v) => query.bind(v.as_str()),
                SqlValue::Blob(v) => query.bind(v.as_slice()),
                SqlValue::Null => query.bind(Option::<i64>::None),
            };
        }
        query
    }

    async fn execute_op<'c>(
        tx: &mut sqlx::Transaction<'c, sqlx::Sqlite>,
        op: &BatchOp,
    ) -> std::result::Result<u64, crate::Error> {
        let (sql, args) = Self::op_sql(op)?;
        let res = Self::bind_values(sqlx::query(&sql), &args)
            .execute(&mut **tx)
            .await
            .map_err(|e| StoreError::Sqlx {
                reason: format!("Batch op failed: {e} - SQL: {sql}"),
                source: Some(e),
            })?;
        Ok(res.rows_affected())
    }

    fn op_sql(op: &BatchOp) -> Result<(String, Vec<SqlValue>)> {
        match op {
            BatchOp::Insert {
                uri,
                values,
                on_conflict,
            } => {
                let table = uri.table()?;
                let columns: Vec<&str> = values.0.iter().map(|(c, _)| c.as_str()).collect();
                let placeholders = vec!["?"; columns.len()].join(", ");
                let sql = format!(
                    "{} INTO {table} ({}) VALUES ({placeholders})",
                    on_conflict.sql(),
                    columns.join(", "),
                );
                Ok((sql, values.0.iter().map(|(_, v)| v.clone()).collect()))
            }
            BatchOp::Update {
                uri,
                values,
                selection,
            } => {
                let table = uri.table()?;
                let assignments: Vec<String> =
                    values.0.iter().map(|(c, _)| format!("{c} = ?")).collect();
                let mut sql = format!("UPDATE {table} SET {}", assignments.join(", "));
                let mut args: Vec<SqlValue> =
                    values.0.iter().map(|(_, v)| v.clone()).collect();
                if let Some(sel) = selection {
                    sql.push_str(" WHERE ");
                    sql.push_str(&sel.clause);
                    args.extend(sel.args.iter().cloned());
                }
                Ok((sql, args))
            }
            BatchOp::Delete { uri, selection } => {
                let table = uri.table()?;
                let mut sql = format!("DELETE FROM {table}");
                let mut args = Vec::new();
                if let Some(sel) = selection {
                    sql.push_str(" WHERE ");
                    sql.push_str(&sel.clause);
                    args.extend(sel.args.iter().cloned());
                }
                Ok((sql, args))
            }
        }
    }
}

#[async_trait]
impl ContentProvider for MetaStore {
    async fn query(
        &self,
        uri: &Uri,
        projection: &[&str],
        selection: Option<&Selection>,
        order_by: Option<&str>,
    ) -> Result<Vec<SqlRow>> {
        let table = uri.table()?;
        let columns = if projection.is_empty() {
            "*".to_string()
        } else {
            projection.join(", ")
        };
        let mut sql = format!("SELECT {columns} FROM {table}");
        let mut args: Vec<SqlValue> = Vec::new();
        if let Some(sel) = selection {
            sql.push_str(" WHERE ");
            sql.push_str(&sel.clause);
            args.extend(sel.args.iter().cloned());
        }
        if let Some(order) = order_by {
            sql.push_str(" ORDER BY ");
            sql.push_str(order);
        }

        let rows = Self::bind_values(sqlx::query(&sql), &args)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| StoreError::Sqlx {
                reason: format!("Query failed: {e} - SQL: {sql}"),
                source: Some(e),
            })?;
        rows.iter().map(Self::decode_row).collect()
    }

    async fn insert(
        &self,
        uri: &Uri,
        values: ContentValues,
        on_conflict: OnConflict,
    ) -> Result<i64> {
        let op = BatchOp::Insert {
            uri: uri.clone(),
            values,
            on_conflict,
        };
        let (sql, args) = Self::op_sql(&op)?;
        let _guard = self.write_latch.lock().await;
        let res = Self::bind_values(sqlx::query(&sql), &args)
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Sqlx {
                reason: format!("Insert failed: {e} - SQL: {sql}"),
                source: Some(e),
            })?;
        if res.rows_affected() > 0 {
            self.observers.notify(uri);
        }
        Ok(res.last_insert_rowid())
    }

    async fn update(
        &self,
        uri: &Uri,
        values: ContentValues,
        selection: Option<&Selection>,
    ) -> Result<u64> {
        let op = BatchOp::Update {
            uri: uri.clone(),
            values,
            selection: selection.cloned(),
        };
        let (sql, args) = Self::op_sql(&op)?;
        let _guard = self.write_latch.lock().await;
        let res = Self::bind_values(sqlx::query(&sql), &args)
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Sqlx {
                reason: format!("Update failed: {e} - SQL: {sql}"),
                source: Some(e),
            })?;
        if res.rows_affected() > 0 {
            self.observers.notify(uri);
        }
        Ok(res.rows_affected())
    }

    async fn delete(&self, uri: &Uri, selection: Option<&Selection>) -> Result<u64> {
        let op = BatchOp::Delete {
            uri: uri.clone(),
            selection: selection.cloned(),
        };
        let (sql, args) = Self::op_sql(&op)?;
        let _guard = self.write_latch.lock().await;
        let res = Self::bind_values(sqlx::query(&sql), &args)
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Sqlx {
                reason: format!("Delete failed: {e} - SQL: {sql}"),
                source: Some(e),
            })?;
        if res.rows_affected() > 0 {
            self.observers.notify(uri);
        }
        Ok(res.rows_affected())
    }

    async fn apply_batch(&self, ops: Vec<BatchOp>) -> Result<u64> {
        if ops.is_empty() {
            return Ok(0);
        }
        let op_count = ops.len();
        let _guard = self.write_latch.lock().await;
        let mut tx = self.pool.begin().await.map_err(|e| StoreError::Sqlx {
            reason: format!("Failed to begin batch: {e}"),
            source: Some(e),
        })?;

        let mut affected = 0u64;
        let mut touched: Vec<Uri> = Vec::new();
        let mut seen: HashSet<Uri> = HashSet::new();

        for op in &ops {
            match Self::execute_op(&mut tx, op).await {
                Ok(n) => {
                    if n > 0 && seen.insert(op.uri().clone()) {
                        touched.push(op.uri().clone());
                    }
                    affected += n;
                }
                Err(e) => {
                    let _ = tx.rollback().await;
                    return Err(StoreError::BatchFailed {
                        ops: op_count,
                        reason: e.to_string(),
                    }
                    .into());
                }
            }
        }

        tx.commit().await.map_err(|e| StoreError::Sqlx {
            reason: format!("Failed to commit batch: {e}"),
            source: Some(e),
        })?;

        // Exactly once per distinct URI, in first-touch order.
        for uri in &touched {
            self.observers.notify(uri);
        }
        Ok(affected)
    }

    fn register_observer(&self, prefix: Uri, recursive: bool) -> ObserverHandle {
        self.observers.register(prefix, recursive)
    }
}
