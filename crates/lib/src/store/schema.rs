//! Schema definition and migrations for the metadata store.
//!
//! The schema is created on open. Migrations are code-based: each step is a
//! function run inside a transaction; a failed step leaves the version
//! untouched and the store refuses to open.
//!
//! ## Adding a new migration
//!
//! 1. Increment `SCHEMA_VERSION`
//! 2. Add a `migrate_vN_to_vM` async function
//! 3. Add it to the match in `run_migration`

use sqlx::SqlitePool;

use super::errors::StoreError;
use crate::Result;

/// Current schema version.
pub const SCHEMA_VERSION: i64 = 1;

/// Statements creating the fixed tables.
pub const CREATE_TABLES: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS schema_version (
        version INTEGER PRIMARY KEY
    )",
    // Devices of the account plus shared-sync strangers.
    // id 0 is self, id -1 the "creator unset" placeholder.
    "CREATE TABLE IF NOT EXISTS device (
        id INTEGER PRIMARY KEY,
        uuid TEXT NOT NULL UNIQUE,
        name TEXT NOT NULL,
        route_port INTEGER NOT NULL DEFAULT 0,
        data_port INTEGER NOT NULL DEFAULT 0,
        status INTEGER NOT NULL DEFAULT 1,
        platform TEXT NOT NULL DEFAULT '',
        is_mine INTEGER NOT NULL DEFAULT 0,
        backup_dst_root TEXT NOT NULL DEFAULT '',
        version INTEGER NOT NULL DEFAULT 0
    )",
    // Known endpoints per device. earliest_no_response_time NULL means
    // the endpoint is healthy.
    "CREATE TABLE IF NOT EXISTS device_ip (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        device_id INTEGER NOT NULL REFERENCES device(id) ON DELETE CASCADE,
        ip TEXT NOT NULL,
        is_ipv6 INTEGER NOT NULL DEFAULT 0,
        earliest_no_response_time INTEGER,
        UNIQUE (device_id, ip)
    )",
    "CREATE TABLE IF NOT EXISTS sync (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        uuid TEXT NOT NULL UNIQUE,
        name TEXT NOT NULL,
        last_sync INTEGER NOT NULL DEFAULT 0,
        type INTEGER NOT NULL DEFAULT 0,
        status INTEGER NOT NULL DEFAULT 0,
        device_id INTEGER NOT NULL DEFAULT -1,
        perm INTEGER NOT NULL DEFAULT 2,
        restore_share_perm INTEGER NOT NULL DEFAULT 2
    )",
    "CREATE TABLE IF NOT EXISTS tree (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        uuid TEXT NOT NULL UNIQUE,
        root TEXT NOT NULL DEFAULT '',
        device_id INTEGER NOT NULL,
        sync_id INTEGER NOT NULL REFERENCES sync(id),
        status INTEGER NOT NULL DEFAULT 0,
        last_find INTEGER NOT NULL DEFAULT 0,
        backup_type INTEGER NOT NULL DEFAULT 0,
        is_enabled INTEGER NOT NULL DEFAULT 1,
        root_status INTEGER NOT NULL DEFAULT 0
    )",
    // Selective-sync entries; paths in database-fixed form.
    "CREATE TABLE IF NOT EXISTS sync_list (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        tree_id INTEGER NOT NULL REFERENCES tree(id) ON DELETE CASCADE,
        path TEXT NOT NULL,
        UNIQUE (tree_id, path)
    )",
    "CREATE TABLE IF NOT EXISTS sync_mode (
        local_tree_id INTEGER NOT NULL,
        remote_tree_id INTEGER NOT NULL,
        sync_mode INTEGER NOT NULL DEFAULT 0,
        sync_time_in_s INTEGER NOT NULL DEFAULT 0,
        PRIMARY KEY (local_tree_id, remote_tree_id)
    )",
    // Per-peer permission granted by the creator of a shared sync.
    "CREATE TABLE IF NOT EXISTS share_sync (
        device_id INTEGER NOT NULL,
        sync_id INTEGER NOT NULL,
        sync_perm INTEGER NOT NULL DEFAULT 2,
        PRIMARY KEY (device_id, sync_id)
    )",
    // Cache of peers discovered via broadcast/DHT/tracker.
    "CREATE TABLE IF NOT EXISTS dht_peer (
        info_hash TEXT NOT NULL,
        peer_host TEXT NOT NULL,
        peer_port INTEGER NOT NULL,
        peer_is_ipv6 INTEGER NOT NULL DEFAULT 0,
        is_lan INTEGER NOT NULL DEFAULT 0,
        store_time INTEGER NOT NULL DEFAULT 0,
        PRIMARY KEY (info_hash, peer_host, peer_port)
    )",
    "CREATE TABLE IF NOT EXISTS config (
        key TEXT PRIMARY KEY NOT NULL,
        value TEXT NOT NULL
    )",
];

/// Statements creating indexes.
pub const CREATE_INDEXES: &[&str] = &[
    "CREATE INDEX IF NOT EXISTS idx_device_ip_device ON device_ip(device_id)",
    "CREATE INDEX IF NOT EXISTS idx_tree_sync ON tree(sync_id)",
    "CREATE INDEX IF NOT EXISTS idx_tree_device ON tree(device_id)",
    "CREATE INDEX IF NOT EXISTS idx_sync_list_tree ON sync_list(tree_id)",
    "CREATE INDEX IF NOT EXISTS idx_dht_peer_time ON dht_peer(store_time)",
];

/// Columns of a per-tree file table, shared by create statements and
/// row (de)serialization.
pub const FILE_COLUMNS: &str = "id, path, type, status, mtime, length, usn, sha1, \
     modifier, win_attr, unix_attr, local_vclock, remote_vclock, alias, time_stamp";

/// Create the file table for one tree.
pub fn create_file_table_sql(table: &str) -> String {
    format!(
        "CREATE TABLE IF NOT EXISTS {table} (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            path TEXT NOT NULL UNIQUE,
            type INTEGER NOT NULL DEFAULT 0,
            status INTEGER NOT NULL DEFAULT 0,
            mtime INTEGER NOT NULL DEFAULT 0,
            length INTEGER NOT NULL DEFAULT 0,
            usn INTEGER NOT NULL DEFAULT 0,
            sha1 TEXT NOT NULL DEFAULT '',
            modifier TEXT NOT NULL DEFAULT '',
            win_attr INTEGER NOT NULL DEFAULT 0,
            unix_attr INTEGER NOT NULL DEFAULT 0,
            local_vclock INTEGER NOT NULL DEFAULT 0,
            remote_vclock INTEGER NOT NULL DEFAULT 0,
            alias TEXT NOT NULL DEFAULT '',
            time_stamp INTEGER NOT NULL DEFAULT 0
        )"
    )
}

/// Index speeding up the usn-cursor Find queries.
pub fn create_file_index_sql(table: &str) -> String {
    format!("CREATE INDEX IF NOT EXISTS idx_{table}_usn ON {table}(usn)")
}

/// Initialize the schema, running migrations when the stored version lags.
pub async fn initialize(pool: &SqlitePool) -> Result<()> {
    for statement in CREATE_TABLES {
        sqlx::query(statement)
            .execute(pool)
            .await
            .map_err(|e| StoreError::Sqlx {
                reason: format!("Schema creation failed: {e} - SQL: {statement}"),
                source: Some(e),
            })?;
    }

    let row: Option<(i64,)> = sqlx::query_as("SELECT version FROM schema_version")
        .fetch_optional(pool)
        .await
        .map_err(|e| StoreError::Sqlx {
            reason: format!("Failed to read schema version: {e}"),
            source: Some(e),
        })?;

    match row {
        None => {
            sqlx::query("INSERT INTO schema_version (version) VALUES (?)")
                .bind(SCHEMA_VERSION)
                .execute(pool)
                .await
                .map_err(|e| StoreError::Sqlx {
                    reason: format!("Failed to initialize schema version: {e}"),
                    source: Some(e),
                })?;
        }
        Some((current,)) if current < SCHEMA_VERSION => {
            migrate(pool, current, SCHEMA_VERSION).await?;
        }
        Some(_) => {}
    }

    for statement in CREATE_INDEXES {
        sqlx::query(statement)
            .execute(pool)
            .await
            .map_err(|e| StoreError::Sqlx {
                reason: format!("Index creation failed: {e} - SQL: {statement}"),
                source: Some(e),
            })?;
    }

    Ok(())
}

/// Run migrations sequentially, bumping the stored version after each step.
async fn migrate(pool: &SqlitePool, from: i64, to: i64) -> Result<()> {
    tracing::info!(from, to, "Starting store schema migration");

    let mut current = from;
    while current < to {
        let next = current + 1;
        run_migration(pool, current, next).await?;

        sqlx::query("UPDATE schema_version SET version = ?")
            .bind(next)
            .execute(pool)
            .await
            .map_err(|e| StoreError::MigrationFailed {
                from: current,
                to: next,
                reason: format!("Failed to record version: {e}"),
            })?;

        tracing::info!(version = next, "Migration completed");
        current = next;
    }

    Ok(())
}

/// Execute a single migration step. Add new migrations as match arms.
async fn run_migration(pool: &SqlitePool, from: i64, to: i64) -> Result<()> {
    let _ = pool;

    // No migrations exist yet; any attempt means SCHEMA_VERSION was bumped
    // without adding one.
    Err(StoreError::MigrationFailed {
        from,
        to,
        reason: "unknown migration path".to_string(),
    }
    .into())
}
