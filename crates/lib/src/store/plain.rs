//! Plain (unencrypted) side store.
//!
//! Holds exactly the state that must be readable before the main store
//! can be opened (the passphrase seed), plus sync history and the
//! persisted static peer set, neither of which carries account data.

use std::path::Path;

use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};

use super::errors::StoreError;
use crate::Result;

const CREATE_TABLES: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS misc (
        key TEXT PRIMARY KEY NOT NULL,
        value TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS history (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        modifier TEXT NOT NULL,
        tree_id INTEGER NOT NULL,
        srcpath TEXT NOT NULL,
        dstpath TEXT NOT NULL DEFAULT '',
        time_stamp INTEGER NOT NULL,
        code INTEGER NOT NULL,
        error INTEGER NOT NULL DEFAULT 0
    )",
    "CREATE TABLE IF NOT EXISTS static_peer (
        ip TEXT NOT NULL,
        port INTEGER NOT NULL,
        PRIMARY KEY (ip, port)
    )",
];

/// Key of the passphrase seed in the misc table.
pub const MISC_KEY_PASSPHRASE_SEED: &str = "passphrase_seed";

/// What a history row records happened to a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HistoryCode {
    Add = 0,
    Modify = 1,
    Delete = 2,
    Rename = 3,
    Conflict = 4,
}

impl HistoryCode {
    pub fn as_i64(self) -> i64 {
        self as i64
    }

    pub fn from_i64(v: i64) -> Option<Self> {
        match v {
            0 => Some(Self::Add),
            1 => Some(Self::Modify),
            2 => Some(Self::Delete),
            3 => Some(Self::Rename),
            4 => Some(Self::Conflict),
            _ => None,
        }
    }
}

/// One applied sync operation.
#[derive(Debug, Clone, PartialEq)]
pub struct HistoryEntry {
    pub id: i64,
    /// UUID of the device that produced the change.
    pub modifier: String,
    pub tree_id: i64,
    pub srcpath: String,
    pub dstpath: String,
    pub time_stamp: i64,
    pub code: i64,
    pub error: i64,
}

/// An administrator-configured peer endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StaticPeer {
    pub ip: String,
    pub port: u16,
}

/// The plain side database.
pub struct PlainStore {
    pool: SqlitePool,
}

impl PlainStore {
    /// Open (or create) the plain store at `path`.
    pub async fn open(path: &Path) -> Result<Self> {
        let url = format!("sqlite:{}?mode=rwc", path.display());
        Self::connect(&url).await.map_err(|e| {
            StoreError::OpenFailed {
                path: path.display().to_string(),
                reason: e.to_string(),
            }
            .into()
        })
    }

    /// In-memory plain store for tests.
    pub async fn open_in_memory() -> Result<Self> {
        let unique = uuid::Uuid::new_v4();
        let url = format!("sqlite:file:plain_{unique}?mode=memory&cache=shared");
        Self::connect(&url).await
    }

    async fn connect(url: &str) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(2)
            .connect(url)
            .await
            .map_err(|e| StoreError::Sqlx {
                reason: format!("Failed to connect plain store: {e}"),
                source: Some(e),
            })?;
        for stmt in CREATE_TABLES {
            sqlx::query(stmt)
                .execute(&pool)
                .await
                .map_err(|e| StoreError::Sqlx {
                    reason: format!("Plain schema creation failed: {e}"),
                    source: Some(e),
                })?;
        }
        Ok(Self { pool })
    }

    pub async fn misc_get(&self, key: &str) -> Result<Option<String>> {
        let row: Option<(String,)> = sqlx::query_as("SELECT value FROM misc WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StoreError::Sqlx {
                reason: format!("misc_get failed: {e}"),
                source: Some(e),
            })?;
        Ok(row.map(|(v,)| v))
    }

    pub async fn misc_set(&self, key: &str, value: &str) -> Result<()> {
        sqlx::query("INSERT OR REPLACE INTO misc (key, value) VALUES (?, ?)")
            .bind(key)
            .bind(value)
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Sqlx {
                reason: format!("misc_set failed: {e}"),
                source: Some(e),
            })?;
        Ok(())
    }

    /// Append one history row.
    pub async fn append_history(&self, entry: &HistoryEntry) -> Result<i64> {
        let res = sqlx::query(
            "INSERT INTO history (modifier, tree_id, srcpath, dstpath, time_stamp, code, error) \
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&entry.modifier)
        .bind(entry.tree_id)
        .bind(&entry.srcpath)
        .bind(&entry.dstpath)
        .bind(entry.time_stamp)
        .bind(entry.code)
        .bind(entry.error)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Sqlx {
            reason: format!("append_history failed: {e}"),
            source: Some(e),
        })?;
        Ok(res.last_insert_rowid())
    }

    /// Read history newest-first.
    pub async fn query_history(&self, offset: i64, limit: i64) -> Result<Vec<HistoryEntry>> {
        let rows: Vec<(i64, String, i64, String, String, i64, i64, i64)> = sqlx::query_as(
            "SELECT id, modifier, tree_id, srcpath, dstpath, time_stamp, code, error \
             FROM history ORDER BY id DESC LIMIT ? OFFSET ?",
        )
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::Sqlx {
            reason: format!("query_history failed: {e}"),
            source: Some(e),
        })?;
        Ok(rows
            .into_iter()
            .map(
                |(id, modifier, tree_id, srcpath, dstpath, time_stamp, code, error)| {
                    HistoryEntry {
                        id,
                        modifier,
                        tree_id,
                        srcpath,
                        dstpath,
                        time_stamp,
                        code,
                        error,
                    }
                },
            )
            .collect())
    }

    /// Replace the persisted static peer set.
    pub async fn save_static_peers(&self, peers: &[StaticPeer]) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(|e| StoreError::Sqlx {
            reason: format!("save_static_peers begin failed: {e}"),
            source: Some(e),
        })?;
        let result: std::result::Result<(), sqlx::Error> = async {
            sqlx::query("DELETE FROM static_peer")
                .execute(&mut *tx)
                .await?;
            for peer in peers {
                sqlx::query("INSERT OR IGNORE INTO static_peer (ip, port) VALUES (?, ?)")
                    .bind(&peer.ip)
                    .bind(peer.port as i64)
                    .execute(&mut *tx)
                    .await?;
            }
            Ok(())
        }
        .await;
        match result {
            Ok(()) => tx.commit().await.map_err(|e| {
                StoreError::Sqlx {
                    reason: format!("save_static_peers commit failed: {e}"),
                    source: Some(e),
                }
                .into()
            }),
            Err(e) => {
                let _ = tx.rollback().await;
                Err(StoreError::Sqlx {
                    reason: format!("save_static_peers failed: {e}"),
                    source: Some(e),
                }
                .into())
            }
        }
    }

    /// Load the persisted static peer set.
    pub async fn load_static_peers(&self) -> Result<Vec<StaticPeer>> {
        let rows: Vec<(String, i64)> = sqlx::query_as("SELECT ip, port FROM static_peer")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| StoreError::Sqlx {
                reason: format!("load_static_peers failed: {e}"),
                source: Some(e),
            })?;
        Ok(rows
            .into_iter()
            .map(|(ip, port)| StaticPeer {
                ip,
                port: port as u16,
            })
            .collect())
    }
}
