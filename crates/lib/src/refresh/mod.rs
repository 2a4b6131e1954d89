//! Refresh worker pool: keeps File rows current with the filesystem.
//!
//! A task walks one tree root (or a subtree), diffs what it sees against
//! the stored rows, and commits the differences as one batch: inserts for
//! new entries, updates (with a fresh usn and a bumped local vclock) for
//! changed ones, tombstones for in-scope rows the walk no longer found.
//! Running the same refresh twice with no filesystem change commits
//! nothing.

mod errors;

pub use errors::RefreshError;

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex};

use tokio::sync::{broadcast, mpsc};
use tracing::{Instrument, debug, info, info_span, warn};
use walkdir::WalkDir;

use crate::clock::Clock;
use crate::config::Config;
use crate::events::{EngineEvent, EventNotifier, StatusUpdate};
use crate::store::{
    FileChange, FileEntry, FileKind, FileStatus, MetaStore, RootStatus, SyncListTrie, Tree,
    TreeStatus, fix_path, is_self_or_descendant,
};
use crate::vclock::VClock;
use crate::Result;

/// Name of the per-tree directory deleted files are moved into.
pub const TRASH_DIR: &str = ".trash";

/// One refresh request.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RefreshTask {
    pub tree_id: i64,
    /// Database-fixed subtree path; None walks the whole root.
    pub subtree: Option<String>,
}

struct RefreshDeps {
    store: Arc<MetaStore>,
    config: Arc<Config>,
    events: Arc<EventNotifier>,
    clock: Arc<dyn Clock>,
}

/// Handle to the refresh pool.
pub struct RefreshPool {
    tx: mpsc::Sender<RefreshTask>,
    deps: Arc<RefreshDeps>,
    /// Trees with a walk queued or running; duplicates coalesce onto it.
    inflight: Arc<StdMutex<HashSet<i64>>>,
}

impl RefreshPool {
    /// Spawn the worker tasks.
    pub fn start(
        store: Arc<MetaStore>,
        config: Arc<Config>,
        events: Arc<EventNotifier>,
        clock: Arc<dyn Clock>,
        shutdown: broadcast::Sender<()>,
    ) -> Arc<Self> {
        let deps = Arc::new(RefreshDeps {
            store,
            config,
            events,
            clock,
        });
        let (tx, rx) = mpsc::channel::<RefreshTask>(64);
        let inflight = Arc::new(StdMutex::new(HashSet::new()));
        let rx = Arc::new(tokio::sync::Mutex::new(rx));

        for worker in 0..deps.config.refresh_workers() {
            let rx = Arc::clone(&rx);
            let deps = Arc::clone(&deps);
            let inflight = Arc::clone(&inflight);
            let mut shutdown_rx = shutdown.subscribe();
            tokio::spawn(
                async move {
                    loop {
                        let task = tokio::select! {
                            task = async { rx.lock().await.recv().await } => task,
                            _ = shutdown_rx.recv() => break,
                        };
                        let Some(task) = task else { break };
                        let tree_id = task.tree_id;
                        let worker = RefreshWorker { deps: &deps };
                        let result = worker.run(task).await;
                        inflight.lock().unwrap().remove(&tree_id);
                        if let Err(e) = result {
                            if e.is_fatal() {
                                deps.events.update(StatusUpdate::Event(
                                    EngineEvent::WorkerTerminated { pool: "refresh" },
                                ));
                                warn!("Refresh worker terminating on fatal error: {e}");
                                break;
                            }
                            warn!(tree = tree_id, "Refresh failed: {e}");
                        }
                    }
                    debug!("Refresh worker exiting");
                }
                .instrument(info_span!("refresh_worker", worker)),
            );
        }

        Arc::new(Self { tx, deps, inflight })
    }

    /// Enqueue a refresh. Concurrent requests for the same tree coalesce:
    /// returns false when a walk is already queued or running.
    pub async fn enqueue(&self, task: RefreshTask) -> Result<bool> {
        let tree_id = task.tree_id;
        {
            let mut inflight = self.inflight.lock().unwrap();
            if !inflight.insert(tree_id) {
                return Ok(false);
            }
        }
        if self.tx.send(task).await.is_err() {
            self.inflight.lock().unwrap().remove(&tree_id);
            return Err(RefreshError::PoolClosed.into());
        }
        Ok(true)
    }

    /// Run a refresh inline, bypassing the queue.
    ///
    /// Takes the same coalescing slot as queued walks; a concurrent walk of
    /// the tree makes this a no-op returning zero. Returns the committed
    /// row count.
    pub async fn run_once(&self, task: RefreshTask) -> Result<u64> {
        {
            let mut inflight = self.inflight.lock().unwrap();
            if !inflight.insert(task.tree_id) {
                return Ok(0);
            }
        }
        let tree_id = task.tree_id;
        let worker = RefreshWorker { deps: &self.deps };
        let result = worker.run(task).await;
        self.inflight.lock().unwrap().remove(&tree_id);
        result
    }
}

struct RefreshWorker<'a> {
    deps: &'a Arc<RefreshDeps>,
}

/// What the walk reports per visited entry.
#[derive(Debug)]
struct WalkedEntry {
    fixed_path: String,
    abs_path: PathBuf,
    kind: FileKind,
    mtime: i64,
    length: i64,
    unix_attr: i64,
}

impl RefreshWorker<'_> {
    async fn run(&self, task: RefreshTask) -> Result<u64> {
        let store = &self.deps.store;
        let Some(tree) = store.tree_by_id(task.tree_id).await? else {
            return Err(RefreshError::TreeNotRefreshable {
                tree_id: task.tree_id,
            }
            .into());
        };
        if !tree.is_enabled || tree.status != TreeStatus::Normal {
            return Err(RefreshError::TreeNotRefreshable {
                tree_id: task.tree_id,
            }
            .into());
        }

        let root = PathBuf::from(&tree.root);
        if !root.is_dir() {
            // Keep the rows; the root checker re-issues a refresh when the
            // directory reappears.
            if tree.root_status != RootStatus::Removed {
                store
                    .set_tree_root_status(tree.id, RootStatus::Removed)
                    .await?;
                info!(tree = tree.id, root = %tree.root, "Tree root missing");
            }
            return Ok(0);
        }
        if tree.root_status == RootStatus::Removed {
            store
                .set_tree_root_status(tree.id, RootStatus::Normal)
                .await?;
            info!(tree = tree.id, "Tree root back");
        }

        self.deps.events.update(StatusUpdate::Indexing {
            tree_id: tree.id,
            active: true,
        });
        let result = self.index(&tree, &root, task.subtree.as_deref()).await;
        self.deps.events.update(StatusUpdate::Indexing {
            tree_id: tree.id,
            active: false,
        });

        if let Err(ref e) = result {
            self.deps
                .events
                .update(StatusUpdate::Event(EngineEvent::TreeIndexError {
                    tree_id: tree.id,
                    message: e.to_string(),
                }));
        }
        result
    }

    async fn index(&self, tree: &Tree, root: &Path, subtree: Option<&str>) -> Result<u64> {
        let store = &self.deps.store;
        let scope = subtree.map(fix_path).unwrap_or_else(|| "/".to_string());
        let trie = SyncListTrie::new(&store.sync_list_paths(tree.id).await?);
        store.ensure_file_table(&tree.uuid).await?;

        // Stored rows inside the scope, by path.
        let stored: HashMap<String, FileEntry> = store
            .files_all(&tree.uuid)
            .await?
            .into_iter()
            .filter(|f| is_self_or_descendant(&f.path, &scope))
            .map(|f| (f.path.clone(), f))
            .collect();

        // Walk on the blocking pool.
        let walk_root = if scope == "/" {
            root.to_path_buf()
        } else {
            root.join(scope.trim_start_matches('/'))
        };
        let root_owned = root.to_path_buf();
        let walked = tokio::task::spawn_blocking(move || walk_tree(&root_owned, &walk_root))
            .await
            .map_err(|e| RefreshError::WalkFailed {
                root: root.display().to_string(),
                reason: e.to_string(),
            })??;

        let modifier = self.deps.config.device_uuid();
        let now = self.deps.clock.now_secs();
        let mut visited: HashSet<String> = HashSet::with_capacity(walked.len());
        let mut changes: Vec<FileChange> = Vec::new();

        for entry in walked {
            if !trie.need_sync(&entry.fixed_path) {
                continue;
            }
            visited.insert(entry.fixed_path.clone());

            match stored.get(&entry.fixed_path) {
                None => {
                    let sha1 = self.digest_if_regular(&entry).await?;
                    changes.push(FileChange::Insert(FileEntry {
                        id: 0,
                        path: entry.fixed_path,
                        kind: entry.kind,
                        status: FileStatus::Normal,
                        mtime: entry.mtime,
                        length: entry.length,
                        usn: 0,
                        sha1,
                        modifier: modifier.clone(),
                        win_attr: 0,
                        unix_attr: entry.unix_attr,
                        vclock: VClock::new(1, 0),
                        alias: String::new(),
                        time_stamp: now,
                    }));
                }
                Some(row) if row.status == FileStatus::Remove => {
                    // The path came back after a deletion.
                    let sha1 = self.digest_if_regular(&entry).await?;
                    let mut vclock = row.vclock;
                    vclock.bump_local();
                    changes.push(FileChange::Update(reindexed(
                        row, &entry, sha1, vclock, &modifier, now,
                    )));
                }
                Some(row) => {
                    if row.mtime == entry.mtime
                        && row.length == entry.length
                        && row.kind == entry.kind
                    {
                        continue;
                    }
                    let sha1 = self.digest_if_regular(&entry).await?;
                    if row.kind == entry.kind
                        && entry.kind == FileKind::Regular
                        && sha1 == row.sha1
                    {
                        // Touched but unchanged content; nothing to record.
                        continue;
                    }
                    let mut vclock = row.vclock;
                    vclock.bump_local();
                    changes.push(FileChange::Update(reindexed(
                        row, &entry, sha1, vclock, &modifier, now,
                    )));
                }
            }
        }

        // In-scope rows the walk no longer found become tombstones.
        for (path, row) in &stored {
            if row.status == FileStatus::Normal && !visited.contains(path) {
                changes.push(FileChange::Tombstone {
                    path: path.clone(),
                    modifier: modifier.clone(),
                    time_stamp: now,
                });
            }
        }

        let affected = store.apply_file_batch(&tree.uuid, changes).await?;
        if affected > 0 {
            info!(tree = tree.id, affected, "Refresh committed changes");
        } else {
            debug!(tree = tree.id, "Refresh found nothing to do");
        }
        Ok(affected)
    }

    async fn digest_if_regular(&self, entry: &WalkedEntry) -> Result<String> {
        if entry.kind != FileKind::Regular {
            return Ok(String::new());
        }
        let path = entry.abs_path.clone();
        let digest = tokio::task::spawn_blocking(move || -> std::io::Result<String> {
            use sha1::{Digest, Sha1};
            let mut file = std::fs::File::open(&path)?;
            let mut hasher = Sha1::new();
            std::io::copy(&mut file, &mut hasher)?;
            Ok(hex::encode(hasher.finalize()))
        })
        .await
        .map_err(|e| RefreshError::WalkFailed {
            root: entry.abs_path.display().to_string(),
            reason: e.to_string(),
        })?;
        Ok(digest?)
    }
}

fn reindexed(
    row: &FileEntry,
    entry: &WalkedEntry,
    sha1: String,
    vclock: VClock,
    modifier: &str,
    now: i64,
) -> FileEntry {
    FileEntry {
        id: row.id,
        path: row.path.clone(),
        kind: entry.kind,
        status: FileStatus::Normal,
        mtime: entry.mtime,
        length: entry.length,
        usn: 0,
        sha1,
        modifier: modifier.to_string(),
        win_attr: row.win_attr,
        unix_attr: entry.unix_attr,
        vclock,
        alias: row.alias.clone(),
        time_stamp: now,
    }
}

/// Whether an entry name is skipped by convention.
fn is_ignored(name: &str) -> bool {
    name.starts_with('.') || name.ends_with(".part")
}

/// Walk `walk_root`, reporting entries relative to `root`.
///
/// Single-entry I/O errors are logged and skipped; an error on the walk
/// root itself is fatal.
fn walk_tree(root: &Path, walk_root: &Path) -> Result<Vec<WalkedEntry>> {
    let mut out = Vec::new();
    for entry in WalkDir::new(walk_root).min_depth(1).into_iter().filter_entry(|e| {
        e.file_name()
            .to_str()
            .map(|name| !is_ignored(name))
            .unwrap_or(false)
    }) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                if e.path() == Some(walk_root) {
                    return Err(RefreshError::WalkFailed {
                        root: walk_root.display().to_string(),
                        reason: e.to_string(),
                    }
                    .into());
                }
                debug!("Skipping unreadable entry: {e}");
                continue;
            }
        };
        let meta = match entry.metadata() {
            Ok(meta) => meta,
            Err(e) => {
                debug!(path = %entry.path().display(), "Skipping unstattable entry: {e}");
                continue;
            }
        };
        let rel = match entry.path().strip_prefix(root) {
            Ok(rel) => rel,
            Err(_) => continue,
        };
        let fixed_path = fix_path(&rel.to_string_lossy());
        let kind = if meta.is_dir() {
            FileKind::Directory
        } else if meta.is_file() {
            FileKind::Regular
        } else {
            // Symlinks and specials are not mirrored.
            continue;
        };
        let mtime = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);
        let unix_attr = unix_mode(&meta);
        out.push(WalkedEntry {
            fixed_path,
            abs_path: entry.path().to_path_buf(),
            kind,
            mtime,
            length: if meta.is_file() { meta.len() as i64 } else { 0 },
            unix_attr,
        });
    }
    Ok(out)
}

#[cfg(unix)]
fn unix_mode(meta: &std::fs::Metadata) -> i64 {
    use std::os::unix::fs::MetadataExt;
    meta.mode() as i64
}

#[cfg(not(unix))]
fn unix_mode(_meta: &std::fs::Metadata) -> i64 {
    0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ignore_rules() {
        assert!(is_ignored(".git"));
        assert!(is_ignored(".trash"));
        assert!(is_ignored("download.bin.part"));
        assert!(!is_ignored("file.txt"));
        assert!(!is_ignored("dir"));
    }
}
