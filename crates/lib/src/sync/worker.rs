//! The per-pair synchronization state machine.
//!
//! FETCH_REMOTE_META pulls usn-ordered pages from the first endpoint that
//! answers and pins it; STORE_REMOTE_META mirrors them; RECONCILE compares
//! version vectors; APPLY_LOCAL performs the pure-metadata part; transfers
//! stream the rest, and completion lands as one batch.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{Instrument, debug, info, info_span, warn};

use super::errors::SyncError;
use super::reconcile::{
    PairRole, ReconcileAction, ReconcileContext, conflict_name, reconcile_path,
};
use super::{AbortSet, SyncDeps, SyncRequest};
use crate::constants::FIND_LIMIT;
use crate::events::{EngineEvent, StatusUpdate};
use crate::proto::{FindRequest, RequestBody, ResponseBody, TransferFileHead};
use crate::refresh::TRASH_DIR;
use crate::rpc::{self, RpcError};
use crate::store::{
    BackupType, Device, FileChange, FileEntry, FileStatus, HistoryCode, HistoryEntry,
    Sync as SyncRow, SyncListTrie, SyncPerm, Tree,
};
use crate::transfer::TreePair;
use crate::vclock::VClock;
use crate::Result;

pub(super) struct SyncWorker<'a> {
    deps: &'a Arc<SyncDeps>,
    aborts: &'a Arc<AbortSet>,
}

impl<'a> SyncWorker<'a> {
    pub(super) fn new(deps: &'a Arc<SyncDeps>, aborts: &'a Arc<AbortSet>) -> Self {
        Self { deps, aborts }
    }

    pub(super) async fn run(&self, request: SyncRequest) -> Result<()> {
        let pair = (request.local_tree_id, request.remote_tree_id);
        let store = &self.deps.store;

        let local_tree = store
            .tree_by_id(request.local_tree_id)
            .await?
            .ok_or(SyncError::TreeNotFound {
                tree_id: request.local_tree_id,
            })?;
        let remote_tree = store
            .tree_by_id(request.remote_tree_id)
            .await?
            .ok_or(SyncError::TreeNotFound {
                tree_id: request.remote_tree_id,
            })?;
        let sync = store
            .sync_by_id(local_tree.sync_id)
            .await?
            .ok_or(SyncError::SyncNotFound {
                sync_id: local_tree.sync_id,
            })?;

        // DISCONNECT and TOKEN_DIFF abort benignly, as do disabled or
        // already-aborted pairs. The pair still reports itself finished.
        let gated = matches!(sync.perm, SyncPerm::Disconnect | SyncPerm::TokenDiff)
            || !local_tree.is_enabled
            || self.aborts.is_aborted(pair);
        if gated {
            debug!(sync = %sync.uuid, perm = ?sync.perm, "Pair gated off; nothing to do");
            self.deps
                .events
                .update(StatusUpdate::Event(EngineEvent::SyncFinished {
                    local_tree_id: local_tree.id,
                    remote_tree_id: remote_tree.id,
                    error: None,
                }));
            return Ok(());
        }

        let device = store
            .device_by_id(remote_tree.device_id)
            .await?
            .ok_or(SyncError::DeviceNotFound {
                device_id: remote_tree.device_id,
            })?;

        self.deps.events.update(StatusUpdate::Syncing {
            tree_id: local_tree.id,
            active: true,
        });

        let result = self
            .sync_pair(pair, &local_tree, &remote_tree, &sync, &device)
            .instrument(info_span!(
                "sync_pair",
                local = local_tree.id,
                remote = remote_tree.id,
                device = %device.uuid
            ))
            .await;

        self.deps.events.update(StatusUpdate::Syncing {
            tree_id: local_tree.id,
            active: false,
        });
        self.deps
            .events
            .update(StatusUpdate::Event(EngineEvent::SyncFinished {
                local_tree_id: local_tree.id,
                remote_tree_id: remote_tree.id,
                error: result.as_ref().err().map(|e| e.to_string()),
            }));
        result
    }

    async fn sync_pair(
        &self,
        pair: (i64, i64),
        local_tree: &Tree,
        remote_tree: &Tree,
        sync: &SyncRow,
        device: &Device,
    ) -> Result<()> {
        let store = &self.deps.store;

        let pinned_ip = self
            .fetch_remote_meta(pair, local_tree, remote_tree, sync, device)
            .await?;

        // RECONCILE over the full mirrored table, scoped by the sync list.
        let trie = SyncListTrie::new(&store.sync_list_paths(local_tree.id).await?);
        let locals: HashMap<String, FileEntry> = store
            .files_all(&local_tree.uuid)
            .await?
            .into_iter()
            .map(|f| (f.path.clone(), f))
            .collect();
        let remotes = store.files_all(&remote_tree.uuid).await?;

        let ctx = ReconcileContext {
            perm: sync.perm,
            role: match local_tree.backup_type {
                BackupType::Src => PairRole::BackupSrc,
                BackupType::Dst => PairRole::BackupDst,
                BackupType::None => PairRole::Normal,
            },
        };

        let mut actions = Vec::new();
        for remote in &remotes {
            if !trie.need_sync(&remote.path) {
                continue;
            }
            if let Some(action) = reconcile_path(locals.get(&remote.path), remote, &ctx) {
                actions.push(action);
            }
        }

        if actions.is_empty() {
            debug!("Pair already converged");
            store
                .set_sync_last_sync(sync.id, self.deps.clock.now_secs())
                .await?;
            return Ok(());
        }
        info!(actions = actions.len(), "Reconcile produced work");

        // APPLY_LOCAL: metadata-only operations and conflict renames.
        let root = PathBuf::from(&local_tree.root);
        let mut adopted: Vec<FileChange> = Vec::new();
        let mut fetch: Vec<FileEntry> = Vec::new();

        for action in actions {
            if self.aborts.is_aborted(pair) {
                return Err(SyncError::Aborted {
                    local: pair.0,
                    remote: pair.1,
                }
                .into());
            }
            match action {
                ReconcileAction::CreateDir { remote } => {
                    let abs = abs_path(&root, &remote.path);
                    tokio::fs::create_dir_all(&abs).await?;
                    adopted.push(self.adopt_change(&locals, &remote, FileStatus::Normal));
                    self.record_history(local_tree, &remote, HistoryCode::Add, "")
                        .await;
                }
                ReconcileAction::AdoptMeta { remote } => {
                    adopted.push(self.adopt_change(&locals, &remote, FileStatus::Normal));
                }
                ReconcileAction::DeleteLocal { local, remote } => {
                    self.move_to_trash(&root, &local.path).await?;
                    adopted.push(self.adopt_change(&locals, &remote, FileStatus::Remove));
                    self.record_history(local_tree, &remote, HistoryCode::Delete, "")
                        .await;
                }
                ReconcileAction::ConflictFetch { local, remote } => {
                    let sibling = conflict_name(
                        &local.path,
                        &self.deps.config.device_uuid(),
                        self.deps.clock.now_secs(),
                    );
                    let from = abs_path(&root, &local.path);
                    let to = abs_path(&root, &sibling);
                    if let Err(e) = tokio::fs::rename(&from, &to).await {
                        warn!(path = %local.path, "Conflict rename failed: {e}");
                    }
                    self.record_history(local_tree, &remote, HistoryCode::Conflict, &sibling)
                        .await;
                    fetch.push(remote);
                }
                ReconcileAction::FetchFile { remote } => {
                    fetch.push(remote);
                }
            }
        }

        // SCHEDULE_TRANSFERS: stream the content, then finalize rows.
        if !fetch.is_empty() {
            let tree_pair = TreePair {
                sync_uuid: sync.uuid.clone(),
                local_tree_id: local_tree.id,
                local_tree_uuid: local_tree.uuid.clone(),
                local_root: root.clone(),
                remote_tree_uuid: remote_tree.uuid.clone(),
                remote_host: pinned_ip,
                remote_data_port: device.data_port as u16,
            };
            let heads: Vec<TransferFileHead> = fetch
                .iter()
                .map(|f| TransferFileHead {
                    path: f.path.clone(),
                    length: f.length,
                    sha1: f.sha1.clone(),
                    mtime: f.mtime,
                    unix_attr: f.unix_attr,
                    win_attr: f.win_attr,
                })
                .collect();

            let total: i64 = fetch.iter().map(|f| f.length).sum();
            self.deps.events.update(StatusUpdate::PairProgress {
                local_tree_id: local_tree.id,
                remote_tree_id: remote_tree.id,
                bytes_done: 0,
                bytes_total: total,
            });

            let applied = self.deps.transfer.get(&tree_pair, &heads).await?;
            let mut applied_bytes = 0i64;
            for remote in &fetch {
                if applied.contains(&remote.path) {
                    adopted.push(self.adopt_change(&locals, remote, FileStatus::Normal));
                    applied_bytes += remote.length;
                    self.record_history(
                        local_tree,
                        remote,
                        if locals.contains_key(&remote.path) {
                            HistoryCode::Modify
                        } else {
                            HistoryCode::Add
                        },
                        "",
                    )
                    .await;
                }
            }
            self.deps.events.update(StatusUpdate::PairProgress {
                local_tree_id: local_tree.id,
                remote_tree_id: remote_tree.id,
                bytes_done: applied_bytes,
                bytes_total: total,
            });
        }

        let affected = store.apply_file_batch(&local_tree.uuid, adopted).await?;
        debug!(affected, "Sync adoption batch committed");

        store
            .set_sync_last_sync(sync.id, self.deps.clock.now_secs())
            .await?;
        Ok(())
    }

    /// Page remote metadata into the mirror table. Returns the endpoint
    /// that served the pages (pinned for the transfer stage).
    async fn fetch_remote_meta(
        &self,
        pair: (i64, i64),
        local_tree: &Tree,
        remote_tree: &Tree,
        sync: &SyncRow,
        device: &Device,
    ) -> Result<String> {
        let store = &self.deps.store;
        store.ensure_file_table(&remote_tree.uuid).await?;
        let mut since = store.max_usn(&remote_tree.uuid).await?;
        let mut pinned: Option<String> = None;

        loop {
            if self.aborts.is_aborted(pair) {
                return Err(SyncError::Aborted {
                    local: pair.0,
                    remote: pair.1,
                }
                .into());
            }

            let body = RequestBody::Find(FindRequest {
                local_tree_uuid: local_tree.uuid.clone(),
                remote_tree_uuid: remote_tree.uuid.clone(),
                sync_uuid: sync.uuid.clone(),
                since,
                limit: FIND_LIMIT,
            });

            let (ip, response) = match &pinned {
                Some(ip) => {
                    match rpc::client::send_request(
                        ip,
                        device.route_port as u16,
                        &body,
                        &self.deps.config,
                    )
                    .await
                    {
                        Ok(response) => (ip.clone(), response),
                        Err(e) => {
                            debug!(ip = %ip, "Pinned endpoint failed mid-paging: {e}");
                            store
                                .mark_ip_no_response(device.id, ip, self.deps.clock.now_secs())
                                .await?;
                            pinned = None;
                            continue;
                        }
                    }
                }
                None => {
                    let outcome = rpc::issue::issue_to_device(
                        store,
                        &self.deps.config,
                        &self.deps.clock,
                        &self.deps.events,
                        device,
                        &body,
                    )
                    .await
                    .map_err(|e| match e {
                        crate::Error::Rpc(RpcError::AllEndpointsFailed { device_uuid }) => {
                            SyncError::RemoteUnreachable { device_uuid }.into()
                        }
                        other => other,
                    })?;
                    (outcome.ip.clone(), outcome.response)
                }
            };
            pinned = Some(ip);

            let stats = match response {
                ResponseBody::Find(find) => find.stats,
                other => {
                    return Err(SyncError::PeerError {
                        message: format!("unexpected Find response: {other:?}"),
                    }
                    .into());
                }
            };
            if stats.is_empty() {
                break;
            }
            since = stats.last().map(|s| s.usn).unwrap_or(since);
            store.apply_remote_file_batch(&remote_tree.uuid, &stats).await?;
            debug!(page = stats.len(), since, "Stored remote meta page");
        }

        store
            .set_tree_last_find(remote_tree.id, self.deps.clock.now_secs())
            .await?;
        pinned.ok_or_else(|| {
            SyncError::RemoteUnreachable {
                device_uuid: device.uuid.clone(),
            }
            .into()
        })
    }

    /// Row adoption: the local row mirrors the remote version. The vclock
    /// swaps components so the pair reads Equal afterwards.
    fn adopt_change(
        &self,
        locals: &HashMap<String, FileEntry>,
        remote: &FileEntry,
        status: FileStatus,
    ) -> FileChange {
        let entry = FileEntry {
            id: 0,
            path: remote.path.clone(),
            kind: remote.kind,
            status,
            mtime: remote.mtime,
            length: remote.length,
            usn: 0,
            sha1: remote.sha1.clone(),
            modifier: remote.modifier.clone(),
            win_attr: remote.win_attr,
            unix_attr: remote.unix_attr,
            vclock: VClock::new(remote.vclock.remote, remote.vclock.local),
            alias: remote.alias.clone(),
            time_stamp: remote.time_stamp,
        };
        if locals.contains_key(&remote.path) {
            FileChange::Update(entry)
        } else {
            FileChange::Insert(entry)
        }
    }

    async fn move_to_trash(&self, root: &Path, fixed: &str) -> Result<()> {
        let from = abs_path(root, fixed);
        if !from.exists() {
            return Ok(());
        }
        let trash = root.join(TRASH_DIR);
        tokio::fs::create_dir_all(&trash).await?;
        let name = crate::store::file_name(fixed);
        let target = trash.join(format!("{}.{}", name, self.deps.clock.now_millis()));
        match tokio::fs::rename(&from, &target).await {
            Ok(()) => Ok(()),
            Err(_) if from.is_dir() => {
                // Directories with content fall back to removal.
                tokio::fs::remove_dir_all(&from).await?;
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn record_history(
        &self,
        local_tree: &Tree,
        remote: &FileEntry,
        code: HistoryCode,
        dstpath: &str,
    ) {
        let entry = HistoryEntry {
            id: 0,
            modifier: remote.modifier.clone(),
            tree_id: local_tree.id,
            srcpath: remote.path.clone(),
            dstpath: dstpath.to_string(),
            time_stamp: self.deps.clock.now_secs(),
            code: code.as_i64(),
            error: 0,
        };
        if let Err(e) = self.deps.plain.append_history(&entry).await {
            warn!("Failed to record history: {e}");
        }
    }
}

fn abs_path(root: &Path, fixed: &str) -> PathBuf {
    root.join(fixed.trim_start_matches('/'))
}
