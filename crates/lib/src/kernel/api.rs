//! The public operation surface of the kernel.
//!
//! Thin argument validation and entity lookups; the services do the work.
//! Every operation goes through `Kernel::engine()` and therefore returns
//! the not-startup error until `startup` has completed.

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::Ordering;

use tracing::{debug, info, warn};

use super::{Engine, Kernel, KernelError};
use crate::constants::{DISCOVER_SESSION_LIMIT, LOCAL_DEVICE_ID, NULL_DEVICE_ID};
use crate::discovery::DiscoveryError;
use crate::events::{TreePairStatus, TreeStatus as TreeStatusView, TransferItem};
use crate::proto::{
    MsgSync, MsgTree, PushBackupInfoRequest, PushSyncInfoRequest, RequestBody, ShareSyncRequest,
    SyncIssue,
};
use crate::query::SyncInfo;
use crate::refresh::RefreshTask;
use crate::rpc::issue;
use crate::store::{
    BackupType, ContentProvider, HistoryEntry, PathType, RootStatus, StaticPeer, Sync,
    SyncListTrie, SyncMode, SyncPerm, SyncStatus, SyncType, Tree, TreeStatus,
};
use crate::transfer::TaskStatus;
use crate::Result;

/// A peer as seen by a discover session.
#[derive(Debug, Clone, PartialEq)]
pub struct DiscoveredDevice {
    pub host: String,
    pub port: u16,
    pub is_lan: bool,
    /// Set when a DeviceMeta exchange has already identified the peer.
    pub device_uuid: Option<String>,
    pub device_name: Option<String>,
    pub is_mine: bool,
}

/// Opaque licensing status (policy lives outside the core).
#[derive(Debug, Clone, PartialEq)]
pub struct LicencesInfo {
    pub bound: bool,
    pub cdkey: String,
}

/// Serialized form of a sync for export/import.
#[derive(serde::Serialize, serde::Deserialize)]
struct SyncBlob {
    uuid: String,
    name: String,
    kind: SyncType,
}

const KEY_CDKEY: &str = "CDKEY";

impl Kernel {
    // Device & tunables ---------------------------------------------------

    pub async fn device_name(&self) -> Result<String> {
        Ok(self.engine().await?.config.device_name())
    }

    pub async fn set_device_name(&self, name: &str) -> Result<()> {
        let engine = self.engine().await?;
        engine.config.set_device_name(name).await?;
        if let Some(mut row) = engine.store.device_by_id(LOCAL_DEVICE_ID).await? {
            row.name = name.to_string();
            engine.store.update_device(&row).await?;
        }
        let _ = engine
            .router
            .inner_sender()
            .send(RequestBody::IssuePushDeviceInfo)
            .await;
        Ok(())
    }

    pub async fn account_name(&self) -> Result<String> {
        Ok(self.engine().await?.config.account_name())
    }

    pub async fn discover_port(&self) -> Result<u16> {
        Ok(self.engine().await?.config.discover_port())
    }

    pub async fn route_port(&self) -> Result<u16> {
        Ok(self.engine().await?.config.route_port())
    }

    pub async fn data_port(&self) -> Result<u16> {
        Ok(self.engine().await?.config.data_port())
    }

    pub async fn set_discover_port(&self, port: i64) -> Result<()> {
        let engine = self.engine().await?;
        let validated = u16::try_from(port)
            .ok()
            .filter(|p| *p > 0)
            .ok_or(crate::config::ConfigError::InvalidPort { port })?;
        // Bind first; the config only changes once the socket is live.
        engine.discovery.set_port(validated).await?;
        engine.config.set_discover_port(port).await
    }

    pub async fn set_route_port(&self, port: i64) -> Result<()> {
        let engine = self.engine().await?;
        let validated = u16::try_from(port)
            .ok()
            .filter(|p| *p > 0)
            .ok_or(crate::config::ConfigError::InvalidPort { port })?;
        engine.router.set_port(validated).await?;
        engine.config.set_route_port(port).await?;
        engine.sync_self_row().await?;
        let _ = engine
            .router
            .inner_sender()
            .send(RequestBody::IssuePushDeviceInfo)
            .await;
        Ok(())
    }

    pub async fn set_data_port(&self, port: i64) -> Result<()> {
        let engine = self.engine().await?;
        let validated = u16::try_from(port)
            .ok()
            .filter(|p| *p > 0)
            .ok_or(crate::config::ConfigError::InvalidPort { port })?;
        engine.transfer.set_port(validated).await?;
        engine.config.set_data_port(port).await?;
        engine.sync_self_row().await?;
        let _ = engine
            .router
            .inner_sender()
            .send(RequestBody::IssuePushDeviceInfo)
            .await;
        Ok(())
    }

    pub async fn set_transfer_thread_count(&self, count: usize) -> Result<()> {
        self.engine().await?.config.set_transfer_threads(count).await
    }

    pub async fn set_upload_limit(&self, bytes_per_s: i64) -> Result<()> {
        self.engine().await?.transfer.set_upload_limit(bytes_per_s);
        Ok(())
    }

    pub async fn set_download_limit(&self, bytes_per_s: i64) -> Result<()> {
        self.engine().await?.transfer.set_download_limit(bytes_per_s);
        Ok(())
    }

    pub async fn set_download_cache_volume(&self, volume: i64) -> Result<()> {
        self.engine()
            .await?
            .transfer
            .set_download_cache_volume(volume)
            .await
    }

    pub async fn sync_interval(&self) -> Result<i64> {
        Ok(self.engine().await?.config.sync_interval_in_s())
    }

    pub async fn set_sync_interval(&self, interval_in_s: i64) -> Result<()> {
        self.engine()
            .await?
            .config
            .set_sync_interval(interval_in_s)
            .await
    }

    // Syncs ---------------------------------------------------------------

    /// Create an ordinary sync owned by this device.
    pub async fn create_sync(&self, name: &str) -> Result<i64> {
        let engine = self.engine().await?;
        let row = Sync {
            id: 0,
            uuid: uuid::Uuid::new_v4().to_string(),
            name: name.to_string(),
            last_sync: 0,
            kind: SyncType::Normal,
            status: SyncStatus::Normal,
            device_id: LOCAL_DEVICE_ID,
            perm: SyncPerm::Rdwr,
            restore_share_perm: SyncPerm::Rdwr,
        };
        let id = engine.store.insert_sync(&row).await?;
        info!(sync = %row.uuid, name, "Created sync");
        Ok(id)
    }

    /// Soft-delete a sync so the removal can propagate, then gossip it.
    pub async fn destroy_sync(&self, sync_id: i64) -> Result<()> {
        let engine = self.engine().await?;
        let sync = engine.require_sync(sync_id).await?;
        if sync.device_id != LOCAL_DEVICE_ID && sync.device_id != NULL_DEVICE_ID {
            return Err(KernelError::NotSyncCreator { sync_id }.into());
        }
        for tree in engine.store.trees_of_sync(sync_id).await? {
            engine.store.set_tree_status(tree.id, TreeStatus::Remove).await?;
            engine.sync_pool.aborts().abort_tree(tree.id);
        }
        engine.store.set_sync_status(sync_id, SyncStatus::Removed).await?;
        engine.push_sync_info(sync_id, SyncPerm::Disconnect).await;
        Ok(())
    }

    /// Serialize a sync into an opaque blob another device can import.
    pub async fn export_sync(&self, sync_id: i64) -> Result<String> {
        let engine = self.engine().await?;
        let sync = engine.require_sync(sync_id).await?;
        let blob = SyncBlob {
            uuid: sync.uuid,
            name: sync.name,
            kind: sync.kind,
        };
        Ok(serde_json::to_string(&blob).expect("blob serializes"))
    }

    /// Recreate a sync from an exported blob.
    pub async fn import_sync(&self, blob: &str) -> Result<i64> {
        let engine = self.engine().await?;
        let parsed: SyncBlob =
            serde_json::from_str(blob).map_err(|_| KernelError::InvalidSyncBlob)?;
        if parsed.uuid.is_empty() || parsed.name.is_empty() {
            return Err(KernelError::InvalidSyncBlob.into());
        }
        if let Some(existing) = engine.store.sync_by_uuid(&parsed.uuid).await? {
            return Ok(existing.id);
        }
        let row = Sync {
            id: 0,
            uuid: parsed.uuid,
            name: parsed.name,
            last_sync: 0,
            kind: parsed.kind,
            status: SyncStatus::Normal,
            device_id: NULL_DEVICE_ID,
            perm: SyncPerm::Rdwr,
            restore_share_perm: SyncPerm::Rdwr,
        };
        let id = engine.store.insert_sync(&row).await?;
        info!(sync = %row.uuid, "Imported sync");
        Ok(id)
    }

    pub async fn list_sync(&self) -> Result<Vec<Arc<SyncInfo>>> {
        self.engine().await?.query.list_sync_info().await
    }

    pub async fn query_sync_info(&self, sync_id: i64) -> Result<Arc<SyncInfo>> {
        self.engine()
            .await?
            .query
            .sync_info(sync_id)
            .await?
            .ok_or_else(|| KernelError::SyncNoent { sync_id }.into())
    }

    /// Claim creatorship of a sync whose creator is unset.
    pub async fn set_local_device_as_creator(&self, sync_id: i64) -> Result<()> {
        let engine = self.engine().await?;
        let sync = engine.require_sync(sync_id).await?;
        if sync.device_id != NULL_DEVICE_ID {
            return Err(KernelError::SyncCreatorExist { sync_id }.into());
        }
        engine.store.set_sync_creator(sync_id, LOCAL_DEVICE_ID).await?;
        Ok(())
    }

    // Trees ---------------------------------------------------------------

    /// Mirror a sync into a local directory.
    pub async fn create_tree(&self, sync_id: i64, root: &str) -> Result<i64> {
        let engine = self.engine().await?;
        engine.require_sync(sync_id).await?;
        engine.validate_tree_root(root)?;
        if !Path::new(root).is_dir() {
            return Err(KernelError::DirNoent {
                path: root.to_string(),
            }
            .into());
        }
        for tree in engine.store.trees_of_sync(sync_id).await? {
            if tree.device_id == LOCAL_DEVICE_ID {
                return Err(KernelError::TreeExist { sync_id }.into());
            }
        }

        let row = Tree {
            id: 0,
            uuid: uuid::Uuid::new_v4().to_string(),
            root: root.to_string(),
            device_id: LOCAL_DEVICE_ID,
            sync_id,
            status: TreeStatus::Normal,
            last_find: 0,
            backup_type: BackupType::None,
            is_enabled: true,
            root_status: RootStatus::Normal,
        };
        let id = engine.store.insert_tree(&row).await?;
        engine.store.ensure_file_table(&row.uuid).await?;
        engine
            .refresh_pool
            .enqueue(RefreshTask {
                tree_id: id,
                subtree: None,
            })
            .await?;
        engine.push_sync_info(sync_id, SyncPerm::Rdwr).await;
        info!(tree = %row.uuid, root, "Created tree");
        Ok(id)
    }

    pub async fn destroy_tree(&self, tree_id: i64) -> Result<()> {
        let engine = self.engine().await?;
        let tree = engine.require_tree(tree_id).await?;
        engine.sync_pool.aborts().abort_tree(tree_id);
        engine.store.set_tree_status(tree_id, TreeStatus::Remove).await?;
        engine.push_sync_info(tree.sync_id, SyncPerm::Rdwr).await;
        Ok(())
    }

    pub async fn set_tree_root(&self, tree_id: i64, root: &str) -> Result<()> {
        let engine = self.engine().await?;
        engine.require_tree(tree_id).await?;
        engine.validate_tree_root(root)?;
        if !Path::new(root).is_dir() {
            return Err(KernelError::DirNoent {
                path: root.to_string(),
            }
            .into());
        }
        engine.store.set_tree_root(tree_id, root).await?;
        engine.store.set_tree_root_status(tree_id, RootStatus::Normal).await?;
        engine
            .refresh_pool
            .enqueue(RefreshTask {
                tree_id,
                subtree: None,
            })
            .await?;
        Ok(())
    }

    // Favorites (selective sync) ------------------------------------------

    pub async fn add_favorite(&self, tree_id: i64, path: &str) -> Result<()> {
        let engine = self.engine().await?;
        engine.require_tree(tree_id).await?;
        if !engine.store.sync_list_insert(tree_id, path).await? {
            return Err(KernelError::FavouriteExist {
                path: path.to_string(),
            }
            .into());
        }
        engine
            .refresh_pool
            .enqueue(RefreshTask {
                tree_id,
                subtree: Some(path.to_string()),
            })
            .await?;
        Ok(())
    }

    pub async fn del_favorite(&self, tree_id: i64, path: &str) -> Result<()> {
        let engine = self.engine().await?;
        engine.require_tree(tree_id).await?;
        if !engine.store.sync_list_remove(tree_id, path).await? {
            return Err(KernelError::FavouriteNoent {
                path: path.to_string(),
            }
            .into());
        }
        Ok(())
    }

    pub async fn get_favorite_status(&self, tree_id: i64, path: &str) -> Result<PathType> {
        let engine = self.engine().await?;
        engine.require_tree(tree_id).await?;
        let trie = SyncListTrie::new(&engine.store.sync_list_paths(tree_id).await?);
        Ok(trie.find(&crate::store::fix_path(path)))
    }

    pub async fn has_favorite(&self, tree_id: i64) -> Result<bool> {
        let engine = self.engine().await?;
        engine.require_tree(tree_id).await?;
        Ok(!engine.store.sync_list_paths(tree_id).await?.is_empty())
    }

    // Sync execution ------------------------------------------------------

    /// Manually run every pair of a sync once.
    pub async fn sync_once(&self, sync_id: i64) -> Result<()> {
        let engine = self.engine().await?;
        engine.require_sync(sync_id).await?;
        let trees = engine.store.trees_of_sync(sync_id).await?;
        let locals: Vec<&Tree> = trees
            .iter()
            .filter(|t| t.device_id == LOCAL_DEVICE_ID && t.is_enabled)
            .collect();
        for local in locals {
            for remote in trees.iter().filter(|t| t.device_id != LOCAL_DEVICE_ID) {
                let _ = engine
                    .router
                    .inner_sender()
                    .send(RequestBody::Sync(SyncIssue {
                        local_tree_id: local.id,
                        remote_tree_id: remote.id,
                        is_manual: true,
                    }))
                    .await;
            }
        }
        Ok(())
    }

    pub async fn set_sync_mode(
        &self,
        local_tree_id: i64,
        remote_tree_id: i64,
        mode: SyncMode,
        sync_time_in_s: i64,
    ) -> Result<()> {
        let engine = self.engine().await?;
        engine.require_tree(local_tree_id).await?;
        engine
            .store
            .set_pair_sync_mode(local_tree_id, remote_tree_id, mode, sync_time_in_s)
            .await
    }

    pub async fn get_sync_mode(
        &self,
        local_tree_id: i64,
        remote_tree_id: i64,
    ) -> Result<(SyncMode, i64)> {
        let engine = self.engine().await?;
        let entry = engine
            .store
            .pair_sync_mode(local_tree_id, remote_tree_id)
            .await?;
        Ok((entry.mode, entry.sync_time_in_s))
    }

    // Status queries ------------------------------------------------------

    pub async fn query_tree_status(&self, tree_id: i64) -> Result<TreeStatusView> {
        Ok(self.engine().await?.events.tree_status(tree_id))
    }

    pub async fn query_tree_pair_status(
        &self,
        local_tree_id: i64,
        remote_tree_id: i64,
    ) -> Result<TreePairStatus> {
        Ok(self
            .engine()
            .await?
            .events
            .tree_pair_status(local_tree_id, remote_tree_id))
    }

    pub async fn query_transfer_list(&self) -> Result<Vec<(i64, TransferItem)>> {
        Ok(self.engine().await?.events.transfer_list())
    }

    pub async fn query_history_info(&self, offset: i64, limit: i64) -> Result<Vec<HistoryEntry>> {
        self.engine().await?.plain.query_history(offset, limit).await
    }

    // Discovered-device sessions ------------------------------------------

    pub async fn startup_discover_device(&self) -> Result<i64> {
        let engine = self.engine().await?;
        let mut sessions = engine.discover_sessions.lock().unwrap();
        if sessions.len() >= DISCOVER_SESSION_LIMIT {
            return Err(DiscoveryError::SessionLimit.into());
        }
        let id = engine.next_session_id.fetch_add(1, Ordering::Relaxed);
        sessions.insert(id, engine.clock.now_secs());
        Ok(id)
    }

    pub async fn get_discovered_device(&self, session_id: i64) -> Result<Vec<DiscoveredDevice>> {
        let engine = self.engine().await?;
        {
            let sessions = engine.discover_sessions.lock().unwrap();
            if !sessions.contains_key(&session_id) {
                return Err(DiscoveryError::SessionNotFound { id: session_id }.into());
            }
        }

        let peers = engine.store.all_peers().await?;
        let devices = engine.store.list_devices().await?;
        let mut out = Vec::new();
        for peer in peers {
            let known = devices.iter().find(|d| {
                d.route_port == peer.peer_port && d.id != LOCAL_DEVICE_ID && d.id != NULL_DEVICE_ID
            });
            out.push(DiscoveredDevice {
                host: peer.peer_host,
                port: peer.peer_port as u16,
                is_lan: peer.is_lan,
                device_uuid: known.map(|d| d.uuid.clone()),
                device_name: known.map(|d| d.name.clone()),
                is_mine: known.map(|d| d.is_mine).unwrap_or(false),
            });
        }
        Ok(out)
    }

    pub async fn shutdown_discover_device(&self, session_id: i64) -> Result<()> {
        let engine = self.engine().await?;
        if engine
            .discover_sessions
            .lock()
            .unwrap()
            .remove(&session_id)
            .is_none()
        {
            return Err(DiscoveryError::SessionNotFound { id: session_id }.into());
        }
        Ok(())
    }

    // Shares --------------------------------------------------------------

    /// Offer a sync to another device with the given permission.
    pub async fn share_sync(&self, sync_id: i64, device_id: i64, perm: SyncPerm) -> Result<()> {
        let engine = self.engine().await?;
        let sync = engine.require_sync(sync_id).await?;
        if sync.device_id != LOCAL_DEVICE_ID {
            return Err(KernelError::NotSyncCreator { sync_id }.into());
        }
        let device = engine.require_device(device_id).await?;

        let body = RequestBody::ShareSync(ShareSyncRequest {
            device: engine.local_device_msg(),
            sync: MsgSync {
                uuid: sync.uuid.clone(),
                name: sync.name.clone(),
                kind: SyncType::Shared,
                perm,
            },
            perm,
        });
        issue::issue_to_device(
            &engine.store,
            &engine.config,
            &engine.clock,
            &engine.events,
            &device,
            &body,
        )
        .await?;
        engine.store.set_share_perm(device_id, sync_id, perm).await?;
        info!(sync = %sync.uuid, device = %device.uuid, ?perm, "Shared sync");
        Ok(())
    }

    /// Revoke a previously offered share.
    pub async fn cancel_share_sync(&self, sync_id: i64, device_id: i64) -> Result<()> {
        self.set_share_sync_perm(sync_id, device_id, SyncPerm::Disconnect)
            .await
    }

    /// Recipient-side disconnect from a shared sync.
    pub async fn disconnect_share_sync(&self, sync_id: i64) -> Result<()> {
        let engine = self.engine().await?;
        let sync = engine.require_sync(sync_id).await?;
        if sync.kind != SyncType::Shared {
            return Err(KernelError::ShareSyncDisconnect { sync_id }.into());
        }
        engine.store.set_sync_perm(sync_id, SyncPerm::Disconnect).await?;
        for tree in engine.store.trees_of_sync(sync_id).await? {
            if tree.device_id == LOCAL_DEVICE_ID {
                engine.store.set_tree_status(tree.id, TreeStatus::Remove).await?;
                engine.sync_pool.aborts().abort_tree(tree.id);
            }
        }
        engine.push_sync_info(sync_id, SyncPerm::Disconnect).await;
        Ok(())
    }

    /// Change a peer's permission; DISCONNECT revokes their access and the
    /// change reaches them with the next membership push.
    pub async fn set_share_sync_perm(
        &self,
        sync_id: i64,
        device_id: i64,
        perm: SyncPerm,
    ) -> Result<()> {
        let engine = self.engine().await?;
        let sync = engine.require_sync(sync_id).await?;
        if sync.device_id != LOCAL_DEVICE_ID {
            return Err(KernelError::NotSyncCreator { sync_id }.into());
        }
        engine.require_device(device_id).await?;
        if perm == SyncPerm::Disconnect {
            engine.store.delete_share(device_id, sync_id).await?;
        } else {
            engine.store.set_share_perm(device_id, sync_id, perm).await?;
        }
        engine.push_sync_info_to(sync_id, device_id, perm).await;
        Ok(())
    }

    pub async fn get_share_sync_perm(&self, sync_id: i64, device_id: i64) -> Result<SyncPerm> {
        let engine = self.engine().await?;
        engine.require_sync(sync_id).await?;
        engine
            .store
            .share_perm(device_id, sync_id)
            .await?
            .ok_or_else(|| KernelError::DeviceNoent { device_id }.into())
    }

    /// Local permission override for a sync.
    pub async fn set_sync_perm(&self, sync_id: i64, perm: SyncPerm) -> Result<()> {
        let engine = self.engine().await?;
        engine.require_sync(sync_id).await?;
        engine.store.set_sync_perm(sync_id, perm).await?;
        Ok(())
    }

    // Download / upload tasks ---------------------------------------------

    pub async fn startup_download(&self, sync_uuid: &str, rel_path: &str) -> Result<i64> {
        let engine = self.engine().await?;
        engine.transfer.startup_download(sync_uuid, rel_path).await
    }

    pub async fn shutdown_download(&self, task_id: i64) -> Result<()> {
        self.engine().await?.transfer.shutdown_download(task_id).await
    }

    pub async fn query_download_status(&self, task_id: i64) -> Result<TaskStatus> {
        self.engine().await?.transfer.query_task(task_id).await
    }

    pub async fn startup_upload(&self, sync_uuid: &str, rel_path: &str) -> Result<i64> {
        let engine = self.engine().await?;
        // The file comes from this device's tree of the sync.
        let sync = engine
            .store
            .sync_by_uuid(sync_uuid)
            .await?
            .ok_or(KernelError::SyncNoent { sync_id: -1 })?;
        let local = engine
            .store
            .trees_of_sync(sync.id)
            .await?
            .into_iter()
            .find(|t| t.device_id == LOCAL_DEVICE_ID)
            .ok_or(KernelError::TreeNoent { tree_id: -1 })?;
        let abs = Path::new(&local.root).join(
            crate::store::fix_path(rel_path).trim_start_matches('/'),
        );
        engine
            .transfer
            .startup_upload(sync_uuid, rel_path, abs)
            .await
    }

    pub async fn shutdown_upload(&self, task_id: i64) -> Result<()> {
        self.engine().await?.transfer.shutdown_upload(task_id).await
    }

    pub async fn query_upload_status(&self, task_id: i64) -> Result<TaskStatus> {
        self.engine().await?.transfer.query_task(task_id).await
    }

    // Licensing stubs -----------------------------------------------------

    pub async fn verify(&self, cdkey: &str) -> Result<()> {
        let engine = self.engine().await?;
        engine.store.config_set(KEY_CDKEY, cdkey).await?;
        Ok(())
    }

    pub async fn verify_status(&self) -> Result<bool> {
        let engine = self.engine().await?;
        Ok(engine.store.config_get(KEY_CDKEY).await?.is_some())
    }

    pub async fn query_licences_info(&self) -> Result<LicencesInfo> {
        let engine = self.engine().await?;
        let cdkey = engine.store.config_get(KEY_CDKEY).await?.unwrap_or_default();
        Ok(LicencesInfo {
            bound: !cdkey.is_empty(),
            cdkey,
        })
    }

    pub async fn bind(&self, cdkey: &str) -> Result<()> {
        self.verify(cdkey).await
    }

    pub async fn unbind(&self) -> Result<()> {
        let engine = self.engine().await?;
        engine
            .store
            .delete(
                &crate::store::Uri::config(),
                Some(&crate::store::Selection::new("key = ?").bind(KEY_CDKEY)),
            )
            .await?;
        Ok(())
    }

    /// Opaque capability check; policy is out of core and defaults open.
    pub async fn check_perm(&self, _operation: &str) -> Result<bool> {
        self.engine().await?;
        Ok(true)
    }

    // Background mode -----------------------------------------------------

    pub async fn set_background(&self, _interval_in_s: i64) -> Result<()> {
        self.engine().await?.discovery.set_background().await
    }

    pub async fn set_foreground(&self) -> Result<()> {
        self.engine().await?.discovery.set_foreground().await
    }

    // Backups -------------------------------------------------------------

    /// Create a backup sync with its source tree rooted here.
    pub async fn create_backup(&self, name: &str, root: &str) -> Result<i64> {
        let engine = self.engine().await?;
        engine.validate_tree_root(root)?;
        if !Path::new(root).is_dir() {
            return Err(KernelError::DirNoent {
                path: root.to_string(),
            }
            .into());
        }

        let sync = Sync {
            id: 0,
            uuid: uuid::Uuid::new_v4().to_string(),
            name: name.to_string(),
            last_sync: 0,
            kind: SyncType::Backup,
            status: SyncStatus::Normal,
            device_id: LOCAL_DEVICE_ID,
            perm: SyncPerm::Wronly,
            restore_share_perm: SyncPerm::Wronly,
        };
        let sync_id = engine.store.insert_sync(&sync).await?;

        let tree = Tree {
            id: 0,
            uuid: uuid::Uuid::new_v4().to_string(),
            root: root.to_string(),
            device_id: LOCAL_DEVICE_ID,
            sync_id,
            status: TreeStatus::Normal,
            last_find: 0,
            backup_type: BackupType::Src,
            is_enabled: true,
            root_status: RootStatus::Normal,
        };
        let tree_id = engine.store.insert_tree(&tree).await?;
        engine.store.ensure_file_table(&tree.uuid).await?;
        engine
            .refresh_pool
            .enqueue(RefreshTask {
                tree_id,
                subtree: None,
            })
            .await?;
        info!(backup = %sync.uuid, root, "Created backup");
        Ok(sync_id)
    }

    pub async fn destroy_backup(&self, sync_id: i64) -> Result<()> {
        let engine = self.engine().await?;
        let sync = engine.require_sync(sync_id).await?;
        if sync.kind != SyncType::Backup {
            return Err(KernelError::SyncNoent { sync_id }.into());
        }
        self.destroy_sync(sync_id).await
    }

    /// Announce the backup to a target device; it answers with the uuid of
    /// the destination tree it created.
    pub async fn add_backup_target(&self, sync_id: i64, device_id: i64) -> Result<()> {
        let engine = self.engine().await?;
        let sync = engine.require_sync(sync_id).await?;
        if sync.device_id != LOCAL_DEVICE_ID {
            return Err(KernelError::NotSyncCreator { sync_id }.into());
        }
        let device = engine.require_device(device_id).await?;
        let trees = engine.store.trees_of_sync(sync_id).await?;
        let src = trees
            .iter()
            .find(|t| t.backup_type == BackupType::Src && t.device_id == LOCAL_DEVICE_ID)
            .ok_or(KernelError::TreeNoent { tree_id: -1 })?;
        if trees
            .iter()
            .any(|t| t.device_id == device_id && t.backup_type == BackupType::Dst)
        {
            return Err(KernelError::BackupDstExist { sync_id }.into());
        }

        let body = RequestBody::PushBackupInfo(PushBackupInfoRequest {
            device: engine.local_device_msg(),
            sync: MsgSync {
                uuid: sync.uuid.clone(),
                name: sync.name.clone(),
                kind: SyncType::Backup,
                perm: SyncPerm::Rdonly,
            },
            src_tree_uuid: src.uuid.clone(),
        });
        let outcome = issue::issue_to_device(
            &engine.store,
            &engine.config,
            &engine.clock,
            &engine.events,
            &device,
            &body,
        )
        .await?;

        if let crate::proto::ResponseBody::PushBackupInfo { dst_tree_uuid } = outcome.response {
            if engine.store.tree_by_uuid(&dst_tree_uuid).await?.is_none() {
                let dst = Tree {
                    id: 0,
                    uuid: dst_tree_uuid,
                    root: String::new(),
                    device_id,
                    sync_id,
                    status: TreeStatus::Normal,
                    last_find: 0,
                    backup_type: BackupType::Dst,
                    is_enabled: true,
                    root_status: RootStatus::Normal,
                };
                engine.store.insert_tree(&dst).await?;
            }
            info!(backup = %sync.uuid, device = %device.uuid, "Added backup target");
            Ok(())
        } else {
            Err(KernelError::BackupDstExist { sync_id }.into())
        }
    }

    pub async fn del_backup_target(&self, sync_id: i64, device_id: i64) -> Result<()> {
        let engine = self.engine().await?;
        engine.require_sync(sync_id).await?;
        for tree in engine.store.trees_of_sync(sync_id).await? {
            if tree.device_id == device_id && tree.backup_type == BackupType::Dst {
                engine.store.set_tree_status(tree.id, TreeStatus::Remove).await?;
                engine.sync_pool.aborts().abort_tree(tree.id);
                return Ok(());
            }
        }
        Err(KernelError::TreeNoent { tree_id: -1 }.into())
    }

    pub async fn list_backup(&self) -> Result<Vec<Arc<SyncInfo>>> {
        self.engine().await?.query.list_backup_info().await
    }

    // Static peers --------------------------------------------------------

    pub async fn get_static_peers(&self) -> Result<Vec<StaticPeer>> {
        Ok(self.engine().await?.static_peers.lock().unwrap().clone())
    }

    pub async fn add_static_peers(&self, peers: &[StaticPeer]) -> Result<()> {
        let engine = self.engine().await?;
        let snapshot = {
            let mut current = engine.static_peers.lock().unwrap();
            for peer in peers {
                if !current.contains(peer) {
                    current.push(peer.clone());
                }
            }
            current.clone()
        };
        engine.discovery.set_static_peers(snapshot).await
    }

    pub async fn delete_static_peers(&self, peers: &[StaticPeer]) -> Result<()> {
        let engine = self.engine().await?;
        let snapshot = {
            let mut current = engine.static_peers.lock().unwrap();
            current.retain(|p| !peers.contains(p));
            current.clone()
        };
        engine.discovery.set_static_peers(snapshot).await
    }

    pub async fn save_static_peers(&self) -> Result<()> {
        let engine = self.engine().await?;
        let snapshot = engine.static_peers.lock().unwrap().clone();
        engine.plain.save_static_peers(&snapshot).await
    }

    // Feedback ------------------------------------------------------------

    /// POST user feedback to the configured report host.
    pub async fn feedback(
        &self,
        kind: &str,
        version: &str,
        message: &str,
        contact: &str,
    ) -> Result<()> {
        let engine = self.engine().await?;
        let host = engine.config.report_host();
        if host.is_empty() {
            return Err(KernelError::HttpReturnError { status: 0 }.into());
        }
        let url = format!("http://{host}/feedback");
        let body = format!(
            "type={}&version={}&message={}&contact={}",
            url_encode(kind),
            url_encode(version),
            url_encode(message),
            url_encode(contact)
        );
        let response = reqwest::Client::new()
            .post(&url)
            .header("content-type", "application/x-www-form-urlencoded")
            .body(body)
            .send()
            .await
            .map_err(|e| {
                warn!("Feedback post failed: {e}");
                KernelError::HttpReturnError { status: 0 }
            })?;
        if !response.status().is_success() {
            return Err(KernelError::HttpReturnError {
                status: response.status().as_u16(),
            }
            .into());
        }
        Ok(())
    }
}

impl Engine {
    pub(crate) async fn require_sync(&self, sync_id: i64) -> Result<Sync> {
        match self.store.sync_by_id(sync_id).await? {
            Some(sync) if sync.status == SyncStatus::Normal => Ok(sync),
            _ => Err(KernelError::SyncNoent { sync_id }.into()),
        }
    }

    pub(crate) async fn require_tree(&self, tree_id: i64) -> Result<Tree> {
        match self.store.tree_by_id(tree_id).await? {
            Some(tree) if tree.status == TreeStatus::Normal => Ok(tree),
            _ => Err(KernelError::TreeNoent { tree_id }.into()),
        }
    }

    pub(crate) async fn require_device(&self, device_id: i64) -> Result<crate::store::Device> {
        self.store
            .device_by_id(device_id)
            .await?
            .ok_or_else(|| KernelError::DeviceNoent { device_id }.into())
    }

    /// Path checks shared by tree and backup creation.
    pub(crate) fn validate_tree_root(&self, root: &str) -> Result<()> {
        if root.is_empty() || !Path::new(root).is_absolute() {
            return Err(KernelError::BadPath {
                path: root.to_string(),
            }
            .into());
        }
        let prefix = self.config.tree_root_prefix();
        if !prefix.is_empty() && !root.starts_with(&prefix) {
            return Err(KernelError::BadPath {
                path: root.to_string(),
            }
            .into());
        }
        Ok(())
    }

    pub(crate) fn local_device_msg(&self) -> crate::proto::MsgDevice {
        crate::proto::MsgDevice {
            uuid: self.config.device_uuid(),
            name: self.config.device_name(),
            platform: std::env::consts::OS.to_string(),
            route_port: self.config.route_port(),
            data_port: self.config.data_port(),
            version: 1,
            token_sha1: self.config.token_sha1(),
            backup_dst_root: self.config.backup_root(),
        }
    }

    /// Refresh the self device row from config.
    pub(crate) async fn sync_self_row(&self) -> Result<()> {
        if let Some(mut row) = self.store.device_by_id(LOCAL_DEVICE_ID).await? {
            row.route_port = self.config.route_port() as i64;
            row.data_port = self.config.data_port() as i64;
            row.name = self.config.device_name();
            self.store.update_device(&row).await?;
        }
        Ok(())
    }

    /// Gossip a sync's membership to every participating device.
    pub(crate) async fn push_sync_info(&self, sync_id: i64, perm: SyncPerm) {
        let Ok(Some(sync)) = self.store.sync_by_id(sync_id).await else {
            return;
        };
        let Ok(trees) = self.store.trees_of_sync(sync_id).await else {
            return;
        };
        for tree in &trees {
            if tree.device_id == LOCAL_DEVICE_ID || tree.device_id == NULL_DEVICE_ID {
                continue;
            }
            self.push_sync_info_to_device(&sync, &trees, tree.device_id, perm)
                .await;
        }
    }

    /// Gossip a sync's membership to one device.
    pub(crate) async fn push_sync_info_to(&self, sync_id: i64, device_id: i64, perm: SyncPerm) {
        let Ok(Some(sync)) = self.store.sync_by_id(sync_id).await else {
            return;
        };
        let trees = self.store.trees_of_sync(sync_id).await.unwrap_or_default();
        self.push_sync_info_to_device(&sync, &trees, device_id, perm)
            .await;
    }

    async fn push_sync_info_to_device(
        &self,
        sync: &Sync,
        trees: &[Tree],
        device_id: i64,
        perm: SyncPerm,
    ) {
        let Ok(Some(device)) = self.store.device_by_id(device_id).await else {
            return;
        };
        let mut msg_trees = Vec::new();
        for tree in trees {
            let device_uuid = if tree.device_id == LOCAL_DEVICE_ID {
                self.config.device_uuid()
            } else {
                match self.store.device_by_id(tree.device_id).await {
                    Ok(Some(d)) => d.uuid,
                    _ => continue,
                }
            };
            msg_trees.push(MsgTree {
                uuid: tree.uuid.clone(),
                device_uuid,
                backup_type: tree.backup_type.as_i64(),
            });
        }
        let body = RequestBody::PushSyncInfo(PushSyncInfoRequest {
            sync: MsgSync {
                uuid: sync.uuid.clone(),
                name: sync.name.clone(),
                kind: sync.kind,
                perm,
            },
            trees: msg_trees,
        });
        if let Err(e) = issue::issue_to_device(
            &self.store,
            &self.config,
            &self.clock,
            &self.events,
            &device,
            &body,
        )
        .await
        {
            debug!(device = %device.uuid, "Membership push failed: {e}");
        }
    }
}

fn url_encode(value: &str) -> String {
    url::form_urlencoded::byte_serialize(value.as_bytes()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn everything_returns_not_startup_before_startup() {
        let kernel = Kernel::new();
        let check = |e: crate::Error| {
            assert!(matches!(
                e,
                crate::Error::Kernel(KernelError::NotStartup)
            ));
        };
        check(kernel.create_sync("docs").await.unwrap_err());
        check(kernel.list_sync().await.unwrap_err());
        check(kernel.sync_once(1).await.unwrap_err());
        check(kernel.query_tree_status(1).await.unwrap_err());
        check(kernel.set_discover_port(9000).await.unwrap_err());
        check(kernel.startup_download("s", "/p").await.unwrap_err());
        check(kernel.get_static_peers().await.unwrap_err());
    }
}
