//! The RPC surface between devices (and the engine's own issue requests).
//!
//! `OuterHandler` implements the router's dispatch target: one method per
//! message code, each reading or mutating the store and answering with a
//! typed response. The client half lives in [`client`] (single endpoint)
//! and [`issue`] (fan-out over a device's endpoints).

pub mod client;
mod errors;
pub mod issue;

pub use errors::RpcError;

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::config::Config;
use crate::constants::{LOCAL_DEVICE_ID, NULL_DEVICE_ID};
use crate::events::{EngineEvent, EventNotifier, StatusUpdate};
use crate::proto::{
    FindRequest, FindResponse, IssueDeviceInfo, IssueRefresh, MsgDevice, PushBackupInfoRequest,
    PushSyncInfoRequest, RemoveRemoteFileRequest, RequestBody, ResponseBody, ShareSyncRequest,
    SyncIssue, WireError,
};
use crate::refresh::{RefreshPool, RefreshTask};
use crate::router::{RequestContext, RequestHandler};
use crate::store::{
    BackupType, Device, DeviceStatus, FileChange, MetaStore, RootStatus, Sync, SyncPerm,
    SyncStatus, SyncType, Tree, TreeStatus, fix_path,
};
use crate::sync::{SyncPool, SyncRequest};
use crate::Result;

/// Dispatch target for both worker pools.
pub struct OuterHandler {
    pub store: Arc<MetaStore>,
    pub config: Arc<Config>,
    pub clock: Arc<dyn Clock>,
    pub events: Arc<EventNotifier>,
    pub sync_pool: Arc<SyncPool>,
    pub refresh_pool: Arc<RefreshPool>,
}

impl OuterHandler {
    /// Our identity as put on the wire.
    pub fn local_device_msg(&self) -> MsgDevice {
        MsgDevice {
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

    /// Record (or refresh) a device row from its wire identity. Any
    /// successful exchange makes the device ONLINE.
    pub async fn upsert_device(&self, msg: &MsgDevice, seen_ip: Option<&str>) -> Result<Device> {
        let is_mine = !msg.token_sha1.is_empty() && msg.token_sha1 == self.config.token_sha1();
        let device = match self.store.device_by_uuid(&msg.uuid).await? {
            Some(mut existing) => {
                existing.name = msg.name.clone();
                existing.route_port = msg.route_port as i64;
                existing.data_port = msg.data_port as i64;
                existing.platform = msg.platform.clone();
                existing.is_mine = is_mine;
                existing.version = msg.version;
                existing.backup_dst_root = msg.backup_dst_root.clone();
                let was_offline = existing.status != DeviceStatus::Online;
                existing.status = DeviceStatus::Online;
                self.store.update_device(&existing).await?;
                if was_offline {
                    self.events
                        .update(StatusUpdate::Event(EngineEvent::DeviceStatusChanged {
                            device_uuid: existing.uuid.clone(),
                            online: true,
                        }));
                }
                existing
            }
            None => {
                let mut fresh = Device {
                    id: 0,
                    uuid: msg.uuid.clone(),
                    name: msg.name.clone(),
                    route_port: msg.route_port as i64,
                    data_port: msg.data_port as i64,
                    status: DeviceStatus::Online,
                    platform: msg.platform.clone(),
                    is_mine,
                    backup_dst_root: msg.backup_dst_root.clone(),
                    version: msg.version,
                };
                fresh.id = self.store.insert_device(&fresh).await?;
                info!(device = %fresh.uuid, is_mine, "Learned new device");
                fresh
            }
        };
        if let Some(ip) = seen_ip {
            self.store
                .upsert_device_ip(device.id, ip, ip.contains(':'))
                .await?;
        }
        Ok(device)
    }

    async fn handle_find(&self, request: &FindRequest) -> Result<ResponseBody> {
        let Some(sync) = self.store.sync_by_uuid(&request.sync_uuid).await? else {
            return Ok(error_response(WireError::SyncNoent, "unknown sync"));
        };
        if sync.status != SyncStatus::Normal {
            return Ok(error_response(WireError::SyncNoent, "sync removed"));
        }
        // A read-only member must not propagate its own changes; gated
        // members serve nothing at all.
        if matches!(
            sync.perm,
            SyncPerm::Rdonly | SyncPerm::Disconnect | SyncPerm::TokenDiff
        ) {
            return Ok(error_response(WireError::PermissionDeny, "send gated"));
        }
        // The requestor's "remote tree" is ours.
        let Some(tree) = self.store.tree_by_uuid(&request.remote_tree_uuid).await? else {
            return Ok(error_response(WireError::TreeNoent, "unknown tree"));
        };
        if tree.sync_id != sync.id || tree.device_id != LOCAL_DEVICE_ID {
            return Ok(error_response(WireError::TreeNoent, "tree not served here"));
        }

        let limit = request.limit.clamp(1, crate::constants::FIND_LIMIT);
        let stats = self
            .store
            .files_since(&tree.uuid, request.since, limit)
            .await?;
        debug!(
            tree = %tree.uuid,
            since = request.since,
            page = stats.len(),
            "Serving Find page"
        );
        Ok(ResponseBody::Find(FindResponse { stats }))
    }

    async fn handle_push_sync_info(
        &self,
        sender_uuid: &str,
        request: &PushSyncInfoRequest,
    ) -> Result<ResponseBody> {
        let Some(sender) = self.store.device_by_uuid(sender_uuid).await? else {
            return Ok(error_response(WireError::DeviceNoent, "unknown sender"));
        };

        let sync = match self.store.sync_by_uuid(&request.sync.uuid).await? {
            Some(sync) => {
                // Membership gossip may carry a permission change.
                if sync.perm != request.sync.perm {
                    self.store.set_sync_perm(sync.id, request.sync.perm).await?;
                    if request.sync.perm == SyncPerm::Disconnect {
                        self.drop_local_tree_of(sync.id).await?;
                    }
                }
                sync
            }
            None => {
                let row = Sync {
                    id: 0,
                    uuid: request.sync.uuid.clone(),
                    name: request.sync.name.clone(),
                    last_sync: 0,
                    kind: request.sync.kind,
                    status: SyncStatus::Normal,
                    device_id: sender.id,
                    perm: request.sync.perm,
                    restore_share_perm: request.sync.perm,
                };
                let id = self.store.insert_sync(&row).await?;
                Sync { id, ..row }
            }
        };

        for tree in &request.trees {
            if self.store.tree_by_uuid(&tree.uuid).await?.is_some() {
                continue;
            }
            let device_id = if tree.device_uuid == self.config.device_uuid() {
                LOCAL_DEVICE_ID
            } else {
                match self.store.device_by_uuid(&tree.device_uuid).await? {
                    Some(device) => device.id,
                    None => NULL_DEVICE_ID,
                }
            };
            if device_id == LOCAL_DEVICE_ID {
                // Our own trees are created locally, never by gossip.
                continue;
            }
            let row = Tree {
                id: 0,
                uuid: tree.uuid.clone(),
                root: String::new(),
                device_id,
                sync_id: sync.id,
                status: TreeStatus::Normal,
                last_find: 0,
                backup_type: BackupType::from_i64(tree.backup_type).unwrap_or(BackupType::None),
                is_enabled: true,
                root_status: RootStatus::Normal,
            };
            self.store.insert_tree(&row).await?;
            debug!(tree = %tree.uuid, sync = %sync.uuid, "Learned remote tree");
        }
        Ok(ResponseBody::Ok)
    }

    async fn drop_local_tree_of(&self, sync_id: i64) -> Result<()> {
        for tree in self.store.trees_of_sync(sync_id).await? {
            if tree.device_id == LOCAL_DEVICE_ID {
                self.store.set_tree_status(tree.id, TreeStatus::Remove).await?;
            }
        }
        Ok(())
    }

    async fn handle_share_sync(
        &self,
        request: &ShareSyncRequest,
        context: &RequestContext,
    ) -> Result<ResponseBody> {
        let seen_ip = context.remote_addr.map(|a| a.ip().to_string());
        let sender = self.upsert_device(&request.device, seen_ip.as_deref()).await?;

        match self.store.sync_by_uuid(&request.sync.uuid).await? {
            Some(sync) => {
                self.store.set_sync_perm(sync.id, request.perm).await?;
            }
            None => {
                let row = Sync {
                    id: 0,
                    uuid: request.sync.uuid.clone(),
                    name: request.sync.name.clone(),
                    last_sync: 0,
                    kind: SyncType::Shared,
                    status: SyncStatus::Normal,
                    device_id: sender.id,
                    perm: request.perm,
                    restore_share_perm: request.perm,
                };
                self.store.insert_sync(&row).await?;
                info!(sync = %row.uuid, from = %sender.uuid, "Accepted share offer");
            }
        }
        Ok(ResponseBody::ShareSync {
            device: self.local_device_msg(),
        })
    }

    async fn handle_push_backup_info(
        &self,
        request: &PushBackupInfoRequest,
        context: &RequestContext,
    ) -> Result<ResponseBody> {
        let seen_ip = context.remote_addr.map(|a| a.ip().to_string());
        let sender = self.upsert_device(&request.device, seen_ip.as_deref()).await?;
        if !sender.is_mine {
            return Ok(error_response(WireError::PermissionDeny, "not same account"));
        }

        let sync = match self.store.sync_by_uuid(&request.sync.uuid).await? {
            Some(sync) => sync,
            None => {
                let row = Sync {
                    id: 0,
                    uuid: request.sync.uuid.clone(),
                    name: request.sync.name.clone(),
                    last_sync: 0,
                    kind: SyncType::Backup,
                    status: SyncStatus::Normal,
                    device_id: sender.id,
                    perm: SyncPerm::Rdonly,
                    restore_share_perm: SyncPerm::Rdonly,
                };
                let id = self.store.insert_sync(&row).await?;
                Sync { id, ..row }
            }
        };

        // At most one DST tree per device in a backup.
        for tree in self.store.trees_of_sync(sync.id).await? {
            if tree.device_id == LOCAL_DEVICE_ID && tree.backup_type == BackupType::Dst {
                return Ok(ResponseBody::PushBackupInfo {
                    dst_tree_uuid: tree.uuid,
                });
            }
        }

        let backup_root = self.config.backup_root();
        if backup_root.is_empty() {
            return Ok(error_response(WireError::General, "no backup root"));
        }
        let root = std::path::Path::new(&backup_root)
            .join(&sender.name)
            .join(&sync.name);
        tokio::fs::create_dir_all(&root).await?;

        let dst = Tree {
            id: 0,
            uuid: uuid::Uuid::new_v4().to_string(),
            root: root.display().to_string(),
            device_id: LOCAL_DEVICE_ID,
            sync_id: sync.id,
            status: TreeStatus::Normal,
            last_find: 0,
            backup_type: BackupType::Dst,
            is_enabled: true,
            root_status: RootStatus::Normal,
        };
        let dst_id = self.store.insert_tree(&dst).await?;
        self.store.ensure_file_table(&dst.uuid).await?;
        info!(sync = %sync.uuid, tree = %dst.uuid, "Created backup destination tree");

        // Make sure the remote SRC tree is present for pairing.
        if self
            .store
            .tree_by_uuid(&request.src_tree_uuid)
            .await?
            .is_none()
        {
            let src = Tree {
                id: 0,
                uuid: request.src_tree_uuid.clone(),
                root: String::new(),
                device_id: sender.id,
                sync_id: sync.id,
                status: TreeStatus::Normal,
                last_find: 0,
                backup_type: BackupType::Src,
                is_enabled: true,
                root_status: RootStatus::Normal,
            };
            let src_id = self.store.insert_tree(&src).await?;
            // The new pair can start pulling right away.
            let _ = self
                .sync_pool
                .enqueue(SyncRequest {
                    local_tree_id: dst_id,
                    remote_tree_id: src_id,
                    is_manual: false,
                })
                .await;
        }

        Ok(ResponseBody::PushBackupInfo {
            dst_tree_uuid: dst.uuid,
        })
    }

    async fn handle_remove_remote_file(
        &self,
        request: &RemoveRemoteFileRequest,
    ) -> Result<ResponseBody> {
        let Some(sync) = self.store.sync_by_uuid(&request.sync_uuid).await? else {
            return Ok(error_response(WireError::SyncNoent, "unknown sync"));
        };
        if sync.kind != SyncType::Backup {
            return Ok(error_response(WireError::PermissionDeny, "not a backup"));
        }
        let Some(tree) = self
            .store
            .trees_of_sync(sync.id)
            .await?
            .into_iter()
            .find(|t| t.device_id == LOCAL_DEVICE_ID && t.backup_type == BackupType::Src)
        else {
            return Ok(error_response(WireError::TreeNoent, "no source tree here"));
        };

        let fixed = fix_path(&request.rel_path);
        let abs = std::path::Path::new(&tree.root).join(fixed.trim_start_matches('/'));
        if abs.is_dir() {
            tokio::fs::remove_dir_all(&abs).await?;
        } else if abs.exists() {
            tokio::fs::remove_file(&abs).await?;
        }
        let changes = vec![FileChange::Tombstone {
            path: fixed,
            modifier: self.config.device_uuid(),
            time_stamp: self.clock.now_secs(),
        }];
        self.store.apply_file_batch(&tree.uuid, changes).await?;
        Ok(ResponseBody::Ok)
    }

    // Inner issue requests -----------------------------------------------

    async fn handle_issue_device_info(&self, issue: &IssueDeviceInfo) -> Result<ResponseBody> {
        let response =
            client::send_request(&issue.host, issue.port, &RequestBody::DeviceMeta, &self.config)
                .await?;
        let ResponseBody::DeviceMeta(device) = response else {
            return Err(RpcError::UnexpectedResponse {
                expected: "DeviceMeta",
            }
            .into());
        };
        if device.uuid == self.config.device_uuid() {
            return Ok(ResponseBody::Ok);
        }
        self.upsert_device(&device, Some(&issue.host)).await?;
        Ok(ResponseBody::Ok)
    }

    async fn handle_issue_refresh(&self, issue: &IssueRefresh) -> Result<ResponseBody> {
        let trees = match issue.tree_id {
            Some(tree_id) => self
                .store
                .tree_by_id(tree_id)
                .await?
                .into_iter()
                .collect::<Vec<_>>(),
            None => self.store.local_trees().await?,
        };
        for tree in trees {
            let _ = self
                .refresh_pool
                .enqueue(RefreshTask {
                    tree_id: tree.id,
                    subtree: None,
                })
                .await;
        }
        Ok(ResponseBody::Ok)
    }

    async fn handle_issue_push_device_info(&self) -> Result<ResponseBody> {
        let body = RequestBody::PushDeviceMeta(self.local_device_msg());
        for device in self.store.list_devices().await? {
            if device.id == LOCAL_DEVICE_ID
                || device.id == NULL_DEVICE_ID
                || !device.is_mine
                || device.status != DeviceStatus::Online
            {
                continue;
            }
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
                debug!(device = %device.uuid, "Identity push failed: {e}");
            }
        }
        Ok(ResponseBody::Ok)
    }

    async fn dispatch(&self, request: RequestBody, context: RequestContext) -> Result<ResponseBody> {
        match request {
            RequestBody::DeviceMeta => Ok(ResponseBody::DeviceMeta(self.local_device_msg())),
            RequestBody::Find(find) => self.handle_find(&find).await,
            RequestBody::PushDeviceMeta(device) => {
                let seen_ip = context.remote_addr.map(|a| a.ip().to_string());
                self.upsert_device(&device, seen_ip.as_deref()).await?;
                Ok(ResponseBody::Ok)
            }
            RequestBody::PushSyncInfo(push) => {
                self.handle_push_sync_info(&context.sender_uuid, &push).await
            }
            RequestBody::ShareSync(share) => self.handle_share_sync(&share, &context).await,
            RequestBody::PushBackupInfo(backup) => {
                self.handle_push_backup_info(&backup, &context).await
            }
            RequestBody::RemoveRemoteFile(remove) => {
                self.handle_remove_remote_file(&remove).await
            }
            RequestBody::AnnounceExit { device_uuid } => {
                if let Some(device) = self.store.device_by_uuid(&device_uuid).await? {
                    self.store
                        .set_device_status(device.id, DeviceStatus::Offline)
                        .await?;
                    self.events
                        .update(StatusUpdate::Event(EngineEvent::DeviceStatusChanged {
                            device_uuid,
                            online: false,
                        }));
                }
                Ok(ResponseBody::Ok)
            }
            RequestBody::Sync(SyncIssue {
                local_tree_id,
                remote_tree_id,
                is_manual,
            }) => {
                self.sync_pool
                    .enqueue(SyncRequest {
                        local_tree_id,
                        remote_tree_id,
                        is_manual,
                    })
                    .await?;
                Ok(ResponseBody::Ok)
            }
            RequestBody::IssueDeviceInfo(issue) => self.handle_issue_device_info(&issue).await,
            RequestBody::IssueRefresh(issue) => self.handle_issue_refresh(&issue).await,
            RequestBody::IssuePushDeviceInfo => self.handle_issue_push_device_info().await,
        }
    }
}

#[async_trait]
impl RequestHandler for OuterHandler {
    async fn handle(&self, request: RequestBody, context: RequestContext) -> ResponseBody {
        match self.dispatch(request, context).await {
            Ok(response) => response,
            Err(e) => {
                warn!("Request handling failed: {e}");
                error_response(WireError::General, &e.to_string())
            }
        }
    }
}

fn error_response(code: WireError, message: &str) -> ResponseBody {
    ResponseBody::Error {
        code,
        message: message.to_string(),
    }
}
