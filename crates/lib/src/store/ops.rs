//! Typed helpers over the content-provider API, one group per table.
//!
//! These keep SQL column names in one place; callers work with the row
//! types from [`super::rows`].

use super::provider::{ContentProvider, ContentValues, OnConflict, Selection};
use super::rows::{
    Device, DeviceIp, DeviceStatus, DhtPeer, FileEntry, RootStatus, ShareSyncEntry, Sync,
    SyncListEntry, SyncMode, SyncModeEntry, SyncPerm, SyncStatus, Tree, TreeStatus,
};
use super::uri::{Uri, file_table_name};
use super::{MetaStore, StoreError, path};
use crate::Result;

// Device -----------------------------------------------------------------

impl MetaStore {
    pub async fn device_by_uuid(&self, uuid: &str) -> Result<Option<Device>> {
        let rows = self
            .query(
                &Uri::device(),
                &[],
                Some(&Selection::new("uuid = ?").bind(uuid)),
                None,
            )
            .await?;
        rows.first().map(Device::from_row).transpose()
    }

    pub async fn device_by_id(&self, id: i64) -> Result<Option<Device>> {
        let rows = self
            .query(
                &Uri::device(),
                &[],
                Some(&Selection::new("id = ?").bind(id)),
                None,
            )
            .await?;
        rows.first().map(Device::from_row).transpose()
    }

    /// Insert a device letting sqlite assign the id. Returns the row id.
    pub async fn insert_device(&self, device: &Device) -> Result<i64> {
        let values = ContentValues::new()
            .put("uuid", device.uuid.as_str())
            .put("name", device.name.as_str())
            .put("route_port", device.route_port)
            .put("data_port", device.data_port)
            .put("status", device.status)
            .put("platform", device.platform.as_str())
            .put("is_mine", device.is_mine)
            .put("backup_dst_root", device.backup_dst_root.as_str())
            .put("version", device.version);
        self.insert(&Uri::device(), values, OnConflict::Abort).await
    }

    /// Insert a device with an explicit id (the self row and the creator
    /// placeholder).
    pub async fn insert_device_with_id(&self, device: &Device) -> Result<i64> {
        self.insert(&Uri::device(), device.values(), OnConflict::Ignore)
            .await
    }

    pub async fn list_devices(&self) -> Result<Vec<Device>> {
        let rows = self.query(&Uri::device(), &[], None, Some("id")).await?;
        rows.iter().map(Device::from_row).collect()
    }

    pub async fn update_device(&self, device: &Device) -> Result<u64> {
        let values = ContentValues::new()
            .put("name", device.name.as_str())
            .put("route_port", device.route_port)
            .put("data_port", device.data_port)
            .put("status", device.status)
            .put("platform", device.platform.as_str())
            .put("is_mine", device.is_mine)
            .put("backup_dst_root", device.backup_dst_root.as_str())
            .put("version", device.version);
        self.update(
            &Uri::device(),
            values,
            Some(&Selection::new("id = ?").bind(device.id)),
        )
        .await
    }

    pub async fn set_device_status(&self, id: i64, status: DeviceStatus) -> Result<u64> {
        self.update(
            &Uri::device(),
            ContentValues::new().put("status", status),
            Some(&Selection::new("id = ?").bind(id)),
        )
        .await
    }

    // DeviceIP -----------------------------------------------------------

    pub async fn device_ips(&self, device_id: i64) -> Result<Vec<DeviceIp>> {
        let rows = self
            .query(
                &Uri::device_ip(),
                &[],
                Some(&Selection::new("device_id = ?").bind(device_id)),
                Some("id"),
            )
            .await?;
        rows.iter().map(DeviceIp::from_row).collect()
    }

    /// Record an endpoint for a device, clearing any failure mark.
    pub async fn upsert_device_ip(&self, device_id: i64, ip: &str, is_ipv6: bool) -> Result<()> {
        let values = ContentValues::new()
            .put("device_id", device_id)
            .put("ip", ip)
            .put("is_ipv6", is_ipv6)
            .put("earliest_no_response_time", Option::<i64>::None);
        self.insert(&Uri::device_ip(), values, OnConflict::Replace)
            .await?;
        Ok(())
    }

    /// Mark an endpoint as failing, keeping the earliest mark.
    pub async fn mark_ip_no_response(&self, device_id: i64, ip: &str, now: i64) -> Result<u64> {
        self.update(
            &Uri::device_ip(),
            ContentValues::new().put("earliest_no_response_time", now),
            Some(
                &Selection::new(
                    "device_id = ? AND ip = ? AND earliest_no_response_time IS NULL",
                )
                .bind(device_id)
                .bind(ip),
            ),
        )
        .await
    }

    /// Clear the failure mark of an endpoint after a successful exchange.
    pub async fn clear_ip_no_response(&self, device_id: i64, ip: &str) -> Result<u64> {
        self.update(
            &Uri::device_ip(),
            ContentValues::new().put("earliest_no_response_time", Option::<i64>::None),
            Some(&Selection::new("device_id = ? AND ip = ?").bind(device_id).bind(ip)),
        )
        .await
    }

    /// Drop endpoints whose failure mark predates `cutoff`.
    pub async fn delete_expired_ips(&self, cutoff: i64) -> Result<u64> {
        self.delete(
            &Uri::device_ip(),
            Some(
                &Selection::new(
                    "earliest_no_response_time IS NOT NULL AND earliest_no_response_time <= ?",
                )
                .bind(cutoff),
            ),
        )
        .await
    }

    pub async fn delete_device_ips(&self, device_id: i64) -> Result<u64> {
        self.delete(
            &Uri::device_ip(),
            Some(&Selection::new("device_id = ?").bind(device_id)),
        )
        .await
    }
}

// Sync -------------------------------------------------------------------

impl MetaStore {
    pub async fn insert_sync(&self, sync: &Sync) -> Result<i64> {
        self.insert(&Uri::sync(), sync.values(), OnConflict::Abort)
            .await
    }

    pub async fn sync_by_uuid(&self, uuid: &str) -> Result<Option<Sync>> {
        let rows = self
            .query(
                &Uri::sync(),
                &[],
                Some(&Selection::new("uuid = ?").bind(uuid)),
                None,
            )
            .await?;
        rows.first().map(Sync::from_row).transpose()
    }

    pub async fn sync_by_id(&self, id: i64) -> Result<Option<Sync>> {
        let rows = self
            .query(
                &Uri::sync(),
                &[],
                Some(&Selection::new("id = ?").bind(id)),
                None,
            )
            .await?;
        rows.first().map(Sync::from_row).transpose()
    }

    /// Syncs that are not soft-deleted.
    pub async fn list_syncs(&self) -> Result<Vec<Sync>> {
        let rows = self
            .query(
                &Uri::sync(),
                &[],
                Some(&Selection::new("status = ?").bind(SyncStatus::Normal)),
                Some("id"),
            )
            .await?;
        rows.iter().map(Sync::from_row).collect()
    }

    pub async fn set_sync_status(&self, id: i64, status: SyncStatus) -> Result<u64> {
        self.update(
            &Uri::sync(),
            ContentValues::new().put("status", status),
            Some(&Selection::new("id = ?").bind(id)),
        )
        .await
    }

    pub async fn set_sync_perm(&self, id: i64, perm: SyncPerm) -> Result<u64> {
        self.update(
            &Uri::sync(),
            ContentValues::new().put("perm", perm),
            Some(&Selection::new("id = ?").bind(id)),
        )
        .await
    }

    pub async fn set_sync_last_sync(&self, id: i64, time_stamp: i64) -> Result<u64> {
        self.update(
            &Uri::sync(),
            ContentValues::new().put("last_sync", time_stamp),
            Some(&Selection::new("id = ?").bind(id)),
        )
        .await
    }

    pub async fn set_sync_creator(&self, id: i64, device_id: i64) -> Result<u64> {
        self.update(
            &Uri::sync(),
            ContentValues::new().put("device_id", device_id),
            Some(&Selection::new("id = ?").bind(id)),
        )
        .await
    }
}

// Tree -------------------------------------------------------------------

impl MetaStore {
    pub async fn insert_tree(&self, tree: &Tree) -> Result<i64> {
        self.insert(&Uri::tree(), tree.values(), OnConflict::Abort)
            .await
    }

    pub async fn tree_by_uuid(&self, uuid: &str) -> Result<Option<Tree>> {
        let rows = self
            .query(
                &Uri::tree(),
                &[],
                Some(&Selection::new("uuid = ?").bind(uuid)),
                None,
            )
            .await?;
        rows.first().map(Tree::from_row).transpose()
    }

    pub async fn tree_by_id(&self, id: i64) -> Result<Option<Tree>> {
        let rows = self
            .query(
                &Uri::tree(),
                &[],
                Some(&Selection::new("id = ?").bind(id)),
                None,
            )
            .await?;
        rows.first().map(Tree::from_row).transpose()
    }

    pub async fn trees_of_sync(&self, sync_id: i64) -> Result<Vec<Tree>> {
        let rows = self
            .query(
                &Uri::tree(),
                &[],
                Some(
                    &Selection::new("sync_id = ? AND status = ?")
                        .bind(sync_id)
                        .bind(TreeStatus::Normal),
                ),
                Some("id"),
            )
            .await?;
        rows.iter().map(Tree::from_row).collect()
    }

    /// Trees mirrored on this device.
    pub async fn local_trees(&self) -> Result<Vec<Tree>> {
        let rows = self
            .query(
                &Uri::tree(),
                &[],
                Some(
                    &Selection::new("device_id = ? AND status = ?")
                        .bind(crate::constants::LOCAL_DEVICE_ID)
                        .bind(TreeStatus::Normal),
                ),
                Some("id"),
            )
            .await?;
        rows.iter().map(Tree::from_row).collect()
    }

    pub async fn set_tree_status(&self, id: i64, status: TreeStatus) -> Result<u64> {
        self.update(
            &Uri::tree(),
            ContentValues::new().put("status", status),
            Some(&Selection::new("id = ?").bind(id)),
        )
        .await
    }

    pub async fn set_tree_root(&self, id: i64, root: &str) -> Result<u64> {
        self.update(
            &Uri::tree(),
            ContentValues::new().put("root", root),
            Some(&Selection::new("id = ?").bind(id)),
        )
        .await
    }

    pub async fn set_tree_last_find(&self, id: i64, time_stamp: i64) -> Result<u64> {
        self.update(
            &Uri::tree(),
            ContentValues::new().put("last_find", time_stamp),
            Some(&Selection::new("id = ?").bind(id)),
        )
        .await
    }

    pub async fn set_tree_root_status(&self, id: i64, root_status: RootStatus) -> Result<u64> {
        self.update(
            &Uri::tree(),
            ContentValues::new().put("root_status", root_status),
            Some(&Selection::new("id = ?").bind(id)),
        )
        .await
    }

    pub async fn set_tree_enabled(&self, id: i64, is_enabled: bool) -> Result<u64> {
        self.update(
            &Uri::tree(),
            ContentValues::new().put("is_enabled", is_enabled),
            Some(&Selection::new("id = ?").bind(id)),
        )
        .await
    }

    pub async fn trees_with_missing_root(&self) -> Result<Vec<Tree>> {
        let rows = self
            .query(
                &Uri::tree(),
                &[],
                Some(
                    &Selection::new("root_status = ? AND status = ?")
                        .bind(RootStatus::Removed)
                        .bind(TreeStatus::Normal),
                ),
                Some("id"),
            )
            .await?;
        rows.iter().map(Tree::from_row).collect()
    }
}

// File -------------------------------------------------------------------

impl MetaStore {
    pub async fn file_by_path(&self, tree_uuid: &str, path: &str) -> Result<Option<FileEntry>> {
        let rows = self
            .query(
                &Uri::tree_file(tree_uuid),
                &[],
                Some(&Selection::new("path = ?").bind(path)),
                None,
            )
            .await?;
        rows.first().map(FileEntry::from_row).transpose()
    }

    /// File rows with `usn > since`, ordered by usn, at most `limit`.
    pub async fn files_since(
        &self,
        tree_uuid: &str,
        since: i64,
        limit: i64,
    ) -> Result<Vec<FileEntry>> {
        let table = file_table_name(tree_uuid);
        let sql = format!(
            "SELECT * FROM {table} WHERE usn > ? ORDER BY usn ASC LIMIT ?"
        );
        let rows = sqlx::query(&sql)
            .bind(since)
            .bind(limit)
            .fetch_all(self.pool())
            .await
            .map_err(|e| StoreError::Sqlx {
                reason: format!("files_since failed: {e}"),
                source: Some(e),
            })?;
        rows.iter()
            .map(|r| Self::decode_row(r).and_then(|row| FileEntry::from_row(&row)))
            .collect()
    }

    pub async fn files_all(&self, tree_uuid: &str) -> Result<Vec<FileEntry>> {
        let rows = self
            .query(&Uri::tree_file(tree_uuid), &[], None, Some("path"))
            .await?;
        rows.iter().map(FileEntry::from_row).collect()
    }

    /// Non-tombstone rows at or under `prefix` (database-fixed form).
    pub async fn files_normal_under(
        &self,
        tree_uuid: &str,
        prefix: &str,
    ) -> Result<Vec<FileEntry>> {
        let selection = Selection::new("status = ? AND (path = ? OR path LIKE ? ESCAPE '\\')")
            .bind(super::rows::FileStatus::Normal)
            .bind(prefix)
            .bind(path::descendants_pattern(prefix));
        let rows = self
            .query(&Uri::tree_file(tree_uuid), &[], Some(&selection), Some("path"))
            .await?;
        rows.iter().map(FileEntry::from_row).collect()
    }
}

// SyncList ---------------------------------------------------------------

impl MetaStore {
    pub async fn sync_list_paths(&self, tree_id: i64) -> Result<Vec<String>> {
        let rows = self
            .query(
                &Uri::sync_list(),
                &[],
                Some(&Selection::new("tree_id = ?").bind(tree_id)),
                Some("path"),
            )
            .await?;
        rows.iter()
            .map(|r| SyncListEntry::from_row(r).map(|e| e.path))
            .collect()
    }

    /// Insert a selective-sync path.
    ///
    /// Returns false when the path is already covered by an existing entry
    /// (itself or an ancestor). Entries underneath the new path are
    /// subsumed and removed.
    pub async fn sync_list_insert(&self, tree_id: i64, raw_path: &str) -> Result<bool> {
        let fixed = path::fix_path(raw_path);
        let existing = self.sync_list_paths(tree_id).await?;
        if existing
            .iter()
            .any(|p| path::is_self_or_descendant(&fixed, p))
        {
            return Ok(false);
        }

        let mut ops = vec![super::BatchOp::Delete {
            uri: Uri::sync_list(),
            selection: Some(
                Selection::new("tree_id = ? AND path LIKE ? ESCAPE '\\'")
                    .bind(tree_id)
                    .bind(path::descendants_pattern(&fixed)),
            ),
        }];
        ops.push(super::BatchOp::Insert {
            uri: Uri::sync_list(),
            values: ContentValues::new()
                .put("tree_id", tree_id)
                .put("path", fixed.as_str()),
            on_conflict: OnConflict::Ignore,
        });
        self.apply_batch(ops).await?;
        Ok(true)
    }

    /// Remove a selective-sync path; false when no such entry exists.
    pub async fn sync_list_remove(&self, tree_id: i64, raw_path: &str) -> Result<bool> {
        let fixed = path::fix_path(raw_path);
        let affected = self
            .delete(
                &Uri::sync_list(),
                Some(
                    &Selection::new("tree_id = ? AND path = ?")
                        .bind(tree_id)
                        .bind(fixed.as_str()),
                ),
            )
            .await?;
        Ok(affected > 0)
    }
}

// SyncMode ---------------------------------------------------------------

impl MetaStore {
    pub async fn set_pair_sync_mode(
        &self,
        local_tree_id: i64,
        remote_tree_id: i64,
        mode: SyncMode,
        sync_time_in_s: i64,
    ) -> Result<()> {
        let values = ContentValues::new()
            .put("local_tree_id", local_tree_id)
            .put("remote_tree_id", remote_tree_id)
            .put("sync_mode", mode)
            .put("sync_time_in_s", sync_time_in_s);
        self.insert(&Uri::sync_mode(), values, OnConflict::Replace)
            .await?;
        Ok(())
    }

    /// Scheduling mode of a pair; AUTO when never configured.
    pub async fn pair_sync_mode(
        &self,
        local_tree_id: i64,
        remote_tree_id: i64,
    ) -> Result<SyncModeEntry> {
        let rows = self
            .query(
                &Uri::sync_mode(),
                &[],
                Some(
                    &Selection::new("local_tree_id = ? AND remote_tree_id = ?")
                        .bind(local_tree_id)
                        .bind(remote_tree_id),
                ),
                None,
            )
            .await?;
        match rows.first() {
            Some(row) => SyncModeEntry::from_row(row),
            None => Ok(SyncModeEntry {
                local_tree_id,
                remote_tree_id,
                mode: SyncMode::Auto,
                sync_time_in_s: 0,
            }),
        }
    }
}

// ShareSync --------------------------------------------------------------

impl MetaStore {
    pub async fn set_share_perm(
        &self,
        device_id: i64,
        sync_id: i64,
        perm: SyncPerm,
    ) -> Result<()> {
        let values = ContentValues::new()
            .put("device_id", device_id)
            .put("sync_id", sync_id)
            .put("sync_perm", perm);
        self.insert(&Uri::share_sync(), values, OnConflict::Replace)
            .await?;
        Ok(())
    }

    pub async fn share_perm(&self, device_id: i64, sync_id: i64) -> Result<Option<SyncPerm>> {
        let rows = self
            .query(
                &Uri::share_sync(),
                &[],
                Some(
                    &Selection::new("device_id = ? AND sync_id = ?")
                        .bind(device_id)
                        .bind(sync_id),
                ),
                None,
            )
            .await?;
        Ok(rows
            .first()
            .map(ShareSyncEntry::from_row)
            .transpose()?
            .map(|e| e.sync_perm))
    }

    pub async fn shares_of_sync(&self, sync_id: i64) -> Result<Vec<ShareSyncEntry>> {
        let rows = self
            .query(
                &Uri::share_sync(),
                &[],
                Some(&Selection::new("sync_id = ?").bind(sync_id)),
                Some("device_id"),
            )
            .await?;
        rows.iter().map(ShareSyncEntry::from_row).collect()
    }

    pub async fn delete_share(&self, device_id: i64, sync_id: i64) -> Result<u64> {
        self.delete(
            &Uri::share_sync(),
            Some(
                &Selection::new("device_id = ? AND sync_id = ?")
                    .bind(device_id)
                    .bind(sync_id),
            ),
        )
        .await
    }
}

// DHTPeer ----------------------------------------------------------------

impl MetaStore {
    pub async fn store_peer(&self, peer: &DhtPeer) -> Result<()> {
        self.insert(&Uri::dht_peer(), peer.values(), OnConflict::Replace)
            .await?;
        Ok(())
    }

    pub async fn peers_by_info_hash(&self, info_hash: &str) -> Result<Vec<DhtPeer>> {
        let rows = self
            .query(
                &Uri::dht_peer(),
                &[],
                Some(&Selection::new("info_hash = ?").bind(info_hash)),
                Some("store_time DESC"),
            )
            .await?;
        rows.iter().map(DhtPeer::from_row).collect()
    }

    pub async fn all_peers(&self) -> Result<Vec<DhtPeer>> {
        let rows = self
            .query(&Uri::dht_peer(), &[], None, Some("store_time DESC"))
            .await?;
        rows.iter().map(DhtPeer::from_row).collect()
    }

    /// Drop peers last seen at or before `cutoff`.
    pub async fn expire_peers(&self, cutoff: i64) -> Result<u64> {
        self.delete(
            &Uri::dht_peer(),
            Some(&Selection::new("store_time <= ?").bind(cutoff)),
        )
        .await
    }

    pub async fn clear_peers(&self) -> Result<u64> {
        self.delete(&Uri::dht_peer(), None).await
    }
}

// Config -----------------------------------------------------------------

impl MetaStore {
    pub async fn config_get(&self, key: &str) -> Result<Option<String>> {
        let rows = self
            .query(
                &Uri::config(),
                &["value"],
                Some(&Selection::new("key = ?").bind(key)),
                None,
            )
            .await?;
        Ok(match rows.first() {
            Some(row) => Some(row.get_str("value")?.to_string()),
            None => None,
        })
    }

    pub async fn config_set(&self, key: &str, value: &str) -> Result<()> {
        let values = ContentValues::new().put("key", key).put("value", value);
        self.insert(&Uri::config(), values, OnConflict::Replace)
            .await?;
        Ok(())
    }
}
