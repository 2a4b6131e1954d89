//! Typed rows for the metadata store tables.
//!
//! Small value types per table; each knows how to read itself out of a
//! [`SqlRow`] and render itself into [`ContentValues`]. Status enums are
//! persisted as integers and carried on the wire, so they derive serde.

use serde::{Deserialize, Serialize};

use super::errors::StoreError;
use super::provider::{ContentValues, SqlRow, SqlValue};
use crate::Result;
use crate::vclock::VClock;

fn bad(column: &str) -> crate::Error {
    StoreError::BadColumn {
        column: column.to_string(),
    }
    .into()
}

macro_rules! int_enum {
    ($(#[$meta:meta])* $name:ident { $($variant:ident = $value:expr),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub fn as_i64(self) -> i64 {
                match self {
                    $($name::$variant => $value),+
                }
            }

            pub fn from_i64(v: i64) -> Option<Self> {
                match v {
                    $($value => Some($name::$variant),)+
                    _ => None,
                }
            }
        }

        impl From<$name> for SqlValue {
            fn from(v: $name) -> SqlValue {
                SqlValue::Integer(v.as_i64())
            }
        }
    };
}

int_enum!(
    /// Reachability of a device.
    DeviceStatus {
        Online = 0,
        Offline = 1,
    }
);

int_enum!(
    /// Kind of a sync relationship.
    SyncType {
        Normal = 0,
        Shared = 1,
        Backup = 2,
    }
);

int_enum!(
    /// Lifecycle status of a sync (soft delete via Removed).
    SyncStatus {
        Normal = 0,
        Removed = 1,
        Vclock = 2,
    }
);

int_enum!(
    /// Permission a peer holds on a sync.
    SyncPerm {
        Rdonly = 0,
        Wronly = 1,
        Rdwr = 2,
        Disconnect = 3,
        TokenDiff = 4,
    }
);

int_enum!(
    /// Lifecycle status of a tree.
    TreeStatus {
        Normal = 0,
        Remove = 1,
        Vclock = 2,
    }
);

int_enum!(
    /// Role of a tree inside a backup sync.
    BackupType {
        None = 0,
        Src = 1,
        Dst = 2,
    }
);

int_enum!(
    /// Whether the tree root currently exists on disk.
    RootStatus {
        Normal = 0,
        Removed = 1,
    }
);

int_enum!(
    /// Kind of a file row.
    FileKind {
        Regular = 0,
        Directory = 1,
    }
);

int_enum!(
    /// Lifecycle status of a file row (Remove rows are tombstones).
    FileStatus {
        Normal = 0,
        Remove = 1,
    }
);

int_enum!(
    /// When a tree pair synchronizes.
    SyncMode {
        Auto = 0,
        Manual = 1,
        Timer = 2,
    }
);

/// A device participating in the account (or a share stranger).
#[derive(Debug, Clone, PartialEq)]
pub struct Device {
    pub id: i64,
    pub uuid: String,
    pub name: String,
    pub route_port: i64,
    pub data_port: i64,
    pub status: DeviceStatus,
    pub platform: String,
    pub is_mine: bool,
    pub backup_dst_root: String,
    pub version: i64,
}

impl Device {
    pub fn from_row(row: &SqlRow) -> Result<Self> {
        Ok(Self {
            id: row.get_i64("id")?,
            uuid: row.get_str("uuid")?.to_string(),
            name: row.get_str("name")?.to_string(),
            route_port: row.get_i64("route_port")?,
            data_port: row.get_i64("data_port")?,
            status: DeviceStatus::from_i64(row.get_i64("status")?).ok_or_else(|| bad("status"))?,
            platform: row.get_str("platform")?.to_string(),
            is_mine: row.get_bool("is_mine")?,
            backup_dst_root: row.get_str("backup_dst_root")?.to_string(),
            version: row.get_i64("version")?,
        })
    }

    pub fn values(&self) -> ContentValues {
        ContentValues::new()
            .put("id", self.id)
            .put("uuid", self.uuid.as_str())
            .put("name", self.name.as_str())
            .put("route_port", self.route_port)
            .put("data_port", self.data_port)
            .put("status", self.status)
            .put("platform", self.platform.as_str())
            .put("is_mine", self.is_mine)
            .put("backup_dst_root", self.backup_dst_root.as_str())
            .put("version", self.version)
    }
}

/// One known endpoint of a device.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceIp {
    pub id: i64,
    pub device_id: i64,
    pub ip: String,
    pub is_ipv6: bool,
    /// Unix seconds of the first unanswered request, None when healthy.
    pub earliest_no_response_time: Option<i64>,
}

impl DeviceIp {
    pub fn from_row(row: &SqlRow) -> Result<Self> {
        Ok(Self {
            id: row.get_i64("id")?,
            device_id: row.get_i64("device_id")?,
            ip: row.get_str("ip")?.to_string(),
            is_ipv6: row.get_bool("is_ipv6")?,
            earliest_no_response_time: row.get_opt_i64("earliest_no_response_time")?,
        })
    }

    pub fn values(&self) -> ContentValues {
        ContentValues::new()
            .put("device_id", self.device_id)
            .put("ip", self.ip.as_str())
            .put("is_ipv6", self.is_ipv6)
            .put("earliest_no_response_time", self.earliest_no_response_time)
    }
}

/// A sync relationship (the unit of sharing).
#[derive(Debug, Clone, PartialEq)]
pub struct Sync {
    pub id: i64,
    pub uuid: String,
    pub name: String,
    pub last_sync: i64,
    pub kind: SyncType,
    pub status: SyncStatus,
    /// Creator device id; NULL_DEVICE_ID when not yet known.
    pub device_id: i64,
    pub perm: SyncPerm,
    pub restore_share_perm: SyncPerm,
}

impl Sync {
    pub fn from_row(row: &SqlRow) -> Result<Self> {
        Ok(Self {
            id: row.get_i64("id")?,
            uuid: row.get_str("uuid")?.to_string(),
            name: row.get_str("name")?.to_string(),
            last_sync: row.get_i64("last_sync")?,
            kind: SyncType::from_i64(row.get_i64("type")?).ok_or_else(|| bad("type"))?,
            status: SyncStatus::from_i64(row.get_i64("status")?).ok_or_else(|| bad("status"))?,
            device_id: row.get_i64("device_id")?,
            perm: SyncPerm::from_i64(row.get_i64("perm")?).ok_or_else(|| bad("perm"))?,
            restore_share_perm: SyncPerm::from_i64(row.get_i64("restore_share_perm")?)
                .ok_or_else(|| bad("restore_share_perm"))?,
        })
    }

    pub fn values(&self) -> ContentValues {
        ContentValues::new()
            .put("uuid", self.uuid.as_str())
            .put("name", self.name.as_str())
            .put("last_sync", self.last_sync)
            .put("type", self.kind)
            .put("status", self.status)
            .put("device_id", self.device_id)
            .put("perm", self.perm)
            .put("restore_share_perm", self.restore_share_perm)
    }
}

/// A directory tree mirroring one sync on one device.
#[derive(Debug, Clone, PartialEq)]
pub struct Tree {
    pub id: i64,
    pub uuid: String,
    pub root: String,
    pub device_id: i64,
    pub sync_id: i64,
    pub status: TreeStatus,
    pub last_find: i64,
    pub backup_type: BackupType,
    pub is_enabled: bool,
    pub root_status: RootStatus,
}

impl Tree {
    pub fn from_row(row: &SqlRow) -> Result<Self> {
        Ok(Self {
            id: row.get_i64("id")?,
            uuid: row.get_str("uuid")?.to_string(),
            root: row.get_str("root")?.to_string(),
            device_id: row.get_i64("device_id")?,
            sync_id: row.get_i64("sync_id")?,
            status: TreeStatus::from_i64(row.get_i64("status")?).ok_or_else(|| bad("status"))?,
            last_find: row.get_i64("last_find")?,
            backup_type: BackupType::from_i64(row.get_i64("backup_type")?)
                .ok_or_else(|| bad("backup_type"))?,
            is_enabled: row.get_bool("is_enabled")?,
            root_status: RootStatus::from_i64(row.get_i64("root_status")?)
                .ok_or_else(|| bad("root_status"))?,
        })
    }

    pub fn values(&self) -> ContentValues {
        ContentValues::new()
            .put("uuid", self.uuid.as_str())
            .put("root", self.root.as_str())
            .put("device_id", self.device_id)
            .put("sync_id", self.sync_id)
            .put("status", self.status)
            .put("last_find", self.last_find)
            .put("backup_type", self.backup_type)
            .put("is_enabled", self.is_enabled)
            .put("root_status", self.root_status)
    }
}

/// One file or directory inside a tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileEntry {
    pub id: i64,
    /// Database-fixed relative path.
    pub path: String,
    pub kind: FileKind,
    pub status: FileStatus,
    pub mtime: i64,
    pub length: i64,
    pub usn: i64,
    /// Hex digest for regular files, empty for directories.
    pub sha1: String,
    /// UUID of the device that produced this version.
    pub modifier: String,
    pub win_attr: i64,
    pub unix_attr: i64,
    pub vclock: VClock,
    pub alias: String,
    pub time_stamp: i64,
}

impl FileEntry {
    pub fn from_row(row: &SqlRow) -> Result<Self> {
        Ok(Self {
            id: row.get_i64("id")?,
            path: row.get_str("path")?.to_string(),
            kind: FileKind::from_i64(row.get_i64("type")?).ok_or_else(|| bad("type"))?,
            status: FileStatus::from_i64(row.get_i64("status")?).ok_or_else(|| bad("status"))?,
            mtime: row.get_i64("mtime")?,
            length: row.get_i64("length")?,
            usn: row.get_i64("usn")?,
            sha1: row.get_str("sha1")?.to_string(),
            modifier: row.get_str("modifier")?.to_string(),
            win_attr: row.get_i64("win_attr")?,
            unix_attr: row.get_i64("unix_attr")?,
            vclock: VClock::new(row.get_i64("local_vclock")?, row.get_i64("remote_vclock")?),
            alias: row.get_str("alias")?.to_string(),
            time_stamp: row.get_i64("time_stamp")?,
        })
    }

    /// Column values, without id and usn (both assigned by the store).
    pub fn values(&self) -> ContentValues {
        ContentValues::new()
            .put("path", self.path.as_str())
            .put("type", self.kind)
            .put("status", self.status)
            .put("mtime", self.mtime)
            .put("length", self.length)
            .put("sha1", self.sha1.as_str())
            .put("modifier", self.modifier.as_str())
            .put("win_attr", self.win_attr)
            .put("unix_attr", self.unix_attr)
            .put("local_vclock", self.vclock.local)
            .put("remote_vclock", self.vclock.remote)
            .put("alias", self.alias.as_str())
            .put("time_stamp", self.time_stamp)
    }

    /// Whether this row is a deletion tombstone.
    pub fn is_tombstone(&self) -> bool {
        self.status == FileStatus::Remove
    }
}

/// One selective-sync entry.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncListEntry {
    pub id: i64,
    pub tree_id: i64,
    pub path: String,
}

impl SyncListEntry {
    pub fn from_row(row: &SqlRow) -> Result<Self> {
        Ok(Self {
            id: row.get_i64("id")?,
            tree_id: row.get_i64("tree_id")?,
            path: row.get_str("path")?.to_string(),
        })
    }
}

/// Per-pair sync scheduling mode.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncModeEntry {
    pub local_tree_id: i64,
    pub remote_tree_id: i64,
    pub mode: SyncMode,
    pub sync_time_in_s: i64,
}

impl SyncModeEntry {
    pub fn from_row(row: &SqlRow) -> Result<Self> {
        Ok(Self {
            local_tree_id: row.get_i64("local_tree_id")?,
            remote_tree_id: row.get_i64("remote_tree_id")?,
            mode: SyncMode::from_i64(row.get_i64("sync_mode")?).ok_or_else(|| bad("sync_mode"))?,
            sync_time_in_s: row.get_i64("sync_time_in_s")?,
        })
    }
}

/// Permission granted to one peer on one shared sync.
#[derive(Debug, Clone, PartialEq)]
pub struct ShareSyncEntry {
    pub device_id: i64,
    pub sync_id: i64,
    pub sync_perm: SyncPerm,
}

impl ShareSyncEntry {
    pub fn from_row(row: &SqlRow) -> Result<Self> {
        Ok(Self {
            device_id: row.get_i64("device_id")?,
            sync_id: row.get_i64("sync_id")?,
            sync_perm: SyncPerm::from_i64(row.get_i64("sync_perm")?)
                .ok_or_else(|| bad("sync_perm"))?,
        })
    }
}

/// A peer learned through discovery, keyed by info-hash.
#[derive(Debug, Clone, PartialEq)]
pub struct DhtPeer {
    /// Hex of the 20-byte info-hash.
    pub info_hash: String,
    pub peer_host: String,
    pub peer_port: i64,
    pub peer_is_ipv6: bool,
    pub is_lan: bool,
    /// Unix seconds the peer was last seen.
    pub store_time: i64,
}

impl DhtPeer {
    pub fn from_row(row: &SqlRow) -> Result<Self> {
        Ok(Self {
            info_hash: row.get_str("info_hash")?.to_string(),
            peer_host: row.get_str("peer_host")?.to_string(),
            peer_port: row.get_i64("peer_port")?,
            peer_is_ipv6: row.get_bool("peer_is_ipv6")?,
            is_lan: row.get_bool("is_lan")?,
            store_time: row.get_i64("store_time")?,
        })
    }

    pub fn values(&self) -> ContentValues {
        ContentValues::new()
            .put("info_hash", self.info_hash.as_str())
            .put("peer_host", self.peer_host.as_str())
            .put("peer_port", self.peer_port)
            .put("peer_is_ipv6", self.peer_is_ipv6)
            .put("is_lan", self.is_lan)
            .put("store_time", self.store_time)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enum_round_trip() {
        for v in [
            SyncPerm::Rdonly,
            SyncPerm::Wronly,
            SyncPerm::Rdwr,
            SyncPerm::Disconnect,
            SyncPerm::TokenDiff,
        ] {
            assert_eq!(SyncPerm::from_i64(v.as_i64()), Some(v));
        }
        assert_eq!(SyncPerm::from_i64(99), None);
        assert_eq!(FileKind::from_i64(1), Some(FileKind::Directory));
        assert_eq!(RootStatus::from_i64(1), Some(RootStatus::Removed));
    }
}
