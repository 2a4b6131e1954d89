//! URIs addressing the store's tables.
//!
//! Every table has a stable URI under the `driftsync` authority. Observers
//! subscribe to a URI prefix; mutations notify the URI of the table (or of
//! the per-tree file table) they changed.

use std::fmt;

use super::errors::StoreError;

/// Authority component shared by all store URIs.
pub const AUTHORITY: &str = "driftsync";

/// A store URI: `driftsync/<table>[/<qualifier>]`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Uri(String);

impl Uri {
    /// The Device table.
    pub fn device() -> Self {
        Uri(format!("{AUTHORITY}/device"))
    }

    /// The DeviceIP table.
    pub fn device_ip() -> Self {
        Uri(format!("{AUTHORITY}/device_ip"))
    }

    /// The Sync table.
    pub fn sync() -> Self {
        Uri(format!("{AUTHORITY}/sync"))
    }

    /// The Tree table.
    pub fn tree() -> Self {
        Uri(format!("{AUTHORITY}/tree"))
    }

    /// The per-tree file table of `tree_uuid`.
    pub fn tree_file(tree_uuid: &str) -> Self {
        Uri(format!("{AUTHORITY}/tree_file/{tree_uuid}"))
    }

    /// Prefix matching every per-tree file table.
    pub fn tree_file_root() -> Self {
        Uri(format!("{AUTHORITY}/tree_file"))
    }

    /// The SyncList table.
    pub fn sync_list() -> Self {
        Uri(format!("{AUTHORITY}/sync_list"))
    }

    /// The SyncMode table.
    pub fn sync_mode() -> Self {
        Uri(format!("{AUTHORITY}/sync_mode"))
    }

    /// The ShareSync table.
    pub fn share_sync() -> Self {
        Uri(format!("{AUTHORITY}/share_sync"))
    }

    /// The DHTPeer table.
    pub fn dht_peer() -> Self {
        Uri(format!("{AUTHORITY}/dht_peer"))
    }

    /// The Config table.
    pub fn config() -> Self {
        Uri(format!("{AUTHORITY}/config"))
    }

    /// Whether this URI equals `prefix` or lies underneath it.
    pub fn is_under(&self, prefix: &Uri) -> bool {
        self.0 == prefix.0
            || (self.0.starts_with(&prefix.0) && self.0.as_bytes().get(prefix.0.len()) == Some(&b'/'))
    }

    /// Resolve the SQL table this URI addresses.
    pub fn table(&self) -> Result<String, StoreError> {
        let rest = self
            .0
            .strip_prefix(AUTHORITY)
            .and_then(|s| s.strip_prefix('/'))
            .ok_or_else(|| StoreError::UnknownUri {
                uri: self.0.clone(),
            })?;
        match rest {
            "device" => Ok("device".into()),
            "device_ip" => Ok("device_ip".into()),
            "sync" => Ok("sync".into()),
            "tree" => Ok("tree".into()),
            "sync_list" => Ok("sync_list".into()),
            "sync_mode" => Ok("sync_mode".into()),
            "share_sync" => Ok("share_sync".into()),
            "dht_peer" => Ok("dht_peer".into()),
            "config" => Ok("config".into()),
            other => match other.strip_prefix("tree_file/") {
                Some(uuid) if !uuid.is_empty() => Ok(file_table_name(uuid)),
                _ => Err(StoreError::UnknownUri {
                    uri: self.0.clone(),
                }),
            },
        }
    }
}

impl fmt::Display for Uri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// SQL table name of a per-tree file table.
///
/// Tree UUIDs contain `-` which is not valid in an identifier, so the table
/// name flattens them to `_`.
pub fn file_table_name(tree_uuid: &str) -> String {
    format!("file_{}", tree_uuid.replace('-', "_"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefix_matching() {
        let all_files = Uri::tree_file_root();
        let one = Uri::tree_file("ab-cd");
        assert!(one.is_under(&all_files));
        assert!(one.is_under(&one));
        assert!(!all_files.is_under(&one));
        assert!(!Uri::device().is_under(&Uri::device_ip()));
    }

    #[test]
    fn table_resolution() {
        assert_eq!(Uri::device().table().unwrap(), "device");
        assert_eq!(
            Uri::tree_file("bb2c-8b44").table().unwrap(),
            "file_bb2c_8b44"
        );
        assert!(Uri::tree_file_root().table().is_err());
    }
}
