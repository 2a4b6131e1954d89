//! Read-through cache over the aggregate sync/backup views.
//!
//! Assembling a `SyncInfo` touches four tables; the public query API calls
//! for it constantly. The cache holds assembled aggregates and registers
//! as an observer on the contributing URIs; any commit touching them
//! drops the affected aggregates, so readers re-assemble on next access
//! and never block writers.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};

use tracing::debug;

use crate::store::{
    ContentProvider, Device, MetaStore, ShareSyncEntry, Sync, SyncType, Tree, Uri,
};
use crate::Result;

/// One tree plus the device mirroring it.
#[derive(Debug, Clone)]
pub struct TreeInfo {
    pub tree: Tree,
    pub device: Option<Device>,
}

/// Aggregate view of one sync.
#[derive(Debug, Clone)]
pub struct SyncInfo {
    pub sync: Sync,
    pub creator: Option<Device>,
    pub trees: Vec<TreeInfo>,
    pub shares: Vec<ShareSyncEntry>,
}

/// The query cache.
pub struct QueryCache {
    store: Arc<MetaStore>,
    cache: Arc<StdMutex<HashMap<i64, Arc<SyncInfo>>>>,
}

impl QueryCache {
    /// Build the cache and start its invalidation observer.
    pub fn start(store: Arc<MetaStore>) -> Arc<Self> {
        let cache: Arc<StdMutex<HashMap<i64, Arc<SyncInfo>>>> =
            Arc::new(StdMutex::new(HashMap::new()));

        for uri in [Uri::sync(), Uri::tree(), Uri::share_sync(), Uri::device()] {
            let mut handle = store.register_observer(uri, false);
            let cache = Arc::clone(&cache);
            tokio::spawn(async move {
                while let Some(changed) = handle.changed().await {
                    debug!(uri = %changed, "Query cache invalidated");
                    cache.lock().unwrap().clear();
                }
            });
        }

        Arc::new(Self { store, cache })
    }

    /// Aggregate for one sync, read-through.
    pub async fn sync_info(&self, sync_id: i64) -> Result<Option<Arc<SyncInfo>>> {
        if let Some(hit) = self.cache.lock().unwrap().get(&sync_id) {
            return Ok(Some(Arc::clone(hit)));
        }
        let sync = match self.store.sync_by_id(sync_id).await? {
            Some(sync) if sync.status == crate::store::SyncStatus::Normal => sync,
            _ => return Ok(None),
        };
        let info = Arc::new(self.assemble(sync).await?);
        self.cache
            .lock()
            .unwrap()
            .insert(sync_id, Arc::clone(&info));
        Ok(Some(info))
    }

    /// All normal (non-backup) syncs.
    pub async fn list_sync_info(&self) -> Result<Vec<Arc<SyncInfo>>> {
        self.list_of_kinds(&[SyncType::Normal, SyncType::Shared])
            .await
    }

    /// All backup syncs.
    pub async fn list_backup_info(&self) -> Result<Vec<Arc<SyncInfo>>> {
        self.list_of_kinds(&[SyncType::Backup]).await
    }

    async fn list_of_kinds(&self, kinds: &[SyncType]) -> Result<Vec<Arc<SyncInfo>>> {
        let mut out = Vec::new();
        for sync in self.store.list_syncs().await? {
            if !kinds.contains(&sync.kind) {
                continue;
            }
            if let Some(info) = self.sync_info(sync.id).await? {
                out.push(info);
            }
        }
        Ok(out)
    }

    async fn assemble(&self, sync: Sync) -> Result<SyncInfo> {
        let creator = if sync.device_id == crate::constants::NULL_DEVICE_ID {
            None
        } else {
            self.store.device_by_id(sync.device_id).await?
        };
        let mut trees = Vec::new();
        for tree in self.store.trees_of_sync(sync.id).await? {
            let device = self.store.device_by_id(tree.device_id).await?;
            trees.push(TreeInfo { tree, device });
        }
        let shares = self.store.shares_of_sync(sync.id).await?;
        Ok(SyncInfo {
            sync,
            creator,
            trees,
            shares,
        })
    }
}
