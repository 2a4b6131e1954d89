//! Shared fixtures: in-memory stores, full in-process device nodes, and
//! filesystem scratch trees.

use std::path::Path;
use std::sync::Arc;

use tokio::sync::{broadcast, mpsc};

use driftsync::clock::{Clock, SystemClock};
use driftsync::config::Config;
use driftsync::events::{
    EngineEvent, EventListener, EventNotifier, TreePairStatus, TreeStatus,
};
use driftsync::refresh::{RefreshPool, RefreshTask};
use driftsync::router::Router;
use driftsync::rpc::OuterHandler;
use driftsync::store::{
    BackupType, Device, DeviceStatus, MetaStore, PlainStore, RootStatus, Sync, SyncPerm,
    SyncStatus, SyncType, Tree, TreeStatus as TreeRowStatus,
};
use driftsync::sync::{SyncDeps, SyncPool};
use driftsync::transfer::TransferServer;

pub async fn setup_store() -> Arc<MetaStore> {
    Arc::new(MetaStore::open_in_memory().await.expect("open store"))
}

pub async fn setup_config(store: &Arc<MetaStore>, account: &str) -> Arc<Config> {
    let config = Config::load(Arc::clone(store)).await.expect("load config");
    config
        .set_account(account, "password")
        .await
        .expect("set account");
    config
}

/// Event listener that forwards engine events into a channel.
pub struct ChannelListener(pub mpsc::UnboundedSender<EngineEvent>);

impl EventListener for ChannelListener {
    fn on_tree_status(&self, _status: &TreeStatus) {}
    fn on_tree_pair_status(&self, _status: &TreePairStatus) {}
    fn on_event(&self, event: &EngineEvent) {
        let _ = self.0.send(event.clone());
    }
}

/// A complete in-process device: store, config, pools, router, transfer.
/// Discovery stays out; tests wire peers into the store directly. Fields
/// that are never read still keep their services alive for the test.
#[allow(dead_code)]
pub struct Node {
    pub store: Arc<MetaStore>,
    pub plain: Arc<PlainStore>,
    pub config: Arc<Config>,
    pub events: Arc<EventNotifier>,
    pub refresh: Arc<RefreshPool>,
    pub sync_pool: Arc<SyncPool>,
    pub router: Arc<Router>,
    pub transfer: Arc<TransferServer>,
    pub shutdown: broadcast::Sender<()>,
    pub events_rx: mpsc::UnboundedReceiver<EngineEvent>,
    pub root: tempfile::TempDir,
    pub cache: tempfile::TempDir,
}

async fn free_tcp_port() -> u16 {
    let listener = tokio::net::TcpListener::bind(("127.0.0.1", 0))
        .await
        .expect("probe port");
    let port = listener.local_addr().expect("local addr").port();
    drop(listener);
    port
}

pub async fn start_node(account: &str, device_name: &str) -> Node {
    let store = setup_store().await;
    let plain = Arc::new(PlainStore::open_in_memory().await.expect("open plain"));
    let config = setup_config(&store, account).await;
    config.set_device_name(device_name).await.expect("name");
    config
        .set_route_port(free_tcp_port().await as i64)
        .await
        .expect("route port");
    config
        .set_data_port(free_tcp_port().await as i64)
        .await
        .expect("data port");

    // The fixed self row.
    let self_row = Device {
        id: driftsync::constants::LOCAL_DEVICE_ID,
        uuid: config.device_uuid(),
        name: device_name.to_string(),
        route_port: config.route_port() as i64,
        data_port: config.data_port() as i64,
        status: DeviceStatus::Online,
        platform: std::env::consts::OS.to_string(),
        is_mine: true,
        backup_dst_root: String::new(),
        version: 1,
    };
    store
        .insert_device_with_id(&self_row)
        .await
        .expect("self row");

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let events = EventNotifier::start(Arc::new(ChannelListener(events_tx)), Arc::clone(&clock));
    let (shutdown, _) = broadcast::channel(4);

    let cache = tempfile::tempdir().expect("cache dir");
    let transfer = TransferServer::start(
        Arc::clone(&store),
        Arc::clone(&config),
        Arc::clone(&events),
        cache.path().to_path_buf(),
        shutdown.clone(),
    )
    .await
    .expect("transfer server");

    let refresh = RefreshPool::start(
        Arc::clone(&store),
        Arc::clone(&config),
        Arc::clone(&events),
        Arc::clone(&clock),
        shutdown.clone(),
    );

    let sync_pool = SyncPool::start(
        Arc::new(SyncDeps {
            store: Arc::clone(&store),
            plain: Arc::clone(&plain),
            config: Arc::clone(&config),
            clock: Arc::clone(&clock),
            events: Arc::clone(&events),
            transfer: Arc::clone(&transfer),
        }),
        shutdown.clone(),
    );

    let handler = Arc::new(OuterHandler {
        store: Arc::clone(&store),
        config: Arc::clone(&config),
        clock: Arc::clone(&clock),
        events: Arc::clone(&events),
        sync_pool: Arc::clone(&sync_pool),
        refresh_pool: Arc::clone(&refresh),
    });

    let router = Router::start(
        Arc::clone(&store),
        Arc::clone(&config),
        handler,
        shutdown.clone(),
    )
    .await
    .expect("router");

    Node {
        store,
        plain,
        config,
        events,
        refresh,
        sync_pool,
        router,
        transfer,
        shutdown,
        events_rx,
        root: tempfile::tempdir().expect("tree root"),
        cache,
    }
}

impl Node {
    /// Create a sync row with the given uuid (creator unset).
    pub async fn add_sync(&self, uuid: &str, name: &str) -> i64 {
        let row = Sync {
            id: 0,
            uuid: uuid.to_string(),
            name: name.to_string(),
            last_sync: 0,
            kind: SyncType::Normal,
            status: SyncStatus::Normal,
            device_id: driftsync::constants::NULL_DEVICE_ID,
            perm: SyncPerm::Rdwr,
            restore_share_perm: SyncPerm::Rdwr,
        };
        self.store.insert_sync(&row).await.expect("insert sync")
    }

    /// Create a local tree over this node's scratch root.
    pub async fn add_local_tree(&self, sync_id: i64, uuid: &str) -> i64 {
        self.add_local_tree_as(sync_id, uuid, BackupType::None).await
    }

    /// Create a local tree with an explicit backup role.
    pub async fn add_local_tree_as(
        &self,
        sync_id: i64,
        uuid: &str,
        backup_type: BackupType,
    ) -> i64 {
        let row = Tree {
            id: 0,
            uuid: uuid.to_string(),
            root: self.root.path().display().to_string(),
            device_id: driftsync::constants::LOCAL_DEVICE_ID,
            sync_id,
            status: TreeRowStatus::Normal,
            last_find: 0,
            backup_type,
            is_enabled: true,
            root_status: RootStatus::Normal,
        };
        let id = self.store.insert_tree(&row).await.expect("insert tree");
        self.store
            .ensure_file_table(uuid)
            .await
            .expect("file table");
        id
    }

    /// Record another node as a known device reachable over loopback, and
    /// mirror its tree row. Returns the local id of the remote tree row.
    pub async fn add_peer(&self, peer: &Node, sync_id: i64, peer_tree_uuid: &str) -> i64 {
        self.add_peer_as(peer, sync_id, peer_tree_uuid, BackupType::None)
            .await
    }

    /// Like [`Node::add_peer`] with an explicit backup role for the
    /// mirrored tree row.
    pub async fn add_peer_as(
        &self,
        peer: &Node,
        sync_id: i64,
        peer_tree_uuid: &str,
        backup_type: BackupType,
    ) -> i64 {
        let device = Device {
            id: 0,
            uuid: peer.config.device_uuid(),
            name: peer.config.device_name(),
            route_port: peer.config.route_port() as i64,
            data_port: peer.config.data_port() as i64,
            status: DeviceStatus::Online,
            platform: std::env::consts::OS.to_string(),
            is_mine: true,
            backup_dst_root: String::new(),
            version: 1,
        };
        let device_id = self.store.insert_device(&device).await.expect("peer row");
        self.store
            .upsert_device_ip(device_id, "127.0.0.1", false)
            .await
            .expect("peer ip");

        let row = Tree {
            id: 0,
            uuid: peer_tree_uuid.to_string(),
            root: String::new(),
            device_id,
            sync_id,
            status: TreeRowStatus::Normal,
            last_find: 0,
            backup_type,
            is_enabled: true,
            root_status: RootStatus::Normal,
        };
        self.store.insert_tree(&row).await.expect("peer tree")
    }

    /// Wait for the next SyncFinished event of the given pair.
    pub async fn wait_sync_finished(&mut self, local: i64, remote: i64) -> Option<String> {
        let deadline = tokio::time::Duration::from_secs(30);
        tokio::time::timeout(deadline, async {
            loop {
                match self.events_rx.recv().await {
                    Some(EngineEvent::SyncFinished {
                        local_tree_id,
                        remote_tree_id,
                        error,
                    }) if local_tree_id == local && remote_tree_id == remote => {
                        return error;
                    }
                    Some(_) => continue,
                    None => return Some("event channel closed".to_string()),
                }
            }
        })
        .await
        .unwrap_or(Some("timed out waiting for sync".to_string()))
    }

    /// Run a full refresh of a tree inline.
    pub async fn refresh_tree(&self, tree_id: i64) -> u64 {
        self.refresh
            .run_once(RefreshTask {
                tree_id,
                subtree: None,
            })
            .await
            .expect("refresh")
    }
}

pub fn write_file(root: &Path, rel: &str, contents: &[u8]) {
    let path = root.join(rel);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).expect("mkdir");
    }
    std::fs::write(path, contents).expect("write file");
}

pub fn read_file(root: &Path, rel: &str) -> Vec<u8> {
    std::fs::read(root.join(rel)).expect("read file")
}
