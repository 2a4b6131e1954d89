//! The kernel façade: lifecycle, timers, and the public operation surface.
//!
//! `Kernel` is one of the two process-wide singletons (the other is the
//! config service it owns). `initialize` prepares the on-disk state,
//! `startup` constructs every service and arms the timers, `shutdown`
//! tears them down over the broadcast bus. Every operation on a
//! non-started kernel returns the not-startup error.

mod api;
mod errors;

pub use api::{DiscoveredDevice, LicencesInfo};
pub use errors::KernelError;

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::AtomicI64;
use std::sync::{Arc, Mutex as StdMutex};

use tokio::sync::broadcast;
use tracing::{Instrument, debug, info, info_span, warn};

use crate::clock::{Clock, SystemClock};
use crate::config::Config;
use crate::constants::{
    LOCAL_DEVICE_ID, NULL_DEVICE_ID, TREE_ROOT_CHECK_INTERVAL,
};
use crate::crypto;
use crate::discovery::{DiscoverServer, DiscoveryError};
use crate::events::{EventListener, EventNotifier};
use crate::proto::{IssueRefresh, RequestBody, SyncIssue};
use crate::query::QueryCache;
use crate::refresh::RefreshPool;
use crate::router::Router;
use crate::rpc::OuterHandler;
use crate::store::{
    BackupType, Device, DeviceStatus, MetaStore, PlainStore, StaticPeer, SyncMode, TreeStatus,
};
use crate::sync::{SyncDeps, SyncPool};
use crate::transfer::TransferServer;
use crate::Result;

const MAIN_DB: &str = "driftsync.secure.db";
const PLAIN_DB: &str = "driftsync.plain.db";

/// Everything a running engine owns. Dropped on shutdown.
pub(crate) struct Engine {
    pub(crate) store: Arc<MetaStore>,
    pub(crate) plain: Arc<PlainStore>,
    pub(crate) config: Arc<Config>,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) events: Arc<EventNotifier>,
    pub(crate) transfer: Arc<TransferServer>,
    pub(crate) refresh_pool: Arc<RefreshPool>,
    pub(crate) sync_pool: Arc<SyncPool>,
    pub(crate) router: Arc<Router>,
    pub(crate) discovery: DiscoverServer,
    pub(crate) query: Arc<QueryCache>,
    pub(crate) shutdown: broadcast::Sender<()>,
    pub(crate) static_peers: StdMutex<Vec<StaticPeer>>,
    pub(crate) discover_sessions: StdMutex<HashMap<i64, i64>>,
    pub(crate) next_session_id: AtomicI64,
}

/// The process-wide kernel.
pub struct Kernel {
    engine: tokio::sync::RwLock<Option<Arc<Engine>>>,
    clock: Arc<dyn Clock>,
}

impl Default for Kernel {
    fn default() -> Self {
        Self::new()
    }
}

impl Kernel {
    pub fn new() -> Self {
        Self {
            engine: tokio::sync::RwLock::new(None),
            clock: Arc::new(SystemClock),
        }
    }

    /// Kernel with an injected clock (offline-timeout tests).
    #[cfg(any(test, feature = "testing"))]
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            engine: tokio::sync::RwLock::new(None),
            clock,
        }
    }

    pub(crate) async fn engine(&self) -> Result<Arc<Engine>> {
        self.engine
            .read()
            .await
            .as_ref()
            .cloned()
            .ok_or_else(|| KernelError::NotStartup.into())
    }

    /// Prepare the on-disk state: databases, identity, account.
    pub async fn initialize(
        &self,
        appdata: &Path,
        username: &str,
        password: &str,
        backup_root: Option<&str>,
        mac_token: Option<&str>,
    ) -> Result<()> {
        let database_dir = appdata.join("Database");
        tokio::fs::create_dir_all(&database_dir).await?;
        tokio::fs::create_dir_all(appdata.join("Cache")).await?;

        let plain = PlainStore::open(&database_dir.join(PLAIN_DB)).await?;
        let seed = crypto::passphrase_seed(mac_token.unwrap_or(""));
        plain
            .misc_set(crate::store::MISC_KEY_PASSPHRASE_SEED, &seed)
            .await?;

        let store = Arc::new(MetaStore::open(&database_dir.join(MAIN_DB), Some(&seed)).await?);
        let config = Config::load(Arc::clone(&store)).await?;
        config.set_account(username, password).await?;
        if let Some(root) = backup_root {
            config.set_backup_root(root).await?;
        }
        if let Some(token) = mac_token {
            config.set_mac_token(token).await?;
        }

        // The fixed self row and the creator-unset placeholder.
        let self_row = Device {
            id: LOCAL_DEVICE_ID,
            uuid: config.device_uuid(),
            name: config.device_name(),
            route_port: 0,
            data_port: 0,
            status: DeviceStatus::Online,
            platform: std::env::consts::OS.to_string(),
            is_mine: true,
            backup_dst_root: config.backup_root(),
            version: 1,
        };
        store.insert_device_with_id(&self_row).await?;
        let placeholder = Device {
            id: NULL_DEVICE_ID,
            uuid: format!("null-{}", config.device_uuid()),
            name: String::new(),
            route_port: 0,
            data_port: 0,
            status: DeviceStatus::Offline,
            platform: String::new(),
            is_mine: false,
            backup_dst_root: String::new(),
            version: 0,
        };
        store.insert_device_with_id(&placeholder).await?;

        info!(appdata = %appdata.display(), "Kernel initialized");
        Ok(())
    }

    /// Construct every service and arm the timers.
    pub async fn startup(
        &self,
        appdata: &Path,
        discover_port: u16,
        listener: Arc<dyn EventListener>,
        tree_root_prefix: Option<&str>,
        mac_token: Option<&str>,
    ) -> Result<()> {
        let mut engine_slot = self.engine.write().await;
        if engine_slot.is_some() {
            return Ok(());
        }

        // Probe the discover port before any state is written, so a
        // collision leaves nothing behind.
        match tokio::net::UdpSocket::bind(("0.0.0.0", discover_port)).await {
            Ok(probe) => drop(probe),
            Err(e) if e.kind() == std::io::ErrorKind::AddrInUse => {
                return Err(DiscoveryError::AddrInUse {
                    port: discover_port,
                }
                .into());
            }
            Err(e) => {
                return Err(DiscoveryError::Bind {
                    port: discover_port,
                    reason: e.to_string(),
                }
                .into());
            }
        }

        let database_dir = appdata.join("Database");
        let plain = Arc::new(PlainStore::open(&database_dir.join(PLAIN_DB)).await?);
        let seed = plain
            .misc_get(crate::store::MISC_KEY_PASSPHRASE_SEED)
            .await?
            .unwrap_or_else(|| crypto::passphrase_seed(""));
        let store = Arc::new(MetaStore::open(&database_dir.join(MAIN_DB), Some(&seed)).await?);
        let config = Config::load(Arc::clone(&store)).await?;

        config.set_discover_port(discover_port as i64).await?;
        if let Some(prefix) = tree_root_prefix {
            config.set_tree_root_prefix(prefix).await?;
        }
        if let Some(token) = mac_token {
            config.set_mac_token(token).await?;
        }
        if config.route_port() == 0 {
            config.set_route_port(free_tcp_port().await? as i64).await?;
        }
        if config.data_port() == 0 {
            config.set_data_port(free_tcp_port().await? as i64).await?;
        }

        // Keep the self row's ports current.
        if let Some(mut self_row) = store.device_by_id(LOCAL_DEVICE_ID).await? {
            self_row.route_port = config.route_port() as i64;
            self_row.data_port = config.data_port() as i64;
            self_row.status = DeviceStatus::Online;
            store.update_device(&self_row).await?;
        }

        let (shutdown, _) = broadcast::channel(4);
        let clock = Arc::clone(&self.clock);
        let events = EventNotifier::start(listener, Arc::clone(&clock));

        let transfer = TransferServer::start(
            Arc::clone(&store),
            Arc::clone(&config),
            Arc::clone(&events),
            appdata.join("Cache"),
            shutdown.clone(),
        )
        .await?;

        let refresh_pool = RefreshPool::start(
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
            refresh_pool: Arc::clone(&refresh_pool),
        });

        let router = Router::start(
            Arc::clone(&store),
            Arc::clone(&config),
            handler,
            shutdown.clone(),
        )
        .await?;

        let static_peers = plain.load_static_peers().await?;
        let discovery = DiscoverServer::start(
            Arc::clone(&store),
            Arc::clone(&config),
            Arc::clone(&clock),
            static_peers.clone(),
            router.inner_sender(),
        )
        .await?;

        let query = QueryCache::start(Arc::clone(&store));

        let engine = Arc::new(Engine {
            store,
            plain,
            config,
            clock,
            events,
            transfer,
            refresh_pool,
            sync_pool,
            router,
            discovery,
            query,
            shutdown: shutdown.clone(),
            static_peers: StdMutex::new(static_peers),
            discover_sessions: StdMutex::new(HashMap::new()),
            next_session_id: AtomicI64::new(1),
        });

        spawn_timers(Arc::clone(&engine));

        *engine_slot = Some(engine);
        info!("Kernel started");
        Ok(())
    }

    /// Announce exit, stop every service, and drop the engine.
    pub async fn shutdown(&self) -> Result<()> {
        let Some(engine) = self.engine.write().await.take() else {
            return Ok(());
        };

        // Tell reachable account peers we are leaving.
        let exit = RequestBody::AnnounceExit {
            device_uuid: engine.config.device_uuid(),
        };
        if let Ok(devices) = engine.store.list_devices().await {
            for device in devices {
                if device.id == LOCAL_DEVICE_ID
                    || device.id == NULL_DEVICE_ID
                    || !device.is_mine
                    || device.status != DeviceStatus::Online
                {
                    continue;
                }
                let _ = crate::rpc::issue::issue_to_device(
                    &engine.store,
                    &engine.config,
                    &engine.clock,
                    &engine.events,
                    &device,
                    &exit,
                )
                .await;
            }
        }

        engine.discovery.shutdown().await;
        engine.router.stop();
        let _ = engine.shutdown.send(());
        info!("Kernel stopped");
        Ok(())
    }
}

/// Periodic work: refresh + auto-sync on the sync interval, device info
/// for discovered peers, and the tree-root checker.
fn spawn_timers(engine: Arc<Engine>) {
    let auto = Arc::clone(&engine);
    tokio::spawn(
        async move {
            let mut shutdown = auto.shutdown.subscribe();
            loop {
                let interval = auto.config.sync_interval_in_s().max(5) as u64;
                tokio::select! {
                    _ = tokio::time::sleep(std::time::Duration::from_secs(interval)) => {}
                    _ = shutdown.recv() => break,
                }
                let inner = auto.router.inner_sender();
                let _ = inner
                    .send(RequestBody::IssueRefresh(IssueRefresh { tree_id: None }))
                    .await;
                // Exchange identities with everything discovery has found.
                if let Ok(peers) = auto.store.all_peers().await {
                    for peer in peers {
                        let _ = inner
                            .send(RequestBody::IssueDeviceInfo(
                                crate::proto::IssueDeviceInfo {
                                    host: peer.peer_host,
                                    port: peer.peer_port as u16,
                                    is_ipv6: peer.peer_is_ipv6,
                                },
                            ))
                            .await;
                    }
                }
                if let Err(e) = enqueue_auto_sync(&auto).await {
                    warn!("Auto-sync scheduling failed: {e}");
                }
            }
        }
        .instrument(info_span!("auto_sync_timer")),
    );

    let root_check = Arc::clone(&engine);
    tokio::spawn(
        async move {
            let mut shutdown = root_check.shutdown.subscribe();
            let mut tick = tokio::time::interval(TREE_ROOT_CHECK_INTERVAL);
            tick.tick().await;
            loop {
                tokio::select! {
                    _ = tick.tick() => {}
                    _ = shutdown.recv() => break,
                }
                let trees = match root_check.store.trees_with_missing_root().await {
                    Ok(trees) => trees,
                    Err(e) => {
                        warn!("Tree root check query failed: {e}");
                        continue;
                    }
                };
                for tree in trees {
                    if Path::new(&tree.root).is_dir() {
                        debug!(tree = tree.id, "Missing root reappeared");
                        let _ = root_check
                            .router
                            .inner_sender()
                            .send(RequestBody::IssueRefresh(IssueRefresh {
                                tree_id: Some(tree.id),
                            }))
                            .await;
                    }
                }
            }
        }
        .instrument(info_span!("tree_root_checker")),
    );
}

/// Enqueue Sync issues for every auto-eligible pair.
async fn enqueue_auto_sync(engine: &Arc<Engine>) -> Result<()> {
    let now = engine.clock.now_secs();
    for local in engine.store.local_trees().await? {
        if !local.is_enabled || local.backup_type == BackupType::Src {
            continue;
        }
        let Some(sync) = engine.store.sync_by_id(local.sync_id).await? else {
            continue;
        };
        for remote in engine.store.trees_of_sync(local.sync_id).await? {
            if remote.device_id == LOCAL_DEVICE_ID || remote.status != TreeStatus::Normal {
                continue;
            }
            let mode = engine.store.pair_sync_mode(local.id, remote.id).await?;
            let due = match mode.mode {
                SyncMode::Auto => true,
                SyncMode::Manual => false,
                SyncMode::Timer => now - sync.last_sync >= mode.sync_time_in_s,
            };
            if due {
                let _ = engine
                    .router
                    .inner_sender()
                    .send(RequestBody::Sync(SyncIssue {
                        local_tree_id: local.id,
                        remote_tree_id: remote.id,
                        is_manual: false,
                    }))
                    .await;
            }
        }
    }
    Ok(())
}

async fn free_tcp_port() -> Result<u16> {
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", 0)).await?;
    let port = listener.local_addr()?.port();
    drop(listener);
    Ok(port)
}
