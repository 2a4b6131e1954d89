//! Peer discovery server.
//!
//! Runs one background task driven by periodic timers:
//! broadcast (10 s) to the multicast group and static peers, DHT announce
//! (18 s) with a per-info-hash latch, super-node ping (60 s), and peer
//! expiry (60 s). Replies upsert DHTPeer rows and emit an IssueDeviceInfo
//! request so the outer pool exchanges identities with the new endpoint.

mod errors;

pub use errors::DiscoveryError;

use std::collections::{HashMap, HashSet};
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;

use tokio::net::UdpSocket;
use tokio::sync::{mpsc, oneshot};
use tokio::time::interval;
use tracing::{Instrument, debug, info, info_span, warn};

use crate::clock::Clock;
use crate::config::Config;
use crate::constants::{
    BROADCAST_INTERVAL, DHT_ANNOUNCE_INTERVAL, DISCOVER_MULTICAST_ADDR, PEER_EXPIRED_TIME_IN_S,
    PEER_EXPIRY_INTERVAL, SUPERNODE_PING_INTERVAL,
};
use crate::crypto;
use crate::proto::{DiscoverFrame, DiscoverKind, IssueDeviceInfo, RequestBody};
use crate::store::{DhtPeer, MetaStore, StaticPeer, SyncType};
use crate::Result;

/// Commands accepted by the discovery task.
pub enum DiscoverCommand {
    /// Stop timers and close the socket (mobile background).
    SetBackground {
        response: oneshot::Sender<()>,
    },
    /// Rebind and rearm after `SetBackground`.
    SetForeground {
        response: oneshot::Sender<Result<()>>,
    },
    /// Rebind to a new discover port; the old socket stays bound on failure.
    SetPort {
        port: u16,
        response: oneshot::Sender<Result<()>>,
    },
    /// Replace the static peer probe set.
    SetStaticPeers {
        peers: Vec<StaticPeer>,
    },
    /// Shut the task down.
    Shutdown,
}

impl std::fmt::Debug for DiscoverCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SetBackground { .. } => write!(f, "SetBackground"),
            Self::SetForeground { .. } => write!(f, "SetForeground"),
            Self::SetPort { port, .. } => f.debug_struct("SetPort").field("port", port).finish(),
            Self::SetStaticPeers { peers } => f
                .debug_struct("SetStaticPeers")
                .field("count", &peers.len())
                .finish(),
            Self::Shutdown => write!(f, "Shutdown"),
        }
    }
}

/// DHT-style events folded into the discovery state machine.
#[derive(Debug)]
pub enum DhtEvent {
    BroadcastRequest {
        info_hash: [u8; crypto::INFO_HASH_LENGTH],
        from: SocketAddr,
        peer_port: u16,
    },
    BroadcastReply {
        info_hash: [u8; crypto::INFO_HASH_LENGTH],
        from: SocketAddr,
        peer_port: u16,
        is_lan: bool,
    },
    SearchDone {
        info_hash: [u8; crypto::INFO_HASH_LENGTH],
    },
}

/// Announce latch: only one in-flight announce per info-hash.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AnnounceState {
    Idle,
    Announcing,
}

/// Handle to the discovery task.
pub struct DiscoverServer {
    command_tx: mpsc::Sender<DiscoverCommand>,
}

impl DiscoverServer {
    /// Bind the discover port and start the background task.
    ///
    /// `inner_tx` receives the IssueDeviceInfo requests produced for found
    /// peers; the router's inner pool consumes them.
    pub async fn start(
        store: Arc<MetaStore>,
        config: Arc<Config>,
        clock: Arc<dyn Clock>,
        static_peers: Vec<StaticPeer>,
        inner_tx: mpsc::Sender<RequestBody>,
    ) -> Result<Self> {
        let port = config.discover_port();
        let socket = bind_discover_socket(port).await?;
        info!(port, "Discovery socket bound");

        let (command_tx, command_rx) = mpsc::channel(16);
        let task = DiscoverLoop {
            store,
            config,
            clock,
            socket: Some(Arc::new(socket)),
            command_rx,
            inner_tx,
            static_peers: static_peers.into_iter().collect(),
            announce_state: HashMap::new(),
            supernode_endpoints: Vec::new(),
        };
        tokio::spawn(task.run().instrument(info_span!("discover_server")));
        Ok(Self { command_tx })
    }

    pub async fn set_background(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.send(DiscoverCommand::SetBackground { response: tx })
            .await?;
        rx.await.map_err(|_| DiscoveryError::TaskGone.into())
    }

    pub async fn set_foreground(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.send(DiscoverCommand::SetForeground { response: tx })
            .await?;
        rx.await.map_err(|_| DiscoveryError::TaskGone)?
    }

    pub async fn set_port(&self, port: u16) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.send(DiscoverCommand::SetPort {
            port,
            response: tx,
        })
        .await?;
        rx.await.map_err(|_| DiscoveryError::TaskGone)?
    }

    pub async fn set_static_peers(&self, peers: Vec<StaticPeer>) -> Result<()> {
        self.send(DiscoverCommand::SetStaticPeers { peers }).await
    }

    pub async fn shutdown(&self) {
        let _ = self.command_tx.send(DiscoverCommand::Shutdown).await;
    }

    async fn send(&self, command: DiscoverCommand) -> Result<()> {
        self.command_tx
            .send(command)
            .await
            .map_err(|_| DiscoveryError::TaskGone.into())
    }
}

async fn bind_discover_socket(port: u16) -> Result<UdpSocket> {
    let socket = UdpSocket::bind(("0.0.0.0", port)).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::AddrInUse {
            DiscoveryError::AddrInUse { port }
        } else {
            DiscoveryError::Bind {
                port,
                reason: e.to_string(),
            }
        }
    })?;
    let group: Ipv4Addr = DISCOVER_MULTICAST_ADDR.parse().expect("fixed multicast addr");
    if let Err(e) = socket.join_multicast_v4(group, Ipv4Addr::UNSPECIFIED) {
        // Broadcast still works towards static peers and the tracker.
        warn!("Failed to join multicast group: {e}");
    }
    Ok(socket)
}

struct DiscoverLoop {
    store: Arc<MetaStore>,
    config: Arc<Config>,
    clock: Arc<dyn Clock>,
    socket: Option<Arc<UdpSocket>>,
    command_rx: mpsc::Receiver<DiscoverCommand>,
    inner_tx: mpsc::Sender<RequestBody>,
    static_peers: HashSet<StaticPeer>,
    announce_state: HashMap<String, AnnounceState>,
    /// udp endpoints returned by the super-node, pinged on announce.
    supernode_endpoints: Vec<SocketAddr>,
}

impl DiscoverLoop {
    async fn run(mut self) {
        let mut broadcast_tick = interval(BROADCAST_INTERVAL);
        let mut announce_tick = interval(DHT_ANNOUNCE_INTERVAL);
        let mut supernode_tick = interval(SUPERNODE_PING_INTERVAL);
        let mut expiry_tick = interval(PEER_EXPIRY_INTERVAL);

        loop {
            let socket = self.socket.clone();
            tokio::select! {
                Some(command) = self.command_rx.recv() => {
                    if self.handle_command(command).await {
                        info!("Discovery server shutting down");
                        break;
                    }
                }

                result = recv_on(socket.clone()), if socket.is_some() => {
                    match result {
                        Ok((data, from)) => self.handle_datagram(&data, from).await,
                        Err(e) => debug!("Discovery recv error: {e}"),
                    }
                }

                _ = broadcast_tick.tick() => {
                    if self.socket.is_some() {
                        self.broadcast_round().await;
                        self.probe_static_peers().await;
                    }
                }

                _ = announce_tick.tick() => {
                    if self.socket.is_some() {
                        self.announce_round().await;
                    }
                }

                _ = supernode_tick.tick() => {
                    if self.socket.is_some() {
                        self.supernode_round().await;
                    }
                }

                _ = expiry_tick.tick() => {
                    if self.socket.is_some() {
                        self.expire_peers().await;
                    }
                }

                else => break,
            }
        }
    }

    /// Returns true when the loop should exit.
    async fn handle_command(&mut self, command: DiscoverCommand) -> bool {
        match command {
            DiscoverCommand::SetBackground { response } => {
                self.socket = None;
                self.announce_state.clear();
                let _ = response.send(());
            }
            DiscoverCommand::SetForeground { response } => {
                let result = match bind_discover_socket(self.config.discover_port()).await {
                    Ok(socket) => {
                        self.socket = Some(Arc::new(socket));
                        Ok(())
                    }
                    Err(e) => Err(e),
                };
                let _ = response.send(result);
            }
            DiscoverCommand::SetPort { port, response } => {
                let result = match bind_discover_socket(port).await {
                    Ok(socket) => {
                        // New socket accepting: drop the old one, clear the
                        // peer cache and start over.
                        self.socket = Some(Arc::new(socket));
                        self.announce_state.clear();
                        if let Err(e) = self.store.clear_peers().await {
                            warn!("Failed to clear peer cache on port change: {e}");
                        }
                        Ok(())
                    }
                    Err(e) => Err(e),
                };
                let _ = response.send(result);
            }
            DiscoverCommand::SetStaticPeers { peers } => {
                self.static_peers = peers.into_iter().collect();
            }
            DiscoverCommand::Shutdown => return true,
        }
        false
    }

    /// Info-hashes this device currently answers for: the account hash plus
    /// one per shared sync.
    async fn local_info_hashes(&self) -> Vec<[u8; crypto::INFO_HASH_LENGTH]> {
        let mut hashes = Vec::new();
        let account = self.config.account_name();
        if !account.is_empty() {
            hashes.push(crypto::account_info_hash(&account));
        }
        match self.store.list_syncs().await {
            Ok(syncs) => {
                for sync in syncs.iter().filter(|s| s.kind == SyncType::Shared) {
                    hashes.push(crypto::sync_info_hash(&sync.uuid));
                }
            }
            Err(e) => warn!("Failed to list syncs for discovery: {e}"),
        }
        hashes
    }

    async fn broadcast_round(&mut self) {
        let Some(socket) = self.socket.clone() else {
            return;
        };
        let port = self.config.discover_port();
        let route_port = self.config.route_port();
        let group: Ipv4Addr = DISCOVER_MULTICAST_ADDR.parse().expect("fixed multicast addr");
        for info_hash in self.local_info_hashes().await {
            let frame = DiscoverFrame {
                kind: DiscoverKind::Broadcast,
                info_hash,
                peer_port: route_port,
            };
            if let Err(e) = socket.send_to(&frame.encode(), (group, port)).await {
                debug!("Broadcast send failed: {e}");
            }
        }
    }

    async fn probe_static_peers(&mut self) {
        let Some(socket) = self.socket.clone() else {
            return;
        };
        let route_port = self.config.route_port();
        let hashes = self.local_info_hashes().await;
        for peer in &self.static_peers {
            for info_hash in &hashes {
                let frame = DiscoverFrame {
                    kind: DiscoverKind::Broadcast,
                    info_hash: *info_hash,
                    peer_port: route_port,
                };
                if let Err(e) = socket
                    .send_to(&frame.encode(), (peer.ip.as_str(), peer.port))
                    .await
                {
                    debug!(peer = %peer.ip, "Static peer probe failed: {e}");
                }
            }
        }
    }

    /// Publish each idle info-hash to the overlay (known peers plus the
    /// super-node endpoints), latching it until its search completes.
    async fn announce_round(&mut self) {
        let Some(socket) = self.socket.clone() else {
            return;
        };
        let route_port = self.config.route_port();
        for info_hash in self.local_info_hashes().await {
            let key = hex::encode(info_hash);
            let state = self
                .announce_state
                .entry(key.clone())
                .or_insert(AnnounceState::Idle);
            if *state == AnnounceState::Announcing {
                continue;
            }
            *state = AnnounceState::Announcing;

            let frame = DiscoverFrame {
                kind: DiscoverKind::Broadcast,
                info_hash,
                peer_port: route_port,
            };
            let bytes = frame.encode();

            let peers = self.store.peers_by_info_hash(&key).await.unwrap_or_default();
            for peer in peers {
                let target = (peer.peer_host.as_str(), peer.peer_port as u16);
                if let Err(e) = socket.send_to(&bytes, target).await {
                    debug!(peer = %peer.peer_host, "Announce send failed: {e}");
                }
            }
            for endpoint in &self.supernode_endpoints {
                let _ = socket.send_to(&bytes, *endpoint).await;
            }

            // The round is our search; completing it unlatches the hash.
            self.on_dht_event(DhtEvent::SearchDone { info_hash }).await;
        }
    }

    /// POST our IPv4 endpoints to the tracker and ping the endpoints it
    /// returns (`udp://host:port` lines).
    async fn supernode_round(&mut self) {
        let host = self.config.report_host();
        if host.is_empty() {
            return;
        }
        let url = format!("http://{host}/supernode");
        let body = format!("port={}", self.config.route_port());
        let response = match reqwest::Client::new().post(&url).body(body).send().await {
            Ok(r) => r,
            Err(e) => {
                debug!("Super-node ping failed: {e}");
                return;
            }
        };
        if !response.status().is_success() {
            debug!(status = %response.status(), "Super-node ping rejected");
            return;
        }
        let text = response.text().await.unwrap_or_default();
        self.supernode_endpoints = text
            .lines()
            .filter_map(|line| line.trim().strip_prefix("udp://"))
            .filter_map(|hostport| hostport.parse::<SocketAddr>().ok())
            .collect();
        debug!(
            endpoints = self.supernode_endpoints.len(),
            "Super-node endpoints refreshed"
        );

        // Ping them so NAT mappings open up.
        if let Some(socket) = self.socket.clone() {
            let route_port = self.config.route_port();
            for info_hash in self.local_info_hashes().await {
                let frame = DiscoverFrame {
                    kind: DiscoverKind::Broadcast,
                    info_hash,
                    peer_port: route_port,
                };
                for endpoint in &self.supernode_endpoints {
                    let _ = socket.send_to(&frame.encode(), *endpoint).await;
                }
            }
        }
    }

    async fn expire_peers(&mut self) {
        let now = self.clock.now_secs();
        match self.store.expire_peers(now - PEER_EXPIRED_TIME_IN_S).await {
            Ok(0) => {}
            Ok(n) => debug!(expired = n, "Dropped stale discovered peers"),
            Err(e) => warn!("Peer expiry failed: {e}"),
        }

        // Failing endpoints past the offline threshold go away; a device
        // left without endpoints goes offline.
        let cutoff = now - crate::constants::DEVICE_NO_RESP_OFFLINE_TIMEOUT_IN_S;
        if let Err(e) = self.store.delete_expired_ips(cutoff).await {
            warn!("Endpoint expiry failed: {e}");
            return;
        }
        let devices = match self.store.list_devices().await {
            Ok(devices) => devices,
            Err(e) => {
                warn!("Device sweep failed: {e}");
                return;
            }
        };
        for device in devices {
            if device.id == crate::constants::LOCAL_DEVICE_ID
                || device.id == crate::constants::NULL_DEVICE_ID
                || device.status == crate::store::DeviceStatus::Offline
            {
                continue;
            }
            match self.store.device_ips(device.id).await {
                Ok(ips) if ips.is_empty() => {
                    if let Err(e) = self
                        .store
                        .set_device_status(device.id, crate::store::DeviceStatus::Offline)
                        .await
                    {
                        warn!(device = %device.uuid, "Offline transition failed: {e}");
                    } else {
                        info!(device = %device.uuid, "Device expired to offline");
                    }
                }
                Ok(_) => {}
                Err(e) => warn!("Endpoint query failed: {e}"),
            }
        }
    }

    async fn handle_datagram(&mut self, data: &[u8], from: SocketAddr) {
        let frame = match DiscoverFrame::parse(data) {
            Ok(frame) => frame,
            Err(_) => {
                debug!(from = %from, "Ignoring malformed discovery datagram");
                return;
            }
        };
        // Our own multicast loops back; a sender announcing our route port
        // is ourselves.
        if frame.peer_port == self.config.route_port() && from.ip().is_loopback() {
            return;
        }
        let event = match frame.kind {
            DiscoverKind::Broadcast => DhtEvent::BroadcastRequest {
                info_hash: frame.info_hash,
                from,
                peer_port: frame.peer_port,
            },
            DiscoverKind::BroadcastReply => DhtEvent::BroadcastReply {
                info_hash: frame.info_hash,
                from,
                peer_port: frame.peer_port,
                is_lan: true,
            },
        };
        self.on_dht_event(event).await;
    }

    /// Fold one event into peer state.
    pub(crate) async fn on_dht_event(&mut self, event: DhtEvent) {
        match event {
            DhtEvent::BroadcastRequest {
                info_hash,
                from,
                peer_port,
            } => {
                // Reply only when we hold the hash; unknown-account peers
                // get the stranger hash back so they can tell we exist
                // without learning the account.
                let ours = self.local_info_hashes().await;
                let reply_hash = if ours.contains(&info_hash) {
                    info_hash
                } else {
                    crypto::stranger_info_hash()
                };
                let frame = DiscoverFrame {
                    kind: DiscoverKind::BroadcastReply,
                    info_hash: reply_hash,
                    peer_port: self.config.route_port(),
                };
                if let Some(socket) = &self.socket
                    && let Err(e) = socket.send_to(&frame.encode(), from).await
                {
                    debug!("Broadcast reply failed: {e}");
                }
                // The requester is itself a usable peer.
                self.store_peer(info_hash, from, peer_port, true).await;
            }
            DhtEvent::BroadcastReply {
                info_hash,
                from,
                peer_port,
                is_lan,
            } => {
                self.store_peer(info_hash, from, peer_port, is_lan).await;
            }
            DhtEvent::SearchDone { info_hash } => {
                self.announce_state
                    .insert(hex::encode(info_hash), AnnounceState::Idle);
            }
        }
    }

    async fn store_peer(
        &mut self,
        info_hash: [u8; crypto::INFO_HASH_LENGTH],
        from: SocketAddr,
        peer_port: u16,
        is_lan: bool,
    ) {
        let peer = DhtPeer {
            info_hash: hex::encode(info_hash),
            peer_host: from.ip().to_string(),
            peer_port: peer_port as i64,
            peer_is_ipv6: from.is_ipv6(),
            is_lan,
            store_time: self.clock.now_secs(),
        };
        if let Err(e) = self.store.store_peer(&peer).await {
            warn!("Failed to store discovered peer: {e}");
            return;
        }
        debug!(host = %peer.peer_host, port = peer.peer_port, "Stored discovered peer");

        // Hand the endpoint to the outer pool for identity exchange.
        let issue = RequestBody::IssueDeviceInfo(IssueDeviceInfo {
            host: peer.peer_host.clone(),
            port: peer.peer_port as u16,
            is_ipv6: peer.peer_is_ipv6,
        });
        if self.inner_tx.send(issue).await.is_err() {
            debug!("Inner queue closed; dropping peer-found event");
        }
    }
}

async fn recv_on(socket: Option<Arc<UdpSocket>>) -> std::io::Result<(Vec<u8>, SocketAddr)> {
    match socket {
        Some(socket) => {
            let mut buf = vec![0u8; 1500];
            let (len, from) = socket.recv_from(&mut buf).await?;
            buf.truncate(len);
            Ok((buf, from))
        }
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;
    use crate::constants::DEVICE_NO_RESP_OFFLINE_TIMEOUT_IN_S;
    use crate::store::{Device, DeviceStatus};

    async fn test_loop(clock: Arc<FixedClock>) -> (DiscoverLoop, Arc<MetaStore>) {
        let store = Arc::new(MetaStore::open_in_memory().await.unwrap());
        let config = Config::load(Arc::clone(&store)).await.unwrap();
        let (inner_tx, _inner_rx) = mpsc::channel(8);
        let (_command_tx, command_rx) = mpsc::channel(8);
        let looper = DiscoverLoop {
            store: Arc::clone(&store),
            config,
            clock,
            socket: None,
            command_rx,
            inner_tx,
            static_peers: HashSet::new(),
            announce_state: HashMap::new(),
            supernode_endpoints: Vec::new(),
        };
        (looper, store)
    }

    #[tokio::test]
    async fn expiry_drops_stale_peers_and_offlines_devices() {
        let clock = Arc::new(FixedClock::default());
        let (mut looper, store) = test_loop(Arc::clone(&clock)).await;

        store
            .store_peer(&DhtPeer {
                info_hash: hex::encode(crypto::account_info_hash("alice")),
                peer_host: "192.0.2.1".to_string(),
                peer_port: 8848,
                peer_is_ipv6: false,
                is_lan: true,
                store_time: clock.now_secs(),
            })
            .await
            .unwrap();

        // A device whose only endpoint started failing now.
        let device = Device {
            id: 0,
            uuid: "dev-b".to_string(),
            name: "B".to_string(),
            route_port: 8848,
            data_port: 8849,
            status: DeviceStatus::Online,
            platform: String::new(),
            is_mine: true,
            backup_dst_root: String::new(),
            version: 1,
        };
        let device_id = store.insert_device(&device).await.unwrap();
        store
            .upsert_device_ip(device_id, "192.0.2.1", false)
            .await
            .unwrap();
        store
            .mark_ip_no_response(device_id, "192.0.2.1", clock.now_secs())
            .await
            .unwrap();

        // Inside the window nothing happens.
        looper.expire_peers().await;
        assert_eq!(store.all_peers().await.unwrap().len(), 1);
        assert_eq!(store.device_ips(device_id).await.unwrap().len(), 1);
        assert_eq!(
            store.device_by_id(device_id).await.unwrap().unwrap().status,
            DeviceStatus::Online
        );

        // Past both thresholds the peer row, the failing endpoint, and the
        // device's ONLINE status all go.
        let past = PEER_EXPIRED_TIME_IN_S.max(DEVICE_NO_RESP_OFFLINE_TIMEOUT_IN_S) + 1;
        clock.advance_secs(past as u64);
        looper.expire_peers().await;
        assert!(store.all_peers().await.unwrap().is_empty());
        assert!(store.device_ips(device_id).await.unwrap().is_empty());
        assert_eq!(
            store.device_by_id(device_id).await.unwrap().unwrap().status,
            DeviceStatus::Offline
        );
    }

    #[tokio::test]
    async fn healthy_endpoints_survive_the_sweep() {
        let clock = Arc::new(FixedClock::default());
        let (mut looper, store) = test_loop(Arc::clone(&clock)).await;

        let device = Device {
            id: 0,
            uuid: "dev-c".to_string(),
            name: "C".to_string(),
            route_port: 8848,
            data_port: 8849,
            status: DeviceStatus::Online,
            platform: String::new(),
            is_mine: true,
            backup_dst_root: String::new(),
            version: 1,
        };
        let device_id = store.insert_device(&device).await.unwrap();
        // One healthy endpoint (no failure mark).
        store
            .upsert_device_ip(device_id, "192.0.2.9", false)
            .await
            .unwrap();

        clock.advance_secs((DEVICE_NO_RESP_OFFLINE_TIMEOUT_IN_S + 1) as u64);
        looper.expire_peers().await;

        assert_eq!(store.device_ips(device_id).await.unwrap().len(), 1);
        assert_eq!(
            store.device_by_id(device_id).await.unwrap().unwrap().status,
            DeviceStatus::Online
        );
    }
}
