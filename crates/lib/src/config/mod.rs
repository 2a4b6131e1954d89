//! Process-wide configuration and identity.
//!
//! One `Config` service is constructed at startup. Reads come from an
//! in-memory snapshot; every mutation writes the Config table and the
//! snapshot under a single mutex, so the two can never diverge. The
//! account key lives only in memory (derived from the account name); the
//! password never persists, only its token digest.

mod errors;

pub use errors::ConfigError;

use std::sync::{Arc, RwLock};

use tokio::sync::Mutex;
use tracing::info;

use crate::constants::{
    DEFAULT_DOWNLOAD_CACHE_VOLUME, DEFAULT_INNER_WORKERS, DEFAULT_OUTER_WORKERS,
    DEFAULT_REFRESH_WORKERS, DEFAULT_SYNC_INTERVAL_IN_S, DEFAULT_SYNC_WORKERS,
    DEFAULT_TRANSFER_THREADS,
};
use crate::crypto;
use crate::store::MetaStore;
use crate::Result;

// Config table keys.
pub const KEY_USERNAME: &str = "USERNAME";
pub const KEY_TOKEN_SHA1: &str = "TOKEN_SHA1";
pub const KEY_DEVICE_UUID: &str = "DEVICE_UUID";
pub const KEY_DEVICE_NAME: &str = "DEVICE_NAME";
pub const KEY_DISCOVER_PORT: &str = "DISCOVER_PORT";
pub const KEY_ROUTE_PORT: &str = "ROUTE_PORT";
pub const KEY_DATA_PORT: &str = "DATA_PORT";
pub const KEY_SYNC_INTERVAL: &str = "SYNC_INTERVAL";
pub const KEY_BACKUP_ROOT: &str = "BACKUP_ROOT";
pub const KEY_TREE_ROOT_PREFIX: &str = "TREE_ROOT_PREFIX";
pub const KEY_REPORT_HOST: &str = "REPORT_HOST";
pub const KEY_CA_CERT: &str = "CA_CERT";
pub const KEY_MAC_TOKEN: &str = "MAC_TOKEN";
pub const KEY_DOWNLOAD_CACHE_VOLUME: &str = "DOWNLOAD_CACHE_VOLUME";
pub const KEY_TRANSFER_THREADS: &str = "TRANSFER_THREADS";

/// In-memory snapshot of the configuration.
#[derive(Debug, Clone)]
struct ConfigState {
    device_uuid: String,
    device_name: String,
    account_name: String,
    token_sha1: String,
    account_key: Option<[u8; crypto::KEY_LENGTH]>,
    discover_port: u16,
    route_port: u16,
    data_port: u16,
    sync_interval_in_s: i64,
    backup_root: String,
    tree_root_prefix: String,
    report_host: String,
    ca_cert: String,
    mac_token: String,
    download_cache_volume: i64,
    transfer_threads: usize,
    refresh_workers: usize,
    sync_workers: usize,
    outer_workers: usize,
    inner_workers: usize,
}

impl Default for ConfigState {
    fn default() -> Self {
        Self {
            device_uuid: String::new(),
            device_name: String::new(),
            account_name: String::new(),
            token_sha1: String::new(),
            account_key: None,
            discover_port: 0,
            route_port: 0,
            data_port: 0,
            sync_interval_in_s: DEFAULT_SYNC_INTERVAL_IN_S,
            backup_root: String::new(),
            tree_root_prefix: String::new(),
            report_host: String::new(),
            ca_cert: String::new(),
            mac_token: String::new(),
            download_cache_volume: DEFAULT_DOWNLOAD_CACHE_VOLUME,
            transfer_threads: DEFAULT_TRANSFER_THREADS,
            refresh_workers: DEFAULT_REFRESH_WORKERS,
            sync_workers: DEFAULT_SYNC_WORKERS,
            outer_workers: DEFAULT_OUTER_WORKERS,
            inner_workers: DEFAULT_INNER_WORKERS,
        }
    }
}

/// The configuration service.
pub struct Config {
    store: Arc<MetaStore>,
    state: RwLock<ConfigState>,
    /// Serializes mutations; the store write happens before the snapshot
    /// update so a failed write leaves both unchanged.
    write_lock: Mutex<()>,
}

fn validate_port(port: i64) -> Result<u16> {
    if (1..=65535).contains(&port) {
        Ok(port as u16)
    } else {
        Err(ConfigError::InvalidPort { port }.into())
    }
}

impl Config {
    /// Load configuration from the store, generating identity on first run.
    pub async fn load(store: Arc<MetaStore>) -> Result<Arc<Self>> {
        let mut state = ConfigState::default();

        let read = |key: &'static str| {
            let store = Arc::clone(&store);
            async move { store.config_get(key).await }
        };

        state.device_uuid = match read(KEY_DEVICE_UUID).await? {
            Some(uuid) => uuid,
            None => {
                let uuid = uuid::Uuid::new_v4().to_string();
                store.config_set(KEY_DEVICE_UUID, &uuid).await?;
                info!(device_uuid = %uuid, "Generated device identity");
                uuid
            }
        };
        state.device_name = read(KEY_DEVICE_NAME).await?.unwrap_or_default();
        state.account_name = read(KEY_USERNAME).await?.unwrap_or_default();
        state.token_sha1 = read(KEY_TOKEN_SHA1).await?.unwrap_or_default();
        if !state.account_name.is_empty() {
            state.account_key = Some(crypto::derive_account_key(&state.account_name)?);
        }

        for (key, slot) in [
            (KEY_DISCOVER_PORT, &mut state.discover_port),
            (KEY_ROUTE_PORT, &mut state.route_port),
            (KEY_DATA_PORT, &mut state.data_port),
        ] {
            if let Some(value) = read(key).await? {
                let port: i64 = value.parse().map_err(|_| ConfigError::CorruptValue {
                    key: key.to_string(),
                    value: value.clone(),
                })?;
                *slot = validate_port(port)?;
            }
        }

        if let Some(value) = read(KEY_SYNC_INTERVAL).await? {
            state.sync_interval_in_s =
                value.parse().map_err(|_| ConfigError::CorruptValue {
                    key: KEY_SYNC_INTERVAL.to_string(),
                    value,
                })?;
        }
        if let Some(value) = read(KEY_DOWNLOAD_CACHE_VOLUME).await? {
            state.download_cache_volume =
                value.parse().map_err(|_| ConfigError::CorruptValue {
                    key: KEY_DOWNLOAD_CACHE_VOLUME.to_string(),
                    value,
                })?;
        }
        if let Some(value) = read(KEY_TRANSFER_THREADS).await? {
            state.transfer_threads =
                value.parse().map_err(|_| ConfigError::CorruptValue {
                    key: KEY_TRANSFER_THREADS.to_string(),
                    value,
                })?;
        }
        state.backup_root = read(KEY_BACKUP_ROOT).await?.unwrap_or_default();
        state.tree_root_prefix = read(KEY_TREE_ROOT_PREFIX).await?.unwrap_or_default();
        state.report_host = read(KEY_REPORT_HOST).await?.unwrap_or_default();
        state.ca_cert = read(KEY_CA_CERT).await?.unwrap_or_default();
        state.mac_token = read(KEY_MAC_TOKEN).await?.unwrap_or_default();

        Ok(Arc::new(Self {
            store,
            state: RwLock::new(state),
            write_lock: Mutex::new(()),
        }))
    }

    async fn set(&self, key: &str, value: &str, apply: impl FnOnce(&mut ConfigState)) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        self.store.config_set(key, value).await?;
        apply(&mut self.state.write().unwrap());
        Ok(())
    }

    fn read<T>(&self, get: impl FnOnce(&ConfigState) -> T) -> T {
        get(&self.state.read().unwrap())
    }

    // Identity -----------------------------------------------------------

    pub fn device_uuid(&self) -> String {
        self.read(|s| s.device_uuid.clone())
    }

    pub fn device_name(&self) -> String {
        self.read(|s| s.device_name.clone())
    }

    pub async fn set_device_name(&self, name: &str) -> Result<()> {
        self.set(KEY_DEVICE_NAME, name, |s| s.device_name = name.to_string())
            .await
    }

    pub fn account_name(&self) -> String {
        self.read(|s| s.account_name.clone())
    }

    pub fn token_sha1(&self) -> String {
        self.read(|s| s.token_sha1.clone())
    }

    /// The shared account key; error before the account is set.
    pub fn account_key(&self) -> Result<[u8; crypto::KEY_LENGTH]> {
        self.read(|s| s.account_key)
            .ok_or_else(|| ConfigError::AccountNotInitialized.into())
    }

    /// Set the account, deriving the key and token digest.
    pub async fn set_account(&self, name: &str, password: &str) -> Result<()> {
        let token = crypto::token_sha1(name, password);
        let key = crypto::derive_account_key(name)?;
        let _guard = self.write_lock.lock().await;
        self.store.config_set(KEY_USERNAME, name).await?;
        self.store.config_set(KEY_TOKEN_SHA1, &token).await?;
        let mut state = self.state.write().unwrap();
        state.account_name = name.to_string();
        state.token_sha1 = token;
        state.account_key = Some(key);
        Ok(())
    }

    // Ports --------------------------------------------------------------

    pub fn discover_port(&self) -> u16 {
        self.read(|s| s.discover_port)
    }

    pub async fn set_discover_port(&self, port: i64) -> Result<()> {
        let port = validate_port(port)?;
        self.set(KEY_DISCOVER_PORT, &port.to_string(), |s| {
            s.discover_port = port;
        })
        .await
    }

    pub fn route_port(&self) -> u16 {
        self.read(|s| s.route_port)
    }

    pub async fn set_route_port(&self, port: i64) -> Result<()> {
        let port = validate_port(port)?;
        self.set(KEY_ROUTE_PORT, &port.to_string(), |s| s.route_port = port)
            .await
    }

    pub fn data_port(&self) -> u16 {
        self.read(|s| s.data_port)
    }

    pub async fn set_data_port(&self, port: i64) -> Result<()> {
        let port = validate_port(port)?;
        self.set(KEY_DATA_PORT, &port.to_string(), |s| s.data_port = port)
            .await
    }

    // Engine tunables ----------------------------------------------------

    pub fn sync_interval_in_s(&self) -> i64 {
        self.read(|s| s.sync_interval_in_s)
    }

    pub async fn set_sync_interval(&self, interval_in_s: i64) -> Result<()> {
        self.set(KEY_SYNC_INTERVAL, &interval_in_s.to_string(), |s| {
            s.sync_interval_in_s = interval_in_s;
        })
        .await
    }

    pub fn download_cache_volume(&self) -> i64 {
        self.read(|s| s.download_cache_volume)
    }

    pub async fn set_download_cache_volume(&self, volume: i64) -> Result<()> {
        self.set(KEY_DOWNLOAD_CACHE_VOLUME, &volume.to_string(), |s| {
            s.download_cache_volume = volume;
        })
        .await
    }

    pub fn transfer_threads(&self) -> usize {
        self.read(|s| s.transfer_threads)
    }

    pub async fn set_transfer_threads(&self, count: usize) -> Result<()> {
        self.set(KEY_TRANSFER_THREADS, &count.to_string(), |s| {
            s.transfer_threads = count;
        })
        .await
    }

    pub fn refresh_workers(&self) -> usize {
        self.read(|s| s.refresh_workers)
    }

    pub fn sync_workers(&self) -> usize {
        self.read(|s| s.sync_workers)
    }

    pub fn outer_workers(&self) -> usize {
        self.read(|s| s.outer_workers)
    }

    pub fn inner_workers(&self) -> usize {
        self.read(|s| s.inner_workers)
    }

    // Paths and hosts ----------------------------------------------------

    pub fn backup_root(&self) -> String {
        self.read(|s| s.backup_root.clone())
    }

    pub async fn set_backup_root(&self, root: &str) -> Result<()> {
        self.set(KEY_BACKUP_ROOT, root, |s| s.backup_root = root.to_string())
            .await
    }

    pub fn tree_root_prefix(&self) -> String {
        self.read(|s| s.tree_root_prefix.clone())
    }

    pub async fn set_tree_root_prefix(&self, prefix: &str) -> Result<()> {
        self.set(KEY_TREE_ROOT_PREFIX, prefix, |s| {
            s.tree_root_prefix = prefix.to_string();
        })
        .await
    }

    pub fn report_host(&self) -> String {
        self.read(|s| s.report_host.clone())
    }

    pub async fn set_report_host(&self, host: &str) -> Result<()> {
        self.set(KEY_REPORT_HOST, host, |s| s.report_host = host.to_string())
            .await
    }

    pub fn ca_cert(&self) -> String {
        self.read(|s| s.ca_cert.clone())
    }

    /// Store the CA certificate; the value must be valid base64.
    pub async fn set_ca_cert(&self, cert_base64: &str) -> Result<()> {
        use base64ct::{Base64, Encoding};
        if !cert_base64.is_empty() && Base64::decode_vec(cert_base64).is_err() {
            return Err(ConfigError::CorruptValue {
                key: KEY_CA_CERT.to_string(),
                value: "<not base64>".to_string(),
            }
            .into());
        }
        self.set(KEY_CA_CERT, cert_base64, |s| {
            s.ca_cert = cert_base64.to_string();
        })
        .await
    }

    pub fn mac_token(&self) -> String {
        self.read(|s| s.mac_token.clone())
    }

    pub async fn set_mac_token(&self, token: &str) -> Result<()> {
        self.set(KEY_MAC_TOKEN, token, |s| s.mac_token = token.to_string())
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn identity_survives_reload() {
        let store = Arc::new(MetaStore::open_in_memory().await.unwrap());
        let config = Config::load(Arc::clone(&store)).await.unwrap();
        let uuid = config.device_uuid();
        assert!(!uuid.is_empty());

        config.set_account("alice", "secret").await.unwrap();
        config.set_route_port(8848).await.unwrap();

        let reloaded = Config::load(store).await.unwrap();
        assert_eq!(reloaded.device_uuid(), uuid);
        assert_eq!(reloaded.account_name(), "alice");
        assert_eq!(reloaded.token_sha1(), crypto::token_sha1("alice", "secret"));
        assert_eq!(reloaded.route_port(), 8848);
        assert!(reloaded.account_key().is_ok());
    }

    #[tokio::test]
    async fn bad_port_is_rejected() {
        let store = Arc::new(MetaStore::open_in_memory().await.unwrap());
        let config = Config::load(store).await.unwrap();
        assert!(config.set_discover_port(0).await.is_err());
        assert!(config.set_discover_port(70000).await.is_err());
        // Unchanged after the failed set.
        assert_eq!(config.discover_port(), 0);
    }

    #[tokio::test]
    async fn account_key_requires_account() {
        let store = Arc::new(MetaStore::open_in_memory().await.unwrap());
        let config = Config::load(store).await.unwrap();
        assert!(config.account_key().is_err());
    }
}
