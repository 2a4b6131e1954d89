//!
//! Driftsync: a peer-to-peer directory synchronization engine.
//!
//! Devices belonging to one account discover each other on the local
//! network and over the Internet, exchange file metadata, reconcile
//! divergent trees with per-file version vectors, and move content over a
//! dedicated data channel. One-way backups and revocable shares extend the
//! same machinery across accounts.
//!
//! ## Core concepts
//!
//! * **Kernel (`kernel::Kernel`)**: the façade an embedding application
//!   drives. `initialize` prepares on-disk state, `startup` builds the
//!   services, every public operation lives here.
//! * **Metadata store (`store::MetaStore`)**: typed tables behind a
//!   content-provider abstraction with atomic batches and URI-keyed
//!   change observers.
//! * **Sync / Tree / Device**: a `Sync` is the unit of sharing; each
//!   participating device mirrors it into a `Tree` (a local directory);
//!   `Device` rows track identity, endpoints and reachability.
//! * **USN and version vectors**: every file row carries a per-tree
//!   monotonically increasing update sequence number for incremental
//!   metadata pulls, and a `(local, remote)` version vector (`vclock`)
//!   that drives last-writer-wins reconciliation with observable
//!   conflicts.
//! * **Worker pools**: refresh (filesystem indexing), sync (pair
//!   reconciliation), and the outer/inner RPC pools, all fixed-size and
//!   fed by queues.

pub mod clock;
pub mod config;
pub mod constants;
pub mod crypto;
pub mod discovery;
pub mod events;
pub mod kernel;
pub mod proto;
pub mod query;
pub mod refresh;
pub mod router;
pub mod rpc;
pub mod store;
pub mod sync;
pub mod transfer;
pub mod vclock;

/// Re-export fundamental types for easier access.
pub use clock::{Clock, SystemClock};
pub use config::Config;
pub use kernel::Kernel;
pub use store::MetaStore;
pub use vclock::{VClock, VClockOrder};

/// Result type used throughout the driftsync library.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// The public error taxonomy. Every structured error maps onto exactly
/// one of these codes via [`Error::kind`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum ErrorKind {
    // Configuration
    BadPath,
    InvalidPort,
    AddrInUse,
    DirNoent,
    NotStartup,
    Config,
    // Entities
    SyncNoent,
    SyncCreatorExist,
    NotSyncCreator,
    TreeNoent,
    TreeExist,
    BackupSrcExist,
    BackupDstExist,
    DeviceNoent,
    FavouriteExist,
    FavouriteNoent,
    DiscoverNoent,
    DiscoverLimit,
    SyncListExist,
    SyncListNoent,
    ShareSyncDisconnect,
    // I/O & network
    OsSocket,
    OsIo,
    OsThread,
    OsTimer,
    Timeout,
    HttpReturnError,
    // Protocol
    InvalidMsg,
    VersionIncompatible,
    PermissionDeny,
    CdKey,
    // Integrity
    Cipher,
    Content,
    Sqlite,
    General,
}

/// Common error type for the driftsync library.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    /// Structured store errors.
    #[error(transparent)]
    Store(#[from] store::StoreError),

    /// Structured configuration errors.
    #[error(transparent)]
    Config(#[from] config::ConfigError),

    /// Structured cryptography errors.
    #[error(transparent)]
    Crypto(#[from] crypto::CryptoError),

    /// Structured wire-protocol errors.
    #[error(transparent)]
    Proto(#[from] proto::ProtoError),

    /// Structured discovery errors.
    #[error(transparent)]
    Discovery(#[from] discovery::DiscoveryError),

    /// Structured router errors.
    #[error(transparent)]
    Router(#[from] router::RouterError),

    /// Structured transfer errors.
    #[error(transparent)]
    Transfer(#[from] transfer::TransferError),

    /// Structured refresh errors.
    #[error(transparent)]
    Refresh(#[from] refresh::RefreshError),

    /// Structured synchronization errors.
    #[error(transparent)]
    Sync(#[from] sync::SyncError),

    /// Structured RPC errors.
    #[error(transparent)]
    Rpc(#[from] rpc::RpcError),

    /// Structured kernel errors.
    #[error(transparent)]
    Kernel(#[from] kernel::KernelError),
}

impl Error {
    /// Get the originating module for this error.
    pub fn module(&self) -> &'static str {
        match self {
            Error::Io(_) => "io",
            Error::Serialize(_) => "serialize",
            Error::Store(_) => "store",
            Error::Config(_) => "config",
            Error::Crypto(_) => "crypto",
            Error::Proto(_) => "proto",
            Error::Discovery(_) => "discovery",
            Error::Router(_) => "router",
            Error::Transfer(_) => "transfer",
            Error::Refresh(_) => "refresh",
            Error::Sync(_) => "sync",
            Error::Rpc(_) => "rpc",
            Error::Kernel(_) => "kernel",
        }
    }

    /// Map this error onto the public taxonomy.
    pub fn kind(&self) -> ErrorKind {
        use ErrorKind as K;
        match self {
            Error::Io(_) => K::OsIo,
            Error::Serialize(_) => K::InvalidMsg,
            Error::Store(e) => match e {
                store::StoreError::BatchFailed { .. } | store::StoreError::BadColumn { .. } => {
                    K::Content
                }
                _ => K::Sqlite,
            },
            Error::Config(e) => match e {
                config::ConfigError::InvalidPort { .. } => K::InvalidPort,
                config::ConfigError::BadPath { .. } => K::BadPath,
                _ => K::Config,
            },
            Error::Crypto(_) => K::Cipher,
            Error::Proto(e) => match e {
                proto::ProtoError::VersionIncompatible { .. } => K::VersionIncompatible,
                proto::ProtoError::Cipher(_) => K::Cipher,
                _ => K::InvalidMsg,
            },
            Error::Discovery(e) => match e {
                discovery::DiscoveryError::AddrInUse { .. } => K::AddrInUse,
                discovery::DiscoveryError::Bind { .. } => K::OsSocket,
                discovery::DiscoveryError::SessionNotFound { .. } => K::DiscoverNoent,
                discovery::DiscoveryError::SessionLimit => K::DiscoverLimit,
                _ => K::General,
            },
            Error::Router(e) => match e {
                router::RouterError::AddrInUse { .. } => K::AddrInUse,
                router::RouterError::Bind { .. } => K::OsSocket,
                _ => K::General,
            },
            Error::Transfer(e) => match e {
                transfer::TransferError::AddrInUse { .. } => K::AddrInUse,
                transfer::TransferError::Bind { .. }
                | transfer::TransferError::ConnectFailed { .. } => K::OsSocket,
                transfer::TransferError::DigestMismatch { .. } => K::Content,
                _ => K::General,
            },
            Error::Refresh(e) => match e {
                refresh::RefreshError::TreeNotRefreshable { .. } => K::TreeNoent,
                refresh::RefreshError::RootMissing { .. } => K::DirNoent,
                _ => K::OsIo,
            },
            Error::Sync(e) => match e {
                sync::SyncError::TreeNotFound { .. } => K::TreeNoent,
                sync::SyncError::SyncNotFound { .. } => K::SyncNoent,
                sync::SyncError::DeviceNotFound { .. } => K::DeviceNoent,
                sync::SyncError::RemoteUnreachable { .. } => K::Timeout,
                _ => K::General,
            },
            Error::Rpc(e) => match e {
                rpc::RpcError::Timeout { .. } => K::Timeout,
                rpc::RpcError::ConnectFailed { .. } => K::OsSocket,
                rpc::RpcError::Peer { code, .. } => match code {
                    proto::WireError::PermissionDeny => K::PermissionDeny,
                    proto::WireError::VersionIncompatible => K::VersionIncompatible,
                    proto::WireError::InvalidMsg => K::InvalidMsg,
                    _ => K::General,
                },
                _ => K::General,
            },
            Error::Kernel(e) => match e {
                kernel::KernelError::NotStartup => K::NotStartup,
                kernel::KernelError::BadPath { .. } => K::BadPath,
                kernel::KernelError::DirNoent { .. } => K::DirNoent,
                kernel::KernelError::SyncNoent { .. } => K::SyncNoent,
                kernel::KernelError::SyncCreatorExist { .. } => K::SyncCreatorExist,
                kernel::KernelError::NotSyncCreator { .. } => K::NotSyncCreator,
                kernel::KernelError::TreeNoent { .. } => K::TreeNoent,
                kernel::KernelError::TreeExist { .. } => K::TreeExist,
                kernel::KernelError::BackupSrcExist { .. } => K::BackupSrcExist,
                kernel::KernelError::BackupDstExist { .. } => K::BackupDstExist,
                kernel::KernelError::DeviceNoent { .. } => K::DeviceNoent,
                kernel::KernelError::FavouriteExist { .. } => K::FavouriteExist,
                kernel::KernelError::FavouriteNoent { .. } => K::FavouriteNoent,
                kernel::KernelError::ShareSyncDisconnect { .. } => K::ShareSyncDisconnect,
                kernel::KernelError::InvalidSyncBlob => K::InvalidMsg,
                kernel::KernelError::HttpReturnError { .. } => K::HttpReturnError,
                _ => K::General,
            },
        }
    }

    /// Check if this error indicates a resource was not found.
    pub fn is_not_found(&self) -> bool {
        match self {
            Error::Store(e) => e.is_not_found(),
            Error::Sync(e) => e.is_not_found(),
            Error::Kernel(e) => e.is_not_found(),
            _ => false,
        }
    }

    /// Check if this error is fatal for engine startup.
    pub fn is_fatal(&self) -> bool {
        match self {
            Error::Store(e) => e.is_fatal(),
            Error::Crypto(e) => matches!(e, crypto::CryptoError::KeyDerivation { .. }),
            _ => false,
        }
    }

    /// Check if this error is worth retrying on another endpoint.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Rpc(e) => e.is_transient(),
            Error::Transfer(e) => e.is_transient(),
            Error::Io(_) => true,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn taxonomy_mapping() {
        let e: Error = kernel::KernelError::NotStartup.into();
        assert_eq!(e.kind(), ErrorKind::NotStartup);
        assert_eq!(e.module(), "kernel");

        let e: Error = discovery::DiscoveryError::AddrInUse { port: 9000 }.into();
        assert_eq!(e.kind(), ErrorKind::AddrInUse);

        let e: Error = store::StoreError::BatchFailed {
            ops: 3,
            reason: "boom".into(),
        }
        .into();
        assert_eq!(e.kind(), ErrorKind::Content);

        let e: Error = crypto::CryptoError::OpenFailed.into();
        assert_eq!(e.kind(), ErrorKind::Cipher);

        let e: Error = rpc::RpcError::Peer {
            code: proto::WireError::PermissionDeny,
            message: "no".into(),
        }
        .into();
        assert_eq!(e.kind(), ErrorKind::PermissionDeny);
    }
}
