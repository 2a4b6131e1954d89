//! Constants used throughout the driftsync engine.
//!
//! Central definitions for protocol versioning, timer intervals, and the
//! bounds the worker pools and discovery loops operate under.

use std::time::Duration;

/// Wire protocol version carried in every message head.
pub const MSG_VERSION: u32 = 1;

/// Multicast group the discovery broadcast is sent to.
pub const DISCOVER_MULTICAST_ADDR: &str = "224.0.0.88";

/// Interval between discovery broadcasts and static-peer probes.
pub const BROADCAST_INTERVAL: Duration = Duration::from_secs(10);

/// Interval between DHT announces.
pub const DHT_ANNOUNCE_INTERVAL: Duration = Duration::from_secs(18);

/// Interval between super-node (tracker) pings.
pub const SUPERNODE_PING_INTERVAL: Duration = Duration::from_secs(60);

/// Interval between discovered-peer expiry sweeps.
pub const PEER_EXPIRY_INTERVAL: Duration = Duration::from_secs(60);

/// Discovered peers unseen for this long are dropped.
pub const PEER_EXPIRED_TIME_IN_S: i64 = 360;

/// A device whose every endpoint has been failing for this long goes OFFLINE.
pub const DEVICE_NO_RESP_OFFLINE_TIMEOUT_IN_S: i64 = 360;

/// Bounded wait for any request/response RPC.
pub const WAIT_RESPONSE_TIMEOUT_IN_S: u64 = 15;

/// Maximum number of file stats returned per Find page.
pub const FIND_LIMIT: i64 = 3000;

/// Maximum attempts for a single file transfer before it errors out.
pub const TRANSFER_MAX_ATTEMPTS: u32 = 3;

/// Minimum gap between two tree-status emissions for the same tree.
pub const STATUS_EMIT_INTERVAL: Duration = Duration::from_millis(100);

/// Poll interval for the tree-root checker.
pub const TREE_ROOT_CHECK_INTERVAL: Duration = Duration::from_secs(30);

/// Default worker pool sizes.
pub const DEFAULT_REFRESH_WORKERS: usize = 1;
/// See [`DEFAULT_REFRESH_WORKERS`].
pub const DEFAULT_SYNC_WORKERS: usize = 4;
/// See [`DEFAULT_REFRESH_WORKERS`].
pub const DEFAULT_OUTER_WORKERS: usize = 2;
/// See [`DEFAULT_REFRESH_WORKERS`].
pub const DEFAULT_INNER_WORKERS: usize = 2;

/// Default auto-sync interval in seconds.
pub const DEFAULT_SYNC_INTERVAL_IN_S: i64 = 300;

/// Default cap on the partial-download cache, in bytes.
pub const DEFAULT_DOWNLOAD_CACHE_VOLUME: i64 = 512 * 1024 * 1024;

/// Upper bound on concurrently streaming files in the transfer server.
pub const DEFAULT_TRANSFER_THREADS: usize = 4;

/// Maximum concurrently open discovered-device sessions.
pub const DISCOVER_SESSION_LIMIT: usize = 8;

/// Local device row id in the Device table.
pub const LOCAL_DEVICE_ID: i64 = 0;

/// Placeholder device id meaning "creator unset".
pub const NULL_DEVICE_ID: i64 = -1;

/// Info-hash constant used when replying to peers of an unknown account.
pub const STRANGER_INFO_HASH_SEED: &str = "driftsync-stranger";
