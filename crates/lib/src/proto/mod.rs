//! Wire protocol definitions.
//!
//! Transport-agnostic message types for the route port (request/response
//! between devices plus the engine's self-enqueued issue requests), the
//! discovery UDP frame, and the data-port stream headers. Everything is
//! serde-serialized; route-port envelopes are length-prefixed JSON with an
//! optionally account-sealed body.

pub mod codec;

pub use codec::{read_frame, write_frame};

use serde::{Deserialize, Serialize};

use crate::crypto::{self, CryptoError};
use crate::store::{FileEntry, SyncPerm, SyncType};
use thiserror::Error;

/// Errors from message encoding, decoding and admission.
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum ProtoError {
    /// The message could not be parsed.
    #[error("Invalid message: {reason}")]
    InvalidMessage { reason: String },

    /// The sender speaks a different protocol version.
    #[error("Version incompatible: got {got}, expected {expected}")]
    VersionIncompatible { got: u32, expected: u32 },

    /// The body could not be opened with the account key.
    #[error("Cipher failure")]
    Cipher(#[from] CryptoError),

    /// A frame exceeded the permitted size.
    #[error("Frame too large: {len} bytes")]
    FrameTooLarge { len: usize },

    /// The connection closed mid-frame.
    #[error("Truncated frame")]
    TruncatedFrame,
}

impl ProtoError {
    /// Check if this error means the peer holds a different account key.
    pub fn is_cipher_error(&self) -> bool {
        matches!(self, ProtoError::Cipher(_))
    }

    /// Check if this error is a version mismatch.
    pub fn is_version_error(&self) -> bool {
        matches!(self, ProtoError::VersionIncompatible { .. })
    }
}

/// Encryption applied to a message body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EncryptLevel {
    /// Plain body.
    None,
    /// Body sealed with the shared account key.
    EncryptWithAccount,
}

/// Message codes carried in the head, used for dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MsgCode {
    DeviceMeta,
    Find,
    PushDeviceMeta,
    PushSyncInfo,
    ShareSync,
    PushBackupInfo,
    RemoveRemoteFile,
    AnnounceExit,
    // Intra-process issue codes; never sent between devices.
    Sync,
    IssueDeviceInfo,
    IssueRefresh,
    IssuePushDeviceInfo,
}

impl MsgCode {
    /// Encryption level required for bodies of this code.
    ///
    /// DeviceMeta and ShareSync must be readable across accounts (identity
    /// exchange and share offers); everything else is account-scoped.
    pub fn encrypt_level(self) -> EncryptLevel {
        match self {
            MsgCode::DeviceMeta | MsgCode::ShareSync => EncryptLevel::None,
            MsgCode::Sync
            | MsgCode::IssueDeviceInfo
            | MsgCode::IssueRefresh
            | MsgCode::IssuePushDeviceInfo => EncryptLevel::None,
            _ => EncryptLevel::EncryptWithAccount,
        }
    }

    /// Whether this code originates inside the process only.
    pub fn is_inner(self) -> bool {
        matches!(
            self,
            MsgCode::Sync
                | MsgCode::IssueDeviceInfo
                | MsgCode::IssueRefresh
                | MsgCode::IssuePushDeviceInfo
        )
    }
}

/// Head of every route-port message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MsgHead {
    pub version: u32,
    pub code: MsgCode,
    pub level: EncryptLevel,
    pub sender_uuid: String,
}

/// A framed message: head plus (possibly sealed) body bytes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub head: MsgHead,
    #[serde(with = "serde_bytes")]
    pub body: Vec<u8>,
}

// Shared sub-messages ----------------------------------------------------

/// Identity of a device as carried on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MsgDevice {
    pub uuid: String,
    pub name: String,
    pub platform: String,
    pub route_port: u16,
    pub data_port: u16,
    pub version: i64,
    /// Token digest deciding account membership.
    pub token_sha1: String,
    pub backup_dst_root: String,
}

/// A sync as carried on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MsgSync {
    pub uuid: String,
    pub name: String,
    pub kind: SyncType,
    pub perm: SyncPerm,
}

/// A tree as carried on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MsgTree {
    pub uuid: String,
    pub device_uuid: String,
    pub backup_type: i64,
}

// Request/response bodies ------------------------------------------------

/// Request bodies, one variant per code.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RequestBody {
    DeviceMeta,
    Find(FindRequest),
    PushDeviceMeta(MsgDevice),
    PushSyncInfo(PushSyncInfoRequest),
    ShareSync(ShareSyncRequest),
    PushBackupInfo(PushBackupInfoRequest),
    RemoveRemoteFile(RemoveRemoteFileRequest),
    AnnounceExit { device_uuid: String },
    Sync(SyncIssue),
    IssueDeviceInfo(IssueDeviceInfo),
    IssueRefresh(IssueRefresh),
    IssuePushDeviceInfo,
}

impl RequestBody {
    /// The code this body travels under.
    pub fn code(&self) -> MsgCode {
        match self {
            RequestBody::DeviceMeta => MsgCode::DeviceMeta,
            RequestBody::Find(_) => MsgCode::Find,
            RequestBody::PushDeviceMeta(_) => MsgCode::PushDeviceMeta,
            RequestBody::PushSyncInfo(_) => MsgCode::PushSyncInfo,
            RequestBody::ShareSync(_) => MsgCode::ShareSync,
            RequestBody::PushBackupInfo(_) => MsgCode::PushBackupInfo,
            RequestBody::RemoveRemoteFile(_) => MsgCode::RemoveRemoteFile,
            RequestBody::AnnounceExit { .. } => MsgCode::AnnounceExit,
            RequestBody::Sync(_) => MsgCode::Sync,
            RequestBody::IssueDeviceInfo(_) => MsgCode::IssueDeviceInfo,
            RequestBody::IssueRefresh(_) => MsgCode::IssueRefresh,
            RequestBody::IssuePushDeviceInfo => MsgCode::IssuePushDeviceInfo,
        }
    }
}

/// Response bodies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ResponseBody {
    Ok,
    DeviceMeta(MsgDevice),
    Find(FindResponse),
    ShareSync { device: MsgDevice },
    PushBackupInfo { dst_tree_uuid: String },
    Error { code: WireError, message: String },
}

/// Error codes a peer may return.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WireError {
    PermissionDeny,
    SyncNoent,
    TreeNoent,
    DeviceNoent,
    InvalidMsg,
    VersionIncompatible,
    General,
}

/// Paged metadata pull for one tree pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FindRequest {
    pub local_tree_uuid: String,
    pub remote_tree_uuid: String,
    pub sync_uuid: String,
    /// Return rows with usn strictly greater than this.
    pub since: i64,
    pub limit: i64,
}

/// One page of usn-ordered file stats.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FindResponse {
    pub stats: Vec<FileEntry>,
}

/// Gossip of sync membership (share grant/revoke, backup add/remove).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PushSyncInfoRequest {
    pub sync: MsgSync,
    pub trees: Vec<MsgTree>,
}

/// Creator-initiated share offer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShareSyncRequest {
    pub device: MsgDevice,
    pub sync: MsgSync,
    pub perm: SyncPerm,
}

/// Backup source announcing itself to a destination device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PushBackupInfoRequest {
    pub device: MsgDevice,
    pub sync: MsgSync,
    pub src_tree_uuid: String,
}

/// Remote rm-on-behalf inside a backup sync.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoveRemoteFileRequest {
    pub sync_uuid: String,
    pub rel_path: String,
}

/// Inner request: run one sync pair.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SyncIssue {
    pub local_tree_id: i64,
    pub remote_tree_id: i64,
    pub is_manual: bool,
}

/// Inner request: send DeviceMeta to a discovered endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IssueDeviceInfo {
    pub host: String,
    pub port: u16,
    pub is_ipv6: bool,
}

/// Inner request: refresh one tree (or all).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct IssueRefresh {
    pub tree_id: Option<i64>,
}

// Body sealing -----------------------------------------------------------

/// Serialize and, when the code demands it, seal a request body.
pub fn encode_request(
    sender_uuid: &str,
    body: &RequestBody,
    account_key: Option<&[u8; crypto::KEY_LENGTH]>,
) -> Result<Envelope, ProtoError> {
    let code = body.code();
    let plain = serde_json::to_vec(body).map_err(|e| ProtoError::InvalidMessage {
        reason: e.to_string(),
    })?;
    seal_body(sender_uuid, code, plain, account_key)
}

/// Serialize and seal a response body under the request's code.
pub fn encode_response(
    sender_uuid: &str,
    code: MsgCode,
    body: &ResponseBody,
    account_key: Option<&[u8; crypto::KEY_LENGTH]>,
) -> Result<Envelope, ProtoError> {
    let plain = serde_json::to_vec(body).map_err(|e| ProtoError::InvalidMessage {
        reason: e.to_string(),
    })?;
    seal_body(sender_uuid, code, plain, account_key)
}

fn seal_body(
    sender_uuid: &str,
    code: MsgCode,
    plain: Vec<u8>,
    account_key: Option<&[u8; crypto::KEY_LENGTH]>,
) -> Result<Envelope, ProtoError> {
    let (level, body) = match (code.encrypt_level(), account_key) {
        (EncryptLevel::EncryptWithAccount, Some(key)) => {
            (EncryptLevel::EncryptWithAccount, crypto::seal(key, &plain)?)
        }
        _ => (EncryptLevel::None, plain),
    };
    Ok(Envelope {
        head: MsgHead {
            version: crate::constants::MSG_VERSION,
            code,
            level,
            sender_uuid: sender_uuid.to_string(),
        },
        body,
    })
}

/// Open an envelope body, decrypting when the head says so.
pub fn open_body(
    envelope: &Envelope,
    account_key: Option<&[u8; crypto::KEY_LENGTH]>,
) -> Result<Vec<u8>, ProtoError> {
    match envelope.head.level {
        EncryptLevel::None => Ok(envelope.body.clone()),
        EncryptLevel::EncryptWithAccount => {
            let key = account_key.ok_or(ProtoError::Cipher(CryptoError::OpenFailed))?;
            Ok(crypto::open(key, &envelope.body)?)
        }
    }
}

/// Open and parse a request body.
pub fn decode_request(
    envelope: &Envelope,
    account_key: Option<&[u8; crypto::KEY_LENGTH]>,
) -> Result<RequestBody, ProtoError> {
    let plain = open_body(envelope, account_key)?;
    serde_json::from_slice(&plain).map_err(|e| ProtoError::InvalidMessage {
        reason: e.to_string(),
    })
}

/// Open and parse a response body.
pub fn decode_response(
    envelope: &Envelope,
    account_key: Option<&[u8; crypto::KEY_LENGTH]>,
) -> Result<ResponseBody, ProtoError> {
    let plain = open_body(envelope, account_key)?;
    serde_json::from_slice(&plain).map_err(|e| ProtoError::InvalidMessage {
        reason: e.to_string(),
    })
}

// Discovery UDP frame ----------------------------------------------------

/// Magic prefix of discovery datagrams.
pub const DISCOVER_MAGIC: &[u8; 4] = b"DSY1";

/// Kind byte of a discovery datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscoverKind {
    Broadcast = 0,
    BroadcastReply = 1,
}

/// A discovery datagram: who is announcing which info-hash on which port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoverFrame {
    pub kind: DiscoverKind,
    pub info_hash: [u8; crypto::INFO_HASH_LENGTH],
    /// Route port the sender accepts connections on.
    pub peer_port: u16,
}

impl DiscoverFrame {
    /// Fixed on-wire length.
    pub const LEN: usize = 4 + 1 + crypto::INFO_HASH_LENGTH + 2;

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::LEN);
        out.extend_from_slice(DISCOVER_MAGIC);
        out.push(self.kind as u8);
        out.extend_from_slice(&self.info_hash);
        out.extend_from_slice(&self.peer_port.to_be_bytes());
        out
    }

    pub fn parse(data: &[u8]) -> Result<Self, ProtoError> {
        if data.len() != Self::LEN || &data[..4] != DISCOVER_MAGIC {
            return Err(ProtoError::InvalidMessage {
                reason: "not a discovery frame".to_string(),
            });
        }
        let kind = match data[4] {
            0 => DiscoverKind::Broadcast,
            1 => DiscoverKind::BroadcastReply,
            other => {
                return Err(ProtoError::InvalidMessage {
                    reason: format!("unknown discovery kind {other}"),
                });
            }
        };
        let mut info_hash = [0u8; crypto::INFO_HASH_LENGTH];
        info_hash.copy_from_slice(&data[5..5 + crypto::INFO_HASH_LENGTH]);
        let port_off = 5 + crypto::INFO_HASH_LENGTH;
        let peer_port = u16::from_be_bytes([data[port_off], data[port_off + 1]]);
        Ok(Self {
            kind,
            info_hash,
            peer_port,
        })
    }
}

// Data-port stream headers -----------------------------------------------

/// Direction of a data-port session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransferDirection {
    /// Sender streams file bodies after the headers.
    Put,
    /// Sender requests the listed files be streamed back.
    Get,
}

/// Head of a data-port session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferHead {
    pub direction: TransferDirection,
    pub sync_uuid: String,
    pub local_tree_uuid: String,
    pub remote_tree_uuid: String,
    pub files: Vec<TransferFileHead>,
}

/// Per-file record preceding its raw bytes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferFileHead {
    pub path: String,
    pub length: i64,
    pub sha1: String,
    pub mtime: i64,
    pub unix_attr: i64,
    pub win_attr: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn discover_frame_round_trip() {
        let frame = DiscoverFrame {
            kind: DiscoverKind::BroadcastReply,
            info_hash: crypto::account_info_hash("alice"),
            peer_port: 8848,
        };
        let bytes = frame.encode();
        assert_eq!(bytes.len(), DiscoverFrame::LEN);
        assert_eq!(DiscoverFrame::parse(&bytes).unwrap(), frame);
    }

    #[test]
    fn discover_frame_rejects_garbage() {
        assert!(DiscoverFrame::parse(b"nope").is_err());
        let mut bytes = DiscoverFrame {
            kind: DiscoverKind::Broadcast,
            info_hash: [0; 20],
            peer_port: 1,
        }
        .encode();
        bytes[0] = b'X';
        assert!(DiscoverFrame::parse(&bytes).is_err());
    }

    #[test]
    fn sealed_request_round_trips_iff_same_key() {
        let key = crypto::derive_account_key("alice").unwrap();
        let body = RequestBody::Find(FindRequest {
            local_tree_uuid: "lt".into(),
            remote_tree_uuid: "rt".into(),
            sync_uuid: "s".into(),
            since: 42,
            limit: 100,
        });
        let envelope = encode_request("dev-1", &body, Some(&key)).unwrap();
        assert_eq!(envelope.head.level, EncryptLevel::EncryptWithAccount);
        assert_ne!(envelope.body, serde_json::to_vec(&body).unwrap());

        assert_eq!(decode_request(&envelope, Some(&key)).unwrap(), body);

        let wrong = crypto::derive_account_key("mallory").unwrap();
        assert!(decode_request(&envelope, Some(&wrong)).is_err());
        assert!(decode_request(&envelope, None).is_err());
    }

    #[test]
    fn device_meta_is_plain() {
        let envelope = encode_request("dev-1", &RequestBody::DeviceMeta, None).unwrap();
        assert_eq!(envelope.head.level, EncryptLevel::None);
        assert_eq!(envelope.head.code, MsgCode::DeviceMeta);
        assert_eq!(
            decode_request(&envelope, None).unwrap(),
            RequestBody::DeviceMeta
        );
    }
}
