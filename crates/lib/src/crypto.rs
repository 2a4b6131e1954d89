//! Account cryptography and content digests.
//!
//! Provides the pieces the engine needs from the crypto stack:
//! - Argon2id derivation of the account key from the account name
//! - the account token digest exchanged in DeviceMeta replies
//! - SHA1 digests for file contents and discovery info-hashes
//! - AES-256-GCM sealing of `EncryptWithAccount` message bodies
//! - the passphrase seed that opens the main store

use aes_gcm::{
    Aes256Gcm, KeyInit, Nonce,
    aead::{Aead, AeadCore, OsRng},
};
use argon2::Argon2;
use sha1::{Digest, Sha1};
use thiserror::Error;

/// Derived key length for AES-256 (32 bytes).
pub const KEY_LENGTH: usize = 32;

/// Nonce length for AES-GCM (12 bytes standard).
pub const NONCE_LENGTH: usize = 12;

/// Length of an info-hash (SHA1 output).
pub const INFO_HASH_LENGTH: usize = 20;

/// Fixed salt for the account key derivation.
///
/// The account key is shared by every device of the account and must be
/// derivable from the account name alone, so the salt is a protocol
/// constant rather than a random per-user value.
const ACCOUNT_KEY_SALT: &[u8] = b"driftsync.account.v1";

/// Fixed salt mixed into the token digest.
const TOKEN_SALT: &str = "driftsync.token.v1";

/// Base string XORed with the mac token to produce the store passphrase.
const PASSPHRASE_BASE: &[u8] = b"driftsync.store.passphrase.seed!";

/// Errors from sealing or opening encrypted payloads.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum CryptoError {
    /// Key derivation failed.
    #[error("Key derivation failed: {reason}")]
    KeyDerivation { reason: String },

    /// Encryption failed.
    #[error("Encryption failed: {reason}")]
    SealFailed { reason: String },

    /// Decryption failed (wrong key or corrupted payload).
    #[error("Decryption failed")]
    OpenFailed,

    /// Sealed payload too short to contain a nonce.
    #[error("Sealed payload truncated: {len} bytes")]
    Truncated { len: usize },
}

impl CryptoError {
    /// True when the failure means "wrong key or tampered bytes".
    pub fn is_cipher_error(&self) -> bool {
        matches!(self, CryptoError::OpenFailed | CryptoError::Truncated { .. })
    }
}

/// Derive the shared account key from the account name.
pub fn derive_account_key(account_name: &str) -> Result<[u8; KEY_LENGTH], CryptoError> {
    let mut key = [0u8; KEY_LENGTH];
    Argon2::default()
        .hash_password_into(account_name.as_bytes(), ACCOUNT_KEY_SALT, &mut key)
        .map_err(|e| CryptoError::KeyDerivation {
            reason: e.to_string(),
        })?;
    Ok(key)
}

/// Account token digest: `sha1(account_name || password || salt)`, hex.
///
/// Exchanged in every DeviceMeta reply; two devices belong to the same
/// account iff their token digests match.
pub fn token_sha1(account_name: &str, password: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(account_name.as_bytes());
    hasher.update(password.as_bytes());
    hasher.update(TOKEN_SALT.as_bytes());
    hex::encode(hasher.finalize())
}

/// SHA1 of a byte slice, hex encoded.
pub fn sha1_hex(data: &[u8]) -> String {
    hex::encode(Sha1::digest(data))
}

/// Incremental SHA1 for streamed file contents.
#[derive(Default)]
pub struct Sha1Stream(Sha1);

impl Sha1Stream {
    /// Start a new digest.
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk.
    pub fn update(&mut self, chunk: &[u8]) {
        self.0.update(chunk);
    }

    /// Finish and return the hex digest.
    pub fn finish_hex(self) -> String {
        hex::encode(self.0.finalize())
    }
}

/// 20-byte info-hash for the account: `sha1(account_name)`.
pub fn account_info_hash(account_name: &str) -> [u8; INFO_HASH_LENGTH] {
    Sha1::digest(account_name.as_bytes()).into()
}

/// 20-byte info-hash for a shared sync: `sha1(sync_uuid)`.
pub fn sync_info_hash(sync_uuid: &str) -> [u8; INFO_HASH_LENGTH] {
    Sha1::digest(sync_uuid.as_bytes()).into()
}

/// Fixed info-hash used when answering peers of an unknown account.
pub fn stranger_info_hash() -> [u8; INFO_HASH_LENGTH] {
    Sha1::digest(crate::constants::STRANGER_INFO_HASH_SEED.as_bytes()).into()
}

/// Seal a message body with the account key.
///
/// Output layout: `nonce(12) || ciphertext`.
pub fn seal(key: &[u8; KEY_LENGTH], plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let cipher = Aes256Gcm::new_from_slice(key).map_err(|e| CryptoError::SealFailed {
        reason: e.to_string(),
    })?;
    let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
    let ciphertext = cipher
        .encrypt(&nonce, plaintext)
        .map_err(|e| CryptoError::SealFailed {
            reason: e.to_string(),
        })?;
    let mut out = Vec::with_capacity(NONCE_LENGTH + ciphertext.len());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Open a payload produced by [`seal`]. Fails unless the same key is used.
pub fn open(key: &[u8; KEY_LENGTH], sealed: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if sealed.len() < NONCE_LENGTH {
        return Err(CryptoError::Truncated { len: sealed.len() });
    }
    let (nonce_bytes, ciphertext) = sealed.split_at(NONCE_LENGTH);
    let cipher = Aes256Gcm::new_from_slice(key).map_err(|e| CryptoError::SealFailed {
        reason: e.to_string(),
    })?;
    cipher
        .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
        .map_err(|_| CryptoError::OpenFailed)
}

/// Passphrase seed for the main store: fixed base XORed with the mac token.
///
/// With no mac token the seed is the base itself; either way the result is
/// hex so it survives being stored in the plain side database.
pub fn passphrase_seed(mac_token: &str) -> String {
    let token = mac_token.as_bytes();
    let mixed: Vec<u8> = PASSPHRASE_BASE
        .iter()
        .enumerate()
        .map(|(i, b)| {
            if token.is_empty() {
                *b
            } else {
                b ^ token[i % token.len()]
            }
        })
        .collect();
    hex::encode(mixed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn account_key_is_deterministic() {
        let a = derive_account_key("alice@example.com").unwrap();
        let b = derive_account_key("alice@example.com").unwrap();
        let c = derive_account_key("bob@example.com").unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn token_depends_on_both_name_and_password() {
        let t1 = token_sha1("alice", "secret");
        let t2 = token_sha1("alice", "other");
        let t3 = token_sha1("bob", "secret");
        assert_eq!(t1.len(), 40);
        assert_ne!(t1, t2);
        assert_ne!(t1, t3);
        assert_eq!(t1, token_sha1("alice", "secret"));
    }

    #[test]
    fn seal_round_trips_with_same_key() {
        let key = derive_account_key("alice").unwrap();
        let sealed = seal(&key, b"hello world").unwrap();
        assert_eq!(open(&key, &sealed).unwrap(), b"hello world");
    }

    #[test]
    fn open_with_wrong_key_fails() {
        let key = derive_account_key("alice").unwrap();
        let other = derive_account_key("mallory").unwrap();
        let sealed = seal(&key, b"hello world").unwrap();
        assert!(matches!(
            open(&other, &sealed),
            Err(CryptoError::OpenFailed)
        ));
    }

    #[test]
    fn truncated_payload_is_rejected() {
        let key = derive_account_key("alice").unwrap();
        assert!(matches!(
            open(&key, &[0u8; 4]),
            Err(CryptoError::Truncated { len: 4 })
        ));
    }

    #[test]
    fn stream_digest_matches_one_shot() {
        let mut stream = Sha1Stream::new();
        stream.update(b"hello ");
        stream.update(b"world");
        assert_eq!(stream.finish_hex(), sha1_hex(b"hello world"));
    }

    #[test]
    fn info_hashes_are_20_bytes_and_distinct() {
        let a = account_info_hash("alice");
        let s = sync_info_hash("bb2cbcee-8b44-4781-9b67-1e04c43d414a");
        assert_eq!(a.len(), 20);
        assert_ne!(a, s);
        assert_ne!(a, stranger_info_hash());
    }

    #[test]
    fn passphrase_seed_stable_per_token() {
        assert_eq!(passphrase_seed("m1"), passphrase_seed("m1"));
        assert_ne!(passphrase_seed("m1"), passphrase_seed("m2"));
        assert_eq!(passphrase_seed(""), hex::encode(PASSPHRASE_BASE));
    }
}
