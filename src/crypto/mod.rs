//! Node identity, key material and the stream cipher codec
//!
//! Every node owns one symmetric key. Data leaving the node (replication
//! streams) and data held for other nodes is encrypted with it; the key
//! itself never leaves memory.

mod stream;

pub use stream::{copy_decrypt, copy_encrypt, BLOCK_SIZE, CHUNK_SIZE};

use rand::RngCore;
use std::fmt;
use thiserror::Error;

/// Length of an encryption key in bytes (AES-256)
pub const KEY_SIZE: usize = 32;

/// Crypto errors
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("invalid key length: {0} (expected {KEY_SIZE})")]
    InvalidKeyLength(usize),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Symmetric key used by the stream codec
#[derive(Clone, PartialEq, Eq)]
pub struct EncryptionKey([u8; KEY_SIZE]);

impl EncryptionKey {
    /// Generate a fresh random key
    pub fn generate() -> Self {
        let mut key = [0u8; KEY_SIZE];
        rand::thread_rng().fill_bytes(&mut key);
        EncryptionKey(key)
    }

    /// Build a key from raw bytes
    pub fn from_slice(bytes: &[u8]) -> Result<Self, CryptoError> {
        let key: [u8; KEY_SIZE] = bytes
            .try_into()
            .map_err(|_| CryptoError::InvalidKeyLength(bytes.len()))?;
        Ok(EncryptionKey(key))
    }

    /// Parse a key from its hex encoding
    pub fn from_hex(s: &str) -> Result<Self, CryptoError> {
        let bytes = hex::decode(s).map_err(|_| CryptoError::InvalidKeyLength(s.len() / 2))?;
        Self::from_slice(&bytes)
    }

    /// Get raw bytes
    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }
}

impl fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("EncryptionKey(..)")
    }
}

/// Random 32-byte identifier, hex encoded
pub fn generate_id() -> String {
    let mut buf = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut buf);
    hex::encode(buf)
}

/// Digest of a lookup key as exchanged on the wire (hex BLAKE3)
pub fn hash_key(key: &str) -> String {
    blake3::hash(key.as_bytes()).to_hex().to_string()
}
