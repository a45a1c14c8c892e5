//! Control-plane messages exchanged between nodes

use serde::{Deserialize, Serialize};

/// Control message carried in a `0x01` frame.
///
/// `key` is always the wire digest of the lookup key, `id` the node whose
/// namespace the blob belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Message {
    /// A stream of `size` encrypted bytes follows once the receiver acks
    StoreFile { id: String, key: String, size: u64 },
    /// Send back `u64 size | ciphertext` as a stream, size 0 if absent
    GetFile { id: String, key: String },
    /// The receiver is ready to consume the announced store stream
    StoreAck { id: String, key: String },
}

impl Message {
    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}
