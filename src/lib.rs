//! Peer-to-peer content-addressable storage node with encrypted replication
//!
//! Each node keeps files in a local content-addressed store and replicates
//! them, encrypted under its own key, to every connected peer over a custom
//! TCP protocol. A node that lost its local copy fetches it back from the
//! network and decrypts it.

pub mod config;
pub mod crypto;
pub mod p2p;
pub mod server;
pub mod store;

pub use config::Config;
pub use crypto::{CryptoError, EncryptionKey};
pub use p2p::{Peer, TcpTransport, TcpTransportOpts, Transport, TransportError};
pub use server::{FileServer, FileServerOpts, ReplicationReport, ServerError};
pub use store::{PathKey, StorageError, Store, StoreOpts};
