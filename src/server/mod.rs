//! File server node
//!
//! Owns the node identity, its key, the local store and the transport, and
//! runs the replication protocol on top of them:
//!
//! ```text
//! store:  local write ─► StoreFile ─► (wait StoreAck) ─► 0x02 + ciphertext   per peer
//! get:    local hit?  ─► GetFile   ─► 0x02 + u64 size + ciphertext            per peer
//! ```
//!
//! Peers keep replicas encrypted under the owner's key; only the owner can
//! read them back.
//!
//! Incoming StoreFile bodies are ingested on their own threads, so the
//! dispatch loop keeps delivering acks while a node is both sending and
//! receiving. Every stream a node asks for is requested under that
//! connection's inbound lease, which keeps stream hand-off unambiguous.

mod message;

pub use message::Message;

use crate::crypto::{self, copy_encrypt, CryptoError, EncryptionKey, BLOCK_SIZE};
use crate::p2p::{write_message, write_stream_signal, OnPeer, Peer, Transport, TransportError};
use crate::store::{cas_path_transform, PathTransform, StorageError, Store, StoreOpts, DEFAULT_ROOT};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use crossbeam::channel::{self, Receiver, Sender};
use crossbeam::select;
use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::fs::File;
use std::io::{self, Read, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Server errors
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("message encoding error: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("peer ({0}) could not be found in the peer list")]
    UnknownPeer(String),

    #[error("peer {addr} did not acknowledge within {waited:?}")]
    AckTimeout { addr: String, waited: Duration },

    #[error("inbound stream from {addr} still busy after {waited:?}")]
    StreamBusy { addr: String, waited: Duration },

    #[error("file ({0}) not found locally or on any peer")]
    NotFound(String),
}

/// Result of replicating to one peer
#[derive(Debug)]
pub struct PeerOutcome {
    pub addr: String,
    /// Bytes streamed to the peer, IV included
    pub result: Result<u64, ServerError>,
}

/// Per-peer results of a `store` call
#[derive(Debug, Default)]
pub struct ReplicationReport {
    /// Plaintext bytes written locally
    pub local_bytes: u64,
    pub outcomes: Vec<PeerOutcome>,
}

impl ReplicationReport {
    pub fn all_succeeded(&self) -> bool {
        self.outcomes.iter().all(|o| o.result.is_ok())
    }

    pub fn succeeded(&self) -> impl Iterator<Item = &PeerOutcome> {
        self.outcomes.iter().filter(|o| o.result.is_ok())
    }

    pub fn failed(&self) -> impl Iterator<Item = &PeerOutcome> {
        self.outcomes.iter().filter(|o| o.result.is_err())
    }
}

/// Node construction inputs
pub struct FileServerOpts<T: Transport> {
    /// Fixed node id; random if unset
    pub id: Option<String>,
    /// Fixed key; random if unset
    pub enc_key: Option<EncryptionKey>,
    pub storage_root: PathBuf,
    pub path_transform: PathTransform,
    pub transport: T,
    pub bootstrap_nodes: Vec<String>,
    /// Called after a peer has been registered
    pub on_peer: Option<OnPeer<T::Peer>>,
    /// StoreFile to StoreAck wait, per peer
    pub ack_timeout: Duration,
    /// Wait for a peer's stream to arrive
    pub stream_timeout: Duration,
}

impl<T: Transport> FileServerOpts<T> {
    pub fn new(transport: T) -> Self {
        Self {
            id: None,
            enc_key: None,
            storage_root: PathBuf::from(DEFAULT_ROOT),
            path_transform: cas_path_transform,
            transport,
            bootstrap_nodes: Vec::new(),
            on_peer: None,
            ack_timeout: Duration::from_secs(2),
            stream_timeout: Duration::from_secs(5),
        }
    }
}

/// A registered peer and the lease on its inbound stream.
///
/// Streams are only requested (GetFile, StoreAck) while holding the lease,
/// and the lease is kept until the stream is consumed. At most one requested
/// stream is in flight per connection, so the next `0x02` always belongs to
/// the holder.
struct Link<P> {
    peer: Arc<P>,
    inbound: Mutex<()>,
}

/// Connected peers keyed by remote address
struct PeerMap<P> {
    peers: Mutex<HashMap<String, Arc<Link<P>>>>,
}

impl<P: Peer> PeerMap<P> {
    fn new() -> Self {
        Self {
            peers: Mutex::new(HashMap::new()),
        }
    }

    fn insert(&self, peer: Arc<P>) {
        let addr = peer.remote_addr().to_string();
        let link = Arc::new(Link {
            peer,
            inbound: Mutex::new(()),
        });
        self.peers.lock().insert(addr, link);
    }

    fn remove(&self, addr: &str) -> Option<Arc<Link<P>>> {
        self.peers.lock().remove(addr)
    }

    fn get(&self, addr: &str) -> Option<Arc<Link<P>>> {
        self.peers.lock().get(addr).cloned()
    }

    fn snapshot(&self) -> Vec<Arc<Link<P>>> {
        self.peers.lock().values().cloned().collect()
    }

    fn addrs(&self) -> Vec<String> {
        self.peers.lock().keys().cloned().collect()
    }

    fn len(&self) -> usize {
        self.peers.lock().len()
    }
}

type AckSlots = Mutex<HashMap<(String, String), Sender<()>>>;

/// Replica bodies still being written, keyed by (owner id, key)
struct Ingests {
    active: Mutex<HashMap<(String, String), usize>>,
    done: Condvar,
}

impl Ingests {
    fn new() -> Self {
        Self {
            active: Mutex::new(HashMap::new()),
            done: Condvar::new(),
        }
    }

    fn begin(&self, id: &str, key: &str) -> IngestGuard<'_> {
        let entry = (id.to_string(), key.to_string());
        *self.active.lock().entry(entry.clone()).or_insert(0) += 1;
        IngestGuard {
            ingests: self,
            entry,
        }
    }

    /// Wait until no body for (id, key) is being written. False on timeout.
    fn wait_idle(&self, id: &str, key: &str, timeout: Duration) -> bool {
        let entry = (id.to_string(), key.to_string());
        let deadline = Instant::now() + timeout;
        let mut active = self.active.lock();
        while active.contains_key(&entry) {
            if self.done.wait_until(&mut active, deadline).timed_out() {
                return !active.contains_key(&entry);
            }
        }
        true
    }
}

struct IngestGuard<'a> {
    ingests: &'a Ingests,
    entry: (String, String),
}

impl Drop for IngestGuard<'_> {
    fn drop(&mut self) {
        let mut active = self.ingests.active.lock();
        if let Some(count) = active.get_mut(&self.entry) {
            *count -= 1;
            if *count == 0 {
                active.remove(&self.entry);
            }
        }
        self.ingests.done.notify_all();
    }
}

/// A storage node in the network
pub struct FileServer<T: Transport> {
    id: String,
    enc_key: EncryptionKey,
    store: Store,
    transport: Arc<T>,
    bootstrap_nodes: Vec<String>,
    peers: Arc<PeerMap<T::Peer>>,
    on_peer: Option<OnPeer<T::Peer>>,
    acks: AckSlots,
    ingests: Ingests,
    ops: Mutex<()>,
    quit_tx: Sender<()>,
    quit_rx: Receiver<()>,
    ack_timeout: Duration,
    stream_timeout: Duration,
}

impl<T: Transport> FileServer<T> {
    pub fn new(opts: FileServerOpts<T>) -> Self {
        let store = Store::new(StoreOpts {
            root: opts.storage_root,
            path_transform: opts.path_transform,
        });
        let id = opts
            .id
            .filter(|id| !id.is_empty())
            .unwrap_or_else(crypto::generate_id);
        let enc_key = opts.enc_key.unwrap_or_else(EncryptionKey::generate);

        let peers = Arc::new(PeerMap::new());
        let transport = Arc::new(opts.transport);

        let registry = Arc::clone(&peers);
        let user_on_peer = opts.on_peer.clone();
        transport.set_on_peer(Arc::new(
            move |peer: Arc<T::Peer>| -> Result<(), TransportError> {
                register_peer(&registry, user_on_peer.as_ref(), peer)
            },
        ));

        let registry = Arc::clone(&peers);
        transport.set_on_peer_drop(Arc::new(move |peer: &T::Peer| {
            let addr = peer.remote_addr().to_string();
            if registry.remove(&addr).is_some() {
                log::info!("disconnected from remote {}", addr);
            }
        }));

        let (quit_tx, quit_rx) = channel::bounded(1);

        Self {
            id,
            enc_key,
            store,
            transport,
            bootstrap_nodes: opts.bootstrap_nodes,
            peers,
            on_peer: opts.on_peer,
            acks: Mutex::new(HashMap::new()),
            ingests: Ingests::new(),
            ops: Mutex::new(()),
            quit_tx,
            quit_rx,
            ack_timeout: opts.ack_timeout,
            stream_timeout: opts.stream_timeout,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn addr(&self) -> String {
        self.transport.addr()
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    pub fn peer_addrs(&self) -> Vec<String> {
        self.peers.addrs()
    }

    pub fn has_local(&self, key: &str) -> bool {
        self.store.has(&self.id, key)
    }

    /// Remove the local copy only; replicas on peers are untouched
    pub fn delete_local(&self, key: &str) -> Result<(), ServerError> {
        self.store.delete(&self.id, key)?;
        Ok(())
    }

    /// Register a connected peer
    pub fn on_peer(&self, peer: Arc<T::Peer>) -> Result<(), TransportError> {
        register_peer(&self.peers, self.on_peer.as_ref(), peer)
    }

    /// Bind, dial the bootstrap nodes and run the dispatch loop until stopped
    pub fn start(&self) -> Result<(), ServerError> {
        log::info!("[{}] starting fileserver...", self.addr());

        self.transport.listen_and_accept()?;
        self.bootstrap_network();
        self.run_loop();

        Ok(())
    }

    /// Signal the dispatch loop to exit; the transport is closed on the way out
    pub fn stop(&self) {
        let _ = self.quit_tx.try_send(());
    }

    /// Write `src` locally and replicate it, encrypted, to every connected peer.
    ///
    /// Fails only if the local write fails. Peer failures are reported per
    /// peer in the returned report.
    pub fn store<R: Read>(&self, key: &str, src: &mut R) -> Result<ReplicationReport, ServerError> {
        let _op = self.ops.lock();

        let mut buffer = Vec::new();
        let local_bytes = self.store.write(
            &self.id,
            key,
            &mut TeeReader {
                inner: src,
                copy: &mut buffer,
            },
        )?;

        let digest = crypto::hash_key(key);
        let payload = Message::StoreFile {
            id: self.id.clone(),
            key: digest.clone(),
            size: local_bytes + BLOCK_SIZE as u64,
        }
        .encode()?;

        let links = self.peers.snapshot();
        let mut waiting = Vec::with_capacity(links.len());
        {
            let mut acks = self.acks.lock();
            for link in links {
                let (tx, rx) = channel::bounded(1);
                acks.insert((link.peer.remote_addr().to_string(), digest.clone()), tx);
                waiting.push((link, rx));
            }
        }

        let (payload, buffer) = (&payload, &buffer);
        let outcomes: Vec<PeerOutcome> = thread::scope(|s| {
            let handles: Vec<_> = waiting
                .into_iter()
                .map(|(link, ack)| {
                    let addr = link.peer.remote_addr().to_string();
                    let handle = s.spawn(move || {
                        self.replicate_to(link.peer.as_ref(), payload, &ack, buffer)
                    });
                    (addr, handle)
                })
                .collect();

            handles
                .into_iter()
                .map(|(addr, handle)| PeerOutcome {
                    addr,
                    result: handle.join().unwrap_or_else(|_| {
                        Err(ServerError::Io(io::Error::new(
                            io::ErrorKind::Other,
                            "replication worker panicked",
                        )))
                    }),
                })
                .collect()
        });

        {
            let mut acks = self.acks.lock();
            for outcome in &outcomes {
                acks.remove(&(outcome.addr.clone(), digest.clone()));
            }
        }

        for outcome in &outcomes {
            match &outcome.result {
                Ok(n) => log::info!(
                    "[{}] replicated ({}) bytes of ({}) to {}",
                    self.addr(),
                    n,
                    key,
                    outcome.addr
                ),
                Err(e) => log::warn!(
                    "[{}] failed to replicate ({}) to {}: {}",
                    self.addr(),
                    key,
                    outcome.addr,
                    e
                ),
            }
        }

        Ok(ReplicationReport {
            local_bytes,
            outcomes,
        })
    }

    /// Read a file, fetching it from peers first if it is not held locally
    pub fn get(&self, key: &str) -> Result<File, ServerError> {
        let _op = self.ops.lock();

        if self.store.has(&self.id, key) {
            log::info!("[{}] serving file ({}) from local disk", self.addr(), key);
            let (_, file) = self.store.read(&self.id, key)?;
            return Ok(file);
        }

        log::info!(
            "[{}] don't have file ({}) locally, fetching from network...",
            self.addr(),
            key
        );

        let payload = Message::GetFile {
            id: self.id.clone(),
            key: crypto::hash_key(key),
        }
        .encode()?;

        let links = self.peers.snapshot();
        let write_lock = Mutex::new(());
        let (payload, write_lock) = (&payload, &write_lock);

        thread::scope(|s| {
            let handles: Vec<_> = links
                .iter()
                .map(|link| {
                    let handle =
                        s.spawn(move || self.fetch_from(link.as_ref(), payload, key, write_lock));
                    (link.peer.remote_addr(), handle)
                })
                .collect();

            for (addr, handle) in handles {
                match handle.join() {
                    Ok(Ok(0)) => log::debug!("[{}] {} does not hold ({})", self.addr(), addr, key),
                    Ok(Ok(n)) => log::info!(
                        "[{}] received ({}) bytes over the network from ({})",
                        self.addr(),
                        n,
                        addr
                    ),
                    Ok(Err(e)) => log::warn!("[{}] fetch from {} failed: {}", self.addr(), addr, e),
                    Err(_) => log::error!("[{}] fetch worker for {} panicked", self.addr(), addr),
                }
            }
        });

        match self.store.read(&self.id, key) {
            Ok((_, file)) => Ok(file),
            Err(StorageError::NotFound { .. }) => Err(ServerError::NotFound(key.to_string())),
            Err(e) => Err(e.into()),
        }
    }

    fn replicate_to(
        &self,
        peer: &T::Peer,
        payload: &[u8],
        ack: &Receiver<()>,
        plaintext: &[u8],
    ) -> Result<u64, ServerError> {
        write_message(&mut *peer.writer(), payload)?;

        ack.recv_timeout(self.ack_timeout)
            .map_err(|_| ServerError::AckTimeout {
                addr: peer.remote_addr().to_string(),
                waited: self.ack_timeout,
            })?;

        let mut writer = peer.writer();
        write_stream_signal(&mut writer)?;
        let n = copy_encrypt(self.enc_key.as_bytes(), &mut &plaintext[..], &mut writer)?;
        Ok(n)
    }

    /// Ask one peer for the file and ingest its reply. Returns 0 on a miss.
    fn fetch_from(
        &self,
        link: &Link<T::Peer>,
        payload: &[u8],
        key: &str,
        write_lock: &Mutex<()>,
    ) -> Result<u64, ServerError> {
        let peer = link.peer.as_ref();
        let _lease = link.inbound.lock();
        write_message(&mut *peer.writer(), payload)?;

        let mut stream = match peer.claim_stream(self.stream_timeout) {
            Ok(stream) => stream,
            Err(e @ TransportError::StreamTimeout { .. }) => {
                // The reply is still owed and would land on the next lease holder
                peer.close();
                return Err(e.into());
            }
            Err(e) => return Err(e.into()),
        };
        let size = stream.read_u64::<LittleEndian>()?;
        if size == 0 {
            return Ok(0);
        }

        let mut body = (&mut stream).take(size);
        let result = {
            let _write = write_lock.lock();
            self.store
                .write_decrypt(self.enc_key.as_bytes(), &self.id, key, &mut body)
        };
        // Keep the connection in sync even if the write failed part way
        io::copy(&mut body, &mut io::sink())?;

        Ok(result?)
    }

    fn bootstrap_network(&self) {
        for addr in self.bootstrap_nodes.iter().filter(|addr| !addr.is_empty()) {
            let transport = Arc::clone(&self.transport);
            let addr = addr.clone();
            let local = self.addr();
            thread::spawn(move || {
                log::info!("[{}] attempting to connect with remote {}", local, addr);
                if let Err(e) = transport.dial(&addr) {
                    log::error!("[{}] dial error ({}): {}", local, addr, e);
                }
            });
        }
    }

    fn run_loop(&self) {
        let rpcs = self.transport.consume();

        thread::scope(|s| {
            loop {
                let rpc = select! {
                    recv(rpcs) -> rpc => rpc.ok(),
                    recv(self.quit_rx) -> _ => None,
                };
                let rpc = match rpc {
                    Some(rpc) => rpc,
                    None => break,
                };

                let msg = match Message::decode(&rpc.payload) {
                    Ok(msg) => msg,
                    Err(e) => {
                        log::warn!("[{}] decoding error from {}: {}", self.addr(), rpc.from, e);
                        continue;
                    }
                };

                let from = rpc.from;
                match msg {
                    // Ingest off the loop so acks and replies keep draining meanwhile
                    Message::StoreFile { id, key, size } => {
                        let ingest = self.ingests.begin(&id, &key);
                        s.spawn(move || {
                            let _ingest = ingest;
                            self.report(self.handle_store_file(&from, &id, &key, size))
                        });
                    }
                    Message::GetFile { id, key } => self.report(self.handle_get_file(&from, &id, &key)),
                    Message::StoreAck { id: _, key } => self.handle_store_ack(&from, key),
                }
            }

            log::info!("[{}] file server stopped due to error or user quit action", self.addr());
            // Wakes ingest threads still waiting on a stream
            if let Err(e) = self.transport.close() {
                log::warn!("[{}] closing transport: {}", self.addr(), e);
            }
        });
    }

    fn report(&self, result: Result<(), ServerError>) {
        if let Err(e) = result {
            log::warn!("[{}] handle message error: {}", self.addr(), e);
        }
    }

    fn handle_store_file(&self, from: &str, id: &str, key: &str, size: u64) -> Result<(), ServerError> {
        let link = self
            .peers
            .get(from)
            .ok_or_else(|| ServerError::UnknownPeer(from.to_string()))?;

        // Past the ack window the sender has given up; never ack late
        let _lease = link
            .inbound
            .try_lock_for(self.ack_timeout)
            .ok_or_else(|| ServerError::StreamBusy {
                addr: from.to_string(),
                waited: self.ack_timeout,
            })?;
        let peer = link.peer.as_ref();

        let ack = Message::StoreAck {
            id: id.to_string(),
            key: key.to_string(),
        }
        .encode()?;
        write_message(&mut *peer.writer(), &ack)?;

        let stream = peer.claim_stream(self.stream_timeout)?;
        let mut body = stream.take(size);
        let result = self.store.write(id, key, &mut body);
        io::copy(&mut body, &mut io::sink())?;
        let n = result?;

        log::info!("[{}] written ({}) bytes to disk", self.addr(), n);
        Ok(())
    }

    fn handle_get_file(&self, from: &str, id: &str, key: &str) -> Result<(), ServerError> {
        let link = self
            .peers
            .get(from)
            .ok_or_else(|| ServerError::UnknownPeer(from.to_string()))?;
        let peer = link.peer.as_ref();

        // A replica announced earlier on this connection may still be landing
        if !self
            .ingests
            .wait_idle(id, key, self.ack_timeout + self.stream_timeout)
        {
            log::warn!("[{}] serving ({}) while its replica is still being written", self.addr(), key);
        }

        let found = match self.store.read(id, key) {
            Ok(found) => Ok(Some(found)),
            Err(StorageError::NotFound { .. }) => Ok(None),
            Err(e) => Err(e),
        };

        let mut writer = peer.writer();
        write_stream_signal(&mut writer)?;

        let (size, mut file) = match found {
            Ok(Some(found)) => found,
            Ok(None) => {
                writer.write_u64::<LittleEndian>(0)?;
                writer.flush()?;
                log::warn!(
                    "[{}] need to serve file ({}) but it does not exist on disk",
                    self.addr(),
                    key
                );
                return Ok(());
            }
            Err(e) => {
                writer.write_u64::<LittleEndian>(0)?;
                writer.flush()?;
                return Err(e.into());
            }
        };

        log::info!("[{}] serving file ({}) over the network", self.addr(), key);
        writer.write_u64::<LittleEndian>(size)?;
        let n = io::copy(&mut (&mut file).take(size), &mut writer)?;
        // Pad if the file shrank underneath us so the stream stays in sync
        if n < size {
            io::copy(&mut io::repeat(0).take(size - n), &mut writer)?;
        }
        writer.flush()?;

        log::info!("[{}] written ({}) bytes over the network to {}", self.addr(), n, from);
        Ok(())
    }

    fn handle_store_ack(&self, from: &str, key: String) {
        match self.acks.lock().remove(&(from.to_string(), key)) {
            Some(tx) => {
                let _ = tx.try_send(());
            }
            None => log::warn!("[{}] unexpected store ack from {}", self.addr(), from),
        }
    }
}

fn register_peer<P: Peer>(
    peers: &PeerMap<P>,
    user_on_peer: Option<&OnPeer<P>>,
    peer: Arc<P>,
) -> Result<(), TransportError> {
    let addr = peer.remote_addr().to_string();
    peers.insert(Arc::clone(&peer));
    log::info!("connected with remote {}", addr);

    if let Some(on_peer) = user_on_peer {
        if let Err(e) = on_peer(peer) {
            peers.remove(&addr);
            return Err(e);
        }
    }
    Ok(())
}

/// Copies everything read through it into `copy`
struct TeeReader<'a, R> {
    inner: &'a mut R,
    copy: &'a mut Vec<u8>,
}

impl<R: Read> Read for TeeReader<'_, R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.copy.extend_from_slice(&buf[..n]);
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tee_reader_copies() {
        let mut src = &b"tee me please"[..];
        let mut copy = Vec::new();
        let mut out = Vec::new();
        io::copy(
            &mut TeeReader {
                inner: &mut src,
                copy: &mut copy,
            },
            &mut out,
        )
        .unwrap();
        assert_eq!(out, b"tee me please");
        assert_eq!(copy, out);
    }

    #[test]
    fn test_report_partitions_outcomes() {
        let report = ReplicationReport {
            local_bytes: 4,
            outcomes: vec![
                PeerOutcome {
                    addr: "a".into(),
                    result: Ok(20),
                },
                PeerOutcome {
                    addr: "b".into(),
                    result: Err(ServerError::AckTimeout {
                        addr: "b".into(),
                        waited: Duration::from_millis(1),
                    }),
                },
            ],
        };
        assert!(!report.all_succeeded());
        assert_eq!(report.succeeded().map(|o| o.addr.as_str()).collect::<Vec<_>>(), ["a"]);
        assert_eq!(report.failed().map(|o| o.addr.as_str()).collect::<Vec<_>>(), ["b"]);
        assert!(ReplicationReport::default().all_succeeded());
    }
}
