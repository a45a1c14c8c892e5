//! TCP transport
//!
//! One thread accepts, one thread per connection runs the read loop. All read
//! loops feed a single bounded queue; a full queue blocks the producing
//! connection only.

use super::gate::{GateError, StreamGate};
use super::{
    nop_handshake, Decoder, DefaultDecoder, HandshakeFn, OnPeer, OnPeerDrop, Peer, Rpc,
    Transport, TransportError, RPC_QUEUE_CAPACITY,
};
use crossbeam::channel::{self, Receiver, Sender};
use parking_lot::{Mutex, MutexGuard, RwLock};
use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::net::{IpAddr, Ipv4Addr, Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// Remote node reached over TCP
pub struct TcpPeer {
    remote_addr: SocketAddr,
    outbound: bool,
    reader: TcpStream,
    writer: Mutex<TcpStream>,
    gate: StreamGate,
}

impl TcpPeer {
    pub fn new(conn: TcpStream, outbound: bool) -> io::Result<Self> {
        let remote_addr = conn.peer_addr()?;
        let writer = conn.try_clone()?;
        Ok(Self {
            remote_addr,
            outbound,
            reader: conn,
            writer: Mutex::new(writer),
            gate: StreamGate::new(),
        })
    }

    fn gate_error(&self, e: GateError, waited: Duration) -> TransportError {
        match e {
            GateError::Timeout => TransportError::StreamTimeout {
                addr: self.remote_addr.to_string(),
                waited,
            },
            GateError::Closed => TransportError::Closed,
        }
    }
}

struct PeerWriter<'a>(MutexGuard<'a, TcpStream>);

impl Write for PeerWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.0.flush()
    }
}

impl Peer for TcpPeer {
    fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    fn is_outbound(&self) -> bool {
        self.outbound
    }

    fn writer(&self) -> Box<dyn Write + '_> {
        Box::new(PeerWriter(self.writer.lock()))
    }

    fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        (&self.reader).read(buf)
    }

    fn await_stream(&self, timeout: Duration) -> Result<(), TransportError> {
        self.gate
            .claim(timeout)
            .map_err(|e| self.gate_error(e, timeout))
    }

    fn close_stream(&self) {
        self.gate.release();
    }

    fn close(&self) {
        self.gate.close();
        let _ = self.reader.shutdown(Shutdown::Both);
    }
}

/// TCP transport configuration
pub struct TcpTransportOpts {
    pub listen_addr: String,
    pub handshake: HandshakeFn<TcpPeer>,
    pub decoder: Arc<dyn Decoder>,
    /// How long a stream may sit unclaimed before the connection is dropped
    pub stream_timeout: Duration,
    pub on_peer: Option<OnPeer<TcpPeer>>,
}

impl TcpTransportOpts {
    pub fn new(listen_addr: impl Into<String>) -> Self {
        Self {
            listen_addr: listen_addr.into(),
            handshake: nop_handshake(),
            decoder: Arc::new(DefaultDecoder),
            stream_timeout: Duration::from_secs(5),
            on_peer: None,
        }
    }
}

#[derive(Default)]
struct Hooks {
    on_peer: Option<OnPeer<TcpPeer>>,
    on_drop: Option<OnPeerDrop<TcpPeer>>,
}

struct Inner {
    listen_addr: String,
    handshake: HandshakeFn<TcpPeer>,
    decoder: Arc<dyn Decoder>,
    stream_timeout: Duration,
    hooks: RwLock<Hooks>,
    rpc_tx: Sender<Rpc>,
    rpc_rx: Receiver<Rpc>,
    local_addr: Mutex<Option<SocketAddr>>,
    closed: AtomicBool,
    conns: Mutex<HashMap<SocketAddr, Arc<TcpPeer>>>,
}

/// TCP implementation of [`Transport`]
#[derive(Clone)]
pub struct TcpTransport {
    inner: Arc<Inner>,
}

impl TcpTransport {
    pub fn new(opts: TcpTransportOpts) -> Self {
        let (rpc_tx, rpc_rx) = channel::bounded(RPC_QUEUE_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                listen_addr: opts.listen_addr,
                handshake: opts.handshake,
                decoder: opts.decoder,
                stream_timeout: opts.stream_timeout,
                hooks: RwLock::new(Hooks {
                    on_peer: opts.on_peer,
                    on_drop: None,
                }),
                rpc_tx,
                rpc_rx,
                local_addr: Mutex::new(None),
                closed: AtomicBool::new(false),
                conns: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Address actually bound, once listening
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.inner.local_addr.lock()
    }

    /// Number of connections with a running read loop
    pub fn connection_count(&self) -> usize {
        self.inner.conns.lock().len()
    }
}

impl Transport for TcpTransport {
    type Peer = TcpPeer;

    fn addr(&self) -> String {
        self.inner.listen_addr.clone()
    }

    fn dial(&self, addr: &str) -> Result<(), TransportError> {
        let conn = TcpStream::connect(addr)?;
        let inner = Arc::clone(&self.inner);
        thread::spawn(move || inner.handle_conn(conn, true));
        Ok(())
    }

    fn listen_and_accept(&self) -> Result<(), TransportError> {
        let listener = TcpListener::bind(&self.inner.listen_addr)?;
        let local_addr = listener.local_addr()?;
        *self.inner.local_addr.lock() = Some(local_addr);

        let inner = Arc::clone(&self.inner);
        thread::spawn(move || inner.accept_loop(listener));

        log::info!("TCP transport listening on {}", local_addr);
        Ok(())
    }

    fn consume(&self) -> Receiver<Rpc> {
        self.inner.rpc_rx.clone()
    }

    fn close(&self) -> Result<(), TransportError> {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let local_addr = self.local_addr().ok_or(TransportError::NotListening);

        // Wake the accept loop so it observes the flag and drops the listener
        if let Ok(mut addr) = local_addr {
            if addr.ip().is_unspecified() {
                addr.set_ip(IpAddr::V4(Ipv4Addr::LOCALHOST));
            }
            let _ = TcpStream::connect(addr);
        }

        let peers: Vec<Arc<TcpPeer>> = self.inner.conns.lock().values().cloned().collect();
        for peer in peers {
            peer.close();
        }

        local_addr.map(|_| ())
    }

    fn set_on_peer(&self, on_peer: OnPeer<TcpPeer>) {
        self.inner.hooks.write().on_peer = Some(on_peer);
    }

    fn set_on_peer_drop(&self, on_drop: OnPeerDrop<TcpPeer>) {
        self.inner.hooks.write().on_drop = Some(on_drop);
    }
}

impl Inner {
    fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        for stream in listener.incoming() {
            if self.closed.load(Ordering::SeqCst) {
                break;
            }

            match stream {
                Ok(conn) => {
                    let inner = Arc::clone(&self);
                    thread::spawn(move || inner.handle_conn(conn, false));
                }
                Err(e) => log::error!("TCP accept error: {}", e),
            }
        }
        log::debug!("accept loop on {} stopped", self.listen_addr);
    }

    fn handle_conn(&self, conn: TcpStream, outbound: bool) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }

        let peer = match TcpPeer::new(conn, outbound) {
            Ok(peer) => Arc::new(peer),
            Err(e) => {
                log::warn!("dropping peer connection: {}", e);
                return;
            }
        };
        let remote = peer.remote_addr;
        self.conns.lock().insert(remote, Arc::clone(&peer));

        let mut registered = false;
        let result = self.register(&peer).and_then(|()| {
            registered = true;
            log::info!(
                "peer connected: {} ({})",
                remote,
                if outbound { "outbound" } else { "inbound" }
            );
            self.read_loop(&peer)
        });

        match &result {
            Err(TransportError::Io(e)) if e.kind() == io::ErrorKind::UnexpectedEof => {
                log::info!("peer {} disconnected", remote)
            }
            Err(e) => log::warn!("dropping peer connection {}: {}", remote, e),
            Ok(()) => {}
        }

        peer.close();
        self.conns.lock().remove(&remote);

        if registered {
            let on_drop = self.hooks.read().on_drop.clone();
            if let Some(on_drop) = on_drop {
                on_drop(peer.as_ref());
            }
        }
    }

    fn register(&self, peer: &Arc<TcpPeer>) -> Result<(), TransportError> {
        (self.handshake)(peer.as_ref())?;

        let on_peer = self.hooks.read().on_peer.clone();
        if let Some(on_peer) = on_peer {
            on_peer(Arc::clone(peer))?;
        }
        Ok(())
    }

    fn read_loop(&self, peer: &TcpPeer) -> Result<(), TransportError> {
        let mut reader = &peer.reader;
        let from = peer.remote_addr.to_string();

        loop {
            let mut rpc = Rpc::default();
            self.decoder.decode(&mut reader, &mut rpc)?;
            rpc.from = from.clone();

            if rpc.stream {
                log::debug!("[{}] incoming stream, waiting...", from);
                peer.gate
                    .hold(self.stream_timeout)
                    .map_err(|e| peer.gate_error(e, self.stream_timeout))?;
                log::debug!("[{}] stream closed, resuming read loop", from);
                continue;
            }

            self.rpc_tx.send(rpc).map_err(|_| TransportError::Closed)?;
        }
    }
}
