//! Peer-to-peer transport
//!
//! One TCP connection per peer carries two kinds of traffic:
//! `[0x01][u32 len][payload]` control frames, decoded by the connection's read
//! loop and queued as [`Rpc`]s, and `[0x02]` followed by raw bytes that are
//! read directly off the connection by whoever claimed the stream.
//!
//! While a stream is in flight the read loop is parked on the peer's gate.
//! A consumer claims it with [`Peer::await_stream`] and hands it back with
//! [`Peer::close_stream`].

mod gate;
mod protocol;
mod tcp;

pub use protocol::{
    write_message, write_stream_signal, Decoder, DefaultDecoder, INCOMING_MESSAGE,
    INCOMING_STREAM, MAX_FRAME_SIZE,
};
pub use tcp::{TcpPeer, TcpTransport, TcpTransportOpts};

use crossbeam::channel::Receiver;
use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Capacity of the inbound RPC queue
pub const RPC_QUEUE_CAPACITY: usize = 1024;

/// Transport errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("handshake failed: {0}")]
    Handshake(String),

    #[error("peer rejected: {0}")]
    PeerRejected(String),

    #[error("decode error: {0}")]
    Decode(String),

    #[error("no stream from {addr} within {waited:?}")]
    StreamTimeout { addr: String, waited: Duration },

    #[error("connection closed")]
    Closed,

    #[error("transport is not listening")]
    NotListening,
}

/// A decoded unit from one connection.
///
/// `stream` RPCs carry no payload; they never reach the inbound queue.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Rpc {
    pub from: String,
    pub payload: Vec<u8>,
    pub stream: bool,
}

/// Runs once per new connection before the peer is registered
pub type HandshakeFn<P> = Arc<dyn Fn(&P) -> Result<(), TransportError> + Send + Sync>;

/// Called once the handshake succeeded; an error drops the connection
pub type OnPeer<P> = Arc<dyn Fn(Arc<P>) -> Result<(), TransportError> + Send + Sync>;

/// Called after the read loop of a registered peer exited
pub type OnPeerDrop<P> = Arc<dyn Fn(&P) + Send + Sync>;

/// Handshake that accepts every peer
pub fn nop_handshake<P: 'static>() -> HandshakeFn<P> {
    Arc::new(|_: &P| -> Result<(), TransportError> { Ok(()) })
}

/// One live connection to a remote node
pub trait Peer: Send + Sync + 'static {
    fn remote_addr(&self) -> SocketAddr;

    /// True if we dialed, false if we accepted
    fn is_outbound(&self) -> bool;

    /// Exclusive writer. Hold it across a tag and its body so concurrent
    /// senders cannot interleave on the wire.
    fn writer(&self) -> Box<dyn Write + '_>;

    /// Raw read from the connection. Only valid while holding a claimed stream.
    fn recv(&self, buf: &mut [u8]) -> io::Result<usize>;

    /// Wait for the read loop to park on a stream signal and take it over
    fn await_stream(&self, timeout: Duration) -> Result<(), TransportError>;

    /// Hand the connection back to the read loop
    fn close_stream(&self);

    /// Shut the connection down
    fn close(&self);

    /// Claim the next stream as a reader that releases the gate on drop
    fn claim_stream(&self, timeout: Duration) -> Result<StreamReader<'_, Self>, TransportError>
    where
        Self: Sized,
    {
        self.await_stream(timeout)?;
        Ok(StreamReader { peer: self })
    }
}

/// Claimed stream on a peer connection
pub struct StreamReader<'a, P: Peer> {
    peer: &'a P,
}

impl<P: Peer> Read for StreamReader<'_, P> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.peer.recv(buf)
    }
}

impl<P: Peer> Drop for StreamReader<'_, P> {
    fn drop(&mut self) {
        self.peer.close_stream();
    }
}

/// Anything that can carry peers between nodes
pub trait Transport: Send + Sync + 'static {
    type Peer: Peer;

    /// Configured listen address
    fn addr(&self) -> String;

    /// Connect to a remote node; the connection is handled like an accepted one
    fn dial(&self, addr: &str) -> Result<(), TransportError>;

    /// Bind and start accepting in the background
    fn listen_and_accept(&self) -> Result<(), TransportError>;

    /// Inbound control messages from every connection
    fn consume(&self) -> Receiver<Rpc>;

    /// Stop accepting and shut down live connections
    fn close(&self) -> Result<(), TransportError>;

    fn set_on_peer(&self, on_peer: OnPeer<Self::Peer>);

    fn set_on_peer_drop(&self, on_drop: OnPeerDrop<Self::Peer>);
}
