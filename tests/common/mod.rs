#![allow(dead_code)]

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use vaultnode::p2p::{TcpTransport, TcpTransportOpts};
use vaultnode::server::{FileServer, FileServerOpts, ServerError};

pub type Node = Arc<FileServer<TcpTransport>>;

/// A node running its dispatch loop on a background thread
pub struct Running {
    pub node: Node,
    pub addr: SocketAddr,
    handle: Option<JoinHandle<Result<(), ServerError>>>,
}

impl Running {
    /// Stop the node and wait for `start` to return
    pub fn shutdown(mut self) -> Result<(), ServerError> {
        self.node.stop();
        match self.handle.take() {
            Some(handle) => handle.join().expect("server thread panicked"),
            None => Ok(()),
        }
    }
}

impl Drop for Running {
    fn drop(&mut self) {
        self.node.stop();
    }
}

pub fn opts(root: &Path, bootstrap: Vec<String>) -> FileServerOpts<TcpTransport> {
    let transport = TcpTransport::new(TcpTransportOpts::new("127.0.0.1:0"));
    let mut opts = FileServerOpts::new(transport);
    opts.storage_root = root.to_path_buf();
    opts.bootstrap_nodes = bootstrap;
    opts.ack_timeout = Duration::from_secs(2);
    opts.stream_timeout = Duration::from_secs(2);
    opts
}

pub fn spawn(opts: FileServerOpts<TcpTransport>) -> Running {
    let node = Arc::new(FileServer::new(opts));

    let handle = {
        let node = Arc::clone(&node);
        thread::spawn(move || node.start())
    };

    wait_until("node to listen", || node.transport().local_addr().is_some());
    let addr = node
        .transport()
        .local_addr()
        .expect("listening node has an address");

    Running {
        node,
        addr,
        handle: Some(handle),
    }
}

pub fn spawn_node(root: &Path, bootstrap: Vec<String>) -> Running {
    spawn(opts(root, bootstrap))
}

pub fn wait_until(what: &str, mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        thread::sleep(Duration::from_millis(10));
    }
}
