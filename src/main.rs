//! vaultnode - peer-to-peer storage node with encrypted replication
//!
//! Usage:
//!   vaultnode [OPTIONS] [CONFIG]
//!
//! Example:
//!   vaultnode /etc/vaultnode.toml
//!   vaultnode --listen 127.0.0.1:4000 --bootstrap 127.0.0.1:3000 --root ./b_data

use anyhow::{bail, Context, Result};
use clap::Parser;
use env_logger::Env;
use std::path::PathBuf;
use vaultnode::config::Config;
use vaultnode::p2p::{TcpTransport, TcpTransportOpts};
use vaultnode::server::{FileServer, FileServerOpts};

#[derive(Parser, Debug)]
#[command(name = "vaultnode")]
#[command(about = "Peer-to-peer content-addressable storage node", long_about = None)]
struct Args {
    /// Path to configuration file (TOML)
    config: Option<PathBuf>,

    /// Listen address, overrides the config file (e.g., 127.0.0.1:3000)
    #[arg(short, long)]
    listen: Option<String>,

    /// Bootstrap node address, may be repeated; replaces the configured list
    #[arg(short, long)]
    bootstrap: Vec<String>,

    /// Storage root directory
    #[arg(short, long)]
    root: Option<PathBuf>,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = match (&args.config, &args.listen) {
        (Some(path), _) => Config::load(path)
            .with_context(|| format!("failed to load config from {}", path.display()))?,
        (None, Some(listen)) => Config::with_listen_addr(listen.clone()),
        (None, None) => bail!("either a config file or --listen is required"),
    };

    if let Some(listen) = args.listen {
        config.node.listen_addr = listen;
    }
    if !args.bootstrap.is_empty() {
        config.node.bootstrap = args.bootstrap;
    }
    if let Some(root) = args.root {
        config.node.storage_root = root;
    }
    config.validate().context("invalid configuration")?;

    // RUST_LOG wins over the configured level
    env_logger::Builder::new()
        .filter_level(parse_log_level(&config.node.log_level))
        .parse_env(Env::default())
        .init();

    log::info!("vaultnode v{}", env!("CARGO_PKG_VERSION"));
    if let Some(path) = &args.config {
        log::info!("Loaded configuration from {}", path.display());
    }

    let enc_key = config.encryption_key().context("invalid encryption key")?;

    let mut transport_opts = TcpTransportOpts::new(config.node.listen_addr.clone());
    transport_opts.stream_timeout = config.timeouts.stream();
    let transport = TcpTransport::new(transport_opts);

    let mut opts = FileServerOpts::new(transport);
    opts.id = config.node.id.clone();
    opts.enc_key = enc_key;
    opts.storage_root = config.node.storage_root.clone();
    opts.path_transform = config.node.path_transform.transform();
    opts.bootstrap_nodes = config.node.bootstrap.clone();
    opts.ack_timeout = config.timeouts.ack();
    opts.stream_timeout = config.timeouts.stream();

    let server = FileServer::new(opts);

    log::info!("  Node id: {}", server.id());
    log::info!("  Listen address: {}", config.node.listen_addr);
    log::info!("  Storage root: {}", config.node.storage_root.display());
    log::info!("  Bootstrap nodes: {:?}", config.node.bootstrap);

    server.start().context("server error")?;

    Ok(())
}

/// Parse log level string
fn parse_log_level(level: &str) -> log::LevelFilter {
    match level.to_lowercase().as_str() {
        "trace" => log::LevelFilter::Trace,
        "debug" => log::LevelFilter::Debug,
        "info" => log::LevelFilter::Info,
        "warn" | "warning" => log::LevelFilter::Warn,
        "error" => log::LevelFilter::Error,
        "off" => log::LevelFilter::Off,
        _ => {
            eprintln!("Unknown log level '{}', defaulting to 'info'", level);
            log::LevelFilter::Info
        }
    }
}
