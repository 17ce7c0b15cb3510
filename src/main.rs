//! Shard Proxy Command Line Tool
//!
//! This binary is the command-line interface for Shard Proxy.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use log::{error, info, warn};

use shard_proxy::common::{init_logger, ProxyError, Result};
use shard_proxy::config::{self, ConfigValues};
use shard_proxy::{CaptureWriter, KeyChain, Proxy, ShardExitReason, VerboseLogger, APP_NAME, VERSION};

/// Shard Proxy: transparent decrypting proxy for sharded game backends
#[derive(Parser, Debug)]
#[clap(author, version = VERSION, about, long_about = None)]
struct Args {
    /// Directory with static_keys.json, session_keys.json and optionally client_keys.json
    keys: Option<PathBuf>,

    /// Host interface to bind shard sockets to
    #[clap(long)]
    host: Option<String>,

    /// Login server host to proxy
    #[clap(short, long)]
    login: Option<String>,

    /// Login server port
    #[clap(short, long)]
    port: Option<u16>,

    /// Write every packet to this pcapng file
    #[clap(short, long)]
    capture: Option<PathBuf>,

    /// Log every packet
    #[clap(short, long)]
    verbose: bool,

    /// Log level (error, warn, info, debug, trace)
    #[clap(long)]
    log_level: Option<String>,

    /// Backend connect timeout in seconds
    #[clap(long)]
    connection_timeout: Option<u64>,

    /// Seconds a direction may stay silent before its shard closes
    #[clap(long)]
    idle_timeout: Option<u64>,

    /// Load configuration from a file
    #[clap(long)]
    config_file: Option<PathBuf>,
}

impl Args {
    /// Values given on the command line; flags left off stay unset
    fn values(&self) -> ConfigValues {
        ConfigValues {
            keys_dir: self.keys.clone(),
            host: self.host.clone(),
            login_host: self.login.clone(),
            login_port: self.port,
            capture: self.capture.clone(),
            verbose: self.verbose.then_some(true),
            log_level: self.log_level.clone(),
            connection_timeout: self.connection_timeout,
            idle_timeout: self.idle_timeout,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = config::load(args.values(), args.config_file.clone())?;
    init_logger(config.log_level());

    info!("Starting {} v{}", APP_NAME, VERSION);
    config.log();

    // Validation guarantees the keys directory is set
    let keys_dir = config
        .keys_dir()
        .ok_or_else(|| config::ConfigError::MissingRequiredValue("keys_dir".to_string()))?;
    let key_chain = KeyChain::load(keys_dir)?;

    let proxy = Proxy::builder(key_chain)
        .host(config.host())
        .settings(config.relay_settings())
        .build();

    let capture = match config.capture() {
        Some(path) => {
            let writer = Arc::new(CaptureWriter::create(path).map_err(|e| {
                ProxyError::Config(format!("capture {}: {}", path.display(), e))
            })?);
            info!("Capturing packets to {}", path.display());
            proxy.add_plugin(writer.clone());
            Some(writer)
        }
        None => None,
    };

    if config.verbose() {
        proxy.add_plugin(Arc::new(VerboseLogger::new()));
    }

    let login = proxy.spawn_shard(config.login_address()).await?;
    info!("Proxy ready, point the client at {} and press Ctrl+C to stop", login);

    let token = proxy.cancellation_token();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Received Ctrl+C, shutting down");
                token.cancel();
            }
            Err(e) => warn!("Failed to listen for Ctrl+C: {}", e),
        }
    });

    let exits = proxy.run().await;

    if let Some(writer) = capture {
        if let Err(e) = writer.close() {
            error!("Failed to close capture {}: {}", writer.path().display(), e);
        }
    }

    for exit in exits? {
        match &exit.reason {
            ShardExitReason::Failed(e) => error!("Shard {} -> {} failed: {}", exit.local, exit.remote, e),
            reason => info!("Shard {} -> {} {}", exit.local, exit.remote, reason),
        }
    }

    info!("Proxy stopped");
    Ok(())
}
