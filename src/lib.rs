//! Shard Proxy: a transparent, decrypting game proxy
//!
//! The proxy sits between a game client and a sharded backend. For every
//! backend address it opens a shard: a local port that relays one client to
//! that backend, decrypting the session traffic so plugins can inspect it and
//! re-encrypting it for the peer. When the backend tells the client to move to
//! another server, the proxy opens a new shard for that server and rewrites the
//! message so the client follows the proxy instead.
//!
//! # Main Features
//!
//! - Session key recovery from the handshake using known static keys
//! - Per-direction chunked AES-GCM decryption and re-encryption
//! - Automatic handoff interception across login and game servers
//! - Plugins: pcapng capture and verbose packet logging
//!
//! # Example
//!
//! ```no_run
//! use std::path::Path;
//! use std::sync::Arc;
//! use shard_proxy::{AddressSpec, KeyChain, Proxy, Result};
//! use shard_proxy::plugin::VerboseLogger;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let keys = KeyChain::load(Path::new("keys"))?;
//!     let proxy = Proxy::builder(keys).host("127.0.0.1").build();
//!     proxy.add_plugin(Arc::new(VerboseLogger::new()));
//!
//!     let local = proxy.spawn_shard(AddressSpec::new("login.us.wizard101.com", 12000)).await?;
//!     println!("Connect the client to {}", local);
//!
//!     for exit in proxy.run().await? {
//!         println!("{} -> {}: {}", exit.local, exit.remote, exit.reason);
//!     }
//!     Ok(())
//! }
//! ```

// Public modules
pub mod common;
pub mod config;
pub mod crypto;
pub mod plugin;
pub mod protocol;
pub mod proxy;

// Re-export commonly used structures and functions for convenience
pub use common::{AddressSpec, ProxyError, Result};
pub use crypto::KeyChain;
pub use plugin::{CaptureWriter, Plugin, PluginError, VerboseLogger};
pub use proxy::{Proxy, ShardExit, ShardExitReason};

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name
pub const APP_NAME: &str = env!("CARGO_PKG_NAME");
