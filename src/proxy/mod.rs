//! Proxy service module
//!
//! A `Proxy` owns a set of shards. Each shard is a one-shot relay: it listens
//! on a fresh local port, accepts a single game client, dials one backend,
//! and pumps frames both ways, decrypting them for the plugins and
//! re-encrypting them for the peer. When the backend hands the client off to
//! another backend, the shard asks the proxy for a new shard and points the
//! client at it.

mod registry;
mod session;
mod shard;
pub mod server;

use std::fmt;
use std::time::Duration;

use crate::common::{AddressSpec, ProxyError};

pub use registry::{ShardRegistry, MAX_EXIT_RECORDS};
pub use server::{Proxy, ProxyBuilder};

/// Default time allowed to dial a backend
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Default time a direction may stay silent before the shard closes
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(120);

/// Identifier of a shard, unique within one proxy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ShardId(pub u64);

impl fmt::Display for ShardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Lifecycle of a shard
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShardState {
    /// Bound, waiting for the client
    Listening,
    /// Client accepted, dialling the backend
    Connected,
    /// Both sides connected, session not yet established
    Handshaking,
    /// Session established, relaying traffic
    Relaying,
    /// Both directions terminated
    Closed,
}

impl fmt::Display for ShardState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ShardState::Listening => "listening",
            ShardState::Connected => "connected",
            ShardState::Handshaking => "handshaking",
            ShardState::Relaying => "relaying",
            ShardState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Registry entry of a live shard
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardInfo {
    pub id: ShardId,
    /// Address the shard listens on
    pub local: AddressSpec,
    /// Backend the shard forwards to
    pub remote: AddressSpec,
    pub state: ShardState,
}

/// Why a shard stopped
#[derive(Debug)]
pub enum ShardExitReason {
    /// The proxy scope was cancelled
    Cancelled,
    /// The client or the backend closed its connection
    PeerClosed,
    /// The shard hit a fatal error
    Failed(ProxyError),
}

impl ShardExitReason {
    /// Whether the shard stopped because of an error
    pub fn is_failure(&self) -> bool {
        matches!(self, ShardExitReason::Failed(_))
    }
}

impl fmt::Display for ShardExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShardExitReason::Cancelled => f.write_str("cancelled"),
            ShardExitReason::PeerClosed => f.write_str("peer closed"),
            ShardExitReason::Failed(e) => write!(f, "failed: {}", e),
        }
    }
}

/// Final record of a shard, returned by [`Proxy::run`]
#[derive(Debug)]
pub struct ShardExit {
    pub id: ShardId,
    pub local: AddressSpec,
    pub remote: AddressSpec,
    pub reason: ShardExitReason,
}

/// Timeouts applied to every shard
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelaySettings {
    /// Longest time to dial the backend
    pub connect_timeout: Duration,
    /// Longest silence on either direction; `None` waits forever
    pub idle_timeout: Option<Duration>,
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            idle_timeout: Some(DEFAULT_IDLE_TIMEOUT),
        }
    }
}
