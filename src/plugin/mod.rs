//! Packet inspection plugins
//!
//! Every decoded packet is handed to each registered plugin, in registration
//! order, before it is forwarded. Plugins run synchronously on the relay
//! task, so a slow plugin slows the connection it observes and nothing else.
//! A failing plugin is logged and skipped; it never stops the relay.

pub mod capture;
pub mod verbose;

use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, PoisonError, RwLock};

use log::warn;
use thiserror::Error;

use crate::common::AddressSpec;
use crate::protocol::Packet;
use crate::proxy::ShardId;

pub use capture::CaptureWriter;
pub use verbose::VerboseLogger;

/// Plugin failure
#[derive(Error, Debug)]
pub enum PluginError {
    /// IO error from a plugin's own resources
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// The plugin has been closed by its owner
    #[error("plugin is closed")]
    Closed,

    /// Other error
    #[error("{0}")]
    Other(String),
}

/// Where a packet was observed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PacketContext {
    /// Shard relaying the packet
    pub shard: ShardId,
    /// Address the shard listens on
    pub local: AddressSpec,
    /// Backend address the shard forwards to
    pub remote: AddressSpec,
    /// Socket address of the connected client
    pub client: SocketAddr,
    /// Socket address of the connected backend
    pub server: SocketAddr,
}

/// Synchronous packet observer
#[cfg_attr(test, mockall::automock)]
pub trait Plugin: Send + Sync {
    /// Name used in log messages
    fn name(&self) -> &'static str;

    /// Observe one packet before it is forwarded
    fn on_packet(&self, context: &PacketContext, packet: &Packet) -> Result<(), PluginError>;
}

/// Ordered list of plugins shared by all shards
#[derive(Default)]
pub struct PluginChain {
    plugins: RwLock<Vec<Arc<dyn Plugin>>>,
}

impl PluginChain {
    /// Create an empty chain
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a plugin
    pub fn push(&self, plugin: Arc<dyn Plugin>) {
        self.plugins
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(plugin);
    }

    /// Number of registered plugins
    pub fn len(&self) -> usize {
        self.plugins.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Whether no plugins are registered
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Show a packet to every plugin in order
    ///
    /// Returns the number of plugins that failed.
    pub fn dispatch(&self, context: &PacketContext, packet: &Packet) -> usize {
        let plugins = self.plugins.read().unwrap_or_else(PoisonError::into_inner);
        let mut failures = 0;

        for plugin in plugins.iter() {
            if let Err(e) = plugin.on_packet(context, packet) {
                failures += 1;
                warn!("[{}] Plugin {} failed: {}", context.local, plugin.name(), e);
                metrics::counter!("shard_proxy.plugin.errors", "plugin" => plugin.name()).increment(1);
            }
        }

        failures
    }
}

impl std::fmt::Debug for PluginChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginChain").field("plugins", &self.len()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use mockall::Sequence;
    use crate::protocol::{Direction, Frame};

    fn context() -> PacketContext {
        PacketContext {
            shard: ShardId(1),
            local: AddressSpec::new("127.0.0.1", 40000),
            remote: AddressSpec::new("games.example.com", 12000),
            client: "127.0.0.1:50000".parse().unwrap(),
            server: "10.0.0.1:12000".parse().unwrap(),
        }
    }

    fn packet() -> Packet {
        let raw = Frame::Data { service_id: 1, message_id: 1, payload: Bytes::from_static(b"x") }
            .encode()
            .unwrap()
            .freeze();
        Packet::decode(Direction::ClientToServer, raw, false).unwrap()
    }

    #[test]
    fn test_dispatch_in_registration_order() {
        let mut seq = Sequence::new();
        let mut first = MockPlugin::new();
        let mut second = MockPlugin::new();

        first.expect_on_packet().times(1).in_sequence(&mut seq).returning(|_, _| Ok(()));
        second.expect_on_packet().times(1).in_sequence(&mut seq).returning(|_, _| Ok(()));

        let chain = PluginChain::new();
        chain.push(Arc::new(first));
        chain.push(Arc::new(second));

        assert_eq!(chain.dispatch(&context(), &packet()), 0);
    }

    #[test]
    fn test_failing_plugin_does_not_stop_the_chain() {
        let mut failing = MockPlugin::new();
        failing.expect_on_packet().times(1).returning(|_, _| Err(PluginError::Closed));
        failing.expect_name().return_const("failing");

        let mut after = MockPlugin::new();
        after.expect_on_packet().times(1).returning(|_, _| Ok(()));

        let chain = PluginChain::new();
        chain.push(Arc::new(failing));
        chain.push(Arc::new(after));

        assert_eq!(chain.dispatch(&context(), &packet()), 1);
    }
}
