//! Proxy server module
//!
//! The `Proxy` owns the scope every shard runs in: a task tracker and a root
//! cancellation token. Shards are spawned on demand, either by the caller for
//! the first backend or by a running shard when the backend hands the client
//! off elsewhere.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use futures::future::{BoxFuture, FutureExt};
use log::{debug, error, info};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::common::{AddressSpec, ProxyError, Result};
use crate::crypto::KeyChain;
use crate::plugin::{Plugin, PluginChain};
use crate::protocol::{DmlHandoffDetector, HandoffDetector};
use super::registry::ShardRegistry;
use super::shard::{Shard, ShardLinks};
use super::{RelaySettings, ShardExit, ShardExitReason, ShardId, ShardInfo, ShardState};

/// Bind host used when none is configured
pub const DEFAULT_HOST: &str = "0.0.0.0";

pub(crate) struct ProxyInner {
    host: String,
    settings: RelaySettings,
    key_chain: Arc<KeyChain>,
    plugins: Arc<PluginChain>,
    detector: Arc<dyn HandoffDetector>,
    registry: Arc<ShardRegistry>,
    tracker: TaskTracker,
    cancel: CancellationToken,
    next_id: AtomicU64,
    running: AtomicBool,
}

/// Intercepting proxy
///
/// Cheap to clone; every clone drives the same set of shards.
///
/// # Example
///
/// ```no_run
/// # use std::collections::HashMap;
/// # use shard_proxy::common::AddressSpec;
/// # use shard_proxy::crypto::KeyChain;
/// # use shard_proxy::proxy::Proxy;
/// # async fn example() -> shard_proxy::common::Result<()> {
/// let keys = KeyChain::new(HashMap::new(), HashMap::new());
/// let proxy = Proxy::builder(keys).host("127.0.0.1").build();
///
/// let local = proxy.spawn_shard(AddressSpec::new("login.us.wizard101.com", 12000)).await?;
/// println!("Point the client at {}", local);
///
/// let exits = proxy.run().await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Proxy {
    inner: Arc<ProxyInner>,
}

impl Proxy {
    /// Start building a proxy around a key chain
    pub fn builder(key_chain: impl Into<Arc<KeyChain>>) -> ProxyBuilder {
        ProxyBuilder::new(key_chain.into())
    }

    pub(crate) fn upgrade(inner: &Weak<ProxyInner>) -> Option<Self> {
        inner.upgrade().map(|inner| Self { inner })
    }

    /// Host shards bind to
    pub fn host(&self) -> &str {
        &self.inner.host
    }

    /// Timeouts applied to every shard
    pub fn settings(&self) -> RelaySettings {
        self.inner.settings
    }

    /// Shared key chain
    pub fn key_chain(&self) -> &Arc<KeyChain> {
        &self.inner.key_chain
    }

    /// Append a plugin to the dispatch list
    ///
    /// Connections already relaying see the plugin from their next packet on.
    pub fn add_plugin(&self, plugin: Arc<dyn Plugin>) {
        debug!("Adding plugin {}", plugin.name());
        self.inner.plugins.push(plugin);
    }

    /// Number of registered plugins
    pub fn plugin_count(&self) -> usize {
        self.inner.plugins.len()
    }

    /// Open a shard towards a backend
    ///
    /// Binds a fresh port on the bind host, registers and starts the shard,
    /// and returns the address it listens on. The shard then waits for one
    /// client. Callable from any task, including a running shard.
    ///
    /// # Errors
    ///
    /// `ProxyError::ShuttingDown` once the scope is cancelled, or the bind
    /// error.
    pub fn spawn_shard(&self, remote: AddressSpec) -> BoxFuture<'static, Result<AddressSpec>> {
        let inner = Arc::clone(&self.inner);

        async move {
            if inner.cancel.is_cancelled() {
                return Err(ProxyError::ShuttingDown);
            }

            let listener = TcpListener::bind((inner.host.as_str(), 0)).await?;
            let local = AddressSpec::from(listener.local_addr()?);
            if inner.cancel.is_cancelled() {
                return Err(ProxyError::ShuttingDown);
            }

            let id = ShardId(inner.next_id.fetch_add(1, Ordering::Relaxed));
            info!("[{}] Spawning shard to {}", local, remote);

            inner.registry.register(ShardInfo {
                id,
                local: local.clone(),
                remote: remote.clone(),
                state: ShardState::Listening,
            });

            let shard = Shard::new(
                id,
                listener,
                local.clone(),
                remote,
                ShardLinks {
                    keys: Arc::clone(&inner.key_chain),
                    plugins: Arc::clone(&inner.plugins),
                    detector: Arc::clone(&inner.detector),
                    registry: Arc::clone(&inner.registry),
                    proxy: Arc::downgrade(&inner),
                    settings: inner.settings,
                },
                inner.cancel.child_token(),
            );

            let registry = Arc::clone(&inner.registry);
            metrics::gauge!("shard_proxy.shards.active").increment(1.0);

            inner.tracker.spawn(async move {
                let reason = shard.run().await;
                if let Some(info) = registry.get(id) {
                    match &reason {
                        ShardExitReason::Failed(e) => error!("[{}] Shard failed: {}", info.local, e),
                        reason => info!("[{}] Shard closed ({})", info.local, reason),
                    }
                }
                registry.deregister(id, reason);
                metrics::gauge!("shard_proxy.shards.active").decrement(1.0);
            });

            Ok(local)
        }
        .boxed()
    }

    /// Wait for the shards
    ///
    /// Returns once every shard has finished or the scope is cancelled. On
    /// cancellation every live shard is stopped and awaited first. Spawn at
    /// least one shard before calling this.
    ///
    /// # Returns
    ///
    /// The exit records of the shards that finished, in spawn order. Only
    /// the most recent [`MAX_EXIT_RECORDS`](super::MAX_EXIT_RECORDS) are kept.
    ///
    /// # Errors
    ///
    /// `ProxyError::AlreadyRunning` if another `run` is in progress.
    pub async fn run(&self) -> Result<Vec<ShardExit>> {
        let inner = &self.inner;
        if inner.running.swap(true, Ordering::SeqCst) {
            return Err(ProxyError::AlreadyRunning);
        }

        inner.tracker.close();
        tokio::select! {
            _ = inner.cancel.cancelled() => {
                info!("Shutting down {} shards", inner.registry.len());
            }
            _ = inner.tracker.wait() => {
                info!("All shards finished");
            }
        }

        inner.cancel.cancel();
        inner.tracker.wait().await;
        inner.running.store(false, Ordering::SeqCst);

        Ok(inner.registry.take_exits())
    }

    /// Cancel the scope
    pub fn shutdown(&self) {
        self.inner.cancel.cancel();
    }

    /// Token that cancels the scope when cancelled
    pub fn cancellation_token(&self) -> CancellationToken {
        self.inner.cancel.clone()
    }

    /// Snapshot of the live shards
    pub fn shards(&self) -> Vec<ShardInfo> {
        self.inner.registry.snapshot()
    }
}

impl std::fmt::Debug for Proxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Proxy")
            .field("host", &self.inner.host)
            .field("shards", &self.inner.registry.len())
            .field("plugins", &self.inner.plugins.len())
            .finish()
    }
}

/// Builder for [`Proxy`]
pub struct ProxyBuilder {
    key_chain: Arc<KeyChain>,
    host: Option<String>,
    settings: RelaySettings,
    detector: Option<Arc<dyn HandoffDetector>>,
    plugins: Vec<Arc<dyn Plugin>>,
}

impl ProxyBuilder {
    fn new(key_chain: Arc<KeyChain>) -> Self {
        Self {
            key_chain,
            host: None,
            settings: RelaySettings::default(),
            detector: None,
            plugins: Vec::new(),
        }
    }

    /// Host to bind shards to (default `0.0.0.0`)
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    /// Connect and idle timeouts
    pub fn settings(mut self, settings: RelaySettings) -> Self {
        self.settings = settings;
        self
    }

    /// Replace the DML handoff detector
    pub fn handoff_detector(mut self, detector: Arc<dyn HandoffDetector>) -> Self {
        self.detector = Some(detector);
        self
    }

    /// Register a plugin up front
    pub fn plugin(mut self, plugin: Arc<dyn Plugin>) -> Self {
        self.plugins.push(plugin);
        self
    }

    /// Build the proxy
    pub fn build(self) -> Proxy {
        let plugins = PluginChain::new();
        for plugin in self.plugins {
            plugins.push(plugin);
        }

        Proxy {
            inner: Arc::new(ProxyInner {
                host: self.host.unwrap_or_else(|| DEFAULT_HOST.to_string()),
                settings: self.settings,
                key_chain: self.key_chain,
                plugins: Arc::new(plugins),
                detector: self.detector.unwrap_or_else(|| Arc::new(DmlHandoffDetector::new())),
                registry: Arc::new(ShardRegistry::new()),
                tracker: TaskTracker::new(),
                cancel: CancellationToken::new(),
                next_id: AtomicU64::new(1),
                running: AtomicBool::new(false),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::time::Duration;
    use tokio::net::TcpStream;

    fn proxy() -> Proxy {
        Proxy::builder(KeyChain::new(HashMap::new(), HashMap::new()))
            .host("127.0.0.1")
            .build()
    }

    #[test]
    fn test_builder_defaults() {
        let proxy = Proxy::builder(KeyChain::new(HashMap::new(), HashMap::new())).build();
        assert_eq!(proxy.host(), DEFAULT_HOST);
        assert_eq!(proxy.settings(), RelaySettings::default());
        assert_eq!(proxy.plugin_count(), 0);
        assert!(proxy.shards().is_empty());
    }

    #[tokio::test]
    async fn test_spawn_shard_registers_and_listens() {
        let proxy = proxy();
        let remote = AddressSpec::new("127.0.0.1", 9);
        let local = proxy.spawn_shard(remote.clone()).await.unwrap();

        assert_eq!(local.host, "127.0.0.1");
        assert_ne!(local.port, 0);

        let shards = proxy.shards();
        assert_eq!(shards.len(), 1);
        assert_eq!(shards[0].local, local);
        assert_eq!(shards[0].remote, remote);
        assert_eq!(shards[0].state, ShardState::Listening);

        // The port accepts a connection before run is called
        assert!(TcpStream::connect(local.as_pair()).await.is_ok());

        proxy.shutdown();
        proxy.run().await.unwrap();
    }

    #[tokio::test]
    async fn test_spawn_after_shutdown_fails() {
        let proxy = proxy();
        proxy.shutdown();
        let result = proxy.spawn_shard(AddressSpec::new("127.0.0.1", 9)).await;
        assert!(matches!(result, Err(ProxyError::ShuttingDown)));
    }

    #[tokio::test]
    async fn test_run_returns_cancelled_exits() {
        let proxy = proxy();
        for _ in 0..3 {
            proxy.spawn_shard(AddressSpec::new("127.0.0.1", 9)).await.unwrap();
        }

        let token = proxy.cancellation_token();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            token.cancel();
        });

        let exits = proxy.run().await.unwrap();
        assert_eq!(exits.len(), 3);
        assert!(exits.iter().all(|exit| matches!(exit.reason, ShardExitReason::Cancelled)));
        assert!(proxy.shards().is_empty());
    }

    #[tokio::test]
    async fn test_second_run_is_rejected() {
        let proxy = proxy();
        proxy.spawn_shard(AddressSpec::new("127.0.0.1", 9)).await.unwrap();

        let running = proxy.clone();
        let handle = tokio::spawn(async move { running.run().await });
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(matches!(proxy.run().await, Err(ProxyError::AlreadyRunning)));

        proxy.shutdown();
        assert_eq!(handle.await.unwrap().unwrap().len(), 1);
    }
}
