//! Shard relay
//!
//! A shard serves exactly one client. It accepts the client, closes its
//! listener, dials the backend, and runs one pump per direction. Each pump
//! reads a frame, decrypts it, handles handshakes and handoffs, shows the
//! packet as it will be forwarded to the plugins, and forwards it. The first
//! pump to stop ends the shard.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use log::{debug, info};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use crate::common::{AddressSpec, ProxyError, Result};
use crate::crypto::{KeyChain, StreamCipher};
use crate::plugin::{PacketContext, PluginChain};
use crate::protocol::{Direction, FrameReader, HandoffDetector, Packet};
use super::registry::ShardRegistry;
use super::server::{Proxy, ProxyInner};
use super::session::{HandshakeEvent, Session};
use super::{RelaySettings, ShardExitReason, ShardId, ShardState};

/// Proxy services a shard relies on
pub(crate) struct ShardLinks {
    pub keys: Arc<KeyChain>,
    pub plugins: Arc<PluginChain>,
    pub detector: Arc<dyn HandoffDetector>,
    pub registry: Arc<ShardRegistry>,
    pub proxy: Weak<ProxyInner>,
    pub settings: RelaySettings,
}

pub(crate) struct Shard {
    id: ShardId,
    listener: TcpListener,
    local: AddressSpec,
    remote: AddressSpec,
    links: ShardLinks,
    cancel: CancellationToken,
}

impl Shard {
    pub fn new(
        id: ShardId,
        listener: TcpListener,
        local: AddressSpec,
        remote: AddressSpec,
        links: ShardLinks,
        cancel: CancellationToken,
    ) -> Self {
        Self { id, listener, local, remote, links, cancel }
    }

    /// Serve one client until either side closes or the scope is cancelled
    pub async fn run(self) -> ShardExitReason {
        match self.relay().await {
            Ok(reason) => reason,
            Err(e) => ShardExitReason::Failed(e),
        }
    }

    async fn relay(self) -> Result<ShardExitReason> {
        let Shard { id, listener, local, remote, links, cancel } = self;

        let (client, client_addr) = tokio::select! {
            _ = cancel.cancelled() => return Ok(ShardExitReason::Cancelled),
            accepted = listener.accept() => accepted?,
        };
        // One client per shard
        drop(listener);

        info!("[{}] Client {} connected", local, client_addr);
        links.registry.set_state(id, ShardState::Connected);

        let server = tokio::select! {
            _ = cancel.cancelled() => return Ok(ShardExitReason::Cancelled),
            dialled = timeout(links.settings.connect_timeout, TcpStream::connect(remote.as_pair())) => {
                dialled.map_err(|_| {
                    ProxyError::Timeout(format!("connecting to {}", remote))
                })??
            }
        };
        let server_addr = server.peer_addr()?;
        client.set_nodelay(true)?;
        server.set_nodelay(true)?;

        debug!("[{}] Connected to {} ({})", local, remote, server_addr);
        links.registry.set_state(id, ShardState::Handshaking);

        let idle = links.settings.idle_timeout;
        let relay = Arc::new(Relay {
            context: PacketContext {
                shard: id,
                local: local.clone(),
                remote,
                client: client_addr,
                server: server_addr,
            },
            session: Session::new(),
            links,
            relaying: AtomicBool::new(false),
        });

        let (client_read, client_write) = client.into_split();
        let (server_read, server_write) = server.into_split();

        let mut pumps = JoinSet::new();
        pumps.spawn(pump(
            Arc::clone(&relay),
            Direction::ClientToServer,
            FrameReader::new(client_read, idle),
            server_write,
        ));
        pumps.spawn(pump(
            Arc::clone(&relay),
            Direction::ServerToClient,
            FrameReader::new(server_read, idle),
            client_write,
        ));

        let reason = tokio::select! {
            _ = cancel.cancelled() => ShardExitReason::Cancelled,
            Some(finished) = pumps.join_next() => match finished {
                Ok(Ok(())) => ShardExitReason::PeerClosed,
                Ok(Err(e)) => ShardExitReason::Failed(e),
                Err(e) => ShardExitReason::Failed(ProxyError::Task(e.to_string())),
            },
        };

        // Dropping the other pump closes both sockets
        pumps.shutdown().await;
        Ok(reason)
    }
}

/// State shared by the two pumps of a shard
struct Relay {
    context: PacketContext,
    session: Session,
    links: ShardLinks,
    relaying: AtomicBool,
}

impl Relay {
    fn mark_relaying(&self) {
        if !self.relaying.swap(true, Ordering::Relaxed) {
            self.links.registry.set_state(self.context.shard, ShardState::Relaying);
        }
    }

    fn on_handshake(&self, event: HandshakeEvent) {
        match event {
            HandshakeEvent::Offered { session_id, encrypted } => {
                debug!("[{}] Session {} offered (encrypted: {})", self.context.local, session_id, encrypted);
            }
            HandshakeEvent::Established { session_id, encrypted } => {
                info!("[{}] Session {} established (encrypted: {})", self.context.local, session_id, encrypted);
                self.mark_relaying();
            }
        }
    }

    /// Redirect a handoff to a new shard
    async fn handoff(&self, packet: &mut Packet) -> Result<()> {
        let Some(target) = self.links.detector.detect(packet)? else {
            return Ok(());
        };

        let proxy = Proxy::upgrade(&self.links.proxy).ok_or(ProxyError::ShuttingDown)?;
        let local = proxy.spawn_shard(target.clone()).await?;
        self.links.detector.rewrite(packet, &local, &self.context.local)?;

        metrics::counter!("shard_proxy.handoffs").increment(1);
        info!("[{}] Handoff to {} redirected to {}", self.context.local, target, local);
        Ok(())
    }
}

async fn pump<R, W>(
    relay: Arc<Relay>,
    direction: Direction,
    mut reader: FrameReader<R>,
    mut writer: W,
) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut cipher: Option<StreamCipher> = None;
    let mut frames: u64 = 0;

    loop {
        if !reader.wait_readable().await? {
            debug!("[{}] {} closed after {} frames", relay.context.local, direction, frames);
            return Ok(());
        }

        // Installed by the client pump before the accept is forwarded
        if cipher.is_none() {
            cipher = relay.session.take_cipher(direction);
        }

        let raw = reader.next_frame(cipher.as_mut()).await?;
        let mut packet = Packet::decode(direction, raw.bytes, raw.encrypted)?;
        frames += 1;
        metrics::counter!("shard_proxy.frames", "direction" => direction.as_str()).increment(1);

        if let Some(event) = relay.session.inspect(&mut packet, &relay.links.keys)? {
            relay.on_handshake(event);
        }
        if direction == Direction::ServerToClient {
            relay.handoff(&mut packet).await?;
        }

        // Plugins see exactly what the peer will receive
        relay.links.plugins.dispatch(&relay.context, &packet);

        if !packet.frame.is_control() {
            relay.mark_relaying();
        }

        let wire = match cipher.as_mut() {
            Some(cipher) if packet.decrypted => cipher.encrypt(packet.raw())?.freeze(),
            _ => packet.raw().clone(),
        };
        writer.write_all(&wire).await?;
    }
}
