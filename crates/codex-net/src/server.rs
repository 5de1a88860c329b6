//! Game server: accepts channels and runs one dispatcher per connection.
//!
//! Server links are never rebuilt. The first failure on a connection (a
//! broken read, a failed reply, an expired liveness counter) tears it down,
//! and the bound session, if any, is told through
//! [`Session::on_disconnect`](crate::dispatcher::Session::on_disconnect).

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::ops::ControlFlow;
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::{RwLock, mpsc, watch};
use tokio::task::JoinHandle;

use crate::dispatcher::{Flow, Lobby, SessionContext, SessionDispatcher};
use crate::link::{
    ConnectionId, IdGenerator, Inbound, InstalledReader, Link, LinkConfig, Supervisor,
};
use crate::liveness::{TickVerdict, spawn_monitor, wait_closed};
use crate::local::LocalAcceptor;
use crate::message::{ClientFrame, Schema, ServerFrame, decode};
use crate::outbound::OutboundQueue;
use crate::transport::Channel;

/// How long a refused connection may take to flush its last replies.
const CLOSE_LINGER: Duration = Duration::from_secs(1);

/// Pause after a failed accept, so a full descriptor table does not spin.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Error returned when the connection map is at capacity.
#[derive(Debug, thiserror::Error)]
#[error("connection limit of {max} reached")]
pub struct ConnectionLimitReached {
    /// Configured limit.
    pub max: usize,
}

/// One accepted connection.
pub struct ServerConnection<S: Schema> {
    link: Arc<Link<ServerFrame<S>>>,
    replies: OutboundQueue<ServerFrame<S>>,
    monitor: Mutex<Option<JoinHandle<()>>>,
}

impl<S: Schema> Supervisor for ServerConnection<S> {
    fn channel_failed(self: Arc<Self>, generation: u64) {
        tracing::debug!(
            "Connection {} failed on generation {generation}",
            self.link.id()
        );
        tokio::spawn(async move { self.teardown().await });
    }
}

impl<S: Schema> ServerConnection<S> {
    /// The connection's link.
    pub fn link(&self) -> &Arc<Link<ServerFrame<S>>> {
        &self.link
    }

    fn on_tick(&self) {
        let (verdict, generation) = self.link.on_tick();
        if verdict == TickVerdict::Expired {
            tracing::warn!(
                "Connection {} ({}) stopped sending heartbeats",
                self.link.id(),
                self.link.identity()
            );
            self.link.report_failure(generation);
        }
    }

    /// Stop the monitor, discard queued replies, close the channel and wake
    /// everything waiting on the link. Only the first call does anything.
    pub async fn teardown(&self) {
        if !self.link.begin_teardown() {
            return;
        }
        tracing::info!(
            "Tearing down connection {} ({})",
            self.link.id(),
            self.link.identity()
        );
        let monitor = self
            .monitor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(monitor) = monitor {
            monitor.abort();
        }
        self.replies.close();
        self.link.drop_channel().await;
        self.link.mark_closed();
    }
}

/// Thread-safe map of active connections keyed by [`ConnectionId`].
pub struct ConnectionMap<S: Schema> {
    inner: RwLock<HashMap<ConnectionId, Arc<ServerConnection<S>>>>,
    max_connections: usize,
}

impl<S: Schema> ConnectionMap<S> {
    /// Create a new map with the given capacity limit.
    pub fn new(max_connections: usize) -> Self {
        Self {
            inner: RwLock::new(HashMap::new()),
            max_connections,
        }
    }

    /// Insert a connection. Returns `Err` if the map is at capacity.
    pub async fn insert(
        &self,
        id: ConnectionId,
        connection: Arc<ServerConnection<S>>,
    ) -> Result<(), ConnectionLimitReached> {
        let mut map = self.inner.write().await;
        if map.len() >= self.max_connections {
            return Err(ConnectionLimitReached {
                max: self.max_connections,
            });
        }
        map.insert(id, connection);
        Ok(())
    }

    /// Remove a connection by ID.
    pub async fn remove(&self, id: &ConnectionId) -> Option<Arc<ServerConnection<S>>> {
        self.inner.write().await.remove(id)
    }

    /// Look a connection up by ID.
    pub async fn get(&self, id: &ConnectionId) -> Option<Arc<ServerConnection<S>>> {
        self.inner.read().await.get(id).cloned()
    }

    /// Remove and return every connection.
    pub async fn drain(&self) -> Vec<Arc<ServerConnection<S>>> {
        self.inner.write().await.drain().map(|(_, c)| c).collect()
    }

    /// Return the number of active connections.
    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }

    /// Return whether the map is empty.
    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.is_empty()
    }
}

/// A source of freshly accepted channels.
trait Incoming: Send {
    /// The next channel, an accept error, or `None` once the source is gone.
    fn next_channel(&mut self) -> impl Future<Output = Option<io::Result<Channel>>> + Send;
}

struct TcpIncoming<'a>(&'a TcpListener);

impl Incoming for TcpIncoming<'_> {
    async fn next_channel(&mut self) -> Option<io::Result<Channel>> {
        let accepted = match self.0.accept().await {
            Ok((stream, peer)) => match stream.set_nodelay(true) {
                Ok(()) => Ok(Channel::Tcp(stream)),
                Err(e) => Err(io::Error::new(e.kind(), format!("setting up {peer}: {e}"))),
            },
            Err(e) => Err(e),
        };
        Some(accepted)
    }
}

impl Incoming for LocalAcceptor {
    async fn next_channel(&mut self) -> Option<io::Result<Channel>> {
        self.accept().await.map(|channel| Ok(Channel::Local(channel)))
    }
}

/// Configuration for [`GameServer`].
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to. Default: `127.0.0.1:30000`.
    pub bind_addr: SocketAddr,
    /// Maximum concurrent connections. Default: 256.
    pub max_connections: usize,
    /// Per-connection link settings.
    pub link: LinkConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 30000)),
            max_connections: 256,
            link: LinkConfig::default(),
        }
    }
}

/// Accepts connections and hands their traffic to a [`Lobby`].
pub struct GameServer<S: Schema, L: Lobby<S>> {
    config: ServerConfig,
    lobby: Arc<L>,
    /// Active connection map (public for test inspection).
    pub connections: Arc<ConnectionMap<S>>,
    id_gen: IdGenerator,
    shutdown_tx: watch::Sender<bool>,
}

impl<S: Schema, L: Lobby<S>> GameServer<S, L> {
    /// Create a new server with the given configuration.
    pub fn new(config: ServerConfig, lobby: Arc<L>) -> Self {
        Self {
            connections: Arc::new(ConnectionMap::new(config.max_connections)),
            id_gen: IdGenerator::new(),
            shutdown_tx: watch::Sender::new(false),
            lobby,
            config,
        }
    }

    /// Bind to the configured address and run the accept loop.
    pub async fn run(&self) -> std::io::Result<()> {
        let listener = TcpListener::bind(self.config.bind_addr).await?;
        tracing::info!("Server listening on {}", self.config.bind_addr);
        self.run_with_listener(listener).await;
        Ok(())
    }

    /// Run the accept loop with a pre-bound listener (useful for tests).
    pub async fn run_with_listener(&self, listener: TcpListener) {
        self.accept_loop(TcpIncoming(&listener)).await;
    }

    /// Run the accept loop over in-process channels.
    pub async fn serve_local(&self, acceptor: LocalAcceptor) {
        self.accept_loop(acceptor).await;
    }

    /// Accept until shutdown or until `incoming` runs dry. A failed accept
    /// is logged and retried after [`ACCEPT_BACKOFF`].
    async fn accept_loop(&self, mut incoming: impl Incoming) {
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        loop {
            tokio::select! {
                accepted = incoming.next_channel() => match accepted {
                    Some(Ok(channel)) => {
                        let peer = channel.describe();
                        if let Err(e) = self.accept(channel).await {
                            tracing::warn!("Rejecting {peer}: {e}");
                        }
                    }
                    Some(Err(e)) => {
                        tracing::warn!("Accept failed: {e}");
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                    }
                    None => break,
                },
                _ = wait_closed(&mut shutdown_rx) => {
                    tracing::info!("Server shutting down");
                    break;
                }
            }
        }
    }

    /// Register a freshly accepted channel and start serving it.
    pub async fn accept(&self, channel: Channel) -> Result<ConnectionId, ConnectionLimitReached> {
        let id = self.id_gen.next_id();
        let (readers_tx, readers_rx) = mpsc::unbounded_channel();
        let link_config = self.config.link.clone();

        let connection = Arc::new_cyclic(|weak: &Weak<ServerConnection<S>>| {
            let supervisor: Weak<dyn Supervisor> = weak.clone();
            let link = Arc::new(Link::new(id, link_config, channel, readers_tx, supervisor));
            ServerConnection {
                replies: OutboundQueue::new(Some(Arc::clone(&link))),
                link,
                monitor: Mutex::new(None),
            }
        });

        if let Err(e) = self.connections.insert(id, Arc::clone(&connection)).await {
            connection.teardown().await;
            return Err(e);
        }
        tracing::info!("Accepted connection {id} from {}", connection.link.peer());

        let monitor = spawn_monitor(
            self.config.link.ping_interval,
            connection.link.subscribe_closed(),
            {
                let weak = Arc::downgrade(&connection);
                move || match weak.upgrade() {
                    Some(connection) => {
                        connection.on_tick();
                        ControlFlow::Continue(())
                    }
                    None => ControlFlow::Break(()),
                }
            },
        );
        *connection
            .monitor
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(monitor);

        let ctx = SessionContext::new(Arc::clone(&connection.link), connection.replies.clone());
        let dispatcher = SessionDispatcher::new(Arc::clone(&self.lobby), ctx);
        tokio::spawn(serve_connection(
            connection,
            readers_rx,
            dispatcher,
            Arc::clone(&self.connections),
        ));
        Ok(id)
    }

    /// The lobby shared by every connection.
    pub fn lobby(&self) -> &Arc<L> {
        &self.lobby
    }

    /// Stop accepting and tear down every connection.
    pub async fn shutdown(&self) {
        self.shutdown_tx.send_replace(true);
        let connections = self.connections.drain().await;
        tracing::info!("Closing {} connections", connections.len());
        for connection in connections {
            connection.teardown().await;
        }
    }
}

/// Per-connection reader loop.
async fn serve_connection<S, L>(
    connection: Arc<ServerConnection<S>>,
    readers: mpsc::UnboundedReceiver<InstalledReader>,
    mut dispatcher: SessionDispatcher<S, L>,
    connections: Arc<ConnectionMap<S>>,
) where
    S: Schema,
    L: Lobby<S>,
{
    let link = Arc::clone(&connection.link);
    let id = link.id();
    let mut flow = Flow::Continue;

    link.read_loop(readers, |inbound| match inbound {
        Inbound::Frame(frame) => {
            flow = dispatcher.dispatch(decode::<ClientFrame<S>>(&frame));
            match flow {
                Flow::Continue => ControlFlow::Continue(()),
                Flow::Close => ControlFlow::Break(()),
            }
        }
        Inbound::Failed { error, .. } => {
            tracing::debug!("Read failed on connection {id}: {error}");
            ControlFlow::Break(())
        }
    })
    .await;

    if flow == Flow::Close
        && tokio::time::timeout(CLOSE_LINGER, connection.replies.flushed())
            .await
            .is_err()
    {
        tracing::debug!("Connection {id} closed with replies still queued");
    }

    connection.teardown().await;
    connections.remove(&id).await;
    dispatcher.finish();
    tracing::info!("Connection {id} closed");
}
