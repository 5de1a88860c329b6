//! Client node: one reconnectable link to the game server.
//!
//! A [`ClientNode`] owns three background tasks:
//!
//! - the read loop, which decodes server frames into [`ClientEvent`]s and
//!   reports broken channels;
//! - the liveness monitor, which pings the server on every tick and reports
//!   the channel once the miss-counter runs out;
//! - the outbound delivery task behind [`ClientNode::send_lobby`] and
//!   [`ClientNode::send_game`].
//!
//! Every failure report lands in the node's [`ReconnectionManager`], so
//! messages queued while the channel is down are delivered, in order, once
//! it is back. A fresh channel reaches a server that has never seen this
//! client, so [`ClientNode::set_rejoin`] names the lobby request that goes
//! out on it before the queue resumes.

use std::io;
use std::ops::ControlFlow;
use std::sync::{Arc, Weak};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::link::{ConnectionId, Inbound, InstalledReader, Link, LinkConfig, Supervisor};
use crate::liveness::{LivenessState, TickVerdict, spawn_monitor};
use crate::message::{
    ClientFrame, Downstream, Ping, ProtocolError, Schema, ServerFrame, Upstream, decode,
};
use crate::outbound::OutboundQueue;
use crate::reconnection::{ReconnectOutcome, ReconnectionManager, StatusListener};
use crate::transport::Connector;

/// What the server told this client.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent<N> {
    /// An application notification.
    Notice(N),
    /// The server rejected one of our messages.
    ProtocolError(ProtocolError),
}

/// Errors returned by [`ClientNode::connect`].
#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
    /// The very first channel could not be opened.
    #[error("could not connect to {target}: {source}")]
    Setup {
        /// Description of the connector.
        target: String,
        /// Underlying I/O error.
        #[source]
        source: io::Error,
    },
}

struct ClientInner<S: Schema> {
    link: Arc<Link<ClientFrame<S>>>,
    outbound: OutboundQueue<ClientFrame<S>>,
    reconnection: ReconnectionManager<ClientFrame<S>>,
}

impl<S: Schema> Supervisor for ClientInner<S> {
    fn channel_failed(self: Arc<Self>, generation: u64) {
        tokio::spawn(async move {
            let outcome = self.reconnection.on_failure_detected(generation).await;
            tracing::trace!("Failure report for generation {generation}: {outcome:?}");
        });
    }
}

impl<S: Schema> ClientInner<S> {
    fn on_tick(&self) {
        let (verdict, generation) = self.link.on_tick();
        match verdict {
            TickVerdict::Probe => {
                let link = Arc::clone(&self.link);
                let ping = Upstream::Ping(Ping {
                    sender_id: link.identity().to_string(),
                });
                // Only an exhausted counter declares the server dead.
                tokio::spawn(async move {
                    if let Err(e) = link.hand_off(&ping).await {
                        tracing::debug!("Ping on link {} failed: {e}", link.id());
                    }
                });
            }
            TickVerdict::Expired => {
                tracing::warn!(
                    "Server stopped answering on link {} (generation {generation})",
                    self.link.id()
                );
                self.link.report_failure(generation);
            }
            TickVerdict::Idle => {}
        }
    }
}

/// A client connected to one server through a [`Connector`].
pub struct ClientNode<S: Schema> {
    inner: Arc<ClientInner<S>>,
    events: mpsc::UnboundedReceiver<ClientEvent<S::Notice>>,
    monitor: JoinHandle<()>,
    inbound: JoinHandle<()>,
}

impl<S: Schema> ClientNode<S> {
    /// Open the first channel and start the background tasks.
    ///
    /// Only this first attempt can fail. Later failures are retried until
    /// [`ClientNode::shutdown`].
    pub async fn connect<C, L>(
        connector: C,
        config: LinkConfig,
        listener: L,
    ) -> Result<Self, ConnectError>
    where
        C: Connector,
        L: StatusListener,
    {
        let channel = connector
            .connect()
            .await
            .map_err(|source| ConnectError::Setup {
                target: connector.describe(),
                source,
            })?;
        tracing::info!("Connected to {}", channel.describe());

        let connector: Arc<dyn Connector> = Arc::new(connector);
        let listener: Arc<dyn StatusListener> = Arc::new(listener);
        let period = config.ping_interval;
        let (readers_tx, readers_rx) = mpsc::unbounded_channel();

        let inner = Arc::new_cyclic(|weak: &Weak<ClientInner<S>>| {
            let supervisor: Weak<dyn Supervisor> = weak.clone();
            let link = Arc::new(Link::new(
                ConnectionId(0),
                config,
                channel,
                readers_tx,
                supervisor,
            ));
            ClientInner {
                outbound: OutboundQueue::new(Some(Arc::clone(&link))),
                reconnection: ReconnectionManager::new(Arc::clone(&link), connector, listener),
                link,
            }
        });

        let monitor = spawn_monitor(period, inner.link.subscribe_closed(), {
            let weak = Arc::downgrade(&inner);
            move || match weak.upgrade() {
                Some(inner) => {
                    inner.on_tick();
                    ControlFlow::Continue(())
                }
                None => ControlFlow::Break(()),
            }
        });

        let (events_tx, events) = mpsc::unbounded_channel();
        let inbound = tokio::spawn(pump_inbound::<S>(
            Arc::clone(&inner.link),
            readers_rx,
            events_tx,
        ));

        Ok(Self {
            inner,
            events,
            monitor,
            inbound,
        })
    }

    /// Queue a lobby request.
    pub fn send_lobby(&self, request: S::Lobby) {
        self.inner.outbound.enqueue(Upstream::PreSession(request));
    }

    /// Queue a gameplay message.
    pub fn send_game(&self, message: S::Game) {
        self.inner.outbound.enqueue(Upstream::InSession(message));
    }

    /// Send `request` first on every rebuilt channel, ahead of anything
    /// queued, so the new connection is back in session before game traffic
    /// arrives.
    pub fn set_rejoin(&self, request: S::Lobby) {
        self.inner
            .reconnection
            .set_rejoin(Some(Upstream::PreSession(request)));
    }

    /// Stop re-joining on reconnection.
    pub fn clear_rejoin(&self) {
        self.inner.reconnection.set_rejoin(None);
    }

    /// Next event from the server. `None` after shutdown.
    pub async fn next_event(&mut self) -> Option<ClientEvent<S::Notice>> {
        self.events.recv().await
    }

    /// Name used as the ping sender from now on.
    pub fn set_nickname(&self, nickname: impl Into<String>) {
        self.inner.link.set_nickname(nickname);
    }

    /// Generation of the current channel; bumped by every reconnection.
    pub fn generation(&self) -> u64 {
        self.inner.link.generation()
    }

    /// Liveness of the link as seen by the monitor.
    pub fn liveness(&self) -> LivenessState {
        self.inner.link.liveness()
    }

    /// Messages queued but not yet handed to a channel.
    pub fn pending(&self) -> Vec<ClientFrame<S>> {
        self.inner.outbound.pending()
    }

    /// Report a failure of the channel of `generation` and wait until it is
    /// dealt with.
    pub async fn on_failure_detected(&self, generation: u64) -> ReconnectOutcome {
        self.inner.reconnection.on_failure_detected(generation).await
    }

    /// Stop everything: pending messages are discarded and any running
    /// reconnection gives up.
    pub async fn shutdown(&self) {
        if !self.inner.link.begin_teardown() {
            return;
        }
        tracing::info!("Shutting down client link {}", self.inner.link.id());
        self.monitor.abort();
        self.inner.outbound.close();
        self.inner.link.drop_channel().await;
        self.inner.link.mark_closed();
    }
}

impl<S: Schema> Drop for ClientNode<S> {
    fn drop(&mut self) {
        if self.inner.link.begin_teardown() {
            self.inner.outbound.close();
            self.inner.link.mark_closed();
        }
        self.monitor.abort();
        self.inbound.abort();
    }
}

async fn pump_inbound<S: Schema>(
    link: Arc<Link<ClientFrame<S>>>,
    readers: mpsc::UnboundedReceiver<InstalledReader>,
    events: mpsc::UnboundedSender<ClientEvent<S::Notice>>,
) {
    link.read_loop(readers, |inbound| {
        match inbound {
            Inbound::Frame(frame) => match decode::<ServerFrame<S>>(&frame) {
                Ok(Downstream::Pong(_)) => tracing::trace!("Pong on link {}", link.id()),
                Ok(Downstream::Notice(notice)) => {
                    let _ = events.send(ClientEvent::Notice(notice));
                }
                Ok(Downstream::Error(error)) => {
                    tracing::warn!("Server error: {error}");
                    let _ = events.send(ClientEvent::ProtocolError(error));
                }
                Err(e) => tracing::warn!("Dropping undecodable frame from server: {e}"),
            },
            Inbound::Failed { generation, error } => {
                tracing::debug!(
                    "Read failed on link {} generation {generation}: {error}",
                    link.id()
                );
                link.report_failure(generation);
            }
        }
        ControlFlow::Continue(())
    })
    .await;
    tracing::trace!("Client read loop stopped");
}
