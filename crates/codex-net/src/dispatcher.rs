//! Server-side session dispatcher.
//!
//! A connection starts in [`SessionPhase::PreSession`], where only lobby
//! requests and heartbeats are meaningful. The first lobby request the
//! [`Lobby`] accepts binds a [`Session`] and moves the connection to
//! [`SessionPhase::InSession`]; that happens at most once. Everything that
//! does not fit the current phase is answered with a [`ProtocolError`]
//! through the connection's reply queue and the connection stays open.

use std::sync::Arc;

use crate::link::{ConnectionId, Link};
use crate::message::{
    ClientFrame, Downstream, MessageError, Ping, Pong, ProtocolError, Schema, ServerFrame, Upstream,
};
use crate::outbound::OutboundQueue;

/// Why a lobby request was not accepted.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LobbyError {
    /// Tell the peer and keep the connection in the lobby phase.
    #[error("{0}")]
    Rejected(String),
    /// Tell the peer, then close the connection.
    #[error("{0}")]
    Refused(String),
}

/// Lobby collaborator: turns an accepted lobby request into a session.
pub trait Lobby<S: Schema>: Send + Sync + 'static {
    /// The in-session handler this lobby hands out.
    type Session: Session<S>;

    /// Handle a lobby request from the connection described by `ctx`.
    fn join(&self, request: S::Lobby, ctx: &SessionContext<S>)
    -> Result<Self::Session, LobbyError>;
}

/// Game collaborator bound to one connection.
pub trait Session<S: Schema>: Send + 'static {
    /// A gameplay message arrived.
    fn on_message(&mut self, message: S::Game);

    /// A heartbeat arrived while in session. Liveness has already been
    /// refreshed; answering is up to the session.
    fn on_heartbeat(&mut self, _ping: Ping) {}

    /// The connection is gone. Called exactly once.
    fn on_disconnect(&mut self);
}

/// What a lobby or session gets to know about its connection.
pub struct SessionContext<S: Schema> {
    link: Arc<Link<ServerFrame<S>>>,
    replies: OutboundQueue<ServerFrame<S>>,
}

impl<S: Schema> Clone for SessionContext<S> {
    fn clone(&self) -> Self {
        Self {
            link: Arc::clone(&self.link),
            replies: self.replies.clone(),
        }
    }
}

impl<S: Schema> SessionContext<S> {
    pub(crate) fn new(
        link: Arc<Link<ServerFrame<S>>>,
        replies: OutboundQueue<ServerFrame<S>>,
    ) -> Self {
        Self { link, replies }
    }

    /// Connection identifier.
    pub fn connection_id(&self) -> ConnectionId {
        self.link.id()
    }

    /// The link itself.
    pub fn link(&self) -> &Arc<Link<ServerFrame<S>>> {
        &self.link
    }

    /// Record the nickname the peer is known by.
    pub fn set_nickname(&self, nickname: impl Into<String>) {
        self.link.set_nickname(nickname);
    }

    /// Queue a notification on the connection's own reply queue.
    pub fn reply(&self, notice: S::Notice) {
        self.replies.enqueue(Downstream::Notice(notice));
    }

    /// Answer a heartbeat.
    pub fn pong(&self) {
        self.replies.enqueue(Downstream::Pong(Pong {}));
    }

    /// Queue a protocol error addressed to this peer.
    pub fn reject(&self, reason: impl Into<String>) {
        self.replies.enqueue(Downstream::Error(ProtocolError {
            reason: reason.into(),
            recipient: self.link.identity().to_string(),
        }));
    }
}

/// Where a connection is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionPhase {
    /// No session bound yet.
    PreSession,
    /// A session is bound.
    InSession,
}

/// What the connection should do after a dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    /// Keep reading.
    Continue,
    /// Flush replies and close.
    Close,
}

/// Routes one connection's inbound traffic by phase.
pub struct SessionDispatcher<S: Schema, L: Lobby<S>> {
    lobby: Arc<L>,
    ctx: SessionContext<S>,
    session: Option<L::Session>,
}

impl<S: Schema, L: Lobby<S>> SessionDispatcher<S, L> {
    /// A dispatcher in the lobby phase.
    pub fn new(lobby: Arc<L>, ctx: SessionContext<S>) -> Self {
        Self {
            lobby,
            ctx,
            session: None,
        }
    }

    /// Current phase.
    pub fn phase(&self) -> SessionPhase {
        if self.session.is_some() {
            SessionPhase::InSession
        } else {
            SessionPhase::PreSession
        }
    }

    /// Handle one decoded (or undecodable) inbound message.
    pub fn dispatch(&mut self, message: Result<ClientFrame<S>, MessageError>) -> Flow {
        let id = self.ctx.connection_id();
        let message = match message {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!("Connection {id} sent an unrecognised message: {e}");
                self.ctx.reject("message type not recognized");
                return Flow::Continue;
            }
        };

        let Some(session) = self.session.as_mut() else {
            return self.dispatch_pre_session(message);
        };
        match message {
            Upstream::Ping(ping) => session.on_heartbeat(ping),
            Upstream::InSession(message) => session.on_message(message),
            Upstream::PreSession(_) => {
                tracing::warn!("Connection {id} sent a lobby request while in a game");
                self.ctx.reject("you are already in a game");
            }
        }
        Flow::Continue
    }

    fn dispatch_pre_session(&mut self, message: ClientFrame<S>) -> Flow {
        let id = self.ctx.connection_id();
        match message {
            Upstream::Ping(ping) => {
                tracing::trace!("Ping from {} on connection {id}", ping.sender_id);
                self.ctx.pong();
            }
            Upstream::InSession(_) => {
                tracing::warn!("Connection {id} sent a game message before joining a game");
                self.ctx.reject("you must join a game before sending game messages");
            }
            Upstream::PreSession(request) => match self.lobby.join(request, &self.ctx) {
                Ok(session) => {
                    tracing::info!(
                        "Connection {id} joined a game as {}",
                        self.ctx.link.identity()
                    );
                    self.session = Some(session);
                }
                Err(LobbyError::Rejected(reason)) => {
                    tracing::info!("Lobby rejected connection {id}: {reason}");
                    self.ctx.reject(reason);
                }
                Err(LobbyError::Refused(reason)) => {
                    tracing::warn!("Lobby refused connection {id}: {reason}");
                    self.ctx.reject(reason);
                    return Flow::Close;
                }
            },
        }
        Flow::Continue
    }

    /// Notify the bound session, if any, that the connection is gone.
    /// Later calls do nothing.
    pub fn finish(&mut self) {
        if let Some(mut session) = self.session.take() {
            session.on_disconnect();
        }
    }
}
