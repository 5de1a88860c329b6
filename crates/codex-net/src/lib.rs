//! Reconnectable links for a turn-based board game: framing, wire envelopes,
//! liveness monitoring, ordered outbound delivery, client-side reconnection
//! and server-side session dispatch.

pub mod client;
pub mod dispatcher;
pub mod framing;
pub mod link;
pub mod liveness;
pub mod local;
pub mod message;
pub mod outbound;
pub mod reconnection;
pub mod server;
pub mod transport;

pub use client::{ClientEvent, ClientNode, ConnectError};
pub use dispatcher::{
    Flow, Lobby, LobbyError, Session, SessionContext, SessionDispatcher, SessionPhase,
};
pub use framing::{FrameConfig, FrameError, FrameReader, write_frame};
pub use link::{ConnectionId, IdGenerator, Identity, Link, LinkConfig, LinkError};
pub use liveness::{LivenessState, MissCounter, TickVerdict};
pub use local::{LocalAcceptor, LocalChannel, LocalConnector};
pub use message::{
    ClientFrame, Downstream, MessageError, Ping, Pong, ProtocolError, Schema, ServerFrame,
    Upstream, WireMessage,
};
pub use outbound::OutboundQueue;
pub use reconnection::{
    PeerStatus, ReconnectOutcome, ReconnectionManager, RetrySchedule, StatusListener,
};
pub use server::{
    ConnectionLimitReached, ConnectionMap, GameServer, ServerConfig, ServerConnection,
};
pub use transport::{
    Channel, ChannelReader, ChannelWriter, ConnectFuture, Connector, TcpConnector,
};
