//! Wire envelopes and serialization.
//!
//! The link layer does not know the game's message schema. Applications plug
//! their own lobby, gameplay and notification types in through [`Schema`];
//! the layer wraps them in [`Upstream`] (client to server) and [`Downstream`]
//! (server to client) envelopes whose variant doubles as the message
//! category.
//!
//! Every payload is serialized with [`postcard`] and prefixed with a protocol
//! version byte. Use [`encode`] and [`decode`] for encoding/decoding.

use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Current wire-protocol version. Prepended to every serialized message.
pub const PROTOCOL_VERSION: u8 = 1;

/// Bounds every application message type has to satisfy.
pub trait WireMessage:
    Serialize + DeserializeOwned + Clone + fmt::Debug + Send + Sync + 'static
{
}

impl<T> WireMessage for T where
    T: Serialize + DeserializeOwned + Clone + fmt::Debug + Send + Sync + 'static
{
}

/// The application message types carried by a link.
pub trait Schema: Send + Sync + 'static {
    /// Lobby-phase requests (client to server).
    type Lobby: WireMessage;
    /// Gameplay messages (client to server).
    type Game: WireMessage;
    /// Notifications (server to client).
    type Notice: WireMessage;
}

/// Envelope sent by a client for schema `S`.
pub type ClientFrame<S> = Upstream<<S as Schema>::Lobby, <S as Schema>::Game>;

/// Envelope sent by a server for schema `S`.
pub type ServerFrame<S> = Downstream<<S as Schema>::Notice>;

// ---------------------------------------------------------------------------
// Envelopes
// ---------------------------------------------------------------------------

/// Client to server envelope.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum Upstream<L, G> {
    /// Liveness probe.
    Ping(Ping),
    /// Lobby request.
    PreSession(L),
    /// Gameplay message.
    InSession(G),
}

/// Server to client envelope.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum Downstream<N> {
    /// Direct reply to a [`Ping`].
    Pong(Pong),
    /// Application notification.
    Notice(N),
    /// Protocol violation report.
    Error(ProtocolError),
}

// ---------------------------------------------------------------------------
// Payload structs
// ---------------------------------------------------------------------------

/// Heartbeat probe.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Ping {
    /// Nickname of the probing side, `Unknown` before it has one.
    pub sender_id: String,
}

/// Heartbeat reply.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Pong {}

/// Generic error notification returned to a misbehaving peer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProtocolError {
    /// Human-readable reason.
    pub reason: String,
    /// Who the error is addressed to.
    pub recipient: String,
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (to {})", self.reason, self.recipient)
    }
}

/// Errors that can occur when decoding a payload.
#[derive(Debug, thiserror::Error)]
pub enum MessageError {
    /// The payload was empty (no version byte).
    #[error("empty payload")]
    EmptyPayload,

    /// The version byte does not match [`PROTOCOL_VERSION`].
    #[error("unsupported protocol version: {0}")]
    UnsupportedVersion(u8),

    /// Postcard deserialization failed.
    #[error("deserialization error: {0}")]
    Postcard(#[from] postcard::Error),
}

// ---------------------------------------------------------------------------
// Serialization helpers
// ---------------------------------------------------------------------------

/// Serialize a message into a versioned binary payload.
///
/// Wire format: `[version: u8] [postcard-encoded message]`
pub fn encode<T: Serialize>(msg: &T) -> Result<Vec<u8>, postcard::Error> {
    let body = postcard::to_allocvec(msg)?;
    let mut out = Vec::with_capacity(1 + body.len());
    out.push(PROTOCOL_VERSION);
    out.extend_from_slice(&body);
    Ok(out)
}

/// Deserialize a versioned binary payload.
pub fn decode<T: DeserializeOwned>(data: &[u8]) -> Result<T, MessageError> {
    let Some((&version, body)) = data.split_first() else {
        return Err(MessageError::EmptyPayload);
    };
    if version != PROTOCOL_VERSION {
        return Err(MessageError::UnsupportedVersion(version));
    }

    Ok(postcard::from_bytes(body)?)
}
