//! Transport channels: the physical stream behind a link.
//!
//! A [`Channel`] is either a TCP socket or an in-process [`LocalChannel`]
//! that hands whole frames across like a remote call. Both split into a
//! [`ChannelReader`] and a [`ChannelWriter`] with the same frame-level
//! contract, so nothing above this module cares which one is in use.
//!
//! New channels are opened through a [`Connector`], which is what the
//! reconnection manager calls when it rebuilds a broken link.

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;

use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};

use crate::framing::{FrameConfig, FrameError, FrameReader, write_frame};
use crate::local::{LocalChannel, LocalReceiver, LocalSender};

/// A duplex framed stream, opened and replaced as a unit.
#[derive(Debug)]
pub enum Channel {
    /// Length-prefixed frames over TCP.
    Tcp(TcpStream),
    /// Frames handed over an in-process call channel.
    Local(LocalChannel),
}

impl From<TcpStream> for Channel {
    fn from(stream: TcpStream) -> Self {
        Self::Tcp(stream)
    }
}

impl From<LocalChannel> for Channel {
    fn from(channel: LocalChannel) -> Self {
        Self::Local(channel)
    }
}

impl Channel {
    /// Human-readable description of the remote end, for logs.
    pub fn describe(&self) -> String {
        match self {
            Self::Tcp(stream) => match stream.peer_addr() {
                Ok(addr) => addr.to_string(),
                Err(_) => "tcp (unknown peer)".to_string(),
            },
            Self::Local(channel) => channel.label().to_string(),
        }
    }

    /// Split into independently owned read and write halves.
    pub fn split(self, config: FrameConfig) -> (ChannelReader, ChannelWriter) {
        match self {
            Self::Tcp(stream) => {
                let (read, write) = stream.into_split();
                (
                    ChannelReader::Tcp(FrameReader::new(read, config)),
                    ChannelWriter::Tcp {
                        half: write,
                        config,
                    },
                )
            }
            Self::Local(channel) => {
                let (rx, tx) = channel.into_halves(config);
                (ChannelReader::Local(rx), ChannelWriter::Local(tx))
            }
        }
    }
}

/// Receiving half of a [`Channel`].
pub enum ChannelReader {
    /// TCP read half.
    Tcp(FrameReader<OwnedReadHalf>),
    /// Local receiving end.
    Local(LocalReceiver),
}

impl ChannelReader {
    /// Wait for the next frame. Cancel-safe.
    pub async fn next_frame(&mut self) -> Result<Vec<u8>, FrameError> {
        match self {
            Self::Tcp(reader) => reader.next_frame().await,
            Self::Local(rx) => rx.next_frame().await,
        }
    }
}

/// Sending half of a [`Channel`].
pub enum ChannelWriter {
    /// TCP write half.
    Tcp {
        /// Socket write half.
        half: OwnedWriteHalf,
        /// Frame limits.
        config: FrameConfig,
    },
    /// Local sending end.
    Local(LocalSender),
}

impl ChannelWriter {
    /// Write one frame. Returns once the frame has been handed to the stream.
    pub async fn send_frame(&mut self, payload: &[u8]) -> Result<(), FrameError> {
        match self {
            Self::Tcp { half, config } => write_frame(half, payload, config).await,
            Self::Local(tx) => tx.send_frame(payload),
        }
    }

    /// Close the sending side. The peer observes end of stream.
    pub async fn close(&mut self) {
        match self {
            Self::Tcp { half, .. } => {
                if let Err(e) = half.shutdown().await {
                    tracing::trace!("Ignoring error while closing TCP writer: {e}");
                }
            }
            Self::Local(tx) => tx.close(),
        }
    }
}

/// Boxed future returned by [`Connector::connect`].
pub type ConnectFuture = Pin<Box<dyn Future<Output = io::Result<Channel>> + Send>>;

/// Opens fresh channels to one fixed peer.
pub trait Connector: Send + Sync + 'static {
    /// Open a new channel.
    fn connect(&self) -> ConnectFuture;

    /// Description of the peer, for logs.
    fn describe(&self) -> String;
}

/// Connects over TCP to a fixed address.
#[derive(Debug, Clone, Copy)]
pub struct TcpConnector {
    addr: SocketAddr,
}

impl TcpConnector {
    /// Create a connector for `addr`.
    pub fn new(addr: SocketAddr) -> Self {
        Self { addr }
    }
}

impl Connector for TcpConnector {
    fn connect(&self) -> ConnectFuture {
        let addr = self.addr;
        Box::pin(async move {
            let stream = TcpStream::connect(addr).await?;
            stream.set_nodelay(true)?;
            Ok(Channel::Tcp(stream))
        })
    }

    fn describe(&self) -> String {
        self.addr.to_string()
    }
}
