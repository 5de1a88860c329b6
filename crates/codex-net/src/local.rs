//! In-process call channel.
//!
//! Each `send_frame` delivers one whole frame to the other end, like a remote
//! method call, so no byte-level framing is involved. Used for the RPC-style
//! transport and for running a client and a server inside one process.

use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use tokio::sync::mpsc;

use crate::framing::{FrameConfig, FrameError};
use crate::transport::{Channel, ConnectFuture, Connector};

/// One end of an in-process channel pair.
#[derive(Debug)]
pub struct LocalChannel {
    tx: mpsc::UnboundedSender<Vec<u8>>,
    rx: mpsc::UnboundedReceiver<Vec<u8>>,
    label: &'static str,
}

/// Create two connected ends.
pub fn pair() -> (LocalChannel, LocalChannel) {
    let (a_tx, b_rx) = mpsc::unbounded_channel();
    let (b_tx, a_rx) = mpsc::unbounded_channel();
    (
        LocalChannel {
            tx: a_tx,
            rx: a_rx,
            label: "local",
        },
        LocalChannel {
            tx: b_tx,
            rx: b_rx,
            label: "local",
        },
    )
}

impl LocalChannel {
    pub(crate) fn label(&self) -> &'static str {
        self.label
    }

    pub(crate) fn into_halves(self, config: FrameConfig) -> (LocalReceiver, LocalSender) {
        (
            LocalReceiver { rx: self.rx },
            LocalSender {
                tx: Some(self.tx),
                config,
            },
        )
    }
}

/// Receiving end of a [`LocalChannel`].
pub struct LocalReceiver {
    rx: mpsc::UnboundedReceiver<Vec<u8>>,
}

impl LocalReceiver {
    pub(crate) async fn next_frame(&mut self) -> Result<Vec<u8>, FrameError> {
        self.rx.recv().await.ok_or(FrameError::ConnectionClosed)
    }
}

/// Sending end of a [`LocalChannel`].
pub struct LocalSender {
    tx: Option<mpsc::UnboundedSender<Vec<u8>>>,
    config: FrameConfig,
}

impl LocalSender {
    pub(crate) fn send_frame(&mut self, payload: &[u8]) -> Result<(), FrameError> {
        let len = payload.len();
        if len > self.config.max_payload_size as usize {
            return Err(FrameError::PayloadTooLarge {
                size: u32::try_from(len).unwrap_or(u32::MAX),
                max: self.config.max_payload_size,
            });
        }
        let tx = self.tx.as_ref().ok_or(FrameError::ConnectionClosed)?;
        tx.send(payload.to_vec())
            .map_err(|_| FrameError::ConnectionClosed)
    }

    pub(crate) fn close(&mut self) {
        self.tx = None;
    }
}

/// Connector half of an in-process listener.
///
/// Every successful `connect` creates a fresh [`pair`] and hands the far end
/// to the matching [`LocalAcceptor`].
#[derive(Clone)]
pub struct LocalConnector {
    accept_tx: mpsc::UnboundedSender<LocalChannel>,
    refusals: Arc<AtomicU32>,
    attempts: Arc<AtomicU32>,
}

/// Accepting half of an in-process listener.
pub struct LocalAcceptor {
    rx: mpsc::UnboundedReceiver<LocalChannel>,
}

/// Create a connected connector/acceptor pair.
pub fn listener() -> (LocalConnector, LocalAcceptor) {
    let (accept_tx, rx) = mpsc::unbounded_channel();
    (
        LocalConnector {
            accept_tx,
            refusals: Arc::new(AtomicU32::new(0)),
            attempts: Arc::new(AtomicU32::new(0)),
        },
        LocalAcceptor { rx },
    )
}

impl LocalConnector {
    /// Refuse the next `n` connection attempts.
    pub fn refuse_next(&self, n: u32) {
        self.refusals.store(n, Ordering::SeqCst);
    }

    /// Total number of `connect` calls so far, refused ones included.
    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }
}

impl Connector for LocalConnector {
    fn connect(&self) -> ConnectFuture {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let refused = self
            .refusals
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();

        let result = if refused {
            Err(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                "local listener refused the connection",
            ))
        } else {
            let (near, far) = pair();
            self.accept_tx
                .send(far)
                .map(|()| Channel::Local(near))
                .map_err(|_| {
                    io::Error::new(io::ErrorKind::ConnectionRefused, "local listener is gone")
                })
        };
        Box::pin(async move { result })
    }

    fn describe(&self) -> String {
        "local listener".to_string()
    }
}

impl LocalAcceptor {
    /// Wait for the next incoming channel. `None` once every connector is gone.
    pub async fn accept(&mut self) -> Option<LocalChannel> {
        self.rx.recv().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_pair_delivers_whole_frames() {
        let (a, b) = pair();
        let config = FrameConfig::default();
        let (_a_rx, mut a_tx) = a.into_halves(config);
        let (mut b_rx, _b_tx) = b.into_halves(config);

        a_tx.send_frame(b"one").unwrap();
        a_tx.send_frame(b"two").unwrap();
        assert_eq!(b_rx.next_frame().await.unwrap(), b"one");
        assert_eq!(b_rx.next_frame().await.unwrap(), b"two");
    }

    #[tokio::test]
    async fn test_closed_sender_ends_stream() {
        let (a, b) = pair();
        let config = FrameConfig::default();
        let (_a_rx, mut a_tx) = a.into_halves(config);
        let (mut b_rx, _b_tx) = b.into_halves(config);

        a_tx.close();
        assert!(matches!(a_tx.send_frame(b"x"), Err(FrameError::ConnectionClosed)));
        assert!(matches!(
            b_rx.next_frame().await,
            Err(FrameError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn test_send_to_dropped_peer_fails() {
        let (a, b) = pair();
        let (_a_rx, mut a_tx) = a.into_halves(FrameConfig::default());
        drop(b);
        assert!(a_tx.send_frame(b"lost").is_err());
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let (a, _b) = pair();
        let (_rx, mut tx) = a.into_halves(FrameConfig {
            max_payload_size: 4,
        });
        assert!(matches!(
            tx.send_frame(b"too long"),
            Err(FrameError::PayloadTooLarge { size: 8, max: 4 })
        ));
    }

    #[tokio::test]
    async fn test_connector_refuses_then_accepts() {
        let (connector, mut acceptor) = listener();
        connector.refuse_next(2);

        assert!(connector.connect().await.is_err());
        assert!(connector.connect().await.is_err());
        let channel = connector.connect().await.unwrap();
        assert!(matches!(channel, Channel::Local(_)));
        assert!(acceptor.accept().await.is_some());
        assert_eq!(connector.attempts(), 3);
    }

    #[tokio::test]
    async fn test_connector_fails_without_acceptor() {
        let (connector, acceptor) = listener();
        drop(acceptor);
        assert!(connector.connect().await.is_err());
    }
}
