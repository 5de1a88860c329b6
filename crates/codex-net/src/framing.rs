//! Length-prefixed framing for stream transports.
//!
//! Every message on a byte stream travels as one frame:
//!
//! ```text
//! +-------------------+--------------------+
//! | length (4 bytes)  |   payload          |
//! | u32 little-endian |   (length bytes)   |
//! +-------------------+--------------------+
//! ```
//!
//! The length does **not** include the 4 prefix bytes. Reading goes through
//! [`FrameReader`], which buffers partial input so that a pending
//! [`FrameReader::next_frame`] can be dropped (for example by a read timeout)
//! without losing bytes that were already pulled off the socket.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Size of the length prefix in bytes.
pub const LENGTH_PREFIX: usize = 4;

const READ_CHUNK: usize = 4096;

/// Configuration for the framing layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameConfig {
    /// Maximum allowed payload size in bytes. Default: 1 MiB.
    pub max_payload_size: u32,
}

impl Default for FrameConfig {
    fn default() -> Self {
        Self {
            max_payload_size: 1_048_576,
        }
    }
}

impl FrameConfig {
    fn check(&self, len: usize) -> Result<(), FrameError> {
        let max = self.max_payload_size;
        match u32::try_from(len) {
            Ok(size) if size <= max => Ok(()),
            Ok(size) => Err(FrameError::PayloadTooLarge { size, max }),
            Err(_) => Err(FrameError::PayloadTooLarge {
                size: u32::MAX,
                max,
            }),
        }
    }
}

/// Errors that can occur during framing operations.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// The payload size exceeds the configured maximum.
    #[error("payload size {size} exceeds maximum {max}")]
    PayloadTooLarge {
        /// The actual payload size.
        size: u32,
        /// The configured maximum.
        max: u32,
    },

    /// The peer closed the stream.
    #[error("connection closed")]
    ConnectionClosed,

    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Write a single length-prefixed frame and flush it.
pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    payload: &[u8],
    config: &FrameConfig,
) -> Result<(), FrameError> {
    config.check(payload.len())?;
    let len = payload.len() as u32;

    writer.write_all(&len.to_le_bytes()).await?;
    if !payload.is_empty() {
        writer.write_all(payload).await?;
    }
    writer.flush().await?;

    Ok(())
}

/// Incremental frame decoder over an [`AsyncRead`].
///
/// Bytes are accumulated in an internal buffer and only removed once a whole
/// frame is available, so cancelling `next_frame` between polls is safe.
pub struct FrameReader<R> {
    inner: R,
    buf: Vec<u8>,
    config: FrameConfig,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    /// Wrap a reader.
    pub fn new(inner: R, config: FrameConfig) -> Self {
        Self {
            inner,
            buf: Vec::new(),
            config,
        }
    }

    /// Wait for the next complete frame and return its payload.
    pub async fn next_frame(&mut self) -> Result<Vec<u8>, FrameError> {
        loop {
            if let Some(frame) = self.take_buffered()? {
                return Ok(frame);
            }

            let mut chunk = [0u8; READ_CHUNK];
            let n = self.inner.read(&mut chunk).await?;
            if n == 0 {
                return Err(FrameError::ConnectionClosed);
            }
            self.buf.extend_from_slice(&chunk[..n]);
        }
    }

    /// Number of bytes received but not yet returned as a frame.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    fn take_buffered(&mut self) -> Result<Option<Vec<u8>>, FrameError> {
        if self.buf.len() < LENGTH_PREFIX {
            return Ok(None);
        }

        let mut len_buf = [0u8; LENGTH_PREFIX];
        len_buf.copy_from_slice(&self.buf[..LENGTH_PREFIX]);
        let payload_len = u32::from_le_bytes(len_buf);
        if payload_len > self.config.max_payload_size {
            return Err(FrameError::PayloadTooLarge {
                size: payload_len,
                max: self.config.max_payload_size,
            });
        }

        let end = LENGTH_PREFIX + payload_len as usize;
        if self.buf.len() < end {
            return Ok(None);
        }

        let payload = self.buf[LENGTH_PREFIX..end].to_vec();
        self.buf.drain(..end);
        Ok(Some(payload))
    }
}
