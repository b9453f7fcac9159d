//! Framed channel between the deployer, the companion, and agents.
//!
//! Every message is `MAGIC (8 bytes) || LENGTH (u32 LE) || PAYLOAD`. The
//! magic keeps both ends in sync: a mismatch means the stream offset can no
//! longer be trusted and the channel is abandoned. Payloads are never handed
//! out until fully read.

pub mod protocol;
pub mod stdio_pipe;

pub use protocol::{SendStatus, ServerRequest, ServerResponse};
pub use stdio_pipe::StdioPipeTransport;

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::debug;

/// Frame sentinel: `0xACA5` repeated four times.
pub const MAGIC: [u8; 8] = [0xAC, 0xA5, 0xAC, 0xA5, 0xAC, 0xA5, 0xAC, 0xA5];

/// Magic plus length prefix.
pub const HEADER_SIZE: usize = 12;

/// Maximum message size (64 MB). Safety valve against malformed messages.
pub const DEFAULT_MAX_MESSAGE_SIZE: u32 = 64 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("frame magic mismatch: found {found:02x?}")]
    MagicMismatch { found: [u8; 8] },

    #[error("stream ended after {read} of {expected} bytes")]
    PrematureEnd { expected: usize, read: usize },

    #[error("channel closed by peer")]
    Closed,

    #[error("message exceeds max size: {length} > {max}")]
    Oversized { length: usize, max: u32 },

    #[error("undecodable payload: {0}")]
    Undecodable(#[source] serde_json::Error),

    #[error("failed to encode message: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("channel is unusable after an earlier failure")]
    Broken,

    #[error("no reply within {0:?}")]
    Timeout(Duration),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Write one frame and flush.
pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    payload: &[u8],
    max_message_size: u32,
) -> Result<(), ChannelError> {
    let len = u32::try_from(payload.len())
        .ok()
        .filter(|len| *len <= max_message_size)
        .ok_or(ChannelError::Oversized {
            length: payload.len(),
            max: max_message_size,
        })?;

    writer.write_all(&MAGIC).await?;
    writer.write_all(&len.to_le_bytes()).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one frame.
///
/// End of stream before any byte of a frame is [`ChannelError::Closed`];
/// end of stream anywhere inside a frame is [`ChannelError::PrematureEnd`].
pub async fn read_frame<R: AsyncRead + Unpin>(
    reader: &mut R,
    max_message_size: u32,
) -> Result<Vec<u8>, ChannelError> {
    let mut magic = [0u8; 8];
    match read_full(reader, &mut magic).await? {
        0 => return Err(ChannelError::Closed),
        n if n < magic.len() => {
            return Err(ChannelError::PrematureEnd {
                expected: magic.len(),
                read: n,
            })
        }
        _ => {}
    }
    if magic != MAGIC {
        return Err(ChannelError::MagicMismatch { found: magic });
    }

    let mut len_buf = [0u8; 4];
    let n = read_full(reader, &mut len_buf).await?;
    if n < len_buf.len() {
        return Err(ChannelError::PrematureEnd {
            expected: len_buf.len(),
            read: n,
        });
    }
    let len = u32::from_le_bytes(len_buf);
    if len > max_message_size {
        return Err(ChannelError::Oversized {
            length: len as usize,
            max: max_message_size,
        });
    }

    let mut buf = vec![0u8; len as usize];
    let n = read_full(reader, &mut buf).await?;
    if n < buf.len() {
        return Err(ChannelError::PrematureEnd {
            expected: buf.len(),
            read: n,
        });
    }
    Ok(buf)
}

/// Fill `buf`, retrying short reads. Returns fewer bytes only at end of stream.
async fn read_full<R: AsyncRead + Unpin>(reader: &mut R, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

/// A duplex framed stream. Any failure while receiving, and any I/O failure
/// while sending, leaves the channel permanently broken.
pub struct FramedChannel<R, W> {
    reader: R,
    writer: W,
    max_message_size: u32,
    broken: bool,
}

impl<R, W> FramedChannel<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    pub const fn new(reader: R, writer: W) -> Self {
        Self {
            reader,
            writer,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            broken: false,
        }
    }

    #[must_use]
    pub const fn with_max_message_size(mut self, max_message_size: u32) -> Self {
        self.max_message_size = max_message_size;
        self
    }

    pub const fn is_broken(&self) -> bool {
        self.broken
    }

    pub async fn send(&mut self, payload: &[u8]) -> Result<(), ChannelError> {
        if self.broken {
            return Err(ChannelError::Broken);
        }
        let result = write_frame(&mut self.writer, payload, self.max_message_size).await;
        if matches!(result, Err(ChannelError::Io(_))) {
            self.broken = true;
        }
        result
    }

    pub async fn receive(&mut self) -> Result<Vec<u8>, ChannelError> {
        if self.broken {
            return Err(ChannelError::Broken);
        }
        let result = read_frame(&mut self.reader, self.max_message_size).await;
        if let Err(e) = &result {
            debug!(error = %e, "Receive failed, channel is now broken");
            self.broken = true;
        }
        result
    }

    pub async fn send_message<T: Serialize + Sync>(&mut self, message: &T) -> Result<(), ChannelError> {
        let payload = serde_json::to_vec(message).map_err(ChannelError::Encode)?;
        self.send(&payload).await
    }

    /// Receive and decode one JSON message. An undecodable payload breaks
    /// the channel just like a framing error.
    pub async fn receive_message<T: DeserializeOwned>(&mut self) -> Result<T, ChannelError> {
        let payload = self.receive().await?;
        serde_json::from_slice(&payload).map_err(|e| {
            self.broken = true;
            ChannelError::Undecodable(e)
        })
    }

    /// Shut down the write half so the peer sees end of stream.
    pub async fn shutdown(&mut self) -> Result<(), ChannelError> {
        self.writer.shutdown().await?;
        Ok(())
    }
}

/// Abstraction over the deployer ↔ companion channel.
///
/// Implementations handle connection-specific details (child process pipes,
/// in-memory streams) while the session works with this uniform interface.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send a request and wait for the response.
    ///
    /// One send/receive cycle runs at a time; concurrent callers serialize.
    async fn request(&self, req: &ServerRequest) -> Result<ServerResponse, ChannelError>;

    /// Close the channel and release whatever is behind it.
    async fn shutdown(&self) -> Result<()>;

    fn is_alive(&self) -> bool;
}

/// [`Transport`] over any pair of async byte streams.
pub struct ChannelTransport<R, W> {
    channel: Mutex<FramedChannel<R, W>>,
    alive: AtomicBool,
}

impl<R, W> ChannelTransport<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    pub fn new(channel: FramedChannel<R, W>) -> Self {
        Self {
            channel: Mutex::new(channel),
            alive: AtomicBool::new(true),
        }
    }
}

#[async_trait]
impl<R, W> Transport for ChannelTransport<R, W>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    async fn request(&self, req: &ServerRequest) -> Result<ServerResponse, ChannelError> {
        if !self.alive.load(Ordering::Relaxed) {
            return Err(ChannelError::Broken);
        }

        // One lock covers the whole send/receive cycle.
        let mut channel = self.channel.lock().await;
        let result = match channel.send_message(req).await {
            Ok(()) => channel.receive_message().await,
            Err(e) => Err(e),
        };
        if channel.is_broken() {
            self.alive.store(false, Ordering::Relaxed);
        }
        result
    }

    async fn shutdown(&self) -> Result<()> {
        if !self.alive.swap(false, Ordering::Relaxed) {
            return Ok(());
        }
        let mut channel = self.channel.lock().await;
        if let Err(e) = channel.shutdown().await {
            debug!(error = %e, "Channel shutdown failed");
        }
        Ok(())
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Relaxed)
    }
}
