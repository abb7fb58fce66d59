//! Byte channels between the supervisor and one worker
//!
//! Two variants share one operation set: a loopback TCP socket
//! (cross-platform) and a named pipe (POSIX only). Both carry length-framed
//! UTF-8 messages; see [`framing`].

pub mod framing;
#[cfg(unix)]
pub mod pipe;
pub mod socket;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{CommunicationError, CommunicationResult};

#[cfg(unix)]
pub use pipe::PipeChannel;
pub use socket::SocketChannel;

/// A bidirectional reliable byte stream carrying framed messages.
///
/// `close` is idempotent and safe to call concurrently with an in-flight
/// read or write; the blocked call fails with a terminal error.
#[async_trait]
pub trait MessageChannel: Send + Sync {
    /// Opens the channel. For a server-mode socket this accepts the single
    /// worker connection; for a pipe this creates and opens the FIFO.
    async fn open(&self) -> CommunicationResult<()>;

    /// Writes raw bytes to the peer.
    async fn send_bytes(&self, data: &[u8]) -> CommunicationResult<()>;

    /// Reads up to `buffer.len()` raw bytes, returning the count read.
    async fn receive_bytes(&self, buffer: &mut [u8]) -> CommunicationResult<usize>;

    /// Frames and sends one message.
    async fn send_message(&self, message: &str) -> CommunicationResult<()>;

    /// Reads one complete framed message.
    ///
    /// Fails if end-of-stream is reached mid-frame or the declared length is
    /// outside the configured bounds.
    async fn receive_message(&self) -> CommunicationResult<String>;

    /// Closes the channel, unblocking in-flight reads and writes.
    async fn close(&self) -> CommunicationResult<()>;

    fn is_open(&self) -> bool;
}

/// Reads one framed message from a raw stream.
pub(crate) async fn read_frame<R>(reader: &mut R, max_len: usize) -> CommunicationResult<String>
where
    R: AsyncRead + Unpin + Send,
{
    let mut prefix = [0u8; framing::LENGTH_PREFIX_SIZE];
    reader
        .read_exact(&mut prefix)
        .await
        .map_err(map_frame_read_error)?;

    let length = framing::parse_length(&prefix)?;
    if length < 0 || length as usize > max_len {
        return Err(CommunicationError::protocol(format!(
            "Invalid message length: {}",
            length
        )));
    }

    let mut payload = vec![0u8; length as usize];
    reader
        .read_exact(&mut payload)
        .await
        .map_err(map_frame_read_error)?;

    String::from_utf8(payload)
        .map_err(|e| CommunicationError::protocol(format!("Message is not valid UTF-8: {}", e)))
}

/// Frames and writes one message to a raw stream.
pub(crate) async fn write_frame<W>(writer: &mut W, message: &str) -> CommunicationResult<()>
where
    W: AsyncWrite + Unpin + Send,
{
    writer.write_all(&framing::frame(message.as_bytes())).await?;
    writer.flush().await?;
    Ok(())
}

fn map_frame_read_error(err: std::io::Error) -> CommunicationError {
    if err.kind() == std::io::ErrorKind::UnexpectedEof {
        CommunicationError::protocol("End of stream reached mid-frame")
    } else {
        CommunicationError::Io(err)
    }
}
