//! Loopback TCP channel
//!
//! The supervisor runs the server side: it binds an ephemeral loopback port,
//! tells the worker the port on its command line, and accepts exactly one
//! connection. The client side exists for tests and worker-side tooling.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::io::AsyncReadExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use super::{read_frame, write_frame, MessageChannel};
use crate::config::ChannelConfig;
use crate::error::{CommunicationError, CommunicationResult};

enum SocketMode {
    /// Accept one worker connection on an ephemeral loopback port.
    Server,
    /// Connect out to an existing listener.
    Client { addr: SocketAddr },
}

pub struct SocketChannel {
    mode: SocketMode,
    config: ChannelConfig,
    listener: Mutex<Option<TcpListener>>,
    reader: Mutex<Option<OwnedReadHalf>>,
    writer: Mutex<Option<OwnedWriteHalf>>,
    open: AtomicBool,
    closed: CancellationToken,
}

impl SocketChannel {
    pub fn server(config: ChannelConfig) -> Self {
        Self {
            mode: SocketMode::Server,
            config,
            listener: Mutex::new(None),
            reader: Mutex::new(None),
            writer: Mutex::new(None),
            open: AtomicBool::new(false),
            closed: CancellationToken::new(),
        }
    }

    pub fn client(addr: SocketAddr, config: ChannelConfig) -> Self {
        Self {
            mode: SocketMode::Client { addr },
            config,
            listener: Mutex::new(None),
            reader: Mutex::new(None),
            writer: Mutex::new(None),
            open: AtomicBool::new(false),
            closed: CancellationToken::new(),
        }
    }

    /// Binds the server socket and returns the ephemeral port, so the port
    /// can be handed to the worker before the blocking accept happens.
    pub async fn bind(&self) -> CommunicationResult<u16> {
        let listener = TcpListener::bind(("127.0.0.1", 0)).await?;
        let port = listener.local_addr()?.port();
        *self.listener.lock().await = Some(listener);
        tracing::debug!("Socket channel listening on port {}", port);
        Ok(port)
    }

    async fn accept_worker(&self) -> CommunicationResult<TcpStream> {
        let listener = {
            let mut guard = self.listener.lock().await;
            match guard.take() {
                Some(listener) => listener,
                None => {
                    drop(guard);
                    self.bind().await?;
                    self.listener
                        .lock()
                        .await
                        .take()
                        .ok_or(CommunicationError::ChannelNotOpen)?
                }
            }
        };

        let accepted = tokio::select! {
            result = tokio::time::timeout(self.config.connect_timeout, listener.accept()) => result,
            _ = self.closed.cancelled() => return Err(CommunicationError::ChannelNotOpen),
        };

        match accepted {
            Ok(Ok((stream, peer))) => {
                tracing::debug!("Socket channel accepted connection from {}", peer);
                Ok(stream)
            }
            Ok(Err(e)) => Err(CommunicationError::Io(e)),
            Err(_) => Err(CommunicationError::ConnectTimeout {
                timeout: self.config.connect_timeout,
            }),
        }
    }
}

#[async_trait]
impl MessageChannel for SocketChannel {
    async fn open(&self) -> CommunicationResult<()> {
        if self.closed.is_cancelled() {
            return Err(CommunicationError::ChannelNotOpen);
        }

        let stream = match self.mode {
            SocketMode::Server => self.accept_worker().await?,
            SocketMode::Client { addr } => TcpStream::connect(addr).await?,
        };

        let (read_half, write_half) = stream.into_split();
        *self.reader.lock().await = Some(read_half);
        *self.writer.lock().await = Some(write_half);
        self.open.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn send_bytes(&self, data: &[u8]) -> CommunicationResult<()> {
        if !self.is_open() {
            return Err(CommunicationError::ChannelNotOpen);
        }
        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or(CommunicationError::ChannelNotOpen)?;
        tokio::select! {
            result = async {
                use tokio::io::AsyncWriteExt;
                writer.write_all(data).await?;
                writer.flush().await?;
                Ok(())
            } => result,
            _ = self.closed.cancelled() => Err(CommunicationError::ChannelNotOpen),
        }
    }

    async fn receive_bytes(&self, buffer: &mut [u8]) -> CommunicationResult<usize> {
        if !self.is_open() {
            return Err(CommunicationError::ChannelNotOpen);
        }
        let mut guard = self.reader.lock().await;
        let reader = guard.as_mut().ok_or(CommunicationError::ChannelNotOpen)?;
        tokio::select! {
            result = reader.read(buffer) => Ok(result?),
            _ = self.closed.cancelled() => Err(CommunicationError::ChannelNotOpen),
        }
    }

    async fn send_message(&self, message: &str) -> CommunicationResult<()> {
        if !self.is_open() {
            return Err(CommunicationError::ChannelNotOpen);
        }
        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or(CommunicationError::ChannelNotOpen)?;
        tokio::select! {
            result = write_frame(writer, message) => result,
            _ = self.closed.cancelled() => Err(CommunicationError::ChannelNotOpen),
        }
    }

    async fn receive_message(&self) -> CommunicationResult<String> {
        if !self.is_open() {
            return Err(CommunicationError::ChannelNotOpen);
        }
        let mut guard = self.reader.lock().await;
        let reader = guard.as_mut().ok_or(CommunicationError::ChannelNotOpen)?;
        tokio::select! {
            result = read_frame(reader, self.config.max_frame_len) => result,
            _ = self.closed.cancelled() => Err(CommunicationError::ChannelNotOpen),
        }
    }

    async fn close(&self) -> CommunicationResult<()> {
        self.open.store(false, Ordering::SeqCst);
        self.closed.cancel();
        self.listener.lock().await.take();
        self.reader.lock().await.take();
        self.writer.lock().await.take();
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst) && !self.closed.is_cancelled()
    }
}
