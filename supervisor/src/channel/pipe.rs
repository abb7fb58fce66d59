//! Named pipe channel (POSIX only)
//!
//! A filesystem FIFO is created if absent, opened for both reading and
//! writing by the supervisor, and deleted again on close.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncReadExt;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use super::{read_frame, write_frame, MessageChannel};
use crate::config::ChannelConfig;
use crate::error::{CommunicationError, CommunicationResult};

pub struct PipeChannel {
    path: PathBuf,
    config: ChannelConfig,
    reader: Mutex<Option<File>>,
    writer: Mutex<Option<File>>,
    open: AtomicBool,
    closed: CancellationToken,
}

impl PipeChannel {
    pub fn new(path: impl Into<PathBuf>, config: ChannelConfig) -> Self {
        Self {
            path: path.into(),
            config,
            reader: Mutex::new(None),
            writer: Mutex::new(None),
            open: AtomicBool::new(false),
            closed: CancellationToken::new(),
        }
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }

    async fn create_fifo(&self) -> CommunicationResult<()> {
        let status = tokio::process::Command::new("mkfifo")
            .arg(&self.path)
            .status()
            .await?;
        if !status.success() {
            return Err(CommunicationError::protocol(format!(
                "mkfifo failed with status {} for {}",
                status,
                self.path.display()
            )));
        }
        tracing::debug!("Created named pipe: {}", self.path.display());
        Ok(())
    }
}

#[async_trait]
impl MessageChannel for PipeChannel {
    async fn open(&self) -> CommunicationResult<()> {
        if self.closed.is_cancelled() {
            return Err(CommunicationError::ChannelNotOpen);
        }

        if !self.path.exists() {
            self.create_fifo().await?;
        }

        // Opening read+write never blocks on a FIFO with no peer yet.
        let writer = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&self.path)
            .await?;
        let reader = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&self.path)
            .await?;

        *self.writer.lock().await = Some(writer);
        *self.reader.lock().await = Some(reader);
        self.open.store(true, Ordering::SeqCst);
        tracing::debug!("Named pipe channel opened: {}", self.path.display());
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
        self.reader.lock().await.take();
        self.writer.lock().await.take();

        if self.path.exists() {
            if let Err(e) = tokio::fs::remove_file(&self.path).await {
                tracing::warn!("Failed to delete named pipe {}: {}", self.path.display(), e);
            } else {
                tracing::debug!("Deleted named pipe: {}", self.path.display());
            }
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst) && !self.closed.is_cancelled()
    }
}
