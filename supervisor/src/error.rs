//! Supervisor-specific error types
//!
//! Each failure category surfaces as its own type so callers can distinguish
//! spawn failures from termination failures from channel failures. Background
//! task errors are never returned directly; they are logged and reflected
//! through worker status transitions.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use shared::WorkerId;

/// Failures while validating inputs or spawning a worker process.
#[derive(Error, Debug)]
pub enum CreationError {
    #[error("Interpreter '{interpreter}' is not runnable: {message}")]
    InterpreterUnavailable {
        interpreter: String,
        message: String,
    },

    #[error("Interpreter '{interpreter}' version probe exited with code {code}")]
    ProbeFailed { interpreter: String, code: i32 },

    #[error("Bootstrap script not found or unreadable: {path}")]
    BootstrapScript { path: PathBuf },

    #[error("Target script not found: {path}")]
    TargetScript { path: PathBuf },

    #[error("Failed to spawn worker process: {0}")]
    Spawn(#[from] std::io::Error),
}

/// Failures while terminating a worker process.
#[derive(Error, Debug)]
pub enum TerminationError {
    #[error("Failed to signal process {pid}: {message}")]
    Signal { pid: u32, message: String },

    #[error("Wait for process {pid} failed: {message}")]
    Wait { pid: u32, message: String },
}

/// Failures on the message channel between supervisor and worker.
#[derive(Error, Debug)]
pub enum CommunicationError {
    #[error("No communication channel for worker: {id}")]
    UnknownWorker { id: WorkerId },

    #[error("Outgoing message queue full for worker: {id}")]
    QueueFull { id: WorkerId },

    #[error("Channel is not open")]
    ChannelNotOpen,

    #[error("Connection timeout after {timeout:?}")]
    ConnectTimeout { timeout: Duration },

    #[error("Timeout waiting for message after {timeout:?}")]
    ReceiveTimeout { timeout: Duration },

    #[error("Message protocol error: {message}")]
    Protocol { message: String },

    #[error("Message serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Channel I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl CommunicationError {
    pub fn protocol(message: impl Into<String>) -> Self {
        CommunicationError::Protocol {
            message: message.into(),
        }
    }
}

/// Failures in the host log sink. Parse failures never surface.
#[derive(Error, Debug)]
pub enum LogCollectionError {
    #[error("Log sink failed: {message}")]
    Sink { message: String },
}

/// Internal sampling failures; logged, never surfaced to callers.
#[derive(Error, Debug)]
pub enum SamplingError {
    #[error("Worker is not being monitored: {id}")]
    NotMonitored { id: WorkerId },

    #[error("Memory probe failed: {message}")]
    MemoryProbe { message: String },
}

pub type CreationResult<T> = Result<T, CreationError>;
pub type TerminationResult<T> = Result<T, TerminationError>;
pub type CommunicationResult<T> = Result<T, CommunicationError>;
