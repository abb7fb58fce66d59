//! Shared types and messages for the worker supervisor system
//!
//! This crate provides the core identifiers, log record model, metrics
//! snapshot model, and wire message definitions used between the supervisor
//! runtime and its embedding host.

pub mod errors;
pub mod logging;
pub mod messages;
pub mod types;

// Re-export commonly used types
pub use errors::{SharedError, SharedResult};
pub use messages::{WireMessage, DATA_MESSAGE_TYPE, HEARTBEAT_MESSAGE_TYPE};
pub use types::{
    LogLevel, LogRecord, LogSource, MetricsSnapshot, SystemMemoryInfo, WorkerId, WorkerStatus,
};
