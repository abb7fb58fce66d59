//! Host-facing service traits
//!
//! The supervisor forwards accepted log records into a host-provided sink.
//! The trait is mockable for testing.

use async_trait::async_trait;

use crate::error::LogCollectionError;
use shared::{LogLevel, LogRecord};

/// Destination for worker log records accepted by the pump.
///
/// `logger` is derived from the record's source stream, e.g.
/// `worker_log.stdout`.
#[mockall::automock]
#[async_trait]
pub trait LogSink: Send + Sync {
    async fn forward(&self, logger: &str, record: &LogRecord) -> Result<(), LogCollectionError>;
}

/// Default sink that re-emits worker records through `tracing`.
pub struct TracingLogSink;

#[async_trait]
impl LogSink for TracingLogSink {
    async fn forward(&self, logger: &str, record: &LogRecord) -> Result<(), LogCollectionError> {
        let origin = record
            .metadata
            .get("logger")
            .map(String::as_str)
            .unwrap_or("unknown");

        match record.level {
            LogLevel::Trace => {
                tracing::trace!(logger = %logger, origin = %origin, "{}", record.message)
            }
            LogLevel::Debug => {
                tracing::debug!(logger = %logger, origin = %origin, "{}", record.message)
            }
            LogLevel::Info => {
                tracing::info!(logger = %logger, origin = %origin, "{}", record.message)
            }
            LogLevel::Warn => {
                tracing::warn!(logger = %logger, origin = %origin, "{}", record.message)
            }
            LogLevel::Error => {
                tracing::error!(logger = %logger, origin = %origin, "{}", record.message)
            }
        }
        Ok(())
    }
}
