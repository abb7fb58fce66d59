//! Core shared types and identifiers

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Unique identifier for a supervised worker process.
///
/// Assigned at spawn and stable for the life of the supervisor record.
/// Exposes the OS process id of the worker it names.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkerId {
    uuid: Uuid,
    pid: u32,
}

impl WorkerId {
    pub fn new(pid: u32) -> Self {
        Self {
            uuid: Uuid::new_v4(),
            pid,
        }
    }

    /// OS process id of the worker.
    pub fn pid(&self) -> u32 {
        self.pid
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "worker-{}", self.pid)
    }
}

/// Lifecycle status of a supervised worker.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum WorkerStatus {
    Starting,
    Running,
    Completed,
    Failed,
    Terminated,
    Unresponsive,
}

impl WorkerStatus {
    /// Terminal statuses absorb all natural events.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            WorkerStatus::Completed | WorkerStatus::Failed | WorkerStatus::Terminated
        )
    }
}

impl fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            WorkerStatus::Starting => "STARTING",
            WorkerStatus::Running => "RUNNING",
            WorkerStatus::Completed => "COMPLETED",
            WorkerStatus::Failed => "FAILED",
            WorkerStatus::Terminated => "TERMINATED",
            WorkerStatus::Unresponsive => "UNRESPONSIVE",
        };
        write!(f, "{}", name)
    }
}

/// Severity of a collected worker log record.
///
/// Ordering follows severity so records can be filtered against a threshold.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    /// Maps a level name as emitted by a worker onto the supervisor's levels.
    ///
    /// `WARNING` maps to `Warn` and `CRITICAL` to `Error`; anything
    /// unrecognized falls back to `Info`.
    pub fn from_worker_name(name: &str) -> Self {
        match name.to_ascii_uppercase().as_str() {
            "TRACE" => LogLevel::Trace,
            "DEBUG" => LogLevel::Debug,
            "INFO" => LogLevel::Info,
            "WARN" | "WARNING" => LogLevel::Warn,
            "ERROR" | "CRITICAL" => LogLevel::Error,
            _ => LogLevel::Info,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Trace => "TRACE",
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warn => "WARN",
            LogLevel::Error => "ERROR",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for LogLevel {
    type Err = crate::errors::SharedError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "TRACE" => Ok(LogLevel::Trace),
            "DEBUG" => Ok(LogLevel::Debug),
            "INFO" => Ok(LogLevel::Info),
            "WARN" => Ok(LogLevel::Warn),
            "ERROR" => Ok(LogLevel::Error),
            other => Err(crate::errors::SharedError::InvalidLogLevel {
                input: other.to_string(),
            }),
        }
    }
}

/// Which worker stream a log record was read from.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum LogSource {
    Stdout,
    Stderr,
}

impl LogSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogSource::Stdout => "stdout",
            LogSource::Stderr => "stderr",
        }
    }
}

impl fmt::Display for LogSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One parsed line of worker output.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct LogRecord {
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub message: String,
    pub source: LogSource,
    pub metadata: HashMap<String, String>,
}

impl LogRecord {
    pub fn new(
        timestamp: DateTime<Utc>,
        level: LogLevel,
        message: impl Into<String>,
        source: LogSource,
        metadata: HashMap<String, String>,
    ) -> Self {
        Self {
            timestamp,
            level,
            message: message.into(),
            source,
            metadata,
        }
    }

    /// Plain-text record at `Info` with an empty metadata map.
    pub fn plain(message: impl Into<String>, source: LogSource) -> Self {
        Self::new(Utc::now(), LogLevel::Info, message, source, HashMap::new())
    }
}

/// Resource usage of one worker at one instant.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    /// Cumulative CPU time in milliseconds.
    pub cpu_time_ms: u64,
    /// Current resident memory in bytes.
    pub memory_bytes: u64,
    /// Peak resident memory observed since monitoring started, in bytes.
    pub peak_memory_bytes: u64,
    /// Wall-clock time since the worker was spawned.
    pub execution_time: Duration,
    /// Instant of the most recent heartbeat received from the worker.
    pub last_heartbeat: DateTime<Utc>,
}

/// Best-effort system-wide memory read-out. Zeros indicate unavailability.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct SystemMemoryInfo {
    pub total_physical: u64,
    pub free_physical: u64,
    pub total_swap: u64,
    pub free_swap: u64,
}

impl SystemMemoryInfo {
    pub fn used_physical(&self) -> u64 {
        self.total_physical.saturating_sub(self.free_physical)
    }

    pub fn used_swap(&self) -> u64 {
        self.total_swap.saturating_sub(self.free_swap)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worker_id_display_and_pid() {
        let id = WorkerId::new(4242);
        assert_eq!(id.pid(), 4242);
        assert_eq!(id.to_string(), "worker-4242");
    }

    #[test]
    fn test_worker_ids_are_unique_per_creation() {
        // Two workers can reuse the same OS pid over time; the handle must
        // still distinguish them.
        let a = WorkerId::new(100);
        let b = WorkerId::new(100);
        assert_ne!(a, b);
    }

    #[test]
    fn test_level_mapping_from_worker_names() {
        assert_eq!(LogLevel::from_worker_name("WARNING"), LogLevel::Warn);
        assert_eq!(LogLevel::from_worker_name("CRITICAL"), LogLevel::Error);
        assert_eq!(LogLevel::from_worker_name("DEBUG"), LogLevel::Debug);
        assert_eq!(LogLevel::from_worker_name("banana"), LogLevel::Info);
    }

    #[test]
    fn test_level_ordering_matches_severity() {
        assert!(LogLevel::Trace < LogLevel::Debug);
        assert!(LogLevel::Debug < LogLevel::Info);
        assert!(LogLevel::Info < LogLevel::Warn);
        assert!(LogLevel::Warn < LogLevel::Error);
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(WorkerStatus::Completed.is_terminal());
        assert!(WorkerStatus::Failed.is_terminal());
        assert!(WorkerStatus::Terminated.is_terminal());
        assert!(!WorkerStatus::Starting.is_terminal());
        assert!(!WorkerStatus::Running.is_terminal());
        assert!(!WorkerStatus::Unresponsive.is_terminal());
    }
}
