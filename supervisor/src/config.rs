//! Runtime configuration for the supervisor and its subsystems

use std::path::PathBuf;
use std::time::Duration;

use shared::LogLevel;

/// Configuration for spawning and supervising workers.
#[derive(Clone, Debug)]
pub struct SupervisorConfig {
    /// Interpreter executable launched for every worker.
    pub interpreter: String,
    /// Bootstrap program handed to the interpreter; it loads the user script.
    pub bootstrap_path: PathBuf,
    /// Memory limit passed to the bootstrap, in MiB.
    pub memory_limit_mb: u32,
    /// CPU limit passed to the bootstrap, in percent.
    pub cpu_limit_percent: f64,
    /// Log level passed to the bootstrap and used as the initial filter.
    pub log_level: LogLevel,
    /// Time a worker may stay in `Starting` before it is considered running.
    pub startup_grace: Duration,
    /// Missing heartbeats for longer than this mark a live worker unresponsive.
    pub heartbeat_timeout: Duration,
    /// Wait after forceful termination before giving up.
    pub terminate_grace: Duration,
    /// Capacity of the per-worker log queue.
    pub log_queue_capacity: usize,
    pub broker: BrokerConfig,
    pub sampler: SamplerConfig,
    pub channel: ChannelConfig,
}

impl SupervisorConfig {
    pub fn new(interpreter: impl Into<String>, bootstrap_path: impl Into<PathBuf>) -> Self {
        Self {
            interpreter: interpreter.into(),
            bootstrap_path: bootstrap_path.into(),
            ..Self::default()
        }
    }
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            interpreter: "python3".to_string(),
            bootstrap_path: PathBuf::from("bootstrap.py"),
            memory_limit_mb: 512,
            cpu_limit_percent: 80.0,
            log_level: LogLevel::Info,
            startup_grace: Duration::from_secs(5),
            heartbeat_timeout: Duration::from_secs(60),
            terminate_grace: Duration::from_secs(5),
            log_queue_capacity: 1000,
            broker: BrokerConfig::default(),
            sampler: SamplerConfig::default(),
            channel: ChannelConfig::default(),
        }
    }
}

/// Configuration for the per-worker message broker.
#[derive(Clone, Debug)]
pub struct BrokerConfig {
    /// Capacity of the outbound and inbound message queues.
    pub queue_capacity: usize,
    /// Blocking receive timeout for callers.
    pub receive_timeout: Duration,
    /// First retry delay for failed sends.
    pub initial_retry_delay: Duration,
    /// Multiplier applied to the retry delay on each attempt.
    pub retry_backoff_multiplier: f64,
    /// Retries after the initial attempt before a message is dropped.
    pub max_retry_attempts: u32,
    /// Interval between protocol heartbeats sent to the worker.
    pub heartbeat_interval: Duration,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 1000,
            receive_timeout: Duration::from_secs(30),
            initial_retry_delay: Duration::from_millis(500),
            retry_backoff_multiplier: 2.0,
            max_retry_attempts: 3,
            heartbeat_interval: Duration::from_secs(10),
        }
    }
}

/// Configuration for the metrics sampler.
#[derive(Clone, Debug)]
pub struct SamplerConfig {
    /// Delay before the first sample of a freshly registered worker.
    pub initial_delay: Duration,
    /// Interval between samples.
    pub sample_period: Duration,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            sample_period: Duration::from_secs(5),
        }
    }
}

/// Configuration for byte channels.
#[derive(Clone, Debug)]
pub struct ChannelConfig {
    /// How long the server side waits for the worker to connect.
    pub connect_timeout: Duration,
    /// Largest accepted frame payload, in bytes.
    pub max_frame_len: usize,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(30),
            max_frame_len: 1024 * 1024,
        }
    }
}
