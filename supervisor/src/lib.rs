//! Supervisor runtime for external interpreter worker processes
//!
//! This crate launches interpreter subprocesses ("workers"), streams their
//! stdout/stderr into a structured log pipeline, samples their resource
//! usage, and exchanges length-framed JSON messages with them over a
//! loopback byte channel. It is designed for embedding a scripting runtime
//! inside a larger host application that needs partial-failure isolation:
//! a misbehaving worker must not destabilize the host, and every worker is
//! observable, interruptible, and terminable on demand.
//!
//! The host constructs a [`WorkerSupervisor`], creates workers from script
//! paths, and must call [`WorkerSupervisor::shutdown`] before exit.

pub mod broker;
pub mod channel;
pub mod config;
pub mod error;
pub mod logs;
pub mod metrics;
pub mod queue;
pub mod registry;
pub mod supervisor;
pub mod traits;

pub use broker::{BrokerStats, MessageBroker};
pub use config::{BrokerConfig, ChannelConfig, SamplerConfig, SupervisorConfig};
pub use error::{
    CommunicationError, CreationError, LogCollectionError, SamplingError, TerminationError,
};
pub use logs::{LogManager, LogStream};
pub use metrics::MetricsSampler;
pub use supervisor::WorkerSupervisor;
pub use traits::{LogSink, TracingLogSink};
