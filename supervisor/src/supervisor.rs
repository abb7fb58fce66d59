//! Worker lifecycle supervision
//!
//! [`WorkerSupervisor`] spawns interpreter worker processes, wires each one
//! up to the log manager, metrics sampler, and message broker, and drives the
//! lifecycle state machine. Status is computed on demand from the process
//! state, the spawn instant, and the last heartbeat; no background driver is
//! needed to advance it.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;

use crate::broker::{BrokerStats, MessageBroker};
use crate::channel::SocketChannel;
use crate::config::SupervisorConfig;
use crate::error::{
    CommunicationError, CreationError, CreationResult, TerminationError, TerminationResult,
};
use crate::logs::{LogManager, LogStream};
use crate::metrics::{MetricsSampler, SharedHeartbeat};
use crate::registry::WorkerRegistry;
use crate::traits::{LogSink, TracingLogSink};
use shared::{LogLevel, LogRecord, MetricsSnapshot, SystemMemoryInfo, WireMessage, WorkerId,
    WorkerStatus};

/// Per-worker state bundle. Owned exclusively by the registry.
pub struct WorkerRecord {
    #[allow(dead_code)]
    pub(crate) id: WorkerId,
    #[allow(dead_code)]
    pub(crate) script_path: PathBuf,
    pub(crate) child: Mutex<Child>,
    pub(crate) status: Mutex<WorkerStatus>,
    pub(crate) started_at: Instant,
    pub(crate) last_heartbeat: SharedHeartbeat,
    pub(crate) active: Arc<AtomicBool>,
}

pub struct WorkerSupervisor {
    config: SupervisorConfig,
    registry: WorkerRegistry,
    sampler: Arc<MetricsSampler>,
    logs: Arc<LogManager>,
    broker: Arc<MessageBroker>,
}

impl WorkerSupervisor {
    /// Builds a supervisor forwarding worker logs into `tracing`.
    ///
    /// Must be called from within a tokio runtime; the metrics sampler
    /// spawns its shared timer task immediately.
    pub fn new(config: SupervisorConfig) -> Self {
        Self::with_sink(config, Arc::new(TracingLogSink))
    }

    /// Builds a supervisor forwarding worker logs into a host-provided sink.
    pub fn with_sink(config: SupervisorConfig, sink: Arc<dyn LogSink>) -> Self {
        let sampler = Arc::new(MetricsSampler::new(config.sampler.clone()));
        let logs = Arc::new(LogManager::new(
            sink,
            config.log_queue_capacity,
            config.log_level,
        ));
        let broker = Arc::new(MessageBroker::new(config.broker.clone()));
        Self {
            config,
            registry: WorkerRegistry::new(),
            sampler,
            logs,
            broker,
        }
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    /// Spawns a worker running `script_path` and wires up log collection,
    /// metrics sampling, and the message channel.
    ///
    /// Fails fast on an unusable interpreter, a missing or unreadable
    /// bootstrap, or a missing target script; no partial record is left
    /// behind on failure.
    pub async fn create(
        &self,
        script_path: impl AsRef<Path>,
        args: &HashMap<String, String>,
    ) -> CreationResult<WorkerId> {
        let script_path = script_path.as_ref();
        tracing::info!("Creating worker for script: {}", script_path.display());

        self.probe_interpreter().await?;
        self.validate_bootstrap().await?;
        if !script_path.exists() {
            return Err(CreationError::TargetScript {
                path: script_path.to_path_buf(),
            });
        }

        // Bind the channel before spawning so the port can go on the argv.
        let channel = Arc::new(SocketChannel::server(self.config.channel.clone()));
        let port = channel.bind().await.map_err(communication_to_creation)?;

        let mut command = Command::new(&self.config.interpreter);
        command
            .arg(&self.config.bootstrap_path)
            .arg("--script")
            .arg(script_path);
        if !args.is_empty() {
            command.arg("--args").arg(build_args_json(args));
        }
        command
            .arg("--memory-limit-mb")
            .arg(self.config.memory_limit_mb.to_string())
            .arg("--cpu-limit-percent")
            .arg(format_percent(self.config.cpu_limit_percent))
            .arg("--log-level")
            .arg(self.config.log_level.as_str())
            .arg("--communication-port")
            .arg(port.to_string())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .stdin(Stdio::null());

        let mut child = command.spawn()?;
        let pid = child.id().ok_or_else(|| {
            CreationError::Spawn(std::io::Error::other(
                "worker exited before a pid was available",
            ))
        })?;
        let worker = WorkerId::new(pid);

        let stdout = child.stdout.take().ok_or_else(|| {
            CreationError::Spawn(std::io::Error::other("worker stdout was not captured"))
        })?;
        let stderr = child.stderr.take().ok_or_else(|| {
            CreationError::Spawn(std::io::Error::other("worker stderr was not captured"))
        })?;

        let last_heartbeat: SharedHeartbeat = Arc::new(Mutex::new(Utc::now()));
        let record = Arc::new(WorkerRecord {
            id: worker,
            script_path: script_path.to_path_buf(),
            child: Mutex::new(child),
            status: Mutex::new(WorkerStatus::Starting),
            started_at: Instant::now(),
            last_heartbeat: last_heartbeat.clone(),
            active: Arc::new(AtomicBool::new(true)),
        });

        self.registry.insert(worker, record.clone()).await;
        self.sampler
            .start_monitoring(worker, last_heartbeat.clone())
            .await;
        self.logs.start_collection(worker, stdout, stderr).await;
        self.broker
            .establish_channel(worker, channel, last_heartbeat)
            .await;

        // A worker already dead at wire-up is marked failed; only the later
        // status() polling path differentiates by exit code.
        if let Ok(Some(_)) = record.child.lock().await.try_wait() {
            *record.status.lock().await = WorkerStatus::Failed;
            tracing::error!(
                "Worker process died during wire-up for script: {}",
                script_path.display()
            );
        }

        tracing::info!("Worker created with PID {}", pid);
        Ok(worker)
    }

    /// Computes the worker's status on demand from the state machine rules.
    pub async fn status(&self, worker: WorkerId) -> WorkerStatus {
        let Some(record) = self.registry.get(worker).await else {
            return WorkerStatus::Terminated;
        };

        // A busy child lock means termination is in progress; leave the
        // stored status untouched rather than waiting on it.
        let exit_probe = record
            .child
            .try_lock()
            .map(|mut child| child.try_wait())
            .ok();

        let mut status = record.status.lock().await;
        if status.is_terminal() {
            return *status;
        }

        match exit_probe {
            None => {}
            Some(Err(_)) => {
                // Process reported gone but its exit status is unreadable.
                *status = WorkerStatus::Unresponsive;
            }
            Some(Ok(Some(exit))) => {
                *status = if exit.success() {
                    WorkerStatus::Completed
                } else {
                    WorkerStatus::Failed
                };
            }
            Some(Ok(None)) => {
                let heartbeat_age = Utc::now()
                    .signed_duration_since(*record.last_heartbeat.lock().await)
                    .to_std()
                    .unwrap_or(Duration::ZERO);
                if heartbeat_age > self.config.heartbeat_timeout {
                    *status = WorkerStatus::Unresponsive;
                } else if *status == WorkerStatus::Unresponsive {
                    // A fresh heartbeat resurrects an unresponsive worker.
                    *status = WorkerStatus::Running;
                } else if *status == WorkerStatus::Starting
                    && record.started_at.elapsed() > self.config.startup_grace
                {
                    *status = WorkerStatus::Running;
                }
            }
        }

        *status
    }

    pub async fn is_alive(&self, worker: WorkerId) -> bool {
        let Some(record) = self.registry.get(worker).await else {
            return false;
        };
        let alive = match record.child.try_lock() {
            Ok(mut child) => matches!(child.try_wait(), Ok(None)),
            // Termination holds the lock while waiting on the process.
            Err(_) => true,
        };
        alive
    }

    /// Requests graceful termination, escalating to forceful after `timeout`
    /// and waiting a fixed grace period after that. Unknown handles are a
    /// no-op.
    pub async fn terminate(&self, worker: WorkerId, timeout: Duration) -> TerminationResult<()> {
        let Some(record) = self.registry.get(worker).await else {
            tracing::warn!("Attempted to terminate unknown worker: {}", worker);
            return Ok(());
        };

        tracing::info!("Terminating worker {}", worker);
        {
            let mut child = record.child.lock().await;
            let running = child.try_wait().map_err(|e| TerminationError::Wait {
                pid: worker.pid(),
                message: e.to_string(),
            })?;

            if running.is_none() {
                signal_terminate(&mut child, worker.pid())?;

                let waited = tokio::time::timeout(timeout, child.wait()).await;
                match waited {
                    Ok(Ok(_)) => {}
                    Ok(Err(e)) => {
                        return Err(TerminationError::Wait {
                            pid: worker.pid(),
                            message: e.to_string(),
                        });
                    }
                    Err(_) => {
                        tracing::warn!(
                            "Graceful termination failed, forcing termination of worker {}",
                            worker
                        );
                        signal_kill(&mut child, worker.pid())?;
                        match tokio::time::timeout(self.config.terminate_grace, child.wait()).await
                        {
                            Ok(Ok(_)) => {}
                            Ok(Err(e)) => {
                                return Err(TerminationError::Wait {
                                    pid: worker.pid(),
                                    message: e.to_string(),
                                });
                            }
                            Err(_) => {
                                tracing::warn!(
                                    "Worker {} still running after forceful termination",
                                    worker
                                );
                            }
                        }
                    }
                }
            }
        }

        record.active.store(false, Ordering::SeqCst);
        self.sampler.stop_monitoring(worker).await;
        self.logs.stop_collection(worker).await;
        self.broker.close_channel(worker).await;
        *record.status.lock().await = WorkerStatus::Terminated;

        tracing::info!("Worker terminated: {}", worker);
        Ok(())
    }

    /// Fresh metrics snapshot; `None` for an unknown worker. Falls back to a
    /// basic snapshot when the sampler no longer tracks the worker.
    pub async fn metrics(&self, worker: WorkerId) -> Option<MetricsSnapshot> {
        let record = self.registry.get(worker).await?;
        match self.sampler.get_metrics(worker).await {
            Ok(snapshot) => Some(snapshot),
            Err(_) => Some(MetricsSnapshot {
                cpu_time_ms: 0,
                memory_bytes: 0,
                peak_memory_bytes: 0,
                execution_time: record.started_at.elapsed(),
                last_heartbeat: *record.last_heartbeat.lock().await,
            }),
        }
    }

    /// Marks the worker as heard-from now. The heartbeat slot is shared with
    /// the sampler and broker, so every view updates at once.
    pub async fn update_heartbeat(&self, worker: WorkerId) {
        if let Some(record) = self.registry.get(worker).await {
            *record.last_heartbeat.lock().await = Utc::now();
        }
    }

    /// Queues a payload for delivery to the worker as a `data` message.
    pub async fn send<T: Serialize>(
        &self,
        worker: WorkerId,
        payload: &T,
    ) -> Result<(), CommunicationError> {
        let value = serde_json::to_value(payload)?;
        self.broker.send_message(worker, value).await
    }

    /// Blocks for the next non-heartbeat message, up to the configured
    /// receive timeout, and returns its payload.
    pub async fn receive(&self, worker: WorkerId) -> Result<Value, CommunicationError> {
        let message: WireMessage = self.broker.receive_message(worker).await?;
        Ok(message.payload)
    }

    /// Like [`receive`](Self::receive) but coerces the payload into the
    /// caller's shape; coercion failures surface as serialization errors.
    pub async fn receive_as<T: DeserializeOwned>(
        &self,
        worker: WorkerId,
    ) -> Result<T, CommunicationError> {
        let payload = self.receive(worker).await?;
        Ok(serde_json::from_value(payload)?)
    }

    /// Snapshot of the collected log records, oldest first.
    pub async fn logs(&self, worker: WorkerId) -> Vec<LogRecord> {
        self.logs.all_records(worker).await
    }

    /// Draining stream over the worker's log queue.
    pub async fn log_stream(&self, worker: WorkerId) -> Option<LogStream> {
        self.logs.stream(worker).await
    }

    /// Adjusts the worker's log level filter.
    pub async fn set_log_level(&self, worker: WorkerId, level: LogLevel) {
        self.logs.set_level(worker, level).await;
    }

    /// Communication queue and heartbeat statistics; `None` when unknown.
    pub async fn communication_stats(&self, worker: WorkerId) -> Option<BrokerStats> {
        self.broker.get_stats(worker).await
    }

    pub async fn worker_count(&self) -> usize {
        self.registry.len().await
    }

    /// Removes records whose process is dead and whose status is terminal,
    /// and stops their sampler entries.
    pub async fn cleanup_terminated(&self) {
        for worker in self.registry.ids().await {
            let status = self.status(worker).await;
            if status.is_terminal() && !self.is_alive(worker).await {
                tracing::debug!("Cleaning up terminated worker: {}", worker);
                self.registry.remove(worker).await;
                self.sampler.stop_monitoring(worker).await;
            }
        }
    }

    /// Best-effort system CPU load percentage; `-1.0` when unavailable.
    pub async fn system_cpu_usage(&self) -> f64 {
        self.sampler.system_cpu_usage().await
    }

    /// Best-effort system memory information.
    pub async fn system_memory(&self) -> SystemMemoryInfo {
        self.sampler.system_memory().await
    }

    /// Terminates every live worker, then shuts down the sampler, log
    /// manager, and broker. Repeated shutdown is a no-op.
    pub async fn shutdown(&self) {
        for worker in self.registry.ids().await {
            if self.is_alive(worker).await {
                if let Err(e) = self.terminate(worker, Duration::from_secs(5)).await {
                    tracing::warn!(
                        "Failed to terminate worker {} during shutdown: {}",
                        worker,
                        e
                    );
                }
            }
        }

        self.sampler.shutdown().await;
        self.logs.shutdown().await;
        self.broker.shutdown().await;
        self.registry.clear().await;

        tracing::info!("Worker supervisor shut down");
    }

    async fn probe_interpreter(&self) -> CreationResult<()> {
        let status = Command::new(&self.config.interpreter)
            .arg("--version")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .stdin(Stdio::null())
            .status()
            .await
            .map_err(|e| CreationError::InterpreterUnavailable {
                interpreter: self.config.interpreter.clone(),
                message: e.to_string(),
            })?;

        if !status.success() {
            return Err(CreationError::ProbeFailed {
                interpreter: self.config.interpreter.clone(),
                code: status.code().unwrap_or(-1),
            });
        }
        tracing::debug!("Interpreter validated: {}", self.config.interpreter);
        Ok(())
    }

    async fn validate_bootstrap(&self) -> CreationResult<()> {
        tokio::fs::File::open(&self.config.bootstrap_path)
            .await
            .map_err(|_| CreationError::BootstrapScript {
                path: self.config.bootstrap_path.clone(),
            })?;
        Ok(())
    }
}

/// Builds the `--args` JSON object by explicit escaping, with stable key
/// order.
fn build_args_json(args: &HashMap<String, String>) -> String {
    let mut entries: Vec<(&String, &String)> = args.iter().collect();
    entries.sort();

    let mut json = String::from("{");
    for (i, (key, value)) in entries.iter().enumerate() {
        if i > 0 {
            json.push(',');
        }
        json.push('"');
        json.push_str(&escape_json(key));
        json.push_str("\":\"");
        json.push_str(&escape_json(value));
        json.push('"');
    }
    json.push('}');
    json
}

fn escape_json(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('\n', "\\n")
        .replace('\r', "\\r")
        .replace('\t', "\\t")
}

/// Renders the CPU limit with at least one decimal place, e.g. `80.0`.
fn format_percent(value: f64) -> String {
    if value.fract() == 0.0 {
        format!("{:.1}", value)
    } else {
        value.to_string()
    }
}

fn communication_to_creation(err: CommunicationError) -> CreationError {
    match err {
        CommunicationError::Io(io) => CreationError::Spawn(io),
        other => CreationError::Spawn(std::io::Error::other(other.to_string())),
    }
}

#[cfg(unix)]
fn signal_terminate(_child: &mut Child, pid: u32) -> TerminationResult<()> {
    use nix::sys::signal::{self, Signal};
    use nix::unistd::Pid;

    match signal::kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
        Ok(()) | Err(nix::errno::Errno::ESRCH) => Ok(()),
        Err(e) => Err(TerminationError::Signal {
            pid,
            message: e.to_string(),
        }),
    }
}

#[cfg(not(unix))]
fn signal_terminate(child: &mut Child, pid: u32) -> TerminationResult<()> {
    // No SIGTERM equivalent; forceful kill is the only signal available.
    child.start_kill().map_err(|e| TerminationError::Signal {
        pid,
        message: e.to_string(),
    })
}

#[cfg(unix)]
fn signal_kill(_child: &mut Child, pid: u32) -> TerminationResult<()> {
    use nix::sys::signal::{self, Signal};
    use nix::unistd::Pid;

    match signal::kill(Pid::from_raw(pid as i32), Signal::SIGKILL) {
        Ok(()) | Err(nix::errno::Errno::ESRCH) => Ok(()),
        Err(e) => Err(TerminationError::Signal {
            pid,
            message: e.to_string(),
        }),
    }
}

#[cfg(not(unix))]
fn signal_kill(child: &mut Child, pid: u32) -> TerminationResult<()> {
    child.start_kill().map_err(|e| TerminationError::Signal {
        pid,
        message: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_args_json_escaping() {
        let mut args = HashMap::new();
        args.insert("path".to_string(), "C:\\temp".to_string());
        args.insert("quote".to_string(), "say \"hi\"".to_string());
        args.insert("lines".to_string(), "a\nb\r\tc".to_string());

        let json = build_args_json(&args);
        assert_eq!(
            json,
            r#"{"lines":"a\nb\r\tc","path":"C:\\temp","quote":"say \"hi\""}"#
        );
        // The product of explicit escaping is real JSON.
        let parsed: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed["path"], "C:\\temp");
        assert_eq!(parsed["quote"], "say \"hi\"");
        assert_eq!(parsed["lines"], "a\nb\r\tc");
    }

    #[test]
    fn test_args_json_empty_map() {
        assert_eq!(build_args_json(&HashMap::new()), "{}");
    }

    #[test]
    fn test_percent_formatting() {
        assert_eq!(format_percent(80.0), "80.0");
        assert_eq!(format_percent(62.5), "62.5");
    }

    #[tokio::test]
    async fn test_create_fails_for_missing_interpreter() {
        let config = SupervisorConfig::new("/nonexistent/interpreter-xyz", "/tmp/whatever.py");
        let supervisor = WorkerSupervisor::new(config);

        let err = supervisor
            .create("/tmp/script.py", &HashMap::new())
            .await
            .unwrap_err();
        assert!(matches!(err, CreationError::InterpreterUnavailable { .. }));

        supervisor.shutdown().await;
    }

    #[tokio::test]
    async fn test_create_fails_for_missing_bootstrap() {
        // `true` ignores --version and exits zero, so the probe passes.
        let config = SupervisorConfig::new("true", "/nonexistent/bootstrap-xyz.sh");
        let supervisor = WorkerSupervisor::new(config);

        let err = supervisor
            .create("/tmp/script.py", &HashMap::new())
            .await
            .unwrap_err();
        assert!(matches!(err, CreationError::BootstrapScript { .. }));

        supervisor.shutdown().await;
    }

    #[tokio::test]
    async fn test_create_fails_for_missing_target_script() {
        let bootstrap = tempfile::NamedTempFile::new().unwrap();
        let config = SupervisorConfig::new("true", bootstrap.path());
        let supervisor = WorkerSupervisor::new(config);

        let err = supervisor
            .create("/nonexistent/target-xyz.py", &HashMap::new())
            .await
            .unwrap_err();
        assert!(matches!(err, CreationError::TargetScript { .. }));
        assert_eq!(supervisor.worker_count().await, 0);

        supervisor.shutdown().await;
    }

    #[tokio::test]
    async fn test_unknown_worker_operations() {
        let config = SupervisorConfig::new("true", "/tmp/bootstrap.py");
        let supervisor = WorkerSupervisor::new(config);
        let unknown = WorkerId::new(424242);

        assert_eq!(supervisor.status(unknown).await, WorkerStatus::Terminated);
        assert!(!supervisor.is_alive(unknown).await);
        assert!(supervisor.metrics(unknown).await.is_none());
        assert!(supervisor.logs(unknown).await.is_empty());
        assert!(supervisor.communication_stats(unknown).await.is_none());
        // Termination of an unknown handle is a no-op, not an error.
        supervisor
            .terminate(unknown, Duration::from_millis(100))
            .await
            .unwrap();

        let err = supervisor.send(unknown, &serde_json::json!(1)).await;
        assert!(matches!(
            err,
            Err(CommunicationError::UnknownWorker { .. })
        ));

        supervisor.shutdown().await;
    }
}
