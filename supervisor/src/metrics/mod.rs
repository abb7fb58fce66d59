//! Periodic resource-usage sampling for supervised workers
//!
//! A single shared timer task samples every registered, live worker at a
//! fixed period. CPU time comes from the platform process table; resident
//! memory is read by invoking the platform helper (`ps` on POSIX, `tasklist`
//! on Windows) and parsing its output, so the numbers match what an operator
//! would see. Sampling failures leave prior values intact.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use sysinfo::{Pid, ProcessesToUpdate, System};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::config::SamplerConfig;
use crate::error::SamplingError;
use shared::{MetricsSnapshot, SystemMemoryInfo, WorkerId};

pub(crate) type SharedHeartbeat = Arc<Mutex<DateTime<Utc>>>;

struct SamplerEntry {
    started_at: Instant,
    cpu_time_ms: u64,
    memory_bytes: u64,
    peak_memory_bytes: u64,
    #[allow(dead_code)]
    last_sample: Instant,
    last_heartbeat: SharedHeartbeat,
}

pub struct MetricsSampler {
    entries: Arc<Mutex<HashMap<WorkerId, Arc<Mutex<SamplerEntry>>>>>,
    system: Arc<Mutex<System>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl MetricsSampler {
    pub fn new(config: SamplerConfig) -> Self {
        let entries: Arc<Mutex<HashMap<WorkerId, Arc<Mutex<SamplerEntry>>>>> =
            Arc::new(Mutex::new(HashMap::new()));
        let system = Arc::new(Mutex::new(System::new()));

        let task = {
            let entries = entries.clone();
            let system = system.clone();
            tokio::spawn(async move {
                let first = tokio::time::Instant::now() + config.initial_delay;
                let mut ticker = tokio::time::interval_at(first, config.sample_period);
                loop {
                    ticker.tick().await;
                    let snapshot: Vec<(WorkerId, Arc<Mutex<SamplerEntry>>)> = entries
                        .lock()
                        .await
                        .iter()
                        .map(|(worker, entry)| (*worker, entry.clone()))
                        .collect();
                    for (worker, entry) in snapshot {
                        sample_worker(&system, worker, &entry).await;
                    }
                }
            })
        };

        Self {
            entries,
            system,
            task: Mutex::new(Some(task)),
        }
    }

    /// Registers a worker for sampling. The heartbeat slot is shared with
    /// the supervisor record so one write updates every view.
    pub async fn start_monitoring(&self, worker: WorkerId, last_heartbeat: SharedHeartbeat) {
        let entry = Arc::new(Mutex::new(SamplerEntry {
            started_at: Instant::now(),
            cpu_time_ms: 0,
            memory_bytes: 0,
            peak_memory_bytes: 0,
            last_sample: Instant::now(),
            last_heartbeat,
        }));
        self.entries.lock().await.insert(worker, entry);
        tracing::debug!("Started monitoring worker {}", worker);
    }

    pub async fn stop_monitoring(&self, worker: WorkerId) {
        self.entries.lock().await.remove(&worker);
        tracing::debug!("Stopped monitoring worker {}", worker);
    }

    /// Performs a fresh sample and returns the snapshot.
    pub async fn get_metrics(&self, worker: WorkerId) -> Result<MetricsSnapshot, SamplingError> {
        let entry = self
            .entries
            .lock()
            .await
            .get(&worker)
            .cloned()
            .ok_or(SamplingError::NotMonitored { id: worker })?;

        sample_worker(&self.system, worker, &entry).await;

        let guard = entry.lock().await;
        let last_heartbeat = *guard.last_heartbeat.lock().await;
        Ok(MetricsSnapshot {
            cpu_time_ms: guard.cpu_time_ms,
            memory_bytes: guard.memory_bytes,
            peak_memory_bytes: guard.peak_memory_bytes,
            execution_time: guard.started_at.elapsed(),
            last_heartbeat,
        })
    }

    /// Marks the worker as heard-from now.
    pub async fn update_heartbeat(&self, worker: WorkerId) {
        if let Some(entry) = self.entries.lock().await.get(&worker) {
            *entry.lock().await.last_heartbeat.lock().await = Utc::now();
        }
    }

    pub async fn monitored_count(&self) -> usize {
        self.entries.lock().await.len()
    }

    /// Best-effort system CPU load percentage; `-1.0` when unavailable.
    pub async fn system_cpu_usage(&self) -> f64 {
        let mut system = self.system.lock().await;
        system.refresh_cpu_usage();
        let usage = system.global_cpu_usage() as f64;
        if usage.is_nan() {
            -1.0
        } else {
            usage
        }
    }

    /// Best-effort system memory read-out; zeros when unavailable.
    pub async fn system_memory(&self) -> SystemMemoryInfo {
        let mut system = self.system.lock().await;
        system.refresh_memory();
        SystemMemoryInfo {
            total_physical: system.total_memory(),
            free_physical: system.free_memory(),
            total_swap: system.total_swap(),
            free_swap: system.free_swap(),
        }
    }

    /// Stops the timer task and drops all entries. Safe to call repeatedly.
    pub async fn shutdown(&self) {
        if let Some(task) = self.task.lock().await.take() {
            task.abort();
        }
        self.entries.lock().await.clear();
        tracing::info!("Metrics sampler shut down");
    }
}

/// Samples one worker. A dead process is a no-op; partial failures keep the
/// previous values.
async fn sample_worker(
    system: &Arc<Mutex<System>>,
    worker: WorkerId,
    entry: &Arc<Mutex<SamplerEntry>>,
) {
    let pid = Pid::from_u32(worker.pid());
    let cpu_time_ms = {
        let mut system = system.lock().await;
        system.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
        system
            .process(pid)
            .map(|process| process.accumulated_cpu_time())
    };

    let Some(cpu_time_ms) = cpu_time_ms else {
        return;
    };

    let memory = read_resident_memory(worker.pid()).await;

    let mut guard = entry.lock().await;
    guard.cpu_time_ms = cpu_time_ms;
    match memory {
        Ok(bytes) if bytes > 0 => {
            guard.memory_bytes = bytes;
            if bytes > guard.peak_memory_bytes {
                guard.peak_memory_bytes = bytes;
            }
        }
        Ok(_) => {}
        Err(e) => {
            tracing::debug!("Could not collect memory usage for worker {}: {}", worker, e);
        }
    }
    guard.last_sample = Instant::now();
}

/// Resident set size in bytes via `ps -o rss= -p <pid>` (reported in KiB).
#[cfg(unix)]
async fn read_resident_memory(pid: u32) -> Result<u64, SamplingError> {
    let output = tokio::process::Command::new("ps")
        .args(["-o", "rss=", "-p", &pid.to_string()])
        .output()
        .await
        .map_err(|e| SamplingError::MemoryProbe {
            message: format!("ps failed to launch: {}", e),
        })?;

    if !output.status.success() {
        return Err(SamplingError::MemoryProbe {
            message: format!("ps exited with {}", output.status),
        });
    }

    let text = String::from_utf8_lossy(&output.stdout);
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Ok(0);
    }
    let kib: u64 = trimmed.parse().map_err(|e| SamplingError::MemoryProbe {
        message: format!("unparseable ps output '{}': {}", trimmed, e),
    })?;
    Ok(kib * 1024)
}

/// Resident set size via `tasklist /fi "PID eq <pid>" /fo csv` (KiB in the
/// fifth CSV field).
#[cfg(windows)]
async fn read_resident_memory(pid: u32) -> Result<u64, SamplingError> {
    let output = tokio::process::Command::new("tasklist")
        .args(["/fi", &format!("PID eq {}", pid), "/fo", "csv"])
        .output()
        .await
        .map_err(|e| SamplingError::MemoryProbe {
            message: format!("tasklist failed to launch: {}", e),
        })?;

    if !output.status.success() {
        return Err(SamplingError::MemoryProbe {
            message: format!("tasklist exited with {}", output.status),
        });
    }

    let text = String::from_utf8_lossy(&output.stdout);
    for line in text.lines() {
        if !line.contains(&pid.to_string()) {
            continue;
        }
        let fields: Vec<&str> = line.split(',').collect();
        if fields.len() >= 5 {
            let mem: String = fields[4]
                .chars()
                .filter(|c| c.is_ascii_digit())
                .collect();
            if !mem.is_empty() {
                let kib: u64 = mem.parse().map_err(|e| SamplingError::MemoryProbe {
                    message: format!("unparseable tasklist output: {}", e),
                })?;
                return Ok(kib * 1024);
            }
        }
    }
    Ok(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn fast_config() -> SamplerConfig {
        SamplerConfig {
            initial_delay: Duration::from_millis(10),
            sample_period: Duration::from_millis(50),
        }
    }

    fn heartbeat_now() -> SharedHeartbeat {
        Arc::new(Mutex::new(Utc::now()))
    }

    #[tokio::test]
    async fn test_metrics_for_live_process() {
        let sampler = MetricsSampler::new(fast_config());
        // Sample the test process itself; it certainly exists.
        let worker = WorkerId::new(std::process::id());
        sampler.start_monitoring(worker, heartbeat_now()).await;

        let snapshot = sampler.get_metrics(worker).await.unwrap();
        assert!(snapshot.peak_memory_bytes >= snapshot.memory_bytes);
        assert!(snapshot.last_heartbeat <= Utc::now());

        let later = sampler.get_metrics(worker).await.unwrap();
        assert!(later.execution_time >= snapshot.execution_time);

        sampler.shutdown().await;
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_resident_memory_probe_for_own_pid() {
        let bytes = read_resident_memory(std::process::id()).await.unwrap();
        assert!(bytes > 0);
    }

    #[tokio::test]
    async fn test_sampling_dead_process_is_noop() {
        let sampler = MetricsSampler::new(fast_config());

        // Spawn a short-lived child and wait for it so the pid is dead.
        let mut child = tokio::process::Command::new("sh")
            .args(["-c", "exit 0"])
            .spawn()
            .unwrap();
        let pid = child.id().unwrap();
        child.wait().await.unwrap();

        let worker = WorkerId::new(pid);
        sampler.start_monitoring(worker, heartbeat_now()).await;

        let snapshot = sampler.get_metrics(worker).await.unwrap();
        assert_eq!(snapshot.cpu_time_ms, 0);
        assert_eq!(snapshot.memory_bytes, 0);

        sampler.shutdown().await;
    }

    #[tokio::test]
    async fn test_update_heartbeat_moves_forward() {
        let sampler = MetricsSampler::new(fast_config());
        let worker = WorkerId::new(std::process::id());
        let heartbeat = heartbeat_now();
        let before = *heartbeat.lock().await;
        sampler.start_monitoring(worker, heartbeat.clone()).await;

        tokio::time::sleep(Duration::from_millis(5)).await;
        sampler.update_heartbeat(worker).await;
        assert!(*heartbeat.lock().await > before);

        sampler.shutdown().await;
    }

    #[tokio::test]
    async fn test_stop_monitoring_removes_entry() {
        let sampler = MetricsSampler::new(fast_config());
        let worker = WorkerId::new(std::process::id());
        sampler.start_monitoring(worker, heartbeat_now()).await;
        assert_eq!(sampler.monitored_count().await, 1);

        sampler.stop_monitoring(worker).await;
        assert_eq!(sampler.monitored_count().await, 0);
        assert!(matches!(
            sampler.get_metrics(worker).await,
            Err(SamplingError::NotMonitored { .. })
        ));

        sampler.shutdown().await;
    }

    #[tokio::test]
    async fn test_system_readouts_are_best_effort() {
        let sampler = MetricsSampler::new(fast_config());

        let memory = sampler.system_memory().await;
        assert!(memory.total_physical >= memory.free_physical || memory.total_physical == 0);

        let cpu = sampler.system_cpu_usage().await;
        assert!(cpu >= -1.0);

        sampler.shutdown().await;
    }
}
