//! Test helpers

use std::path::Path;
use std::time::Duration;

use supervisor::{SupervisorConfig, WorkerSupervisor};
use shared::{WorkerId, WorkerStatus};

/// Supervisor configuration pointing at `bash` with short windows, so
/// time-based transitions can be observed without multi-second sleeps.
pub fn test_config(bootstrap: &Path) -> SupervisorConfig {
    let mut config = SupervisorConfig::new("bash", bootstrap);
    config.startup_grace = Duration::from_millis(100);
    config.heartbeat_timeout = Duration::from_secs(60);
    config.channel.connect_timeout = Duration::from_millis(300);
    config.broker.receive_timeout = Duration::from_millis(300);
    config.sampler.initial_delay = Duration::from_millis(50);
    config.sampler.sample_period = Duration::from_millis(200);
    config
}

/// Polls until the predicate holds or the timeout elapses.
pub async fn wait_for<F, Fut>(timeout: Duration, mut predicate: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if predicate().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    false
}

/// Polls `status` until it matches `expected` or the timeout elapses,
/// returning the last observed status.
pub async fn wait_for_status(
    supervisor: &WorkerSupervisor,
    worker: WorkerId,
    expected: WorkerStatus,
    timeout: Duration,
) -> WorkerStatus {
    let deadline = tokio::time::Instant::now() + timeout;
    let mut last = supervisor.status(worker).await;
    while last != expected && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(25)).await;
        last = supervisor.status(worker).await;
    }
    last
}
