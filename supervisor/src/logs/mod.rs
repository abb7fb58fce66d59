//! Log collection from worker stdout/stderr
//!
//! The [`LogManager`] owns one collection context per worker: a bounded
//! record queue, a level filter, and the two pump tasks. Pumps survive worker
//! exit until end-of-stream so trailing output is not lost; stopping
//! collection waits briefly for that drain before aborting.

pub mod parser;
mod pump;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncRead;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;

use crate::queue::BoundedQueue;
use crate::traits::LogSink;
use shared::{LogLevel, LogRecord, LogSource, WorkerId};

const DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

struct LogContext {
    queue: Arc<BoundedQueue<LogRecord>>,
    level_filter: Arc<RwLock<LogLevel>>,
    collecting: Arc<AtomicBool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Draining view over a worker's log queue.
pub struct LogStream {
    queue: Arc<BoundedQueue<LogRecord>>,
}

impl LogStream {
    /// Removes and returns the oldest record, waiting up to `timeout`.
    pub async fn next(&self, timeout: Duration) -> Option<LogRecord> {
        self.queue.poll(timeout).await
    }

    /// Removes and returns everything currently queued.
    pub async fn drain(&self) -> Vec<LogRecord> {
        self.queue.drain().await
    }
}

pub struct LogManager {
    contexts: Arc<Mutex<HashMap<WorkerId, Arc<LogContext>>>>,
    sink: Arc<dyn LogSink>,
    queue_capacity: usize,
    default_level: LogLevel,
}

impl LogManager {
    pub fn new(sink: Arc<dyn LogSink>, queue_capacity: usize, default_level: LogLevel) -> Self {
        Self {
            contexts: Arc::new(Mutex::new(HashMap::new())),
            sink,
            queue_capacity,
            default_level,
        }
    }

    /// Starts the two pump tasks for a worker's stdout and stderr.
    pub async fn start_collection<O, E>(&self, worker: WorkerId, stdout: O, stderr: E)
    where
        O: AsyncRead + Unpin + Send + 'static,
        E: AsyncRead + Unpin + Send + 'static,
    {
        let context = Arc::new(LogContext {
            queue: Arc::new(BoundedQueue::new(self.queue_capacity)),
            level_filter: Arc::new(RwLock::new(self.default_level)),
            collecting: Arc::new(AtomicBool::new(true)),
            tasks: Mutex::new(Vec::new()),
        });

        let stdout_task = tokio::spawn(pump::pump_stream(
            worker,
            LogSource::Stdout,
            stdout,
            context.queue.clone(),
            context.level_filter.clone(),
            context.collecting.clone(),
            self.sink.clone(),
        ));
        let stderr_task = tokio::spawn(pump::pump_stream(
            worker,
            LogSource::Stderr,
            stderr,
            context.queue.clone(),
            context.level_filter.clone(),
            context.collecting.clone(),
            self.sink.clone(),
        ));
        context.tasks.lock().await.push(stdout_task);
        context.tasks.lock().await.push(stderr_task);

        self.contexts.lock().await.insert(worker, context);
        tracing::info!("Started log collection for worker {}", worker);
    }

    /// Stops collection for a worker, letting the pumps drain to
    /// end-of-stream first and aborting them if they do not finish in time.
    pub async fn stop_collection(&self, worker: WorkerId) {
        let Some(context) = self.contexts.lock().await.remove(&worker) else {
            return;
        };

        let tasks: Vec<JoinHandle<()>> = context.tasks.lock().await.drain(..).collect();
        for task in tasks {
            let abort = task.abort_handle();
            if tokio::time::timeout(DRAIN_TIMEOUT, task).await.is_err() {
                // A pump still blocked on a live stream is cancelled outright.
                context.collecting.store(false, Ordering::Relaxed);
                abort.abort();
            }
        }
        context.collecting.store(false, Ordering::Relaxed);
        tracing::info!("Stopped log collection for worker {}", worker);
    }

    /// Snapshot of the currently queued records, oldest first.
    pub async fn all_records(&self, worker: WorkerId) -> Vec<LogRecord> {
        match self.contexts.lock().await.get(&worker) {
            Some(context) => context.queue.snapshot().await,
            None => Vec::new(),
        }
    }

    /// Draining stream over the worker's log queue.
    pub async fn stream(&self, worker: WorkerId) -> Option<LogStream> {
        self.contexts
            .lock()
            .await
            .get(&worker)
            .map(|context| LogStream {
                queue: context.queue.clone(),
            })
    }

    /// Adjusts the worker's level filter; records strictly below it drop.
    pub async fn set_level(&self, worker: WorkerId, level: LogLevel) {
        if let Some(context) = self.contexts.lock().await.get(&worker) {
            *context.level_filter.write().await = level;
            tracing::debug!("Updated log level to {} for worker {}", level, worker);
        }
    }

    pub async fn record_count(&self, worker: WorkerId) -> usize {
        match self.contexts.lock().await.get(&worker) {
            Some(context) => context.queue.len().await,
            None => 0,
        }
    }

    pub async fn monitored_count(&self) -> usize {
        self.contexts.lock().await.len()
    }

    /// Stops all collection. Safe to call more than once.
    pub async fn shutdown(&self) {
        let workers: Vec<WorkerId> = self.contexts.lock().await.keys().copied().collect();
        for worker in workers {
            self.stop_collection(worker).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::MockLogSink;

    fn manager() -> LogManager {
        let mut sink = MockLogSink::new();
        sink.expect_forward().returning(|_, _| Ok(()));
        LogManager::new(Arc::new(sink), 100, LogLevel::Info)
    }

    fn cursor(text: &str) -> std::io::Cursor<Vec<u8>> {
        std::io::Cursor::new(text.as_bytes().to_vec())
    }

    #[tokio::test]
    async fn test_collection_gathers_both_streams() {
        let manager = manager();
        let worker = WorkerId::new(11);

        manager
            .start_collection(worker, cursor("out line\n"), cursor("err line\n"))
            .await;
        manager.stop_collection(worker).await;

        // Context removed after stop.
        assert_eq!(manager.monitored_count().await, 0);
    }

    #[tokio::test]
    async fn test_records_readable_while_collecting() {
        let manager = manager();
        let worker = WorkerId::new(12);

        manager
            .start_collection(worker, cursor("hello\nworld\n"), cursor(""))
            .await;

        // Give the pumps a moment to drain the in-memory streams.
        tokio::time::sleep(Duration::from_millis(50)).await;

        let records = manager.all_records(worker).await;
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].message, "hello");
        assert_eq!(manager.record_count(worker).await, 2);
    }

    #[tokio::test]
    async fn test_stream_drains_queue() {
        let manager = manager();
        let worker = WorkerId::new(13);

        manager
            .start_collection(worker, cursor("a\nb\n"), cursor(""))
            .await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        let stream = manager.stream(worker).await.unwrap();
        let first = stream.next(Duration::from_millis(100)).await.unwrap();
        assert_eq!(first.message, "a");
        assert_eq!(stream.drain().await.len(), 1);
        assert_eq!(manager.record_count(worker).await, 0);
    }

    #[tokio::test]
    async fn test_unknown_worker_yields_empty_views() {
        let manager = manager();
        let unknown = WorkerId::new(99);

        assert!(manager.all_records(unknown).await.is_empty());
        assert!(manager.stream(unknown).await.is_none());
        assert_eq!(manager.record_count(unknown).await, 0);
        // And stopping it is a no-op.
        manager.stop_collection(unknown).await;
    }

    #[tokio::test]
    async fn test_set_level_filters_future_records() {
        let manager = manager();
        let worker = WorkerId::new(14);

        // Stream stays open long enough for the filter change to apply: use
        // a duplex pipe we can write to incrementally.
        let (mut tx, rx) = tokio::io::duplex(256);
        manager.start_collection(worker, rx, cursor("")).await;

        use tokio::io::AsyncWriteExt;
        tx.write_all(b"before\n").await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        manager.set_level(worker, LogLevel::Error).await;
        tx.write_all(b"after plain info\n").await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        drop(tx);

        let records = manager.all_records(worker).await;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].message, "before");
    }

    #[tokio::test]
    async fn test_shutdown_clears_all_contexts() {
        let manager = manager();
        manager
            .start_collection(WorkerId::new(15), cursor(""), cursor(""))
            .await;
        manager
            .start_collection(WorkerId::new(16), cursor(""), cursor(""))
            .await;

        manager.shutdown().await;
        assert_eq!(manager.monitored_count().await, 0);
        // Repeated shutdown is a no-op.
        manager.shutdown().await;
    }
}
