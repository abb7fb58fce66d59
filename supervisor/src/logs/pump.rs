//! Per-stream log pump task
//!
//! One task per worker stream reads lines until end-of-stream or until
//! collection is stopped, classifies each line, filters it against the
//! worker's level threshold, and fans accepted records out to the bounded
//! queue and the host sink.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::RwLock;

use crate::logs::parser;
use crate::queue::BoundedQueue;
use crate::traits::LogSink;
use shared::{LogLevel, LogRecord, LogSource, WorkerId};

pub(crate) async fn pump_stream<R>(
    worker: WorkerId,
    source: LogSource,
    stream: R,
    queue: Arc<BoundedQueue<LogRecord>>,
    level_filter: Arc<RwLock<LogLevel>>,
    collecting: Arc<AtomicBool>,
    sink: Arc<dyn LogSink>,
) where
    R: AsyncRead + Unpin + Send + 'static,
{
    let mut lines = BufReader::new(stream).lines();

    loop {
        if !collecting.load(Ordering::Relaxed) {
            break;
        }

        match lines.next_line().await {
            Ok(Some(line)) => {
                let record = parser::parse_line(&line, source);

                if record.level < *level_filter.read().await {
                    continue;
                }

                if queue.offer(record.clone()).await.is_some() {
                    tracing::warn!(
                        "Log queue full for worker {}, dropping oldest entry",
                        worker
                    );
                }

                let logger = format!("worker_log.{}", source);
                if let Err(e) = sink.forward(&logger, &record).await {
                    tracing::warn!("Log sink failed for worker {}: {}", worker, e);
                }
            }
            Ok(None) => break,
            Err(e) => {
                if collecting.load(Ordering::Relaxed) {
                    tracing::debug!("Error reading {} from worker {}: {}", source, worker, e);
                }
                break;
            }
        }
    }

    tracing::debug!("Log pump for worker {} {} finished", worker, source);
}
