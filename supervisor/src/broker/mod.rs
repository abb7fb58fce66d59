//! Per-worker message broker
//!
//! Owns the bounded outbound/inbound queues and the three background tasks
//! per worker: a writer draining the outbound queue onto the channel with
//! retry, a reader dispatching inbound frames (heartbeats are siphoned off),
//! and a periodic heartbeat sender. The per-worker `active` flag is the
//! cancellation signal for all three.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::channel::MessageChannel;
use crate::config::BrokerConfig;
use crate::error::{CommunicationError, CommunicationResult};
use crate::metrics::SharedHeartbeat;
use crate::queue::BoundedQueue;
use shared::{WireMessage, WorkerId, DATA_MESSAGE_TYPE};

/// Point-in-time view of one worker's communication state.
#[derive(Clone, Debug)]
pub struct BrokerStats {
    pub outbound_size: usize,
    pub inbound_size: usize,
    pub last_heartbeat: DateTime<Utc>,
    pub active: bool,
}

struct BrokerContext {
    worker: WorkerId,
    channel: Arc<dyn MessageChannel>,
    outbound: Arc<BoundedQueue<WireMessage>>,
    inbound: Arc<BoundedQueue<WireMessage>>,
    active: Arc<AtomicBool>,
    channel_failed: Arc<AtomicBool>,
    message_counter: AtomicU64,
    last_heartbeat: SharedHeartbeat,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl BrokerContext {
    fn next_message_id(&self) -> String {
        let seq = self.message_counter.fetch_add(1, Ordering::SeqCst) + 1;
        format!("msg-{}-{}", self.worker.pid(), seq)
    }
}

pub struct MessageBroker {
    contexts: Arc<Mutex<HashMap<WorkerId, Arc<BrokerContext>>>>,
    config: BrokerConfig,
}

impl MessageBroker {
    pub fn new(config: BrokerConfig) -> Self {
        Self {
            contexts: Arc::new(Mutex::new(HashMap::new())),
            config,
        }
    }

    /// Registers a worker's channel and opens it in the background.
    ///
    /// The caller is not blocked on the worker connecting; the active flag is
    /// set, and the writer/reader/heartbeat tasks started, only after the
    /// open succeeds. If the open fails the context stays inactive and
    /// subsequent sends fail fast.
    pub async fn establish_channel(
        &self,
        worker: WorkerId,
        channel: Arc<dyn MessageChannel>,
        last_heartbeat: SharedHeartbeat,
    ) {
        let context = Arc::new(BrokerContext {
            worker,
            channel,
            outbound: Arc::new(BoundedQueue::new(self.config.queue_capacity)),
            inbound: Arc::new(BoundedQueue::new(self.config.queue_capacity)),
            active: Arc::new(AtomicBool::new(false)),
            channel_failed: Arc::new(AtomicBool::new(false)),
            message_counter: AtomicU64::new(0),
            last_heartbeat,
            tasks: Mutex::new(Vec::new()),
        });
        self.contexts.lock().await.insert(worker, context.clone());

        let config = self.config.clone();
        let opener = tokio::spawn(async move {
            match context.channel.open().await {
                Ok(()) => {
                    context.active.store(true, Ordering::SeqCst);
                    tracing::info!("Communication channel established for worker {}", worker);
                    start_context_tasks(&context, &config).await;
                }
                Err(e) => {
                    context.channel_failed.store(true, Ordering::SeqCst);
                    tracing::error!(
                        "Failed to open communication channel for worker {}: {}",
                        worker,
                        e
                    );
                }
            }
        });

        // Track the opener so shutdown can reap it with the worker tasks.
        if let Some(context) = self.contexts.lock().await.get(&worker) {
            context.tasks.lock().await.push(opener);
        }
    }

    /// Queues a caller payload for delivery as a `data` message.
    ///
    /// Fails when the worker is unknown, the channel has terminally failed,
    /// or the outbound queue is full. Transient write failures are retried by
    /// the writer task and never surface here.
    pub async fn send_message(&self, worker: WorkerId, payload: Value) -> CommunicationResult<()> {
        let context = self.context(worker).await?;

        if context.channel_failed.load(Ordering::SeqCst) {
            return Err(CommunicationError::ChannelNotOpen);
        }

        let message =
            WireMessage::with_id(context.next_message_id(), DATA_MESSAGE_TYPE, payload);
        let message_id = message.message_id.clone();

        context
            .outbound
            .try_offer(message)
            .await
            .map_err(|_| CommunicationError::QueueFull { id: worker })?;

        tracing::debug!("Message queued for worker {}: {}", worker, message_id);
        Ok(())
    }

    /// Blocks on the inbound queue up to the configured receive timeout.
    pub async fn receive_message(&self, worker: WorkerId) -> CommunicationResult<WireMessage> {
        let context = self.context(worker).await?;

        context
            .inbound
            .poll(self.config.receive_timeout)
            .await
            .ok_or(CommunicationError::ReceiveTimeout {
                timeout: self.config.receive_timeout,
            })
    }

    /// Clears the active flag, closes the channel, and removes the worker's
    /// broker record. Idempotent.
    pub async fn close_channel(&self, worker: WorkerId) {
        let Some(context) = self.contexts.lock().await.remove(&worker) else {
            return;
        };

        context.active.store(false, Ordering::SeqCst);
        if let Err(e) = context.channel.close().await {
            tracing::warn!("Error closing channel for worker {}: {}", worker, e);
        }
        for task in context.tasks.lock().await.drain(..) {
            task.abort();
        }
        tracing::info!("Communication channel closed for worker {}", worker);
    }

    /// Snapshot of the worker's queues and heartbeat; `None` when unknown.
    pub async fn get_stats(&self, worker: WorkerId) -> Option<BrokerStats> {
        let context = self.contexts.lock().await.get(&worker).cloned()?;
        let stats = BrokerStats {
            outbound_size: context.outbound.len().await,
            inbound_size: context.inbound.len().await,
            last_heartbeat: *context.last_heartbeat.lock().await,
            active: context.active.load(Ordering::SeqCst),
        };
        Some(stats)
    }

    pub async fn active_channel_count(&self) -> usize {
        let contexts = self.contexts.lock().await;
        let mut count = 0;
        for context in contexts.values() {
            if context.active.load(Ordering::SeqCst) {
                count += 1;
            }
        }
        count
    }

    /// Closes every channel. Safe to call more than once.
    pub async fn shutdown(&self) {
        let workers: Vec<WorkerId> = self.contexts.lock().await.keys().copied().collect();
        for worker in workers {
            self.close_channel(worker).await;
        }
        tracing::info!("Message broker shut down");
    }

    async fn context(&self, worker: WorkerId) -> CommunicationResult<Arc<BrokerContext>> {
        self.contexts
            .lock()
            .await
            .get(&worker)
            .cloned()
            .ok_or(CommunicationError::UnknownWorker { id: worker })
    }
}

async fn start_context_tasks(context: &Arc<BrokerContext>, config: &BrokerConfig) {
    let writer = tokio::spawn(writer_task(context.clone(), config.clone()));
    let reader = tokio::spawn(reader_task(context.clone()));
    let heartbeat = tokio::spawn(heartbeat_task(context.clone(), config.clone()));
    context
        .tasks
        .lock()
        .await
        .extend([writer, reader, heartbeat]);
}

/// Drains the outbound queue in enqueue order; one writer per worker keeps
/// the wire ordering guarantee.
async fn writer_task(context: Arc<BrokerContext>, config: BrokerConfig) {
    while context.active.load(Ordering::SeqCst) {
        // Bounded poll so the active flag is rechecked periodically.
        let Some(message) = context
            .outbound
            .poll(std::time::Duration::from_secs(1))
            .await
        else {
            continue;
        };
        send_with_retry(&context, &config, message).await;
    }
    tracing::debug!("Writer task for worker {} exited", context.worker);
}

async fn send_with_retry(context: &BrokerContext, config: &BrokerConfig, message: WireMessage) {
    let encoded = match serde_json::to_string(&message) {
        Ok(encoded) => encoded,
        Err(e) => {
            tracing::error!(
                "Failed to serialize message {} for worker {}: {}",
                message.message_id,
                context.worker,
                e
            );
            return;
        }
    };

    let mut attempt: u32 = 0;
    loop {
        match context.channel.send_message(&encoded).await {
            Ok(()) => {
                tracing::debug!(
                    "Message sent to worker {}: {}",
                    context.worker,
                    message.message_id
                );
                return;
            }
            Err(e) if attempt < config.max_retry_attempts => {
                let delay = config
                    .initial_retry_delay
                    .mul_f64(config.retry_backoff_multiplier.powi(attempt as i32));
                tracing::warn!(
                    "Failed to send message to worker {} (attempt {}), retrying in {:?}: {}",
                    context.worker,
                    attempt + 1,
                    delay,
                    e
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => {
                tracing::error!(
                    "Failed to send message to worker {} after {} attempts, dropping: {}",
                    context.worker,
                    config.max_retry_attempts,
                    e
                );
                return;
            }
        }
    }
}

/// Reads frames off the wire. Heartbeats refresh the shared heartbeat slot
/// and never enter the inbound queue; everything else is enqueued with a
/// drop-oldest overflow policy.
async fn reader_task(context: Arc<BrokerContext>) {
    while context.active.load(Ordering::SeqCst) {
        match context.channel.receive_message().await {
            Ok(raw) => match serde_json::from_str::<WireMessage>(&raw) {
                Ok(message) if message.is_heartbeat() => {
                    *context.last_heartbeat.lock().await = Utc::now();
                    tracing::debug!("Heartbeat received from worker {}", context.worker);
                }
                Ok(message) => {
                    if context.inbound.offer(message).await.is_some() {
                        tracing::warn!(
                            "Incoming message queue full for worker {}, dropping oldest entry",
                            context.worker
                        );
                    }
                }
                Err(e) => {
                    tracing::error!(
                        "Error processing incoming message from worker {}: {}",
                        context.worker,
                        e
                    );
                }
            },
            Err(e) => {
                if context.active.load(Ordering::SeqCst) {
                    tracing::warn!(
                        "Channel read failed for worker {}, closing: {}",
                        context.worker,
                        e
                    );
                    context.channel_failed.store(true, Ordering::SeqCst);
                    let _ = context.channel.close().await;
                }
                break;
            }
        }
    }
    tracing::debug!("Reader task for worker {} exited", context.worker);
}

/// Writes a protocol heartbeat directly on the channel at a fixed interval.
async fn heartbeat_task(context: Arc<BrokerContext>, config: BrokerConfig) {
    let first = tokio::time::Instant::now() + config.heartbeat_interval;
    let mut ticker = tokio::time::interval_at(first, config.heartbeat_interval);
    loop {
        ticker.tick().await;
        if !context.active.load(Ordering::SeqCst) {
            break;
        }
        let heartbeat = WireMessage::heartbeat(context.next_message_id());
        let encoded = match serde_json::to_string(&heartbeat) {
            Ok(encoded) => encoded,
            Err(e) => {
                tracing::error!("Failed to serialize heartbeat: {}", e);
                continue;
            }
        };
        if let Err(e) = context.channel.send_message(&encoded).await {
            tracing::warn!(
                "Failed to send heartbeat to worker {}: {}",
                context.worker,
                e
            );
        } else {
            tracing::debug!("Heartbeat sent to worker {}", context.worker);
        }
    }
    tracing::debug!("Heartbeat task for worker {} exited", context.worker);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::SocketChannel;
    use crate::config::ChannelConfig;
    use serde_json::json;
    use std::time::Duration;

    fn fast_broker(queue_capacity: usize) -> MessageBroker {
        MessageBroker::new(BrokerConfig {
            queue_capacity,
            receive_timeout: Duration::from_millis(200),
            initial_retry_delay: Duration::from_millis(10),
            retry_backoff_multiplier: 2.0,
            max_retry_attempts: 2,
            heartbeat_interval: Duration::from_millis(50),
        })
    }

    fn channel_config() -> ChannelConfig {
        ChannelConfig {
            connect_timeout: Duration::from_secs(2),
            max_frame_len: 1024 * 1024,
        }
    }

    fn heartbeat_slot() -> SharedHeartbeat {
        Arc::new(Mutex::new(Utc::now()))
    }

    /// Establishes a broker channel and connects a fake worker to it.
    async fn establish_with_worker(
        broker: &MessageBroker,
        worker: WorkerId,
        heartbeat: SharedHeartbeat,
    ) -> Arc<SocketChannel> {
        let server = Arc::new(SocketChannel::server(channel_config()));
        let port = server.bind().await.unwrap();
        broker
            .establish_channel(worker, server, heartbeat)
            .await;

        let peer = Arc::new(SocketChannel::client(
            format!("127.0.0.1:{}", port).parse().unwrap(),
            channel_config(),
        ));
        peer.open().await.unwrap();

        // Wait for the opener task to flip the active flag.
        for _ in 0..50 {
            if let Some(stats) = broker.get_stats(worker).await {
                if stats.active {
                    break;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        peer
    }

    #[tokio::test]
    async fn test_outbound_messages_reach_worker_in_order() {
        let broker = fast_broker(100);
        let worker = WorkerId::new(1001);
        let peer = establish_with_worker(&broker, worker, heartbeat_slot()).await;

        broker.send_message(worker, json!("first")).await.unwrap();
        broker.send_message(worker, json!("second")).await.unwrap();

        let mut payloads = Vec::new();
        while payloads.len() < 2 {
            let raw = peer.receive_message().await.unwrap();
            let message: WireMessage = serde_json::from_str(&raw).unwrap();
            if !message.is_heartbeat() {
                payloads.push(message);
            }
        }

        assert_eq!(payloads[0].payload, json!("first"));
        assert_eq!(payloads[1].payload, json!("second"));
        assert_eq!(payloads[0].message_type, "data");
        let prefix = format!("msg-{}-", worker.pid());
        assert!(payloads[0].message_id.starts_with(&prefix));
        assert_ne!(payloads[0].message_id, payloads[1].message_id);

        broker.close_channel(worker).await;
    }

    #[tokio::test]
    async fn test_inbound_data_queued_and_heartbeats_siphoned() {
        let broker = fast_broker(100);
        let worker = WorkerId::new(1002);
        let heartbeat = heartbeat_slot();
        let before = *heartbeat.lock().await;
        let peer = establish_with_worker(&broker, worker, heartbeat.clone()).await;

        let hb = serde_json::to_string(&WireMessage::heartbeat("msg-w-1")).unwrap();
        peer.send_message(&hb).await.unwrap();
        let data =
            serde_json::to_string(&WireMessage::new("data", json!({"answer": 42}))).unwrap();
        peer.send_message(&data).await.unwrap();

        let received = broker.receive_message(worker).await.unwrap();
        assert_eq!(received.payload, json!({"answer": 42}));

        // The heartbeat updated the shared slot and never entered the queue.
        assert!(*heartbeat.lock().await > before);
        let stats = broker.get_stats(worker).await.unwrap();
        assert_eq!(stats.inbound_size, 0);

        broker.close_channel(worker).await;
    }

    #[tokio::test]
    async fn test_receive_times_out_without_messages() {
        let broker = fast_broker(100);
        let worker = WorkerId::new(1003);
        let _peer = establish_with_worker(&broker, worker, heartbeat_slot()).await;

        let err = broker.receive_message(worker).await.unwrap_err();
        assert!(matches!(err, CommunicationError::ReceiveTimeout { .. }));

        broker.close_channel(worker).await;
    }

    #[tokio::test]
    async fn test_send_to_unknown_worker_fails() {
        let broker = fast_broker(100);
        let err = broker
            .send_message(WorkerId::new(4999), json!(1))
            .await
            .unwrap_err();
        assert!(matches!(err, CommunicationError::UnknownWorker { .. }));
    }

    #[tokio::test]
    async fn test_send_fails_when_outbound_queue_full() {
        // No worker ever connects, so the writer never drains the queue.
        let broker = fast_broker(2);
        let worker = WorkerId::new(1004);
        let server = Arc::new(SocketChannel::server(channel_config()));
        server.bind().await.unwrap();
        broker
            .establish_channel(worker, server, heartbeat_slot())
            .await;

        broker.send_message(worker, json!(1)).await.unwrap();
        broker.send_message(worker, json!(2)).await.unwrap();
        let err = broker.send_message(worker, json!(3)).await.unwrap_err();
        assert!(matches!(err, CommunicationError::QueueFull { .. }));

        broker.close_channel(worker).await;
    }

    #[tokio::test]
    async fn test_worker_receives_periodic_heartbeats() {
        let broker = fast_broker(100);
        let worker = WorkerId::new(1005);
        let peer = establish_with_worker(&broker, worker, heartbeat_slot()).await;

        let raw = peer.receive_message().await.unwrap();
        let message: WireMessage = serde_json::from_str(&raw).unwrap();
        assert!(message.is_heartbeat());
        assert_eq!(message.payload, json!("ping"));

        broker.close_channel(worker).await;
    }

    #[tokio::test]
    async fn test_close_channel_is_idempotent() {
        let broker = fast_broker(100);
        let worker = WorkerId::new(1006);
        let _peer = establish_with_worker(&broker, worker, heartbeat_slot()).await;

        broker.close_channel(worker).await;
        broker.close_channel(worker).await;

        assert!(broker.get_stats(worker).await.is_none());
        assert_eq!(broker.active_channel_count().await, 0);
    }

    #[tokio::test]
    async fn test_stats_for_unknown_worker_is_none() {
        let broker = fast_broker(100);
        assert!(broker.get_stats(WorkerId::new(777)).await.is_none());
    }

    #[tokio::test]
    async fn test_oversize_frame_closes_channel_and_fails_sends_fast() {
        let broker = fast_broker(100);
        let worker = WorkerId::new(1007);
        let peer = establish_with_worker(&broker, worker, heartbeat_slot()).await;

        // A length prefix of 0x7FFFFFFF is a protocol violation; the reader
        // must close the channel.
        peer.send_bytes(&[0x7F, 0xFF, 0xFF, 0xFF]).await.unwrap();

        for _ in 0..50 {
            if broker
                .send_message(worker, json!("probe"))
                .await
                .is_err()
            {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let err = broker.send_message(worker, json!("after")).await.unwrap_err();
        assert!(matches!(err, CommunicationError::ChannelNotOpen));

        broker.close_channel(worker).await;
    }
}
