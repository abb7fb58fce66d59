//! Bounded in-memory queue with a drop-oldest overflow policy
//!
//! Backs the per-worker log and message queues. `offer` evicts the oldest
//! element when full so the queue always holds the most recent entries;
//! `try_offer` refuses instead, for paths where the caller must see the
//! overflow.

use std::collections::VecDeque;
use std::time::Duration;

use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;

pub struct BoundedQueue<T> {
    inner: Mutex<VecDeque<T>>,
    capacity: usize,
    notify: Notify,
}

impl<T> BoundedQueue<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            notify: Notify::new(),
        }
    }

    /// Enqueues an item, evicting the oldest one when the queue is full.
    ///
    /// Returns the evicted item, if any.
    pub async fn offer(&self, item: T) -> Option<T> {
        let evicted = {
            let mut queue = self.inner.lock().await;
            let evicted = if queue.len() >= self.capacity {
                queue.pop_front()
            } else {
                None
            };
            queue.push_back(item);
            evicted
        };
        self.notify.notify_one();
        evicted
    }

    /// Enqueues an item, handing it back when the queue is full.
    pub async fn try_offer(&self, item: T) -> Result<(), T> {
        {
            let mut queue = self.inner.lock().await;
            if queue.len() >= self.capacity {
                return Err(item);
            }
            queue.push_back(item);
        }
        self.notify.notify_one();
        Ok(())
    }

    /// Dequeues the oldest item, waiting up to `timeout` for one to arrive.
    pub async fn poll(&self, timeout: Duration) -> Option<T> {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.notify.notified();
            if let Some(item) = self.inner.lock().await.pop_front() {
                return Some(item);
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return None;
            }
            if tokio::time::timeout(remaining, notified).await.is_err() {
                return self.inner.lock().await.pop_front();
            }
        }
    }

    /// Dequeues the oldest item if one is immediately available.
    pub async fn try_poll(&self) -> Option<T> {
        self.inner.lock().await.pop_front()
    }

    /// Removes and returns everything currently queued, oldest first.
    pub async fn drain(&self) -> Vec<T> {
        self.inner.lock().await.drain(..).collect()
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.lock().await.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl<T: Clone> BoundedQueue<T> {
    /// Copies the current contents without draining, oldest first.
    pub async fn snapshot(&self) -> Vec<T> {
        self.inner.lock().await.iter().cloned().collect()
    }
}
