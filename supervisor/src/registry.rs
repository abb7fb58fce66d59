//! Process-wide registry of supervisor records
//!
//! The registry exclusively owns supervisor records for their lifetime.
//! Background tasks never hold strong references back to a record; they
//! cooperate through the record's shared flags and queues.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::supervisor::WorkerRecord;
use shared::WorkerId;

#[derive(Clone)]
pub struct WorkerRegistry {
    inner: Arc<Mutex<HashMap<WorkerId, Arc<WorkerRecord>>>>,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub async fn insert(&self, worker: WorkerId, record: Arc<WorkerRecord>) {
        self.inner.lock().await.insert(worker, record);
    }

    pub async fn get(&self, worker: WorkerId) -> Option<Arc<WorkerRecord>> {
        self.inner.lock().await.get(&worker).cloned()
    }

    pub async fn remove(&self, worker: WorkerId) -> Option<Arc<WorkerRecord>> {
        self.inner.lock().await.remove(&worker)
    }

    pub async fn ids(&self) -> Vec<WorkerId> {
        self.inner.lock().await.keys().copied().collect()
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.lock().await.is_empty()
    }

    pub async fn clear(&self) {
        self.inner.lock().await.clear();
    }
}

impl Default for WorkerRegistry {
    fn default() -> Self {
        Self::new()
    }
}
