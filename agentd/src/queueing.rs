//! Task queue.
//!
//! A FIFO of task-key dicts. The in-memory implementation serves the
//! process-local mode; a durable broker satisfies the same put/get seam.

use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::debug;

/// FIFO of task-key dicts with the broker-compatible surface.
#[async_trait]
pub trait TaskQueue: Send + Sync {
    /// Enqueue one key dict.
    async fn put(&self, task_dict: Value);

    /// Dequeue the oldest key dict, waiting up to `timeout`. None on
    /// timeout, which consumers treat as "no work right now".
    async fn get(&self, timeout: Duration) -> Option<Value>;

    async fn len(&self) -> usize;

    async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

/// Process-local FIFO queue.
pub struct InMemoryQueue {
    items: Mutex<VecDeque<Value>>,
    notify: tokio::sync::Notify,
}

impl Default for InMemoryQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryQueue {
    pub fn new() -> Self {
        Self {
            items: Mutex::new(VecDeque::new()),
            notify: tokio::sync::Notify::new(),
        }
    }
}

#[async_trait]
impl TaskQueue for InMemoryQueue {
    async fn put(&self, task_dict: Value) {
        debug!(%task_dict, "put: enqueued");
        self.items.lock().await.push_back(task_dict);
        self.notify.notify_one();
    }

    async fn get(&self, timeout: Duration) -> Option<Value> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(item) = self.items.lock().await.pop_front() {
                return Some(item);
            }
            // Wait for a put or the deadline, whichever first.
            match tokio::time::timeout_at(deadline, self.notify.notified()).await {
                Ok(()) => continue,
                Err(_) => return None,
            }
        }
    }

    async fn len(&self) -> usize {
        self.items.lock().await.len()
    }
}
