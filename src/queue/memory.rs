use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::{QueueError, Task, TaskQueue};

/// One recorded enqueue call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Enqueued {
    pub delay: Option<Duration>,
    pub task: Task,
}

/// Recording queue: keeps a FIFO of pending tasks plus the full history of
/// enqueue calls. Delays are recorded, not waited on.
#[derive(Debug, Default)]
pub struct InMemoryTaskQueue {
    pending: Mutex<VecDeque<Enqueued>>,
    history: Mutex<Vec<Enqueued>>,
}

impl InMemoryTaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn pop(&self) -> Option<Enqueued> {
        self.pending.lock().await.pop_front()
    }

    pub async fn history(&self) -> Vec<Enqueued> {
        self.history.lock().await.clone()
    }

    pub async fn pending_len(&self) -> usize {
        self.pending.lock().await.len()
    }

    async fn record(&self, entry: Enqueued) {
        self.history.lock().await.push(entry.clone());
        self.pending.lock().await.push_back(entry);
    }
}

#[async_trait]
impl TaskQueue for InMemoryTaskQueue {
    async fn enqueue(&self, task: Task) -> Result<(), QueueError> {
        self.record(Enqueued { delay: None, task }).await;
        Ok(())
    }

    async fn enqueue_after(&self, delay: Duration, task: Task) -> Result<(), QueueError> {
        self.record(Enqueued {
            delay: Some(delay),
            task,
        })
        .await;
        Ok(())
    }
}
