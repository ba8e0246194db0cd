use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::time::Instant;

use super::{DEFAULT_QUEUE_NAME, NewsQueue, QueueError};

/// In-process queue for tests/dev. Same FIFO and bounded-wait semantics as Redis.
#[derive(Debug)]
pub struct InMemoryNewsQueue {
    name: String,
    items: Mutex<VecDeque<String>>,
    notify: Notify,
}

impl InMemoryNewsQueue {
    pub fn new() -> Self {
        Self::named(DEFAULT_QUEUE_NAME)
    }

    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            items: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
        }
    }

    fn take(&self) -> Result<Option<String>, QueueError> {
        let mut items = self
            .items
            .lock()
            .map_err(|_| QueueError::Command("queue lock poisoned".to_string()))?;
        Ok(items.pop_front())
    }
}

impl Default for InMemoryNewsQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl NewsQueue for InMemoryNewsQueue {
    fn name(&self) -> &str {
        &self.name
    }

    async fn push_raw(&self, payload: String) -> Result<(), QueueError> {
        {
            let mut items = self
                .items
                .lock()
                .map_err(|_| QueueError::Command("queue lock poisoned".to_string()))?;
            items.push_back(payload);
        }
        self.notify.notify_one();
        Ok(())
    }

    async fn pop(&self, wait: Duration) -> Result<Option<String>, QueueError> {
        let deadline = Instant::now() + wait;
        loop {
            let notified = self.notify.notified();
            if let Some(item) = self.take()? {
                return Ok(Some(item));
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.take();
            }
        }
    }

    async fn len(&self) -> Result<usize, QueueError> {
        let items = self
            .items
            .lock()
            .map_err(|_| QueueError::Command("queue lock poisoned".to_string()))?;
        Ok(items.len())
    }
}
