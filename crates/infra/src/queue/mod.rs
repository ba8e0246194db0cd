//! Queue transport between providers and the storage consumer.
//!
//! A single named FIFO list of serialized [`NewsArticle`] payloads:
//!
//! - `push` appends at the tail
//! - `pop` removes from the head, waiting at most `wait` for an item
//!
//! Delivery is at-least-once with no acknowledgment. A popped item is gone, which
//! is fine because exactly one consumer drains a queue.

mod in_memory;
#[cfg(feature = "redis")]
mod redis;

use std::time::Duration;

use async_trait::async_trait;
use newsflow_core::NewsArticle;

pub use in_memory::InMemoryNewsQueue;
#[cfg(feature = "redis")]
pub use self::redis::RedisNewsQueue;

/// Default queue name shared by providers and the storage consumer.
pub const DEFAULT_QUEUE_NAME: &str = "news_ingest_queue";

#[derive(Debug, Clone, thiserror::Error)]
pub enum QueueError {
    #[error("queue connection error: {0}")]
    Connection(String),

    #[error("queue command error: {0}")]
    Command(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

/// FIFO transport of raw article payloads.
#[async_trait]
pub trait NewsQueue: Send + Sync + 'static {
    /// Queue name, used in logs.
    fn name(&self) -> &str;

    /// Append a raw payload at the tail.
    async fn push_raw(&self, payload: String) -> Result<(), QueueError>;

    /// Pop the head, waiting up to `wait`. `Ok(None)` means the wait elapsed empty.
    async fn pop(&self, wait: Duration) -> Result<Option<String>, QueueError>;

    /// Number of queued payloads.
    async fn len(&self) -> Result<usize, QueueError>;

    /// Serialize and append an article.
    async fn push(&self, article: &NewsArticle) -> Result<(), QueueError> {
        let payload = article
            .to_json()
            .map_err(|e| QueueError::Serialization(e.to_string()))?;
        self.push_raw(payload).await
    }
}
