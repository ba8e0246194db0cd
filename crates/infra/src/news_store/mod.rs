//! Persisted news events, unique by URL.
//!
//! Insertion is upsert-or-skip: a URL conflict is reported as
//! [`InsertOutcome::Duplicate`] and is the cross-provider dedup mechanism,
//! not an error.

mod in_memory;
mod postgres;

use async_trait::async_trait;
use newsflow_core::{NewsEvent, NewsEventId};

pub use in_memory::InMemoryNewsEventStore;
pub use postgres::PostgresNewsEventStore;

/// Transient persistence failure. The write (if any) was rolled back.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    #[error("store connection error: {0}")]
    Connection(String),

    #[error("store query error: {0}")]
    Query(String),

    #[error("store decode error: {0}")]
    Decode(String),
}

/// Result of an idempotent insert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    /// A new row was written.
    Inserted(NewsEventId),
    /// A row with the same URL already exists; nothing was written.
    Duplicate,
}

/// Append-only news event storage.
#[async_trait]
pub trait NewsEventStore: Send + Sync + 'static {
    /// Insert `event` unless an event with the same URL exists.
    async fn insert_if_absent(&self, event: &NewsEvent) -> Result<InsertOutcome, StoreError>;

    /// Load an event by id.
    async fn get(&self, id: NewsEventId) -> Result<Option<NewsEvent>, StoreError>;

    /// Load the event stored for `url`.
    async fn find_by_url(&self, url: &str) -> Result<Option<NewsEvent>, StoreError>;

    /// Number of stored events.
    async fn count(&self) -> Result<u64, StoreError>;
}
