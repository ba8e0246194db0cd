use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use newsflow_core::{NewsEvent, NewsEventId};

use super::{InsertOutcome, NewsEventStore, StoreError};

/// In-memory event store for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryNewsEventStore {
    inner: RwLock<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    events: HashMap<NewsEventId, NewsEvent>,
    by_url: HashMap<String, NewsEventId>,
}

impl InMemoryNewsEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn poisoned() -> StoreError {
        StoreError::Connection("event store lock poisoned".to_string())
    }
}

#[async_trait]
impl NewsEventStore for InMemoryNewsEventStore {
    async fn insert_if_absent(&self, event: &NewsEvent) -> Result<InsertOutcome, StoreError> {
        let mut inner = self.inner.write().map_err(|_| Self::poisoned())?;
        if inner.by_url.contains_key(&event.url) {
            return Ok(InsertOutcome::Duplicate);
        }
        inner.by_url.insert(event.url.clone(), event.id);
        inner.events.insert(event.id, event.clone());
        Ok(InsertOutcome::Inserted(event.id))
    }

    async fn get(&self, id: NewsEventId) -> Result<Option<NewsEvent>, StoreError> {
        let inner = self.inner.read().map_err(|_| Self::poisoned())?;
        Ok(inner.events.get(&id).cloned())
    }

    async fn find_by_url(&self, url: &str) -> Result<Option<NewsEvent>, StoreError> {
        let inner = self.inner.read().map_err(|_| Self::poisoned())?;
        Ok(inner
            .by_url
            .get(url)
            .and_then(|id| inner.events.get(id))
            .cloned())
    }

    async fn count(&self) -> Result<u64, StoreError> {
        let inner = self.inner.read().map_err(|_| Self::poisoned())?;
        Ok(inner.events.len() as u64)
    }
}
