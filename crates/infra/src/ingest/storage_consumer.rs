//! Queue → event store consumer.
//!
//! Loop: pop one payload (bounded wait) → decode → map to a [`NewsEvent`] →
//! insert-or-skip by URL. Duplicates are the dedup mechanism and are not errors.
//! A malformed payload is logged and dropped; a store failure is logged and the
//! loop moves on. Neither affects later items.
//!
//! A trace id is minted when a payload decodes. It tags the item's log lines and
//! is handed to the analysis job, so ingest and job logs share one `trace_id`.

use std::sync::Arc;
use std::time::Duration;

use tracing::{Instrument, Span, debug, error, info, info_span, warn};

use newsflow_core::{NewsArticle, NewsEvent, NewsEventId, TraceId};

use crate::jobs::{JobPublisher, JobType};
use crate::news_store::{InsertOutcome, NewsEventStore};
use crate::queue::{NewsQueue, QueueError};
use crate::workers::{ShutdownSignal, WorkerHandle, shutdown_channel};

const PAYLOAD_SNIPPET_CHARS: usize = 200;

/// Consumer configuration.
#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    /// Longest a single pop waits for an item
    pub pop_wait: Duration,
    /// Pause after a transport error
    pub error_pause: Duration,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            pop_wait: Duration::from_secs(5),
            error_pause: Duration::from_secs(1),
        }
    }
}

impl ConsumerConfig {
    pub fn with_pop_wait(mut self, wait: Duration) -> Self {
        self.pop_wait = wait;
        self
    }

    pub fn with_error_pause(mut self, pause: Duration) -> Self {
        self.error_pause = pause;
        self
    }
}

/// What happened to one payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsumeOutcome {
    Inserted {
        news_event_id: NewsEventId,
        trace_id: TraceId,
    },
    Duplicate,
    Malformed(String),
    StoreFailed(String),
}

/// Consumer runtime statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct ConsumerStats {
    pub inserted: u64,
    pub duplicates: u64,
    pub malformed: u64,
    pub store_failures: u64,
    pub transport_errors: u64,
}

impl ConsumerStats {
    fn record(&mut self, outcome: &ConsumeOutcome) {
        match outcome {
            ConsumeOutcome::Inserted { .. } => self.inserted += 1,
            ConsumeOutcome::Duplicate => self.duplicates += 1,
            ConsumeOutcome::Malformed(_) => self.malformed += 1,
            ConsumeOutcome::StoreFailed(_) => self.store_failures += 1,
        }
    }
}

/// Drains one queue into the event store. Exactly one consumer per queue.
pub struct StorageConsumer {
    queue: Arc<dyn NewsQueue>,
    store: Arc<dyn NewsEventStore>,
    publisher: Option<JobPublisher>,
    config: ConsumerConfig,
    span: Span,
}

impl StorageConsumer {
    pub fn new(
        queue: Arc<dyn NewsQueue>,
        store: Arc<dyn NewsEventStore>,
        config: ConsumerConfig,
    ) -> Self {
        let span = info_span!("storage_consumer", queue = %queue.name());
        Self {
            queue,
            store,
            publisher: None,
            config,
            span,
        }
    }

    /// Publish an `llm_analysis` job for every newly inserted event.
    pub fn with_publisher(mut self, publisher: JobPublisher) -> Self {
        self.publisher = Some(publisher);
        self
    }

    /// Decode and persist one raw payload.
    pub async fn handle_payload(&self, payload: &str) -> ConsumeOutcome {
        self.handle(payload).instrument(self.span.clone()).await
    }

    /// Pop and handle one item. `Ok(None)` when the wait elapsed empty.
    pub async fn process_next(&self) -> Result<Option<ConsumeOutcome>, QueueError> {
        match self.queue.pop(self.config.pop_wait).await? {
            Some(payload) => Ok(Some(self.handle_payload(&payload).await)),
            None => Ok(None),
        }
    }

    /// Run until `shutdown` fires.
    ///
    /// Shutdown is checked after every bounded pop, so it is observed within one
    /// `pop_wait`. An in-flight pop is allowed to finish, so an item already
    /// removed from the queue is always handled.
    pub async fn run(&self, mut shutdown: ShutdownSignal) -> ConsumerStats {
        async {
            info!("storage consumer started");
            let mut stats = ConsumerStats::default();

            while !shutdown.is_shutdown() {
                match self.queue.pop(self.config.pop_wait).await {
                    Ok(Some(payload)) => {
                        let outcome = self.handle(&payload).await;
                        stats.record(&outcome);
                    }
                    Ok(None) => {}
                    Err(e) => {
                        stats.transport_errors += 1;
                        warn!(error = %e, "queue pop failed");
                        tokio::select! {
                            _ = shutdown.wait() => break,
                            _ = tokio::time::sleep(self.config.error_pause) => {}
                        }
                    }
                }
            }

            info!(?stats, "storage consumer stopped");
            stats
        }
        .instrument(self.span.clone())
        .await
    }

    /// Spawn the loop on the tokio runtime.
    pub fn spawn(self: Arc<Self>) -> WorkerHandle<ConsumerStats> {
        let (tx, signal) = shutdown_channel();
        let join = tokio::spawn(async move { self.run(signal).await });
        WorkerHandle::new(tx, join)
    }

    async fn handle(&self, payload: &str) -> ConsumeOutcome {
        let article = match NewsArticle::from_json(payload) {
            Ok(article) => article,
            Err(e) => {
                warn!(
                    error = %e,
                    payload_snippet = %payload.chars().take(PAYLOAD_SNIPPET_CHARS).collect::<String>(),
                    "dropping malformed payload"
                );
                return ConsumeOutcome::Malformed(e.to_string());
            }
        };

        let trace_id = TraceId::new();
        let span = info_span!(
            "ingest",
            %trace_id,
            provider = %article.provider,
            url = %article.url
        );
        self.store_article(&article, trace_id).instrument(span).await
    }

    async fn store_article(&self, article: &NewsArticle, trace_id: TraceId) -> ConsumeOutcome {
        let event = NewsEvent::from_article(article);
        match self.store.insert_if_absent(&event).await {
            Ok(InsertOutcome::Inserted(news_event_id)) => {
                info!(%news_event_id, symbol = %event.symbol, "news event stored");
                self.publish(news_event_id, trace_id).await;
                ConsumeOutcome::Inserted {
                    news_event_id,
                    trace_id,
                }
            }
            Ok(InsertOutcome::Duplicate) => {
                debug!("duplicate url skipped");
                ConsumeOutcome::Duplicate
            }
            Err(e) => {
                error!(error = %e, "failed to store news event");
                ConsumeOutcome::StoreFailed(e.to_string())
            }
        }
    }

    async fn publish(&self, news_event_id: NewsEventId, trace_id: TraceId) {
        let Some(publisher) = &self.publisher else {
            return;
        };
        if let Err(e) = publisher
            .publish_job(news_event_id, trace_id, JobType::LlmAnalysis)
            .await
        {
            error!(%news_event_id, %trace_id, error = %e, "failed to publish analysis job");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use async_trait::async_trait;
    use chrono::Utc;

    use crate::jobs::{InMemoryJobStore, JobStore};
    use crate::news_store::{InMemoryNewsEventStore, StoreError};
    use crate::queue::InMemoryNewsQueue;

    fn article(provider: &str, url: &str) -> NewsArticle {
        NewsArticle::new(provider, "Apple beats", url, Utc::now()).with_symbols(["AAPL"])
    }

    fn consumer(
        queue: Arc<InMemoryNewsQueue>,
        store: Arc<dyn NewsEventStore>,
    ) -> StorageConsumer {
        StorageConsumer::new(
            queue,
            store,
            ConsumerConfig::default().with_pop_wait(Duration::from_millis(100)),
        )
    }

    /// Store that fails the first insert and then delegates.
    struct FlakyStore {
        inner: InMemoryNewsEventStore,
        failed_once: std::sync::atomic::AtomicBool,
    }

    #[async_trait]
    impl NewsEventStore for FlakyStore {
        async fn insert_if_absent(&self, event: &NewsEvent) -> Result<InsertOutcome, StoreError> {
            if !self.failed_once.swap(true, std::sync::atomic::Ordering::SeqCst) {
                return Err(StoreError::Connection("connection reset".to_string()));
            }
            self.inner.insert_if_absent(event).await
        }

        async fn get(&self, id: NewsEventId) -> Result<Option<NewsEvent>, StoreError> {
            self.inner.get(id).await
        }

        async fn find_by_url(&self, url: &str) -> Result<Option<NewsEvent>, StoreError> {
            self.inner.find_by_url(url).await
        }

        async fn count(&self) -> Result<u64, StoreError> {
            self.inner.count().await
        }
    }

    #[tokio::test]
    async fn same_url_from_two_providers_is_stored_once() {
        let queue = Arc::new(InMemoryNewsQueue::new());
        let store = Arc::new(InMemoryNewsEventStore::new());
        let consumer = consumer(queue.clone(), store.clone());

        queue.push(&article("finnhub", "https://example.com/a")).await.unwrap();
        queue.push(&article("yahoo_rss", "https://example.com/a")).await.unwrap();

        assert!(matches!(
            consumer.process_next().await.unwrap(),
            Some(ConsumeOutcome::Inserted { .. })
        ));
        assert_eq!(
            consumer.process_next().await.unwrap(),
            Some(ConsumeOutcome::Duplicate)
        );
        assert_eq!(store.count().await.unwrap(), 1);

        let event = store.find_by_url("https://example.com/a").await.unwrap().unwrap();
        assert_eq!(event.source, "finnhub");
        assert_eq!(event.symbol, "AAPL");
    }

    #[tokio::test]
    async fn malformed_payload_does_not_affect_the_next_item() {
        let queue = Arc::new(InMemoryNewsQueue::new());
        let store = Arc::new(InMemoryNewsEventStore::new());
        let consumer = consumer(queue.clone(), store.clone());

        queue.push_raw("{not json".to_string()).await.unwrap();
        queue.push_raw(r#"{"title":"no url","published_at":"2026-01-05T14:30:00Z"}"#.to_string()).await.unwrap();
        queue.push(&article("finnhub", "https://example.com/ok")).await.unwrap();

        assert!(matches!(
            consumer.process_next().await.unwrap(),
            Some(ConsumeOutcome::Malformed(_))
        ));
        assert!(matches!(
            consumer.process_next().await.unwrap(),
            Some(ConsumeOutcome::Malformed(_))
        ));
        assert!(matches!(
            consumer.process_next().await.unwrap(),
            Some(ConsumeOutcome::Inserted { .. })
        ));
        assert_eq!(store.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn store_failure_is_logged_and_the_loop_continues() {
        let queue = Arc::new(InMemoryNewsQueue::new());
        let store = Arc::new(FlakyStore {
            inner: InMemoryNewsEventStore::new(),
            failed_once: Default::default(),
        });
        let consumer = consumer(queue.clone(), store.clone());

        queue.push(&article("finnhub", "https://example.com/1")).await.unwrap();
        queue.push(&article("finnhub", "https://example.com/2")).await.unwrap();

        assert!(matches!(
            consumer.process_next().await.unwrap(),
            Some(ConsumeOutcome::StoreFailed(_))
        ));
        assert!(matches!(
            consumer.process_next().await.unwrap(),
            Some(ConsumeOutcome::Inserted { .. })
        ));
        assert!(store.find_by_url("https://example.com/1").await.unwrap().is_none());
        assert!(store.find_by_url("https://example.com/2").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn new_events_get_one_analysis_job() {
        let queue = Arc::new(InMemoryNewsQueue::new());
        let store = Arc::new(InMemoryNewsEventStore::new());
        let jobs = InMemoryJobStore::arc();
        let consumer =
            consumer(queue.clone(), store.clone()).with_publisher(JobPublisher::new(jobs.clone()));

        queue.push(&article("finnhub", "https://example.com/j")).await.unwrap();
        queue.push(&article("newsapi", "https://example.com/j")).await.unwrap();

        let Some(ConsumeOutcome::Inserted {
            news_event_id,
            trace_id,
        }) = consumer.process_next().await.unwrap()
        else {
            panic!("expected insert");
        };
        consumer.process_next().await.unwrap();

        let job = jobs.find(news_event_id, JobType::LlmAnalysis).await.unwrap().unwrap();
        assert_eq!(job.trace_id, Some(trace_id));
        assert_eq!(jobs.stats(3).await.unwrap().pending, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn empty_queue_yields_none_after_the_wait() {
        let queue = Arc::new(InMemoryNewsQueue::new());
        let consumer = consumer(queue, Arc::new(InMemoryNewsEventStore::new()));
        assert_eq!(consumer.process_next().await.unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn running_consumer_drains_and_stops_within_one_wait() {
        let queue = Arc::new(InMemoryNewsQueue::new());
        let store = Arc::new(InMemoryNewsEventStore::new());
        let consumer = Arc::new(StorageConsumer::new(
            queue.clone(),
            store.clone(),
            ConsumerConfig::default(),
        ));
        let handle = consumer.spawn();

        queue.push(&article("finnhub", "https://example.com/r1")).await.unwrap();
        queue.push(&article("yahoo_rss", "https://example.com/r1")).await.unwrap();
        queue.push_raw("garbage".to_string()).await.unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;

        let started = tokio::time::Instant::now();
        let stats = handle.shutdown().await.unwrap();
        assert!(started.elapsed() <= Duration::from_secs(5));
        assert_eq!(
            stats,
            ConsumerStats {
                inserted: 1,
                duplicates: 1,
                malformed: 1,
                ..Default::default()
            }
        );
        assert_eq!(store.count().await.unwrap(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_trigger_stops_the_loop() {
        let queue = Arc::new(InMemoryNewsQueue::new());
        let consumer = StorageConsumer::new(
            queue,
            Arc::new(InMemoryNewsEventStore::new()),
            ConsumerConfig::default(),
        );

        let (tx, signal) = shutdown_channel();
        drop(tx);
        let stats = tokio::time::timeout(Duration::from_secs(60), consumer.run(signal))
            .await
            .expect("consumer should stop once its trigger is gone");
        assert_eq!(stats, ConsumerStats::default());
    }
}
